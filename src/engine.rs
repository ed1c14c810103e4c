//! The storage-engine contract the harness drives.
//!
//! The harness never depends on a concrete engine. It opens connections through
//! [`Engine`], and test bodies work through the [`Connection`], [`Session`] and
//! [`Cursor`] trait objects. Cursor iteration reports exhaustion as an
//! [`ErrorCode::NotFound`] error, so "no more entries" and "the engine broke"
//! are told apart by the code, not by the `Err` itself.

use std::fmt;
use std::path::Path;
use thiserror::Error;

/// URI of the backup cursor. Its keys are file names relative to the home.
pub const BACKUP_URI: &str = "backup:";

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Classification of engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Search missed, or a cursor ran off the end.
    NotFound,
    /// Bad configuration string, URI or argument.
    InvalidArgument,
    /// Another session holds a conflicting lock.
    Busy,
    /// The handle (or its connection) was already closed.
    Closed,
    /// The operation does not apply to this object.
    NotSupported,
    /// Filesystem failure inside the engine.
    Io,
    /// Anything else reported by the engine.
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NotFound => "not found",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::Busy => "busy",
            ErrorCode::Closed => "closed",
            ErrorCode::NotSupported => "not supported",
            ErrorCode::Io => "I/O",
            ErrorCode::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Error reported by an engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(ErrorCode::NotFound, "item not found")
    }

    pub fn closed(what: &str) -> Self {
        Self::new(ErrorCode::Closed, format!("{what} is closed"))
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }
}

/// A key or value stored through a cursor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Item {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Item {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Item::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Item::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::Int(n) => write!(f, "{n}"),
            Item::Text(s) => write!(f, "{s}"),
            Item::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Item {
    fn from(n: i64) -> Self {
        Item::Int(n)
    }
}

impl From<i32> for Item {
    fn from(n: i32) -> Self {
        Item::Int(i64::from(n))
    }
}

impl From<&str> for Item {
    fn from(s: &str) -> Self {
        Item::Text(s.to_string())
    }
}

impl From<String> for Item {
    fn from(s: String) -> Self {
        Item::Text(s)
    }
}

impl From<Vec<u8>> for Item {
    fn from(b: Vec<u8>) -> Self {
        Item::Bytes(b)
    }
}

/// Entry point of an engine implementation.
pub trait Engine {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Open a connection on `home` with an engine configuration string.
    fn open(&self, home: &Path, config: &str) -> EngineResult<Box<dyn Connection>>;
}

/// An open engine instance.
pub trait Connection: fmt::Debug {
    /// The home directory this connection was opened on.
    fn home(&self) -> &Path;

    fn open_session(&self) -> EngineResult<Box<dyn Session>>;

    /// Close the connection and every session and cursor opened through it.
    /// Uncommitted work is rolled back.
    fn close(&mut self) -> EngineResult<()>;

    fn is_closed(&self) -> bool;
}

/// A unit of work against a connection.
pub trait Session {
    fn create(&mut self, uri: &str, config: &str) -> EngineResult<()>;

    fn open_cursor(&mut self, uri: &str) -> EngineResult<Box<dyn Cursor>>;

    fn begin_transaction(&mut self, config: Option<&str>) -> EngineResult<()>;

    fn commit_transaction(&mut self) -> EngineResult<()>;

    fn rollback_transaction(&mut self) -> EngineResult<()>;

    /// Force a checkpoint so the on-disk state has a recovery point.
    fn checkpoint(&mut self) -> EngineResult<()>;

    /// Remove every key in `[start, stop]`; a missing bound means the table end.
    fn truncate(&mut self, uri: &str, start: Option<&Item>, stop: Option<&Item>)
    -> EngineResult<()>;

    /// Check the object is present and structurally sound.
    fn verify(&mut self, uri: &str) -> EngineResult<()>;

    fn close(&mut self) -> EngineResult<()>;
}

/// A position within a table or a backup enumeration.
pub trait Cursor {
    fn set_key(&mut self, key: Item);

    fn set_value(&mut self, value: Item);

    fn key(&self) -> EngineResult<Item>;

    fn value(&self) -> EngineResult<Item>;

    /// Move to the next entry; `NotFound` once exhausted.
    fn next(&mut self) -> EngineResult<()>;

    /// Move to the previous entry; `NotFound` once exhausted.
    fn prev(&mut self) -> EngineResult<()>;

    /// Forget the position so the next `next`/`prev` starts at an end.
    fn reset(&mut self) -> EngineResult<()>;

    /// Position on the set key; `NotFound` if absent.
    fn search(&mut self) -> EngineResult<()>;

    /// Store the set key and value.
    fn insert(&mut self) -> EngineResult<()>;

    /// Remove the set key; `NotFound` if absent.
    fn remove(&mut self) -> EngineResult<()>;

    fn close(&mut self) -> EngineResult<()>;
}

/// One `key[=value]` pair from an engine configuration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: String,
    pub value: Option<String>,
}

impl ConfigEntry {
    /// A bare key counts as `true`.
    pub fn as_bool(&self) -> EngineResult<bool> {
        match self.value.as_deref() {
            None | Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            Some(other) => Err(EngineError::invalid(format!(
                "{}: expected a boolean, got {other:?}",
                self.key
            ))),
        }
    }
}

/// Parse a comma-separated engine configuration string such as
/// `create,error_prefix="t1",log=(enabled=false)`.
///
/// Quotes are stripped from values; a parenthesized value is returned without
/// its outer parentheses so it can be parsed again.
pub fn parse_config(config: &str) -> EngineResult<Vec<ConfigEntry>> {
    let mut entries = Vec::new();
    for piece in split_top_level(config, ',')? {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let mut parts = split_top_level(piece, '=')?.into_iter();
        let key = parts.next().unwrap_or_default().trim().to_string();
        if key.is_empty() {
            return Err(EngineError::invalid(format!(
                "configuration entry without a key: {piece:?}"
            )));
        }
        let rest: Vec<&str> = parts.collect();
        let value = if rest.is_empty() {
            None
        } else {
            Some(unwrap_value(&rest.join("=")))
        };
        entries.push(ConfigEntry { key, value });
    }
    Ok(entries)
}

fn split_top_level(s: &str, sep: char) -> EngineResult<Vec<&str>> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut start = 0;
    for (idx, c) in s.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    EngineError::invalid(format!("unbalanced ')' in configuration {s:?}"))
                })?;
            }
            c if c == sep && !in_quote && depth == 0 => {
                pieces.push(&s[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    if in_quote || depth != 0 {
        return Err(EngineError::invalid(format!(
            "unterminated quote or '(' in configuration {s:?}"
        )));
    }
    pieces.push(&s[start..]);
    Ok(pieces)
}

fn unwrap_value(value: &str) -> String {
    let value = value.trim();
    let stripped = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('(').and_then(|v| v.strip_suffix(')')));
    stripped.unwrap_or(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: Option<&str>) -> ConfigEntry {
        ConfigEntry {
            key: key.to_string(),
            value: value.map(String::from),
        }
    }

    #[test]
    fn parse_flat_config() {
        let entries = parse_config("create,error_prefix=\"t1: \",busy_timeout=50").unwrap();
        assert_eq!(
            entries,
            vec![
                entry("create", None),
                entry("error_prefix", Some("t1: ")),
                entry("busy_timeout", Some("50")),
            ]
        );
    }

    #[test]
    fn parse_nested_config() {
        let entries = parse_config("log=(enabled=false,file_max=100K),create").unwrap();
        assert_eq!(entries[0], entry("log", Some("enabled=false,file_max=100K")));
        let nested = parse_config(entries[0].value.as_deref().unwrap()).unwrap();
        assert_eq!(nested[0], entry("enabled", Some("false")));
        assert_eq!(entries[1], entry("create", None));
    }

    #[test]
    fn quoted_commas_are_not_separators() {
        let entries = parse_config("error_prefix=\"a,b\",create").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value.as_deref(), Some("a,b"));
    }

    #[test]
    fn empty_pieces_are_ignored() {
        let entries = parse_config(",create,,").unwrap();
        assert_eq!(entries, vec![entry("create", None)]);
    }

    #[test]
    fn unbalanced_config_is_rejected() {
        let err = parse_config("log=(enabled").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
        assert!(parse_config("x=\"open").is_err());
        assert!(parse_config("a)").is_err());
    }

    #[test]
    fn booleans() {
        assert!(entry("create", None).as_bool().unwrap());
        assert!(!entry("enabled", Some("false")).as_bool().unwrap());
        assert!(entry("enabled", Some("maybe")).as_bool().is_err());
    }

    #[test]
    fn items_convert_and_order() {
        assert_eq!(Item::from(3), Item::Int(3));
        assert_eq!(Item::from("k").as_text(), Some("k"));
        assert!(Item::Int(9) < Item::Text("0".into()));
        assert_eq!(Item::Bytes(vec![1, 2]).to_string(), "<2 bytes>");
    }
}
