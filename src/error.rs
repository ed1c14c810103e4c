//! Error types for the harness.
//!
//! Test bodies, assertion helpers and lifecycle operations all return
//! [`Result`]. The variant decides how the controller classifies the outcome.

use crate::engine::EngineError;
use std::io;
use std::panic::Location;
use thiserror::Error;

/// Result type alias for harness operations and test bodies.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Everything that can end a test early or break the harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// I/O error outside the engine (fixture directories, copies, logs).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The engine reported an error.
    #[error("engine error: {error}")]
    Engine {
        error: EngineError,
        location: &'static Location<'static>,
    },

    /// A test assertion did not hold.
    #[error("{message}")]
    Assertion {
        message: String,
        location: &'static Location<'static>,
    },

    /// The test opted out (known failure, missing precondition).
    #[error("skipped: {0}")]
    Skip(String),

    /// The harness itself misbehaved (descriptor restore, directory collision).
    #[error("harness defect: {message}")]
    Harness {
        message: String,
        location: &'static Location<'static>,
    },

    /// Backup cursor enumeration ended with something other than NotFound,
    /// or the cursor was released before the copy finished.
    #[error("backup protocol violation: {0}")]
    BackupProtocol(String),

    /// An output pattern did not compile.
    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Invalid harness configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<EngineError> for HarnessError {
    /// Records where the error crossed into the harness, usually a `?`.
    #[track_caller]
    fn from(error: EngineError) -> Self {
        HarnessError::Engine {
            error,
            location: Location::caller(),
        }
    }
}

impl HarnessError {
    /// Build an assertion failure.
    #[track_caller]
    pub fn assertion(message: impl Into<String>) -> Self {
        HarnessError::Assertion {
            message: message.into(),
            location: Location::caller(),
        }
    }

    /// Build a harness defect.
    #[track_caller]
    pub fn harness(message: impl Into<String>) -> Self {
        HarnessError::Harness {
            message: message.into(),
            location: Location::caller(),
        }
    }

    /// Source location the error was raised at, when known.
    pub fn location(&self) -> Option<&'static Location<'static>> {
        match self {
            HarnessError::Engine { location, .. }
            | HarnessError::Assertion { location, .. }
            | HarnessError::Harness { location, .. } => Some(location),
            _ => None,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, HarnessError::Skip(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ErrorCode;

    #[test]
    fn engine_errors_convert() {
        let err: HarnessError = EngineError::new(ErrorCode::Busy, "database is locked").into();
        assert!(matches!(err, HarnessError::Engine { .. }));
        assert_eq!(err.to_string(), "engine error: database is locked");
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn question_mark_records_raise_site() {
        fn open() -> Result<()> {
            Err(EngineError::new(ErrorCode::NotFound, "table:nope: no such object"))?;
            Ok(())
        }
        let err = open().unwrap_err();
        let location = err.location().unwrap();
        assert!(location.file().ends_with("error.rs"), "{location}");
    }

    #[test]
    fn constructors_record_caller() {
        let line = line!() + 1;
        let err = HarnessError::assertion("nope");
        let location = err.location().unwrap();
        assert!(location.file().ends_with("error.rs"));
        assert_eq!(location.line(), line);
        assert!(HarnessError::Skip("later".into()).location().is_none());
    }

    #[test]
    fn skip_is_recognised() {
        assert!(HarnessError::Skip("later".into()).is_skip());
        assert!(!HarnessError::assertion("nope").is_skip());
    }

    #[test]
    fn pattern_error_keeps_source() {
        let source = regex::Regex::new("[unclosed").unwrap_err();
        let err = HarnessError::Pattern {
            pattern: "[unclosed".into(),
            source,
        };
        assert!(err.to_string().starts_with("invalid pattern \"[unclosed\""));
        assert!(std::error::Error::source(&err).is_some());
    }
}
