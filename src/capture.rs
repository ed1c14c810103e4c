//! Descriptor-level output capture.
//!
//! A [`CapturedChannel`] points a process descriptor (normally 1 or 2) at a
//! file with `dup2`, so output written by native code below the Rust runtime
//! is captured too. The channel tracks how much of the file has already been
//! accounted for; checks only ever look at bytes past that position.

use crate::context::HarnessContext;
use crate::error::{HarnessError, Result};
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

/// Bound on the unexpected output echoed to the console.
pub const CONSOLE_PREVIEW: usize = 10000;
/// Bound on unexpected output quoted in a failure message.
pub const FAILURE_PREVIEW: usize = 100;
/// Bound on actual output quoted when an expectation does not match.
pub const MISMATCH_PREVIEW: usize = 1000;

/// Truncate `s` to at most `max` characters, marking the cut with `...`.
pub fn shorten_with_ellipsis(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Flush Rust-level buffers so nothing crosses a redirection boundary late.
fn flush_std() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

fn redirect(from: RawFd, onto: RawFd) -> io::Result<()> {
    // SAFETY: both descriptors are open; dup2 does not touch memory.
    if unsafe { libc::dup2(from, onto) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// One redirected output stream.
#[derive(Debug)]
pub struct CapturedChannel {
    target_fd: RawFd,
    path: PathBuf,
    desc: String,
    expect_pos: u64,
    /// The original target while capturing.
    saved: Option<OwnedFd>,
}

impl CapturedChannel {
    pub fn new(target_fd: RawFd, path: impl Into<PathBuf>, desc: impl Into<String>) -> Self {
        Self {
            target_fd,
            path: path.into(),
            desc: desc.into(),
            expect_pos: 0,
            saved: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn expect_pos(&self) -> u64 {
        self.expect_pos
    }

    pub fn is_capturing(&self) -> bool {
        self.saved.is_some()
    }

    /// Start capturing into a fresh backing file.
    pub fn capture(&mut self) -> Result<()> {
        if self.saved.is_some() {
            return Err(HarnessError::harness(format!(
                "{}: already capturing {}",
                self.path.display(),
                self.desc
            )));
        }
        flush_std();
        let file = File::create(&self.path)?;
        let saved = crate::context::dup_descriptor(self.target_fd)?;
        redirect(file.as_raw_fd(), self.target_fd)?;
        self.saved = Some(OwnedFd::from(saved));
        self.expect_pos = 0;
        Ok(())
    }

    /// Stop capturing and put the original descriptor back. The backing file
    /// stays readable. A channel that is not capturing is left alone.
    pub fn release(&mut self) -> Result<()> {
        let Some(saved) = self.saved.take() else {
            return Ok(());
        };
        flush_std();
        redirect(saved.as_raw_fd(), self.target_fd).map_err(|e| {
            HarnessError::harness(format!(
                "cannot restore descriptor {} after capturing {}: {e}",
                self.target_fd, self.desc
            ))
        })
    }

    fn file_size(&self) -> Result<u64> {
        flush_std();
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Everything from the expect position to the current end, and its length
    /// in bytes.
    fn read_new(&self) -> Result<(String, u64)> {
        flush_std();
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.expect_pos))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let len = bytes.len() as u64;
        Ok((String::from_utf8_lossy(&bytes).into_owned(), len))
    }

    /// Fail if anything was written since the last check. The expect position
    /// moves to the end of the file either way.
    pub fn check_quiescent(&mut self, ctx: &HarnessContext) -> Result<()> {
        let size = self.file_size()?;
        if size <= self.expect_pos {
            self.expect_pos = size;
            return Ok(());
        }
        let (contents, _) = self.read_new()?;
        self.expect_pos = size;
        ctx.prout(&format!(
            "ERROR: {} unexpected {}, contains:\n\"{}\"",
            self.path.display(),
            self.desc,
            shorten_with_ellipsis(&contents, CONSOLE_PREVIEW)
        ));
        Err(HarnessError::assertion(format!(
            "unexpected {}, contains: \"{}\"",
            self.desc,
            shorten_with_ellipsis(&contents, FAILURE_PREVIEW)
        )))
    }

    /// Require the output written since the last check to equal `expect`.
    pub fn check_additional(&mut self, expect: &str) -> Result<()> {
        let (got, len) = self.read_new()?;
        self.expect_pos += len;
        if got != expect {
            return Err(HarnessError::assertion(format!(
                "in {}, expected \"{expect}\", but got \"{}\"",
                self.desc,
                shorten_with_ellipsis(&got, MISMATCH_PREVIEW)
            )));
        }
        Ok(())
    }

    /// Require the output written since the last check to contain a match
    /// for `pattern`.
    pub fn check_additional_pattern(&mut self, pattern: &str) -> Result<()> {
        let (got, len) = self.read_new()?;
        self.expect_pos += len;
        let re = Regex::new(pattern).map_err(|source| HarnessError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        if !re.is_match(&got) {
            return Err(HarnessError::assertion(format!(
                "in {}, expected pattern \"{pattern}\", but got \"{}\"",
                self.desc,
                shorten_with_ellipsis(&got, MISMATCH_PREVIEW)
            )));
        }
        Ok(())
    }
}

impl Drop for CapturedChannel {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
