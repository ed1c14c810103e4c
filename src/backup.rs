//! Crash simulation by copying a live engine home.
//!
//! A [`BackupPair`] holds the engine's backup cursor open while the files it
//! enumerates are copied into a second directory. Opening a connection on
//! that copy runs the engine's recovery exactly as after a crash.

use crate::engine::{BACKUP_URI, Cursor, Session};
use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Chunk size for unaligned copies. Odd, so writes never line up with pages.
pub const UNALIGNED_CHUNK: usize = 1021;

/// How file contents are copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    /// Whole-file copy.
    Aligned,
    /// Copy in odd-sized chunks.
    Unaligned,
}

impl CopyMode {
    /// Unaligned on every other multiple of `freq`, aligned otherwise.
    pub fn for_iteration(i: u64, freq: u64) -> Self {
        let period = freq.max(1) * 2;
        if i % period == 0 {
            CopyMode::Unaligned
        } else {
            CopyMode::Aligned
        }
    }
}

/// Engine files that must not travel with a copy: lock files and the
/// shared-memory log index, which recovery rebuilds.
pub fn is_transient(name: &str) -> bool {
    name.ends_with("-shm") || name.ends_with(".lock")
}

/// Copy one file, returning the bytes copied.
pub fn copy_file(src: &Path, dst: &Path, mode: CopyMode) -> io::Result<u64> {
    match mode {
        CopyMode::Aligned => fs::copy(src, dst),
        CopyMode::Unaligned => {
            let mut input = File::open(src)?;
            let mut output = File::create(dst)?;
            let mut buf = [0u8; UNALIGNED_CHUNK];
            let mut total = 0u64;
            loop {
                let n = input.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                output.write_all(&buf[..n])?;
                total += n as u64;
            }
            output.flush()?;
            Ok(total)
        }
    }
}

fn prepare_dest(dest: &Path) -> io::Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)
}

/// Copy every regular file of an engine home into `dest`, without asking the
/// engine. Used to capture a home with transactions still in flight.
pub fn copy_home(src: &Path, dest: &Path, mode: CopyMode) -> Result<Vec<String>> {
    prepare_dest(dest)?;
    let mut names = Vec::new();
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_transient(&name) {
            continue;
        }
        names.push(name);
    }
    names.sort();
    for name in &names {
        copy_file(&src.join(name), &dest.join(name), mode)?;
    }
    tracing::debug!(src = %src.display(), dest = %dest.display(), files = names.len(), ?mode, "copied engine home");
    Ok(names)
}

/// A backup in progress: the open backup cursor plus the files copied so far.
pub struct BackupPair {
    source: PathBuf,
    dest: PathBuf,
    cursor: Option<Box<dyn Cursor>>,
    copied: Vec<String>,
    complete: bool,
}

impl BackupPair {
    /// Empty `dest` and open the backup cursor on `session`.
    pub fn begin(session: &mut dyn Session, source: &Path, dest: &Path) -> Result<Self> {
        prepare_dest(dest)?;
        let cursor = session.open_cursor(BACKUP_URI)?;
        tracing::debug!(source = %source.display(), dest = %dest.display(), "backup cursor opened");
        Ok(Self {
            source: source.to_path_buf(),
            dest: dest.to_path_buf(),
            cursor: Some(cursor),
            copied: Vec::new(),
            complete: false,
        })
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn copied(&self) -> &[String] {
        &self.copied
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Walk the backup cursor to exhaustion, copying each file it names.
    pub fn copy_all(&mut self, mode: CopyMode) -> Result<&[String]> {
        let cursor = self.cursor.as_mut().ok_or_else(|| {
            HarnessError::BackupProtocol("backup cursor already released".into())
        })?;
        loop {
            match cursor.next() {
                Ok(()) => {}
                Err(e) if e.is_not_found() => break,
                Err(e) => {
                    return Err(HarnessError::BackupProtocol(format!(
                        "backup cursor iteration failed after {} file(s): {e}",
                        self.copied.len()
                    )));
                }
            }
            let key = cursor.key()?;
            let name = key.as_text().ok_or_else(|| {
                HarnessError::BackupProtocol(format!("backup cursor returned non-name key {key}"))
            })?;
            if name.contains('/') {
                return Err(HarnessError::BackupProtocol(format!(
                    "backup cursor returned a path, not a file name: {name}"
                )));
            }
            copy_file(&self.source.join(name), &self.dest.join(name), mode)?;
            self.copied.push(name.to_string());
        }
        self.complete = true;
        tracing::debug!(files = self.copied.len(), ?mode, "backup copy complete");
        Ok(&self.copied)
    }

    /// Close the backup cursor. Releasing before the copy finished leaves a
    /// partial copy and is reported as a protocol violation.
    pub fn release(mut self) -> Result<Vec<String>> {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close()?;
        }
        if !self.complete {
            return Err(HarnessError::BackupProtocol(format!(
                "backup cursor released before the copy into {} completed ({} file(s) copied)",
                self.dest.display(),
                self.copied.len()
            )));
        }
        Ok(std::mem::take(&mut self.copied))
    }
}

impl Drop for BackupPair {
    fn drop(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            let _ = cursor.close();
        }
    }
}

/// Copy the engine home through a backup cursor, without checkpointing first.
pub fn backup(session: &mut dyn Session, source: &Path, dest: &Path) -> Result<Vec<String>> {
    let mut pair = BackupPair::begin(session, source, dest)?;
    pair.copy_all(CopyMode::Aligned)?;
    pair.release()
}
