//! Per-test working directories.

use crate::error::{HarnessError, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// A fresh directory a test runs inside. Entering it changes the process
/// working directory; [`FixtureDir::restore`] changes it back.
#[derive(Debug)]
pub struct FixtureDir {
    path: PathBuf,
    origin: Option<PathBuf>,
}

impl FixtureDir {
    /// Purge anything left at `path` by an earlier run and create it empty.
    pub fn create(path: PathBuf) -> Result<Self> {
        if path.exists() {
            // A partial removal is reported below as a directory that would
            // not go away.
            let _ = fs::remove_dir_all(&path);
            if path.exists() {
                return Err(HarnessError::harness(format!(
                    "{}: cannot remove directory",
                    path.display()
                )));
            }
        }
        fs::create_dir_all(&path)?;
        Ok(Self { path, origin: None })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Change into the directory, remembering where we came from.
    pub fn enter(&mut self) -> Result<()> {
        if self.origin.is_none() {
            self.origin = Some(env::current_dir()?);
        }
        env::set_current_dir(&self.path)?;
        Ok(())
    }

    /// Return to the directory that was current before [`enter`](Self::enter).
    pub fn restore(&mut self) -> Result<()> {
        if let Some(origin) = self.origin.take() {
            env::set_current_dir(&origin).map_err(|e| {
                HarnessError::harness(format!(
                    "cannot return to {} from fixture: {e}",
                    origin.display()
                ))
            })?;
        }
        Ok(())
    }

    /// Delete the directory and everything in it.
    pub fn remove(mut self) -> Result<()> {
        self.restore()?;
        if self.path.exists() {
            fs::remove_dir_all(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for FixtureDir {
    fn drop(&mut self) {
        if let Some(origin) = self.origin.take() {
            let _ = env::set_current_dir(origin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn create_purges_stale_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Case.0");
        fs::create_dir_all(path.join("old")).unwrap();
        fs::write(path.join("old/file"), b"x").unwrap();

        let fixture = FixtureDir::create(path.clone()).unwrap();
        assert!(fixture.path().is_dir());
        assert_eq!(fs::read_dir(&path).unwrap().count(), 0);
    }

    #[test]
    #[serial]
    fn enter_and_restore_round_trip() {
        let dir = tempdir().unwrap();
        let before = env::current_dir().unwrap();
        let mut fixture = FixtureDir::create(dir.path().join("Case.1")).unwrap();

        fixture.enter().unwrap();
        assert_eq!(
            env::current_dir().unwrap().canonicalize().unwrap(),
            fixture.path().canonicalize().unwrap()
        );
        fixture.restore().unwrap();
        assert_eq!(env::current_dir().unwrap(), before);
    }

    #[test]
    #[serial]
    fn drop_restores_cwd() {
        let dir = tempdir().unwrap();
        let before = env::current_dir().unwrap();
        {
            let mut fixture = FixtureDir::create(dir.path().join("Case.2")).unwrap();
            fixture.enter().unwrap();
        }
        assert_eq!(env::current_dir().unwrap(), before);
    }

    #[test]
    #[serial]
    fn remove_restores_and_deletes() {
        let dir = tempdir().unwrap();
        let before = env::current_dir().unwrap();
        let mut fixture = FixtureDir::create(dir.path().join("Case.3")).unwrap();
        let path = fixture.path().to_path_buf();
        fixture.enter().unwrap();
        fs::write("stdout.txt", b"").unwrap();

        fixture.remove().unwrap();
        assert!(!path.exists());
        assert_eq!(env::current_dir().unwrap(), before);
    }
}
