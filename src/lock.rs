//! Exclusive batch lock for a manifest.
//!
//! The lock is an OS advisory lock held on an open handle to a sibling
//! file for as long as the guard lives. The operating system releases it
//! when the handle closes, including when the process dies, so a crashed
//! run never leaves a lock behind that has to be broken by hand.
//!
//! The lock file itself stays on disk. Unlinking it on release would let a
//! later run lock a fresh inode while an earlier one still holds the old
//! one.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{IceError, Result};

#[derive(Debug)]
pub struct ManifestLock {
    path: PathBuf,
    file: File,
}

impl ManifestLock {
    /// Acquires the lock at `path`, failing with [`IceError::ManifestLocked`]
    /// while another handle holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(IceError::ManifestLocked {
                    lock_path: path.to_path_buf(),
                })
            }
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }

        // Owner details are informational only; the OS lock is what counts.
        file.set_len(0)?;
        writeln!(file, "pid={}", std::process::id())?;
        writeln!(file, "acquired_at={}", Utc::now().to_rfc3339())?;
        file.sync_all()?;
        debug!(lock = %path.display(), "manifest lock acquired");

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(lock = %self.path.display(), error = %e, "failed to release manifest lock");
            return;
        }
        debug!(lock = %self.path.display(), "manifest lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_until_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json.lock");

        let first = ManifestLock::acquire(&path).unwrap();
        let err = ManifestLock::acquire(&path).unwrap_err();
        assert!(matches!(err, IceError::ManifestLocked { .. }));

        drop(first);
        let _again = ManifestLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_long_running_holder_keeps_the_lock() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json.lock");

        let first = ManifestLock::acquire(&path).unwrap();
        std::thread::sleep(Duration::from_millis(120));

        let err = ManifestLock::acquire(&path).unwrap_err();
        assert!(matches!(err, IceError::ManifestLocked { .. }));
        // A failed attempt must not disturb the holder's file.
        assert!(path.exists());
        assert!(fs::read_to_string(first.path())
            .unwrap()
            .contains(&format!("pid={}", std::process::id())));
    }

    #[test]
    fn test_leftover_lock_file_is_reused() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json.lock");
        fs::write(&path, "pid=1\nacquired_at=2020-01-01T00:00:00Z\n").unwrap();

        let lock = ManifestLock::acquire(&path).unwrap();
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert!(contents.contains(&format!("pid={}", std::process::id())));
        assert!(!contents.contains("2020-01-01"));
    }

    #[test]
    fn test_contended_acquires_have_one_winner() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json.lock");
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let lock = ManifestLock::acquire(&path);
                    // Hold until every thread has tried.
                    std::thread::sleep(Duration::from_millis(100));
                    lock.is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
