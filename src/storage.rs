//! Durable storage for the manifest.
//!
//! Save writes a staging file, fsyncs it and renames it over the primary,
//! so a failed save leaves the previous state intact. The previous primary
//! is copied into a timestamped backup first; backups beyond the retention
//! limit are pruned oldest-first.
//!
//! Load validates the primary (format version, checksum, index
//! consistency). A corrupted primary fails over to the newest valid backup.
//!
//! ```text
//! data/
//! ├── manifest.json            # primary
//! ├── manifest.json.lock       # held for the duration of a batch
//! └── backups/
//!     ├── manifest-20240415T101500.000000000Z-000.json
//!     └── manifest-20240415T102500.000000000Z-000.json
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{IceError, Result};
use crate::lock::ManifestLock;
use crate::manifest::Manifest;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedManifest {
    format_version: u32,
    saved_at: DateTime<Utc>,
    /// SHA-256 of the canonical JSON of `manifest`.
    checksum: String,
    manifest: Manifest,
}

/// Emitted when load fell back to a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryEvent {
    pub primary: PathBuf,
    pub backup: PathBuf,
    pub reason: String,
}

#[derive(Debug)]
pub struct Loaded {
    pub manifest: Manifest,
    pub recovery: Option<RecoveryEvent>,
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
    backup_dir: PathBuf,
    retention: usize,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            path: path.into(),
            backup_dir: backup_dir.into(),
            retention,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn lock_path(&self) -> PathBuf {
        sibling_with_suffix(&self.path, ".lock")
    }

    /// Takes the exclusive batch lock.
    pub fn lock(&self) -> Result<ManifestLock> {
        ManifestLock::acquire(&self.lock_path())
    }

    /// Persists `manifest` atomically. Returns the backup the previous
    /// primary was rotated into, if there was one.
    pub fn save(&self, manifest: &Manifest) -> Result<Option<PathBuf>> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let envelope = PersistedManifest {
            format_version: FORMAT_VERSION,
            saved_at: Utc::now(),
            checksum: checksum(manifest)?,
            manifest: manifest.clone(),
        };
        let raw = serde_json::to_vec_pretty(&envelope)?;

        let staging = sibling_with_suffix(&self.path, ".tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&staging)?;
            file.write_all(&raw)?;
            file.sync_all()?;
        }

        let backup = if self.path.exists() {
            match self.rotate_primary() {
                Ok(backup) => Some(backup),
                Err(e) => {
                    let _ = fs::remove_file(&staging);
                    return Err(e);
                }
            }
        } else {
            None
        };

        if let Err(e) = fs::rename(&staging, &self.path) {
            let _ = fs::remove_file(&staging);
            return Err(e.into());
        }
        debug!(path = %self.path.display(), bytes = raw.len(), "manifest saved");

        self.prune_backups()?;
        Ok(backup)
    }

    fn rotate_primary(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.backup_dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.9fZ").to_string();
        let stem = self.backup_stem();
        // The counter keeps same-instant backups unique and lexically ordered.
        let mut n = 0u32;
        let mut target = self.backup_dir.join(format!("{}-{}-{:03}.json", stem, stamp, n));
        while target.exists() {
            n += 1;
            target = self.backup_dir.join(format!("{}-{}-{:03}.json", stem, stamp, n));
        }
        fs::copy(&self.path, &target)?;
        Ok(target)
    }

    fn backup_stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "manifest".to_string())
    }

    /// Backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}-", self.backup_stem());
        let mut backups: Vec<PathBuf> = fs::read_dir(&self.backup_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"))
            })
            .collect();
        backups.sort();
        backups.reverse();
        Ok(backups)
    }

    fn prune_backups(&self) -> Result<()> {
        let backups = self.list_backups()?;
        for stale in backups.iter().skip(self.retention) {
            debug!(backup = %stale.display(), "pruning manifest backup");
            fs::remove_file(stale)?;
        }
        Ok(())
    }

    /// Loads the manifest, falling back to backups when the primary fails
    /// validation. A missing primary with no backups is a first run.
    pub fn load(&self) -> Result<Loaded> {
        let backups = self.list_backups()?;

        let reason = if self.path.exists() {
            match read_validated(&self.path) {
                Ok(manifest) => {
                    return Ok(Loaded {
                        manifest,
                        recovery: None,
                    })
                }
                Err(reason) => reason,
            }
        } else if backups.is_empty() {
            info!(path = %self.path.display(), "no manifest found, starting empty");
            return Ok(Loaded {
                manifest: Manifest::default(),
                recovery: None,
            });
        } else {
            "primary manifest is missing".to_string()
        };

        let corruption = IceError::ManifestCorruption {
            path: self.path.clone(),
            reason: reason.clone(),
        };
        warn!(error = %corruption, "attempting recovery from backups");

        for backup in &backups {
            match read_validated(backup) {
                Ok(manifest) => {
                    warn!(
                        primary = %self.path.display(),
                        backup = %backup.display(),
                        "manifest recovered from backup"
                    );
                    return Ok(Loaded {
                        manifest,
                        recovery: Some(RecoveryEvent {
                            primary: self.path.clone(),
                            backup: backup.clone(),
                            reason,
                        }),
                    });
                }
                Err(why) => {
                    warn!(backup = %backup.display(), reason = %why, "backup failed validation");
                }
            }
        }

        Err(IceError::UnrecoverableManifest {
            path: self.path.clone(),
            backups_tried: backups.len(),
        })
    }

    /// Validates the primary without falling back.
    pub fn verify(&self) -> std::result::Result<Manifest, String> {
        read_validated(&self.path)
    }
}

fn read_validated(path: &Path) -> std::result::Result<Manifest, String> {
    let raw = fs::read(path).map_err(|e| format!("unreadable: {}", e))?;
    let envelope: PersistedManifest =
        serde_json::from_slice(&raw).map_err(|e| format!("malformed JSON: {}", e))?;
    if envelope.format_version != FORMAT_VERSION {
        return Err(format!(
            "unsupported format version {} (expected {})",
            envelope.format_version, FORMAT_VERSION
        ));
    }
    let actual = checksum(&envelope.manifest).map_err(|e| e.to_string())?;
    if actual != envelope.checksum {
        return Err("checksum mismatch".to_string());
    }
    envelope.manifest.validate()?;
    Ok(envelope.manifest)
}

fn checksum(manifest: &Manifest) -> Result<String> {
    let canonical = serde_json::to_vec(manifest)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}
