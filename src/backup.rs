//! Backup and restore of the persisted state files.
//!
//! A backup is a single JSON document bundling the five state files with a
//! SHA-256 checksum over the canonical (key-sorted) form of the data.
//! Restore refuses oversized or checksum-mismatched files and snapshots the
//! current state into `backup_temp/` before overwriting anything.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{self, StoreError};

/// Backup file format version.
pub const BACKUP_VERSION: &str = "1.0";

/// Restore refuses files larger than this.
const MAX_BACKUP_BYTES: u64 = 100 * 1024 * 1024;

/// Directory (under the data root) holding pre-restore snapshots.
const BACKUP_TEMP_DIR: &str = "backup_temp";

/// The state files included in a backup: `(key, filename, empty default)`.
const BACKUP_FILES: [(&str, &str, fn() -> Value); 5] = [
    ("viewed", crate::state::VIEWED_FILE, || json!([])),
    ("favorites", crate::state::FAVORITES_FILE, || json!({})),
    ("browse_history", crate::state::HISTORY_FILE, || json!([])),
    ("session", crate::state::SESSION_FILE, || json!({})),
    ("user_settings", crate::state::SETTINGS_FILE, || json!({})),
];

/// Errors from backup and restore.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The backup file does not exist or is not a regular file.
    #[error("backup file not found: {path}")]
    NotFound {
        /// Offending path.
        path: PathBuf,
    },

    /// The file exceeds the restore size limit.
    #[error("backup file too large: {bytes} bytes (limit {MAX_BACKUP_BYTES})")]
    TooLarge {
        /// Observed size.
        bytes: u64,
    },

    /// The document is not a valid backup.
    #[error("malformed backup: {reason}")]
    Malformed {
        /// Short cause.
        reason: String,
    },

    /// The stored checksum does not match the data.
    #[error("backup checksum mismatch; data may be corrupted")]
    ChecksumMismatch,

    /// Filesystem failure.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Atomic store failure while writing restored files.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counts embedded in the backup header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupStats {
    /// Entries in `viewed`.
    pub viewed_count: usize,
    /// Entries in `favorites`.
    pub favorites_count: usize,
    /// Entries in `browse_history`.
    pub history_count: usize,
}

/// Header metadata read without restoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    /// Format version.
    pub version: String,
    /// Application version that wrote the backup.
    pub app_version: String,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
    /// Embedded counts.
    pub stats: BackupStats,
    /// Whether the checksum verifies.
    pub checksum_valid: bool,
}

/// Outcome of a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Files written.
    pub restored: usize,
    /// Files that failed to write.
    pub failed: Vec<String>,
}

/// Backup and restore over a data directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    base_path: PathBuf,
}

impl BackupManager {
    /// Creates a manager over the directory holding the state files.
    #[must_use]
    pub fn new(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
        }
    }

    /// Writes a backup of all state files to `save_path`.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError`] when the target is a directory or the write
    /// fails; missing state files are backed up as their empty defaults.
    pub fn create_backup(&self, save_path: &Path) -> Result<BackupStats, BackupError> {
        if save_path.is_dir() {
            return Err(BackupError::Malformed {
                reason: format!("save path is a directory: {}", save_path.display()),
            });
        }
        if let Some(parent) = save_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| BackupError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let data = self.collect_data();
        let stats = calculate_stats(&data);
        let checksum = compute_checksum(&Value::Object(data.clone()));

        let backup = json!({
            "version": BACKUP_VERSION,
            "app_version": env!("CARGO_PKG_VERSION"),
            "created_at": iso8601_now(),
            "stats": {
                "viewed_count": stats.viewed_count,
                "favorites_count": stats.favorites_count,
                "history_count": stats.history_count,
            },
            "checksum": checksum,
            "data": Value::Object(data),
        });

        store::save_json(save_path, &backup)?;
        info!(path = %save_path.display(), "backup created");
        Ok(stats)
    }

    /// Restores state files from a backup document.
    ///
    /// Validates the checksum unless `skip_checksum` is set, refuses files
    /// over 100 MiB, and snapshots the current state files to
    /// `backup_temp/{key}_{timestamp}.bak` before overwriting.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError`] on missing/oversized/malformed input or a
    /// checksum mismatch.
    pub fn restore_backup(
        &self,
        backup_path: &Path,
        skip_checksum: bool,
    ) -> Result<RestoreReport, BackupError> {
        let backup = self.read_backup_document(backup_path)?;

        let Some(data) = backup.get("data").and_then(Value::as_object) else {
            return Err(BackupError::Malformed {
                reason: "missing data object".to_string(),
            });
        };

        let file_version = backup
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("0");
        if file_version != BACKUP_VERSION {
            warn!(file_version, current = BACKUP_VERSION, "backup version differs");
        }

        if !skip_checksum && !verify_checksum(&backup) {
            return Err(BackupError::ChecksumMismatch);
        }

        self.snapshot_current();

        let mut report = RestoreReport::default();
        for (key, filename, _) in BACKUP_FILES {
            let Some(value) = data.get(key) else {
                debug!(key, "backup does not contain this key");
                continue;
            };
            let target = self.base_path.join(filename);
            match store::save_json(&target, value) {
                Ok(()) => {
                    report.restored += 1;
                    info!(filename, "restored");
                }
                Err(err) => {
                    warn!(filename, error = %err, "restore failed for file");
                    report.failed.push(filename.to_string());
                }
            }
        }

        info!(
            path = %backup_path.display(),
            restored = report.restored,
            failed = report.failed.len(),
            "backup restore finished"
        );
        Ok(report)
    }

    /// Reads the header of a backup without restoring. `None` when the file
    /// is absent or not a backup document.
    #[must_use]
    pub fn backup_info(&self, backup_path: &Path) -> Option<BackupInfo> {
        let backup = self.read_backup_document(backup_path).ok()?;
        let stats_value = backup.get("stats").and_then(Value::as_object);
        let count = |key: &str| {
            stats_value
                .and_then(|s| s.get(key))
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize
        };

        Some(BackupInfo {
            version: backup
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string(),
            app_version: backup
                .get("app_version")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string(),
            created_at: backup
                .get("created_at")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string(),
            stats: BackupStats {
                viewed_count: count("viewed_count"),
                favorites_count: count("favorites_count"),
                history_count: count("history_count"),
            },
            checksum_valid: verify_checksum(&backup),
        })
    }

    fn read_backup_document(&self, path: &Path) -> Result<Value, BackupError> {
        let metadata = std::fs::metadata(path).map_err(|_| BackupError::NotFound {
            path: path.to_path_buf(),
        })?;
        if !metadata.is_file() {
            return Err(BackupError::NotFound {
                path: path.to_path_buf(),
            });
        }
        if metadata.len() > MAX_BACKUP_BYTES {
            return Err(BackupError::TooLarge {
                bytes: metadata.len(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|source| BackupError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document: Value =
            serde_json::from_str(&content).map_err(|e| BackupError::Malformed {
                reason: format!("invalid JSON: {e}"),
            })?;
        if !document.is_object() {
            return Err(BackupError::Malformed {
                reason: "root element is not an object".to_string(),
            });
        }
        Ok(document)
    }

    fn collect_data(&self) -> Map<String, Value> {
        let mut data = Map::new();
        for (key, filename, default) in BACKUP_FILES {
            let value: Value = store::load_json(&self.base_path.join(filename), default());
            data.insert(key.to_string(), value);
        }
        data
    }

    /// Copies the current state files to timestamped `.bak` snapshots so a
    /// bad restore can be rolled back by hand.
    fn snapshot_current(&self) {
        let backup_dir = self.base_path.join(BACKUP_TEMP_DIR);
        if let Err(err) = std::fs::create_dir_all(&backup_dir) {
            warn!(error = %err, "could not create snapshot directory");
            return;
        }

        let stamp = compact_timestamp_now();
        for (key, filename, _) in BACKUP_FILES {
            let source = self.base_path.join(filename);
            if !source.exists() {
                continue;
            }
            let target = backup_dir.join(format!("{key}_{stamp}.bak"));
            match std::fs::copy(&source, &target) {
                Ok(_) => debug!(filename, snapshot = %target.display(), "state snapshotted"),
                Err(err) => warn!(filename, error = %err, "snapshot failed"),
            }
        }
    }
}

fn calculate_stats(data: &Map<String, Value>) -> BackupStats {
    let len_of = |key: &str| match data.get(key) {
        Some(Value::Array(items)) => items.len(),
        Some(Value::Object(map)) => map.len(),
        _ => 0,
    };
    BackupStats {
        viewed_count: len_of("viewed"),
        favorites_count: len_of("favorites"),
        history_count: len_of("browse_history"),
    }
}

/// SHA-256 hex of the canonical JSON form of `data`.
#[must_use]
pub fn compute_checksum(data: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(data).as_bytes()))
}

fn verify_checksum(backup: &Value) -> bool {
    let Some(stored) = backup.get("checksum").and_then(Value::as_str) else {
        return false;
    };
    let Some(data) = backup.get("data") else {
        return false;
    };
    if !data.is_object() {
        return false;
    }
    stored == compute_checksum(data)
}

/// Serialises with object keys sorted recursively, so the same data always
/// hashes identically regardless of insertion order.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
                Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

fn iso8601_now() -> String {
    let (date, time) = civil_now();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        date.0, date.1, date.2, time.0, time.1, time.2
    )
}

fn compact_timestamp_now() -> String {
    let (date, time) = civil_now();
    format!(
        "{:04}{:02}{:02}_{:02}{:02}{:02}",
        date.0, date.1, date.2, time.0, time.1, time.2
    )
}

/// UTC civil date and time from the system clock.
fn civil_now() -> ((i64, u32, u32), (u32, u32, u32)) {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0) as i64;
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400) as u32;
    (
        civil_from_days(days),
        (rem / 3600, (rem % 3600) / 60, rem % 60),
    )
}

/// Gregorian date from days since the epoch (1970-01-01).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if month <= 2 { year + 1 } else { year }, month, day)
}
