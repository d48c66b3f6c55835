//! Atomic JSON persistence with dual-layer advisory locking.
//!
//! State files (favorites, history, session pointer) are small JSON
//! documents flushed after each user action. Writes go to a sibling temp
//! file, are fsynced on POSIX, and are renamed over the target so a crash
//! never leaves a half-written file. Readers and writers hold an advisory
//! lock on `{path}.lock` so concurrent processes do not interleave, and an
//! in-process mutex keyed by the absolute path serialises threads within
//! this process.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

/// How long lock acquisition may take before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for a contended cross-process lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Number of rename attempts on Windows (sharing violations are transient).
#[cfg(windows)]
const RENAME_ATTEMPTS: u32 = 3;

/// Errors from atomic store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Serialization to JSON failed.
    #[error("serialize error for {path}: {source}")]
    Serialize {
        /// Target file.
        path: PathBuf,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// Filesystem error while writing.
    #[error("IO error writing {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The advisory lock could not be acquired within the timeout.
    #[error("lock timeout on {path}")]
    LockTimeout {
        /// Lock file path.
        path: PathBuf,
    },
}

/// In-process lock registry, keyed by the absolute target path.
///
/// Entries are leaked once per unique path and live for the process
/// lifetime, which keeps the guards `'static`.
fn lock_registry() -> &'static DashMap<PathBuf, &'static Mutex<()>> {
    static REGISTRY: OnceLock<DashMap<PathBuf, &'static Mutex<()>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn process_lock(path: &Path) -> &'static Mutex<()> {
    *lock_registry()
        .entry(absolute(path))
        .or_insert_with(|| Box::leak(Box::new(Mutex::new(()))))
}

/// RAII guard over the cross-process advisory lock file.
///
/// Unlocks on drop; the lock file itself is left in place so other
/// processes can keep using the same inode.
struct FileLockGuard {
    file: File,
}

impl FileLockGuard {
    fn acquire(target: &Path, exclusive: bool) -> Result<Self, StoreError> {
        let lock_path = lock_file_path(target);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| StoreError::Io {
                path: lock_path.clone(),
                source,
            })?;

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            let attempt = if exclusive {
                fs2::FileExt::try_lock_exclusive(&file)
            } else {
                fs2::FileExt::try_lock_shared(&file)
            };
            match attempt {
                Ok(()) => return Ok(Self { file }),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(_) => {
                    return Err(StoreError::LockTimeout { path: lock_path });
                }
            }
        }
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn lock_file_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    name.push_str(".lock");
    target.with_file_name(name)
}

fn held_locks(
    path: &Path,
    exclusive: bool,
) -> Result<(MutexGuard<'static, ()>, FileLockGuard), StoreError> {
    // In-process first so threads of this process queue on the mutex rather
    // than spinning on the file lock.
    let guard = process_lock(path)
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let file_guard = FileLockGuard::acquire(path, exclusive)?;
    Ok((guard, file_guard))
}

/// Loads a JSON document, returning `default` on absence or corruption.
///
/// A shared advisory lock on `{path}.lock` is held for the read. Any reason
/// for falling back (missing file, empty file, malformed JSON) is logged.
pub fn load_json<T: DeserializeOwned>(path: &Path, default: T) -> T {
    let _locks = match held_locks(path, false) {
        Ok(locks) => locks,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "lock failed, loading default");
            return default;
        }
    };

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "state file absent, using default");
            return default;
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "state file unreadable, using default");
            return default;
        }
    };

    if content.trim().is_empty() {
        debug!(path = %path.display(), "state file empty, using default");
        return default;
    }

    match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "state file malformed, using default");
            default
        }
    }
}

/// Atomically writes a value as pretty JSON.
///
/// The document is written to `.{name}.{pid}.{tid}.tmp` next to the target,
/// fsynced, then renamed over the target under an exclusive advisory lock.
/// On failure the temp file is removed and the target is left unchanged.
///
/// # Errors
///
/// Returns [`StoreError`] on serialization failure, IO failure, or lock
/// timeout.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;

    let _locks = held_locks(path, true)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let temp_path = temp_file_path(path);
    let write_result = write_and_sync(&temp_path, content.as_bytes())
        .and_then(|()| rename_with_retry(&temp_path, path));

    if let Err(err) = write_result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }

    debug!(path = %path.display(), bytes = content.len(), "state file saved");
    Ok(())
}

fn temp_file_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let tid = format!("{:?}", std::thread::current().id());
    let tid: String = tid.chars().filter(char::is_ascii_digit).collect();
    target.with_file_name(format!(".{name}.{}.{tid}.tmp", process::id()))
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = File::create(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    file.write_all(bytes).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    // Durability across crash requires the data to hit the disk before the
    // rename publishes it.
    #[cfg(unix)]
    file.sync_all().map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(not(windows))]
fn rename_with_retry(from: &Path, to: &Path) -> Result<(), StoreError> {
    std::fs::rename(from, to).map_err(|source| StoreError::Io {
        path: to.to_path_buf(),
        source,
    })
}

#[cfg(windows)]
fn rename_with_retry(from: &Path, to: &Path) -> Result<(), StoreError> {
    let mut last_err = None;
    for attempt in 0..RENAME_ATTEMPTS {
        match std::fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(err) => {
                // Sharing violations from scanners/indexers clear quickly.
                warn!(
                    from = %from.display(),
                    to = %to.display(),
                    attempt = attempt + 1,
                    error = %err,
                    "rename failed, retrying"
                );
                last_err = Some(err);
                std::thread::sleep(Duration::from_millis(100 * u64::from(attempt + 1)));
            }
        }
    }
    Err(StoreError::Io {
        path: to.to_path_buf(),
        source: last_err.unwrap_or_else(|| std::io::Error::other("rename failed")),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_save_then_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");

        let value = json!({"viewed": [1, 2, 3], "name": "round trip"});
        save_json(&path, &value).unwrap();

        let loaded: Value = load_json(&path, json!(null));
        assert_eq!(loaded, value);
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("absent.json");

        let loaded: Value = load_json(&path, json!({"fallback": true}));
        assert_eq!(loaded, json!({"fallback": true}));
    }

    #[test]
    fn test_load_empty_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.json");
        std::fs::write(&path, "   \n").unwrap();

        let loaded: Vec<u64> = load_json(&path, vec![9]);
        assert_eq!(loaded, vec![9]);
    }

    #[test]
    fn test_load_malformed_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();

        let loaded: Value = load_json(&path, json!(42));
        assert_eq!(loaded, json!(42));
    }

    #[test]
    fn test_failed_save_leaves_prior_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        save_json(&path, &json!({"version": 1})).unwrap();

        // f64::NAN cannot be serialized to JSON, so this save must fail
        // before touching the target.
        let result = save_json(&path, &f64::NAN);
        assert!(matches!(result, Err(StoreError::Serialize { .. })));

        let loaded: Value = load_json(&path, json!(null));
        assert_eq!(loaded, json!({"version": 1}));
    }

    #[test]
    fn test_save_overwrites_previous_value() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");

        save_json(&path, &json!([1])).unwrap();
        save_json(&path, &json!([1, 2])).unwrap();

        let loaded: Value = load_json(&path, json!(null));
        assert_eq!(loaded, json!([1, 2]));
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/deep/state.json");

        save_json(&path, &json!({"ok": true})).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_no_temp_files_left_after_save() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        save_json(&path, &json!({"a": 1})).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
    }

    #[test]
    fn test_concurrent_saves_produce_a_complete_document() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        let path = Arc::new(path);

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let path = Arc::clone(&path);
            handles.push(std::thread::spawn(move || {
                for j in 0..20u64 {
                    let doc = json!({"writer": i, "iteration": j, "payload": vec![i; 64]});
                    save_json(&path, &doc).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Whatever write won, the document must be whole and well-formed.
        let loaded: Value = load_json(&path, json!(null));
        assert!(loaded.get("writer").is_some());
        assert_eq!(loaded.get("payload").unwrap().as_array().unwrap().len(), 64);
    }

    #[test]
    fn test_lock_file_is_sibling_of_target() {
        let path = Path::new("/data/favorites.json");
        assert_eq!(
            lock_file_path(path),
            PathBuf::from("/data/favorites.json.lock")
        );
    }

    #[test]
    fn test_typed_round_trip() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct SessionPointer {
            mode: String,
            page: u32,
            history_index: i64,
        }

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("session.json");
        let value = SessionPointer {
            mode: "browse".to_string(),
            page: 7,
            history_index: 3,
        };
        save_json(&path, &value).unwrap();

        let loaded: SessionPointer = load_json(
            &path,
            SessionPointer {
                mode: String::new(),
                page: 0,
                history_index: -1,
            },
        );
        assert_eq!(loaded, value);
    }
}
