//! Library scanning and favorites recovery.
//!
//! The library is `base_dir/{Safe,Questionable,Explicit}/` full of
//! `{id}_{tags}.{ext}` files, with `.tmp` partials next to unfinished
//! downloads. Startup scans it into the "downloaded set", then recovery
//! reconciles the favorites map against it: orphan partials are resumed and
//! missing favorites are re-downloaded.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, instrument};

use crate::download::{DownloadCallbacks, DownloadManager};
use crate::post::{Post, Rating};
use crate::state::FavoriteEntry;

/// Image extensions considered library content.
const SUPPORTED_FORMATS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

/// One final file in the library.
#[derive(Debug, Clone)]
pub struct LibraryFile {
    /// Absolute path.
    pub path: PathBuf,
    /// File name.
    pub filename: String,
    /// Rating folder it lives in.
    pub category: Rating,
    /// Post id parsed from the name.
    pub id: String,
    /// Tags parsed from the name, underscores restored to spaces.
    pub tags: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification time.
    pub mtime: SystemTime,
}

/// An unfinished `.tmp` partial found during the scan.
#[derive(Debug, Clone)]
pub struct OrphanPartial {
    /// Path of the partial file.
    pub path: PathBuf,
    /// Post id parsed from the name.
    pub id: String,
    /// Rating folder it lives in.
    pub folder: Rating,
}

/// Result of a library scan.
#[derive(Debug, Default)]
pub struct LibraryScan {
    /// Final files, newest first.
    pub files: Vec<LibraryFile>,
    /// Partials awaiting resume.
    pub orphans: Vec<OrphanPartial>,
    /// Post ids with a final file on disk.
    pub downloaded: HashSet<String>,
}

impl LibraryScan {
    /// Filters files by rating and a case-insensitive tag substring.
    #[must_use]
    pub fn filter(&self, rating: Option<Rating>, query: &str) -> Vec<&LibraryFile> {
        let query = query.trim().to_lowercase();
        self.files
            .iter()
            .filter(|f| rating.is_none_or(|r| f.category == r))
            .filter(|f| query.is_empty() || f.tags.to_lowercase().contains(&query))
            .collect()
    }
}

/// Walks the three rating directories, collecting final files and `.tmp`
/// partials. Files are returned newest first.
#[instrument(fields(base_dir = %base_dir.display()))]
#[must_use]
pub fn scan_library(base_dir: &Path) -> LibraryScan {
    let mut scan = LibraryScan::default();

    for rating in Rating::ALL {
        let folder = base_dir.join(rating.folder_name());
        let Ok(entries) = std::fs::read_dir(&folder) else {
            continue;
        };

        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };

            if name.ends_with(".tmp") {
                if let Some(id) = parse_post_id(name.trim_end_matches(".tmp")) {
                    scan.orphans.push(OrphanPartial {
                        path: path.clone(),
                        id,
                        folder: rating,
                    });
                }
                continue;
            }

            let extension = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !SUPPORTED_FORMATS.contains(&extension.as_str()) {
                continue;
            }

            let Ok(metadata) = entry.metadata() else {
                debug!(path = %path.display(), "unreadable metadata, skipping");
                continue;
            };

            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (id, tags) = match stem.split_once('_') {
                Some((id, tags)) => (id.to_string(), tags.replace('_', " ")),
                None => (stem.clone(), String::new()),
            };

            scan.downloaded.insert(id.clone());
            scan.files.push(LibraryFile {
                path,
                filename: name,
                category: rating,
                id,
                tags,
                size: metadata.len(),
                mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }

    scan.files.sort_by(|a, b| b.mtime.cmp(&a.mtime));
    debug!(
        files = scan.files.len(),
        orphans = scan.orphans.len(),
        "library scan finished"
    );
    scan
}

fn parse_post_id(name: &str) -> Option<String> {
    // "123_tags.jpg" or "123.jpg" -> "123"
    let stem = name.split('.').next().unwrap_or(name);
    let id = stem.split('_').next().unwrap_or(stem);
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

/// What recovery submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Orphan partials handed to `submit_resume`.
    pub orphans_resumed: usize,
    /// Missing favorites re-submitted from their stored URL.
    pub resubmitted: usize,
    /// Missing favorites without a stored URL, refetched via the API.
    pub refetched: usize,
}

/// Reconciles favorites against the on-disk library.
///
/// For every favorite, after this returns either a final file exists, a
/// `.tmp` partial is being resumed, or a download task has been queued.
/// Submission is non-blocking; the downloader's pool throttles the actual
/// transfers.
#[instrument(skip(manager, favorites, scan), fields(favorites = favorites.len()))]
pub fn recover_favorites(
    manager: &DownloadManager,
    favorites: &HashMap<String, FavoriteEntry>,
    scan: &LibraryScan,
    base_dir: &Path,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    // Orphan partials resume regardless of favorite membership; the byte
    // ranges already on disk are picked up automatically.
    let mut resuming: HashSet<String> = HashSet::new();
    for orphan in &scan.orphans {
        manager.submit_resume(&orphan.id, orphan.folder, base_dir, DownloadCallbacks::default());
        resuming.insert(orphan.id.clone());
        report.orphans_resumed += 1;
    }

    for (post_id, entry) in favorites {
        if scan.downloaded.contains(post_id) || resuming.contains(post_id) {
            continue;
        }

        match entry.file_url.as_deref().filter(|u| !u.is_empty()) {
            Some(_) => {
                // Enough stored state to skip the API round trip.
                let mut post = Post::with_id(entry.id);
                post.rating = entry.rating;
                post.tags = entry.tags.clone();
                post.file_url = entry.file_url.clone();
                if manager
                    .submit_download(post, base_dir, DownloadCallbacks::default())
                    .is_some()
                {
                    report.resubmitted += 1;
                }
            }
            None => {
                manager.submit_resume(
                    post_id,
                    entry.rating,
                    base_dir,
                    DownloadCallbacks::default(),
                );
                report.refetched += 1;
            }
        }
    }

    if report != RecoveryReport::default() {
        info!(
            orphans = report.orphans_resumed,
            resubmitted = report.resubmitted,
            refetched = report.refetched,
            "favorites recovery submitted"
        );
    } else {
        debug!("favorites recovery: nothing to do");
    }
    report
}
