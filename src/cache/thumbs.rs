//! Two-tier thumbnail cache: in-memory LRU over a content-addressed disk
//! tier.
//!
//! Keys hash every input that determines the rendered thumbnail (source
//! path, mtime, file size, target size, device pixel ratio, schema
//! version), so any change invalidates automatically. Disk files live at
//! `cache_dir/thumb_cache_v{N}/{key}.webp` (PNG fallback) and are written
//! via temp file + rename. A single-flight cleanup pass keeps the disk tier
//! bounded, deleting oldest-accessed files first.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use image::{DynamicImage, ImageFormat};
use md5::{Digest, Md5};
use tracing::{debug, warn};

use super::LruCache;

/// Disk schema version; bumping it orphans (and thus invalidates) every
/// previously written thumbnail file.
pub const THUMB_CACHE_VERSION: u32 = 1;

/// Default memory-tier entry budget.
pub const DEFAULT_MEMORY_ENTRIES: usize = 150;

/// Default disk-tier file budget.
pub const DEFAULT_MAX_DISK_ITEMS: usize = 2000;

/// Extensions probed on a disk lookup, preferred first.
const DISK_EXTENSIONS: [&str; 3] = ["webp", "jpg", "png"];

/// Tuning for a [`ThumbnailCache`].
#[derive(Debug, Clone)]
pub struct ThumbOptions {
    /// Memory-tier entry budget.
    pub memory_entries: usize,
    /// Disk-tier file budget.
    pub max_disk_items: usize,
    /// Longest-side target of rendered thumbnails, in logical pixels.
    pub target_size: u32,
    /// Display scale factor baked into the key.
    pub device_pixel_ratio: f32,
}

impl Default for ThumbOptions {
    fn default() -> Self {
        Self {
            memory_entries: DEFAULT_MEMORY_ENTRIES,
            max_disk_items: DEFAULT_MAX_DISK_ITEMS,
            target_size: 200,
            device_pixel_ratio: 1.0,
        }
    }
}

/// Computes the content-addressed cache key.
///
/// The key is `MD5(abs_path:mtime_ns:file_size:target:dpr:version)` in hex;
/// identity of the key implies identity of the rendered thumbnail.
#[must_use]
pub fn cache_key(
    path: &Path,
    mtime: SystemTime,
    file_size: u64,
    target_size: u32,
    device_pixel_ratio: f32,
) -> String {
    let mtime_ns = mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let input = format!(
        "{}:{}:{}:{}:{}:{}",
        path.display(),
        mtime_ns,
        file_size,
        target_size,
        device_pixel_ratio,
        THUMB_CACHE_VERSION
    );
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Per-view nonce used to discard results from superseded thumbnail loads.
///
/// The view bumps the generation when its contents change; a worker that
/// finishes with a stale generation drops its result instead of delivering.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    current: AtomicU64,
}

impl GenerationCounter {
    /// Creates a counter at generation zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new generation and returns it.
    pub fn next(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The generation in effect.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Whether a worker's generation is still the live one.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }
}

/// Two-tier cache of rendered thumbnail bitmaps.
#[derive(Debug)]
pub struct ThumbnailCache {
    memory: LruCache<DynamicImage>,
    disk_dir: PathBuf,
    options: ThumbOptions,
    cleanup_pending: Arc<AtomicBool>,
}

impl ThumbnailCache {
    /// Creates the cache rooted at `cache_dir` (the versioned subdirectory
    /// is created lazily on first write).
    #[must_use]
    pub fn new(cache_dir: &Path, options: ThumbOptions) -> Self {
        Self {
            memory: LruCache::new(options.memory_entries),
            disk_dir: cache_dir.join(format!("thumb_cache_v{THUMB_CACHE_VERSION}")),
            options,
            cleanup_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The versioned disk directory.
    #[must_use]
    pub fn disk_dir(&self) -> &Path {
        &self.disk_dir
    }

    fn key_for(&self, path: &Path, mtime: SystemTime, file_size: u64) -> String {
        cache_key(
            path,
            mtime,
            file_size,
            self.options.target_size,
            self.options.device_pixel_ratio,
        )
    }

    /// Looks up a thumbnail: memory first, then disk.
    ///
    /// A disk hit is promoted into memory and its access time refreshed so
    /// the cleanup pass sees it as recently used.
    #[must_use]
    pub fn get(
        &self,
        path: &Path,
        mtime: SystemTime,
        file_size: u64,
    ) -> Option<Arc<DynamicImage>> {
        let key = self.key_for(path, mtime, file_size);

        if let Some(hit) = self.memory.get(&key) {
            return Some(hit);
        }

        for ext in DISK_EXTENSIONS {
            let candidate = self.disk_dir.join(format!("{key}.{ext}"));
            if !candidate.is_file() {
                continue;
            }
            match image::open(&candidate) {
                Ok(decoded) => {
                    let shared = Arc::new(decoded);
                    self.memory.put_arc(&key, Arc::clone(&shared));
                    touch_atime(&candidate);
                    debug!(key = %key, ext, "thumbnail disk hit");
                    return Some(shared);
                }
                Err(err) => {
                    // A corrupt cache file is just a miss; remove it so it
                    // stops shadowing the webp/png fallback order.
                    warn!(path = %candidate.display(), error = %err, "corrupt thumbnail, removing");
                    let _ = std::fs::remove_file(&candidate);
                }
            }
        }

        None
    }

    /// Stores a rendered thumbnail in both tiers and schedules a disk
    /// cleanup pass if one is not already pending.
    pub fn put(
        &self,
        path: &Path,
        mtime: SystemTime,
        file_size: u64,
        thumbnail: DynamicImage,
    ) {
        let key = self.key_for(path, mtime, file_size);
        let shared = Arc::new(thumbnail);
        self.memory.put_arc(&key, Arc::clone(&shared));

        if let Err(err) = self.write_disk(&key, &shared) {
            warn!(key = %key, error = %err, "thumbnail disk write failed");
        }

        self.schedule_cleanup();
    }

    fn write_disk(&self, key: &str, thumbnail: &DynamicImage) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.disk_dir)?;

        let (bytes, ext) = encode_thumbnail(thumbnail)?;
        let target = self.disk_dir.join(format!("{key}.{ext}"));
        let temp = self.disk_dir.join(format!(".{key}.{}.tmp", std::process::id()));

        std::fs::write(&temp, &bytes)?;
        match std::fs::rename(&temp, &target) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = std::fs::remove_file(&temp);
                Err(err)
            }
        }
    }

    /// Kicks off the disk-cleanup pass unless one is already pending.
    fn schedule_cleanup(&self) {
        if self.cleanup_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let dir = self.disk_dir.clone();
        let max_items = self.options.max_disk_items;
        let pending = Arc::clone(&self.cleanup_pending);
        std::thread::spawn(move || {
            cleanup_disk_tier(&dir, max_items);
            pending.store(false, Ordering::SeqCst);
        });
    }

    /// Runs the cleanup pass synchronously (used by tests and shutdown).
    pub fn cleanup_now(&self) {
        cleanup_disk_tier(&self.disk_dir, self.options.max_disk_items);
    }

    /// Memory-tier statistics.
    #[must_use]
    pub fn memory_stats(&self) -> super::CacheStats {
        self.memory.stats()
    }
}

/// Encodes a thumbnail as lossless WebP, falling back to PNG.
fn encode_thumbnail(thumbnail: &DynamicImage) -> std::io::Result<(Vec<u8>, &'static str)> {
    let rgba = thumbnail.to_rgba8();

    let mut webp = Vec::new();
    let encoder = image::codecs::webp::WebPEncoder::new_lossless(Cursor::new(&mut webp));
    if encoder
        .encode(
            rgba.as_raw(),
            rgba.width(),
            rgba.height(),
            image::ExtendedColorType::Rgba8,
        )
        .is_ok()
    {
        return Ok((webp, "webp"));
    }

    let mut png = Vec::new();
    DynamicImage::ImageRgba8(rgba)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(std::io::Error::other)?;
    Ok((png, "png"))
}

fn touch_atime(path: &Path) {
    let now = filetime::FileTime::now();
    if let Err(err) = filetime::set_file_atime(path, now) {
        debug!(path = %path.display(), error = %err, "atime touch failed");
    }
}

/// Deletes oldest-accessed files until at most `max_items` remain.
fn cleanup_disk_tier(dir: &Path, max_items: usize) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    let mut files: Vec<(PathBuf, SystemTime)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let path = entry.path();
            if !path.is_file() {
                return None;
            }
            let accessed = entry
                .metadata()
                .and_then(|m| m.accessed().or_else(|_| m.modified()))
                .unwrap_or(UNIX_EPOCH);
            Some((path, accessed))
        })
        .collect();

    if files.len() <= max_items {
        return;
    }

    files.sort_by_key(|(_, accessed)| *accessed);
    let excess = files.len() - max_items;
    let mut removed = 0usize;
    for (path, _) in files.into_iter().take(excess) {
        if std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    debug!(dir = %dir.display(), removed, "thumbnail cleanup pass finished");
}
