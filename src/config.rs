//! Application configuration: defaults, range clamping, JSON persistence.
//!
//! Out-of-range values are clamped with a warning rather than rejected, so a
//! hand-edited config file cannot brick startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store;

/// Download-specific tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Attempts per download before terminal failure.
    pub max_retries: u32,
    /// Per-request read timeout in seconds.
    pub timeout: u64,
    /// Base retry delay in seconds, doubled per attempt (capped at 60 s).
    pub retry_delay: f64,
    /// Streaming chunk size in bytes.
    pub chunk_size: usize,
    /// Per-download size limit in MiB.
    pub max_file_mb: u64,
    /// Minimum free space on the library volume in GiB.
    pub disk_min_free_gb: f64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: 30,
            retry_delay: 2.0,
            chunk_size: 8192,
            max_file_mb: 200,
            disk_min_free_gb: 1.0,
        }
    }
}

/// Application configuration consumed by the core components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Library root directory.
    pub base_dir: String,
    /// Remote listing endpoint. Must be HTTPS.
    pub api_url: String,
    /// Posts per page (1-1000).
    pub limit: u32,
    /// (connect, read) timeout in seconds.
    pub request_timeout: (u64, u64),
    /// Download worker pool size (1-10).
    pub max_download_workers: usize,
    /// Preload worker pool size.
    pub preload_workers: usize,
    /// Posts preloaded around the current position (1-50).
    pub preload_count: usize,
    /// LRU entry budget for decoded images (>= 10).
    pub max_image_cache: usize,
    /// LRU byte budget in MiB.
    pub max_memory_mb: u64,
    /// Browse history cap.
    pub max_browse_history: usize,
    /// Score at or above which a post counts as high-scoring.
    pub high_score_threshold: i64,
    /// Download tuning.
    pub download: DownloadConfig,
    /// Hard per-file ceiling in MiB, enforced by the downloader guard.
    pub max_file_mb: u64,
    /// Informational library size target in GiB.
    pub disk_max_gb: u64,
    /// URL schemes the validator accepts.
    pub allowed_schemes: Vec<String>,
    /// Hosts (and their subdomains) the validator accepts.
    pub allowed_hosts: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_dir: "love".to_string(),
            api_url: "https://yande.re/post.json".to_string(),
            limit: 100,
            request_timeout: (10, 30),
            max_download_workers: 3,
            preload_workers: 8,
            preload_count: 15,
            max_image_cache: 50,
            max_memory_mb: 500,
            max_browse_history: 500,
            high_score_threshold: 10,
            download: DownloadConfig::default(),
            max_file_mb: 512,
            disk_max_gb: 20,
            allowed_schemes: vec!["https".to_string()],
            allowed_hosts: vec!["yande.re".to_string(), "files.yande.re".to_string()],
        }
    }
}

impl AppConfig {
    /// Loads config from `path`, falling back to defaults on any problem,
    /// then clamps out-of-range values.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let mut config: Self = store::load_json(path, Self::default());
        config.clamp();
        config
    }

    /// Persists the config through the atomic store.
    ///
    /// # Errors
    ///
    /// Returns [`store::StoreError`] when the write fails.
    pub fn save(&self, path: &Path) -> Result<(), store::StoreError> {
        store::save_json(path, self)
    }

    /// Returns the library root as a path.
    #[must_use]
    pub fn base_path(&self) -> PathBuf {
        PathBuf::from(&self.base_dir)
    }

    /// Clamps every bounded field into its documented range, warning on
    /// each adjustment.
    pub fn clamp(&mut self) {
        clamp_field("limit", &mut self.limit, 1, 1000);
        clamp_field("max_download_workers", &mut self.max_download_workers, 1, 10);
        clamp_field("preload_workers", &mut self.preload_workers, 1, 32);
        clamp_field("preload_count", &mut self.preload_count, 1, 50);
        if self.max_image_cache < 10 {
            warn!(value = self.max_image_cache, "max_image_cache below 10, clamping");
            self.max_image_cache = 10;
        }
        if self.download.max_retries == 0 {
            warn!("download.max_retries of 0 clamped to 1");
            self.download.max_retries = 1;
        }
        if self.download.chunk_size == 0 {
            warn!("download.chunk_size of 0 clamped to 8192");
            self.download.chunk_size = 8192;
        }
        if !self.api_url.starts_with("https://") {
            warn!(api_url = %self.api_url, "api_url is not HTTPS, restoring default");
            self.api_url = Self::default().api_url;
        }
        if self.allowed_schemes.is_empty() {
            self.allowed_schemes = vec!["https".to_string()];
        }
    }
}

fn clamp_field<T>(name: &str, value: &mut T, min: T, max: T)
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    if *value < min {
        warn!(field = name, value = %*value, min = %min, "config value below range, clamping");
        *value = min;
    } else if *value > max {
        warn!(field = name, value = %*value, max = %max, "config value above range, clamping");
        *value = max;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.base_dir, "love");
        assert_eq!(config.limit, 100);
        assert_eq!(config.request_timeout, (10, 30));
        assert_eq!(config.max_download_workers, 3);
        assert_eq!(config.preload_workers, 8);
        assert_eq!(config.preload_count, 15);
        assert_eq!(config.max_image_cache, 50);
        assert_eq!(config.max_memory_mb, 500);
        assert_eq!(config.max_browse_history, 500);
        assert_eq!(config.high_score_threshold, 10);
        assert_eq!(config.max_file_mb, 512);
        assert_eq!(config.download.max_retries, 3);
        assert_eq!(config.download.chunk_size, 8192);
        assert!((config.download.retry_delay - 2.0).abs() < f64::EPSILON);
        assert!((config.download.disk_min_free_gb - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.allowed_schemes, vec!["https"]);
    }

    #[test]
    fn test_clamp_limits() {
        let mut config = AppConfig {
            limit: 5000,
            max_download_workers: 0,
            preload_count: 200,
            max_image_cache: 1,
            ..AppConfig::default()
        };
        config.clamp();
        assert_eq!(config.limit, 1000);
        assert_eq!(config.max_download_workers, 1);
        assert_eq!(config.preload_count, 50);
        assert_eq!(config.max_image_cache, 10);
    }

    #[test]
    fn test_clamp_rejects_plain_http_api_url() {
        let mut config = AppConfig {
            api_url: "http://yande.re/post.json".to_string(),
            ..AppConfig::default()
        };
        config.clamp();
        assert!(config.api_url.starts_with("https://"));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = AppConfig::load(&tmp.path().join("config.json"));
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");

        let mut config = AppConfig::default();
        config.limit = 250;
        config.download.max_retries = 5;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path);
        assert_eq!(loaded.limit, 250);
        assert_eq!(loaded.download.max_retries, 5);
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"limit": 42}"#).unwrap();

        let config = AppConfig::load(&path);
        assert_eq!(config.limit, 42);
        assert_eq!(config.preload_workers, 8);
    }

    #[test]
    fn test_load_clamps_out_of_range_file_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"limit": 0, "max_download_workers": 99}"#).unwrap();

        let config = AppConfig::load(&path);
        assert_eq!(config.limit, 1);
        assert_eq!(config.max_download_workers, 10);
    }
}
