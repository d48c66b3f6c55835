//! Persisted viewer state and the browse queue/history.
//!
//! Each state file is a small JSON document managed by the atomic store and
//! flushed after every user action: `viewed.json`, `favorites.json`,
//! `browse_history.json`, `session.json`, `user_settings.json`.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::post::{Post, Rating};
use crate::store::{self, StoreError};

/// File name of the viewed-ids list.
pub const VIEWED_FILE: &str = "viewed.json";
/// File name of the favorites map.
pub const FAVORITES_FILE: &str = "favorites.json";
/// File name of the browse history.
pub const HISTORY_FILE: &str = "browse_history.json";
/// File name of the session pointer.
pub const SESSION_FILE: &str = "session.json";
/// File name of the user settings.
pub const SETTINGS_FILE: &str = "user_settings.json";

/// One favorited post, persisted in `favorites.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FavoriteEntry {
    /// Post id.
    pub id: u64,
    /// Tag string at the time of favoriting.
    #[serde(default)]
    pub tags: String,
    /// Rating at the time of favoriting.
    #[serde(default)]
    pub rating: Rating,
    /// Stored asset URL, used to re-download without an API round trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Seconds since the Unix epoch when favorited.
    #[serde(default)]
    pub added_at: u64,
}

impl FavoriteEntry {
    /// Builds an entry from a post, stamped now.
    #[must_use]
    pub fn from_post(post: &Post) -> Self {
        Self {
            id: post.id,
            tags: post.tags.clone(),
            rating: post.rating,
            file_url: post.file_url.clone(),
            added_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

/// Where the user left off, persisted in `session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    /// Browse mode label.
    pub mode: String,
    /// Current listing page.
    pub page: u32,
    /// Index into the browse history, -1 when empty.
    pub history_index: i64,
    /// Total posts viewed.
    pub viewed_count: u64,
    /// Last post shown, if any.
    pub last_viewed_id: Option<u64>,
    /// Seconds since the Unix epoch at save time.
    pub timestamp: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            mode: "browse".to_string(),
            page: 1,
            history_index: -1,
            viewed_count: 0,
            last_viewed_id: None,
            timestamp: 0,
        }
    }
}

/// Content filter preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Posts below this score are hidden.
    pub min_score: i64,
    /// Ratings the user wants to see.
    pub allowed_ratings: Vec<Rating>,
    /// Posts carrying any of these tags are hidden.
    pub blocked_tags: Vec<String>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            min_score: 0,
            allowed_ratings: Rating::ALL.to_vec(),
            blocked_tags: Vec::new(),
        }
    }
}

/// Performance preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    /// Posts preloaded around the current position.
    pub preload_count: usize,
    /// Preload worker pool size.
    pub preload_workers: usize,
    /// LRU entry budget.
    pub max_image_cache: usize,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            preload_count: 15,
            preload_workers: 8,
            max_image_cache: 50,
        }
    }
}

/// Interface preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiSettings {
    /// Start in fullscreen.
    pub fullscreen: bool,
    /// Show the info bar.
    pub show_info_bar: bool,
    /// Thumbnail edge length in logical pixels.
    pub thumbnail_size: u32,
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            fullscreen: false,
            show_info_bar: true,
            thumbnail_size: 200,
        }
    }
}

/// Versioned user settings, persisted in `user_settings.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    /// Schema version.
    #[serde(rename = "_version")]
    pub version: u32,
    /// Content filter.
    pub filter: FilterSettings,
    /// Performance knobs.
    pub performance: PerformanceSettings,
    /// Interface knobs.
    pub ui: UiSettings,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            version: 1,
            filter: FilterSettings::default(),
            performance: PerformanceSettings::default(),
            ui: UiSettings::default(),
        }
    }
}

/// The ordered deque of posts not yet shown plus the list already shown,
/// with an index at the current position. The preloader works relative to
/// this index.
#[derive(Debug, Clone)]
pub struct BrowseState {
    queue: VecDeque<Post>,
    history: Vec<Post>,
    /// Index into `history`; `None` while nothing has been shown.
    index: Option<usize>,
    max_history: usize,
}

impl BrowseState {
    /// Creates an empty browse state with the given history cap.
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            history: Vec::new(),
            index: None,
            max_history: max_history.max(1),
        }
    }

    /// Appends a fetched page to the pending queue, skipping posts already
    /// queued or in history.
    pub fn push_batch(&mut self, posts: Vec<Post>) -> usize {
        let mut added = 0;
        for post in posts {
            let seen = self.queue.iter().any(|p| p.id == post.id)
                || self.history.iter().any(|p| p.id == post.id);
            if !seen {
                self.queue.push_back(post);
                added += 1;
            }
        }
        added
    }

    /// Moves to the next post: forward within history if the user had gone
    /// back, otherwise pops the queue into history.
    pub fn advance(&mut self) -> Option<&Post> {
        if let Some(index) = self.index {
            if index + 1 < self.history.len() {
                self.index = Some(index + 1);
                return self.history.get(index + 1);
            }
        }

        let post = self.queue.pop_front()?;
        self.history.push(post);
        self.enforce_cap();
        self.index = Some(self.history.len() - 1);
        self.history.last()
    }

    /// Steps back within history.
    pub fn back(&mut self) -> Option<&Post> {
        let index = self.index?;
        if index == 0 {
            return None;
        }
        self.index = Some(index - 1);
        self.history.get(index - 1)
    }

    /// The post currently shown.
    #[must_use]
    pub fn current(&self) -> Option<&Post> {
        self.history.get(self.index?)
    }

    /// Current history index, -1 style for persistence.
    #[must_use]
    pub fn index(&self) -> i64 {
        self.index.map_or(-1, |i| i as i64)
    }

    /// The next `count` posts the user is likely to see (queue head).
    #[must_use]
    pub fn upcoming(&self, count: usize) -> Vec<Post> {
        self.queue.iter().take(count).cloned().collect()
    }

    /// Posts not yet shown.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Posts already shown, newest last.
    #[must_use]
    pub fn history(&self) -> &[Post] {
        &self.history
    }

    /// Restores history from a persisted list, clamping the index.
    pub fn restore_history(&mut self, posts: Vec<Post>, index: i64) {
        self.history = posts;
        self.enforce_cap();
        self.index = if self.history.is_empty() || index < 0 {
            None
        } else {
            Some((index as usize).min(self.history.len() - 1))
        };
    }

    fn enforce_cap(&mut self) {
        if self.history.len() > self.max_history {
            let overflow = self.history.len() - self.max_history;
            self.history.drain(..overflow);
            self.index = self
                .index
                .map(|i| i.saturating_sub(overflow));
        }
    }
}

/// Thin facade over the atomic store with the canonical file names.
#[derive(Debug, Clone)]
pub struct StateStore {
    base: PathBuf,
}

impl StateStore {
    /// Creates a store rooted at `base` (usually the app data directory).
    #[must_use]
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }

    /// Loads the viewed-ids list.
    #[must_use]
    pub fn load_viewed(&self) -> Vec<u64> {
        store::load_json(&self.path(VIEWED_FILE), Vec::new())
    }

    /// Persists the viewed-ids list.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    pub fn save_viewed(&self, viewed: &[u64]) -> Result<(), StoreError> {
        store::save_json(&self.path(VIEWED_FILE), &viewed)
    }

    /// Loads the favorites map.
    #[must_use]
    pub fn load_favorites(&self) -> HashMap<String, FavoriteEntry> {
        store::load_json(&self.path(FAVORITES_FILE), HashMap::new())
    }

    /// Persists the favorites map.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    pub fn save_favorites(
        &self,
        favorites: &HashMap<String, FavoriteEntry>,
    ) -> Result<(), StoreError> {
        store::save_json(&self.path(FAVORITES_FILE), favorites)
    }

    /// Loads the browse history, newest last.
    #[must_use]
    pub fn load_history(&self) -> Vec<Post> {
        store::load_json(&self.path(HISTORY_FILE), Vec::new())
    }

    /// Persists the browse history capped at `max_history` (newest kept).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    pub fn save_history(&self, history: &[Post], max_history: usize) -> Result<(), StoreError> {
        let start = history.len().saturating_sub(max_history);
        store::save_json(&self.path(HISTORY_FILE), &&history[start..])
    }

    /// Loads the session pointer.
    #[must_use]
    pub fn load_session(&self) -> SessionState {
        store::load_json(&self.path(SESSION_FILE), SessionState::default())
    }

    /// Persists the session pointer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    pub fn save_session(&self, session: &SessionState) -> Result<(), StoreError> {
        store::save_json(&self.path(SESSION_FILE), session)
    }

    /// Loads user settings.
    #[must_use]
    pub fn load_settings(&self) -> UserSettings {
        store::load_json(&self.path(SETTINGS_FILE), UserSettings::default())
    }

    /// Persists user settings.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    pub fn save_settings(&self, settings: &UserSettings) -> Result<(), StoreError> {
        store::save_json(&self.path(SETTINGS_FILE), settings)
    }
}
