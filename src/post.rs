//! Post descriptors - the unit of traffic from the remote service.
//!
//! A [`Post`] carries the metadata and asset URLs the core consumes. Unknown
//! fields are preserved verbatim so persisted state round-trips without loss.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maturity classification of a post's content.
///
/// The wire format uses single-letter codes (`"s"`, `"q"`, `"e"`); anything
/// else is treated as [`Rating::Questionable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Rating {
    /// Safe for general viewing.
    Safe,
    /// Possibly not safe.
    Questionable,
    /// Explicit content.
    Explicit,
}

impl Rating {
    /// Returns the single-letter wire code.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Safe => "s",
            Self::Questionable => "q",
            Self::Explicit => "e",
        }
    }

    /// Returns the library folder name for this rating.
    #[must_use]
    pub fn folder_name(self) -> &'static str {
        match self {
            Self::Safe => "Safe",
            Self::Questionable => "Questionable",
            Self::Explicit => "Explicit",
        }
    }

    /// Parses a library folder name back into a rating.
    #[must_use]
    pub fn from_folder_name(name: &str) -> Option<Self> {
        match name {
            "Safe" => Some(Self::Safe),
            "Questionable" => Some(Self::Questionable),
            "Explicit" => Some(Self::Explicit),
            _ => None,
        }
    }

    /// All ratings, in library folder order.
    pub const ALL: [Self; 3] = [Self::Safe, Self::Questionable, Self::Explicit];
}

impl From<String> for Rating {
    fn from(code: String) -> Self {
        match code.as_str() {
            "s" => Self::Safe,
            "e" => Self::Explicit,
            // Unknown codes default to Questionable rather than failing
            // deserialization of the whole descriptor.
            _ => Self::Questionable,
        }
    }
}

impl From<Rating> for String {
    fn from(rating: Rating) -> Self {
        rating.code().to_string()
    }
}

impl Default for Rating {
    fn default() -> Self {
        Self::Questionable
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.folder_name())
    }
}

/// Descriptor of a remote post.
///
/// Only the fields the core reads are typed; everything else the service
/// returns lands in `extra` and is written back out unchanged when the
/// descriptor is persisted. Two posts are equal iff their ids match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    /// Unique non-negative identifier. Stringified for all cache/task keys.
    pub id: u64,

    /// Content maturity classification.
    #[serde(default)]
    pub rating: Rating,

    /// Full-resolution asset URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,

    /// Medium-size asset URL, preferred for preloading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_url: Option<String>,

    /// Small preview URL, preload fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,

    /// Whitespace-joined tag list, used only for file naming.
    #[serde(default)]
    pub tags: String,

    /// Community score, used for filtering and ordering.
    #[serde(default)]
    pub score: i64,

    /// Pixel width of the full asset.
    #[serde(default)]
    pub width: u32,

    /// Pixel height of the full asset.
    #[serde(default)]
    pub height: u32,

    /// Size of the full asset in bytes (informational).
    #[serde(default)]
    pub file_size: u64,

    /// Fields the core does not interpret, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Post {
    /// Creates a minimal descriptor with the given id.
    #[must_use]
    pub fn with_id(id: u64) -> Self {
        Self {
            id,
            rating: Rating::default(),
            file_url: None,
            sample_url: None,
            preview_url: None,
            tags: String::new(),
            score: 0,
            width: 0,
            height: 0,
            file_size: 0,
            extra: Map::new(),
        }
    }

    /// Returns the stringified id used as cache, task, and event key.
    #[must_use]
    pub fn key(&self) -> String {
        self.id.to_string()
    }

    /// Returns the preferred preload URL: `sample_url`, else `preview_url`.
    #[must_use]
    pub fn preload_url(&self) -> Option<&str> {
        self.sample_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or_else(|| self.preview_url.as_deref().filter(|u| !u.is_empty()))
    }
}

impl PartialEq for Post {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Post {}

impl std::hash::Hash for Post {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
