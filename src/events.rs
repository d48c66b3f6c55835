//! Process-wide typed publish/subscribe event bus.
//!
//! Components publish lifecycle events (downloads, preloads, cache updates,
//! UI state changes) and subscribe by event kind. Dispatch is synchronous on
//! the publisher's thread, in subscription order; a panicking subscriber is
//! isolated, logged, and counted, never propagated.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Closed set of event kinds the core publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A full image finished loading into the viewer.
    ImageLoaded,
    /// An image failed to load.
    ImageFailed,
    /// The preloader warmed the cache with an image.
    ImagePreloaded,
    /// A download task was registered and scheduled.
    DownloadStarted,
    /// Periodic download progress.
    DownloadProgress,
    /// A download reached its final file.
    DownloadCompleted,
    /// A download failed terminally.
    DownloadFailed,
    /// A download was cancelled.
    DownloadCancelled,
    /// The current post changed.
    PostChanged,
    /// The browse mode changed.
    ModeChanged,
    /// The window was resized.
    WindowResized,
    /// Fullscreen was toggled.
    FullscreenToggled,
    /// The visible view changed.
    ViewChanged,
    /// A cache was updated.
    CacheUpdated,
    /// Filter settings changed.
    FilterChanged,
    /// User settings changed.
    SettingsChanged,
    /// The application is shutting down.
    AppShutdown,
}

/// A published event: kind, free-form payload, timestamp, and a short id.
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Free-form payload map.
    pub payload: Map<String, Value>,
    /// Milliseconds since the Unix epoch at publish-construction time.
    pub timestamp_ms: u64,
    /// Short unique id, monotonic within the process.
    pub id: String,
}

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

impl Event {
    /// Creates an event with an empty payload.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        let seq = EVENT_SEQ.fetch_add(1, Ordering::Relaxed);
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            kind,
            payload: Map::new(),
            timestamp_ms,
            id: format!("evt-{seq}"),
        }
    }

    /// Adds a payload entry, builder-style.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Convenience accessor for string payload values.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: u64,
    kind: EventKind,
    owner: Option<String>,
    active: Arc<AtomicBool>,
    handler: Handler,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct BusInner {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    errored: AtomicU64,
}

/// Counters observable via [`EventBus::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBusStats {
    /// Events passed to `publish`.
    pub published: u64,
    /// Successful handler invocations.
    pub delivered: u64,
    /// Handler invocations that panicked.
    pub errored: u64,
}

/// Owns a subscription's lifetime.
///
/// `dispose()` is idempotent; once it returns, the handler is never invoked
/// for an event dispatched afterwards. Dropping the token without disposing
/// leaves the subscription active; use [`EventBus::unsubscribe_all`] for
/// bulk cleanup by owner.
#[derive(Debug)]
pub struct SubscriptionToken {
    id: u64,
    active: Arc<AtomicBool>,
    // Weak so tokens never keep a dropped bus alive.
    bus: Weak<BusInner>,
}

impl SubscriptionToken {
    /// Cancels the subscription. Idempotent.
    pub fn dispose(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(bus) = self.bus.upgrade() {
            let mut subs = bus
                .subscriptions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            subs.retain(|s| s.id != self.id);
        }
    }

    /// Whether the subscription is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Typed publish/subscribe registry.
///
/// Clones share the same underlying registry. The process-wide instance is
/// available through [`EventBus::global`]; tests construct their own with
/// [`EventBus::new`].
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Creates an independent bus (used by tests and embedders).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide bus, created on first use.
    pub fn global() -> &'static EventBus {
        static GLOBAL: OnceLock<EventBus> = OnceLock::new();
        GLOBAL.get_or_init(EventBus::new)
    }

    /// Subscribes a handler to one event kind.
    ///
    /// The optional `owner` tags the subscription for
    /// [`unsubscribe_all`](Self::unsubscribe_all).
    pub fn subscribe<F>(&self, kind: EventKind, handler: F, owner: Option<&str>) -> SubscriptionToken
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let subscription = Subscription {
            id,
            kind,
            owner: owner.map(ToString::to_string),
            active: Arc::clone(&active),
            handler: Arc::new(handler),
        };

        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(subscription);

        debug!(?kind, id, owner, "subscribed");
        SubscriptionToken {
            id,
            active,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Removes every subscription tagged with `owner` atomically.
    ///
    /// Returns the number removed.
    pub fn unsubscribe_all(&self, owner: &str) -> usize {
        let mut subs = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| {
            let matches = s.owner.as_deref() == Some(owner);
            if matches {
                s.active.store(false, Ordering::SeqCst);
            }
            !matches
        });
        let removed = before - subs.len();
        debug!(owner, removed, "unsubscribed by owner");
        removed
    }

    /// Dispatches an event synchronously, in subscription order.
    ///
    /// A panicking subscriber is caught, logged, and counted; delivery to
    /// the remaining subscribers continues.
    pub fn publish(&self, event: &Event) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot matching handlers so subscribers may (un)subscribe from
        // within their own callback without deadlocking.
        let matching: Vec<(Arc<AtomicBool>, Handler)> = {
            let subs = self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            subs.iter()
                .filter(|s| s.kind == event.kind)
                .map(|s| (Arc::clone(&s.active), Arc::clone(&s.handler)))
                .collect()
        };

        for (active, handler) in matching {
            // A token disposed between the snapshot and this point must not
            // be invoked.
            if !active.load(Ordering::SeqCst) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => {
                    self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(panic) => {
                    self.inner.errored.fetch_add(1, Ordering::Relaxed);
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".to_string());
                    warn!(kind = ?event.kind, event_id = %event.id, %message, "subscriber panicked");
                }
            }
        }
    }

    /// Returns dispatch counters.
    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            errored: self.inner.errored.load(Ordering::Relaxed),
        }
    }

    /// Number of live subscriptions (all kinds).
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
