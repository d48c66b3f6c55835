//! Cooperative cancellation tokens.
//!
//! A [`CancellationToken`] is a latching, level-triggered signal with an
//! optional reason string. Once set it stays set; workers poll it at every
//! chunk boundary and before every retry, and may also `await` it.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Latching cancellation signal shared between a task owner and its workers.
///
/// Cancellation is monotonic: once `is_cancelled()` has been observed `true`,
/// every subsequent observation on the same token is also `true`.
///
/// # Example
///
/// ```
/// use booruview_core::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// assert!(!token.is_cancelled());
/// token.cancel("user requested");
/// assert!(token.is_cancelled());
/// assert_eq!(token.reason().as_deref(), Some("user requested"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a fresh, unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with the given reason.
    ///
    /// Idempotent and non-blocking. The first caller's reason is kept;
    /// later calls are no-ops.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut slot = self
                .inner
                .reason
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        // Reason is published before the flag so observers of the flag
        // always see a reason.
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if cancellation was requested.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Resolves once cancellation is requested.
    ///
    /// Returns immediately if the token is already set.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after registering interest to close the set-before-wait
            // race.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_cancel_is_monotonic() {
        let token = CancellationToken::new();
        token.cancel("first");
        for _ in 0..100 {
            assert!(token.is_cancelled());
        }
    }

    #[test]
    fn test_cancel_keeps_first_reason() {
        let token = CancellationToken::new();
        token.cancel("first");
        token.cancel("second");
        assert_eq!(token.reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        token.cancel("shared");
        assert!(other.is_cancelled());
        assert_eq!(other.reason().as_deref(), Some("shared"));
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancellationToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("done waiting");

        let resolved = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(resolved);
    }

    #[tokio::test]
    async fn test_cancelled_future_immediate_when_set() {
        let token = CancellationToken::new();
        token.cancel("pre-set");
        // Must not hang.
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_concurrent_observers_see_monotonic_state() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let token = CancellationToken::new();
        let seen_true_then_false = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let token = token.clone();
            let violations = Arc::clone(&seen_true_then_false);
            handles.push(std::thread::spawn(move || {
                let mut observed = false;
                for _ in 0..10_000 {
                    let now = token.is_cancelled();
                    if observed && !now {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    observed = now;
                }
            }));
        }

        std::thread::sleep(Duration::from_millis(1));
        token.cancel("racing");

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(seen_true_then_false.load(Ordering::SeqCst), 0);
    }
}
