//! Failure classification and exponential backoff for download attempts.
//!
//! Each failed attempt is classified into a [`FailureType`]; the
//! [`RetryPolicy`] then decides whether another attempt is worthwhile and
//! how long to wait. Backoff doubles per attempt with jitter, capped at one
//! minute.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::error::DownloadError;
use crate::session::SessionError;

/// Default attempts per download (including the first).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Backoff cap between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Maximum jitter added to each delay.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of a failed download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed on retry: timeouts, connection resets, 5xx, 429, and
    /// integrity mismatches (the resume path repairs short streams).
    Transient,

    /// Will not succeed on retry: 404/410, validation failures, refused
    /// redirects.
    Permanent,

    /// The task's token or the manager shutdown flag was set.
    Cancelled,

    /// A local resource limit tripped (disk guard); retrying without
    /// operator action would fail identically.
    ResourceExhausted,
}

/// Decision for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    Retry {
        /// Wait before the next attempt.
        delay: Duration,
        /// 1-indexed number of the upcoming attempt.
        attempt: u32,
    },
    /// Stop; the reason feeds the terminal error.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Exponential backoff policy for the downloader's attempt loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget and base delay.
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
        }
    }

    /// Total attempts allowed, including the first.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decides whether the attempt that just failed should be repeated.
    ///
    /// `attempt` is 1-indexed: the first failed attempt passes 1.
    #[must_use]
    pub fn should_retry(&self, failure: FailureType, attempt: u32) -> RetryDecision {
        match failure {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure".to_string(),
                };
            }
            FailureType::Cancelled => {
                return RetryDecision::DoNotRetry {
                    reason: "cancelled".to_string(),
                };
            }
            FailureType::ResourceExhausted => {
                return RetryDecision::DoNotRetry {
                    reason: "resource limit".to_string(),
                };
            }
            FailureType::Transient => {}
        }

        if attempt >= self.max_retries {
            debug!(attempt, max = self.max_retries, "retry budget exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_retries),
            };
        }

        RetryDecision::Retry {
            delay: self.delay_for(attempt),
            attempt: attempt + 1,
        }
    }

    /// `min(base * 2^(attempt-1), 60s)` plus jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(MAX_BACKOFF);
        let jitter_ms = rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64);
        doubled + Duration::from_millis(jitter_ms)
    }
}

/// Classifies a download error for the retry decision.
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::Validation { .. } => FailureType::Permanent,
        DownloadError::Redirect { .. } => FailureType::Permanent,
        DownloadError::Cancelled { .. } => FailureType::Cancelled,
        DownloadError::DiskGuard { .. } => FailureType::ResourceExhausted,
        // Short or over-long streams are repaired by the resume path.
        DownloadError::Integrity { .. } => FailureType::Transient,
        DownloadError::Io { .. } => FailureType::Transient,
        DownloadError::RetriesExhausted { .. } => FailureType::Permanent,
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),
        DownloadError::Session(session) => match session {
            SessionError::Closed => FailureType::Cancelled,
            SessionError::Timeout { .. } | SessionError::Network { .. } => FailureType::Transient,
            SessionError::Build(_) => FailureType::Permanent,
        },
    }
}

/// Status-code classification.
///
/// | Status | Type | |
/// |--------|------|---|
/// | 404, 410 | Permanent | asset gone |
/// | 408, 429 | Transient | timeout / rate limit |
/// | 5xx | Transient | server trouble |
/// | other 4xx | Permanent | request will not improve |
#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        404 => FailureType::Permanent,
        410 => FailureType::Permanent,
        408 => FailureType::Transient,
        429 => FailureType::Transient,
        status if (500..600).contains(&status) => FailureType::Transient,
        status if (400..500).contains(&status) => FailureType::Permanent,
        _ => FailureType::Permanent,
    }
}
