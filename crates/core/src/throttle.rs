use std::time::Duration;

use camstream_protocol::ErrorThrottleConfig;
use tracing::{error, warn};

/// Wraps the encoded pipeline's error-reporting callback with an
/// exponential-backoff log/retry policy (§4.5). A burst of identical
/// errors logs once and then backs off with `sleep = min(base * 2^(n-1),
/// max)`, capped at `max_attempts`. A different error kind resets the
/// counter.
pub struct ErrorThrottle {
    config: ErrorThrottleConfig,
    last_kind: Option<String>,
    attempts: u32,
}

/// What the caller should do after reporting an error through the throttle.
pub enum ThrottleAction {
    /// Logged; sleep for this long before retrying.
    Backoff(Duration),
    /// `max_attempts` exceeded for this error kind; the pipeline should
    /// surface the error to its caller as fatal.
    Fatal,
}

impl ErrorThrottle {
    pub fn new(config: ErrorThrottleConfig) -> Self {
        Self {
            config,
            last_kind: None,
            attempts: 0,
        }
    }

    /// Report an error of the given kind (a short, stable tag -- not the
    /// full error message, so that transient detail doesn't defeat
    /// de-duplication).
    pub fn record(&mut self, kind: &str, detail: &str) -> ThrottleAction {
        let same_kind = self.last_kind.as_deref() == Some(kind);
        if same_kind {
            self.attempts += 1;
        } else {
            self.last_kind = Some(kind.to_string());
            self.attempts = 1;
        }

        if self.attempts > self.config.max_attempts {
            error!(kind, detail, attempts = self.attempts, "error throttle exhausted, surfacing as fatal");
            return ThrottleAction::Fatal;
        }

        let delay_ms = self
            .config
            .base_ms
            .saturating_mul(1u64 << (self.attempts.saturating_sub(1)).min(32))
            .min(self.config.max_ms);

        if self.attempts == 1 {
            warn!(kind, detail, "encoded pipeline error");
        } else {
            tracing::debug!(kind, detail, attempts = self.attempts, delay_ms, "encoded pipeline error (throttled)");
        }

        ThrottleAction::Backoff(Duration::from_millis(delay_ms))
    }
}
