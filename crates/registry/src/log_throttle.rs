//! Log-throttling for the sweeper's "camera unavailable" transient errors
//! (§4.2). A burst of identical errors demotes to debug after the first
//! occurrence; a changed error re-enters at warning, and a bounded
//! "re-warn" interval forces a re-warning even for an unchanged error so
//! operators don't lose track of a long-standing problem.

use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    last_detail: String,
    last_logged: Instant,
    warned_once: bool,
}

pub struct SweepLogThrottle {
    rewarn_interval: Duration,
    entries: HashMap<String, Entry>,
}

impl SweepLogThrottle {
    pub fn new(rewarn_interval_ms: u64) -> Self {
        Self {
            rewarn_interval: Duration::from_millis(rewarn_interval_ms),
            entries: HashMap::new(),
        }
    }

    /// Record a transient "camera unavailable" error for `camera`. Logs at
    /// warning on first occurrence, on a changed detail, or once the
    /// re-warn interval has elapsed since the last warning; otherwise logs
    /// at debug.
    pub fn record_transient(&mut self, camera: &str, detail: &str) {
        let now = Instant::now();
        let rewarn_interval = self.rewarn_interval;
        let entry = self.entries.entry(camera.to_string()).or_insert_with(|| Entry {
            last_detail: String::new(),
            last_logged: now - rewarn_interval,
            warned_once: false,
        });

        let changed = entry.last_detail != detail;
        let due = now.duration_since(entry.last_logged) >= rewarn_interval;

        if changed || !entry.warned_once || due {
            tracing::warn!(camera, detail, "camera transiently unavailable");
            entry.last_logged = now;
            entry.warned_once = true;
        } else {
            tracing::debug!(camera, detail, "camera transiently unavailable (throttled)");
        }
        entry.last_detail = detail.to_string();
    }

    /// Clears throttle state for a camera that's resolving again, so a
    /// future failure re-enters fresh at warning.
    pub fn clear(&mut self, camera: &str) {
        self.entries.remove(camera);
    }
}
