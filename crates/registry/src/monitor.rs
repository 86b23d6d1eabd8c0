//! Camera monitor: the registry-level periodic sweep that removes streams
//! whose cameras have disappeared from the robot (§4.4). A background
//! Tokio task distinct from both the per-stream event loop and the
//! per-subscription watcher (§5, worker classes).

use std::sync::Arc;
use std::time::Duration;

use camstream_core::CameraLookupError;
use tokio::sync::Notify;

use crate::log_throttle::SweepLogThrottle;
use crate::server::Registry;

/// Owns the sweeper task's lifecycle. `spawn` returns a handle whose
/// `JoinHandle` the server should join as part of its own shutdown, after
/// signalling `shutdown`.
pub struct CameraMonitor {
    registry: Arc<Registry>,
    sweep_interval: Duration,
    shutdown: Arc<Notify>,
}

impl CameraMonitor {
    pub fn new(registry: Arc<Registry>) -> Self {
        let sweep_interval = Duration::from_millis(registry.config().sweep_interval_ms);
        Self {
            registry,
            sweep_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// A clone of the shutdown signal the spawned task listens on. Kept
    /// separate from `spawn`'s consumption of `self` so a caller can signal
    /// it after the task is already running.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let rewarn_interval_ms = self.registry.config().rewarn_interval_ms;
        tokio::spawn(async move {
            let mut throttle = SweepLogThrottle::new(rewarn_interval_ms);
            let mut ticker = tokio::time::interval(self.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => break,
                    _ = ticker.tick() => {
                        self.sweep(&mut throttle).await;
                    }
                }
            }
        })
    }

    async fn sweep(&self, throttle: &mut SweepLogThrottle) {
        let snapshot = self.registry.stream_camera_snapshot().await;
        for (name, camera_name) in snapshot {
            if self.registry.is_audio(&camera_name) {
                continue; // audio inputs are never subject to camera-not-found removal
            }
            match self.registry.robot().camera(&camera_name) {
                Ok(_) => throttle.clear(&camera_name),
                Err(CameraLookupError::Transient(_, detail)) => {
                    throttle.record_transient(&camera_name, &detail);
                }
                Err(CameraLookupError::NotFound(_)) => {
                    self.registry.remove_and_close_stream(&name).await;
                }
            }
        }
    }
}
