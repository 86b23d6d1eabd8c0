//! Thin contracts `StreamState` calls into, plus reference implementations
//! (`frame_pipeline`, `channel_passthrough`) that exercise them end to end.

pub mod channel_passthrough;
pub mod frame_pipeline;
pub mod h264_payloader;

use std::sync::Arc;

use async_trait::async_trait;
use camstream_protocol::{Resolution, SubscriptionId};
use thiserror::Error;
use tokio::sync::Notify;
use webrtc::rtp::packet::Packet;

/// Cancellation signal owned by the camera, observed (never cancelled) by
/// the state machine. Fires once the subscription becomes invalid.
pub type TerminationSignal = Arc<Notify>;

/// Pull-based source: a loop that reads frames, encodes them, and writes
/// packets to the track. Restartable.
#[async_trait]
pub trait EncodedPipeline: Send + Sync {
    /// Idempotent with respect to repeated calls in the same state (§6).
    async fn start(&self) -> anyhow::Result<()>;

    /// Idempotent with respect to repeated calls in the same state (§6).
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Push-based source: already-encoded RTP packets delivered via callback.
#[async_trait]
pub trait PassthroughSource: Send + Sync {
    /// Must be safe to call concurrently with `unsubscribe`.
    async fn subscribe(
        &self,
        buffer_size: usize,
        on_packet: Box<dyn Fn(Packet) + Send + Sync>,
    ) -> Result<(SubscriptionId, TerminationSignal), PassthroughSubscribeError>;

    /// Idempotent; returns `UnknownSubscriptionId` if already gone.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), UnknownSubscriptionId>;
}

#[derive(Debug, Error, Clone)]
#[error("subscribe failed: {0}")]
pub struct PassthroughSubscribeError(pub String);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown subscription id {0}")]
pub struct UnknownSubscriptionId(pub SubscriptionId);

/// A hot-swappable handle to a camera's capabilities, as looked up by short
/// name. Either capability may be absent: a camera that only produces raw
/// frames has no `passthrough()`, and vice versa.
pub trait CameraHandle: Send + Sync {
    fn encoded(&self) -> Option<Arc<dyn EncodedPipeline>>;
    fn passthrough(&self) -> Option<Arc<dyn PassthroughSource>>;

    /// The camera's native capture resolution, used by the registry to
    /// compute `get_stream_options`'s down-scaling ladder.
    fn native_resolution(&self) -> Option<Resolution> {
        None
    }

    /// Install or clear a resizing wrapper around this camera's frame
    /// source. `None` restores the native resolution. The concrete
    /// resampling is a robot/camera-side concern; this trait only defines
    /// the hot-swap boundary the registry drives (§6).
    fn set_resolution(&self, _resolution: Option<Resolution>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Whether a camera lookup failure is worth retrying.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CameraLookupError {
    /// The short name doesn't resolve to any resource on the robot. The
    /// registry sweeper (not the event loop) acts on this by tearing the
    /// stream down.
    #[error("camera {0:?} not found")]
    NotFound(String),
    /// The resource exists but isn't ready yet (still configuring, etc).
    /// Retried on the next tick/sweep.
    #[error("camera {0:?} transiently unavailable: {1}")]
    Transient(String, String),
}

/// Looks up a camera by its robot short name. Implementations may hot-swap
/// the underlying camera (e.g. on reconfiguration) without invalidating the
/// `StreamState` that holds this lookup -- the state only ever calls
/// through the trait object, never caches the resolved handle across ticks.
pub trait RobotHandle: Send + Sync {
    fn camera(&self, short_name: &str) -> Result<Arc<dyn CameraHandle>, CameraLookupError>;

    /// Short names of the robot's current camera resources, walked by
    /// `Registry::add_new_streams` (§4.2). Does not include audio inputs.
    fn camera_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Short names of the robot's current audio input resources, walked
    /// alongside `camera_names` by `Registry::add_new_streams` (§4.2).
    fn audio_names(&self) -> Vec<String> {
        Vec::new()
    }
}
