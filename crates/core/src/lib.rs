//! Per-stream media source controller for a WebRTC robot camera stream
//! server. Owns the state machine that picks between passthrough and
//! encoded source modes for a single named stream; see [`state`] for the
//! entry point.

pub mod adapters;
pub mod error;
pub mod state;
pub mod throttle;
pub mod track;

pub use adapters::{
    CameraHandle, CameraLookupError, EncodedPipeline, PassthroughSource,
    PassthroughSubscribeError, RobotHandle, TerminationSignal, UnknownSubscriptionId,
};
pub use error::StreamError;
pub use state::{Source, StreamStateHandle};
pub use track::{StreamTrack, WebRtcTrack};
