use camstream_core::StreamError;
use camstream_protocol::StreamName;
use thiserror::Error;

/// Errors surfaced by the registry's public API (§7). Everything the
/// sweeper and camera-lookup path can hit is absorbed internally and never
/// reaches here.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("stream {0} is already registered")]
    AlreadyRegistered(StreamName),

    #[error("stream {0} is not registered")]
    NotFound(StreamName),

    #[error("resolution must have positive, even width and height")]
    InvalidResolution,

    #[error("camera for stream {0} does not report a native resolution")]
    NoNativeResolution(StreamName),

    #[error("camera lookup failed: {0}")]
    CameraLookup(#[from] camstream_core::CameraLookupError),

    #[error("webrtc operation failed: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("camera operation failed: {0}")]
    Camera(#[from] anyhow::Error),
}
