use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// The WebRTC media track a `StreamState` owns for the life of the stream.
/// Both the encoded pipeline and the passthrough packet callback write to
/// the same underlying track; the swap protocol in `state::tick` is what
/// keeps them from doing so concurrently.
#[async_trait]
pub trait StreamTrack: Send + Sync {
    fn name(&self) -> &str;

    async fn write_rtp(&self, packet: &Packet) -> anyhow::Result<()>;

    /// Idempotent with respect to repeated calls in the same state (§6).
    async fn start(&self) -> anyhow::Result<()>;

    /// Idempotent with respect to repeated calls in the same state (§6).
    async fn stop(&self) -> anyhow::Result<()>;

    /// The `TrackLocal` the registry hands to `RTCPeerConnection::add_track`
    /// when a new subscriber joins. Separate from `write_rtp` et al. because
    /// the registry, not the event loop, owns peer-connection wiring.
    fn local_track(&self) -> Arc<dyn TrackLocal + Send + Sync>;
}

/// `StreamTrack` backed by a `webrtc-rs` `TrackLocalStaticRTP`, the track
/// type that accepts already-packetized RTP (as opposed to
/// `TrackLocalStaticSample`, which packetizes internally and so can't be
/// shared between passthrough and encoded sources).
pub struct WebRtcTrack {
    name: String,
    track: Arc<TrackLocalStaticRTP>,
    enabled: AtomicBool,
}

impl WebRtcTrack {
    pub fn new(name: impl Into<String>, track: Arc<TrackLocalStaticRTP>) -> Self {
        Self {
            name: name.into(),
            track,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &Arc<TrackLocalStaticRTP> {
        &self.track
    }
}

#[async_trait]
impl StreamTrack for WebRtcTrack {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_rtp(&self, packet: &Packet) -> anyhow::Result<()> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        self.track.write_rtp(packet).await?;
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.enabled.store(false, Ordering::Release);
        Ok(())
    }

    fn local_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }
}
