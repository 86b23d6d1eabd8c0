//! Reference `PassthroughSource`: fans RTP packets received on an `mpsc`
//! channel out to subscribers, each with its own gating flag and
//! termination `Notify`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use camstream_protocol::SubscriptionId;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;
use webrtc::rtp::packet::Packet;

use crate::adapters::{PassthroughSource, PassthroughSubscribeError, TerminationSignal, UnknownSubscriptionId};

struct Subscription {
    on_packet: Box<dyn Fn(Packet) + Send + Sync>,
    enabled: Arc<AtomicBool>,
    termination: TerminationSignal,
}

/// Feeds subscribers from a single upstream packet channel (e.g. a raw RTP
/// forwarder reading off a camera's own RTSP/RTP session). Construct with
/// [`ChannelPassthroughSource::new`] and call [`feed`](Self::feed) from
/// whatever task owns the upstream socket.
pub struct ChannelPassthroughSource {
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
}

impl Default for ChannelPassthroughSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPassthroughSource {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Deliver one packet to every currently-enabled subscriber. Call this
    /// from the task that owns the upstream source; it never blocks on a
    /// subscriber's callback beyond that callback's own synchronous cost.
    pub async fn feed(&self, packet: Packet) {
        let subs = self.subscriptions.lock().await;
        for sub in subs.values() {
            if sub.enabled.load(Ordering::Acquire) {
                (sub.on_packet)(packet.clone());
            }
        }
    }

    /// Forces every live subscription closed, e.g. when the upstream feed
    /// itself has gone away permanently.
    pub async fn terminate_all(&self) {
        let mut subs = self.subscriptions.lock().await;
        for (id, sub) in subs.drain() {
            debug!(subscription_id = %id, "terminating passthrough subscription");
            sub.termination.notify_waiters();
        }
    }
}

#[async_trait]
impl PassthroughSource for ChannelPassthroughSource {
    async fn subscribe(
        &self,
        _buffer_size: usize,
        on_packet: Box<dyn Fn(Packet) + Send + Sync>,
    ) -> Result<(SubscriptionId, TerminationSignal), PassthroughSubscribeError> {
        let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let termination = Arc::new(Notify::new());
        let sub = Subscription {
            on_packet,
            enabled: Arc::new(AtomicBool::new(true)),
            termination: Arc::clone(&termination),
        };
        self.subscriptions.lock().await.insert(id, sub);
        Ok((id, termination))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), UnknownSubscriptionId> {
        let mut subs = self.subscriptions.lock().await;
        match subs.remove(&id) {
            Some(sub) => {
                sub.termination.notify_waiters();
                Ok(())
            }
            None => Err(UnknownSubscriptionId(id)),
        }
    }
}

/// Unbounded channel producer/consumer pair used to hand packets from an
/// upstream I/O task into a [`ChannelPassthroughSource`]'s `feed` loop.
pub fn spawn_feed_loop(
    source: Arc<ChannelPassthroughSource>,
) -> (mpsc::Sender<Packet>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(256);
    let handle = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            source.feed(packet).await;
        }
        source.terminate_all().await;
    });
    (tx, handle)
}
