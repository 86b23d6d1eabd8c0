//! Per-stream source state machine (§3, §4.1). A single Tokio task owns
//! every mutation; `StreamStateHandle` is the cheaply-clonable public face
//! the registry and the WebRTC layer hold.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camstream_protocol::{StreamConfig, StreamName, SubscriptionId};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use webrtc::rtp::packet::Packet;

use crate::adapters::{CameraHandle, EncodedPipeline, PassthroughSource, RobotHandle, TerminationSignal};
use crate::error::StreamError;
use crate::track::StreamTrack;

/// Tagged variant for the active source (§3). Deliberately not two
/// booleans: "neither" and "both" must be unrepresentable.
pub enum Source {
    Unknown,
    Encoded,
    Passthrough {
        sub_id: SubscriptionId,
        terminated: TerminationSignal,
    },
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Unknown => write!(f, "Unknown"),
            Source::Encoded => write!(f, "Encoded"),
            Source::Passthrough { sub_id, .. } => write!(f, "Passthrough({sub_id})"),
        }
    }
}

enum Event {
    Increment(oneshot::Sender<()>),
    Decrement(oneshot::Sender<()>),
    Resize(oneshot::Sender<()>),
    Reset(oneshot::Sender<()>),
}

/// A cheaply-clonable handle to a running `StreamState` event loop.
/// Public methods only send an event (or, for `close`, a cancellation
/// signal) and wait for acknowledgment -- they never touch the state
/// machine's fields directly (§5, mutation discipline).
#[derive(Clone)]
pub struct StreamStateHandle {
    name: StreamName,
    track: Arc<dyn StreamTrack>,
    events: mpsc::Sender<Event>,
    close_notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

impl StreamStateHandle {
    /// Spawns the event loop task and returns a handle to it.
    pub fn spawn(
        name: StreamName,
        track: Arc<dyn StreamTrack>,
        robot_handle: Arc<dyn RobotHandle>,
        camera_name: String,
        config: StreamConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let close_notify = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(false);

        let worker = Worker {
            stream: Arc::clone(&track),
            robot_handle,
            camera_name,
            config,
            active_peers: 0,
            source: Source::Unknown,
            is_resized: false,
            terminated_fired: false,
            encoded_pipeline: None,
            passthrough_source: None,
            passthrough_runtime: None,
            events_rx,
            close_notify: Arc::clone(&close_notify),
        };

        tokio::spawn(async move {
            worker.run().await;
            let _ = done_tx.send(true);
        });

        Self {
            name,
            track,
            events: events_tx,
            close_notify,
            closed,
            done: done_rx,
        }
    }

    pub fn name(&self) -> &StreamName {
        &self.name
    }

    /// The underlying track, used by the registry to wire up new
    /// subscribers. Immutable for the life of the state (§3).
    pub fn track(&self) -> &Arc<dyn StreamTrack> {
        &self.track
    }

    pub async fn increment(&self) -> Result<(), StreamError> {
        self.send_event(Event::Increment).await
    }

    pub async fn decrement(&self) -> Result<(), StreamError> {
        self.send_event(Event::Decrement).await
    }

    pub async fn resize(&self) -> Result<(), StreamError> {
        self.send_event(Event::Resize).await
    }

    pub async fn reset(&self) -> Result<(), StreamError> {
        self.send_event(Event::Reset).await
    }

    async fn send_event(&self, make: impl FnOnce(oneshot::Sender<()>) -> Event) -> Result<(), StreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.events.send(make(ack_tx)).await.is_err() {
            return Err(StreamError::Closed);
        }
        ack_rx.await.map_err(|_| StreamError::Closed)
    }

    /// Idempotent. Signals cancellation, then waits for the event loop
    /// (and everything it owns) to exit. Concurrent callers all observe
    /// the same completion (§9, shutdown ordering).
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_one();
        }
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Runtime bookkeeping for the currently-open passthrough subscription.
/// Kept outside `Source` because `Source` only models what the rest of the
/// system observes (§3); these are implementation details of how we relay
/// packets and notice termination.
struct PassthroughRuntime {
    gate: Arc<AtomicBool>,
    writer_task: JoinHandle<()>,
    watcher_task: JoinHandle<()>,
}

impl Drop for PassthroughRuntime {
    fn drop(&mut self) {
        self.writer_task.abort();
        self.watcher_task.abort();
    }
}

struct Worker {
    stream: Arc<dyn StreamTrack>,
    robot_handle: Arc<dyn RobotHandle>,
    camera_name: String,
    config: StreamConfig,

    active_peers: i64,
    source: Source,
    is_resized: bool,
    terminated_fired: bool,

    encoded_pipeline: Option<Arc<dyn EncodedPipeline>>,
    passthrough_source: Option<Arc<dyn PassthroughSource>>,
    passthrough_runtime: Option<PassthroughRuntime>,

    events_rx: mpsc::Receiver<Event>,
    close_notify: Arc<Notify>,
}

/// Internal signal fed back into the event loop by a subscription watcher
/// task when the camera-owned `terminated` signal fires (§5, "Subscription
/// watcher" worker class).
enum Internal {
    SubscriptionTerminated,
}

impl Worker {
    async fn run(mut self) {
        let (internal_tx, mut internal_rx) = mpsc::channel::<Internal>(4);
        let mut tick_timer = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        tick_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.close_notify.notified() => {
                    debug!(stream = %self.stream.name(), "stream state closing");
                    break;
                }

                maybe_event = self.events_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            self.apply_event(event);
                            self.tick(&internal_tx).await;
                        }
                        None => break, // every handle dropped
                    }
                }

                _ = tick_timer.tick() => {
                    self.tick(&internal_tx).await;
                }

                Some(signal) = internal_rx.recv() => {
                    match signal {
                        Internal::SubscriptionTerminated => {
                            self.terminated_fired = true;
                            self.tick(&internal_tx).await;
                        }
                    }
                }
            }
        }

        self.stop_current_source().await;
    }

    fn apply_event(&mut self, event: Event) {
        match event {
            Event::Increment(ack) => {
                self.active_peers += 1;
                let _ = ack.send(());
            }
            Event::Decrement(ack) => {
                self.active_peers -= 1;
                let _ = ack.send(());
            }
            Event::Resize(ack) => {
                self.is_resized = true;
                let _ = ack.send(());
            }
            Event::Reset(ack) => {
                self.is_resized = false;
                let _ = ack.send(());
            }
        }
    }

    /// The centralized reconciliation step (§4.1). Runs after every public
    /// event, every tick timer fire, and every subscription-terminated
    /// signal -- the only place `source` is mutated.
    async fn tick(&mut self, internal_tx: &mpsc::Sender<Internal>) {
        if self.active_peers < 0 {
            error!(stream = %self.stream.name(), active_peers = self.active_peers, "active_peers went negative, clamping to zero");
            self.active_peers = 0;
        }

        if self.active_peers == 0 {
            self.stop_current_source().await;
            return;
        }

        match &self.source {
            Source::Unknown => {
                if self.is_resized {
                    self.start_encoded().await;
                } else if !self.try_start_passthrough(internal_tx).await {
                    self.start_encoded().await;
                }
            }
            Source::Passthrough { .. } => {
                if self.is_resized {
                    self.stop_passthrough().await;
                    self.start_encoded().await;
                } else if self.terminated_fired {
                    self.terminated_fired = false;
                    self.stop_passthrough().await;
                    if !self.try_start_passthrough(internal_tx).await {
                        self.start_encoded().await;
                    }
                }
                // else: healthy, no-op.
            }
            Source::Encoded => {
                if !self.is_resized {
                    // Upgrade opportunity; failure leaves us on Encoded.
                    self.try_start_passthrough(internal_tx).await;
                }
            }
        }
    }

    fn camera(&self) -> Option<Arc<dyn CameraHandle>> {
        match self.robot_handle.camera(&self.camera_name) {
            Ok(camera) => Some(camera),
            Err(e) => {
                debug!(stream = %self.stream.name(), camera = %self.camera_name, error = %e, "camera lookup failed this tick");
                None
            }
        }
    }

    async fn start_encoded(&mut self) {
        if matches!(self.source, Source::Encoded) {
            return; // already running, idempotent
        }
        let Some(camera) = self.camera() else {
            return;
        };
        let Some(pipeline) = camera.encoded() else {
            debug!(stream = %self.stream.name(), "camera has no encoded pipeline capability");
            return;
        };

        if let Err(e) = pipeline.start().await {
            error!(stream = %self.stream.name(), error = %e, "encoded pipeline failed to start");
            return;
        }
        if let Err(e) = self.stream.start().await {
            warn!(stream = %self.stream.name(), error = %e, "track start failed");
        }
        self.encoded_pipeline = Some(pipeline);
        self.source = Source::Encoded;
        debug!(stream = %self.stream.name(), "encoded pipeline started");
    }

    /// Implements the ordering contract in §4.1: subscribe, gate packets
    /// closed, stop any running encoded pipeline, then release the gate.
    /// Returns whether passthrough is now active.
    async fn try_start_passthrough(&mut self, internal_tx: &mpsc::Sender<Internal>) -> bool {
        let Some(camera) = self.camera() else {
            return false;
        };
        let Some(passthrough) = camera.passthrough() else {
            debug!(stream = %self.stream.name(), "camera has no passthrough capability");
            return false;
        };

        let gate = Arc::new(AtomicBool::new(false));
        let (packet_tx, mut packet_rx) = mpsc::unbounded_channel::<Packet>();
        let on_packet: Box<dyn Fn(Packet) + Send + Sync> = Box::new(move |packet| {
            let _ = packet_tx.send(packet);
        });

        let (sub_id, terminated) = match passthrough
            .subscribe(self.config.subscribe_buffer_size, on_packet)
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                debug!(stream = %self.stream.name(), error = %e, "passthrough subscribe failed, falling back");
                return false;
            }
        };

        // (iii) stop the currently-running encoded pipeline, if any.
        if matches!(self.source, Source::Encoded) {
            if let Some(pipeline) = self.encoded_pipeline.take() {
                if let Err(e) = pipeline.stop().await {
                    warn!(stream = %self.stream.name(), error = %e, "encoded pipeline stop failed during upgrade");
                }
            }
        }

        // (ii)/(iv): writer task only forwards packets once the gate opens.
        let track = Arc::clone(&self.stream);
        let writer_gate = Arc::clone(&gate);
        let writer_task = tokio::spawn(async move {
            while let Some(packet) = packet_rx.recv().await {
                if writer_gate.load(Ordering::Acquire) {
                    if let Err(e) = track.write_rtp(&packet).await {
                        debug!(error = %e, "write_rtp failed, dropping passthrough packet");
                    }
                }
            }
        });

        let watcher_terminated: TerminationSignal = Arc::clone(&terminated);
        let watcher_internal_tx = internal_tx.clone();
        let watcher_task = tokio::spawn(async move {
            watcher_terminated.notified().await;
            let _ = watcher_internal_tx.send(Internal::SubscriptionTerminated).await;
        });

        gate.store(true, Ordering::Release);
        if let Err(e) = self.stream.start().await {
            warn!(stream = %self.stream.name(), error = %e, "track start failed");
        }

        self.passthrough_source = Some(passthrough);
        self.passthrough_runtime = Some(PassthroughRuntime { gate, writer_task, watcher_task });
        self.terminated_fired = false;
        debug!(stream = %self.stream.name(), %sub_id, "passthrough subscription active");
        self.source = Source::Passthrough { sub_id, terminated };
        true
    }

    /// Unsubscribes the active passthrough subscription, if any, and
    /// forces the state back to `Unknown` -- including when `unsubscribe`
    /// reports an unknown id (§4.1 failure semantics).
    async fn stop_passthrough(&mut self) {
        let Source::Passthrough { sub_id, .. } = &self.source else {
            return;
        };
        let sub_id = *sub_id;
        self.passthrough_runtime = None; // aborts writer + watcher tasks
        if let Some(passthrough) = self.passthrough_source.take() {
            match passthrough.unsubscribe(sub_id).await {
                Ok(()) => debug!(stream = %self.stream.name(), %sub_id, "passthrough unsubscribed"),
                Err(e) => warn!(stream = %self.stream.name(), %sub_id, error = %e, "unsubscribe reported unknown subscription id"),
            }
        }
        if let Err(e) = self.stream.stop().await {
            warn!(stream = %self.stream.name(), error = %e, "track stop failed");
        }
        self.source = Source::Unknown;
        self.terminated_fired = false;
    }

    async fn stop_current_source(&mut self) {
        match &self.source {
            Source::Encoded => {
                if let Some(pipeline) = self.encoded_pipeline.take() {
                    if let Err(e) = pipeline.stop().await {
                        warn!(stream = %self.stream.name(), error = %e, "encoded pipeline stop failed");
                    }
                }
                if let Err(e) = self.stream.stop().await {
                    warn!(stream = %self.stream.name(), error = %e, "track stop failed");
                }
                self.source = Source::Unknown;
            }
            Source::Passthrough { .. } => {
                self.stop_passthrough().await;
            }
            Source::Unknown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{
        CameraLookupError, PassthroughSubscribeError, UnknownSubscriptionId,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;

    struct MockTrack {
        writes: StdMutex<Vec<Packet>>,
        started: AtomicU32,
        stopped: AtomicU32,
    }

    impl MockTrack {
        fn new() -> Self {
            Self {
                writes: StdMutex::new(Vec::new()),
                started: AtomicU32::new(0),
                stopped: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StreamTrack for MockTrack {
        fn name(&self) -> &str {
            "mock"
        }
        async fn write_rtp(&self, packet: &Packet) -> anyhow::Result<()> {
            self.writes.lock().unwrap().push(packet.clone());
            Ok(())
        }
        async fn start(&self) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            self.stopped.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn local_track(&self) -> Arc<dyn webrtc::track::track_local::TrackLocal + Send + Sync> {
            unimplemented!("not exercised by state machine tests")
        }
    }

    struct CountingEncodedPipeline {
        starts: AtomicU32,
        stops: AtomicU32,
    }

    impl CountingEncodedPipeline {
        fn new() -> Self {
            Self { starts: AtomicU32::new(0), stops: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl EncodedPipeline for CountingEncodedPipeline {
        async fn start(&self) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Always fails to subscribe, or always succeeds, depending on
    /// construction; `subscribe_calls` lets tests assert on retry counts.
    struct ScriptedPassthrough {
        /// `true` = fail, consumed front-to-back; once exhausted, succeed.
        failures: Mutex<Vec<bool>>,
        subscribe_calls: AtomicU32,
        unsubscribe_calls: AtomicU32,
        active: StdMutex<Option<(SubscriptionId, TerminationSignal)>>,
    }

    impl ScriptedPassthrough {
        fn new(failures: Vec<bool>) -> Self {
            Self {
                failures: Mutex::new(failures),
                subscribe_calls: AtomicU32::new(0),
                unsubscribe_calls: AtomicU32::new(0),
                active: StdMutex::new(None),
            }
        }

        /// Fires the currently-active subscription's termination signal.
        fn terminate_active(&self) {
            if let Some((_, signal)) = self.active.lock().unwrap().clone() {
                signal.notify_waiters();
            }
        }
    }

    #[async_trait]
    impl PassthroughSource for ScriptedPassthrough {
        async fn subscribe(
            &self,
            _buffer_size: usize,
            _on_packet: Box<dyn Fn(Packet) + Send + Sync>,
        ) -> Result<(SubscriptionId, TerminationSignal), PassthroughSubscribeError> {
            self.subscribe_calls.fetch_add(1, Ordering::Relaxed);
            let should_fail = {
                let mut failures = self.failures.lock().await;
                if failures.is_empty() {
                    false
                } else {
                    failures.remove(0)
                }
            };
            if should_fail {
                return Err(PassthroughSubscribeError("scripted failure".into()));
            }
            let id = SubscriptionId::new(self.subscribe_calls.load(Ordering::Relaxed) as u64);
            let terminated: TerminationSignal = Arc::new(Notify::new());
            *self.active.lock().unwrap() = Some((id, Arc::clone(&terminated)));
            Ok((id, terminated))
        }

        async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), UnknownSubscriptionId> {
            self.unsubscribe_calls.fetch_add(1, Ordering::Relaxed);
            let mut active = self.active.lock().unwrap();
            match active.take() {
                Some((active_id, _)) if active_id == id => Ok(()),
                Some(other) => {
                    *active = Some(other);
                    Err(UnknownSubscriptionId(id))
                }
                None => Err(UnknownSubscriptionId(id)),
            }
        }
    }

    struct StubCamera {
        encoded: Option<Arc<dyn EncodedPipeline>>,
        passthrough: Option<Arc<dyn PassthroughSource>>,
    }

    impl CameraHandle for StubCamera {
        fn encoded(&self) -> Option<Arc<dyn EncodedPipeline>> {
            self.encoded.clone()
        }
        fn passthrough(&self) -> Option<Arc<dyn PassthroughSource>> {
            self.passthrough.clone()
        }
    }

    struct StubRobot {
        camera: Arc<dyn CameraHandle>,
    }

    impl RobotHandle for StubRobot {
        fn camera(&self, _short_name: &str) -> Result<Arc<dyn CameraHandle>, CameraLookupError> {
            Ok(Arc::clone(&self.camera))
        }
    }

    fn fast_config() -> StreamConfig {
        StreamConfig {
            tick_interval_ms: 10,
            event_channel_capacity: 1,
            subscribe_buffer_size: 8,
            error_throttle: Default::default(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    #[tokio::test]
    async fn cold_start_passthrough_capable_camera() {
        let passthrough = Arc::new(ScriptedPassthrough::new(vec![]));
        let camera: Arc<dyn CameraHandle> = Arc::new(StubCamera {
            encoded: Some(Arc::new(CountingEncodedPipeline::new())),
            passthrough: Some(passthrough.clone()),
        });
        let robot: Arc<dyn RobotHandle> = Arc::new(StubRobot { camera });
        let track = Arc::new(MockTrack::new());

        let handle = StreamStateHandle::spawn(
            StreamName::new("cam0"),
            track.clone() as Arc<dyn StreamTrack>,
            robot,
            "cam0".into(),
            fast_config(),
        );

        handle.increment().await.unwrap();
        settle().await;

        assert_eq!(passthrough.subscribe_calls.load(Ordering::Relaxed), 1);
        assert_eq!(track.started.load(Ordering::Relaxed), 1);

        handle.close().await;
    }

    #[tokio::test]
    async fn cold_start_passthrough_always_fails_falls_back_to_encoded() {
        // always fail: an arbitrarily long run of `true`s.
        let passthrough = Arc::new(ScriptedPassthrough::new(vec![true; 100]));
        let encoded = Arc::new(CountingEncodedPipeline::new());
        let camera: Arc<dyn CameraHandle> = Arc::new(StubCamera {
            encoded: Some(encoded.clone()),
            passthrough: Some(passthrough.clone()),
        });
        let robot: Arc<dyn RobotHandle> = Arc::new(StubRobot { camera });
        let track = Arc::new(MockTrack::new());

        let handle = StreamStateHandle::spawn(
            StreamName::new("cam0"),
            track as Arc<dyn StreamTrack>,
            robot,
            "cam0".into(),
            fast_config(),
        );

        handle.increment().await.unwrap();
        settle().await;

        assert_eq!(encoded.starts.load(Ordering::Relaxed), 1, "encoded starts exactly once even as passthrough keeps retrying");
        assert!(passthrough.subscribe_calls.load(Ordering::Relaxed) >= 2, "passthrough retried on later ticks");

        handle.close().await;
    }

    #[tokio::test]
    async fn upgrade_from_encoded_to_passthrough() {
        let passthrough = Arc::new(ScriptedPassthrough::new(vec![true])); // fail once, then succeed
        let encoded = Arc::new(CountingEncodedPipeline::new());
        let camera: Arc<dyn CameraHandle> = Arc::new(StubCamera {
            encoded: Some(encoded.clone()),
            passthrough: Some(passthrough.clone()),
        });
        let robot: Arc<dyn RobotHandle> = Arc::new(StubRobot { camera });
        let track = Arc::new(MockTrack::new());

        let handle = StreamStateHandle::spawn(
            StreamName::new("cam0"),
            track as Arc<dyn StreamTrack>,
            robot,
            "cam0".into(),
            fast_config(),
        );

        handle.increment().await.unwrap();
        settle().await;

        assert_eq!(encoded.starts.load(Ordering::Relaxed), 1);
        assert_eq!(encoded.stops.load(Ordering::Relaxed), 1, "encoded stopped exactly once on upgrade");
        assert!(passthrough.subscribe_calls.load(Ordering::Relaxed) >= 2);

        handle.close().await;
    }

    #[tokio::test]
    async fn subscription_terminates_while_subscribers_remain_recovers() {
        let passthrough = Arc::new(ScriptedPassthrough::new(vec![]));
        let camera: Arc<dyn CameraHandle> = Arc::new(StubCamera {
            encoded: Some(Arc::new(CountingEncodedPipeline::new())),
            passthrough: Some(passthrough.clone()),
        });
        let robot: Arc<dyn RobotHandle> = Arc::new(StubRobot { camera });
        let track = Arc::new(MockTrack::new());

        let handle = StreamStateHandle::spawn(
            StreamName::new("cam0"),
            track as Arc<dyn StreamTrack>,
            robot,
            "cam0".into(),
            fast_config(),
        );

        handle.increment().await.unwrap();
        settle().await;
        assert_eq!(passthrough.subscribe_calls.load(Ordering::Relaxed), 1);

        passthrough.terminate_active();
        settle().await;

        assert_eq!(passthrough.subscribe_calls.load(Ordering::Relaxed), 2, "one recovery subscribe");

        handle.close().await;
    }

    #[tokio::test]
    async fn resize_disables_passthrough_reset_restores_it() {
        let passthrough = Arc::new(ScriptedPassthrough::new(vec![]));
        let encoded = Arc::new(CountingEncodedPipeline::new());
        let camera: Arc<dyn CameraHandle> = Arc::new(StubCamera {
            encoded: Some(encoded.clone()),
            passthrough: Some(passthrough.clone()),
        });
        let robot: Arc<dyn RobotHandle> = Arc::new(StubRobot { camera });
        let track = Arc::new(MockTrack::new());

        let handle = StreamStateHandle::spawn(
            StreamName::new("cam0"),
            track as Arc<dyn StreamTrack>,
            robot,
            "cam0".into(),
            fast_config(),
        );

        handle.increment().await.unwrap();
        settle().await;
        assert_eq!(passthrough.subscribe_calls.load(Ordering::Relaxed), 1);

        handle.resize().await.unwrap();
        settle().await;
        assert_eq!(passthrough.unsubscribe_calls.load(Ordering::Relaxed), 1);
        assert_eq!(encoded.starts.load(Ordering::Relaxed), 1);

        handle.reset().await.unwrap();
        settle().await;
        assert_eq!(encoded.stops.load(Ordering::Relaxed), 1);
        assert_eq!(passthrough.subscribe_calls.load(Ordering::Relaxed), 2);

        handle.close().await;
    }

    #[tokio::test]
    async fn increment_decrement_converges_to_unknown() {
        let passthrough = Arc::new(ScriptedPassthrough::new(vec![]));
        let camera: Arc<dyn CameraHandle> = Arc::new(StubCamera {
            encoded: Some(Arc::new(CountingEncodedPipeline::new())),
            passthrough: Some(passthrough.clone()),
        });
        let robot: Arc<dyn RobotHandle> = Arc::new(StubRobot { camera });
        let track = Arc::new(MockTrack::new());

        let handle = StreamStateHandle::spawn(
            StreamName::new("cam0"),
            track.clone() as Arc<dyn StreamTrack>,
            robot,
            "cam0".into(),
            fast_config(),
        );

        handle.increment().await.unwrap();
        settle().await;
        handle.decrement().await.unwrap();
        settle().await;

        assert_eq!(passthrough.unsubscribe_calls.load(Ordering::Relaxed), 1);
        assert_eq!(track.stopped.load(Ordering::Relaxed), 1);

        handle.close().await;
    }

    #[tokio::test]
    async fn decrement_below_zero_is_clamped() {
        let passthrough = Arc::new(ScriptedPassthrough::new(vec![]));
        let camera: Arc<dyn CameraHandle> =
            Arc::new(StubCamera { encoded: None, passthrough: Some(passthrough.clone()) });
        let robot: Arc<dyn RobotHandle> = Arc::new(StubRobot { camera });
        let track = Arc::new(MockTrack::new());

        let handle = StreamStateHandle::spawn(
            StreamName::new("cam0"),
            track.clone() as Arc<dyn StreamTrack>,
            robot,
            "cam0".into(),
            fast_config(),
        );

        handle.decrement().await.unwrap(); // no matching increment
        settle().await;
        handle.increment().await.unwrap();
        settle().await;

        // A single increment after the clamp should leave active_peers == 1,
        // not -1 + 1 == 0 -- if the clamp hadn't floored at zero this
        // increment would still leave active_peers <= 0 and the tick would
        // never subscribe at all.
        assert_eq!(passthrough.subscribe_calls.load(Ordering::Relaxed), 1);
        assert_eq!(track.started.load(Ordering::Relaxed), 1);

        handle.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_calls() {
        let passthrough = Arc::new(ScriptedPassthrough::new(vec![]));
        let camera: Arc<dyn CameraHandle> = Arc::new(StubCamera { encoded: None, passthrough: Some(passthrough) });
        let robot: Arc<dyn RobotHandle> = Arc::new(StubRobot { camera });
        let track = Arc::new(MockTrack::new());

        let handle = StreamStateHandle::spawn(
            StreamName::new("cam0"),
            track as Arc<dyn StreamTrack>,
            robot,
            "cam0".into(),
            fast_config(),
        );

        handle.close().await;
        handle.close().await; // idempotent, must not hang

        assert_eq!(handle.increment().await, Err(StreamError::Closed));
        assert_eq!(handle.decrement().await, Err(StreamError::Closed));
    }
}
