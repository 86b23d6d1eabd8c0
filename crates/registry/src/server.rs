//! Server-scope stream registry (§4.2). Owns `name -> StreamState` and
//! `peer connection -> stream senders`, and is the entry point the
//! surrounding gRPC/WebRTC service drives with `AddStream`/`RemoveStream`
//! RPCs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use camstream_core::{CameraHandle, RobotHandle, StreamStateHandle, StreamTrack, WebRtcTrack};
use camstream_protocol::{NewStreamConfig, PeerId, RegistryConfig, Resolution, StreamName};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::error::RegistryError;

struct StreamEntry {
    handle: StreamStateHandle,
    camera_name: String,
}

/// Everything the registry tracks about one peer connection: the
/// connection itself (needed to call `remove_track` later) and the senders
/// it holds per stream, so `RemoveStream`/the camera monitor/a connection
/// drop can tear them down precisely.
struct PeerEntry {
    peer_conn: Arc<RTCPeerConnection>,
    streams: HashMap<StreamName, Vec<Arc<RTCRtpSender>>>,
}

/// Owns every live `StreamState` on this server plus the peer-connection
/// bookkeeping needed to add/remove tracks and react to disconnects (§4.2,
/// §5). Readers (lookups during `add_stream`/`remove_stream`/`list_streams`)
/// and writers (registration/removal) share one `RwLock` per map, matching
/// the registry-lock idiom the rest of this workspace uses for its
/// connection-keyed state.
pub struct Registry {
    robot: Arc<dyn RobotHandle>,
    config: RegistryConfig,
    streams: RwLock<HashMap<StreamName, StreamEntry>>,
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    alive: AtomicBool,
}

impl Registry {
    pub fn new(robot: Arc<dyn RobotHandle>, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            robot,
            config,
            streams: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            alive: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub(crate) fn robot(&self) -> &Arc<dyn RobotHandle> {
        &self.robot
    }

    /// Whether the server has not yet been `close`d. Consulted by the
    /// peer-connection-state callback so a disconnect observed after
    /// shutdown doesn't race the teardown this `close` already performed
    /// (§6, exit/cleanup).
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub async fn list_streams(&self) -> Vec<StreamName> {
        self.streams.read().await.keys().cloned().collect()
    }

    /// Idempotently creates a `StreamState` keyed by `config.name`. Rejects
    /// duplicates with `AlreadyRegistered` -- no observable side effect in
    /// that case.
    pub async fn new_stream(&self, config: NewStreamConfig) -> Result<StreamStateHandle, RegistryError> {
        let mut streams = self.streams.write().await;
        if streams.contains_key(&config.name) {
            return Err(RegistryError::AlreadyRegistered(config.name));
        }

        let codec = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: 90_000,
            ..Default::default()
        };
        let local_track = Arc::new(TrackLocalStaticRTP::new(
            codec,
            config.name.as_str().to_string(),
            "camstream".to_string(),
        ));
        let track: Arc<dyn StreamTrack> =
            Arc::new(WebRtcTrack::new(config.name.as_str(), local_track));

        let handle = StreamStateHandle::spawn(
            config.name.clone(),
            track,
            Arc::clone(&self.robot),
            config.camera_name.clone(),
            self.config.stream.clone(),
        );

        streams.insert(
            config.name.clone(),
            StreamEntry {
                handle: handle.clone(),
                camera_name: config.camera_name,
            },
        );
        info!(stream = %config.name, "stream registered");
        Ok(handle)
    }

    /// Walks the robot's current camera and audio resource lists and
    /// creates a `StreamState` for any that don't have one yet (§4.2).
    /// Existing streams are left untouched -- the camera-side hot-swap this
    /// relies on to pick up a replaced camera handle is the out-of-scope
    /// collaborator named in §1; this only ensures every currently-present
    /// resource has a controller.
    ///
    /// "start the encoded-source worker" in the distilled spec is read here
    /// as spawning the per-stream event loop (which owns the encoded
    /// pipeline's lifecycle) rather than forcing the pipeline to run with
    /// zero subscribers, which would violate invariant 2 (see DESIGN.md).
    pub async fn add_new_streams(&self, payload_type: u8) -> Vec<StreamName> {
        let mut created = Vec::new();
        let mut names: Vec<String> = self.robot.camera_names();
        names.extend(self.robot.audio_names());

        for camera_name in names {
            let name = StreamName::new(camera_name.clone());
            let already_known = self.streams.read().await.contains_key(&name);
            if already_known {
                continue;
            }
            match self
                .new_stream(NewStreamConfig {
                    name: name.clone(),
                    camera_name,
                    payload_type,
                })
                .await
            {
                Ok(_) => created.push(name),
                Err(RegistryError::AlreadyRegistered(_)) => {} // lost a race, fine
                Err(e) => warn!(stream = %name, error = %e, "failed to create stream during add_new_streams"),
            }
        }
        created
    }

    /// Registers `name`'s track on `peer_conn`, counts it against the peer,
    /// and increments the stream's subscriber count. The first `add_stream`
    /// call for a given `peer_id` also installs a connection-state watcher
    /// that drops every stream this peer holds if it goes
    /// `Disconnected`/`Failed`/`Closed` (§4.2).
    pub async fn add_stream(
        self: &Arc<Self>,
        name: &StreamName,
        peer_id: PeerId,
        peer_conn: Arc<RTCPeerConnection>,
    ) -> Result<(), RegistryError> {
        let handle = {
            let streams = self.streams.read().await;
            streams
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.clone()))?
                .handle
                .clone()
        };

        let sender = peer_conn.add_track(handle.track().local_track()).await?;

        {
            let mut peers = self.peers.write().await;
            let is_new_peer = !peers.contains_key(&peer_id);
            let entry = peers.entry(peer_id).or_insert_with(|| PeerEntry {
                peer_conn: Arc::clone(&peer_conn),
                streams: HashMap::new(),
            });
            entry.streams.entry(name.clone()).or_default().push(sender);

            if is_new_peer {
                self.watch_peer_connection(peer_id, &peer_conn);
            }
        }

        handle.increment().await?;
        debug!(stream = %name, %peer_id, "peer subscribed to stream");
        Ok(())
    }

    /// Symmetric with `add_stream`; idempotent -- returns success if the
    /// stream isn't known, or if this peer never held it.
    pub async fn remove_stream(&self, name: &StreamName, peer_id: PeerId) -> Result<(), RegistryError> {
        let found = {
            let mut peers = self.peers.write().await;
            let Some(entry) = peers.get_mut(&peer_id) else {
                return Ok(());
            };
            let senders = entry.streams.remove(name);
            let peer_conn = Arc::clone(&entry.peer_conn);
            if entry.streams.is_empty() {
                peers.remove(&peer_id);
            }
            senders.map(|senders| (senders, peer_conn))
        };
        let Some((senders, peer_conn)) = found else {
            return Ok(());
        };
        for sender in &senders {
            let _ = peer_conn.remove_track(sender).await;
        }

        let handle = {
            let streams = self.streams.read().await;
            streams.get(name).map(|e| e.handle.clone())
        };
        if let Some(handle) = handle {
            handle.decrement().await?;
        }
        debug!(stream = %name, %peer_id, "peer unsubscribed from stream");
        Ok(())
    }

    /// The camera's native resolution plus up to four progressively halved
    /// even-integer down-scalings (§4.2, §6).
    pub async fn get_stream_options(&self, name: &StreamName) -> Result<Vec<Resolution>, RegistryError> {
        let camera_name = {
            let streams = self.streams.read().await;
            streams
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.clone()))?
                .camera_name
                .clone()
        };
        let camera = self.robot.camera(&camera_name)?;
        let native = camera
            .native_resolution()
            .ok_or_else(|| RegistryError::NoNativeResolution(name.clone()))?;
        Ok(native.scaled_options())
    }

    /// When `resolution` is `Some`, installs a resizing wrapper and calls
    /// `StreamState::resize`; when `None`, restores the original source and
    /// calls `StreamState::reset` (§4.2). Rejects odd, zero, or negative
    /// dimensions synchronously, without touching any state (§7).
    pub async fn set_stream_options(
        &self,
        name: &StreamName,
        resolution: Option<Resolution>,
    ) -> Result<(), RegistryError> {
        if let Some(r) = resolution {
            if !r.is_positive() || !r.is_even() {
                return Err(RegistryError::InvalidResolution);
            }
        }

        let (camera_name, handle) = {
            let streams = self.streams.read().await;
            let entry = streams
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.clone()))?;
            (entry.camera_name.clone(), entry.handle.clone())
        };

        let camera = self.robot.camera(&camera_name)?;
        camera.set_resolution(resolution)?;

        match resolution {
            Some(_) => handle.resize().await?,
            None => handle.reset().await?,
        }
        Ok(())
    }

    /// Snapshot of `(stream name, camera short name)` for the camera
    /// monitor's sweep (§4.4). Taken under a brief read lock so the sweep
    /// itself doesn't hold the registry lock across camera-lookup calls.
    pub(crate) async fn stream_camera_snapshot(&self) -> Vec<(StreamName, String)> {
        self.streams
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.camera_name.clone()))
            .collect()
    }

    pub(crate) fn is_audio(&self, camera_name: &str) -> bool {
        self.robot.audio_names().iter().any(|a| a == camera_name)
    }

    /// Removes a stream whose camera has been confirmed gone (§4.4): drops
    /// it from the registry first so concurrent traffic can't race, then
    /// tears down every peer's hold on it, then closes the `StreamState`.
    pub(crate) async fn remove_and_close_stream(&self, name: &StreamName) {
        let handle = {
            let mut streams = self.streams.write().await;
            streams.remove(name).map(|e| e.handle)
        };
        let Some(handle) = handle else {
            return;
        };

        let mut peers = self.peers.write().await;
        let mut emptied = Vec::new();
        for (peer_id, entry) in peers.iter_mut() {
            if let Some(senders) = entry.streams.remove(name) {
                for sender in &senders {
                    let _ = entry.peer_conn.remove_track(sender).await;
                }
                let _ = handle.decrement().await;
            }
            if entry.streams.is_empty() {
                emptied.push(*peer_id);
            }
        }
        for peer_id in emptied {
            peers.remove(&peer_id);
        }
        drop(peers);

        handle.close().await;
        info!(stream = %name, "stream removed: camera no longer present");
    }

    /// Called by the connection-state watcher when a peer connection goes
    /// `Disconnected`/`Failed`/`Closed`: decrements every stream it held and
    /// drops its bookkeeping entry. The peer connection itself is not
    /// touched -- it's already tearing down.
    async fn remove_peer(&self, peer_id: PeerId) {
        let entry = {
            let mut peers = self.peers.write().await;
            peers.remove(&peer_id)
        };
        let Some(entry) = entry else {
            return;
        };
        let streams = self.streams.read().await;
        for name in entry.streams.keys() {
            if let Some(stream_entry) = streams.get(name) {
                let _ = stream_entry.handle.decrement().await;
            }
        }
        debug!(%peer_id, "peer connection torn down, released its streams");
    }

    fn watch_peer_connection(self: &Arc<Self>, peer_id: PeerId, peer_conn: &Arc<RTCPeerConnection>) {
        let registry = Arc::clone(self);
        peer_conn.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let registry = Arc::clone(&registry);
            Box::pin(async move {
                if matches!(
                    state,
                    RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                ) && registry.is_alive()
                {
                    registry.remove_peer(peer_id).await;
                }
            })
        }));
    }

    /// Process-level shutdown (§6, §9): marks the server not-alive (so a
    /// late peer-connection-state callback is a no-op), closes every
    /// `StreamState`, and only then releases the registry maps.
    pub async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        let streams = {
            let mut streams = self.streams.write().await;
            std::mem::take(&mut *streams)
        };
        for (name, entry) in streams {
            entry.handle.close().await;
            debug!(stream = %name, "stream closed");
        }
        self.peers.write().await.clear();
    }
}
