//! The room orchestrator
//!
//! Owns the client registry and the fan-out choreography: when a client
//! publishes, every other client gets the tracks and a renegotiation; when
//! a subscriber connects, it is synced up with the room's existing tracks;
//! when a publisher disappears, its tracks are swept out everywhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_mux::{UDPMux, UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};

use crate::callback::{CallbackHandle, CallbackList};
use crate::client::Client;
use crate::config::{ClientOptions, SfuConfig};
use crate::error::{Error, Result};
use crate::remote_track::{PublishedTrack, RemoteTrackVariant};
use crate::stats::RoomStats;

/// Header extensions announced on video so browsers send simulcast with
/// rid tagging the SFU can route on.
const SIMULCAST_EXTENSIONS: [&str; 3] = [
    "urn:ietf:params:rtp-hdrext:sdes:mid",
    "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
    "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id",
];

type OnClientFn = dyn Fn(&Arc<Client>) + Send + Sync;
type OnTrackPublishedFn = dyn Fn(&HashMap<String, PublishedTrack>) + Send + Sync;
type OnStoppedFn = dyn Fn() + Send + Sync;
type WeakSfu = std::sync::Weak<Sfu>;

/// A single-port UDP mux shared by every peer connection of one SFU.
pub struct UdpMux {
    mux: Arc<dyn UDPMux + Send + Sync>,
    port: u16,
}

impl UdpMux {
    /// Binds the mux on `port` on all interfaces.
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|err| Error::WebRtc(webrtc::Error::new(err.to_string())))?;
        Ok(Self {
            mux: UDPMuxDefault::new(UDPMuxParams::new(socket)),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// One room's forwarding unit.
pub struct Sfu {
    config: SfuConfig,
    weak_self: WeakSfu,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    counter: AtomicUsize,
    cancel: CancellationToken,
    udp_mux: Option<UdpMux>,
    idle_tx: mpsc::UnboundedSender<()>,
    stopped: AtomicBool,
    /// Data channels opened by clients, keyed by label then client id.
    /// Broadcasting over them is the embedding application's business; the
    /// registry exists so channels can be found and dropped with their client.
    data_channels: DashMap<String, DashMap<String, Arc<RTCDataChannel>>>,
    on_client_added: CallbackList<OnClientFn>,
    on_client_removed: CallbackList<OnClientFn>,
    on_track_published: CallbackList<OnTrackPublishedFn>,
    on_stopped: RwLock<Option<Arc<OnStoppedFn>>>,
}

impl Sfu {
    /// Creates the SFU and starts its idle watchdog: when no lifecycle
    /// events arrive for `room_idle_timeout`, the room shuts itself down.
    pub fn new(config: SfuConfig, udp_mux: Option<UdpMux>) -> Arc<Self> {
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel();
        let sfu = Arc::new_cyclic(|weak_self| Self {
            config,
            weak_self: weak_self.clone(),
            clients: RwLock::new(HashMap::new()),
            counter: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            udp_mux,
            idle_tx,
            stopped: AtomicBool::new(false),
            data_channels: DashMap::new(),
            on_client_added: CallbackList::new(),
            on_client_removed: CallbackList::new(),
            on_track_published: CallbackList::new(),
            on_stopped: RwLock::new(None),
        });

        let weak = Arc::downgrade(&sfu);
        let cancel = sfu.cancel.clone();
        let idle_timeout = sfu.config.room_idle_timeout;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    received = tokio::time::timeout(idle_timeout, idle_rx.recv()) => match received {
                        Ok(Some(())) => {}
                        Ok(None) => return,
                        Err(_) => {
                            info!("room idle timeout reached, shutting down");
                            if let Some(sfu) = weak.upgrade() {
                                sfu.stop().await;
                            }
                            return;
                        }
                    },
                }
            }
        });

        sfu
    }

    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn weak_handle(&self) -> WeakSfu {
        self.weak_self.clone()
    }

    fn notify_activity(&self) {
        let _ = self.idle_tx.send(());
    }

    fn client_snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.read().values().cloned().collect()
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let turn = &self.config.turn;
        if turn.host.is_empty() {
            return Vec::new();
        }
        vec![
            RTCIceServer {
                urls: vec![format!("turn:{}:{}", turn.host, turn.port)],
                username: turn.username.clone(),
                credential: turn.password.clone(),
                ..Default::default()
            },
            RTCIceServer {
                urls: vec![format!("stun:{}:{}", turn.host, turn.port)],
                ..Default::default()
            },
        ]
    }

    /// Builds a peer connection with the room's codec set (H.264 and
    /// Opus), the simulcast header extensions, and the default
    /// interceptor chain.
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        for uri in SIMULCAST_EXTENSIONS {
            media_engine.register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: uri.to_owned(),
                },
                RTPCodecType::Video,
                None,
            )?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if let Some(mux) = &self.udp_mux {
            setting_engine.set_udp_network(UDPNetwork::Muxed(Arc::clone(&mux.mux)));
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers(),
                ..Default::default()
            })
            .await?;
        Ok(Arc::new(pc))
    }

    /// Creates and registers a client. The returned handle is the one the
    /// signaling layer wires its callbacks onto.
    pub async fn new_client(
        &self,
        id: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Arc<Client>> {
        let id = id.into();
        if self.clients.read().contains_key(&id) {
            return Err(Error::ClientAlreadyExists(id));
        }

        self.counter.fetch_add(1, Ordering::Relaxed);
        let pc = self.create_peer_connection().await?;
        let client = Client::new(self, id.clone(), pc, options);
        self.register_data_channels(&client);

        let conflict = {
            let mut clients = self.clients.write();
            if clients.contains_key(&id) {
                true
            } else {
                clients.insert(id.clone(), Arc::clone(&client));
                false
            }
        };
        if conflict {
            let _ = client.stop().await;
            return Err(Error::ClientAlreadyExists(id));
        }
        info!(client_id = %id, "client added");
        self.notify_activity();

        for callback in self.on_client_added.snapshot() {
            callback(&client);
        }
        Ok(client)
    }

    fn register_data_channels(&self, client: &Arc<Client>) {
        let weak = self.weak_self.clone();
        let client_id = client.id().to_string();
        client
            .peer_connection()
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let weak = weak.clone();
                let client_id = client_id.clone();
                Box::pin(async move {
                    let Some(sfu) = weak.upgrade() else { return };
                    debug!(client_id = %client_id, label = %channel.label(), "data channel opened");
                    sfu.data_channels
                        .entry(channel.label().to_string())
                        .or_default()
                        .insert(client_id, channel);
                })
            }));
    }

    /// Announces a publisher's initial tracks: fan them out to every other
    /// client, then ask everyone for a keyframe so new subscribers see a
    /// picture quickly.
    pub(crate) async fn publish_tracks(&self, client_id: &str, tracks: Vec<RemoteTrackVariant>) {
        let published: Vec<PublishedTrack> = tracks
            .into_iter()
            .map(|track| PublishedTrack {
                client_id: client_id.to_string(),
                track,
            })
            .collect();

        self.broadcast_tracks(&published).await;

        for client in self.client_snapshot() {
            client.request_key_frame().await;
        }

        let map: HashMap<String, PublishedTrack> = published
            .iter()
            .map(|track| (track.track.key(), track.clone()))
            .collect();
        for callback in self.on_track_published.snapshot() {
            callback(&map);
        }
        self.notify_activity();
    }

    /// Installs `tracks` on every client except their publisher, queueing a
    /// renegotiation wherever an addition calls for one.
    pub(crate) async fn broadcast_tracks(&self, tracks: &[PublishedTrack]) {
        for client in self.client_snapshot() {
            let mut renegotiate = false;
            for published in tracks {
                if client.id() != published.client_id {
                    renegotiate |= client.subscribe_remote(&published.track).await;
                }
            }
            if renegotiate {
                client.renegotiate();
            }
        }
    }

    /// Removes a track from every client. Returns whether anyone actually
    /// had it, so callers can decide on a renegotiation sweep.
    pub async fn remove_track(&self, stream_id: &str, track_id: &str) -> bool {
        let mut removed = false;
        for client in self.client_snapshot() {
            removed |= client.remove_published_track(stream_id, track_id).await;
        }
        if removed {
            self.notify_activity();
        }
        removed
    }

    /// Pushes every existing publisher's tracks to a freshly connected
    /// subscriber. Returns whether the subscriber needs a renegotiation.
    pub(crate) async fn sync_track(&self, client: &Client) -> bool {
        let current = client.get_current_tracks();

        let mut need_renegotiation = false;
        for other in self.client_snapshot() {
            if other.id() == client.id() {
                continue;
            }
            for track in other.remote_track_snapshot() {
                if current.contains_key(&track.key()) {
                    continue;
                }
                client.subscribe_remote(&track).await;
                // The publisher sends the next keyframe; without it the new
                // subscriber would stare at nothing until one happens by.
                other.request_key_frame().await;
                need_renegotiation = true;
            }
        }
        need_renegotiation
    }

    /// Queues a renegotiation on every client.
    pub fn renegotiate_all(&self) {
        for client in self.client_snapshot() {
            client.renegotiate();
        }
    }

    /// Snapshot of every published track in the room, keyed by
    /// `stream-track`.
    pub fn get_tracks(&self) -> HashMap<String, PublishedTrack> {
        let mut tracks = HashMap::new();
        for client in self.client_snapshot() {
            for track in client.remote_track_snapshot() {
                tracks.insert(
                    track.key(),
                    PublishedTrack {
                        client_id: client.id().to_string(),
                        track,
                    },
                );
            }
        }
        tracks
    }

    pub fn get_client(&self, id: &str) -> Result<Arc<Client>> {
        self.clients
            .read()
            .get(id)
            .cloned()
            .ok_or(Error::ClientNotFound)
    }

    pub fn get_clients(&self) -> Vec<Arc<Client>> {
        self.client_snapshot()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Total clients ever created on this SFU.
    pub fn created_count(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    /// Point-in-time statistics for the whole room.
    pub fn stats(&self) -> RoomStats {
        RoomStats::collect(&self.client_snapshot())
    }

    pub(crate) fn on_after_client_stopped(&self, id: &str) {
        let removed = self.clients.write().remove(id);

        for entry in self.data_channels.iter() {
            entry.value().remove(id);
        }

        if let Some(client) = removed {
            info!(client_id = %id, "client removed");
            for callback in self.on_client_removed.snapshot() {
                callback(&client);
            }
        }
        self.notify_activity();
    }

    /// Stops every client and shuts the room down. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping sfu");

        for client in self.client_snapshot() {
            if let Err(err) = client.stop().await {
                warn!(client_id = %client.id(), error = %err, "client stop failed");
            }
        }

        if let Some(callback) = self.on_stopped.read().clone() {
            callback();
        }
        self.cancel.cancel();
    }

    // ---- callbacks ----------------------------------------------------------

    pub fn on_client_added(
        &self,
        callback: impl Fn(&Arc<Client>) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.on_client_added.add(Arc::new(callback))
    }

    pub fn on_client_removed(
        &self,
        callback: impl Fn(&Arc<Client>) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.on_client_removed.add(Arc::new(callback))
    }

    pub fn on_track_published(
        &self,
        callback: impl Fn(&HashMap<String, PublishedTrack>) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.on_track_published.add(Arc::new(callback))
    }

    pub fn on_stopped(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_stopped.write() = Some(Arc::new(callback));
    }
}
