//! Per-client state: one peer connection, its signaling state machine, the
//! tracks it publishes and the tracks forwarded to it
//!
//! All signaling transactions run on the client's operation queue, so the
//! negotiation flags never see concurrent transitions; they exist as
//! observable state for the rest of the system.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::bitrate::{BitrateController, TrackCounts};
use crate::callback::{CallbackHandle, CallbackList};
use crate::client_track::{ClientTrack, ClientTrackList, PlainClientTrack, SimulcastClientTrack};
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::queue::{operation_queue, OperationConsumer, OperationQueue, QueueItem};
use crate::remote_track::{RemoteTrack, RemoteTrackVariant, SimulcastTrack};
use crate::sfu::Sfu;
use crate::types::{track_key, ClientState, ClientType, QualityLevel, TrackSource};

type RenegotiationFuture = Pin<Box<dyn Future<Output = Result<RTCSessionDescription>> + Send>>;
/// Outbound request to the signaling layer: deliver this offer to the
/// remote peer and come back with its answer.
pub type OnRenegotiationFn =
    dyn Fn(RTCSessionDescription) -> RenegotiationFuture + Send + Sync;
type OnIceCandidateFn = dyn Fn(RTCIceCandidate) + Send + Sync;
type OnTrackChangedFn = dyn Fn(TrackSource, Arc<TrackLocalStaticRTP>) + Send + Sync;
type PlainFn = dyn Fn() + Send + Sync;
type OnStateFn = dyn Fn(RTCPeerConnectionState) + Send + Sync;

/// The maps behind the client's single reader/writer lock. Held only for
/// individual map mutations, never across an await.
#[derive(Default)]
struct ClientMaps {
    /// Inbound sources this client publishes, keyed by `stream-track`.
    remote_tracks: HashMap<String, RemoteTrackVariant>,
    /// Sources seen but not yet announced to the room.
    pending_published: HashMap<String, RemoteTrackVariant>,
    /// Outbound tracks waiting for the connection to come up.
    pending_received: HashMap<String, Arc<TrackLocalStaticRTP>>,
    /// Outbound tracks installed on the peer connection.
    published: HashMap<String, Arc<TrackLocalStaticRTP>>,
    pending_remote_candidates: Vec<RTCIceCandidateInit>,
    pending_local_candidates: Vec<RTCIceCandidate>,
}

/// One participant: a peer connection plus everything the SFU tracks for it.
pub struct Client {
    id: String,
    options: ClientOptions,
    pc: Arc<RTCPeerConnection>,
    sfu: Weak<Sfu>,
    weak_self: Weak<Client>,
    cancel: CancellationToken,
    state: AtomicU8,

    in_local_renegotiation: AtomicBool,
    in_remote_negotiation: AtomicBool,
    pending_remote_renegotiation: AtomicBool,
    negotiation_needed: AtomicBool,
    can_add_candidate: AtomicBool,
    initial_tracks_count: AtomicUsize,
    joined: AtomicBool,
    closed: AtomicBool,

    queue: OperationQueue<QueueItem>,
    maps: RwLock<ClientMaps>,
    /// Tracks forwarded to this client, as a subscriber.
    client_tracks: ClientTrackList,
    bitrate_controller: BitrateController,
    idle: Mutex<Option<CancellationToken>>,

    on_connection_state_changed: CallbackList<OnStateFn>,
    on_joined: CallbackList<PlainFn>,
    on_left: CallbackList<PlainFn>,
    on_track_added: CallbackList<OnTrackChangedFn>,
    on_track_removed: CallbackList<OnTrackChangedFn>,
    on_ice_candidate: RwLock<Option<Arc<OnIceCandidateFn>>>,
    on_renegotiation: RwLock<Option<Arc<OnRenegotiationFn>>>,
    on_allowed_remote_renegotiation: RwLock<Option<Arc<PlainFn>>>,
}

impl Client {
    pub(crate) fn new(
        sfu: &Sfu,
        id: String,
        pc: Arc<RTCPeerConnection>,
        options: ClientOptions,
    ) -> Arc<Self> {
        let (queue, consumer) = operation_queue();
        let client = Arc::new_cyclic(|weak_self| Self {
            id,
            bitrate_controller: BitrateController::new(sfu.config().bitrates.clone()),
            options,
            pc,
            sfu: sfu.weak_handle(),
            weak_self: weak_self.clone(),
            cancel: sfu.cancel_token().child_token(),
            state: AtomicU8::new(ClientState::New.as_u8()),
            in_local_renegotiation: AtomicBool::new(false),
            in_remote_negotiation: AtomicBool::new(false),
            pending_remote_renegotiation: AtomicBool::new(false),
            negotiation_needed: AtomicBool::new(false),
            can_add_candidate: AtomicBool::new(false),
            initial_tracks_count: AtomicUsize::new(0),
            joined: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            queue,
            maps: RwLock::new(ClientMaps::default()),
            client_tracks: ClientTrackList::new(),
            idle: Mutex::new(None),
            on_connection_state_changed: CallbackList::new(),
            on_joined: CallbackList::new(),
            on_left: CallbackList::new(),
            on_track_added: CallbackList::new(),
            on_track_removed: CallbackList::new(),
            on_ice_candidate: RwLock::new(None),
            on_renegotiation: RwLock::new(None),
            on_allowed_remote_renegotiation: RwLock::new(None),
        });

        client.wire_peer_connection();
        client.start(consumer, sfu.config().keyframe_interval);
        client
    }

    /// Installs the peer connection handlers. Each one holds a weak
    /// reference; the registry owns the only strong one.
    fn wire_peer_connection(&self) {
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                debug!(state = %state, "ice connection state changed");
                Box::pin(async {})
            }));

        let weak = self.weak_self.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(client) = weak.upgrade() {
                        client.handle_connection_state(state).await;
                    }
                })
            }));

        let weak = self.weak_self.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(client) = weak.upgrade() {
                    client.handle_incoming_track(track).await;
                }
            })
        }));

        let weak = self.weak_self.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let (Some(client), Some(candidate)) = (weak.upgrade(), candidate) {
                        client.handle_local_candidate(candidate);
                    }
                })
            }));
    }

    /// Spawns the operation-queue consumer and the periodic keyframe
    /// request, both bound to the client scope.
    fn start(&self, consumer: OperationConsumer, keyframe_interval: Duration) {
        let weak = self.weak_self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            consumer
                .run(
                    cancel,
                    move |item| {
                        let weak = weak.clone();
                        async move {
                            match weak.upgrade() {
                                Some(client) => client.run_queue_item(item).await,
                                None => item.cancel(),
                            }
                        }
                    },
                    QueueItem::cancel,
                )
                .await;
        });

        let weak = self.weak_self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keyframe_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let Some(client) = weak.upgrade() else { return };
                        if client.connection_state() == RTCPeerConnectionState::Connected {
                            client.request_key_frame().await;
                        }
                    }
                }
            }
        });
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_type(&self) -> ClientType {
        self.options.client_type
    }

    pub fn direction(&self) -> RTCRtpTransceiverDirection {
        self.options.direction
    }

    #[must_use]
    pub fn is_bridge(&self) -> bool {
        self.options.client_type.is_bridge()
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    pub(crate) fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    pub fn bitrate_controller(&self) -> &BitrateController {
        &self.bitrate_controller
    }

    /// Updates the subscriber's reported bandwidth estimate, in kbit/s.
    pub fn set_consumer_bandwidth(&self, kbps: u32) {
        self.bitrate_controller.set_bandwidth(kbps);
    }

    pub(crate) fn track_counts(&self) -> TrackCounts {
        self.client_tracks.counts()
    }

    pub(crate) fn client_tracks(&self) -> &ClientTrackList {
        &self.client_tracks
    }

    pub fn is_in_local_renegotiation(&self) -> bool {
        self.in_local_renegotiation.load(Ordering::SeqCst)
    }

    pub fn is_in_remote_negotiation(&self) -> bool {
        self.in_remote_negotiation.load(Ordering::SeqCst)
    }

    pub fn is_pending_remote_renegotiation(&self) -> bool {
        self.pending_remote_renegotiation.load(Ordering::SeqCst)
    }

    pub fn initial_tracks_count(&self) -> usize {
        self.initial_tracks_count.load(Ordering::SeqCst)
    }

    // ---- signaling -------------------------------------------------------

    /// Applies a remote offer and returns the answer. The work runs on the
    /// operation queue; this call waits for its turn.
    pub async fn negotiate(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        // A renegotiation offer is only valid after the remote side asked
        // for permission (or granted ours); the first offer is always fine.
        if self.pc.remote_description().await.is_some()
            && !self.in_remote_negotiation.load(Ordering::SeqCst)
        {
            return Err(Error::NegotiationNotRequested);
        }

        let (reply, rx) = tokio::sync::oneshot::channel();
        self.queue.push(QueueItem::Negotiate { offer, reply })?;
        rx.await.map_err(|_| Error::ClientStopped)?
    }

    /// Asks whether the remote side may start a negotiation right now. A
    /// refusal records the request; the permission callback fires once the
    /// running local renegotiation completes.
    pub fn is_allow_negotiation(&self) -> bool {
        if self.in_local_renegotiation.load(Ordering::SeqCst) {
            self.pending_remote_renegotiation
                .store(true, Ordering::SeqCst);
            return false;
        }
        self.in_remote_negotiation.store(true, Ordering::SeqCst);
        true
    }

    /// Requests a local renegotiation sweep. Safe to call from anywhere;
    /// the queue folds concurrent requests into one running loop.
    pub fn renegotiate(&self) {
        let _ = self.queue.push(QueueItem::Renegotiate);
    }

    /// Queues the permission grant for a remote renegotiation; the
    /// `on_allowed_remote_renegotiation` callback fires when it runs.
    pub fn allow_remote_renegotiation(&self) {
        let _ = self.queue.push(QueueItem::AllowRemoteRenegotiation);
    }

    async fn run_queue_item(&self, item: QueueItem) {
        match item {
            QueueItem::Negotiate { offer, reply } => {
                let result = self.negotiate_op(offer).await;
                let _ = reply.send(result);
            }
            QueueItem::Renegotiate => self.renegotiate_op().await,
            QueueItem::AllowRemoteRenegotiation => self.allow_remote_renegotiation_op(),
        }
    }

    async fn negotiate_op(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        self.in_remote_negotiation.store(true, Ordering::SeqCst);
        let result = self.negotiate_inner(offer).await;
        self.in_remote_negotiation.store(false, Ordering::SeqCst);
        result
    }

    async fn negotiate_inner(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        let transceivers_before = self.pc.get_transceivers().await.len();

        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;

        // The local description exists now, so candidates can flow.
        self.can_add_candidate.store(true, Ordering::SeqCst);

        let pending: Vec<RTCIceCandidateInit> =
            std::mem::take(&mut self.maps.write().pending_remote_candidates);
        for candidate in pending {
            if let Err(err) = self.pc.add_ice_candidate(candidate).await {
                warn!(client_id = %self.id, error = %err, "buffered ice candidate rejected");
            }
        }

        let transceivers_after = self.pc.get_transceivers().await.len();
        self.initial_tracks_count.store(
            transceivers_after.saturating_sub(transceivers_before),
            Ordering::SeqCst,
        );

        self.send_pending_local_candidates();

        self.pc
            .local_description()
            .await
            .ok_or_else(|| Error::WebRtc(webrtc::Error::new("local description missing".to_owned())))
    }

    async fn renegotiate_op(&self) {
        self.negotiation_needed.store(true, Ordering::SeqCst);

        if self.in_remote_negotiation.load(Ordering::SeqCst) {
            info!(
                client_id = %self.id,
                "renegotiation delayed, remote client is negotiating"
            );
            return;
        }

        // A running loop re-checks the flag; no second loop needed.
        if self.in_local_renegotiation.load(Ordering::SeqCst) {
            return;
        }

        self.in_local_renegotiation.store(true, Ordering::SeqCst);

        while self.negotiation_needed.swap(false, Ordering::SeqCst) {
            if self.state() == ClientState::Ended
                || self.pc.signaling_state() != RTCSignalingState::Stable
                || self.pc.connection_state() != RTCPeerConnectionState::Connected
            {
                continue;
            }

            let offer = match self.pc.create_offer(None).await {
                Ok(offer) => offer,
                Err(err) => {
                    error!(client_id = %self.id, error = %err, "create offer failed");
                    break;
                }
            };
            if let Err(err) = self.pc.set_local_description(offer).await {
                error!(client_id = %self.id, error = %err, "set local description failed");
                break;
            }
            self.can_add_candidate.store(true, Ordering::SeqCst);
            self.send_pending_local_candidates();

            let Some(local) = self.pc.local_description().await else {
                error!(client_id = %self.id, "local description missing after offer");
                break;
            };
            let Some(callback) = self.on_renegotiation.read().clone() else {
                warn!(client_id = %self.id, "no renegotiation handler installed");
                break;
            };

            // Blocks until the signaling round trip completes; more tracks
            // may land meanwhile, which is what the loop re-check is for.
            let answer = match callback(local).await {
                Ok(answer) => answer,
                Err(err) => {
                    // TODO: close the client here and ask the remote side
                    // to reconnect instead of leaving it half-negotiated.
                    error!(client_id = %self.id, error = %err, "renegotiation callback failed");
                    break;
                }
            };
            if answer.sdp_type != RTCSdpType::Answer {
                error!(
                    client_id = %self.id,
                    sdp_type = %answer.sdp_type,
                    "renegotiation reply is not an answer"
                );
                break;
            }
            if let Err(err) = self.pc.set_remote_description(answer).await {
                error!(client_id = %self.id, error = %err, "set remote description failed");
                break;
            }
        }

        self.in_local_renegotiation.store(false, Ordering::SeqCst);

        // A remote offer was refused while we were busy; grant it now.
        if self.pending_remote_renegotiation.swap(false, Ordering::SeqCst) {
            let _ = self.queue.push(QueueItem::AllowRemoteRenegotiation);
        }
    }

    fn allow_remote_renegotiation_op(&self) {
        if let Some(callback) = self.on_allowed_remote_renegotiation.read().clone() {
            self.in_remote_negotiation.store(true, Ordering::SeqCst);
            callback();
        }
    }

    // ---- bridge negotiation ----------------------------------------------

    /// Creates the server-side offer for a bridge client. The answer goes
    /// back through [`Client::complete_negotiation`].
    pub async fn init_negotiation(&self) -> Result<RTCSessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.can_add_candidate.store(true, Ordering::SeqCst);
        self.send_pending_local_candidates();
        self.pc
            .local_description()
            .await
            .ok_or_else(|| Error::WebRtc(webrtc::Error::new("local description missing".to_owned())))
    }

    pub async fn complete_negotiation(&self, answer: RTCSessionDescription) -> Result<()> {
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    // ---- ice candidates ---------------------------------------------------

    /// Adds a remote candidate, buffering it when the remote description is
    /// not set yet. Buffered candidates never fail.
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        if self.pc.remote_description().await.is_none() {
            self.maps.write().pending_remote_candidates.push(candidate);
            return Ok(());
        }
        self.pc.add_ice_candidate(candidate).await.map_err(|err| {
            warn!(client_id = %self.id, error = %err, "add ice candidate failed");
            Error::from(err)
        })
    }

    fn handle_local_candidate(&self, candidate: RTCIceCandidate) {
        if self.can_add_candidate.load(Ordering::SeqCst) {
            self.emit_ice_candidate(candidate);
            return;
        }
        self.maps.write().pending_local_candidates.push(candidate);
    }

    fn emit_ice_candidate(&self, candidate: RTCIceCandidate) {
        if let Some(callback) = self.on_ice_candidate.read().clone() {
            callback(candidate);
        }
    }

    fn send_pending_local_candidates(&self) {
        let pending: Vec<RTCIceCandidate> =
            std::mem::take(&mut self.maps.write().pending_local_candidates);
        for candidate in pending {
            self.emit_ice_candidate(candidate);
        }
    }

    // ---- inbound tracks (publisher side) -----------------------------------

    async fn handle_incoming_track(&self, track: Arc<TrackRemote>) {
        self.set_state(ClientState::Active);

        let stream_id = track.stream_id().to_string();
        let track_id = track.id().to_string();
        let rid = track.rid().to_string();
        let key = track_key(&stream_id, &track_id);
        info!(
            client_id = %self.id,
            stream_id = %stream_id,
            track_id = %track_id,
            rid = %rid,
            kind = %track.kind(),
            "incoming track"
        );

        let variant = if rid.is_empty() {
            let remote = RemoteTrack::new(
                &self.id,
                track,
                Arc::clone(&self.pc),
                self.cancel.child_token(),
            );
            Arc::clone(&remote).spawn_read_loop(self.weak_self.clone(), self.sfu.clone());
            RemoteTrackVariant::Plain(remote)
        } else {
            let Some(quality) = QualityLevel::from_rid(&rid) else {
                warn!(client_id = %self.id, rid = %rid, "unknown simulcast rid");
                return;
            };
            let aggregate = {
                let mut maps = self.maps.write();
                match maps.remote_tracks.get(&key) {
                    Some(RemoteTrackVariant::Simulcast(existing)) => Arc::clone(existing),
                    _ => {
                        let created = SimulcastTrack::new(
                            &self.id,
                            &track,
                            Arc::clone(&self.pc),
                            self.cancel.child_token(),
                        );
                        maps.remote_tracks
                            .insert(key.clone(), RemoteTrackVariant::Simulcast(Arc::clone(&created)));
                        created
                    }
                }
            };
            Arc::clone(&aggregate).spawn_layer(
                quality,
                track,
                self.weak_self.clone(),
                self.sfu.clone(),
            );
            RemoteTrackVariant::Simulcast(aggregate)
        };

        let pending_count = {
            let mut maps = self.maps.write();
            maps.remote_tracks.insert(key.clone(), variant.clone());
            maps.pending_published.insert(key, variant);
            maps.pending_published.len()
        };

        // A peer announces how many tracks its first offer carries; hold
        // the publish until they have all arrived.
        if self.options.client_type == ClientType::Peer
            && self.initial_tracks_count.load(Ordering::SeqCst) > pending_count
        {
            return;
        }

        let pending: Vec<RemoteTrackVariant> = self
            .maps
            .read()
            .pending_published
            .values()
            .cloned()
            .collect();
        if let Some(sfu) = self.sfu.upgrade() {
            sfu.publish_tracks(&self.id, pending).await;
        }
    }

    pub(crate) fn remove_remote_track(&self, key: &str) {
        let mut maps = self.maps.write();
        maps.remote_tracks.remove(key);
        maps.pending_published.remove(key);
    }

    pub(crate) fn remote_track_snapshot(&self) -> Vec<RemoteTrackVariant> {
        self.maps.read().remote_tracks.values().cloned().collect()
    }

    // ---- outbound tracks (subscriber side) ----------------------------------

    /// Builds the forwarded track for `source` and installs it on this
    /// subscriber. Returns whether a renegotiation is now needed.
    pub(crate) async fn subscribe_remote(&self, source: &RemoteTrackVariant) -> bool {
        let local = Arc::new(TrackLocalStaticRTP::new(
            source.capability(),
            source.track_id().to_string(),
            source.stream_id().to_string(),
        ));

        let client_track: Arc<dyn ClientTrack> = match source {
            RemoteTrackVariant::Plain(remote) => PlainClientTrack::new(
                self.weak_self.clone(),
                &self.id,
                Arc::clone(remote),
                Arc::clone(&local),
            ),
            RemoteTrackVariant::Simulcast(remote) => SimulcastClientTrack::new(
                self.weak_self.clone(),
                &self.id,
                Arc::clone(remote),
                Arc::clone(&local),
            ),
        };

        // When the source ends, drop this forwarded track everywhere it is
        // referenced; the peer-connection level removal runs through the
        // SFU's remove_track sweep.
        {
            let source = source.clone();
            let key = client_track.key().to_string();
            let weak = self.weak_self.clone();
            client_track.on_ended(Box::new(move || {
                source.detach(&key);
                if let Some(client) = weak.upgrade() {
                    client.client_tracks.remove(&key);
                }
            }));
        }

        let attached = match source {
            RemoteTrackVariant::Plain(remote) => remote.attach(Arc::clone(&client_track)),
            RemoteTrackVariant::Simulcast(remote) => remote.attach(Arc::clone(&client_track)),
        };
        if !attached {
            return false;
        }
        self.client_tracks.add(client_track);

        self.add_track(local).await
    }

    /// Adds an outbound track, buffering it until the connection is up.
    /// Returns whether a renegotiation is now needed.
    pub(crate) async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> bool {
        if self.pc.ice_connection_state() != RTCIceConnectionState::Connected {
            let key = track_key(track.stream_id(), track.id());
            self.maps.write().pending_received.insert(key, track);
            return false;
        }

        self.set_client_track(track).await
    }

    async fn set_client_track(&self, track: Arc<TrackLocalStaticRTP>) -> bool {
        let key = track_key(track.stream_id(), track.id());
        {
            let mut maps = self.maps.write();
            if maps.published.contains_key(&key) {
                debug!(client_id = %self.id, track = %key, "track already published");
                return false;
            }
            maps.published.insert(key.clone(), Arc::clone(&track));
        }

        let sender = match self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            Ok(sender) => sender,
            Err(err) => {
                warn!(client_id = %self.id, track = %key, error = %err, "add track failed");
                self.maps.write().published.remove(&key);
                return false;
            }
        };

        self.spawn_rtcp_reader(sender);

        for callback in self.on_track_added.snapshot() {
            callback(TrackSource::Media, Arc::clone(&track));
        }
        true
    }

    /// Drains the tracks buffered while the connection was down. Returns
    /// whether any addition requires a renegotiation.
    pub(crate) async fn process_pending_tracks(&self) -> bool {
        let pending: Vec<Arc<TrackLocalStaticRTP>> = {
            let mut maps = self.maps.write();
            maps.pending_received.drain().map(|(_, track)| track).collect()
        };

        let mut any_added = false;
        for track in pending {
            any_added |= self.set_client_track(track).await;
        }
        any_added
    }

    /// Removes an outbound track from this subscriber. Returns whether
    /// anything was removed, so callers can decide on a renegotiation sweep.
    pub(crate) async fn remove_published_track(&self, stream_id: &str, track_id: &str) -> bool {
        let key = track_key(stream_id, track_id);
        let entry = self.maps.write().published.remove(&key);
        let removed = entry.is_some();

        if let Some(client_track) = self
            .client_tracks
            .remove(&format!("{}:{}", self.id, key))
        {
            client_track.mark_ended();
        }

        if self.pc.connection_state() == RTCPeerConnectionState::Closed {
            return false;
        }

        for sender in self.pc.get_senders().await {
            if let Some(track) = sender.track().await {
                if track.id() == track_id && track.stream_id() == stream_id {
                    if let Err(err) = self.pc.remove_track(&sender).await {
                        warn!(client_id = %self.id, track = %key, error = %err, "remove track failed");
                    }
                }
            }
        }

        if let Some(track) = entry {
            for callback in self.on_track_removed.snapshot() {
                callback(TrackSource::Media, Arc::clone(&track));
            }
        }
        removed
    }

    /// The outbound tracks currently installed, keyed by `stream-track`.
    /// Empty once the connection is closed or failed.
    pub fn get_current_tracks(&self) -> HashMap<String, Arc<TrackLocalStaticRTP>> {
        match self.pc.connection_state() {
            RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => HashMap::new(),
            _ => self
                .maps
                .read()
                .published
                .iter()
                .map(|(key, track)| (key.clone(), Arc::clone(track)))
                .collect(),
        }
    }

    fn spawn_rtcp_reader(&self, sender: Arc<RTCRtpSender>) {
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        if let Err(err) = sender.stop().await {
                            debug!(error = %err, "rtp sender stop failed");
                        }
                        return;
                    }
                    result = sender.read(&mut buf) => if result.is_err() {
                        return;
                    }
                }
            }
        });
    }

    /// Asks every publisher this client receives from for a keyframe.
    pub async fn request_key_frame(&self) {
        for receiver in self.pc.get_receivers().await {
            for track in receiver.tracks().await {
                let pli = PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc: track.ssrc(),
                };
                let _ = self.pc.write_rtcp(&[Box::new(pli)]).await;
            }
        }
    }

    // ---- lifecycle ----------------------------------------------------------

    async fn handle_connection_state(&self, state: RTCPeerConnectionState) {
        info!(client_id = %self.id, state = %state, "connection state changed");

        if self.state() != ClientState::Ended {
            for callback in self.on_connection_state_changed.snapshot() {
                callback(state);
            }
        }

        match state {
            RTCPeerConnectionState::Connected => {
                self.cancel_idle_timeout();
                if self.state() == ClientState::Restart {
                    self.set_state(ClientState::Active);
                }
                if !self.joined.swap(true, Ordering::SeqCst) {
                    for callback in self.on_joined.snapshot() {
                        callback();
                    }
                }

                let mut need_renegotiation = false;
                if !self.maps.read().pending_received.is_empty() {
                    need_renegotiation |= self.process_pending_tracks().await;
                }

                if matches!(
                    self.options.direction,
                    RTCRtpTransceiverDirection::Recvonly | RTCRtpTransceiverDirection::Sendrecv
                ) {
                    if let Some(sfu) = self.sfu.upgrade() {
                        need_renegotiation |= sfu.sync_track(self).await;
                    }
                }

                if need_renegotiation {
                    debug!(client_id = %self.id, "renegotiating after connect sync");
                    self.renegotiate();
                }
            }
            RTCPeerConnectionState::Connecting => self.cancel_idle_timeout(),
            RTCPeerConnectionState::Failed => {
                if self.state() == ClientState::Active {
                    self.set_state(ClientState::Restart);
                }
                self.start_idle_timeout();
            }
            RTCPeerConnectionState::Closed => {
                self.after_closed().await;
            }
            _ => {}
        }
    }

    /// Final cleanup: ends the published sources, removes them from the
    /// room, and unregisters the client. Runs at most once.
    async fn after_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ClientState::Ended);

        let remote_tracks: Vec<RemoteTrackVariant> = {
            let mut maps = self.maps.write();
            maps.pending_published.clear();
            maps.remote_tracks.drain().map(|(_, track)| track).collect()
        };

        let mut need_renegotiation = false;
        for track in remote_tracks {
            track.end();
            if let Some(sfu) = self.sfu.upgrade() {
                need_renegotiation |= sfu
                    .remove_track(track.stream_id(), track.track_id())
                    .await;
            }
        }
        if need_renegotiation {
            if let Some(sfu) = self.sfu.upgrade() {
                sfu.renegotiate_all();
            }
        }

        self.client_tracks.close_all();
        self.cancel.cancel();

        for callback in self.on_left.snapshot() {
            callback();
        }

        if let Some(sfu) = self.sfu.upgrade() {
            sfu.on_after_client_stopped(&self.id);
        }
    }

    /// Stops the client. A second stop returns [`Error::ClientStopped`];
    /// an ended client never comes back.
    pub async fn stop(&self) -> Result<()> {
        if self.state() == ClientState::Ended {
            return Err(Error::ClientStopped);
        }
        self.set_state(ClientState::Ended);

        self.pc.close().await?;
        self.after_closed().await;
        Ok(())
    }

    fn start_idle_timeout(&self) {
        let mut slot = self.idle.lock();
        if slot.is_some() {
            return;
        }
        let token = self.cancel.child_token();
        *slot = Some(token.clone());
        drop(slot);

        let weak = self.weak_self.clone();
        let timeout = self.options.idle_timeout;
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    if let Some(client) = weak.upgrade() {
                        warn!(client_id = %client.id, "idle timeout reached, stopping client");
                        let _ = client.stop().await;
                    }
                }
            }
        });
    }

    fn cancel_idle_timeout(&self) {
        if let Some(token) = self.idle.lock().take() {
            token.cancel();
        }
    }

    // ---- callbacks ------------------------------------------------------------

    pub fn on_connection_state_changed(
        &self,
        callback: impl Fn(RTCPeerConnectionState) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.on_connection_state_changed.add(Arc::new(callback))
    }

    pub fn on_joined(&self, callback: impl Fn() + Send + Sync + 'static) -> CallbackHandle {
        self.on_joined.add(Arc::new(callback))
    }

    pub fn on_left(&self, callback: impl Fn() + Send + Sync + 'static) -> CallbackHandle {
        self.on_left.add(Arc::new(callback))
    }

    pub fn on_track_added(
        &self,
        callback: impl Fn(TrackSource, Arc<TrackLocalStaticRTP>) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.on_track_added.add(Arc::new(callback))
    }

    pub fn on_track_removed(
        &self,
        callback: impl Fn(TrackSource, Arc<TrackLocalStaticRTP>) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.on_track_removed.add(Arc::new(callback))
    }

    /// Installs the candidate-output callback toward the signaling layer.
    pub fn on_ice_candidate(&self, callback: impl Fn(RTCIceCandidate) + Send + Sync + 'static) {
        *self.on_ice_candidate.write() = Some(Arc::new(callback));
    }

    /// Installs the renegotiation round trip: the callback delivers a local
    /// offer to the remote peer and resolves with its answer.
    pub fn on_renegotiation<F, Fut>(&self, callback: F)
    where
        F: Fn(RTCSessionDescription) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RTCSessionDescription>> + Send + 'static,
    {
        *self.on_renegotiation.write() =
            Some(Arc::new(move |offer| Box::pin(callback(offer)) as RenegotiationFuture));
    }

    /// Installs the callback fired when a refused remote negotiation is
    /// finally allowed to proceed.
    pub fn on_allowed_remote_renegotiation(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_allowed_remote_renegotiation.write() = Some(Arc::new(callback));
    }
}
