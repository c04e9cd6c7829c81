//! Inbound tracks and their fan-out
//!
//! One reader task per inbound RTP stream copies packets into every
//! attached client track. A simulcast source is an aggregate of up to
//! three layer tracks sharing a single subscriber list; each layer's
//! reader tags packets with its quality so the subscriber side can filter.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_remote::TrackRemote;
use webrtc::Error as RTCError;

use crate::bitrate::{BitrateEstimator, LayerActivity};
use crate::client::Client;
use crate::client_track::{ClientTrack, ClientTrackList};
use crate::sfu::Sfu;
use crate::types::{track_key, QualityLevel};

/// RTP read buffer, sized for an ethernet MTU.
const READ_BUFFER_SIZE: usize = 1500;

fn is_end_of_stream(err: &RTCError) -> bool {
    matches!(err, RTCError::ErrClosedPipe)
        || matches!(err, RTCError::Util(webrtc::util::Error::ErrBufferClosed))
}

/// A single-layer inbound track.
pub struct RemoteTrack {
    client_id: String,
    stream_id: String,
    track_id: String,
    kind: RTPCodecType,
    capability: RTCRtpCodecCapability,
    ssrc: u32,
    track: Arc<TrackRemote>,
    pc: Arc<RTCPeerConnection>,
    subscribers: ClientTrackList,
    estimator: BitrateEstimator,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    active: AtomicBool,
    ended: AtomicBool,
    cancel: CancellationToken,
}

impl RemoteTrack {
    pub(crate) fn new(
        client_id: &str,
        track: Arc<TrackRemote>,
        pc: Arc<RTCPeerConnection>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.to_string(),
            stream_id: track.stream_id().to_string(),
            track_id: track.id().to_string(),
            kind: track.kind(),
            capability: track.codec().capability,
            ssrc: track.ssrc(),
            track,
            pc,
            subscribers: ClientTrackList::new(),
            estimator: BitrateEstimator::default(),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            active: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            cancel,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn kind(&self) -> RTPCodecType {
        self.kind
    }

    pub fn capability(&self) -> RTCRtpCodecCapability {
        self.capability.clone()
    }

    pub fn mime_type(&self) -> &str {
        &self.capability.mime_type
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.ended.load(Ordering::SeqCst)
    }

    /// Smoothed inbound bitrate, in kbit/s.
    #[must_use]
    pub fn current_bitrate(&self) -> u32 {
        self.estimator.kbps()
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Attaches a subscriber; adding the same subscriber twice is a no-op.
    pub fn attach(&self, track: Arc<dyn ClientTrack>) -> bool {
        self.subscribers.add(track)
    }

    pub fn detach(&self, key: &str) {
        self.subscribers.remove(key);
    }

    /// Asks the publisher for a keyframe.
    pub async fn send_pli(&self) {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: self.ssrc,
        };
        if let Err(err) = self.pc.write_rtcp(&[Box::new(pli)]).await {
            debug!(track = %self.track_id, error = %err, "pli write failed");
        }
    }

    async fn on_packet(&self, packet: Packet) {
        let size = packet.payload.len();
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
        self.estimator.record(size);
        self.active.store(true, Ordering::SeqCst);

        for subscriber in self.subscribers.snapshot() {
            subscriber.push(packet.clone(), QualityLevel::None).await;
        }
    }

    /// Signals track-ended to every attached client track, exactly once.
    pub(crate) fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.active.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.subscribers.close_all();
    }

    /// Starts the reader task. It runs until end-of-stream or until the
    /// track scope is cancelled.
    pub(crate) fn spawn_read_loop(self: Arc<Self>, client: Weak<Client>, sfu: Weak<Sfu>) {
        let this = self;
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => return,
                    result = this.track.read(&mut buf) => match result {
                        Ok((packet, _)) => this.on_packet(packet).await,
                        Err(err) if is_end_of_stream(&err) => break,
                        Err(err) => {
                            // Transient read failures are survivable; scope
                            // cancellation ends the loop when the peer dies.
                            warn!(track = %this.track_id, error = %err, "remote track read error");
                        }
                    },
                }
            }

            info!(
                client_id = %this.client_id,
                track_id = %this.track_id,
                "remote track ended"
            );
            this.end();
            if let Some(client) = client.upgrade() {
                client.remove_remote_track(&track_key(&this.stream_id, &this.track_id));
            }
            if let Some(sfu) = sfu.upgrade() {
                if sfu.remove_track(&this.stream_id, &this.track_id).await {
                    sfu.renegotiate_all();
                }
            }
        });
    }
}

struct Layer {
    track: OnceLock<Arc<TrackRemote>>,
    ssrc: AtomicU32,
    base_timestamp: OnceLock<u32>,
    active: AtomicBool,
    estimator: BitrateEstimator,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl Layer {
    fn new() -> Self {
        Self {
            track: OnceLock::new(),
            ssrc: AtomicU32::new(0),
            base_timestamp: OnceLock::new(),
            active: AtomicBool::new(false),
            estimator: BitrateEstimator::default(),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }
}

/// A simulcast source: up to three layer tracks behind one subscriber list.
pub struct SimulcastTrack {
    client_id: String,
    stream_id: String,
    track_id: String,
    capability: RTCRtpCodecCapability,
    pc: Arc<RTCPeerConnection>,
    // Subscriber-visible timeline base, captured from the first packet of
    // whichever layer arrives first.
    base_timestamp: OnceLock<u32>,
    layers: [Layer; 3],
    subscribers: ClientTrackList,
    ended: AtomicBool,
    cancel: CancellationToken,
}

impl SimulcastTrack {
    pub(crate) fn new(
        client_id: &str,
        first_layer: &Arc<TrackRemote>,
        pc: Arc<RTCPeerConnection>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.to_string(),
            stream_id: first_layer.stream_id().to_string(),
            track_id: first_layer.id().to_string(),
            capability: first_layer.codec().capability,
            pc,
            base_timestamp: OnceLock::new(),
            layers: [Layer::new(), Layer::new(), Layer::new()],
            subscribers: ClientTrackList::new(),
            ended: AtomicBool::new(false),
            cancel,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn capability(&self) -> RTCRtpCodecCapability {
        self.capability.clone()
    }

    pub fn mime_type(&self) -> &str {
        &self.capability.mime_type
    }

    fn layer(&self, quality: QualityLevel) -> Option<&Layer> {
        match quality {
            QualityLevel::High => Some(&self.layers[0]),
            QualityLevel::Mid => Some(&self.layers[1]),
            QualityLevel::Low => Some(&self.layers[2]),
            QualityLevel::None => None,
        }
    }

    /// Timeline base presented to subscribers.
    #[must_use]
    pub fn base_timestamp(&self) -> u32 {
        self.base_timestamp.get().copied().unwrap_or(0)
    }

    /// The remote base timestamp captured from `quality`'s first packet.
    #[must_use]
    pub fn layer_base_timestamp(&self, quality: QualityLevel) -> u32 {
        self.layer(quality)
            .and_then(|layer| layer.base_timestamp.get().copied())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_layer_active(&self, quality: QualityLevel) -> bool {
        !self.ended.load(Ordering::SeqCst)
            && self
                .layer(quality)
                .is_some_and(|layer| layer.active.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn activity(&self) -> LayerActivity {
        LayerActivity {
            high: self.is_layer_active(QualityLevel::High),
            mid: self.is_layer_active(QualityLevel::Mid),
            low: self.is_layer_active(QualityLevel::Low),
        }
    }

    /// Inbound bitrate of one layer, in kbit/s.
    #[must_use]
    pub fn layer_bitrate(&self, quality: QualityLevel) -> u32 {
        self.layer(quality)
            .map_or(0, |layer| layer.estimator.kbps())
    }

    /// The underlying transport track of one layer, once it has appeared.
    #[must_use]
    pub fn layer_track(&self, quality: QualityLevel) -> Option<Arc<TrackRemote>> {
        self.layer(quality).and_then(|layer| layer.track.get().cloned())
    }

    pub fn packets_received(&self) -> u64 {
        self.layers
            .iter()
            .map(|l| l.packets_received.load(Ordering::Relaxed))
            .sum()
    }

    pub fn bytes_received(&self) -> u64 {
        self.layers
            .iter()
            .map(|l| l.bytes_received.load(Ordering::Relaxed))
            .sum()
    }

    /// Attaches a subscriber; adding the same subscriber twice is a no-op.
    pub fn attach(&self, track: Arc<dyn ClientTrack>) -> bool {
        self.subscribers.add(track)
    }

    pub fn detach(&self, key: &str) {
        self.subscribers.remove(key);
    }

    /// Asks the publisher for a keyframe on `quality`, falling back to any
    /// known layer when that one has not appeared yet.
    pub async fn send_pli(&self, quality: QualityLevel) {
        let ssrc = self
            .layer(quality)
            .map(|layer| layer.ssrc.load(Ordering::Relaxed))
            .filter(|ssrc| *ssrc != 0)
            .or_else(|| {
                self.layers
                    .iter()
                    .map(|layer| layer.ssrc.load(Ordering::Relaxed))
                    .find(|ssrc| *ssrc != 0)
            });
        let Some(media_ssrc) = ssrc else {
            return;
        };

        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        if let Err(err) = self.pc.write_rtcp(&[Box::new(pli)]).await {
            debug!(track = %self.track_id, layer = %quality, error = %err, "pli write failed");
        }
    }

    async fn on_packet(&self, quality: QualityLevel, packet: Packet) {
        let Some(layer) = self.layer(quality) else {
            return;
        };

        self.base_timestamp
            .get_or_init(|| packet.header.timestamp);
        layer.base_timestamp.get_or_init(|| packet.header.timestamp);

        let size = packet.payload.len();
        layer.packets_received.fetch_add(1, Ordering::Relaxed);
        layer.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
        layer.estimator.record(size);
        layer.active.store(true, Ordering::SeqCst);

        for subscriber in self.subscribers.snapshot() {
            subscriber.push(packet.clone(), quality).await;
        }
    }

    /// Signals track-ended to every attached client track, exactly once,
    /// no matter how many layer closures race here.
    pub(crate) fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        for layer in &self.layers {
            layer.active.store(false, Ordering::SeqCst);
        }
        self.cancel.cancel();
        self.subscribers.close_all();
    }

    /// Registers the layer track carrying `quality` and starts its reader.
    pub(crate) fn spawn_layer(
        self: Arc<Self>,
        quality: QualityLevel,
        track: Arc<TrackRemote>,
        client: Weak<Client>,
        sfu: Weak<Sfu>,
    ) {
        let Some(layer) = self.layer(quality) else {
            return;
        };
        layer.ssrc.store(track.ssrc(), Ordering::Relaxed);
        if layer.track.set(Arc::clone(&track)).is_err() {
            debug!(track = %self.track_id, layer = %quality, "layer already registered");
            return;
        }

        let this = self;
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => return,
                    result = track.read(&mut buf) => match result {
                        Ok((packet, _)) => this.on_packet(quality, packet).await,
                        Err(err) if is_end_of_stream(&err) => break,
                        Err(err) => {
                            warn!(
                                track = %this.track_id,
                                layer = %quality,
                                error = %err,
                                "remote layer read error"
                            );
                        }
                    },
                }
            }

            info!(
                client_id = %this.client_id,
                track_id = %this.track_id,
                layer = %quality,
                "simulcast layer ended"
            );
            if let Some(layer) = this.layer(quality) {
                layer.active.store(false, Ordering::SeqCst);
            }
            this.end();
            if let Some(client) = client.upgrade() {
                client.remove_remote_track(&track_key(&this.stream_id, &this.track_id));
            }
            if let Some(sfu) = sfu.upgrade() {
                if sfu.remove_track(&this.stream_id, &this.track_id).await {
                    sfu.renegotiate_all();
                }
            }
        });
    }
}

/// A published inbound source, simulcast or not.
#[derive(Clone)]
pub enum RemoteTrackVariant {
    Plain(Arc<RemoteTrack>),
    Simulcast(Arc<SimulcastTrack>),
}

impl RemoteTrackVariant {
    #[must_use]
    pub fn stream_id(&self) -> &str {
        match self {
            Self::Plain(track) => track.stream_id(),
            Self::Simulcast(track) => track.stream_id(),
        }
    }

    #[must_use]
    pub fn track_id(&self) -> &str {
        match self {
            Self::Plain(track) => track.track_id(),
            Self::Simulcast(track) => track.track_id(),
        }
    }

    #[must_use]
    pub fn key(&self) -> String {
        track_key(self.stream_id(), self.track_id())
    }

    #[must_use]
    pub fn kind(&self) -> RTPCodecType {
        match self {
            Self::Plain(track) => track.kind(),
            Self::Simulcast(_) => RTPCodecType::Video,
        }
    }

    #[must_use]
    pub fn capability(&self) -> RTCRtpCodecCapability {
        match self {
            Self::Plain(track) => track.capability(),
            Self::Simulcast(track) => track.capability(),
        }
    }

    #[must_use]
    pub const fn is_simulcast(&self) -> bool {
        matches!(self, Self::Simulcast(_))
    }

    #[must_use]
    pub fn mime_type(&self) -> &str {
        match self {
            Self::Plain(track) => track.mime_type(),
            Self::Simulcast(track) => track.mime_type(),
        }
    }

    #[must_use]
    pub fn packets_received(&self) -> u64 {
        match self {
            Self::Plain(track) => track.packets_received(),
            Self::Simulcast(track) => track.packets_received(),
        }
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        match self {
            Self::Plain(track) => track.bytes_received(),
            Self::Simulcast(track) => track.bytes_received(),
        }
    }

    /// Smoothed inbound bitrate across the source, in kbit/s.
    #[must_use]
    pub fn current_bitrate(&self) -> u32 {
        match self {
            Self::Plain(track) => track.current_bitrate(),
            Self::Simulcast(track) => {
                track.layer_bitrate(QualityLevel::High)
                    + track.layer_bitrate(QualityLevel::Mid)
                    + track.layer_bitrate(QualityLevel::Low)
            }
        }
    }

    pub fn detach(&self, key: &str) {
        match self {
            Self::Plain(track) => track.detach(key),
            Self::Simulcast(track) => track.detach(key),
        }
    }

    pub(crate) fn end(&self) {
        match self {
            Self::Plain(track) => track.end(),
            Self::Simulcast(track) => track.end(),
        }
    }
}

/// A track as announced to `on_track_published` subscribers.
#[derive(Clone)]
pub struct PublishedTrack {
    pub client_id: String,
    pub track: RemoteTrackVariant,
}
