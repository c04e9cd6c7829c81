//! Subscriber-side forwarded tracks
//!
//! A client track is one (publisher track, subscriber) pair: it consumes
//! packets from a remote track's fan-out and writes them to the
//! subscriber's outbound track. The simulcast variant additionally decides
//! per packet which layer the subscriber should get, and rewrites RTP
//! timestamps and sequence numbers so the outbound stream stays continuous
//! across layer switches.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::warn;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::Error as RTCError;

use crate::bitrate::TrackCounts;
use crate::callback::{CallbackHandle, CallbackList};
use crate::client::Client;
use crate::keyframe;
use crate::remote_track::{RemoteTrack, SimulcastTrack};
use crate::types::{track_key, QualityLevel, TrackSource};

type OnEndedFn = dyn Fn() + Send + Sync;

/// Moves a packet timestamp from a layer's remote timeline onto the
/// subscriber-visible timeline, keeping it continuous across layer
/// switches.
fn rebase_timestamp(base: u32, timestamp: u32, layer_base: u32) -> u32 {
    base.wrapping_add(timestamp.wrapping_sub(layer_base))
}

/// Next outbound sequence number: dense, strictly increasing by one.
fn next_sequence(counter: &AtomicU16) -> u16 {
    counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
}

/// One forwarded track, as seen by the fan-out plane.
#[async_trait]
pub trait ClientTrack: Send + Sync {
    /// Unique identity within any track list: subscriber + source key.
    fn key(&self) -> &str;
    fn track_id(&self) -> &str;
    fn stream_id(&self) -> &str;
    fn kind(&self) -> RTPCodecType;
    fn is_simulcast(&self) -> bool;
    fn is_screen(&self) -> bool;
    fn set_source(&self, source: TrackSource);
    /// Bitrate currently flowing on the source side, in kbit/s.
    fn current_bitrate(&self) -> u32;
    fn local_track(&self) -> Arc<TrackLocalStaticRTP>;
    fn packets_sent(&self) -> u64;
    fn bytes_sent(&self) -> u64;
    fn last_quality(&self) -> QualityLevel;
    /// Forward one packet tagged with the layer it arrived on.
    async fn push(&self, packet: Packet, layer: QualityLevel);
    fn on_ended(&self, callback: Box<OnEndedFn>) -> CallbackHandle;
    /// Fires the ended callbacks exactly once, no matter how many layer
    /// closures trigger it.
    fn mark_ended(&self);
}

/// Forwarded track for a non-simulcast source.
pub struct PlainClientTrack {
    key: String,
    client: Weak<Client>,
    remote: Arc<RemoteTrack>,
    local: Arc<TrackLocalStaticRTP>,
    is_screen: AtomicBool,
    ended: AtomicBool,
    on_ended: CallbackList<OnEndedFn>,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl PlainClientTrack {
    pub(crate) fn new(
        client: Weak<Client>,
        client_id: &str,
        remote: Arc<RemoteTrack>,
        local: Arc<TrackLocalStaticRTP>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: format!(
                "{client_id}:{}",
                track_key(remote.stream_id(), remote.track_id())
            ),
            client,
            remote,
            local,
            is_screen: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            on_ended: CallbackList::new(),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl ClientTrack for PlainClientTrack {
    fn key(&self) -> &str {
        &self.key
    }

    fn track_id(&self) -> &str {
        self.remote.track_id()
    }

    fn stream_id(&self) -> &str {
        self.remote.stream_id()
    }

    fn kind(&self) -> RTPCodecType {
        self.remote.kind()
    }

    fn is_simulcast(&self) -> bool {
        false
    }

    fn is_screen(&self) -> bool {
        self.is_screen.load(Ordering::Relaxed)
    }

    fn set_source(&self, source: TrackSource) {
        self.is_screen
            .store(source == TrackSource::Screen, Ordering::Relaxed);
    }

    fn current_bitrate(&self) -> u32 {
        self.remote.current_bitrate()
    }

    fn local_track(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.local)
    }

    fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    fn last_quality(&self) -> QualityLevel {
        QualityLevel::High
    }

    async fn push(&self, packet: Packet, _layer: QualityLevel) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        if client.connection_state() != RTCPeerConnectionState::Connected {
            return;
        }

        let payload_len = packet.payload.len();
        match self.local.write_rtp(&packet).await {
            Ok(_) => {
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(payload_len as u64, Ordering::Relaxed);
            }
            // No subscribers bound yet; fine until the answer lands.
            Err(err) if err == RTCError::ErrClosedPipe => {}
            Err(err) => {
                warn!(track = %self.key, error = %err, "outbound rtp write failed");
            }
        }
    }

    fn on_ended(&self, callback: Box<OnEndedFn>) -> CallbackHandle {
        self.on_ended.add(Arc::from(callback))
    }

    fn mark_ended(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        for callback in self.on_ended.snapshot() {
            callback();
        }
    }
}

/// Forwarded track for a simulcast source.
///
/// Quality re-evaluation happens only on a keyframe that begins a new
/// frame; anything else reuses the previous choice, so a subscriber never
/// switches layers mid-frame.
pub struct SimulcastClientTrack {
    key: String,
    client: Weak<Client>,
    remote: Arc<SimulcastTrack>,
    local: Arc<TrackLocalStaticRTP>,
    mime_type: String,
    sequence_number: AtomicU16,
    last_quality: AtomicU32,
    last_timestamp: AtomicU32,
    is_screen: AtomicBool,
    ended: AtomicBool,
    // Serializes the final write so two layers cannot commit interleaved.
    write_guard: Mutex<()>,
    on_ended: CallbackList<OnEndedFn>,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl SimulcastClientTrack {
    pub(crate) fn new(
        client: Weak<Client>,
        client_id: &str,
        remote: Arc<SimulcastTrack>,
        local: Arc<TrackLocalStaticRTP>,
    ) -> Arc<Self> {
        let mime_type = remote.mime_type().to_string();
        Arc::new(Self {
            key: format!(
                "{client_id}:{}",
                track_key(remote.stream_id(), remote.track_id())
            ),
            client,
            remote,
            local,
            mime_type,
            sequence_number: AtomicU16::new(0),
            last_quality: AtomicU32::new(QualityLevel::None.as_u32()),
            last_timestamp: AtomicU32::new(0),
            is_screen: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            write_guard: Mutex::new(()),
            on_ended: CallbackList::new(),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }

    fn store_quality(&self, quality: QualityLevel) {
        self.last_quality.store(quality.as_u32(), Ordering::SeqCst);
    }
}

#[async_trait]
impl ClientTrack for SimulcastClientTrack {
    fn key(&self) -> &str {
        &self.key
    }

    fn track_id(&self) -> &str {
        self.remote.track_id()
    }

    fn stream_id(&self) -> &str {
        self.remote.stream_id()
    }

    fn kind(&self) -> RTPCodecType {
        RTPCodecType::Video
    }

    fn is_simulcast(&self) -> bool {
        true
    }

    fn is_screen(&self) -> bool {
        self.is_screen.load(Ordering::Relaxed)
    }

    fn set_source(&self, source: TrackSource) {
        self.is_screen
            .store(source == TrackSource::Screen, Ordering::Relaxed);
    }

    fn current_bitrate(&self) -> u32 {
        self.remote.layer_bitrate(self.last_quality())
    }

    fn local_track(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.local)
    }

    fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    fn last_quality(&self) -> QualityLevel {
        QualityLevel::from_u32(self.last_quality.load(Ordering::SeqCst))
    }

    async fn push(&self, mut packet: Packet, layer: QualityLevel) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        if client.connection_state() != RTCPeerConnectionState::Connected {
            return;
        }

        let last_quality = self.last_quality();
        let is_keyframe = keyframe::is_keyframe(&self.mime_type, &packet);

        // Nothing has been forwarded yet: the subscriber's decoder needs a
        // keyframe before any packet may go out.
        if !is_keyframe && last_quality == QualityLevel::None {
            self.remote.send_pli(layer).await;
            return;
        }

        let quality = if is_keyframe
            && self.last_timestamp.load(Ordering::SeqCst) != packet.header.timestamp
        {
            let quality = client
                .bitrate_controller()
                .quality(client.track_counts(), self.remote.activity());
            if quality == QualityLevel::None {
                self.store_quality(QualityLevel::None);
                return;
            }
            quality
        } else {
            last_quality
        };

        if quality != layer {
            return;
        }

        // Remember the source timestamp before rewriting; it identifies the
        // start of the next frame.
        self.last_timestamp
            .store(packet.header.timestamp, Ordering::SeqCst);

        packet.header.timestamp = rebase_timestamp(
            self.remote.base_timestamp(),
            packet.header.timestamp,
            self.remote.layer_base_timestamp(layer),
        );
        packet.header.sequence_number = next_sequence(&self.sequence_number);

        if last_quality != quality {
            self.store_quality(quality);
        }

        let payload_len = packet.payload.len();
        let _write = self.write_guard.lock().await;
        match self.local.write_rtp(&packet).await {
            Ok(_) => {
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(payload_len as u64, Ordering::Relaxed);
            }
            Err(err) if err == RTCError::ErrClosedPipe => {}
            Err(err) => {
                warn!(track = %self.key, error = %err, "outbound rtp write failed");
            }
        }
    }

    fn on_ended(&self, callback: Box<OnEndedFn>) -> CallbackHandle {
        self.on_ended.add(Arc::from(callback))
    }

    fn mark_ended(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        for callback in self.on_ended.snapshot() {
            callback();
        }
    }
}

/// The subscribers attached to one remote track, or the forwarded tracks
/// one subscriber consumes.
pub struct ClientTrackList {
    tracks: RwLock<Vec<Arc<dyn ClientTrack>>>,
}

impl ClientTrackList {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tracks: RwLock::new(Vec::new()),
        }
    }

    /// Adds `track` unless one with the same key is already attached.
    pub fn add(&self, track: Arc<dyn ClientTrack>) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| t.key() == track.key()) {
            return false;
        }
        tracks.push(track);
        true
    }

    pub fn remove(&self, key: &str) -> Option<Arc<dyn ClientTrack>> {
        let mut tracks = self.tracks.write();
        let index = tracks.iter().position(|t| t.key() == key)?;
        Some(tracks.remove(index))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<dyn ClientTrack>> {
        self.tracks.read().iter().find(|t| t.key() == key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn ClientTrack>> {
        self.tracks.read().clone()
    }

    /// Inbound track counts by category, for bandwidth partitioning.
    #[must_use]
    pub fn counts(&self) -> TrackCounts {
        let mut counts = TrackCounts::default();
        for track in self.tracks.read().iter() {
            if track.kind() == RTPCodecType::Audio {
                counts.audio += 1;
            } else if track.is_simulcast() {
                counts.simulcast += 1;
            } else {
                counts.video += 1;
            }
        }
        counts
    }

    /// Signals track-ended to every entry and clears the list.
    pub fn close_all(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.tracks.write());
        for track in drained {
            track.mark_ended();
        }
    }
}

impl Default for ClientTrackList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeTrack {
        key: String,
        kind: RTPCodecType,
        simulcast: bool,
        ended: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ClientTrack for FakeTrack {
        fn key(&self) -> &str {
            &self.key
        }
        fn track_id(&self) -> &str {
            &self.key
        }
        fn stream_id(&self) -> &str {
            "stream"
        }
        fn kind(&self) -> RTPCodecType {
            self.kind
        }
        fn is_simulcast(&self) -> bool {
            self.simulcast
        }
        fn is_screen(&self) -> bool {
            false
        }
        fn set_source(&self, _source: TrackSource) {}
        fn current_bitrate(&self) -> u32 {
            0
        }
        fn local_track(&self) -> Arc<TrackLocalStaticRTP> {
            unreachable!("not used in list tests")
        }
        fn packets_sent(&self) -> u64 {
            0
        }
        fn bytes_sent(&self) -> u64 {
            0
        }
        fn last_quality(&self) -> QualityLevel {
            QualityLevel::None
        }
        async fn push(&self, _packet: Packet, _layer: QualityLevel) {}
        fn on_ended(&self, _callback: Box<OnEndedFn>) -> CallbackHandle {
            unreachable!("not used in list tests")
        }
        fn mark_ended(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake(key: &str, kind: RTPCodecType, simulcast: bool) -> Arc<FakeTrack> {
        Arc::new(FakeTrack {
            key: key.to_string(),
            kind,
            simulcast,
            ended: Arc::new(AtomicUsize::new(0)),
        })
    }

    #[test]
    fn add_is_idempotent_per_key() {
        let list = ClientTrackList::new();
        assert!(list.add(fake("a", RTPCodecType::Audio, false)));
        assert!(!list.add(fake("a", RTPCodecType::Audio, false)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_returns_the_entry() {
        let list = ClientTrackList::new();
        list.add(fake("a", RTPCodecType::Audio, false));
        assert!(list.remove("a").is_some());
        assert!(list.remove("a").is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn counts_by_category() {
        let list = ClientTrackList::new();
        list.add(fake("a1", RTPCodecType::Audio, false));
        list.add(fake("a2", RTPCodecType::Audio, false));
        list.add(fake("v1", RTPCodecType::Video, false));
        list.add(fake("s1", RTPCodecType::Video, true));
        assert_eq!(
            list.counts(),
            TrackCounts {
                audio: 2,
                video: 1,
                simulcast: 1,
            }
        );
    }

    #[test]
    fn close_all_signals_each_track_and_clears() {
        let list = ClientTrackList::new();
        let track = fake("a", RTPCodecType::Video, false);
        let ended = Arc::clone(&track.ended);
        list.add(track);
        list.close_all();
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn sequence_numbers_are_dense_across_switches() {
        let counter = AtomicU16::new(0);
        let mut previous = None;
        // Interleave "layers"; the outbound counter must not care.
        for _ in 0..200 {
            let seq = next_sequence(&counter);
            if let Some(previous) = previous {
                assert_eq!(seq, u16::wrapping_add(previous, 1));
            }
            previous = Some(seq);
        }
    }

    #[test]
    fn sequence_numbers_wrap_without_a_gap() {
        let counter = AtomicU16::new(u16::MAX - 1);
        assert_eq!(next_sequence(&counter), u16::MAX);
        assert_eq!(next_sequence(&counter), 0);
        assert_eq!(next_sequence(&counter), 1);
    }

    #[test]
    fn rebased_timestamps_are_continuous_across_a_layer_switch() {
        // Two layers of the same source with different remote bases; the
        // subscriber timeline starts at the aggregate base.
        let base = 90_000u32;
        let high_base = 1_000_000u32;
        let low_base = 5_000u32;

        // Three frames on high, 3000 ticks apart.
        let mut out = Vec::new();
        for frame in 0..3u32 {
            out.push(rebase_timestamp(base, high_base + frame * 3000, high_base));
        }
        // Switch to low at the next frame boundary.
        for frame in 3..6u32 {
            out.push(rebase_timestamp(base, low_base + frame * 3000, low_base));
        }

        assert_eq!(out[0], base);
        for pair in out.windows(2) {
            assert!(pair[1] > pair[0], "timestamps must not go backwards: {out:?}");
            assert_eq!(pair[1] - pair[0], 3000);
        }
    }

    #[test]
    fn rebase_handles_wrapping_source_timestamps() {
        let base = 100u32;
        let layer_base = u32::MAX - 500;
        let timestamp = layer_base.wrapping_add(3000);
        assert_eq!(rebase_timestamp(base, timestamp, layer_base), 3100);
    }
}
