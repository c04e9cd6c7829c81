//! Room and per-client statistics snapshots

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::client::Client;
use crate::types::QualityLevel;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Counters for one forwarded (outbound) track.
#[derive(Debug, Clone, Serialize)]
pub struct TrackSentStats {
    pub id: String,
    pub stream_id: String,
    pub kind: String,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub current_bitrate: u32,
    pub quality: QualityLevel,
}

/// Counters for one inbound (published) track.
#[derive(Debug, Clone, Serialize)]
pub struct TrackReceivedStats {
    pub id: String,
    pub stream_id: String,
    pub kind: String,
    pub codec: String,
    pub current_bitrate: u32,
    pub packets_received: u64,
    pub bytes_received: u64,
}

/// Everything one client sends and receives.
#[derive(Debug, Clone, Serialize)]
pub struct ClientTrackStats {
    pub id: String,
    pub consumer_bandwidth: u32,
    pub sent_track_stats: Vec<TrackSentStats>,
    pub received_track_stats: Vec<TrackReceivedStats>,
}

impl ClientTrackStats {
    pub(crate) fn collect(client: &Arc<Client>) -> Self {
        let sent_track_stats = client
            .client_tracks()
            .snapshot()
            .into_iter()
            .map(|track| TrackSentStats {
                id: track.track_id().to_string(),
                stream_id: track.stream_id().to_string(),
                kind: track.kind().to_string(),
                packets_sent: track.packets_sent(),
                bytes_sent: track.bytes_sent(),
                current_bitrate: track.current_bitrate(),
                quality: track.last_quality(),
            })
            .collect();

        let received_track_stats = client
            .remote_track_snapshot()
            .into_iter()
            .map(|track| TrackReceivedStats {
                id: track.track_id().to_string(),
                stream_id: track.stream_id().to_string(),
                kind: track.kind().to_string(),
                codec: track.mime_type().to_string(),
                current_bitrate: track.current_bitrate(),
                packets_received: track.packets_received(),
                bytes_received: track.bytes_received(),
            })
            .collect();

        Self {
            id: client.id().to_string(),
            consumer_bandwidth: client.bitrate_controller().bandwidth(),
            sent_track_stats,
            received_track_stats,
        }
    }
}

/// Inbound track totals by kind.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatTracks {
    pub audio: usize,
    pub video: usize,
}

/// A point-in-time snapshot of the whole room.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub clients_count: usize,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub tracks: StatTracks,
    pub timestamp: DateTime<Utc>,
    pub client_stats: HashMap<String, ClientTrackStats>,
}

impl RoomStats {
    pub(crate) fn collect(clients: &[Arc<Client>]) -> Self {
        let mut stats = Self {
            clients_count: clients.len(),
            packets_received: 0,
            packets_sent: 0,
            bytes_received: 0,
            bytes_sent: 0,
            tracks: StatTracks::default(),
            timestamp: Utc::now(),
            client_stats: HashMap::new(),
        };

        for client in clients {
            for track in client.remote_track_snapshot() {
                if track.kind() == RTPCodecType::Audio {
                    stats.tracks.audio += 1;
                } else {
                    stats.tracks.video += 1;
                }
            }

            let client_stats = ClientTrackStats::collect(client);
            for sent in &client_stats.sent_track_stats {
                stats.packets_sent += sent.packets_sent;
                stats.bytes_sent += sent.bytes_sent;
            }
            for received in &client_stats.received_track_stats {
                stats.packets_received += received.packets_received;
                stats.bytes_received += received.bytes_received;
            }
            stats.client_stats.insert(client.id().to_string(), client_stats);
        }

        stats
    }
}
