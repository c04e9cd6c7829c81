//! SFU configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

use crate::types::ClientType;

/// TURN/STUN server advertised to clients.
///
/// When `host` is empty no ICE servers are advertised; otherwise both a
/// `turn:` and a `stun:` URL are built from the same host and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 3478,
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Per-category bandwidth budgets in kbit/s, used to partition a
/// subscriber's estimated bandwidth across its inbound tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitrateConfig {
    /// Fixed budget reserved for each audio track.
    pub audio: u32,
    /// Fixed budget assumed for each non-simulcast video track.
    pub video: u32,
    /// Minimum per-track share to pick the mid layer.
    pub video_mid: u32,
    /// Minimum per-track share to pick the high layer.
    pub video_high: u32,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            audio: 48,
            video: 600,
            video_mid: 500,
            video_high: 1200,
        }
    }
}

/// Top-level SFU configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuConfig {
    pub turn: TurnConfig,
    pub bitrates: BitrateConfig,
    /// The room shuts down when no lifecycle events arrive for this long.
    #[serde(with = "duration_secs")]
    pub room_idle_timeout: Duration,
    /// Interval between keyframe requests sent on behalf of subscribers.
    #[serde(with = "duration_secs")]
    pub keyframe_interval: Duration,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            turn: TurnConfig::default(),
            bitrates: BitrateConfig::default(),
            room_idle_timeout: Duration::from_secs(50 * 60),
            keyframe_interval: Duration::from_secs(3),
        }
    }
}

/// Options for a single client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub direction: RTCRtpTransceiverDirection,
    /// How long a failed connection may linger before the client is stopped.
    pub idle_timeout: Duration,
    pub client_type: ClientType,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            direction: RTCRtpTransceiverDirection::Sendrecv,
            idle_timeout: Duration::from_secs(30),
            client_type: ClientType::Peer,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SfuConfig::default();
        assert!(config.turn.host.is_empty());
        assert_eq!(config.turn.port, 3478);
        assert_eq!(config.room_idle_timeout, Duration::from_secs(3000));
        assert!(config.bitrates.video_high > config.bitrates.video_mid);
    }

    #[test]
    fn client_options_defaults() {
        let opts = ClientOptions::default();
        assert_eq!(opts.client_type, ClientType::Peer);
        assert_eq!(opts.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn config_serde_round_trip() {
        let config = SfuConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: SfuConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.room_idle_timeout, config.room_idle_timeout);
        assert_eq!(back.bitrates.audio, config.bitrates.audio);
    }
}
