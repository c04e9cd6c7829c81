//! Common types shared across the SFU

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a client. Advances monotonically to `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    New,
    Active,
    Restart,
    Ended,
}

impl ClientState {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Active => 1,
            Self::Restart => 2,
            Self::Ended => 3,
        }
    }

    pub(crate) const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Active,
            2 => Self::Restart,
            _ => Self::Ended,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Restart => "restart",
            Self::Ended => "ended",
        };
        write!(f, "{s}")
    }
}

/// What kind of endpoint a client is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// A regular conference participant.
    Peer,
    /// A bridge that feeds media into this room from another server.
    UpBridge,
    /// A bridge that consumes this room's media for another server.
    DownBridge,
}

impl ClientType {
    #[must_use]
    pub const fn is_bridge(self) -> bool {
        matches!(self, Self::UpBridge | Self::DownBridge)
    }
}

/// Origin of a published track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Media,
    Screen,
}

/// Simulcast quality layer choice for a single subscriber.
///
/// `None` means no packets should be forwarded at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    None,
    Low,
    Mid,
    High,
}

impl QualityLevel {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Low => 1,
            Self::Mid => 2,
            Self::High => 3,
        }
    }

    #[must_use]
    pub const fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Low,
            2 => Self::Mid,
            3 => Self::High,
            _ => Self::None,
        }
    }

    /// Map an RTP stream restriction identifier to a layer.
    #[must_use]
    pub fn from_rid(rid: &str) -> Option<Self> {
        match rid {
            "high" | "hi" | "h" | "f" => Some(Self::High),
            "mid" | "med" | "m" => Some(Self::Mid),
            "low" | "lo" | "l" | "q" => Some(Self::Low),
            _ => None,
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

/// Registry key for a track: `stream_id + "-" + track_id`.
#[must_use]
pub fn track_key(stream_id: &str, track_id: &str) -> String {
    format!("{stream_id}-{track_id}")
}
