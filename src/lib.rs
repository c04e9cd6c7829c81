//! `roomcast` — a Selective Forwarding Unit for WebRTC rooms
//!
//! The SFU accepts media tracks from each participant and forwards them,
//! without transcoding, to every other participant in the same room.
//!
//! ## Architecture
//!
//! - **[`Sfu`]**: the room orchestrator — client registry, track fan-out,
//!   renegotiation coordination, idle shutdown
//! - **[`Client`]**: one participant — a peer connection, its signaling
//!   state machine and a serialized operation queue
//! - **[`RemoteTrack`] / [`SimulcastTrack`]**: inbound tracks with one RTP
//!   reader per stream (three per simulcast aggregate)
//! - **[`ClientTrack`]**: one forwarded (publisher, subscriber) pair; the
//!   simulcast variant picks a quality layer per subscriber and rewrites
//!   RTP timestamps and sequence numbers across layer switches
//! - **[`BitrateController`]**: per-subscriber layer choice driven by the
//!   reported bandwidth estimate
//! - **[`Metadata`]**: a concurrent key/value map with change subscriptions
//!
//! The transport itself (ICE, DTLS, SRTP, SDP) is the `webrtc` crate's
//! business; this crate drives peer connections, it does not implement
//! them.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast::{ClientOptions, Sfu, SfuConfig};
//!
//! let sfu = Sfu::new(SfuConfig::default(), None);
//! let client = sfu.new_client("alice", ClientOptions::default()).await?;
//! client.on_renegotiation(|offer| async move {
//!     // deliver the offer to the remote peer, resolve with its answer
//! });
//! let answer = client.negotiate(offer).await?;
//! ```

mod bitrate;
mod callback;
mod client;
mod client_track;
mod config;
mod error;
mod keyframe;
mod meta;
mod queue;
mod remote_track;
mod sfu;
mod stats;
mod types;

pub use bitrate::{BitrateController, BitrateEstimator, LayerActivity, TrackCounts};
pub use callback::{CallbackHandle, CallbackList};
pub use client::{Client, OnRenegotiationFn};
pub use client_track::{ClientTrack, ClientTrackList, PlainClientTrack, SimulcastClientTrack};
pub use config::{BitrateConfig, ClientOptions, SfuConfig, TurnConfig};
pub use error::{Error, Result};
pub use keyframe::is_keyframe;
pub use meta::{MetaSubscription, Metadata};
pub use remote_track::{PublishedTrack, RemoteTrack, RemoteTrackVariant, SimulcastTrack};
pub use sfu::{Sfu, UdpMux};
pub use stats::{ClientTrackStats, RoomStats, StatTracks, TrackReceivedStats, TrackSentStats};
pub use types::{track_key, ClientState, ClientType, QualityLevel, TrackSource};
