// Integration tests for client registration, negotiation, and shutdown.
//
// These run against real peer connections but never open a network path:
// offer/answer generation and candidate buffering all work before ICE
// connectivity exists.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roomcast::{ClientOptions, ClientState, Error, Sfu, SfuConfig};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// A stand-in for the browser side of the signaling exchange.
async fn remote_peer() -> Arc<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();
    let pc = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .unwrap();
    Arc::new(pc)
}

async fn offer_from(pc: &Arc<RTCPeerConnection>) -> RTCSessionDescription {
    let offer = pc.create_offer(None).await.unwrap();
    pc.set_local_description(offer).await.unwrap();
    pc.local_description().await.unwrap()
}

#[tokio::test]
async fn client_registration_and_lookup() {
    let sfu = Sfu::new(SfuConfig::default(), None);

    let client = sfu
        .new_client("alice", ClientOptions::default())
        .await
        .unwrap();
    assert_eq!(client.id(), "alice");
    assert_eq!(client.state(), ClientState::New);
    assert_eq!(sfu.client_count(), 1);

    let looked_up = sfu.get_client("alice").unwrap();
    assert_eq!(looked_up.id(), "alice");

    assert!(matches!(sfu.get_client("bob"), Err(Error::ClientNotFound)));
    assert!(matches!(
        sfu.new_client("alice", ClientOptions::default()).await,
        Err(Error::ClientAlreadyExists(_))
    ));
}

#[tokio::test]
async fn client_added_and_removed_callbacks_fire() {
    let sfu = Sfu::new(SfuConfig::default(), None);

    let added = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));
    let added2 = Arc::clone(&added);
    let removed2 = Arc::clone(&removed);
    sfu.on_client_added(move |_| {
        added2.fetch_add(1, Ordering::SeqCst);
    });
    sfu.on_client_removed(move |_| {
        removed2.fetch_add(1, Ordering::SeqCst);
    });

    let client = sfu
        .new_client("alice", ClientOptions::default())
        .await
        .unwrap();
    assert_eq!(added.load(Ordering::SeqCst), 1);

    client.stop().await.unwrap();
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert_eq!(sfu.client_count(), 0);
}

#[tokio::test]
async fn stop_twice_reports_client_stopped() {
    let sfu = Sfu::new(SfuConfig::default(), None);
    let client = sfu
        .new_client("alice", ClientOptions::default())
        .await
        .unwrap();

    client.stop().await.unwrap();
    assert_eq!(client.state(), ClientState::Ended);
    assert!(matches!(client.stop().await, Err(Error::ClientStopped)));
}

#[tokio::test]
async fn first_offer_produces_an_answer() {
    let sfu = Sfu::new(SfuConfig::default(), None);
    let client = sfu
        .new_client("alice", ClientOptions::default())
        .await
        .unwrap();

    let remote = remote_peer().await;
    remote
        .add_transceiver_from_kind(RTPCodecType::Audio, None)
        .await
        .unwrap();
    let offer = offer_from(&remote).await;

    let answer = client.negotiate(offer).await.unwrap();
    assert_eq!(answer.sdp_type, RTCSdpType::Answer);
    // One transceiver arrived with the first offer.
    assert_eq!(client.initial_tracks_count(), 1);
    assert!(!client.is_in_remote_negotiation());
}

#[tokio::test]
async fn renegotiation_requires_permission() {
    let sfu = Sfu::new(SfuConfig::default(), None);
    let client = sfu
        .new_client("alice", ClientOptions::default())
        .await
        .unwrap();

    let remote = remote_peer().await;
    remote
        .add_transceiver_from_kind(RTPCodecType::Audio, None)
        .await
        .unwrap();
    let offer = offer_from(&remote).await;
    let answer = client.negotiate(offer).await.unwrap();
    remote.set_remote_description(answer).await.unwrap();

    // A second offer without asking first is rejected.
    remote
        .add_transceiver_from_kind(RTPCodecType::Audio, None)
        .await
        .unwrap();
    let second_offer = offer_from(&remote).await;
    assert!(matches!(
        client.negotiate(second_offer.clone()).await,
        Err(Error::NegotiationNotRequested)
    ));

    // Asking grants permission while no local renegotiation is running.
    assert!(client.is_allow_negotiation());
    let answer = client.negotiate(second_offer).await.unwrap();
    assert_eq!(answer.sdp_type, RTCSdpType::Answer);
}

#[tokio::test]
async fn ice_candidates_buffer_before_the_remote_description() {
    let sfu = Sfu::new(SfuConfig::default(), None);
    let client = sfu
        .new_client("alice", ClientOptions::default())
        .await
        .unwrap();

    let candidate = RTCIceCandidateInit {
        candidate: "candidate:1 1 udp 2130706431 127.0.0.1 54321 typ host".to_owned(),
        ..Default::default()
    };
    // Both calls land before any remote description exists: buffered, OK.
    client.add_ice_candidate(candidate.clone()).await.unwrap();
    client.add_ice_candidate(candidate).await.unwrap();

    let remote = remote_peer().await;
    remote
        .add_transceiver_from_kind(RTPCodecType::Audio, None)
        .await
        .unwrap();
    let offer = offer_from(&remote).await;
    // Negotiation drains the buffer without failing.
    let answer = client.negotiate(offer).await.unwrap();
    assert_eq!(answer.sdp_type, RTCSdpType::Answer);
}

#[tokio::test]
async fn stopping_the_sfu_stops_every_client() {
    let sfu = Sfu::new(SfuConfig::default(), None);
    let stopped = Arc::new(AtomicBool::new(false));
    let stopped2 = Arc::clone(&stopped);
    sfu.on_stopped(move || {
        stopped2.store(true, Ordering::SeqCst);
    });

    let alice = sfu
        .new_client("alice", ClientOptions::default())
        .await
        .unwrap();
    let bob = sfu
        .new_client("bob", ClientOptions::default())
        .await
        .unwrap();

    sfu.stop().await;
    assert!(stopped.load(Ordering::SeqCst));
    assert_eq!(alice.state(), ClientState::Ended);
    assert_eq!(bob.state(), ClientState::Ended);
    assert_eq!(sfu.client_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_room_shuts_itself_down() {
    let config = SfuConfig {
        room_idle_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let sfu = Sfu::new(config, None);
    let stopped = Arc::new(AtomicBool::new(false));
    let stopped2 = Arc::clone(&stopped);
    sfu.on_stopped(move || {
        stopped2.store(true, Ordering::SeqCst);
    });

    for _ in 0..30 {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn room_stats_snapshot() {
    let sfu = Sfu::new(SfuConfig::default(), None);
    sfu.new_client("alice", ClientOptions::default())
        .await
        .unwrap();

    let stats = sfu.stats();
    assert_eq!(stats.clients_count, 1);
    assert!(stats.client_stats.contains_key("alice"));
    assert_eq!(stats.tracks.audio, 0);
    assert_eq!(stats.tracks.video, 0);
}
