//! End-to-end call flows through the public service API

mod common;

use common::{client, connect, wait_for_state, wait_until};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tandem_core::loopback::{LoopbackCapture, LoopbackPeerFactory, LoopbackRelay};
use tandem_core::{
    CallConfig, CallEvent, CallIdentity, CallService, CallState, EnvelopeKind, MediaConstraints,
    MediaType,
};

fn transitions(events: &mut tokio::sync::broadcast::Receiver<CallEvent>) -> Vec<CallState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CallEvent::StateChanged { new_state, .. } = event {
            states.push(new_state);
        }
    }
    states
}

#[tokio::test]
async fn caller_and_callee_walk_the_expected_states() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;
    let mut alice_events = alice.service.subscribe_events();
    let mut bob_events = bob.service.subscribe_events();

    connect(&alice, &bob).await;
    alice.service.end_call().await.unwrap();
    wait_for_state(&alice.service, CallState::Ended).await;
    wait_for_state(&bob.service, CallState::Ended).await;

    let expected = vec![
        CallState::Requesting,
        CallState::Ringing,
        CallState::Negotiating,
        CallState::Connected,
        CallState::Ending,
        CallState::Ended,
    ];
    assert_eq!(transitions(&mut alice_events), expected);
    assert_eq!(
        transitions(&mut bob_events),
        vec![
            CallState::Requesting,
            CallState::Negotiating,
            CallState::Connected,
            CallState::Ending,
            CallState::Ended,
        ]
    );
}

#[tokio::test]
async fn audio_only_invite_carries_constraints_to_callee() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;

    alice
        .service
        .place_call_with(CallIdentity::new("bob"), MediaConstraints::audio_only())
        .await
        .unwrap();
    wait_for_state(&bob.service, CallState::Requesting).await;
    bob.service.accept_incoming().await.unwrap();

    let a = wait_for_state(&alice.service, CallState::Connected).await;
    let b = wait_for_state(&bob.service, CallState::Connected).await;
    assert_eq!(a.local_tracks.len(), 1);
    assert_eq!(a.local_tracks[0].kind, MediaType::Audio);
    assert_eq!(b.local_tracks.len(), 1);
    assert_eq!(b.local_tracks[0].kind, MediaType::Audio);
    assert_eq!(a.remote_tracks.len(), 1);
    assert_eq!(a.remote_tracks[0].kind, MediaType::Audio);
    assert_eq!(
        alice.service.toggle_track(MediaType::Video, false).await,
        Ok(false)
    );
}

#[tokio::test]
async fn remote_tracks_are_announced_once() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;
    let mut events = alice.service.subscribe_events();

    connect(&alice, &bob).await;

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CallEvent::RemoteTrackAdded { track, .. } = event {
            kinds.push(track.kind);
        }
    }
    kinds.sort_by_key(|k| k.as_str());
    assert_eq!(kinds, vec![MediaType::Audio, MediaType::Video]);
}

#[tokio::test]
async fn cloned_handles_share_one_call() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;
    let ui = alice.service.clone();

    connect(&alice, &bob).await;
    assert_eq!(ui.snapshot().state, CallState::Connected);
    ui.end_call().await.unwrap();
    wait_for_state(&alice.service, CallState::Ended).await;
    wait_for_state(&bob.service, CallState::Ended).await;
}

#[tokio::test]
async fn config_from_json_drives_the_service() {
    let config: CallConfig = serde_json::from_str(
        r#"{ "constraints": { "audio": true, "video": false, "resolution": "SD480" } }"#,
    )
    .unwrap();
    assert!(!config.constraints.video);

    let relay = Arc::new(LoopbackRelay::new());
    let capture = Arc::new(LoopbackCapture::new());
    let alice = CallService::builder("alice")
        .with_signaling(relay.clone())
        .with_directory(relay.clone())
        .with_capture_device(capture.clone())
        .with_peer_factory(Arc::new(LoopbackPeerFactory::new()))
        .with_config(config)
        .build()
        .await
        .unwrap();
    let bob = client(&relay, "bob").await;

    alice.place_call(CallIdentity::new("bob")).await.unwrap();
    wait_for_state(&bob.service, CallState::Requesting).await;
    bob.service.accept_incoming().await.unwrap();

    let a = wait_until(&alice, |s| s.state == CallState::Connected).await;
    assert_eq!(a.local_tracks.len(), 1);
    assert_eq!(capture.open_tracks(), 1);

    alice.shutdown().await;
    assert_eq!(capture.open_tracks(), 0);
}

#[tokio::test]
async fn envelopes_without_subscriber_are_kept_by_the_relay() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;

    alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    wait_for_state(&alice.service, CallState::Ringing).await;
    alice.service.end_call().await.unwrap();
    wait_for_state(&alice.service, CallState::Ended).await;

    let kinds: Vec<_> = relay
        .drain_undelivered()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![EnvelopeKind::Invite, EnvelopeKind::End]
    );
    assert!(relay.drain_undelivered().is_empty());
}
