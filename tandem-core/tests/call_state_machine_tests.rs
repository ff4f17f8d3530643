//! Call state machine scenarios between in-process clients

mod common;

use common::{client, client_with, connect, wait_for_state, wait_until};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::loopback::{LoopbackCapture, LoopbackPeerFactory, LoopbackRelay};
use tandem_core::{
    CallDirection, CallError, CallEvent, CallFailure, CallIdentity, CallState, EnvelopeKind,
    MediaError, MediaType,
};

#[tokio::test]
async fn accepted_call_connects_both_sides() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;
    let mut bob_events = bob.service.subscribe_events();

    let call_id = alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();

    let ringing = wait_for_state(&bob.service, CallState::Requesting).await;
    assert_eq!(ringing.call_id, Some(call_id));
    assert_eq!(ringing.direction, Some(CallDirection::Incoming));
    assert_eq!(ringing.remote, Some(CallIdentity::new("alice")));
    assert_eq!(bob.capture.acquisitions(), 0);

    let incoming = loop {
        match bob_events.recv().await.unwrap() {
            event @ CallEvent::IncomingCall { .. } => break event,
            _ => continue,
        }
    };
    assert_eq!(
        incoming,
        CallEvent::IncomingCall {
            call_id,
            from: CallIdentity::new("alice"),
        }
    );

    assert_eq!(bob.service.accept_incoming().await.unwrap(), call_id);

    let a = wait_for_state(&alice.service, CallState::Connected).await;
    let b = wait_for_state(&bob.service, CallState::Connected).await;
    assert_eq!(a.direction, Some(CallDirection::Outgoing));
    assert_eq!(a.local_tracks.len(), 2);
    assert_eq!(a.remote_tracks.len(), 2);
    assert_eq!(b.remote_tracks.len(), 2);
    assert!(a.connected_at.is_some());
    assert!(a.duration().is_some());

    assert_eq!(relay.sent_by(&CallIdentity::new("alice"), EnvelopeKind::Offer).len(), 1);
    assert_eq!(relay.sent_by(&CallIdentity::new("bob"), EnvelopeKind::Answer).len(), 1);
    assert_eq!(
        relay.call_intents(),
        vec![(CallIdentity::new("alice"), CallIdentity::new("bob"))]
    );

    alice.service.end_call().await.unwrap();
    let a = wait_for_state(&alice.service, CallState::Ended).await;
    let b = wait_for_state(&bob.service, CallState::Ended).await;
    assert_eq!(a.last_error, None);
    assert_eq!(b.last_error, None);
    assert!(a.ended_at.is_some());

    assert_eq!(alice.capture.open_tracks(), 0);
    assert_eq!(bob.capture.open_tracks(), 0);
    assert_eq!(alice.peers.open_sessions(), 0);
    assert_eq!(bob.peers.open_sessions(), 0);
    assert_eq!(
        relay.call_ends(),
        vec![(CallIdentity::new("alice"), CallIdentity::new("bob"))]
    );
}

#[tokio::test]
async fn declined_call_ends_with_declined() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;

    alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    wait_for_state(&bob.service, CallState::Requesting).await;
    bob.service.decline_incoming().await.unwrap();

    let a = wait_for_state(&alice.service, CallState::Ended).await;
    assert_eq!(a.last_error, Some(CallFailure::Declined));
    assert_eq!(alice.capture.open_tracks(), 0);

    let b = wait_for_state(&bob.service, CallState::Ended).await;
    assert_eq!(b.last_error, None);
    assert_eq!(bob.capture.acquisitions(), 0);
    assert!(relay
        .sent_by(&CallIdentity::new("bob"), EnvelopeKind::End)
        .is_empty());
    assert_eq!(
        bob.service.accept_incoming().await,
        Err(CallError::NoIncomingCall)
    );
}

#[tokio::test]
async fn busy_callee_declines_third_party() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;
    let carol = client(&relay, "carol").await;
    connect(&alice, &bob).await;
    let mut bob_events = bob.service.subscribe_events();

    carol
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    let c = wait_for_state(&carol.service, CallState::Ended).await;
    assert_eq!(c.last_error, Some(CallFailure::Busy));
    assert_eq!(carol.capture.open_tracks(), 0);

    assert_eq!(alice.service.snapshot().state, CallState::Connected);
    let b = bob.service.snapshot();
    assert_eq!(b.state, CallState::Connected);
    assert_eq!(b.remote, Some(CallIdentity::new("alice")));
    while let Ok(event) = bob_events.try_recv() {
        assert!(!matches!(event, CallEvent::IncomingCall { .. }));
    }
    assert_eq!(bob.capture.acquisitions(), 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_fails_after_ring_timeout() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;
    let mut bob_events = bob.service.subscribe_events();
    let started = tokio::time::Instant::now();

    let call_id = alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    wait_for_state(&alice.service, CallState::Ringing).await;

    let a = wait_until(&alice.service, |s| s.state.is_terminal()).await;
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(a.state, CallState::Failed);
    assert_eq!(a.last_error, Some(CallFailure::NoAnswer));
    assert_eq!(alice.capture.open_tracks(), 0);

    wait_for_state(&bob.service, CallState::Ended).await;
    let mut withdrawn = false;
    while let Ok(event) = bob_events.try_recv() {
        if let CallEvent::IncomingCallWithdrawn { call_id: id, .. } = event {
            assert_eq!(id, call_id);
            withdrawn = true;
        }
    }
    assert!(withdrawn);
}

#[tokio::test]
async fn end_call_while_ringing_withdraws_invite() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;

    alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    wait_for_state(&alice.service, CallState::Ringing).await;
    wait_for_state(&bob.service, CallState::Requesting).await;

    alice.service.end_call().await.unwrap();
    let a = wait_for_state(&alice.service, CallState::Ended).await;
    assert_eq!(a.last_error, None);
    assert_eq!(alice.capture.open_tracks(), 0);

    wait_for_state(&bob.service, CallState::Ended).await;
    assert_eq!(bob.capture.acquisitions(), 0);
    assert_eq!(
        bob.service.accept_incoming().await,
        Err(CallError::NoIncomingCall)
    );
}

#[tokio::test(start_paused = true)]
async fn end_call_while_acquiring_releases_late_media() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client_with(
        &relay,
        "alice",
        LoopbackCapture::new().with_delay(Duration::from_secs(5)),
        LoopbackPeerFactory::new(),
    )
    .await;

    alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    assert_eq!(alice.service.snapshot().state, CallState::Requesting);
    alice.service.end_call().await.unwrap();
    wait_for_state(&alice.service, CallState::Ended).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(alice.capture.acquisitions(), 1);
    assert_eq!(alice.capture.open_tracks(), 0);
    assert!(relay.sent_envelopes().is_empty());
    assert!(relay.call_ends().is_empty());
    assert_eq!(alice.service.snapshot().state, CallState::Ended);
}

#[tokio::test(start_paused = true)]
async fn end_call_while_negotiating_releases_everything() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client_with(
        &relay,
        "bob",
        LoopbackCapture::new().with_delay(Duration::from_secs(5)),
        LoopbackPeerFactory::new(),
    )
    .await;

    alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    wait_for_state(&bob.service, CallState::Requesting).await;
    bob.service.accept_incoming().await.unwrap();
    assert_eq!(bob.service.snapshot().state, CallState::Negotiating);

    bob.service.end_call().await.unwrap();
    wait_for_state(&bob.service, CallState::Ended).await;
    let a = wait_for_state(&alice.service, CallState::Ended).await;
    assert_eq!(a.last_error, None);
    assert_eq!(alice.capture.open_tracks(), 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(bob.capture.open_tracks(), 0);
    assert_eq!(bob.peers.open_sessions(), 0);
    assert!(relay
        .sent_by(&CallIdentity::new("bob"), EnvelopeKind::Accept)
        .is_empty());
}

#[tokio::test]
async fn remote_end_while_connected_ends_call() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;
    connect(&alice, &bob).await;

    bob.service.end_call().await.unwrap();
    let a = wait_for_state(&alice.service, CallState::Ended).await;
    assert_eq!(a.last_error, None);
    assert_eq!(alice.capture.open_tracks(), 0);
    assert_eq!(alice.peers.open_sessions(), 0);
    assert_eq!(alice.service.end_call().await, Err(CallError::NoActiveCall));

    // Only the side that hung up records the end
    assert_eq!(
        relay.call_ends(),
        vec![(CallIdentity::new("bob"), CallIdentity::new("alice"))]
    );
}

#[tokio::test]
async fn device_failure_never_sends_invite() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client_with(
        &relay,
        "alice",
        LoopbackCapture::failing(MediaError::PermissionDenied),
        LoopbackPeerFactory::new(),
    )
    .await;
    let bob = client(&relay, "bob").await;

    alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    let a = wait_for_state(&alice.service, CallState::Failed).await;
    assert_eq!(a.last_error, Some(CallFailure::PermissionDenied));
    assert!(relay.sent_envelopes().is_empty());
    assert!(relay.call_intents().is_empty());
    assert_eq!(bob.service.snapshot().state, CallState::Idle);
}

#[tokio::test]
async fn callee_device_failure_declines_as_unavailable() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client_with(
        &relay,
        "bob",
        LoopbackCapture::failing(MediaError::DeviceBusy("camera in use".to_string())),
        LoopbackPeerFactory::new(),
    )
    .await;

    alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    wait_for_state(&bob.service, CallState::Requesting).await;
    bob.service.accept_incoming().await.unwrap();

    let b = wait_for_state(&bob.service, CallState::Failed).await;
    assert_eq!(b.last_error, Some(CallFailure::DeviceBusy));
    let a = wait_for_state(&alice.service, CallState::Ended).await;
    assert_eq!(a.last_error, Some(CallFailure::Declined));
    assert_eq!(alice.capture.open_tracks(), 0);
    assert!(relay
        .sent_by(&CallIdentity::new("alice"), EnvelopeKind::Offer)
        .is_empty());
}

#[tokio::test]
async fn simultaneous_calls_settle_on_one_offer() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;

    relay.hold();
    alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    let bob_call = bob
        .service
        .place_call(CallIdentity::new("alice"))
        .await
        .unwrap();
    wait_for_state(&alice.service, CallState::Ringing).await;
    wait_for_state(&bob.service, CallState::Ringing).await;
    relay.release();

    let a = wait_for_state(&alice.service, CallState::Connected).await;
    let b = wait_for_state(&bob.service, CallState::Connected).await;
    assert_eq!(a.call_id, Some(bob_call));
    assert_eq!(b.call_id, Some(bob_call));
    assert_eq!(a.direction, Some(CallDirection::Incoming));
    assert_eq!(b.direction, Some(CallDirection::Outgoing));

    let offers: Vec<_> = relay
        .sent_envelopes()
        .into_iter()
        .filter(|e| e.kind == EnvelopeKind::Offer)
        .collect();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].from, CallIdentity::new("bob"));
    assert_eq!(alice.capture.acquisitions(), 1);
}

#[tokio::test(start_paused = true)]
async fn crossing_invite_rings_after_own_call_fails_early() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client_with(
        &relay,
        "bob",
        LoopbackCapture::failing(MediaError::DeviceBusy("camera in use".to_string()))
            .with_delay(Duration::from_secs(1)),
        LoopbackPeerFactory::new(),
    )
    .await;
    let mut bob_events = bob.service.subscribe_events();

    bob.service
        .place_call(CallIdentity::new("alice"))
        .await
        .unwrap();
    let alice_call = alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    wait_for_state(&alice.service, CallState::Ringing).await;

    // Bob's own call dies before its invite leaves; alice's invite takes over
    let b = wait_until(&bob.service, |s| {
        s.state == CallState::Requesting && s.call_id == Some(alice_call)
    })
    .await;
    assert_eq!(b.direction, Some(CallDirection::Incoming));
    assert_eq!(b.remote, Some(CallIdentity::new("alice")));

    let mut failed = None;
    let mut incoming = None;
    while let Ok(event) = bob_events.try_recv() {
        match event {
            CallEvent::CallFailed { reason, .. } => failed = Some(reason),
            CallEvent::IncomingCall { call_id, .. } => incoming = Some(call_id),
            _ => {}
        }
    }
    assert_eq!(failed, Some(CallFailure::DeviceBusy));
    assert_eq!(incoming, Some(alice_call));
    assert!(relay
        .sent_by(&CallIdentity::new("bob"), EnvelopeKind::Invite)
        .is_empty());

    bob.service.decline_incoming().await.unwrap();
    let a = wait_for_state(&alice.service, CallState::Ended).await;
    assert_eq!(a.last_error, Some(CallFailure::Declined));
}

#[tokio::test(start_paused = true)]
async fn crossing_invite_rings_after_own_call_is_cancelled() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client_with(
        &relay,
        "bob",
        LoopbackCapture::new().with_delay(Duration::from_secs(1)),
        LoopbackPeerFactory::new(),
    )
    .await;

    bob.service
        .place_call(CallIdentity::new("alice"))
        .await
        .unwrap();
    let alice_call = alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    wait_for_state(&alice.service, CallState::Ringing).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    bob.service.end_call().await.unwrap();
    let b = wait_until(&bob.service, |s| {
        s.state == CallState::Requesting && s.call_id == Some(alice_call)
    })
    .await;
    assert_eq!(b.direction, Some(CallDirection::Incoming));

    bob.service.accept_incoming().await.unwrap();
    let a = wait_for_state(&alice.service, CallState::Connected).await;
    let b = wait_for_state(&bob.service, CallState::Connected).await;
    assert_eq!(a.call_id, Some(alice_call));
    assert_eq!(b.call_id, Some(alice_call));
    assert_eq!(bob.capture.open_tracks(), 2);
}

#[tokio::test]
async fn calling_the_pending_inviter_accepts() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;

    let call_id = alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    wait_for_state(&bob.service, CallState::Requesting).await;

    assert_eq!(
        bob.service.place_call(CallIdentity::new("alice")).await,
        Ok(call_id)
    );
    wait_for_state(&alice.service, CallState::Connected).await;
    wait_for_state(&bob.service, CallState::Connected).await;
    assert!(relay
        .sent_by(&CallIdentity::new("bob"), EnvelopeKind::Invite)
        .is_empty());
}

#[tokio::test]
async fn second_call_is_rejected_while_busy() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let _bob = client(&relay, "bob").await;

    alice
        .service
        .place_call(CallIdentity::new("bob"))
        .await
        .unwrap();
    assert_eq!(
        alice.service.place_call(CallIdentity::new("carol")).await,
        Err(CallError::CallInProgress)
    );
    assert_eq!(
        alice.service.place_call(CallIdentity::new("alice")).await,
        Err(CallError::SelfCall)
    );
}

#[tokio::test]
async fn toggle_track_is_reflected_in_snapshot() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;
    connect(&alice, &bob).await;

    assert_eq!(
        alice.service.toggle_track(MediaType::Audio, false).await,
        Ok(true)
    );
    assert_eq!(
        alice.service.toggle_track(MediaType::Audio, false).await,
        Ok(false)
    );
    let a = alice.service.snapshot();
    let audio = a
        .local_tracks
        .iter()
        .find(|t| t.kind == MediaType::Audio)
        .unwrap();
    assert!(!audio.enabled);
    assert!(a
        .local_tracks
        .iter()
        .filter(|t| t.kind == MediaType::Video)
        .all(|t| t.enabled));
    assert_eq!(alice.service.snapshot().state, CallState::Connected);

    alice.service.end_call().await.unwrap();
    assert_eq!(
        alice.service.toggle_track(MediaType::Audio, true).await,
        Err(CallError::NoActiveCall)
    );
}

#[tokio::test]
async fn new_call_after_ended_call() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;
    connect(&alice, &bob).await;
    alice.service.end_call().await.unwrap();
    wait_for_state(&bob.service, CallState::Ended).await;

    let second = bob
        .service
        .place_call(CallIdentity::new("alice"))
        .await
        .unwrap();
    let pending = wait_until(&alice.service, |s| s.call_id == Some(second)).await;
    assert_eq!(pending.state, CallState::Requesting);
    alice.service.accept_incoming().await.unwrap();
    wait_for_state(&alice.service, CallState::Connected).await;
    wait_for_state(&bob.service, CallState::Connected).await;
    assert_eq!(alice.capture.acquisitions(), 2);
    assert_eq!(alice.capture.open_tracks(), 2);
}

#[tokio::test]
async fn shutdown_ends_active_call() {
    let relay = Arc::new(LoopbackRelay::new());
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;
    connect(&alice, &bob).await;

    alice.service.shutdown().await;
    assert_eq!(alice.capture.open_tracks(), 0);
    wait_for_state(&bob.service, CallState::Ended).await;
    assert_eq!(bob.capture.open_tracks(), 0);
}
