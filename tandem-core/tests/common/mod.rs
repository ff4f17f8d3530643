//! Shared helpers for call scenario tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tandem_core::loopback::{LoopbackCapture, LoopbackPeerFactory, LoopbackRelay};
use tandem_core::{CallConfig, CallService, CallSnapshot, CallState};

/// Generous upper bound for a scenario step; paused-clock tests advance
/// through it instantly
pub const STEP: Duration = Duration::from_secs(60);

/// One client wired to a shared relay
pub struct Client {
    pub service: CallService,
    pub capture: Arc<LoopbackCapture>,
    pub peers: Arc<LoopbackPeerFactory>,
}

pub fn test_config() -> CallConfig {
    CallConfig {
        retry_backoff: Duration::from_millis(10),
        ..CallConfig::default()
    }
}

pub async fn client(relay: &Arc<LoopbackRelay>, name: &str) -> Client {
    client_with(relay, name, LoopbackCapture::new(), LoopbackPeerFactory::new()).await
}

pub async fn client_with(
    relay: &Arc<LoopbackRelay>,
    name: &str,
    capture: LoopbackCapture,
    peers: LoopbackPeerFactory,
) -> Client {
    let capture = Arc::new(capture);
    let peers = Arc::new(peers);
    let service = CallService::builder(name)
        .with_signaling(relay.clone())
        .with_directory(relay.clone())
        .with_capture_device(capture.clone())
        .with_peer_factory(peers.clone())
        .with_config(test_config())
        .build()
        .await
        .unwrap();
    Client {
        service,
        capture,
        peers,
    }
}

/// Wait until the snapshot satisfies `pred`
pub async fn wait_until(
    service: &CallService,
    pred: impl Fn(&CallSnapshot) -> bool,
) -> CallSnapshot {
    let mut rx = service.watch();
    let waited = tokio::time::timeout(STEP, async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if pred(&snapshot) {
                    return snapshot.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    })
    .await;
    match waited {
        Ok(snapshot) => snapshot,
        Err(_) => panic!(
            "{} never reached the expected state, last snapshot: {:?}",
            service.local(),
            service.snapshot()
        ),
    }
}

pub async fn wait_for_state(service: &CallService, state: CallState) -> CallSnapshot {
    wait_until(service, |s| s.state == state).await
}

/// Place a call from `caller` to `callee` and accept it
pub async fn connect(caller: &Client, callee: &Client) {
    caller
        .service
        .place_call(callee.service.local().clone())
        .await
        .unwrap();
    wait_for_state(&callee.service, CallState::Requesting).await;
    callee.service.accept_incoming().await.unwrap();
    wait_for_state(&caller.service, CallState::Connected).await;
    wait_for_state(&callee.service, CallState::Connected).await;
}
