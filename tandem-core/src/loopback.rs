//! In-process collaborators
//!
//! A signaling relay, a capture device and a peer session factory that run
//! entirely inside one process. Two [`CallService`](crate::CallService)s
//! wired to the same [`LoopbackRelay`] can call each other, which is what the
//! demo binary and the integration tests do. The relay also exposes knobs
//! for failure injection (failed sends, duplicated deliveries, held
//! delivery).

use crate::identity::CallIdentity;
use crate::media::{CaptureDevice, CaptureTrack, MediaError};
use crate::negotiation::{
    NegotiationError, PeerEvent, PeerEvents, PeerSession, PeerSessionFactory,
};
use crate::signaling::{
    CallDirectory, CandidatePayload, EnvelopeKind, EnvelopeStream, SignalingEnvelope,
    SignalingError, SignalingTransport,
};
use crate::types::{LocalTrackInfo, MediaConstraints, MediaType, RemoteTrack};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Default)]
struct RelayState {
    subscribers: HashMap<CallIdentity, mpsc::UnboundedSender<SignalingEnvelope>>,
    sent: Vec<SignalingEnvelope>,
    undelivered: Vec<SignalingEnvelope>,
    held: Option<Vec<SignalingEnvelope>>,
    failing_sends: usize,
    duplication: Vec<bool>,
    deliveries: usize,
    intents: Vec<(CallIdentity, CallIdentity)>,
    ends: Vec<(CallIdentity, CallIdentity)>,
}

impl RelayState {
    fn deliver(&mut self, envelope: SignalingEnvelope) {
        let duplicate = !self.duplication.is_empty()
            && self.duplication[self.deliveries % self.duplication.len()];
        self.deliveries += 1;

        let Some(subscriber) = self.subscribers.get(&envelope.to) else {
            self.undelivered.push(envelope);
            return;
        };
        if duplicate {
            let _ = subscriber.send(envelope.clone());
        }
        if let Err(e) = subscriber.send(envelope) {
            self.undelivered.push(e.0);
        }
    }
}

/// In-memory signaling relay and directory
///
/// Envelopes are delivered in send order to whoever subscribed for the
/// recipient. Envelopes for an identity with no subscriber are kept and can
/// be drained with [`LoopbackRelay::drain_undelivered`].
#[derive(Default)]
pub struct LoopbackRelay {
    state: Mutex<RelayState>,
}

impl LoopbackRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail with `TransportUnavailable`
    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().failing_sends = count;
    }

    /// Deliver envelopes twice according to a repeating pattern
    ///
    /// Entry `i % pattern.len()` decides whether the `i`-th delivery is
    /// duplicated.
    pub fn set_duplication(&self, pattern: Vec<bool>) {
        self.state.lock().duplication = pattern;
    }

    /// Queue envelopes instead of delivering them until [`release`](Self::release)
    pub fn hold(&self) {
        let mut state = self.state.lock();
        if state.held.is_none() {
            state.held = Some(Vec::new());
        }
    }

    /// Deliver every held envelope in send order and stop holding
    pub fn release(&self) {
        let mut state = self.state.lock();
        let held = state.held.take().unwrap_or_default();
        for envelope in held {
            state.deliver(envelope);
        }
    }

    /// Every envelope accepted by the relay, in send order
    #[must_use]
    pub fn sent_envelopes(&self) -> Vec<SignalingEnvelope> {
        self.state.lock().sent.clone()
    }

    /// Envelopes of one kind sent by `from`
    #[must_use]
    pub fn sent_by(&self, from: &CallIdentity, kind: EnvelopeKind) -> Vec<SignalingEnvelope> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|e| &e.from == from && e.kind == kind)
            .cloned()
            .collect()
    }

    /// Take the envelopes nobody was subscribed for
    pub fn drain_undelivered(&self) -> Vec<SignalingEnvelope> {
        std::mem::take(&mut self.state.lock().undelivered)
    }

    /// Recorded call intents as `(from, to)`
    #[must_use]
    pub fn call_intents(&self) -> Vec<(CallIdentity, CallIdentity)> {
        self.state.lock().intents.clone()
    }

    /// Recorded call ends as `(from, to)`
    #[must_use]
    pub fn call_ends(&self) -> Vec<(CallIdentity, CallIdentity)> {
        self.state.lock().ends.clone()
    }
}

#[async_trait]
impl SignalingTransport for LoopbackRelay {
    async fn send_envelope(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(SignalingError::TransportUnavailable(
                "loopback relay refused envelope".to_string(),
            ));
        }

        state.sent.push(envelope.clone());
        match state.held.as_mut() {
            Some(held) => held.push(envelope),
            None => state.deliver(envelope),
        }
        Ok(())
    }

    async fn subscribe(&self, identity: &CallIdentity) -> Result<EnvelopeStream, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.insert(identity.clone(), tx);
        tracing::debug!(identity = %identity, "Loopback subscriber registered");
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl CallDirectory for LoopbackRelay {
    async fn notify_call_intent(
        &self,
        from: &CallIdentity,
        to: &CallIdentity,
    ) -> Result<(), SignalingError> {
        self.state.lock().intents.push((from.clone(), to.clone()));
        Ok(())
    }

    async fn notify_call_end(
        &self,
        from: &CallIdentity,
        to: &CallIdentity,
    ) -> Result<(), SignalingError> {
        self.state.lock().ends.push((from.clone(), to.clone()));
        Ok(())
    }
}

/// Synthetic camera and microphone
///
/// Counts open tracks so tests can check that every acquisition is
/// released.
#[derive(Default)]
pub struct LoopbackCapture {
    failure: Mutex<Option<MediaError>>,
    delay: Option<Duration>,
    open_tracks: AtomicUsize,
    acquisitions: AtomicUsize,
    next_track: AtomicUsize,
}

impl LoopbackCapture {
    /// Device that opens every requested track
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Device whose `open` fails with `error`
    #[must_use]
    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Mutex::new(Some(error)),
            ..Self::default()
        }
    }

    /// Delay every `open`, like a permission prompt would
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Tracks currently open
    #[must_use]
    pub fn open_tracks(&self) -> usize {
        self.open_tracks.load(Ordering::SeqCst)
    }

    /// Successful `open` calls so far
    #[must_use]
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for LoopbackCapture {
    async fn open(&self, constraints: &MediaConstraints) -> Result<Vec<CaptureTrack>, MediaError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        let kinds = constraints.to_media_types();
        if kinds.is_empty() {
            return Err(MediaError::DeviceUnavailable(
                "no media kind requested".to_string(),
            ));
        }

        let tracks: Vec<CaptureTrack> = kinds
            .into_iter()
            .map(|kind| CaptureTrack {
                id: format!(
                    "{}-{}",
                    kind.as_str(),
                    self.next_track.fetch_add(1, Ordering::SeqCst)
                ),
                kind,
            })
            .collect();
        self.open_tracks.fetch_add(tracks.len(), Ordering::SeqCst);
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(tracks)
    }

    fn stop(&self, track: &CaptureTrack) {
        self.open_tracks.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(track = %track.id, "Loopback track stopped");
    }

    fn set_enabled(&self, track: &CaptureTrack, enabled: bool) {
        tracing::trace!(track = %track.id, enabled, "Loopback track toggled");
    }
}

/// Peer sessions that "connect" as soon as both descriptions and one remote
/// candidate are known
#[derive(Default)]
pub struct LoopbackPeerFactory {
    fail_connectivity: bool,
    open_sessions: Arc<AtomicUsize>,
    answers_applied: Arc<AtomicUsize>,
    next_session: AtomicUsize,
}

impl LoopbackPeerFactory {
    /// Factory whose sessions connect
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose sessions exhaust their connectivity checks
    #[must_use]
    pub fn failing_connectivity() -> Self {
        Self {
            fail_connectivity: true,
            ..Self::default()
        }
    }

    /// Sessions opened and not yet closed
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Answers applied by caller-side sessions
    #[must_use]
    pub fn answers_applied(&self) -> usize {
        self.answers_applied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerSessionFactory for LoopbackPeerFactory {
    async fn open(
        &self,
        local_tracks: &[LocalTrackInfo],
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerSession>, NegotiationError> {
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackPeerSession {
            id: self.next_session.fetch_add(1, Ordering::SeqCst),
            local_kinds: local_tracks.iter().map(|t| t.kind).collect(),
            events,
            fail_connectivity: self.fail_connectivity,
            state: Mutex::new(PeerState::default()),
            open_sessions: self.open_sessions.clone(),
            answers_applied: self.answers_applied.clone(),
        }))
    }
}

#[derive(Default)]
struct PeerState {
    remote_kinds: Option<Vec<MediaType>>,
    remote_candidates: usize,
    finished: bool,
    closed: bool,
}

struct LoopbackPeerSession {
    id: usize,
    local_kinds: Vec<MediaType>,
    events: PeerEvents,
    fail_connectivity: bool,
    state: Mutex<PeerState>,
    open_sessions: Arc<AtomicUsize>,
    answers_applied: Arc<AtomicUsize>,
}

impl LoopbackPeerSession {
    fn description(&self) -> String {
        let mut sdp = format!(
            "v=0\r\no=tandem {} 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.id
        );
        for kind in &self.local_kinds {
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\n", kind.as_str()));
        }
        sdp
    }

    fn parse_kinds(description: &str) -> Result<Vec<MediaType>, NegotiationError> {
        if !description.starts_with("v=0") {
            return Err(NegotiationError::Description(
                "not a session description".to_string(),
            ));
        }
        Ok(description
            .lines()
            .filter_map(|line| line.strip_prefix("m="))
            .filter_map(|media| match media.split_whitespace().next() {
                Some("audio") => Some(MediaType::Audio),
                Some("video") => Some(MediaType::Video),
                _ => None,
            })
            .collect())
    }

    fn gather(&self) {
        self.events.emit(PeerEvent::LocalCandidate(CandidatePayload {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.id,
                40000 + self.id
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
    }

    fn check_connectivity(&self) {
        let remote_kinds = {
            let mut state = self.state.lock();
            if state.finished || state.closed || state.remote_candidates == 0 {
                return;
            }
            let Some(kinds) = state.remote_kinds.clone() else {
                return;
            };
            state.finished = true;
            kinds
        };

        if self.fail_connectivity {
            self.events.emit(PeerEvent::Failed);
            return;
        }
        for kind in remote_kinds {
            self.events.emit(PeerEvent::RemoteTrack(RemoteTrack {
                id: format!("remote-{}", kind.as_str()),
                kind,
            }));
        }
        self.events.emit(PeerEvent::Connected);
    }
}

#[async_trait]
impl PeerSession for LoopbackPeerSession {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self.description();
        self.gather();
        Ok(offer)
    }

    async fn create_answer(&self, offer: &str) -> Result<String, NegotiationError> {
        let kinds = Self::parse_kinds(offer)?;
        self.state.lock().remote_kinds = Some(kinds);
        let answer = self.description();
        self.gather();
        self.check_connectivity();
        Ok(answer)
    }

    async fn apply_answer(&self, answer: &str) -> Result<(), NegotiationError> {
        let kinds = Self::parse_kinds(answer)?;
        self.state.lock().remote_kinds = Some(kinds);
        self.answers_applied.fetch_add(1, Ordering::SeqCst);
        self.check_connectivity();
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: CandidatePayload,
    ) -> Result<(), NegotiationError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(NegotiationError::Candidate(candidate.candidate));
        }
        self.state.lock().remote_candidates += 1;
        self.check_connectivity();
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
