//! Offer/answer negotiation
//!
//! The [`NegotiationEngine`] drives the session-description exchange and the
//! candidate trickle of one call over its [`CallChannel`], and turns the
//! callbacks of the underlying [`PeerSession`] into typed events that the
//! call state machine consumes from a single queue.
//!
//! # Flow
//!
//! ```text
//! caller                                   callee
//!   │ initiate_as_caller ── Offer ──────────► │ initiate_as_callee
//!   │ ◄──────────────────── Answer ────────── │
//!   │ ◄──── Candidate ────► Candidate ──────► │
//!   │ Connected                     Connected │
//! ```

use crate::signaling::{
    CallChannel, CandidatePayload, EnvelopeKind, SignalingEnvelope, SignalingError,
};
use crate::types::{CallFailure, CallId, LocalTrackInfo, RemoteTrack};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Session description could not be created or applied
    #[error("Session description error: {0}")]
    Description(String),

    /// Remote candidate could not be applied
    #[error("Candidate error: {0}")]
    Candidate(String),

    /// Peer transport could not be created
    #[error("Peer transport error: {0}")]
    Transport(String),

    /// Signaling failed
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// Operation not valid in the current negotiation phase
    #[error("Invalid negotiation state: {0}")]
    InvalidState(&'static str),
}

impl From<NegotiationError> for CallFailure {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::Signaling(_) => CallFailure::TransportUnavailable,
            _ => CallFailure::ConnectivityFailed,
        }
    }
}

/// Connectivity of the direct media transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    /// Not started
    New,
    /// Offer/answer or connectivity checks in progress
    Connecting,
    /// Media path established
    Connected,
    /// Connectivity checks exhausted or no answer in time
    Failed,
}

/// Callbacks from a peer session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local network path was discovered and should be sent to the peer
    LocalCandidate(CandidatePayload),
    /// The peer started delivering a track
    RemoteTrack(RemoteTrack),
    /// Connectivity checks succeeded
    Connected,
    /// Connectivity checks failed for every candidate pair
    Failed,
}

/// Events consumed by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// Peer session callback
    Peer(PeerEvent),
    /// The response timeout elapsed
    ResponseTimeout,
}

/// Queue carrying negotiation events of every call to the state machine
pub type NegotiationSink = mpsc::UnboundedSender<(CallId, NegotiationEvent)>;

/// Handle given to a peer session to report its callbacks
#[derive(Debug, Clone)]
pub struct PeerEvents {
    call_id: CallId,
    tx: NegotiationSink,
}

impl PeerEvents {
    /// Create an event handle for a call
    #[must_use]
    pub fn new(call_id: CallId, tx: NegotiationSink) -> Self {
        Self { call_id, tx }
    }

    /// Report a peer callback; returns `false` if nobody listens anymore
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send((self.call_id, NegotiationEvent::Peer(event)))
            .is_ok()
    }

    fn emit_timeout(&self) -> bool {
        self.tx
            .send((self.call_id, NegotiationEvent::ResponseTimeout))
            .is_ok()
    }
}

/// The direct media transport of one call
///
/// Implementations report asynchronous callbacks (local candidates, remote
/// tracks, connectivity) through the [`PeerEvents`] handed to
/// [`PeerSessionFactory::open`].
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Create and apply the local offer
    async fn create_offer(&self) -> Result<String, NegotiationError>;

    /// Apply a remote offer, then create and apply the local answer
    async fn create_answer(&self, offer: &str) -> Result<String, NegotiationError>;

    /// Apply the remote answer
    async fn apply_answer(&self, answer: &str) -> Result<(), NegotiationError>;

    /// Add a remote candidate
    async fn add_remote_candidate(&self, candidate: CandidatePayload)
        -> Result<(), NegotiationError>;

    /// Tear down the transport; must be safe to call more than once
    async fn close(&self);
}

/// Creates peer sessions bound to the local tracks of a call
#[async_trait]
pub trait PeerSessionFactory: Send + Sync {
    /// Open a peer session sending the given local tracks
    async fn open(
        &self,
        local_tracks: &[LocalTrackInfo],
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerSession>, NegotiationError>;
}

/// What the state machine must react to after an engine event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationUpdate {
    /// A remote track arrived
    RemoteTrack(RemoteTrack),
    /// Media path established
    Connected,
    /// Negotiation is over and failed
    Failed(CallFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Caller,
    Callee,
}

/// Negotiation engine tuning
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// How long to wait for the remote description
    pub response_timeout: Duration,
    /// How many early candidates to keep
    pub candidate_buffer: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            candidate_buffer: 16,
        }
    }
}

/// Offer/answer negotiation for one call
pub struct NegotiationEngine {
    channel: CallChannel,
    factory: Arc<dyn PeerSessionFactory>,
    events: PeerEvents,
    config: NegotiationConfig,
    role: Option<Role>,
    local_tracks: Option<Vec<LocalTrackInfo>>,
    session: Option<Arc<dyn PeerSession>>,
    remote_description: bool,
    pending_offer: Option<String>,
    early_candidates: VecDeque<CandidatePayload>,
    connectivity: Connectivity,
    remote_tracks: Vec<RemoteTrack>,
    timer: Option<JoinHandle<()>>,
    closed: bool,
}

impl NegotiationEngine {
    /// Create an engine for a call
    #[must_use]
    pub fn new(
        channel: CallChannel,
        factory: Arc<dyn PeerSessionFactory>,
        events: PeerEvents,
        config: NegotiationConfig,
    ) -> Self {
        Self {
            channel,
            factory,
            events,
            config,
            role: None,
            local_tracks: None,
            session: None,
            remote_description: false,
            pending_offer: None,
            early_candidates: VecDeque::new(),
            connectivity: Connectivity::New,
            remote_tracks: Vec::new(),
            timer: None,
            closed: false,
        }
    }

    /// Current connectivity
    #[must_use]
    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    /// Remote tracks delivered so far
    #[must_use]
    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    /// Start as the caller: create the offer, send it and wait for an answer
    ///
    /// # Errors
    ///
    /// Returns error if the offer cannot be created or sent
    #[tracing::instrument(skip(self, local_tracks), fields(call_id = %self.channel.call_id()))]
    pub async fn initiate_as_caller(
        &mut self,
        local_tracks: &[LocalTrackInfo],
    ) -> Result<(), NegotiationError> {
        if self.closed || self.role.is_some() {
            return Err(NegotiationError::InvalidState("already initiated"));
        }
        self.role = Some(Role::Caller);
        self.local_tracks = Some(local_tracks.to_vec());
        self.connectivity = Connectivity::Connecting;

        let session = self.factory.open(local_tracks, self.events.clone()).await?;
        self.session = Some(session.clone());
        let offer = session.create_offer().await?;
        self.channel.send(EnvelopeKind::Offer, offer).await?;
        self.arm_response_timeout();

        tracing::debug!("Offer sent, awaiting answer");
        Ok(())
    }

    /// Wait for the caller's offer with the given local tracks
    ///
    /// The offer is applied as soon as it arrives (or immediately if it is
    /// already buffered). The response timeout covers the wait.
    ///
    /// # Errors
    ///
    /// Returns error if a buffered offer cannot be answered
    #[tracing::instrument(skip(self, local_tracks), fields(call_id = %self.channel.call_id()))]
    pub async fn await_offer(
        &mut self,
        local_tracks: &[LocalTrackInfo],
    ) -> Result<(), NegotiationError> {
        if self.closed || self.role.is_some() {
            return Err(NegotiationError::InvalidState("already initiated"));
        }
        self.role = Some(Role::Callee);
        self.local_tracks = Some(local_tracks.to_vec());
        self.connectivity = Connectivity::Connecting;
        self.arm_response_timeout();

        if let Some(offer) = self.pending_offer.take() {
            self.initiate_as_callee(local_tracks, &offer).await?;
        }
        Ok(())
    }

    /// Answer an offer: apply it, create the local answer and send it
    ///
    /// # Errors
    ///
    /// Returns error if the answer cannot be created or sent
    #[tracing::instrument(
        skip(self, local_tracks, offer),
        fields(call_id = %self.channel.call_id(), offer_len = offer.len())
    )]
    pub async fn initiate_as_callee(
        &mut self,
        local_tracks: &[LocalTrackInfo],
        offer: &str,
    ) -> Result<(), NegotiationError> {
        if self.closed {
            return Err(NegotiationError::InvalidState("closed"));
        }
        if self.remote_description {
            tracing::debug!("Offer already applied, ignoring");
            return Ok(());
        }
        if offer.trim().is_empty() {
            return Err(NegotiationError::Description(
                "offer cannot be empty".to_string(),
            ));
        }
        self.role = Some(Role::Callee);
        self.local_tracks = Some(local_tracks.to_vec());
        self.connectivity = Connectivity::Connecting;

        let session = match &self.session {
            Some(session) => session.clone(),
            None => {
                let session = self.factory.open(local_tracks, self.events.clone()).await?;
                self.session = Some(session.clone());
                session
            }
        };

        let answer = session.create_answer(offer).await?;
        self.remote_description = true;
        self.cancel_timer();
        self.channel.send(EnvelopeKind::Answer, answer).await?;
        self.flush_candidates().await?;

        tracing::debug!("Answer sent");
        Ok(())
    }

    /// Apply an `Offer`, `Answer` or `Candidate` envelope
    ///
    /// # Errors
    ///
    /// Returns error if the description or candidate cannot be applied
    #[tracing::instrument(
        skip(self, envelope),
        fields(call_id = %envelope.call_id, kind = ?envelope.kind, seq = envelope.sequence)
    )]
    pub async fn on_envelope(
        &mut self,
        envelope: &SignalingEnvelope,
    ) -> Result<(), NegotiationError> {
        if self.closed {
            return Ok(());
        }
        match envelope.kind {
            EnvelopeKind::Offer => self.on_offer(&envelope.payload).await,
            EnvelopeKind::Answer => self.on_answer(&envelope.payload).await,
            EnvelopeKind::Candidate => match CandidatePayload::decode(&envelope.payload) {
                Ok(candidate) => self.on_candidate(candidate).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed candidate, dropping");
                    Ok(())
                }
            },
            other => {
                tracing::warn!(kind = ?other, "Not a negotiation envelope");
                Ok(())
            }
        }
    }

    async fn on_offer(&mut self, offer: &str) -> Result<(), NegotiationError> {
        match self.role {
            None => {
                tracing::debug!("Offer arrived before local media, buffering");
                self.pending_offer = Some(offer.to_string());
                Ok(())
            }
            Some(Role::Callee) => {
                let local = self.local_tracks.clone().unwrap_or_default();
                self.initiate_as_callee(&local, offer).await
            }
            Some(Role::Caller) => {
                if self.remote_description {
                    tracing::debug!("Offer after answer, ignoring");
                    return Ok(());
                }
                if self.channel.local().yields_to(self.channel.remote()) {
                    tracing::info!("Offer glare, yielding to remote caller");
                    if let Some(session) = self.session.take() {
                        session.close().await;
                    }
                    self.cancel_timer();
                    let local = self.local_tracks.clone().unwrap_or_default();
                    self.initiate_as_callee(&local, offer).await
                } else {
                    tracing::info!("Offer glare, remote party yields");
                    Ok(())
                }
            }
        }
    }

    async fn on_answer(&mut self, answer: &str) -> Result<(), NegotiationError> {
        if self.role != Some(Role::Caller) {
            tracing::warn!("Answer received without a local offer, dropping");
            return Ok(());
        }
        if self.remote_description {
            tracing::debug!("Duplicate answer, ignoring");
            return Ok(());
        }
        if answer.trim().is_empty() {
            return Err(NegotiationError::Description(
                "answer cannot be empty".to_string(),
            ));
        }
        let session = self
            .session
            .clone()
            .ok_or(NegotiationError::InvalidState("no peer session"))?;
        session.apply_answer(answer).await?;
        self.remote_description = true;
        self.cancel_timer();
        self.flush_candidates().await?;

        tracing::debug!("Answer applied");
        Ok(())
    }

    async fn on_candidate(&mut self, candidate: CandidatePayload) -> Result<(), NegotiationError> {
        match (&self.session, self.remote_description) {
            (Some(session), true) => session.add_remote_candidate(candidate).await,
            _ => {
                let capacity = self.config.candidate_buffer;
                if capacity == 0 {
                    tracing::warn!("Early candidate buffering disabled, dropping candidate");
                    return Ok(());
                }
                if self.early_candidates.len() >= capacity {
                    self.early_candidates.pop_front();
                    tracing::warn!(capacity, "Early candidate buffer full, dropping oldest");
                }
                self.early_candidates.push_back(candidate);
                tracing::trace!(buffered = self.early_candidates.len(), "Candidate buffered");
                Ok(())
            }
        }
    }

    async fn flush_candidates(&mut self) -> Result<(), NegotiationError> {
        let Some(session) = self.session.clone() else {
            return Ok(());
        };
        while let Some(candidate) = self.early_candidates.pop_front() {
            if let Err(e) = session.add_remote_candidate(candidate).await {
                // The relay redelivers; one bad candidate is not fatal
                tracing::warn!(error = %e, "Buffered candidate rejected");
            }
        }
        Ok(())
    }

    /// React to a queued negotiation event
    ///
    /// Returns what the state machine has to do, if anything.
    pub async fn handle_event(&mut self, event: NegotiationEvent) -> Option<NegotiationUpdate> {
        if self.closed {
            return None;
        }
        match event {
            NegotiationEvent::Peer(PeerEvent::LocalCandidate(candidate)) => {
                let payload = match candidate.encode() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(error = %e, "Local candidate not encodable");
                        return None;
                    }
                };
                match self.channel.send(EnvelopeKind::Candidate, payload).await {
                    Ok(()) => None,
                    Err(e) => self.fail(CallFailure::from(e)),
                }
            }
            NegotiationEvent::Peer(PeerEvent::RemoteTrack(track)) => {
                if self.remote_tracks.iter().any(|t| t.id == track.id) {
                    return None;
                }
                self.remote_tracks.push(track.clone());
                Some(NegotiationUpdate::RemoteTrack(track))
            }
            NegotiationEvent::Peer(PeerEvent::Connected) => {
                if self.connectivity != Connectivity::Connecting {
                    return None;
                }
                self.connectivity = Connectivity::Connected;
                self.cancel_timer();
                tracing::info!(call_id = %self.channel.call_id(), "Connectivity established");
                Some(NegotiationUpdate::Connected)
            }
            NegotiationEvent::Peer(PeerEvent::Failed) => {
                self.fail(CallFailure::ConnectivityFailed)
            }
            NegotiationEvent::ResponseTimeout => {
                if self.remote_description {
                    return None;
                }
                self.fail(CallFailure::NegotiationTimeout)
            }
        }
    }

    fn fail(&mut self, reason: CallFailure) -> Option<NegotiationUpdate> {
        if matches!(
            self.connectivity,
            Connectivity::Failed | Connectivity::Connected
        ) {
            return None;
        }
        self.connectivity = Connectivity::Failed;
        self.cancel_timer();
        tracing::warn!(call_id = %self.channel.call_id(), reason = %reason, "Negotiation failed");
        Some(NegotiationUpdate::Failed(reason))
    }

    fn arm_response_timeout(&mut self) {
        self.cancel_timer();
        let events = self.events.clone();
        let timeout = self.config.response_timeout;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            events.emit_timeout();
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Tear down the peer session and drop remote track references
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel_timer();
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.remote_tracks.clear();
        self.early_candidates.clear();
        self.pending_offer = None;
        tracing::debug!(call_id = %self.channel.call_id(), "Negotiation closed");
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
