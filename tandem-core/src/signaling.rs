//! Call signaling protocol
//!
//! Carries typed envelopes between the two parties of a call over any relay
//! that satisfies the [`SignalingTransport`] contract: best-effort send and
//! at-least-once delivery to a subscriber. Everything above this module
//! treats duplicates and reordering as normal.

use crate::identity::CallIdentity;
use crate::types::{CallFailure, CallId};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// The backing channel could not accept the envelope
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Subscribing to inbound envelopes failed
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Envelope payload could not be decoded
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<SignalingError> for CallFailure {
    fn from(_: SignalingError) -> Self {
        CallFailure::TransportUnavailable
    }
}

/// Envelope kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Start of a call
    Invite,
    /// Callee accepted the invite
    Accept,
    /// Callee refused the invite (payload carries the reason)
    Decline,
    /// Session description offer
    Offer,
    /// Session description answer
    Answer,
    /// Network path candidate
    Candidate,
    /// Either party hung up
    End,
}

impl EnvelopeKind {
    /// Kinds that belong to the offer/answer exchange
    #[must_use]
    pub fn is_negotiation(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::Candidate)
    }
}

/// One signaling message between the two parties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    /// Call this envelope belongs to
    pub call_id: CallId,
    /// Sender
    pub from: CallIdentity,
    /// Recipient
    pub to: CallIdentity,
    /// Message kind
    pub kind: EnvelopeKind,
    /// Opaque payload (session description, candidate, decline reason)
    #[serde(default)]
    pub payload: String,
    /// Per-call, per-sender monotonically increasing sequence
    pub sequence: u64,
}

/// Deduplication key for at-least-once delivery
pub type EnvelopeKey = (CallIdentity, EnvelopeKind, u64);

impl SignalingEnvelope {
    /// Key identifying redeliveries of the same envelope
    #[must_use]
    pub fn dedup_key(&self) -> EnvelopeKey {
        (self.from.clone(), self.kind, self.sequence)
    }
}

/// Reason carried by a `Decline` envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclineReason {
    /// The user refused the call
    Declined,
    /// The callee is already in a call
    Busy,
    /// The callee accepted but could not open its devices
    Unavailable,
}

impl DeclineReason {
    /// Encode as envelope payload
    #[must_use]
    pub fn as_payload(self) -> &'static str {
        match self {
            Self::Declined => "declined",
            Self::Busy => "busy",
            Self::Unavailable => "unavailable",
        }
    }

    /// Decode from envelope payload; unknown reasons read as a plain decline
    #[must_use]
    pub fn from_payload(payload: &str) -> Self {
        match payload {
            "busy" => Self::Busy,
            "unavailable" => Self::Unavailable,
            _ => Self::Declined,
        }
    }
}

impl From<DeclineReason> for CallFailure {
    fn from(reason: DeclineReason) -> Self {
        match reason {
            DeclineReason::Busy => CallFailure::Busy,
            DeclineReason::Declined | DeclineReason::Unavailable => CallFailure::Declined,
        }
    }
}

/// Candidate payload, JSON-encoded inside `Candidate` envelopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    /// Candidate string
    pub candidate: String,
    /// SDP mid
    pub sdp_mid: Option<String>,
    /// SDP mline index
    pub sdp_mline_index: Option<u16>,
}

impl CandidatePayload {
    /// Encode as envelope payload
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn encode(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::InvalidPayload(e.to_string()))
    }

    /// Decode from envelope payload
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a candidate
    pub fn decode(payload: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(payload).map_err(|e| SignalingError::InvalidPayload(e.to_string()))
    }
}

/// Stream of envelopes addressed to one identity
pub type EnvelopeStream = BoxStream<'static, SignalingEnvelope>;

/// Signaling transport trait
///
/// Implement this for the relay backing your deployment (push channel,
/// short-interval polling, persistent socket). The core only relies on:
///
/// - `send_envelope` failing with [`SignalingError::TransportUnavailable`]
///   when the relay cannot accept the envelope
/// - `subscribe` delivering every envelope addressed to the identity at
///   least once
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Relay an envelope to `envelope.to`
    async fn send_envelope(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError>;

    /// Subscribe to envelopes addressed to `identity`
    async fn subscribe(&self, identity: &CallIdentity) -> Result<EnvelopeStream, SignalingError>;
}

/// Directory backend call notifications
///
/// Records call intent and termination for presence and history on the
/// directory service. Purely informational for the core.
#[async_trait]
pub trait CallDirectory: Send + Sync {
    /// Record that `from` is calling `to`
    async fn notify_call_intent(
        &self,
        from: &CallIdentity,
        to: &CallIdentity,
    ) -> Result<(), SignalingError>;

    /// Record that the call between `from` and `to` ended
    async fn notify_call_end(
        &self,
        from: &CallIdentity,
        to: &CallIdentity,
    ) -> Result<(), SignalingError>;
}

/// Default pause before the single retry of a failed send
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Signaling handler with send retry and directory notifications
pub struct SignalingHandler {
    transport: Arc<dyn SignalingTransport>,
    directory: Option<Arc<dyn CallDirectory>>,
    retry_backoff: Duration,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            transport,
            directory: None,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Attach a directory backend for call intent/end notifications
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn CallDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Set the pause before retrying a failed send
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Send an envelope, retrying once after a backoff
    ///
    /// # Errors
    ///
    /// Returns the second failure if the retry fails as well
    #[tracing::instrument(
        skip(self, envelope),
        fields(
            call_id = %envelope.call_id,
            to = %envelope.to,
            kind = ?envelope.kind,
            seq = envelope.sequence
        )
    )]
    pub async fn send_envelope(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling envelope");
        match self.transport.send_envelope(envelope.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    backoff_ms = self.retry_backoff.as_millis(),
                    "Envelope send failed, retrying once"
                );
                sleep(self.retry_backoff).await;
                self.transport.send_envelope(envelope).await.map_err(|e| {
                    tracing::warn!(error = %e, "Envelope send failed after retry");
                    e
                })
            }
        }
    }

    /// Subscribe to envelopes addressed to `identity`
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses the subscription
    #[tracing::instrument(skip(self), fields(identity = %identity))]
    pub async fn subscribe(
        &self,
        identity: &CallIdentity,
    ) -> Result<EnvelopeStream, SignalingError> {
        tracing::info!("Subscribing to signaling envelopes");
        self.transport.subscribe(identity).await
    }

    /// Tell the directory a call is being placed. Failures are logged only.
    pub async fn notify_call_intent(&self, from: &CallIdentity, to: &CallIdentity) {
        if let Some(directory) = &self.directory {
            if let Err(e) = directory.notify_call_intent(from, to).await {
                tracing::warn!(from = %from, to = %to, error = %e, "Directory call intent failed");
            }
        }
    }

    /// Tell the directory a call ended. Failures are logged only.
    pub async fn notify_call_end(&self, from: &CallIdentity, to: &CallIdentity) {
        if let Some(directory) = &self.directory {
            if let Err(e) = directory.notify_call_end(from, to).await {
                tracing::warn!(from = %from, to = %to, error = %e, "Directory call end failed");
            }
        }
    }
}

/// Outbound signaling for one call
///
/// Stamps every envelope with the call id, the party pair and the next
/// sequence number. Clones share the sequence counter, so the state machine
/// and the negotiation engine never reuse a sequence.
#[derive(Clone)]
pub struct CallChannel {
    handler: Arc<SignalingHandler>,
    call_id: CallId,
    local: CallIdentity,
    remote: CallIdentity,
    next_sequence: Arc<AtomicU64>,
}

impl CallChannel {
    /// Create the channel for a call
    #[must_use]
    pub fn new(
        handler: Arc<SignalingHandler>,
        call_id: CallId,
        local: CallIdentity,
        remote: CallIdentity,
    ) -> Self {
        Self {
            handler,
            call_id,
            local,
            remote,
            next_sequence: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Call identifier
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Local party
    #[must_use]
    pub fn local(&self) -> &CallIdentity {
        &self.local
    }

    /// Remote party
    #[must_use]
    pub fn remote(&self) -> &CallIdentity {
        &self.remote
    }

    /// Build the next envelope of this call
    #[must_use]
    pub fn envelope(&self, kind: EnvelopeKind, payload: impl Into<String>) -> SignalingEnvelope {
        SignalingEnvelope {
            call_id: self.call_id,
            from: self.local.clone(),
            to: self.remote.clone(),
            kind,
            payload: payload.into(),
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Send an envelope of this call
    ///
    /// # Errors
    ///
    /// Returns error if the send fails after its retry
    pub async fn send(
        &self,
        kind: EnvelopeKind,
        payload: impl Into<String>,
    ) -> Result<(), SignalingError> {
        let envelope = self.envelope(kind, payload);
        self.handler.send_envelope(envelope).await
    }

    /// Record the call intent with the directory
    pub async fn notify_intent(&self) {
        self.handler
            .notify_call_intent(&self.local, &self.remote)
            .await;
    }

    /// Record the end of the call with the directory
    pub async fn notify_end(&self) {
        self.handler.notify_call_end(&self.local, &self.remote).await;
    }
}

/// Bounded record of envelopes already processed
///
/// Remembers the last `capacity` keys; older keys are forgotten first.
#[derive(Debug)]
pub struct EnvelopeDeduplicator {
    seen: HashSet<EnvelopeKey>,
    order: VecDeque<EnvelopeKey>,
    capacity: usize,
}

impl EnvelopeDeduplicator {
    /// Create a deduplicator remembering up to `capacity` keys
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record an envelope; returns `false` if it was seen before
    pub fn observe(&mut self, envelope: &SignalingEnvelope) -> bool {
        let key = envelope.dedup_key();
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }
}
