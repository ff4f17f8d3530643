//! Call session state machine
//!
//! One [`CallManager`] task per client owns the single [`CallSession`] and
//! reacts to four event sources: user commands, inbound signaling
//! envelopes, negotiation callbacks, and internal completions (device
//! acquisition results and ring timer expiry). Each event is handled to
//! completion before the next one is taken, so the state machine never
//! observes its own state half-updated.
//!
//! # Call Flow
//!
//! ```text
//!  caller                                              callee
//!  Idle ─place_call─► Requesting                        Idle
//!                        │ (media acquired)
//!                        ▼
//!                     Ringing ───────── Invite ──────► Requesting
//!                        │                                │ accept_incoming
//!                        │ ◄─────────── Accept ────────── Negotiating
//!                     Negotiating ───── Offer ───────►    │
//!                        │ ◄─────────── Answer ───────    │
//!                     Connected ◄──── Candidates ────► Connected
//!                        │ end_call
//!                     Ending ────────── End ─────────► Ending
//!                        ▼                                ▼
//!                      Ended                            Ended
//! ```

use crate::identity::CallIdentity;
use crate::media::{MediaError, MediaGuard, MediaHandle};
use crate::negotiation::{
    NegotiationConfig, NegotiationEngine, NegotiationEvent, NegotiationSink, NegotiationUpdate,
    PeerEvents, PeerSessionFactory,
};
use crate::notifier::{IncomingCallNotifier, InviteDisposition};
use crate::signaling::{
    CallChannel, DeclineReason, EnvelopeDeduplicator, EnvelopeKind, EnvelopeStream,
    SignalingEnvelope, SignalingError, SignalingHandler, DEFAULT_RETRY_BACKOFF,
};
use crate::types::{
    CallDirection, CallEvent, CallFailure, CallId, CallSnapshot, CallState, MediaConstraints,
    MediaType,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Another call already holds the call slot
    #[error("A call is already in progress")]
    CallInProgress,

    /// The remote party is the local identity
    #[error("Cannot call yourself")]
    SelfCall,

    /// No invite is waiting for a decision
    #[error("No incoming call")]
    NoIncomingCall,

    /// No call to act on
    #[error("No active call")]
    NoActiveCall,

    /// Service is missing a component
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Signaling subscription failed
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// The call manager task is gone
    #[error("Call service stopped")]
    ServiceStopped,
}

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// How long an outgoing invite may ring unanswered
    pub ring_timeout: Duration,
    /// How long to wait for the remote session description
    pub response_timeout: Duration,
    /// How many early candidates to keep per call
    pub candidate_buffer: usize,
    /// Pause before the single retry of a failed envelope send
    pub retry_backoff: Duration,
    /// Media requested when placing a call
    pub constraints: MediaConstraints,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    /// How many envelope keys to remember per call
    pub dedup_window: usize,
    /// How many finished calls to remember for stale-envelope detection
    pub recent_calls: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(10),
            candidate_buffer: 16,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            constraints: MediaConstraints::video_call(),
            event_capacity: 64,
            dedup_window: 256,
            recent_calls: 32,
        }
    }
}

impl CallConfig {
    /// Negotiation settings derived from this configuration
    #[must_use]
    pub fn negotiation(&self) -> NegotiationConfig {
        NegotiationConfig {
            response_timeout: self.response_timeout,
            candidate_buffer: self.candidate_buffer,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// User commands forwarded by the service handle
pub(crate) enum Command {
    PlaceCall {
        remote: CallIdentity,
        constraints: Option<MediaConstraints>,
        reply: Reply<CallId>,
    },
    AcceptIncoming {
        reply: Reply<CallId>,
    },
    DeclineIncoming {
        reply: Reply<()>,
    },
    EndCall {
        reply: Reply<()>,
    },
    ToggleTrack {
        kind: MediaType,
        enabled: bool,
        reply: Reply<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    MediaAcquired {
        call_id: CallId,
        result: Result<MediaHandle, MediaError>,
    },
    RingTimeout {
        call_id: CallId,
    },
}

/// Bounded record of finished call ids
#[derive(Debug)]
struct RecentCalls {
    ids: VecDeque<CallId>,
    capacity: usize,
}

impl RecentCalls {
    fn new(capacity: usize) -> Self {
        Self {
            ids: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn remember(&mut self, call_id: CallId) {
        if self.ids.contains(&call_id) {
            return;
        }
        if self.ids.len() == self.capacity {
            self.ids.pop_front();
        }
        self.ids.push_back(call_id);
    }

    fn contains(&self, call_id: CallId) -> bool {
        self.ids.contains(&call_id)
    }
}

/// The single in-flight call of a client
pub(crate) struct CallSession {
    call_id: CallId,
    direction: CallDirection,
    state: CallState,
    constraints: MediaConstraints,
    started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    local_media: Option<MediaHandle>,
    negotiation: Option<NegotiationEngine>,
    last_error: Option<CallFailure>,
    channel: CallChannel,
    dedup: EnvelopeDeduplicator,
    ring_timer: Option<JoinHandle<()>>,
    /// Call id of the outstanding device acquisition, if any
    acquiring: Option<CallId>,
    /// Whether teardown must tell the remote party
    signal_end: bool,
    /// Crossing invite held back while our own invite has not left yet
    deferred_invite: Option<SignalingEnvelope>,
}

impl CallSession {
    fn new(
        channel: CallChannel,
        direction: CallDirection,
        constraints: MediaConstraints,
        dedup_window: usize,
    ) -> Self {
        Self {
            call_id: channel.call_id(),
            direction,
            state: CallState::Idle,
            constraints,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            local_media: None,
            negotiation: None,
            last_error: None,
            channel,
            dedup: EnvelopeDeduplicator::new(dedup_window),
            ring_timer: None,
            acquiring: None,
            signal_end: false,
            deferred_invite: None,
        }
    }

    fn remote(&self) -> &CallIdentity {
        self.channel.remote()
    }

    fn is_pending_invite(&self) -> bool {
        self.direction == CallDirection::Incoming && self.state == CallState::Requesting
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: Some(self.call_id),
            local: self.channel.local().clone(),
            remote: Some(self.remote().clone()),
            direction: Some(self.direction),
            state: self.state,
            started_at: Some(self.started_at),
            connected_at: self.connected_at,
            ended_at: self.ended_at,
            local_tracks: self
                .local_media
                .as_ref()
                .map(MediaHandle::tracks)
                .unwrap_or_default(),
            remote_tracks: self
                .negotiation
                .as_ref()
                .map(|n| n.remote_tracks().to_vec())
                .unwrap_or_default(),
            last_error: self.last_error,
        }
    }
}

/// Receivers of the manager's own completion queues
pub(crate) struct ManagerInbox {
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    negotiation_rx: mpsc::UnboundedReceiver<(CallId, NegotiationEvent)>,
}

/// Call manager
///
/// Owns the call slot of one client. Runs as a single task, see
/// [`CallManager::run`].
pub(crate) struct CallManager {
    local: CallIdentity,
    config: CallConfig,
    signaling: Arc<SignalingHandler>,
    media: MediaGuard,
    peers: Arc<dyn PeerSessionFactory>,
    session: Option<CallSession>,
    notifier: IncomingCallNotifier,
    recent: RecentCalls,
    snapshot_tx: watch::Sender<CallSnapshot>,
    events_tx: broadcast::Sender<CallEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    negotiation_tx: NegotiationSink,
}

impl CallManager {
    pub(crate) fn new(
        local: CallIdentity,
        config: CallConfig,
        signaling: Arc<SignalingHandler>,
        media: MediaGuard,
        peers: Arc<dyn PeerSessionFactory>,
        snapshot_tx: watch::Sender<CallSnapshot>,
        events_tx: broadcast::Sender<CallEvent>,
    ) -> (Self, ManagerInbox) {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (negotiation_tx, negotiation_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local,
            recent: RecentCalls::new(config.recent_calls),
            config,
            signaling,
            media,
            peers,
            session: None,
            notifier: IncomingCallNotifier::new(),
            snapshot_tx,
            events_tx,
            internal_tx,
            negotiation_tx,
        };
        let inbox = ManagerInbox {
            internal_rx,
            negotiation_rx,
        };
        (manager, inbox)
    }

    /// Event loop; returns after a shutdown command or when every service
    /// handle is dropped
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut envelopes: EnvelopeStream,
        mut inbox: ManagerInbox,
    ) {
        tracing::info!(identity = %self.local, "Call manager started");
        let mut signaling_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                envelope = envelopes.next(), if signaling_open => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => {
                        tracing::warn!("Signaling subscription closed");
                        signaling_open = false;
                    }
                },
                Some(internal) = inbox.internal_rx.recv() => self.handle_internal(internal).await,
                Some((call_id, event)) = inbox.negotiation_rx.recv() => {
                    self.handle_negotiation(call_id, event).await;
                }
            }
        }

        tracing::info!(identity = %self.local, "Call manager stopped");
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::PlaceCall {
                remote,
                constraints,
                reply,
            } => {
                let result = self.place_call(remote, constraints).await;
                let _ = reply.send(result);
            }
            Command::AcceptIncoming { reply } => {
                let result = self.accept_incoming().await;
                let _ = reply.send(result);
            }
            Command::DeclineIncoming { reply } => {
                let result = self.decline_incoming().await;
                let _ = reply.send(result);
            }
            Command::EndCall { reply } => {
                let result = self.end_call().await;
                let _ = reply.send(result);
                self.resume_deferred_invite().await;
            }
            Command::ToggleTrack {
                kind,
                enabled,
                reply,
            } => {
                let result = self.toggle_track(kind, enabled);
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn active_session(&self) -> Option<&CallSession> {
        self.session.as_ref().filter(|s| s.state.is_active())
    }

    // ---- user commands ----

    #[tracing::instrument(skip(self, constraints), fields(peer = %remote))]
    async fn place_call(
        &mut self,
        remote: CallIdentity,
        constraints: Option<MediaConstraints>,
    ) -> Result<CallId, CallError> {
        if remote == self.local {
            return Err(CallError::SelfCall);
        }
        if let Some(session) = self.active_session() {
            if session.is_pending_invite() && session.remote() == &remote {
                tracing::info!("Calling the party whose invite is pending, accepting it");
                return self.accept_incoming().await;
            }
            return Err(CallError::CallInProgress);
        }

        let constraints = constraints.unwrap_or_else(|| self.config.constraints.clone());
        let call_id = CallId::new();
        self.open_session(call_id, remote, CallDirection::Outgoing, constraints.clone());
        self.set_state(CallState::Requesting);
        self.spawn_acquire(call_id, constraints);

        tracing::info!(call_id = %call_id, "Placing call");
        Ok(call_id)
    }

    async fn accept_incoming(&mut self) -> Result<CallId, CallError> {
        let invite = self.notifier.take().ok_or(CallError::NoIncomingCall)?;
        let channel = match self.session.as_ref() {
            Some(s) if s.call_id == invite.call_id && s.is_pending_invite() => s.channel.clone(),
            _ => {
                tracing::warn!(call_id = %invite.call_id, "Pending invite has no session");
                return Err(CallError::NoIncomingCall);
            }
        };

        let engine = self.new_engine(channel);
        if let Some(session) = self.session.as_mut() {
            session.negotiation = Some(engine);
            session.signal_end = true;
        }
        self.set_state(CallState::Negotiating);
        self.spawn_acquire(invite.call_id, invite.constraints);

        tracing::info!(
            call_id = %invite.call_id,
            from = %invite.from,
            waited_ms = (Utc::now() - invite.received_at).num_milliseconds(),
            "Incoming call accepted"
        );
        Ok(invite.call_id)
    }

    async fn decline_incoming(&mut self) -> Result<(), CallError> {
        let invite = self.notifier.take().ok_or(CallError::NoIncomingCall)?;
        let pending = self
            .session
            .as_ref()
            .is_some_and(|s| s.call_id == invite.call_id && s.is_pending_invite());
        if !pending {
            return Err(CallError::NoIncomingCall);
        }

        self.send_decline(DeclineReason::Declined).await;
        self.finish(None, true).await;

        tracing::info!(call_id = %invite.call_id, from = %invite.from, "Incoming call declined");
        Ok(())
    }

    async fn end_call(&mut self) -> Result<(), CallError> {
        let session = self.active_session().ok_or(CallError::NoActiveCall)?;
        if session.is_pending_invite() {
            return self.decline_incoming().await;
        }
        tracing::info!(call_id = %session.call_id, state = ?session.state, "Ending call");
        self.finish(None, true).await;
        Ok(())
    }

    fn toggle_track(&mut self, kind: MediaType, enabled: bool) -> Result<bool, CallError> {
        let handle = self
            .session
            .as_mut()
            .filter(|s| s.state.is_active())
            .and_then(|s| s.local_media.as_mut())
            .ok_or(CallError::NoActiveCall)?;
        let changed = self.media.toggle_track(handle, kind, enabled);
        if changed {
            self.publish();
        }
        Ok(changed)
    }

    async fn shutdown(&mut self) {
        if self.active_session().is_some() {
            let _ = self.end_call().await;
        }
        if let Some(invite) = self.take_deferred_invite() {
            self.decline_invite(&invite, DeclineReason::Unavailable).await;
        }
    }

    // ---- inbound signaling ----

    #[tracing::instrument(
        skip(self, envelope),
        fields(
            call_id = %envelope.call_id,
            from = %envelope.from,
            kind = ?envelope.kind,
            seq = envelope.sequence
        )
    )]
    async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        if envelope.to != self.local {
            tracing::warn!(to = %envelope.to, "Envelope for another identity, dropping");
            return;
        }
        if self.recent.contains(envelope.call_id) {
            tracing::debug!("Envelope for a finished call, dropping");
            return;
        }
        if envelope.kind == EnvelopeKind::Invite {
            self.on_invite(envelope).await;
            return;
        }

        let Some(session) = self.session.as_mut().filter(|s| s.state.is_active()) else {
            self.remember_early_end(&envelope);
            tracing::debug!("No active call, dropping");
            return;
        };
        if session.call_id != envelope.call_id {
            self.remember_early_end(&envelope);
            tracing::warn!("Stale envelope, dropping");
            return;
        }
        if session.remote() != &envelope.from {
            tracing::warn!("Envelope from another party, dropping");
            return;
        }
        if !session.dedup.observe(&envelope) {
            tracing::trace!("Duplicate envelope, dropping");
            return;
        }

        match envelope.kind {
            EnvelopeKind::Accept => self.on_accept().await,
            EnvelopeKind::Decline => {
                self.on_decline(DeclineReason::from_payload(&envelope.payload))
                    .await;
            }
            EnvelopeKind::End => self.on_remote_end(&envelope).await,
            kind if kind.is_negotiation() => self.on_negotiation_envelope(&envelope).await,
            _ => {}
        }
    }

    /// An `End` for a call we hold no session for may have overtaken its
    /// `Invite`; the invite must not surface once it arrives
    fn remember_early_end(&mut self, envelope: &SignalingEnvelope) {
        if envelope.kind == EnvelopeKind::End {
            tracing::debug!("End without a matching call, invite will be ignored");
            self.recent.remember(envelope.call_id);
        }
    }

    async fn on_invite(&mut self, envelope: SignalingEnvelope) {
        if envelope.from == self.local {
            tracing::warn!("Invite from the local identity, dropping");
            return;
        }

        if let Some(session) = self.active_session() {
            if session.call_id == envelope.call_id {
                tracing::trace!("Duplicate invite, dropping");
                return;
            }
            let glare = session.direction == CallDirection::Outgoing
                && session.remote() == &envelope.from
                && matches!(session.state, CallState::Requesting | CallState::Ringing);
            if glare {
                if self.local.yields_to(&envelope.from) {
                    self.yield_to(envelope).await;
                } else {
                    tracing::info!("Simultaneous call, remote party yields");
                    if let Some(session) = self.session.as_mut() {
                        session.deferred_invite = Some(envelope);
                    }
                }
                return;
            }
        }

        let busy = self.active_session().is_some();
        match self
            .notifier
            .on_invite(&envelope, busy, &self.config.constraints)
        {
            InviteDisposition::Surface => {
                let constraints = self
                    .notifier
                    .pending()
                    .map(|p| p.constraints.clone())
                    .unwrap_or_else(|| self.config.constraints.clone());
                self.open_session(
                    envelope.call_id,
                    envelope.from.clone(),
                    CallDirection::Incoming,
                    constraints,
                );
                if let Some(session) = self.session.as_mut() {
                    session.dedup.observe(&envelope);
                }
                self.set_state(CallState::Requesting);
                self.emit(CallEvent::IncomingCall {
                    call_id: envelope.call_id,
                    from: envelope.from,
                });
            }
            InviteDisposition::AutoDeclineBusy => {
                self.decline_invite(&envelope, DeclineReason::Busy).await;
            }
            InviteDisposition::Duplicate => tracing::trace!("Duplicate invite, dropping"),
        }
    }

    /// Give up our own outgoing call and take the remote party's invite
    async fn yield_to(&mut self, envelope: SignalingEnvelope) {
        let channel = CallChannel::new(
            self.signaling.clone(),
            envelope.call_id,
            self.local.clone(),
            envelope.from.clone(),
        );
        let engine = self.new_engine(channel.clone());
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let previous = session.call_id;
        if let Some(timer) = session.ring_timer.take() {
            timer.abort();
        }
        session.call_id = envelope.call_id;
        session.direction = CallDirection::Incoming;
        session.channel = channel;
        session.dedup = EnvelopeDeduplicator::new(self.config.dedup_window);
        session.dedup.observe(&envelope);
        session.negotiation = Some(engine);
        session.signal_end = true;
        let media_ready = session.local_media.is_some();
        self.recent.remember(previous);

        tracing::info!(
            previous_call_id = %previous,
            call_id = %envelope.call_id,
            "Simultaneous call, yielding to remote caller"
        );
        self.set_state(CallState::Negotiating);
        if media_ready {
            self.start_callee().await;
        }
    }

    async fn on_accept(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.direction != CallDirection::Outgoing || session.state != CallState::Ringing {
            tracing::debug!(state = ?session.state, "Accept ignored");
            return;
        }
        let tracks = session
            .local_media
            .as_ref()
            .map(MediaHandle::tracks)
            .unwrap_or_default();
        let engine = self.new_engine(session.channel.clone());

        if let Some(session) = self.session.as_mut() {
            if let Some(timer) = session.ring_timer.take() {
                timer.abort();
            }
            session.negotiation = Some(engine);
        }
        self.set_state(CallState::Negotiating);

        let Some(engine) = self.session.as_mut().and_then(|s| s.negotiation.as_mut()) else {
            return;
        };
        let started = engine.initiate_as_caller(&tracks).await;
        if let Err(e) = started {
            tracing::warn!(error = %e, "Could not start negotiation");
            self.fail(CallFailure::from(e)).await;
        }
    }

    async fn on_decline(&mut self, reason: DeclineReason) {
        let ringing = self.session.as_ref().is_some_and(|s| {
            s.direction == CallDirection::Outgoing && s.state == CallState::Ringing
        });
        if !ringing {
            tracing::debug!("Decline ignored");
            return;
        }
        tracing::info!(reason = reason.as_payload(), "Call declined by remote party");
        self.finish(Some(CallFailure::from(reason)), false).await;
    }

    async fn on_remote_end(&mut self, envelope: &SignalingEnvelope) {
        if let Some(invite) = self.notifier.withdraw(envelope.call_id, &envelope.from) {
            self.emit(CallEvent::IncomingCallWithdrawn {
                call_id: invite.call_id,
                from: invite.from,
            });
        }
        tracing::info!("Call ended by remote party");
        self.finish(None, false).await;
    }

    async fn on_negotiation_envelope(&mut self, envelope: &SignalingEnvelope) {
        let Some(engine) = self.session.as_mut().and_then(|s| s.negotiation.as_mut()) else {
            tracing::debug!("No negotiation in progress, dropping");
            return;
        };
        let applied = engine.on_envelope(envelope).await;
        if let Err(e) = applied {
            tracing::warn!(error = %e, "Negotiation envelope rejected");
            self.fail(CallFailure::from(e)).await;
        }
    }

    // ---- completions ----

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::MediaAcquired { call_id, result } => {
                self.on_media_acquired(call_id, result).await;
                self.resume_deferred_invite().await;
            }
            Internal::RingTimeout { call_id } => {
                let ringing = self.session.as_ref().is_some_and(|s| {
                    s.call_id == call_id
                        && s.direction == CallDirection::Outgoing
                        && s.state == CallState::Ringing
                });
                if ringing {
                    tracing::info!(call_id = %call_id, "Ring timeout, no answer");
                    self.fail(CallFailure::NoAnswer).await;
                }
            }
        }
    }

    async fn on_media_acquired(
        &mut self,
        call_id: CallId,
        result: Result<MediaHandle, MediaError>,
    ) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.state.is_active() && s.acquiring == Some(call_id))
        else {
            if let Ok(mut handle) = result {
                tracing::debug!(call_id = %call_id, "Session gone, releasing late media");
                self.media.release(&mut handle);
            }
            return;
        };
        session.acquiring = None;
        let direction = session.direction;

        match result {
            Ok(handle) => {
                session.local_media = Some(handle);
                self.publish();
                match direction {
                    CallDirection::Outgoing => self.send_invite().await,
                    CallDirection::Incoming => self.start_callee().await,
                }
            }
            Err(e) => {
                if direction == CallDirection::Incoming {
                    self.send_decline(DeclineReason::Unavailable).await;
                    if let Some(session) = self.session.as_mut() {
                        session.signal_end = false;
                    }
                }
                self.fail(CallFailure::from(e)).await;
            }
        }
    }

    async fn handle_negotiation(&mut self, call_id: CallId, event: NegotiationEvent) {
        let Some(engine) = self
            .session
            .as_mut()
            .filter(|s| s.call_id == call_id && s.state.is_active())
            .and_then(|s| s.negotiation.as_mut())
        else {
            tracing::trace!(call_id = %call_id, "Negotiation event for a finished call");
            return;
        };

        let update = engine.handle_event(event).await;
        match update {
            None => {}
            Some(NegotiationUpdate::RemoteTrack(track)) => {
                tracing::debug!(
                    call_id = %call_id,
                    track = %track.id,
                    kind = ?track.kind,
                    "Remote track added"
                );
                self.emit(CallEvent::RemoteTrackAdded { call_id, track });
                self.publish();
            }
            Some(NegotiationUpdate::Connected) => {
                if self.set_state(CallState::Connected) {
                    tracing::info!(call_id = %call_id, "Call connected");
                }
            }
            Some(NegotiationUpdate::Failed(reason)) => self.fail(reason).await,
        }
    }

    // ---- outbound steps ----

    async fn send_invite(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let channel = session.channel.clone();
        let payload = serde_json::to_string(&session.constraints).unwrap_or_default();

        if let Err(e) = channel.send(EnvelopeKind::Invite, payload).await {
            tracing::warn!(error = %e, "Invite could not be sent");
            self.fail(CallFailure::from(e)).await;
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.signal_end = true;
            // The remote party yields to our invite
            session.deferred_invite = None;
        }
        self.set_state(CallState::Ringing);
        channel.notify_intent().await;
        self.arm_ring_timer();
    }

    /// Tell the caller we are ready and wait for its offer
    async fn start_callee(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let tracks = session
            .local_media
            .as_ref()
            .map(MediaHandle::tracks)
            .unwrap_or_default();

        let sent = session.channel.send(EnvelopeKind::Accept, "").await;
        if let Err(e) = sent {
            tracing::warn!(error = %e, "Accept could not be sent");
            self.fail(CallFailure::from(e)).await;
            return;
        }

        let Some(engine) = self.session.as_mut().and_then(|s| s.negotiation.as_mut()) else {
            return;
        };
        let awaiting = engine.await_offer(&tracks).await;
        if let Err(e) = awaiting {
            tracing::warn!(error = %e, "Could not answer offer");
            self.fail(CallFailure::from(e)).await;
        }
    }

    async fn send_decline(&self, reason: DeclineReason) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if let Err(e) = session
            .channel
            .send(EnvelopeKind::Decline, reason.as_payload())
            .await
        {
            tracing::warn!(error = %e, "Decline could not be sent");
        }
    }

    /// Decline an invite that never got a session of its own
    async fn decline_invite(&mut self, envelope: &SignalingEnvelope, reason: DeclineReason) {
        let channel = CallChannel::new(
            self.signaling.clone(),
            envelope.call_id,
            self.local.clone(),
            envelope.from.clone(),
        );
        if let Err(e) = channel
            .send(EnvelopeKind::Decline, reason.as_payload())
            .await
        {
            tracing::warn!(error = %e, "Decline could not be sent");
        }
        self.recent.remember(envelope.call_id);
        tracing::info!(
            call_id = %envelope.call_id,
            from = %envelope.from,
            reason = reason.as_payload(),
            "Invite declined"
        );
    }

    /// Crossing invite held back by a session that ended before its own
    /// invite left, unless the inviter already gave up
    fn take_deferred_invite(&mut self) -> Option<SignalingEnvelope> {
        let invite = self
            .session
            .as_mut()
            .filter(|s| !s.state.is_active())
            .and_then(|s| s.deferred_invite.take())?;
        if self.recent.contains(invite.call_id) {
            tracing::debug!(call_id = %invite.call_id, "Deferred invite already withdrawn");
            return None;
        }
        Some(invite)
    }

    /// Treat a held-back crossing invite as freshly received
    async fn resume_deferred_invite(&mut self) {
        if let Some(invite) = self.take_deferred_invite() {
            tracing::info!(
                call_id = %invite.call_id,
                from = %invite.from,
                "Own call ended before its invite left, taking the crossing invite"
            );
            self.on_invite(invite).await;
        }
    }

    fn arm_ring_timer(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let call_id = session.call_id;
        let timeout = self.config.ring_timeout;
        let tx = self.internal_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Internal::RingTimeout { call_id });
        });
        if let Some(previous) = session.ring_timer.replace(timer) {
            previous.abort();
        }
    }

    fn spawn_acquire(&mut self, call_id: CallId, constraints: MediaConstraints) {
        if let Some(session) = self.session.as_mut() {
            session.acquiring = Some(call_id);
        }
        let media = self.media.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = media.acquire(&constraints).await;
            // Dropped with the message if the manager is gone
            let _ = tx.send(Internal::MediaAcquired { call_id, result });
        });
    }

    // ---- teardown ----

    /// Go through `Ending` to `Ended`
    ///
    /// `local` marks a teardown started on this side: the remote party is
    /// told and the directory records the end of an announced call.
    async fn finish(&mut self, reason: Option<CallFailure>, local: bool) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let call_id = session.call_id;
        let channel = session.channel.clone();
        let send_end = local && session.signal_end;
        // An outgoing call aborted before its invite left was never announced
        let notify =
            local && (session.signal_end || session.direction == CallDirection::Incoming);

        if !self.set_state(CallState::Ending) {
            return;
        }
        if send_end {
            if let Err(e) = channel.send(EnvelopeKind::End, "").await {
                tracing::warn!(error = %e, "End could not be sent");
            }
        }
        self.release_resources().await;
        if let Some(session) = self.session.as_mut() {
            session.last_error = reason;
        }
        self.recent.remember(call_id);
        self.set_state(CallState::Ended);
        self.emit(CallEvent::CallEnded { call_id, reason });
        if notify {
            channel.notify_end().await;
        }
    }

    /// Go to `Failed`, telling the remote party if it knows about the call
    async fn fail(&mut self, reason: CallFailure) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if !session.state.can_transition_to(CallState::Failed) {
            tracing::debug!(state = ?session.state, reason = %reason, "Failure ignored");
            return;
        }
        let call_id = session.call_id;
        let channel = session.channel.clone();
        let send_end = session.signal_end;

        if send_end {
            if let Err(e) = channel.send(EnvelopeKind::End, "").await {
                tracing::warn!(error = %e, "End could not be sent");
            }
        }
        self.release_resources().await;
        if let Some(session) = self.session.as_mut() {
            session.last_error = Some(reason);
        }
        self.recent.remember(call_id);
        self.set_state(CallState::Failed);
        tracing::warn!(call_id = %call_id, reason = %reason, "Call failed");
        self.emit(CallEvent::CallFailed { call_id, reason });
        if send_end {
            channel.notify_end().await;
        }
    }

    async fn release_resources(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(timer) = session.ring_timer.take() {
            timer.abort();
        }
        session.acquiring = None;
        if let Some(mut engine) = session.negotiation.take() {
            engine.close().await;
        }
        if let Some(mut handle) = session.local_media.take() {
            self.media.release(&mut handle);
        }
    }

    // ---- helpers ----

    fn open_session(
        &mut self,
        call_id: CallId,
        remote: CallIdentity,
        direction: CallDirection,
        constraints: MediaConstraints,
    ) {
        let channel = CallChannel::new(self.signaling.clone(), call_id, self.local.clone(), remote);
        self.session = Some(CallSession::new(
            channel,
            direction,
            constraints,
            self.config.dedup_window,
        ));
    }

    fn new_engine(&self, channel: CallChannel) -> NegotiationEngine {
        let events = PeerEvents::new(channel.call_id(), self.negotiation_tx.clone());
        NegotiationEngine::new(channel, self.peers.clone(), events, self.config.negotiation())
    }

    fn set_state(&mut self, to: CallState) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let from = session.state;
        if !from.can_transition_to(to) {
            tracing::debug!(
                call_id = %session.call_id,
                old_state = ?from,
                new_state = ?to,
                "Transition ignored"
            );
            return false;
        }

        session.state = to;
        match to {
            CallState::Connected => session.connected_at = Some(Utc::now()),
            CallState::Ended | CallState::Failed => session.ended_at = Some(Utc::now()),
            _ => {}
        }
        let call_id = session.call_id;

        tracing::debug!(
            call_id = %call_id,
            old_state = ?from,
            new_state = ?to,
            "Call state changed"
        );
        self.publish();
        self.emit(CallEvent::StateChanged {
            call_id,
            old_state: from,
            new_state: to,
        });
        true
    }

    fn publish(&self) {
        let snapshot = match &self.session {
            Some(session) => session.snapshot(),
            None => CallSnapshot::idle(self.local.clone()),
        };
        self.snapshot_tx.send_replace(snapshot);
    }

    fn emit(&self, event: CallEvent) {
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }
}
