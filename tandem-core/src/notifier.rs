//! Incoming call notifier
//!
//! Holds the single invite waiting for the user's accept/decline decision.
//! Everything else that arrives while an invite is pending, or while a call
//! is active, is turned away as busy.

use crate::identity::CallIdentity;
use crate::signaling::SignalingEnvelope;
use crate::types::{CallId, MediaConstraints};
use chrono::{DateTime, Utc};

/// An invite waiting for a decision
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInvite {
    /// Call identifier chosen by the inviter
    pub call_id: CallId,
    /// Who is calling
    pub from: CallIdentity,
    /// Media requested by the inviter
    pub constraints: MediaConstraints,
    /// When the invite arrived
    pub received_at: DateTime<Utc>,
}

/// What to do with an inbound invite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteDisposition {
    /// Show it to the user
    Surface,
    /// Another call is pending or active; decline with `Busy`
    AutoDeclineBusy,
    /// Redelivery of the invite already pending
    Duplicate,
}

/// Incoming call decision point
#[derive(Debug, Default)]
pub struct IncomingCallNotifier {
    pending: Option<PendingInvite>,
}

impl IncomingCallNotifier {
    /// Create a notifier with nothing pending
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify an inbound invite, making it pending if it is surfaced
    ///
    /// The invite payload carries the inviter's media constraints; when it
    /// cannot be read, `fallback` is used.
    pub fn on_invite(
        &mut self,
        envelope: &SignalingEnvelope,
        call_active: bool,
        fallback: &MediaConstraints,
    ) -> InviteDisposition {
        if let Some(pending) = &self.pending {
            if pending.call_id == envelope.call_id {
                return InviteDisposition::Duplicate;
            }
            return InviteDisposition::AutoDeclineBusy;
        }
        if call_active {
            return InviteDisposition::AutoDeclineBusy;
        }

        let constraints = serde_json::from_str(&envelope.payload).unwrap_or_else(|_| {
            tracing::debug!(
                call_id = %envelope.call_id,
                "Invite without constraints, using defaults"
            );
            fallback.clone()
        });
        self.pending = Some(PendingInvite {
            call_id: envelope.call_id,
            from: envelope.from.clone(),
            constraints,
            received_at: Utc::now(),
        });
        tracing::info!(call_id = %envelope.call_id, from = %envelope.from, "Incoming call");
        InviteDisposition::Surface
    }

    /// Clear the pending invite if the inviter withdrew it
    pub fn withdraw(&mut self, call_id: CallId, from: &CallIdentity) -> Option<PendingInvite> {
        match &self.pending {
            Some(p) if p.call_id == call_id && &p.from == from => {
                tracing::debug!(call_id = %call_id, "Pending invite withdrawn");
                self.pending.take()
            }
            _ => None,
        }
    }

    /// Take the pending invite for a user decision
    pub fn take(&mut self) -> Option<PendingInvite> {
        self.pending.take()
    }

    /// Currently pending invite
    #[must_use]
    pub fn pending(&self) -> Option<&PendingInvite> {
        self.pending.as_ref()
    }
}
