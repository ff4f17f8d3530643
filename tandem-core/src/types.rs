//! Call types and data structures

use crate::identity::CallIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a call
///
/// Chosen by the inviting party and echoed in every envelope of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media constraints for a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
    /// Requested capture resolution when video is enabled
    pub resolution: VideoResolution,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            resolution: VideoResolution::HD720,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
            resolution: VideoResolution::HD720,
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }

    /// Convert to media types
    pub fn to_media_types(&self) -> Vec<MediaType> {
        let mut types = Vec::new();
        if self.audio {
            types.push(MediaType::Audio);
        }
        if self.video {
            types.push(MediaType::Video);
        }
        types
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Types of media in a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

impl MediaType {
    /// SDP media line name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Video resolution options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoResolution {
    /// 320x240
    QVGA240,
    /// 640x480
    SD480,
    /// 1280x720
    HD720,
    /// 1920x1080
    HD1080,
}

impl VideoResolution {
    /// Get width in pixels
    pub fn width(&self) -> u32 {
        match self {
            Self::QVGA240 => 320,
            Self::SD480 => 640,
            Self::HD720 => 1280,
            Self::HD1080 => 1920,
        }
    }

    /// Get height in pixels
    pub fn height(&self) -> u32 {
        match self {
            Self::QVGA240 => 240,
            Self::SD480 => 480,
            Self::HD720 => 720,
            Self::HD1080 => 1080,
        }
    }
}

/// Which side placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// Local party placed the call
    Outgoing,
    /// Remote party placed the call
    Incoming,
}

/// Call state enumeration
///
/// ```text
///   Idle ──► Requesting ──► Ringing ──► Negotiating ──► Connected ──► Ending ──► Ended
///                │             │             │
///                └─────────────┴─────────────┴──► Failed
/// ```
///
/// `Ringing` is only visited by outgoing calls. A remote `End` moves any
/// non-terminal state through `Ending` to `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No call
    Idle,
    /// Acquiring local media (outgoing) or awaiting the user's decision (incoming)
    Requesting,
    /// Invite sent, waiting for the remote party to accept or decline
    Ringing,
    /// Offer/answer and candidate exchange in progress
    Negotiating,
    /// Media is flowing
    Connected,
    /// Cleanup in progress
    Ending,
    /// Call finished normally or was declined
    Ended,
    /// Call could not be established
    Failed,
}

impl CallState {
    /// Terminal states end a session instance
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Whether a session in this state holds the single call slot
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Ended | Self::Failed)
    }

    /// Check if a state transition is allowed
    ///
    /// # Valid Transitions
    ///
    /// - **Setup**: Idle → Requesting → Ringing → Negotiating → Connected
    /// - **Incoming accept**: Requesting → Negotiating
    /// - **Teardown**: any non-terminal → Ending → Ended
    /// - **Failure**: Requesting, Ringing, Negotiating → Failed
    #[must_use]
    pub fn can_transition_to(self, to: CallState) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Requesting)
                | (Self::Requesting, Self::Ringing)
                | (Self::Requesting, Self::Negotiating)
                | (Self::Ringing, Self::Negotiating)
                | (Self::Negotiating, Self::Connected)
                | (Self::Requesting, Self::Failed)
                | (Self::Ringing, Self::Failed)
                | (Self::Negotiating, Self::Failed)
                | (Self::Requesting, Self::Ending)
                | (Self::Ringing, Self::Ending)
                | (Self::Negotiating, Self::Ending)
                | (Self::Connected, Self::Ending)
                | (Self::Ending, Self::Ended)
        )
    }
}

/// Why a call did not (or no longer does) carry media
///
/// Surfaced verbatim to presentation as the session's `last_error`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallFailure {
    /// No camera or microphone
    #[error("No camera or microphone available")]
    DeviceUnavailable,
    /// User refused capture permission
    #[error("Camera/microphone permission denied")]
    PermissionDenied,
    /// Capture device held by another application
    #[error("Camera/microphone is busy")]
    DeviceBusy,
    /// Signaling channel rejected an envelope
    #[error("Signaling transport unavailable")]
    TransportUnavailable,
    /// Remote party never answered the invite
    #[error("No answer")]
    NoAnswer,
    /// Remote party is in another call
    #[error("Remote party is busy")]
    Busy,
    /// Remote party declined the call
    #[error("Call declined")]
    Declined,
    /// No answer to the session offer in time
    #[error("Negotiation timed out")]
    NegotiationTimeout,
    /// Media path could not be established
    #[error("Connection failed")]
    ConnectivityFailed,
}

/// Read-only view of a local capture track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTrackInfo {
    /// Track identifier
    pub id: String,
    /// Media kind
    pub kind: MediaType,
    /// Whether the track is currently sending (not muted)
    pub enabled: bool,
}

/// A track delivered by the remote party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier as announced by the remote party
    pub id: String,
    /// Media kind
    pub kind: MediaType,
}

/// Observable snapshot of the current (or last) call session
///
/// This is what presentation renders. It is replaced as a whole on every
/// state change; it never aliases the session's owned resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSnapshot {
    /// Call identifier, `None` before the first call
    pub call_id: Option<CallId>,
    /// Local party
    pub local: CallIdentity,
    /// Remote party
    pub remote: Option<CallIdentity>,
    /// Who placed the call
    pub direction: Option<CallDirection>,
    /// Current state
    pub state: CallState,
    /// When the session was created
    pub started_at: Option<DateTime<Utc>>,
    /// When media started flowing
    pub connected_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
    /// Local capture tracks
    pub local_tracks: Vec<LocalTrackInfo>,
    /// Remote tracks delivered so far
    pub remote_tracks: Vec<RemoteTrack>,
    /// Reason the call failed or was refused
    pub last_error: Option<CallFailure>,
}

impl CallSnapshot {
    /// Snapshot for a client with no call yet
    pub fn idle(local: CallIdentity) -> Self {
        Self {
            call_id: None,
            local,
            remote: None,
            direction: None,
            state: CallState::Idle,
            started_at: None,
            connected_at: None,
            ended_at: None,
            local_tracks: Vec::new(),
            remote_tracks: Vec::new(),
            last_error: None,
        }
    }

    /// Time spent connected
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.connected_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            (Some(start), None) => Some(Utc::now() - start),
            _ => None,
        }
    }
}

/// Call event for notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallEvent {
    /// An invite is waiting for the user's decision
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        from: CallIdentity,
    },
    /// The caller gave up before a decision was made
    IncomingCallWithdrawn {
        /// Call identifier
        call_id: CallId,
        /// Who was calling
        from: CallIdentity,
    },
    /// Session state changed
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous state
        old_state: CallState,
        /// New state
        new_state: CallState,
    },
    /// The remote party started delivering a track
    RemoteTrackAdded {
        /// Call identifier
        call_id: CallId,
        /// The track
        track: RemoteTrack,
    },
    /// Call failed
    CallFailed {
        /// Call identifier
        call_id: CallId,
        /// Failure reason
        reason: CallFailure,
    },
    /// Call ended
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Set when the remote party declined or was busy
        reason: Option<CallFailure>,
    },
}
