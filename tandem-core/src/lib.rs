//! Tandem - two-party call session management
//!
//! This library turns "call this person" into a negotiated, bidirectional
//! audio/video session between two independent clients that can only
//! coordinate through a low-bandwidth relay. It features:
//!
//! - **Single owned call session**: one state machine per client, driven by
//!   user commands, relayed envelopes, timers and connectivity callbacks
//! - **Scarce-resource ownership**: camera and microphone are held only by
//!   the active call and released on every exit path
//! - **At-least-once signaling**: duplicate and stale envelopes are
//!   detected by call id and `(from, kind, sequence)`
//! - **Glare resolution**: simultaneous calls are settled by identity order
//!   without a central arbiter
//! - **Pluggable collaborators**: relay, directory, capture device and peer
//!   transport are traits; an in-process loopback is included and a real
//!   WebRTC backend sits behind the `webrtc-backend` feature
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tandem_core::loopback::{LoopbackCapture, LoopbackPeerFactory, LoopbackRelay};
//! use tandem_core::{CallIdentity, CallService};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = Arc::new(LoopbackRelay::new());
//!
//! let alice = CallService::builder("alice")
//!     .with_signaling(relay.clone())
//!     .with_directory(relay.clone())
//!     .with_capture_device(Arc::new(LoopbackCapture::new()))
//!     .with_peer_factory(Arc::new(LoopbackPeerFactory::new()))
//!     .build()
//!     .await?;
//!
//! let call_id = alice.place_call(CallIdentity::new("bob")).await?;
//! println!("calling bob: {call_id} ({:?})", alice.snapshot().state);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Call participant identity
pub mod identity;

/// Signaling envelopes, transport contract and retrying handler
pub mod signaling;

/// Local capture ownership
pub mod media;

/// Offer/answer negotiation
pub mod negotiation;

/// Incoming call decision point
pub mod notifier;

/// Call session state machine
pub mod call;

/// Call service handle and builder
pub mod service;

/// In-process relay, capture device and peer sessions
pub mod loopback;

/// WebRTC peer sessions (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

// Re-export main types at crate root
pub use call::{CallConfig, CallError};
pub use identity::CallIdentity;
pub use media::{CaptureDevice, CaptureTrack, MediaError, MediaGuard, MediaHandle};
pub use negotiation::{
    Connectivity, NegotiationError, PeerEvent, PeerEvents, PeerSession, PeerSessionFactory,
};
pub use notifier::{IncomingCallNotifier, InviteDisposition, PendingInvite};
#[cfg(feature = "webrtc-backend")]
pub use rtc::{RtcConfig, RtcPeerFactory};
pub use service::{CallService, CallServiceBuilder};
pub use signaling::{
    CallDirectory, CandidatePayload, DeclineReason, EnvelopeKind, SignalingEnvelope,
    SignalingError, SignalingHandler, SignalingTransport,
};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallConfig, CallError};
    pub use crate::identity::CallIdentity;
    pub use crate::media::CaptureDevice;
    pub use crate::negotiation::{PeerSession, PeerSessionFactory};
    pub use crate::service::{CallService, CallServiceBuilder};
    pub use crate::signaling::{CallDirectory, SignalingTransport};
    pub use crate::types::{
        CallEvent, CallFailure, CallId, CallSnapshot, CallState, MediaConstraints, MediaType,
    };
}
