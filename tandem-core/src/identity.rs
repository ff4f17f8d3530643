//! Call participant identity
//!
//! A [`CallIdentity`] is the stable account-level identifier of a party. The
//! core never interprets it beyond equality and ordering: ordering is what
//! resolves simultaneous-call races without a central arbiter.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Stable identifier for a call participant
///
/// Comparison is lexicographic on the underlying string, which gives both
/// clients the same answer to "who yields" during call glare.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallIdentity(String);

impl CallIdentity {
    /// Create a new identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this party must yield to `other` when both place a call to
    /// each other at the same time.
    ///
    /// The smaller identity yields and becomes the callee.
    #[must_use]
    pub fn yields_to(&self, other: &CallIdentity) -> bool {
        self < other
    }
}

impl Display for CallIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_identity_display() {
        let id = CallIdentity::new("alice");
        assert_eq!(id.to_string(), "alice");
        assert_eq!(id.as_str(), "alice");
    }

    #[test]
    fn test_tie_break_is_antisymmetric() {
        let alice = CallIdentity::from("alice");
        let bob = CallIdentity::from("bob");
        assert!(alice.yields_to(&bob));
        assert!(!bob.yields_to(&alice));
        assert!(!alice.yields_to(&alice.clone()));
    }

    #[test]
    fn test_call_identity_serializes_as_plain_string() {
        let id = CallIdentity::new("alice-bob");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"alice-bob\"");
        let back: CallIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
