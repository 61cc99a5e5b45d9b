//! Wire types for the convoy signaling plane.
//!
//! Everything that crosses the relay link is a [`SignalEnvelope`] encoded as
//! a single JSON object per frame. Decoding is tolerant of unknown fields but
//! strict about the fields each message type requires, so malformed envelopes
//! are rejected before they reach any router.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

mod envelope;
pub mod heartbeat;

pub use envelope::{CandidateInit, EnvelopeError, SignalEnvelope, SignalKind, SignalPayload};

/// Unique printable identifier for a peer within a deployment.
///
/// Assigned by the authentication layer and immutable for a session. The
/// ordering impl is what decides offerer/answerer when both sides dial each
/// other at once, so it must stay plain lexicographic byte order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// An empty id addresses the relay itself rather than a peer.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        PeerId::new("")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_orders_lexicographically() {
        let cockpit = PeerId::from("cockpit-1");
        let vehicle = PeerId::from("vehicle-1");
        assert!(cockpit < vehicle);
        assert!(PeerId::from("A") < PeerId::from("a"));
    }

    #[test]
    fn empty_peer_id_addresses_the_relay() {
        assert!(PeerId::from("").is_empty());
        assert!(!PeerId::from("v").is_empty());
    }
}
