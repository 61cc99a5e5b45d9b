//! Per-connection state machine.
//!
//! The manager never mutates a peer's state freehand; every edge goes
//! through [`transition`], and illegal edges come back as a typed error
//! instead of silent mutation.

use thiserror::Error;
use transport_webrtc::PeerState;

/// Which side of the offer/answer exchange this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Inputs that move a connection between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateInput {
    /// First negotiation action (offer or answer work started).
    NegotiationStarted,
    /// ICE reached Connected/Completed and at least one channel is open.
    LinkReady,
    /// ICE fell back to Disconnected.
    LinkLost,
    /// Transport reported an unrecoverable failure or heartbeats timed out.
    Failed,
    /// Local or remote close.
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal transition: {from:?} on {input:?}")]
pub(crate) struct InvalidTransition {
    pub from: PeerState,
    pub input: StateInput,
}

pub(crate) fn transition(from: PeerState, input: StateInput) -> Result<PeerState, InvalidTransition> {
    use PeerState as S;
    use StateInput as I;
    let next = match (from, input) {
        (S::New, I::NegotiationStarted) => S::Connecting,
        (S::Connecting, I::NegotiationStarted) => S::Connecting,
        (S::Connecting, I::LinkReady) => S::Connected,
        (S::Disconnected, I::LinkReady) => S::Connected,
        (S::Connected, I::LinkReady) => S::Connected,
        (S::Connected, I::LinkLost) => S::Disconnected,
        (S::New | S::Connecting | S::Connected | S::Disconnected, I::Failed) => S::Failed,
        (S::New | S::Connecting | S::Connected | S::Disconnected, I::Closed) => S::Closed,
        (from, input) => return Err(InvalidTransition { from, input }),
    };
    Ok(next)
}

/// Terminal states free the PeerId for reuse.
pub(crate) fn is_terminal(state: PeerState) -> bool {
    matches!(state, PeerState::Failed | PeerState::Closed)
}
