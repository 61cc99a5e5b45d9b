use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PeerId;

/// Message kinds routed by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Join,
    Leave,
    Offer,
    Answer,
    Candidate,
    Heartbeat,
    JoinRequest,
    Error,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Join => "join",
            SignalKind::Leave => "leave",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Heartbeat => "heartbeat",
            SignalKind::JoinRequest => "join_request",
            SignalKind::Error => "error",
        }
    }
}

/// ICE candidate as carried on the wire and handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u32,
}

/// Kind-specific payload of a [`SignalEnvelope`].
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Join { target: PeerId },
    Leave { reason: String },
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(CandidateInit),
    Heartbeat { nonce: u64 },
    JoinRequest,
    Error { reason: String },
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Join { .. } => SignalKind::Join,
            SignalPayload::Leave { .. } => SignalKind::Leave,
            SignalPayload::Offer { .. } => SignalKind::Offer,
            SignalPayload::Answer { .. } => SignalKind::Answer,
            SignalPayload::Candidate(_) => SignalKind::Candidate,
            SignalPayload::Heartbeat { .. } => SignalKind::Heartbeat,
            SignalPayload::JoinRequest => SignalKind::JoinRequest,
            SignalPayload::Error { .. } => SignalKind::Error,
        }
    }
}

/// A routed signaling message. `to` empty means the message is directed at
/// the relay itself; `from` empty means the relay originated it.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub from: PeerId,
    pub to: PeerId,
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    pub fn new(from: impl Into<PeerId>, to: impl Into<PeerId>, payload: SignalPayload) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            payload,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    /// Relay-originated error reply addressed to `to`.
    pub fn relay_error(to: impl Into<PeerId>, reason: impl Into<String>) -> Self {
        Self {
            from: PeerId::new(""),
            to: to.into(),
            payload: SignalPayload::Error {
                reason: reason.into(),
            },
        }
    }

    pub fn encode(&self) -> String {
        let wire = WireEnvelope::from(self);
        serde_json::to_string(&wire).expect("envelope serialization is infallible")
    }

    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_str(raw)?;
        wire.try_into()
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The frame parsed as an envelope but carried a `type` this node does
    /// not understand. Kept distinct from `Malformed` so the relay can
    /// answer the sender instead of dropping the link.
    #[error("unknown message type {kind:?}")]
    UnknownType { kind: String, from: PeerId },
    #[error("{kind} envelope missing field {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

/// Flattened JSON representation. Unknown fields are ignored on decode;
/// absent optional fields are omitted on encode.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    from: PeerId,
    #[serde(default)]
    to: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<CandidateInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<PeerId>,
}

impl From<&SignalEnvelope> for WireEnvelope {
    fn from(env: &SignalEnvelope) -> Self {
        let mut wire = WireEnvelope {
            kind: env.kind().as_str().to_string(),
            from: env.from.clone(),
            to: env.to.clone(),
            sdp: None,
            candidate: None,
            reason: None,
            nonce: None,
            target: None,
        };
        match &env.payload {
            SignalPayload::Join { target } => wire.target = Some(target.clone()),
            SignalPayload::Leave { reason } | SignalPayload::Error { reason } => {
                wire.reason = Some(reason.clone())
            }
            SignalPayload::Offer { sdp } | SignalPayload::Answer { sdp } => {
                wire.sdp = Some(sdp.clone())
            }
            SignalPayload::Candidate(init) => wire.candidate = Some(init.clone()),
            SignalPayload::Heartbeat { nonce } => wire.nonce = Some(*nonce),
            SignalPayload::JoinRequest => {}
        }
        wire
    }
}

impl TryFrom<WireEnvelope> for SignalEnvelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, EnvelopeError> {
        let payload = match wire.kind.as_str() {
            "join" => SignalPayload::Join {
                target: wire.target.ok_or(EnvelopeError::MissingField {
                    kind: "join",
                    field: "target",
                })?,
            },
            "leave" => SignalPayload::Leave {
                reason: wire.reason.ok_or(EnvelopeError::MissingField {
                    kind: "leave",
                    field: "reason",
                })?,
            },
            "offer" => SignalPayload::Offer {
                sdp: wire.sdp.ok_or(EnvelopeError::MissingField {
                    kind: "offer",
                    field: "sdp",
                })?,
            },
            "answer" => SignalPayload::Answer {
                sdp: wire.sdp.ok_or(EnvelopeError::MissingField {
                    kind: "answer",
                    field: "sdp",
                })?,
            },
            "candidate" => {
                SignalPayload::Candidate(wire.candidate.ok_or(EnvelopeError::MissingField {
                    kind: "candidate",
                    field: "candidate",
                })?)
            }
            "heartbeat" => SignalPayload::Heartbeat {
                nonce: wire.nonce.ok_or(EnvelopeError::MissingField {
                    kind: "heartbeat",
                    field: "nonce",
                })?,
            },
            "join_request" => SignalPayload::JoinRequest,
            "error" => SignalPayload::Error {
                reason: wire.reason.ok_or(EnvelopeError::MissingField {
                    kind: "error",
                    field: "reason",
                })?,
            },
            other => {
                return Err(EnvelopeError::UnknownType {
                    kind: other.to_string(),
                    from: wire.from,
                })
            }
        };
        Ok(SignalEnvelope {
            from: wire.from,
            to: wire.to,
            payload,
        })
    }
}
