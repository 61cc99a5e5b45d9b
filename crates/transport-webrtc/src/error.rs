use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid session description: {0}")]
    BadSdp(String),
    #[error("invalid ice candidate: {0}")]
    BadCandidate(String),
    #[error("channel {0} is not open")]
    ChannelNotOpen(String),
    #[error("channel {0} backpressured")]
    Backpressured(String),
    #[error("negotiation failure: {0}")]
    Negotiation(String),
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport closed")]
    Closed,
}
