use signal_proto::PeerId;
use thiserror::Error;
use transport_webrtc::TransportError;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("manager is not running")]
    NotRunning,
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("channel {0} is not open")]
    ChannelNotOpen(String),
    #[error("channel {0} backpressured")]
    Backpressured(String),
    #[error("signaling failure: {0}")]
    Signaling(String),
    #[error(transparent)]
    Transport(TransportError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<TransportError> for ManagerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ChannelNotOpen(label) => ManagerError::ChannelNotOpen(label),
            TransportError::Backpressured(label) => ManagerError::Backpressured(label),
            other => ManagerError::Transport(other),
        }
    }
}
