//! Transport seam between the peer manager and the underlying real-time
//! stack.
//!
//! A [`Transport`] is one prospective peer link. All of its operations are
//! asynchronous; everything it learns is reported as [`TransportEvent`]
//! values on an mpsc stream so the consumer can process them on a single
//! owned task instead of inside library callbacks. The production
//! implementation ([`WebRtcTransport`]) wraps the `webrtc` crate; [`mock`]
//! provides an in-process pair for tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use signal_proto::{CandidateInit, PeerId};

mod error;
mod events;
pub mod mock;
mod webrtc_impl;

pub use error::TransportError;
pub use events::{EventSink, TransportEvent, VideoTrackInfo};
pub use webrtc_impl::{IceServerConfig, WebRtcConfig, WebRtcFactory, WebRtcTransport};

/// High-level connection state of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE connectivity state of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Lifecycle of a labeled data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// Delivery mode of a data channel.
///
/// Reliable-ordered channels behave like a stream: in-order, exactly-once,
/// and sends surface `Backpressured` once the bounded outbound queue fills.
/// Unreliable-unordered channels may drop and reorder; a send reports `Ok`
/// once enqueued (or dropped) and never reports per-message fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelReliability {
    ReliableOrdered,
    UnreliableUnordered,
}

impl ChannelReliability {
    /// `(ordered, max_retransmits)` SCTP parameters for this mode.
    pub fn sctp_params(&self) -> (bool, Option<u16>) {
        match self {
            ChannelReliability::ReliableOrdered => (true, None),
            ChannelReliability::UnreliableUnordered => (false, Some(0)),
        }
    }
}

/// Consumer of inbound video. Media decoding is out of scope here; sinks see
/// the raw RTP payload stream for the track they were attached for.
pub trait VideoSink: Send + Sync {
    fn on_rtp(&self, payload: Bytes, timestamp: u32);
}

/// One prospective peer-to-peer link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start generating the local offer. Completion is delivered as a
    /// [`TransportEvent::LocalSdp`].
    async fn create_offer(&self) -> Result<(), TransportError>;

    /// Start generating the local answer to a previously applied remote
    /// offer. Completion is delivered as a [`TransportEvent::LocalSdp`].
    async fn create_answer(&self) -> Result<(), TransportError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: &CandidateInit) -> Result<(), TransportError>;

    /// Open a labeled channel. Readiness is delivered as a
    /// [`TransportEvent::ChannelOpen`].
    async fn open_data_channel(
        &self,
        label: &str,
        reliability: ChannelReliability,
    ) -> Result<(), TransportError>;

    /// Enqueue a payload on a labeled channel. Callable from any thread; the
    /// implementation marshals onto its own worker.
    fn send(&self, label: &str, payload: Bytes) -> Result<(), TransportError>;

    fn channel_state(&self, label: &str) -> Option<ChannelState>;

    fn attach_video_sink(&self, sink: Arc<dyn VideoSink>);

    /// Idempotent. Eventually drives the connection state to `Closed`.
    async fn close(&self);
}

/// Creates transports for the manager, one per peer.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer: &PeerId,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
