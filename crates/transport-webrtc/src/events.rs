use bytes::Bytes;
use signal_proto::CandidateInit;
use tokio::sync::mpsc;

use crate::{IceState, PeerState, SdpKind};

/// Where a transport reports its events. Senders never block; the consumer
/// owns the receiving end and drains it on its own task.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Descriptor of an inbound media track. Frame data flows to the attached
/// [`crate::VideoSink`], not through the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTrackInfo {
    pub id: String,
    pub mime_type: String,
}

/// Everything a transport can tell its owner. Events for one transport are
/// emitted in order; the stream is the only channel back to the manager, so
/// late events after a close are simply dropped by the receiver.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalSdp { kind: SdpKind, sdp: String },
    LocalCandidate(CandidateInit),
    ConnectionState(PeerState),
    IceState(IceState),
    ChannelOpen { label: String },
    ChannelClose { label: String },
    Message { label: String, payload: Bytes },
    VideoTrack(VideoTrackInfo),
    RenegotiationNeeded,
    Error { reason: String },
}
