//! In-process transport pair for tests.
//!
//! Two mock transports linked through a [`MockNetwork`] run the whole
//! negotiation dance without sockets: offers and answers are synthetic SDP
//! strings, and once both sides hold a local and a remote description the
//! pair "establishes" — ICE walks to `Connected`, locally opened channels
//! open on both ends, and sends deliver straight into the peer's event
//! stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use signal_proto::{CandidateInit, PeerId};

use crate::{
    ChannelReliability, ChannelState, EventSink, IceState, PeerState, SdpKind, Transport,
    TransportError, TransportEvent, TransportFactory, VideoSink,
};

/// Links mock transports by `(local, remote)` endpoint identity.
#[derive(Default)]
pub struct MockNetwork {
    endpoints: Mutex<HashMap<(PeerId, PeerId), Arc<MockTransport>>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>, local: impl Into<PeerId>) -> MockFactory {
        MockFactory {
            network: self.clone(),
            local: local.into(),
        }
    }

    fn register(self: &Arc<Self>, transport: Arc<MockTransport>) {
        self.endpoints.lock().unwrap().insert(
            (transport.local.clone(), transport.remote.clone()),
            transport,
        );
    }

    /// Test access to a registered endpoint.
    pub fn get(&self, local: &PeerId, remote: &PeerId) -> Option<Arc<MockTransport>> {
        self.endpoints
            .lock()
            .unwrap()
            .get(&(local.clone(), remote.clone()))
            .cloned()
    }

    fn counterpart(&self, transport: &MockTransport) -> Option<Arc<MockTransport>> {
        self.endpoints
            .lock()
            .unwrap()
            .get(&(transport.remote.clone(), transport.local.clone()))
            .cloned()
    }

    /// Remove a transport, but only if it is still the registered endpoint.
    /// A replaced transport (glare) must not evict its successor.
    fn deregister(&self, transport: &MockTransport) {
        let key = (transport.local.clone(), transport.remote.clone());
        let mut endpoints = self.endpoints.lock().unwrap();
        if let Some(existing) = endpoints.get(&key) {
            if std::ptr::eq(existing.as_ref(), transport) {
                endpoints.remove(&key);
            }
        }
    }
}

pub struct MockFactory {
    network: Arc<MockNetwork>,
    local: PeerId,
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        peer: &PeerId,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = MockTransport::new(self.local.clone(), peer.clone(), events, &self.network);
        Ok(transport as Arc<dyn Transport>)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MockChannel {
    state: ChannelState,
    locally_opened: bool,
}

#[derive(Default)]
struct MockState {
    have_local: bool,
    have_remote: bool,
    established: bool,
    closed: bool,
    channels: HashMap<String, MockChannel>,
    remote_candidates: Vec<CandidateInit>,
    sent_frames: usize,
}

pub struct MockTransport {
    local: PeerId,
    remote: PeerId,
    events: EventSink,
    network: Weak<MockNetwork>,
    state: Mutex<MockState>,
    /// Reliable sends past this count report `Backpressured`; test hook.
    backpressure_after: Mutex<Option<usize>>,
}

impl MockTransport {
    pub fn new(
        local: PeerId,
        remote: PeerId,
        events: EventSink,
        network: &Arc<MockNetwork>,
    ) -> Arc<Self> {
        let transport = Arc::new(Self {
            local,
            remote,
            events,
            network: Arc::downgrade(network),
            state: Mutex::new(MockState::default()),
            backpressure_after: Mutex::new(None),
        });
        network.register(transport.clone());
        transport
    }

    /// A standalone linked pair, bypassing factories. The returned network
    /// handle must stay alive for the pair to remain linked.
    pub fn pair(
        events_a: EventSink,
        events_b: EventSink,
    ) -> (Arc<Self>, Arc<Self>, Arc<MockNetwork>) {
        let network = MockNetwork::new();
        let a = Self::new(PeerId::from("a"), PeerId::from("b"), events_a, &network);
        let b = Self::new(PeerId::from("b"), PeerId::from("a"), events_b, &network);
        (a, b, network)
    }

    pub fn set_backpressure_after(&self, frames: usize) {
        *self.backpressure_after.lock().unwrap() = Some(frames);
    }

    pub fn remote_candidates(&self) -> Vec<CandidateInit> {
        self.state.lock().unwrap().remote_candidates.clone()
    }

    fn sdp_for(&self, kind: SdpKind) -> String {
        format!("v=0 mock sdp {} {}", kind.as_str(), self.local)
    }

    fn counterpart(&self) -> Option<Arc<MockTransport>> {
        self.network.upgrade()?.counterpart(self)
    }

    fn descriptions_ready(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.have_local && state.have_remote && !state.closed
    }

    /// Once both halves hold both descriptions, walk the pair to Connected
    /// and open every locally initiated channel on both ends.
    fn try_establish(&self) {
        let Some(peer) = self.counterpart() else {
            return;
        };
        if !self.descriptions_ready() || !peer.descriptions_ready() {
            return;
        }
        for endpoint in [self, peer.as_ref()] {
            {
                let mut state = endpoint.state.lock().unwrap();
                if state.established {
                    continue;
                }
                state.established = true;
            }
            let _ = endpoint.events.send(TransportEvent::IceState(IceState::Checking));
            let _ = endpoint
                .events
                .send(TransportEvent::IceState(IceState::Connected));
            let _ = endpoint
                .events
                .send(TransportEvent::ConnectionState(PeerState::Connected));
        }
        // Channel opens propagate from whichever side created them.
        for (opener, acceptor) in [(self, peer.as_ref()), (peer.as_ref(), self)] {
            let labels: Vec<String> = {
                let state = opener.state.lock().unwrap();
                state
                    .channels
                    .iter()
                    .filter(|(_, c)| c.locally_opened && c.state == ChannelState::Opening)
                    .map(|(label, _)| label.clone())
                    .collect()
            };
            for label in labels {
                opener.open_end(&label, true);
                acceptor.open_end(&label, false);
            }
        }
    }

    fn open_end(&self, label: &str, locally_opened: bool) {
        {
            let mut state = self.state.lock().unwrap();
            let entry = state
                .channels
                .entry(label.to_string())
                .or_insert(MockChannel {
                    state: ChannelState::Opening,
                    locally_opened,
                });
            entry.state = ChannelState::Open;
        }
        let _ = self.events.send(TransportEvent::ChannelOpen {
            label: label.to_string(),
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn create_offer(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.have_local = true;
        }
        let _ = self.events.send(TransportEvent::LocalSdp {
            kind: SdpKind::Offer,
            sdp: self.sdp_for(SdpKind::Offer),
        });
        let _ = self
            .events
            .send(TransportEvent::LocalCandidate(CandidateInit {
                candidate: format!("candidate:mock 1 udp 2130706431 10.0.0.1 40000 typ host {}", self.local),
                sdp_mid: "0".into(),
                sdp_mline_index: 0,
            }));
        Ok(())
    }

    async fn create_answer(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if !state.have_remote {
                return Err(TransportError::Negotiation(
                    "create_answer before remote offer".into(),
                ));
            }
            state.have_local = true;
        }
        let _ = self.events.send(TransportEvent::LocalSdp {
            kind: SdpKind::Answer,
            sdp: self.sdp_for(SdpKind::Answer),
        });
        let _ = self
            .events
            .send(TransportEvent::LocalCandidate(CandidateInit {
                candidate: format!("candidate:mock 1 udp 2130706431 10.0.0.2 40001 typ host {}", self.local),
                sdp_mid: "0".into(),
                sdp_mline_index: 0,
            }));
        self.try_establish();
        Ok(())
    }

    async fn set_remote_description(&self, _kind: SdpKind, sdp: &str) -> Result<(), TransportError> {
        if !sdp.contains("mock sdp") {
            return Err(TransportError::BadSdp(format!(
                "unparseable description: {sdp:.32}"
            )));
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.have_remote = true;
        }
        self.try_establish();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &CandidateInit) -> Result<(), TransportError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::BadCandidate(candidate.candidate.clone()));
        }
        self.state
            .lock()
            .unwrap()
            .remote_candidates
            .push(candidate.clone());
        Ok(())
    }

    async fn open_data_channel(
        &self,
        label: &str,
        _reliability: ChannelReliability,
    ) -> Result<(), TransportError> {
        let established = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.channels.insert(
                label.to_string(),
                MockChannel {
                    state: ChannelState::Opening,
                    locally_opened: true,
                },
            );
            state.established
        };
        if established {
            if let Some(peer) = self.counterpart() {
                self.open_end(label, true);
                peer.open_end(label, false);
            }
        }
        Ok(())
    }

    fn send(&self, label: &str, payload: Bytes) -> Result<(), TransportError> {
        let frames = {
            let mut state = self.state.lock().unwrap();
            match state.channels.get(label) {
                Some(channel) if channel.state == ChannelState::Open => {}
                _ => return Err(TransportError::ChannelNotOpen(label.to_string())),
            }
            state.sent_frames += 1;
            state.sent_frames
        };
        if let Some(limit) = *self.backpressure_after.lock().unwrap() {
            if frames > limit {
                return Err(TransportError::Backpressured(label.to_string()));
            }
        }
        if let Some(peer) = self.counterpart() {
            let _ = peer.events.send(TransportEvent::Message {
                label: label.to_string(),
                payload,
            });
        }
        Ok(())
    }

    fn channel_state(&self, label: &str) -> Option<ChannelState> {
        self.state
            .lock()
            .unwrap()
            .channels
            .get(label)
            .map(|c| c.state)
    }

    fn attach_video_sink(&self, _sink: Arc<dyn VideoSink>) {}

    async fn close(&self) {
        let labels = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            let labels: Vec<String> = state.channels.keys().cloned().collect();
            for channel in state.channels.values_mut() {
                channel.state = ChannelState::Closed;
            }
            labels
        };
        for label in labels {
            let _ = self.events.send(TransportEvent::ChannelClose { label });
        }
        let _ = self
            .events
            .send(TransportEvent::ConnectionState(PeerState::Closed));
        // Only a mutually linked counterpart observes the closure; a
        // transport that was already replaced on the far side must not
        // disturb the replacement's link.
        if let Some(peer) = self.counterpart() {
            let mutual = peer
                .counterpart()
                .map(|back| std::ptr::eq(back.as_ref(), self))
                .unwrap_or(false);
            if mutual && !peer.state.lock().unwrap().closed {
                let _ = peer
                    .events
                    .send(TransportEvent::IceState(IceState::Disconnected));
                let _ = peer
                    .events
                    .send(TransportEvent::ConnectionState(PeerState::Disconnected));
            }
        }
        if let Some(network) = self.network.upgrade() {
            network.deregister(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn establish() -> (
        Arc<MockTransport>,
        Arc<MockTransport>,
        Arc<MockNetwork>,
        mpsc::UnboundedReceiver<TransportEvent>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let (a, b, network) = MockTransport::pair(tx_a, tx_b);
        a.open_data_channel("control", ChannelReliability::ReliableOrdered)
            .await
            .unwrap();
        a.create_offer().await.unwrap();
        b.set_remote_description(SdpKind::Offer, "v=0 mock sdp offer a")
            .await
            .unwrap();
        b.create_answer().await.unwrap();
        a.set_remote_description(SdpKind::Answer, "v=0 mock sdp answer b")
            .await
            .unwrap();
        (a, b, network, rx_a, rx_b)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn pair_establishes_and_opens_channels_on_both_ends() {
        let (a, b, _network, mut rx_a, mut rx_b) = establish().await;
        assert_eq!(a.channel_state("control"), Some(ChannelState::Open));
        assert_eq!(b.channel_state("control"), Some(ChannelState::Open));

        let events_a = drain(&mut rx_a);
        assert!(events_a.iter().any(|e| matches!(
            e,
            TransportEvent::ConnectionState(PeerState::Connected)
        )));
        assert!(events_a
            .iter()
            .any(|e| matches!(e, TransportEvent::ChannelOpen { label } if label == "control")));
        assert!(drain(&mut rx_b)
            .iter()
            .any(|e| matches!(e, TransportEvent::ChannelOpen { label } if label == "control")));
    }

    #[tokio::test]
    async fn send_delivers_to_peer_events() {
        let (a, _b, _network, _rx_a, mut rx_b) = establish().await;
        drain(&mut rx_b);
        a.send("control", Bytes::from_static(b"steer")).unwrap();
        let events = drain(&mut rx_b);
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::Message { label, payload }
                if label == "control" && payload.as_ref() == b"steer"
        )));
    }

    #[tokio::test]
    async fn send_on_unopened_channel_fails() {
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let (a, _b, _network) = MockTransport::pair(tx_a, tx_b);
        assert!(matches!(
            a.send("control", Bytes::new()),
            Err(TransportError::ChannelNotOpen(_))
        ));
    }

    #[tokio::test]
    async fn backpressure_hook_reports_after_limit() {
        let (a, _b, _network, _rx_a, _rx_b) = establish().await;
        a.set_backpressure_after(2);
        assert!(a.send("control", Bytes::from_static(b"1")).is_ok());
        assert!(a.send("control", Bytes::from_static(b"2")).is_ok());
        assert!(matches!(
            a.send("control", Bytes::from_static(b"3")),
            Err(TransportError::Backpressured(_))
        ));
    }

    #[tokio::test]
    async fn bad_sdp_and_candidate_are_rejected() {
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let (a, _b, _network) = MockTransport::pair(tx_a, tx_b);
        assert!(matches!(
            a.set_remote_description(SdpKind::Offer, "garbage").await,
            Err(TransportError::BadSdp(_))
        ));
        assert!(matches!(
            a.add_remote_candidate(&CandidateInit {
                candidate: "not-a-candidate".into(),
                sdp_mid: "0".into(),
                sdp_mline_index: 0,
            })
            .await,
            Err(TransportError::BadCandidate(_))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_notifies_peer() {
        let (a, b, _network, mut rx_a, mut rx_b) = establish().await;
        drain(&mut rx_a);
        drain(&mut rx_b);
        a.close().await;
        a.close().await;
        let events_a = drain(&mut rx_a);
        assert_eq!(
            events_a
                .iter()
                .filter(|e| matches!(e, TransportEvent::ConnectionState(PeerState::Closed)))
                .count(),
            1
        );
        assert!(drain(&mut rx_b).iter().any(|e| matches!(
            e,
            TransportEvent::ConnectionState(PeerState::Disconnected)
        )));
        assert_eq!(b.channel_state("control"), Some(ChannelState::Open));
    }
}
