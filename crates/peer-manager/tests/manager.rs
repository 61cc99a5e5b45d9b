//! End-to-end manager tests over the mock transport network and an
//! in-process relay that mirrors the production routing rules.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use peer_manager::{
    ManagerConfig, ManagerError, PeerManager, SignalingConnector, SignalingEvent, SignalingSession,
};
use signal_proto::{PeerId, SignalEnvelope, SignalKind, SignalPayload};
use tokio::sync::mpsc;
use tokio::time::sleep;
use transport_webrtc::mock::MockNetwork;
use transport_webrtc::{PeerState, TransportFactory};

const WAIT: Duration = Duration::from_secs(5);

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within {WAIT:?}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

async fn recv_with_deadline<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

/// In-process stand-in for the relay: same routing rules, no sockets.
#[derive(Default)]
struct RelayCore {
    links: HashMap<PeerId, mpsc::UnboundedSender<SignalingEvent>>,
    partners: HashMap<PeerId, PeerId>,
    log: Vec<(PeerId, SignalKind)>,
}

struct TestRelay {
    core: Mutex<RelayCore>,
}

impl TestRelay {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(RelayCore::default()),
        })
    }

    fn connector(self: &Arc<Self>, id: &str) -> Arc<TestConnector> {
        Arc::new(TestConnector {
            relay: self.clone(),
            id: PeerId::from(id),
        })
    }

    fn log(&self) -> Vec<(PeerId, SignalKind)> {
        self.core.lock().unwrap().log.clone()
    }

    fn deliver(&self, to: &PeerId, envelope: SignalEnvelope) {
        let link = self.core.lock().unwrap().links.get(to).cloned();
        if let Some(link) = link {
            let _ = link.send(SignalingEvent::Envelope(envelope));
        }
    }

    fn route(&self, from: PeerId, envelope: SignalEnvelope) {
        if envelope.from != from {
            return;
        }
        self.core
            .lock()
            .unwrap()
            .log
            .push((from.clone(), envelope.kind()));
        match &envelope.payload {
            SignalPayload::Join { target } => {
                let registered = {
                    let mut core = self.core.lock().unwrap();
                    core.partners.insert(from.clone(), target.clone());
                    core.links.contains_key(target)
                };
                if registered {
                    self.deliver(
                        target,
                        SignalEnvelope::new(from, target.clone(), SignalPayload::JoinRequest),
                    );
                } else {
                    self.core.lock().unwrap().partners.remove(&from);
                    self.deliver(&from, SignalEnvelope::relay_error(from.clone(), "Target not found"));
                }
            }
            SignalPayload::Leave { reason } => {
                let partner = self.core.lock().unwrap().partners.remove(&from);
                if let Some(partner) = partner {
                    self.deliver(
                        &partner,
                        SignalEnvelope::new(
                            from,
                            partner.clone(),
                            SignalPayload::Leave {
                                reason: reason.clone(),
                            },
                        ),
                    );
                }
            }
            SignalPayload::Offer { .. }
            | SignalPayload::Answer { .. }
            | SignalPayload::Candidate(_)
            | SignalPayload::Heartbeat { .. } => {
                let exists = self
                    .core
                    .lock()
                    .unwrap()
                    .links
                    .contains_key(&envelope.to);
                if exists {
                    let to = envelope.to.clone();
                    self.deliver(&to, envelope);
                } else {
                    self.deliver(
                        &from,
                        SignalEnvelope::relay_error(from.clone(), "Recipient not found"),
                    );
                }
            }
            _ => {
                self.deliver(
                    &from,
                    SignalEnvelope::relay_error(from.clone(), "Unknown message type"),
                );
            }
        }
    }
}

struct TestConnector {
    relay: Arc<TestRelay>,
    id: PeerId,
}

#[async_trait]
impl SignalingConnector for TestConnector {
    async fn connect(&self) -> Result<SignalingSession, ManagerError> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.relay
            .core
            .lock()
            .unwrap()
            .links
            .insert(self.id.clone(), event_tx);
        let relay = self.relay.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                relay.route(id.clone(), envelope);
            }
        });
        Ok(SignalingSession {
            outbound: outbound_tx,
            events: event_rx,
        })
    }
}

/// Test connector whose session halves are held by the test itself.
struct ManualConnector {
    session: Mutex<Option<SignalingSession>>,
}

#[async_trait]
impl SignalingConnector for ManualConnector {
    async fn connect(&self) -> Result<SignalingSession, ManagerError> {
        Ok(self
            .session
            .lock()
            .unwrap()
            .take()
            .expect("manual connector connects once"))
    }
}

struct Node {
    manager: PeerManager,
    connected: mpsc::UnboundedReceiver<PeerId>,
    disconnected: mpsc::UnboundedReceiver<(PeerId, String)>,
    messages: mpsc::UnboundedReceiver<(PeerId, String, Bytes)>,
    signaling_errors: mpsc::UnboundedReceiver<String>,
    heartbeat_lost: mpsc::UnboundedReceiver<PeerId>,
}

fn build_node(
    id: &str,
    relay: &Arc<TestRelay>,
    network: &Arc<MockNetwork>,
    heartbeat_ms: u64,
    reconnect_max_attempts: u32,
) -> Node {
    let mut config = ManagerConfig::new(id, "ws://test.invalid/ws");
    config.heartbeat_ms = heartbeat_ms;
    config.reconnect_max_attempts = reconnect_max_attempts;
    let factory: Arc<dyn TransportFactory> = Arc::new(network.factory(id));
    let manager = PeerManager::new(config, factory, relay.connector(id));

    let (connected_tx, connected) = mpsc::unbounded_channel();
    let (disconnected_tx, disconnected) = mpsc::unbounded_channel();
    let (messages_tx, messages) = mpsc::unbounded_channel();
    let (errors_tx, signaling_errors) = mpsc::unbounded_channel();
    let (lost_tx, heartbeat_lost) = mpsc::unbounded_channel();

    manager.on_peer_connected(move |peer| {
        let _ = connected_tx.send(peer);
    });
    manager.on_peer_disconnected(move |peer, reason| {
        let _ = disconnected_tx.send((peer, reason));
    });
    manager.on_channel_message(move |peer, label, payload| {
        let _ = messages_tx.send((peer, label, payload));
    });
    manager.on_signaling_error(move |reason| {
        let _ = errors_tx.send(reason);
    });
    manager.on_heartbeat_lost(move |peer| {
        let _ = lost_tx.send(peer);
    });

    Node {
        manager,
        connected,
        disconnected,
        messages,
        signaling_errors,
        heartbeat_lost,
    }
}

#[tokio::test]
async fn happy_path_connects_and_exchanges_data() {
    let relay = TestRelay::new();
    let network = MockNetwork::new();
    let mut vehicle = build_node("vehicle-1", &relay, &network, 0, 5);
    let mut cockpit = build_node("cockpit-1", &relay, &network, 0, 5);

    vehicle.manager.start().await.unwrap();
    cockpit.manager.start().await.unwrap();

    cockpit.manager.connect_peer("vehicle-1").await.unwrap();

    assert_eq!(
        recv_with_deadline(&mut cockpit.connected).await,
        PeerId::from("vehicle-1")
    );
    assert_eq!(
        recv_with_deadline(&mut vehicle.connected).await,
        PeerId::from("cockpit-1")
    );
    assert_eq!(
        cockpit.manager.peer_state("vehicle-1"),
        Some(PeerState::Connected)
    );

    cockpit
        .manager
        .send("vehicle-1", "control", Bytes::from_static(b"steer left"))
        .unwrap();
    let (from, label, payload) = recv_with_deadline(&mut vehicle.messages).await;
    assert_eq!(from, PeerId::from("cockpit-1"));
    assert_eq!(label, "control");
    assert_eq!(payload.as_ref(), b"steer left");

    let delivered = vehicle
        .manager
        .broadcast("telemetry", Bytes::from_static(b"{\"speed_mps\":3.0}"))
        .unwrap();
    assert_eq!(delivered, 1);
    let (_, label, _) = recv_with_deadline(&mut cockpit.messages).await;
    assert_eq!(label, "telemetry");
}

#[tokio::test]
async fn glare_resolves_to_lexicographically_smaller_offerer() {
    let relay = TestRelay::new();
    let network = MockNetwork::new();
    let mut alpha = build_node("alpha", &relay, &network, 0, 5);
    let mut zulu = build_node("zulu", &relay, &network, 0, 5);

    alpha.manager.start().await.unwrap();
    zulu.manager.start().await.unwrap();

    // Both dial each other inside one negotiation round trip.
    let (a, z) = tokio::join!(
        alpha.manager.connect_peer("zulu"),
        zulu.manager.connect_peer("alpha")
    );
    a.unwrap();
    z.unwrap();

    assert_eq!(
        recv_with_deadline(&mut alpha.connected).await,
        PeerId::from("zulu")
    );
    assert_eq!(
        recv_with_deadline(&mut zulu.connected).await,
        PeerId::from("alpha")
    );

    // Exactly one offer survives, and every answer comes from the larger id.
    let log = relay.log();
    let answers: Vec<&PeerId> = log
        .iter()
        .filter(|(_, kind)| *kind == SignalKind::Answer)
        .map(|(from, _)| from)
        .collect();
    assert!(!answers.is_empty());
    assert!(answers.iter().all(|from| **from == PeerId::from("zulu")));
}

#[tokio::test]
async fn candidate_before_offer_is_buffered_then_applied_in_order() {
    let network = MockNetwork::new();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let connector = Arc::new(ManualConnector {
        session: Mutex::new(Some(SignalingSession {
            outbound: outbound_tx,
            events: event_rx,
        })),
    });

    let config = ManagerConfig::new("vehicle-1", "ws://test.invalid/ws");
    let factory: Arc<dyn TransportFactory> = Arc::new(network.factory("vehicle-1"));
    let manager = PeerManager::new(config, factory, connector);
    manager.start().await.unwrap();

    let early = signal_proto::CandidateInit {
        candidate: "candidate:1 1 udp 2130706431 10.0.0.9 4000 typ host".into(),
        sdp_mid: "0".into(),
        sdp_mline_index: 0,
    };
    event_tx
        .send(SignalingEvent::Envelope(SignalEnvelope::new(
            "cockpit-1",
            "vehicle-1",
            SignalPayload::Candidate(early.clone()),
        )))
        .unwrap();
    event_tx
        .send(SignalingEvent::Envelope(SignalEnvelope::new(
            "cockpit-1",
            "vehicle-1",
            SignalPayload::Offer {
                sdp: "v=0 mock sdp offer cockpit-1".into(),
            },
        )))
        .unwrap();

    // The manager must answer the offer...
    let answer = loop {
        let envelope = recv_with_deadline(&mut outbound_rx).await;
        if envelope.kind() == SignalKind::Answer {
            break envelope;
        }
    };
    assert_eq!(answer.to, PeerId::from("cockpit-1"));

    // ...and the buffered candidate must have reached the transport no
    // later than any post-description candidate.
    let late = signal_proto::CandidateInit {
        candidate: "candidate:2 1 udp 2130706431 10.0.0.9 4001 typ host".into(),
        sdp_mid: "0".into(),
        sdp_mline_index: 0,
    };
    event_tx
        .send(SignalingEvent::Envelope(SignalEnvelope::new(
            "cockpit-1",
            "vehicle-1",
            SignalPayload::Candidate(late.clone()),
        )))
        .unwrap();

    let transport = network
        .get(&PeerId::from("vehicle-1"), &PeerId::from("cockpit-1"))
        .expect("reactive transport registered");
    wait_until(|| transport.remote_candidates().len() == 2).await;
    assert_eq!(transport.remote_candidates(), vec![early, late]);
}

#[tokio::test]
async fn misrouted_envelopes_are_discarded() {
    let network = MockNetwork::new();
    let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let connector = Arc::new(ManualConnector {
        session: Mutex::new(Some(SignalingSession {
            outbound: outbound_tx,
            events: event_rx,
        })),
    });
    let config = ManagerConfig::new("vehicle-1", "ws://test.invalid/ws");
    let factory: Arc<dyn TransportFactory> = Arc::new(network.factory("vehicle-1"));
    let manager = PeerManager::new(config, factory, connector);
    manager.start().await.unwrap();

    event_tx
        .send(SignalingEvent::Envelope(SignalEnvelope::new(
            "cockpit-1",
            "somebody-else",
            SignalPayload::Offer {
                sdp: "v=0 mock sdp offer cockpit-1".into(),
            },
        )))
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.peer_state("cockpit-1"), None);
}

#[tokio::test]
async fn unknown_target_surfaces_error_and_leaves_no_connection() {
    let relay = TestRelay::new();
    let network = MockNetwork::new();
    let mut cockpit = build_node("cockpit-1", &relay, &network, 0, 5);
    cockpit.manager.start().await.unwrap();

    cockpit.manager.connect_peer("ghost").await.unwrap();

    let reason = recv_with_deadline(&mut cockpit.signaling_errors).await;
    assert_eq!(reason, "Target not found");
    wait_until(|| cockpit.manager.peer_state("ghost").is_none()).await;
}

#[tokio::test]
async fn heartbeat_loss_invokes_hook_and_fails_peer() {
    let relay = TestRelay::new();
    let network = MockNetwork::new();
    // The vehicle never emits heartbeats; the cockpit expects them.
    let mut vehicle = build_node("vehicle-1", &relay, &network, 0, 5);
    let mut cockpit = build_node("cockpit-1", &relay, &network, 50, 0);

    vehicle.manager.start().await.unwrap();
    cockpit.manager.start().await.unwrap();
    cockpit.manager.connect_peer("vehicle-1").await.unwrap();
    recv_with_deadline(&mut cockpit.connected).await;

    assert_eq!(
        recv_with_deadline(&mut cockpit.heartbeat_lost).await,
        PeerId::from("vehicle-1")
    );
    let (peer, reason) = recv_with_deadline(&mut cockpit.disconnected).await;
    assert_eq!(peer, PeerId::from("vehicle-1"));
    assert_eq!(reason, "Heartbeat lost");
    assert_eq!(cockpit.manager.peer_state("vehicle-1"), None);
}

#[tokio::test]
async fn relay_fallback_heartbeats_keep_the_peer_alive() {
    let relay = TestRelay::new();
    let network = MockNetwork::new();
    let mut vehicle = build_node("vehicle-1", &relay, &network, 0, 5);
    let mut cockpit = build_node("cockpit-1", &relay, &network, 50, 0);

    vehicle.manager.start().await.unwrap();
    cockpit.manager.start().await.unwrap();
    cockpit.manager.connect_peer("vehicle-1").await.unwrap();
    recv_with_deadline(&mut cockpit.connected).await;

    // Feed the cockpit relay-path heartbeats on behalf of the vehicle.
    for nonce in 1..=10u64 {
        relay.deliver(
            &PeerId::from("cockpit-1"),
            SignalEnvelope::new(
                "vehicle-1",
                "cockpit-1",
                SignalPayload::Heartbeat { nonce },
            ),
        );
        sleep(Duration::from_millis(40)).await;
    }
    assert_eq!(
        cockpit.manager.peer_state("vehicle-1"),
        Some(PeerState::Connected)
    );

    // Silence follows; the loss threshold takes over.
    assert_eq!(
        recv_with_deadline(&mut cockpit.heartbeat_lost).await,
        PeerId::from("vehicle-1")
    );
}

#[tokio::test]
async fn double_disconnect_yields_one_terminal_notification() {
    let relay = TestRelay::new();
    let network = MockNetwork::new();
    let mut vehicle = build_node("vehicle-1", &relay, &network, 0, 5);
    let mut cockpit = build_node("cockpit-1", &relay, &network, 0, 5);

    vehicle.manager.start().await.unwrap();
    cockpit.manager.start().await.unwrap();
    cockpit.manager.connect_peer("vehicle-1").await.unwrap();
    recv_with_deadline(&mut cockpit.connected).await;

    cockpit
        .manager
        .disconnect_peer("vehicle-1", "operator request")
        .await
        .unwrap();
    cockpit
        .manager
        .disconnect_peer("vehicle-1", "operator request")
        .await
        .unwrap();

    let (peer, reason) = recv_with_deadline(&mut cockpit.disconnected).await;
    assert_eq!(peer, PeerId::from("vehicle-1"));
    assert_eq!(reason, "operator request");
    sleep(Duration::from_millis(100)).await;
    assert!(cockpit.disconnected.try_recv().is_err());
}

#[tokio::test]
async fn connect_peer_is_idempotent_and_index_holds_one_entry() {
    let relay = TestRelay::new();
    let network = MockNetwork::new();
    let mut vehicle = build_node("vehicle-1", &relay, &network, 0, 5);
    let mut cockpit = build_node("cockpit-1", &relay, &network, 0, 5);

    vehicle.manager.start().await.unwrap();
    cockpit.manager.start().await.unwrap();

    cockpit.manager.connect_peer("vehicle-1").await.unwrap();
    cockpit.manager.connect_peer("vehicle-1").await.unwrap();
    cockpit.manager.connect_peer("vehicle-1").await.unwrap();

    recv_with_deadline(&mut cockpit.connected).await;
    assert!(cockpit.connected.try_recv().is_err());
    assert_eq!(cockpit.manager.connected_peers().len(), 1);
}

#[tokio::test]
async fn stop_closes_peers_and_rejects_further_operations() {
    let relay = TestRelay::new();
    let network = MockNetwork::new();
    let mut vehicle = build_node("vehicle-1", &relay, &network, 0, 5);
    let mut cockpit = build_node("cockpit-1", &relay, &network, 0, 5);

    vehicle.manager.start().await.unwrap();
    cockpit.manager.start().await.unwrap();
    cockpit.manager.connect_peer("vehicle-1").await.unwrap();
    recv_with_deadline(&mut vehicle.connected).await;

    vehicle.manager.stop().await;

    let (_, reason) = recv_with_deadline(&mut vehicle.disconnected).await;
    assert_eq!(reason, "local shutdown");
    assert!(matches!(
        vehicle
            .manager
            .send("cockpit-1", "telemetry", Bytes::from_static(b"x")),
        Err(ManagerError::NotRunning)
    ));
    assert!(matches!(
        vehicle.manager.connect_peer("cockpit-1").await,
        Err(ManagerError::NotRunning)
    ));
}

#[tokio::test]
async fn broadcast_only_reaches_open_channels() {
    let relay = TestRelay::new();
    let network = MockNetwork::new();
    let mut vehicle = build_node("vehicle-1", &relay, &network, 0, 5);
    let mut cockpit = build_node("cockpit-1", &relay, &network, 0, 5);

    vehicle.manager.start().await.unwrap();
    cockpit.manager.start().await.unwrap();
    cockpit.manager.connect_peer("vehicle-1").await.unwrap();
    recv_with_deadline(&mut cockpit.connected).await;

    assert_eq!(
        cockpit
            .manager
            .broadcast("control", Bytes::from_static(b"cmd"))
            .unwrap(),
        1
    );
    assert_eq!(
        cockpit
            .manager
            .broadcast("no-such-label", Bytes::from_static(b"cmd"))
            .unwrap(),
        0
    );
    sleep(Duration::from_millis(100)).await;
    let mut labels = Vec::new();
    while let Ok((_, label, _)) = vehicle.messages.try_recv() {
        labels.push(label);
    }
    assert_eq!(labels, vec!["control".to_string()]);
}

#[tokio::test]
async fn peer_leave_closes_with_reason() {
    let relay = TestRelay::new();
    let network = MockNetwork::new();
    let mut vehicle = build_node("vehicle-1", &relay, &network, 0, 5);
    let mut cockpit = build_node("cockpit-1", &relay, &network, 0, 5);

    vehicle.manager.start().await.unwrap();
    cockpit.manager.start().await.unwrap();
    cockpit.manager.connect_peer("vehicle-1").await.unwrap();
    recv_with_deadline(&mut vehicle.connected).await;

    cockpit
        .manager
        .disconnect_peer("vehicle-1", "shift over")
        .await
        .unwrap();

    let (peer, reason) = recv_with_deadline(&mut vehicle.disconnected).await;
    assert_eq!(peer, PeerId::from("cockpit-1"));
    assert_eq!(reason, "shift over");
}
