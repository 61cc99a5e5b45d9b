use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use signal_proto::{heartbeat, CandidateInit, PeerId, SignalEnvelope, SignalPayload};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use transport_webrtc::{
    ChannelReliability, ChannelState, IceState, PeerState, SdpKind, Transport, TransportEvent,
    TransportFactory, VideoSink, VideoTrackInfo,
};

use crate::liveness;
use crate::signaling::{SignalingConnector, SignalingEvent, SignalingSession};
use crate::state::{self, NegotiationRole, StateInput};
use crate::{ManagerConfig, ManagerError};

type PeerHandler = Arc<dyn Fn(PeerId) + Send + Sync>;
type PeerReasonHandler = Arc<dyn Fn(PeerId, String) + Send + Sync>;
type ReasonHandler = Arc<dyn Fn(String) + Send + Sync>;
type PlainHandler = Arc<dyn Fn() + Send + Sync>;
type MessageHandler = Arc<dyn Fn(PeerId, String, Bytes) + Send + Sync>;
type VideoHandler = Arc<dyn Fn(PeerId, VideoTrackInfo) + Send + Sync>;

#[derive(Default, Clone)]
struct Handlers {
    signaling_connected: Option<PlainHandler>,
    signaling_disconnected: Option<ReasonHandler>,
    signaling_error: Option<ReasonHandler>,
    peer_connected: Option<PeerHandler>,
    peer_disconnected: Option<PeerReasonHandler>,
    peer_error: Option<PeerReasonHandler>,
    channel_message: Option<MessageHandler>,
    video_track: Option<VideoHandler>,
    heartbeat_lost: Option<PeerHandler>,
}

struct PeerEntry {
    transport: Arc<dyn Transport>,
    generation: u64,
    role: NegotiationRole,
    state: PeerState,
    ice: IceState,
    channels: HashMap<String, ChannelState>,
    pending_candidates: Vec<CandidateInit>,
    remote_description_set: bool,
    local_offer_pending: bool,
    last_heartbeat_rx: Instant,
    last_heartbeat_nonce: u64,
    next_ping_nonce: u64,
    reconnect_attempts: u32,
}

impl PeerEntry {
    fn new(transport: Arc<dyn Transport>, generation: u64, role: NegotiationRole) -> Self {
        Self {
            transport,
            generation,
            role,
            state: PeerState::New,
            ice: IceState::New,
            channels: HashMap::new(),
            pending_candidates: Vec::new(),
            remote_description_set: false,
            local_offer_pending: false,
            last_heartbeat_rx: Instant::now(),
            last_heartbeat_nonce: 0,
            next_ping_nonce: 0,
            reconnect_attempts: 0,
        }
    }

    fn link_ready(&self) -> bool {
        matches!(self.ice, IceState::Connected | IceState::Completed)
            && self
                .channels
                .values()
                .any(|state| *state == ChannelState::Open)
    }
}

#[derive(Default)]
struct Shared {
    peers: HashMap<PeerId, PeerEntry>,
    /// Candidates that arrived before the first offer from their sender.
    orphan_candidates: HashMap<PeerId, Vec<CandidateInit>>,
    signal_tx: Option<mpsc::UnboundedSender<SignalEnvelope>>,
    /// Target of the most recent unanswered join, for mapping relay-side
    /// "Target not found" back to a pending connection.
    awaiting_join: Option<PeerId>,
    next_generation: u64,
    loop_task: Option<JoinHandle<()>>,
    aux_tasks: Vec<JoinHandle<()>>,
}

enum LoopEvent {
    Signaling(SignalingEvent),
    Transport {
        peer: PeerId,
        generation: u64,
        event: TransportEvent,
    },
    Tick,
    Reconnect {
        peer: PeerId,
        attempt: u32,
    },
    SignalingExhausted {
        reason: String,
    },
    Shutdown,
}

struct Inner {
    config: ManagerConfig,
    factory: Arc<dyn TransportFactory>,
    connector: Arc<dyn SignalingConnector>,
    handlers: Mutex<Handlers>,
    shared: Mutex<Shared>,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    running: AtomicBool,
}

/// Owns every peer connection on a node. Cheap to clone; all clones share
/// one state.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<Inner>,
    loop_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<LoopEvent>>>>,
}

impl PeerManager {
    pub fn new(
        config: ManagerConfig,
        factory: Arc<dyn TransportFactory>,
        connector: Arc<dyn SignalingConnector>,
    ) -> Self {
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                connector,
                handlers: Mutex::new(Handlers::default()),
                shared: Mutex::new(Shared::default()),
                loop_tx,
                running: AtomicBool::new(false),
            }),
            loop_rx: Arc::new(Mutex::new(Some(loop_rx))),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.config.local_id
    }

    // Handler registration. Handlers are invoked from the manager's own
    // task, never from transport or socket callbacks.

    pub fn on_signaling_connected(&self, f: impl Fn() + Send + Sync + 'static) {
        self.inner.handlers.lock().unwrap().signaling_connected = Some(Arc::new(f));
    }

    pub fn on_signaling_disconnected(&self, f: impl Fn(String) + Send + Sync + 'static) {
        self.inner.handlers.lock().unwrap().signaling_disconnected = Some(Arc::new(f));
    }

    pub fn on_signaling_error(&self, f: impl Fn(String) + Send + Sync + 'static) {
        self.inner.handlers.lock().unwrap().signaling_error = Some(Arc::new(f));
    }

    pub fn on_peer_connected(&self, f: impl Fn(PeerId) + Send + Sync + 'static) {
        self.inner.handlers.lock().unwrap().peer_connected = Some(Arc::new(f));
    }

    pub fn on_peer_disconnected(&self, f: impl Fn(PeerId, String) + Send + Sync + 'static) {
        self.inner.handlers.lock().unwrap().peer_disconnected = Some(Arc::new(f));
    }

    pub fn on_peer_error(&self, f: impl Fn(PeerId, String) + Send + Sync + 'static) {
        self.inner.handlers.lock().unwrap().peer_error = Some(Arc::new(f));
    }

    pub fn on_channel_message(&self, f: impl Fn(PeerId, String, Bytes) + Send + Sync + 'static) {
        self.inner.handlers.lock().unwrap().channel_message = Some(Arc::new(f));
    }

    pub fn on_video_track(&self, f: impl Fn(PeerId, VideoTrackInfo) + Send + Sync + 'static) {
        self.inner.handlers.lock().unwrap().video_track = Some(Arc::new(f));
    }

    /// Safety hook: fires before the terminal disconnect notification when a
    /// peer goes silent past the loss threshold.
    pub fn on_heartbeat_lost(&self, f: impl Fn(PeerId) + Send + Sync + 'static) {
        self.inner.handlers.lock().unwrap().heartbeat_lost = Some(Arc::new(f));
    }

    /// Establish the relay link and start the event loop. Returns once the
    /// link is open, or with the error that made it permanently fail.
    pub async fn start(&self) -> Result<(), ManagerError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let session = match connect_with_backoff(&self.inner).await {
            Ok(session) => session,
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let Some(loop_rx) = self.loop_rx.lock().unwrap().take() else {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(ManagerError::Config("manager already consumed".into()));
        };

        install_signaling(&self.inner, session);

        let loop_inner = self.inner.clone();
        let loop_task = tokio::spawn(run_loop(loop_inner, loop_rx));

        let mut shared = self.inner.shared.lock().unwrap();
        shared.loop_task = Some(loop_task);
        if let Some(period) = self.inner.config.heartbeat_period() {
            let tick_tx = self.inner.loop_tx.clone();
            shared.aux_tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick fires immediately; skip it so freshly
                // created entries get a full period of grace.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if tick_tx.send(LoopEvent::Tick).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(shared);

        invoke(handler(&self.inner, |h| h.signaling_connected.clone()), |f| f());
        Ok(())
    }

    /// Close every peer connection and the relay link, then quiesce all
    /// workers. Public operations return `NotRunning` afterwards.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let (entries, loop_task, aux_tasks) = {
            let mut shared = self.inner.shared.lock().unwrap();
            shared.signal_tx = None;
            shared.awaiting_join = None;
            shared.orphan_candidates.clear();
            let entries: Vec<(PeerId, PeerEntry)> = shared.peers.drain().collect();
            (
                entries,
                shared.loop_task.take(),
                std::mem::take(&mut shared.aux_tasks),
            )
        };

        let disconnected = handler(&self.inner, |h| h.peer_disconnected.clone());
        for (peer, entry) in entries {
            entry.transport.close().await;
            invoke(disconnected.clone(), |f| {
                f(peer.clone(), "local shutdown".to_string())
            });
        }

        let _ = self.inner.loop_tx.send(LoopEvent::Shutdown);
        for task in aux_tasks {
            task.abort();
        }
        if let Some(task) = loop_task {
            let _ = task.await;
        }
    }

    /// Create a connection toward `peer` and start negotiating. Idempotent:
    /// an existing connection is success.
    pub async fn connect_peer(&self, peer: impl Into<PeerId>) -> Result<(), ManagerError> {
        let peer = peer.into();
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(ManagerError::NotRunning);
        }
        if self.inner.shared.lock().unwrap().peers.contains_key(&peer) {
            return Ok(());
        }
        initiate_connection(&self.inner, peer, 0).await
    }

    /// Close the named connection. Unknown peers are success, so a double
    /// disconnect stays a single terminal notification.
    pub async fn disconnect_peer(
        &self,
        peer: impl Into<PeerId>,
        reason: &str,
    ) -> Result<(), ManagerError> {
        let peer = peer.into();
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(ManagerError::NotRunning);
        }
        let Some(entry) = self.inner.shared.lock().unwrap().peers.remove(&peer) else {
            return Ok(());
        };
        send_envelope(
            &self.inner,
            SignalEnvelope::new(
                self.inner.config.local_id.clone(),
                PeerId::new(""),
                SignalPayload::Leave {
                    reason: reason.to_string(),
                },
            ),
        );
        entry.transport.close().await;
        invoke(handler(&self.inner, |h| h.peer_disconnected.clone()), |f| {
            f(peer.clone(), reason.to_string())
        });
        Ok(())
    }

    /// Route bytes to one peer's labeled channel.
    pub fn send(
        &self,
        peer: impl Into<PeerId>,
        label: &str,
        payload: Bytes,
    ) -> Result<(), ManagerError> {
        let peer = peer.into();
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(ManagerError::NotRunning);
        }
        let transport = {
            let shared = self.inner.shared.lock().unwrap();
            let entry = shared
                .peers
                .get(&peer)
                .ok_or_else(|| ManagerError::UnknownPeer(peer.clone()))?;
            entry.transport.clone()
        };
        transport.send(label, payload).map_err(ManagerError::from)
    }

    /// Best-effort send to every peer whose labeled channel is open.
    /// Returns the number of successful enqueues.
    pub fn broadcast(&self, label: &str, payload: Bytes) -> Result<usize, ManagerError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(ManagerError::NotRunning);
        }
        let targets: Vec<Arc<dyn Transport>> = {
            let shared = self.inner.shared.lock().unwrap();
            shared
                .peers
                .values()
                .filter(|entry| entry.channels.get(label) == Some(&ChannelState::Open))
                .map(|entry| entry.transport.clone())
                .collect()
        };
        let mut delivered = 0;
        for transport in targets {
            if transport.send(label, payload.clone()).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Register an inbound video consumer on one peer's transport.
    pub fn attach_video_sink(
        &self,
        peer: impl Into<PeerId>,
        sink: Arc<dyn VideoSink>,
    ) -> Result<(), ManagerError> {
        let peer = peer.into();
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(ManagerError::NotRunning);
        }
        let shared = self.inner.shared.lock().unwrap();
        let entry = shared
            .peers
            .get(&peer)
            .ok_or_else(|| ManagerError::UnknownPeer(peer.clone()))?;
        entry.transport.attach_video_sink(sink);
        Ok(())
    }

    /// Current state of a peer connection, if one exists.
    pub fn peer_state(&self, peer: impl Into<PeerId>) -> Option<PeerState> {
        let peer = peer.into();
        self.inner
            .shared
            .lock()
            .unwrap()
            .peers
            .get(&peer)
            .map(|entry| entry.state)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .shared
            .lock()
            .unwrap()
            .peers
            .iter()
            .filter(|(_, entry)| entry.state == PeerState::Connected)
            .map(|(peer, _)| peer.clone())
            .collect()
    }
}

fn handler<T: Clone>(inner: &Arc<Inner>, pick: impl Fn(&Handlers) -> Option<T>) -> Option<T> {
    pick(&inner.handlers.lock().unwrap())
}

fn invoke<T>(slot: Option<T>, call: impl FnOnce(&T)) {
    if let Some(f) = slot.as_ref() {
        call(f);
    }
}

fn send_envelope(inner: &Arc<Inner>, envelope: SignalEnvelope) {
    let tx = inner.shared.lock().unwrap().signal_tx.clone();
    match tx {
        Some(tx) => {
            if tx.send(envelope).is_err() {
                tracing::debug!(target: "manager", "dropping envelope, relay link writer gone");
            }
        }
        None => {
            tracing::debug!(target: "manager", "dropping envelope, relay link down");
        }
    }
}

async fn connect_with_backoff(inner: &Arc<Inner>) -> Result<SignalingSession, ManagerError> {
    let period = inner
        .config
        .heartbeat_period()
        .unwrap_or(Duration::from_secs(1));
    let max_attempts = inner.config.reconnect_max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match inner.connector.connect().await {
            Ok(session) => return Ok(session),
            // A bad uri never gets better; auth rejections arrive after the
            // handshake and are stopped by the close-reason check instead.
            Err(err @ ManagerError::Config(_)) => return Err(err),
            Err(err) => {
                if attempt >= max_attempts {
                    return Err(err);
                }
                let delay = liveness::backoff_delay(period, attempt);
                tracing::warn!(target: "manager", error = %err, attempt, delay_ms = delay.as_millis() as u64, "relay link attempt failed, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Install a live relay session: park the writer half in shared state and
/// pump events into the loop. On closure the pump retries with backoff and
/// either reinstalls itself or reports exhaustion.
fn install_signaling(inner: &Arc<Inner>, session: SignalingSession) {
    let SignalingSession {
        outbound,
        mut events,
    } = session;

    {
        let mut shared = inner.shared.lock().unwrap();
        shared.signal_tx = Some(outbound);
    }

    let pump_inner = inner.clone();
    let task = tokio::spawn(async move {
        let close_reason = loop {
            match events.recv().await {
                Some(SignalingEvent::Closed { reason }) => break reason,
                Some(event) => {
                    if pump_inner.loop_tx.send(LoopEvent::Signaling(event)).is_err() {
                        return;
                    }
                }
                None => break "link closed".to_string(),
            }
        };

        if !pump_inner.running.load(Ordering::SeqCst) {
            return;
        }
        pump_inner.shared.lock().unwrap().signal_tx = None;
        invoke(handler(&pump_inner, |h| h.signaling_disconnected.clone()), |f| {
            f(close_reason.clone())
        });

        // Auth rejections are not transient; retrying the same token would
        // just hammer the relay.
        if close_reason.contains("Authentication failed") {
            let _ = pump_inner.loop_tx.send(LoopEvent::SignalingExhausted {
                reason: close_reason,
            });
            return;
        }

        match connect_with_backoff(&pump_inner).await {
            Ok(session) => {
                if pump_inner.running.load(Ordering::SeqCst) {
                    install_signaling(&pump_inner, session);
                    invoke(handler(&pump_inner, |h| h.signaling_connected.clone()), |f| f());
                }
            }
            Err(err) => {
                let _ = pump_inner.loop_tx.send(LoopEvent::SignalingExhausted {
                    reason: err.to_string(),
                });
            }
        }
    });

    inner.shared.lock().unwrap().aux_tasks.push(task);
}

async fn initiate_connection(
    inner: &Arc<Inner>,
    peer: PeerId,
    reconnect_attempts: u32,
) -> Result<(), ManagerError> {
    let generation = {
        let mut shared = inner.shared.lock().unwrap();
        shared.next_generation += 1;
        shared.next_generation
    };

    let transport = create_transport(inner, &peer, generation).await?;

    let already_connected = {
        let mut shared = inner.shared.lock().unwrap();
        if shared.peers.contains_key(&peer) {
            true
        } else {
            let mut entry = PeerEntry::new(transport.clone(), generation, NegotiationRole::Offerer);
            entry.reconnect_attempts = reconnect_attempts;
            if let Some(orphans) = shared.orphan_candidates.remove(&peer) {
                entry.pending_candidates = orphans;
            }
            shared.peers.insert(peer.clone(), entry);
            shared.awaiting_join = Some(peer.clone());
            false
        }
    };
    if already_connected {
        transport.close().await;
        return Ok(());
    }

    if let Err(err) = begin_negotiation(inner, &peer, &transport).await {
        inner.shared.lock().unwrap().peers.remove(&peer);
        transport.close().await;
        return Err(err);
    }

    let mut shared = inner.shared.lock().unwrap();
    if let Some(entry) = shared.peers.get_mut(&peer) {
        if let Ok(next) = state::transition(entry.state, StateInput::NegotiationStarted) {
            entry.state = next;
        }
        entry.local_offer_pending = true;
    }
    Ok(())
}

async fn begin_negotiation(
    inner: &Arc<Inner>,
    peer: &PeerId,
    transport: &Arc<dyn Transport>,
) -> Result<(), ManagerError> {
    let labels = &inner.config.channels;
    transport
        .open_data_channel(&labels.control, ChannelReliability::ReliableOrdered)
        .await?;
    transport
        .open_data_channel(&labels.telemetry, ChannelReliability::UnreliableUnordered)
        .await?;
    transport
        .open_data_channel(
            heartbeat::HEARTBEAT_CHANNEL,
            ChannelReliability::UnreliableUnordered,
        )
        .await?;

    send_envelope(
        inner,
        SignalEnvelope::new(
            inner.config.local_id.clone(),
            PeerId::new(""),
            SignalPayload::Join {
                target: peer.clone(),
            },
        ),
    );

    transport.create_offer().await?;
    Ok(())
}

/// Build a transport whose events are tagged with `(peer, generation)` and
/// funneled into the manager loop. The pump holds no strong reference to the
/// manager's state, so a transport outliving its entry is a safe no-op.
async fn create_transport(
    inner: &Arc<Inner>,
    peer: &PeerId,
    generation: u64,
) -> Result<Arc<dyn Transport>, ManagerError> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let transport = inner.factory.create(peer, events_tx).await?;

    let loop_tx = inner.loop_tx.clone();
    let peer = peer.clone();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if loop_tx
                .send(LoopEvent::Transport {
                    peer: peer.clone(),
                    generation,
                    event,
                })
                .is_err()
            {
                break;
            }
        }
    });

    Ok(transport)
}

async fn run_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<LoopEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            LoopEvent::Shutdown => break,
            LoopEvent::Signaling(SignalingEvent::Envelope(envelope)) => {
                handle_envelope(&inner, envelope).await;
            }
            LoopEvent::Signaling(SignalingEvent::Closed { .. }) => {
                // The signaling pump owns closure handling; nothing reaches
                // here in practice.
            }
            LoopEvent::Transport {
                peer,
                generation,
                event,
            } => {
                handle_transport_event(&inner, peer, generation, event).await;
            }
            LoopEvent::Tick => handle_tick(&inner).await,
            LoopEvent::Reconnect { peer, attempt } => {
                if !inner.running.load(Ordering::SeqCst) {
                    continue;
                }
                if inner.shared.lock().unwrap().peers.contains_key(&peer) {
                    continue;
                }
                tracing::info!(target: "manager", peer = %peer, attempt, "reconnecting");
                if let Err(err) = initiate_connection(&inner, peer.clone(), attempt).await {
                    tracing::warn!(target: "manager", peer = %peer, error = %err, "reconnect attempt failed");
                    schedule_reconnect(&inner, peer, attempt);
                }
            }
            LoopEvent::SignalingExhausted { reason } => {
                tracing::error!(target: "manager", reason = %reason, "relay link permanently lost");
                invoke(handler(&inner, |h| h.signaling_error.clone()), |f| {
                    f(format!("relay link permanently lost: {reason}"))
                });
            }
        }
    }
}

async fn handle_envelope(inner: &Arc<Inner>, envelope: SignalEnvelope) {
    let local = &inner.config.local_id;
    if !envelope.to.is_empty() && envelope.to != *local {
        tracing::debug!(target: "manager", to = %envelope.to, "discarding misrouted envelope");
        return;
    }
    let from = envelope.from.clone();
    match envelope.payload {
        SignalPayload::Offer { sdp } => handle_offer(inner, from, sdp).await,
        SignalPayload::Answer { sdp } => handle_answer(inner, from, sdp).await,
        SignalPayload::Candidate(candidate) => handle_candidate(inner, from, candidate).await,
        SignalPayload::Leave { reason } => {
            close_peer(inner, &from, &reason, true).await;
        }
        SignalPayload::Heartbeat { nonce } => record_heartbeat(inner, &from, nonce),
        SignalPayload::JoinRequest => handle_join_request(inner, from).await,
        SignalPayload::Error { reason } => handle_relay_error(inner, reason).await,
        SignalPayload::Join { .. } => {
            tracing::debug!(target: "manager", from = %from, "ignoring join addressed to a node");
        }
    }
}

async fn handle_offer(inner: &Arc<Inner>, from: PeerId, sdp: String) {
    enum Plan {
        UseExisting(Arc<dyn Transport>),
        Replace,
        CreateNew,
        Ignore,
    }

    let plan = {
        let mut shared = inner.shared.lock().unwrap();
        match shared.peers.get_mut(&from) {
            Some(entry) if entry.local_offer_pending => {
                // Glare: both sides dialed each other. The smaller id keeps
                // its offer; the other side re-creates its transport and
                // answers.
                if inner.config.local_id < from {
                    tracing::debug!(target: "manager", peer = %from, "glare, keeping local offer");
                    Plan::Ignore
                } else {
                    tracing::debug!(target: "manager", peer = %from, "glare, adopting answerer role");
                    Plan::Replace
                }
            }
            Some(entry) => {
                entry.role = NegotiationRole::Answerer;
                Plan::UseExisting(entry.transport.clone())
            }
            None => Plan::CreateNew,
        }
    };

    let transport = match plan {
        Plan::Ignore => return,
        Plan::UseExisting(transport) => transport,
        Plan::Replace | Plan::CreateNew => {
            let generation = {
                let mut shared = inner.shared.lock().unwrap();
                shared.next_generation += 1;
                shared.next_generation
            };
            let transport = match create_transport(inner, &from, generation).await {
                Ok(transport) => transport,
                Err(err) => {
                    tracing::warn!(target: "manager", peer = %from, error = %err, "transport creation for inbound offer failed");
                    invoke(handler(inner, |h| h.peer_error.clone()), |f| {
                        f(from.clone(), err.to_string())
                    });
                    return;
                }
            };

            let old_transport = {
                let mut shared = inner.shared.lock().unwrap();
                let orphans = shared.orphan_candidates.remove(&from).unwrap_or_default();
                match shared.peers.get_mut(&from) {
                    Some(entry) => {
                        let old = std::mem::replace(&mut entry.transport, transport.clone());
                        entry.generation = generation;
                        entry.role = NegotiationRole::Answerer;
                        entry.local_offer_pending = false;
                        entry.remote_description_set = false;
                        entry.ice = IceState::New;
                        entry.channels.clear();
                        entry.pending_candidates.extend(orphans);
                        Some(old)
                    }
                    None => {
                        let mut entry =
                            PeerEntry::new(transport.clone(), generation, NegotiationRole::Answerer);
                        entry.pending_candidates = orphans;
                        if let Ok(next) =
                            state::transition(entry.state, StateInput::NegotiationStarted)
                        {
                            entry.state = next;
                        }
                        shared.peers.insert(from.clone(), entry);
                        None
                    }
                }
            };
            if let Some(old) = old_transport {
                tokio::spawn(async move { old.close().await });
            }
            transport
        }
    };

    if let Err(err) = transport.set_remote_description(SdpKind::Offer, &sdp).await {
        fail_peer(inner, &from, &format!("remote offer rejected: {err}")).await;
        return;
    }

    let buffered = {
        let mut shared = inner.shared.lock().unwrap();
        match shared.peers.get_mut(&from) {
            Some(entry) => {
                entry.remote_description_set = true;
                std::mem::take(&mut entry.pending_candidates)
            }
            None => return,
        }
    };
    for candidate in buffered {
        if let Err(err) = transport.add_remote_candidate(&candidate).await {
            fail_peer(inner, &from, &format!("remote candidate rejected: {err}")).await;
            return;
        }
    }

    if let Err(err) = transport.create_answer().await {
        fail_peer(inner, &from, &format!("answer generation failed: {err}")).await;
    }
}

async fn handle_answer(inner: &Arc<Inner>, from: PeerId, sdp: String) {
    let transport = {
        let mut shared = inner.shared.lock().unwrap();
        match shared.peers.get_mut(&from) {
            Some(entry)
                if entry.role == NegotiationRole::Offerer
                    && entry.local_offer_pending
                    && entry.state == PeerState::Connecting =>
            {
                entry.local_offer_pending = false;
                entry.transport.clone()
            }
            _ => {
                drop(shared);
                tracing::warn!(target: "manager", peer = %from, "answer without a pending offer");
                send_envelope(
                    inner,
                    SignalEnvelope::new(
                        inner.config.local_id.clone(),
                        from.clone(),
                        SignalPayload::Error {
                            reason: "Answer without pending offer".to_string(),
                        },
                    ),
                );
                return;
            }
        }
    };

    if let Err(err) = transport.set_remote_description(SdpKind::Answer, &sdp).await {
        fail_peer(inner, &from, &format!("remote answer rejected: {err}")).await;
        return;
    }

    let buffered = {
        let mut shared = inner.shared.lock().unwrap();
        match shared.peers.get_mut(&from) {
            Some(entry) => {
                entry.remote_description_set = true;
                std::mem::take(&mut entry.pending_candidates)
            }
            None => return,
        }
    };
    for candidate in buffered {
        if let Err(err) = transport.add_remote_candidate(&candidate).await {
            fail_peer(inner, &from, &format!("remote candidate rejected: {err}")).await;
            return;
        }
    }
}

async fn handle_candidate(inner: &Arc<Inner>, from: PeerId, candidate: CandidateInit) {
    let apply_to = {
        let mut shared = inner.shared.lock().unwrap();
        match shared.peers.get_mut(&from) {
            Some(entry) if entry.remote_description_set => Some(entry.transport.clone()),
            Some(entry) => {
                entry.pending_candidates.push(candidate.clone());
                None
            }
            None => {
                // Candidate raced ahead of its offer; hold it for the entry
                // that offer will create.
                shared
                    .orphan_candidates
                    .entry(from.clone())
                    .or_default()
                    .push(candidate.clone());
                None
            }
        }
    };
    if let Some(transport) = apply_to {
        if let Err(err) = transport.add_remote_candidate(&candidate).await {
            fail_peer(inner, &from, &format!("remote candidate rejected: {err}")).await;
        }
    }
}

async fn handle_join_request(inner: &Arc<Inner>, from: PeerId) {
    if inner.shared.lock().unwrap().peers.contains_key(&from) {
        return;
    }
    if inner.config.local_id < from {
        // Smaller id is the offerer: dial back immediately.
        if let Err(err) = initiate_connection(inner, from.clone(), 0).await {
            tracing::warn!(target: "manager", peer = %from, error = %err, "offer toward joining peer failed");
            invoke(handler(inner, |h| h.peer_error.clone()), |f| {
                f(from.clone(), err.to_string())
            });
        }
    } else {
        // Register the partnership and wait for the peer's offer.
        send_envelope(
            inner,
            SignalEnvelope::new(
                inner.config.local_id.clone(),
                PeerId::new(""),
                SignalPayload::Join {
                    target: from.clone(),
                },
            ),
        );
    }
}

async fn handle_relay_error(inner: &Arc<Inner>, reason: String) {
    invoke(handler(inner, |h| h.signaling_error.clone()), |f| {
        f(reason.clone())
    });

    // The relay's "Target not found" answers our most recent join; the
    // pending connection will never negotiate, so drop it without a
    // terminal peer notification.
    if reason == "Target not found" {
        let stale = {
            let mut shared = inner.shared.lock().unwrap();
            shared
                .awaiting_join
                .take()
                .and_then(|peer| shared.peers.remove(&peer).map(|entry| (peer, entry)))
        };
        if let Some((peer, entry)) = stale {
            tracing::info!(target: "manager", peer = %peer, "dropping pending connection, target not registered");
            entry.transport.close().await;
        }
    }
}

fn record_heartbeat(inner: &Arc<Inner>, from: &PeerId, nonce: u64) {
    let mut shared = inner.shared.lock().unwrap();
    if let Some(entry) = shared.peers.get_mut(from) {
        if nonce <= entry.last_heartbeat_nonce && entry.last_heartbeat_nonce != 0 {
            tracing::debug!(target: "manager", peer = %from, nonce, "ignoring stale heartbeat nonce");
            return;
        }
        entry.last_heartbeat_nonce = nonce;
        entry.last_heartbeat_rx = Instant::now();
    }
}

async fn handle_transport_event(
    inner: &Arc<Inner>,
    peer: PeerId,
    generation: u64,
    event: TransportEvent,
) {
    // Fence: events from a replaced or removed transport are no-ops.
    {
        let shared = inner.shared.lock().unwrap();
        match shared.peers.get(&peer) {
            Some(entry) if entry.generation == generation => {}
            _ => return,
        }
    }

    match event {
        TransportEvent::LocalSdp { kind, sdp } => {
            let payload = {
                let mut shared = inner.shared.lock().unwrap();
                let Some(entry) = shared.peers.get_mut(&peer) else {
                    return;
                };
                match kind {
                    SdpKind::Offer => {
                        if entry.role != NegotiationRole::Offerer {
                            // Glare loser: its locally generated offer dies here.
                            return;
                        }
                        if let Ok(next) =
                            state::transition(entry.state, StateInput::NegotiationStarted)
                        {
                            entry.state = next;
                        }
                        SignalPayload::Offer { sdp }
                    }
                    SdpKind::Answer => {
                        if let Ok(next) =
                            state::transition(entry.state, StateInput::NegotiationStarted)
                        {
                            entry.state = next;
                        }
                        SignalPayload::Answer { sdp }
                    }
                }
            };
            send_envelope(
                inner,
                SignalEnvelope::new(inner.config.local_id.clone(), peer, payload),
            );
        }
        TransportEvent::LocalCandidate(candidate) => {
            send_envelope(
                inner,
                SignalEnvelope::new(
                    inner.config.local_id.clone(),
                    peer,
                    SignalPayload::Candidate(candidate),
                ),
            );
        }
        TransportEvent::ConnectionState(state) => match state {
            PeerState::Failed => fail_peer(inner, &peer, "Transport failed").await,
            PeerState::Closed => close_peer(inner, &peer, "Transport closed", true).await,
            PeerState::Connected => maybe_promote(inner, &peer),
            PeerState::Disconnected => demote(inner, &peer),
            PeerState::New | PeerState::Connecting => {}
        },
        TransportEvent::IceState(ice) => {
            {
                let mut shared = inner.shared.lock().unwrap();
                if let Some(entry) = shared.peers.get_mut(&peer) {
                    entry.ice = ice;
                }
            }
            match ice {
                IceState::Connected | IceState::Completed => maybe_promote(inner, &peer),
                IceState::Disconnected => demote(inner, &peer),
                IceState::Failed => fail_peer(inner, &peer, "ICE failed").await,
                _ => {}
            }
        }
        TransportEvent::ChannelOpen { label } => {
            {
                let mut shared = inner.shared.lock().unwrap();
                if let Some(entry) = shared.peers.get_mut(&peer) {
                    entry.channels.insert(label, ChannelState::Open);
                }
            }
            maybe_promote(inner, &peer);
        }
        TransportEvent::ChannelClose { label } => {
            let mut shared = inner.shared.lock().unwrap();
            if let Some(entry) = shared.peers.get_mut(&peer) {
                entry.channels.insert(label, ChannelState::Closed);
            }
        }
        TransportEvent::Message { label, payload } => {
            if label == heartbeat::HEARTBEAT_CHANNEL {
                if let Some(nonce) = heartbeat::decode(&payload) {
                    record_heartbeat(inner, &peer, nonce);
                } else {
                    tracing::debug!(target: "manager", peer = %peer, "malformed heartbeat frame");
                }
                return;
            }
            invoke(handler(inner, |h| h.channel_message.clone()), |f| {
                f(peer.clone(), label.clone(), payload.clone())
            });
        }
        TransportEvent::VideoTrack(info) => {
            invoke(handler(inner, |h| h.video_track.clone()), |f| {
                f(peer.clone(), info.clone())
            });
        }
        TransportEvent::RenegotiationNeeded => {
            tracing::debug!(target: "manager", peer = %peer, "renegotiation requested, session scope is fixed");
        }
        TransportEvent::Error { reason } => {
            tracing::warn!(target: "manager", peer = %peer, reason = %reason, "transport error");
            invoke(handler(inner, |h| h.peer_error.clone()), |f| {
                f(peer.clone(), reason.clone())
            });
        }
    }
}

/// Promote to Connected when ICE is up and at least one channel is open.
/// Fires the connected handler on every entry into Connected, including
/// recovery from Disconnected.
fn maybe_promote(inner: &Arc<Inner>, peer: &PeerId) {
    let promoted = {
        let mut shared = inner.shared.lock().unwrap();
        let Some(entry) = shared.peers.get_mut(peer) else {
            return;
        };
        if entry.state == PeerState::Connected || !entry.link_ready() {
            false
        } else {
            match state::transition(entry.state, StateInput::LinkReady) {
                Ok(next) => {
                    entry.state = next;
                    entry.reconnect_attempts = 0;
                    entry.last_heartbeat_rx = Instant::now();
                    true
                }
                Err(err) => {
                    tracing::debug!(target: "manager", peer = %peer, %err, "not promoting");
                    false
                }
            }
        }
    };
    if promoted {
        tracing::info!(target: "manager", peer = %peer, "peer connected");
        invoke(handler(inner, |h| h.peer_connected.clone()), |f| {
            f(peer.clone())
        });
    }
}

fn demote(inner: &Arc<Inner>, peer: &PeerId) {
    let mut shared = inner.shared.lock().unwrap();
    if let Some(entry) = shared.peers.get_mut(peer) {
        if let Ok(next) = state::transition(entry.state, StateInput::LinkLost) {
            tracing::info!(target: "manager", peer = %peer, "peer link degraded, recovery pending");
            entry.state = next;
        }
    }
}

/// Terminal failure: remove the entry, notify exactly once, and schedule a
/// reconnect when attempts remain.
async fn fail_peer(inner: &Arc<Inner>, peer: &PeerId, reason: &str) {
    let Some(entry) = inner.shared.lock().unwrap().peers.remove(peer) else {
        return;
    };
    tracing::warn!(target: "manager", peer = %peer, reason = %reason, "peer failed");
    let transport = entry.transport.clone();
    tokio::spawn(async move { transport.close().await });

    invoke(handler(inner, |h| h.peer_disconnected.clone()), |f| {
        f(peer.clone(), reason.to_string())
    });

    if entry.reconnect_attempts < inner.config.reconnect_max_attempts {
        schedule_reconnect(inner, peer.clone(), entry.reconnect_attempts + 1);
    } else {
        tracing::warn!(target: "manager", peer = %peer, "reconnect attempts exhausted");
    }
}

fn schedule_reconnect(inner: &Arc<Inner>, peer: PeerId, attempt: u32) {
    if !inner.running.load(Ordering::SeqCst) {
        return;
    }
    if attempt > inner.config.reconnect_max_attempts {
        tracing::warn!(target: "manager", peer = %peer, "reconnect attempts exhausted");
        return;
    }
    let period = inner
        .config
        .heartbeat_period()
        .unwrap_or(Duration::from_secs(1));
    let delay = liveness::backoff_delay(period, attempt);
    let loop_tx = inner.loop_tx.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = loop_tx.send(LoopEvent::Reconnect { peer, attempt });
    });
    inner.shared.lock().unwrap().aux_tasks.push(task);
}

/// Orderly closure: remove the entry and notify exactly once. No reconnect.
async fn close_peer(inner: &Arc<Inner>, peer: &PeerId, reason: &str, notify: bool) {
    let Some(entry) = inner.shared.lock().unwrap().peers.remove(peer) else {
        return;
    };
    entry.transport.close().await;
    if notify {
        invoke(handler(inner, |h| h.peer_disconnected.clone()), |f| {
            f(peer.clone(), reason.to_string())
        });
    }
}

/// One liveness tick: emit a heartbeat per active peer (dedicated channel
/// preferred, relay fallback) and fail the ones that went silent.
async fn handle_tick(inner: &Arc<Inner>) {
    let Some(period) = inner.config.heartbeat_period() else {
        return;
    };
    let now = Instant::now();

    struct Ping {
        peer: PeerId,
        transport: Arc<dyn Transport>,
        nonce: u64,
        channel_open: bool,
    }

    let (pings, lost): (Vec<Ping>, Vec<PeerId>) = {
        let mut shared = inner.shared.lock().unwrap();
        let mut pings = Vec::new();
        let mut lost = Vec::new();
        for (peer, entry) in shared.peers.iter_mut() {
            if !matches!(entry.state, PeerState::Connected | PeerState::Disconnected) {
                continue;
            }
            if liveness::is_stale(entry.last_heartbeat_rx, now, period) {
                lost.push(peer.clone());
                continue;
            }
            entry.next_ping_nonce += 1;
            pings.push(Ping {
                peer: peer.clone(),
                transport: entry.transport.clone(),
                nonce: entry.next_ping_nonce,
                channel_open: entry.channels.get(heartbeat::HEARTBEAT_CHANNEL)
                    == Some(&ChannelState::Open),
            });
        }
        (pings, lost)
    };

    for ping in pings {
        if ping.channel_open {
            if let Err(err) = ping
                .transport
                .send(heartbeat::HEARTBEAT_CHANNEL, heartbeat::encode(ping.nonce))
            {
                tracing::debug!(target: "manager", peer = %ping.peer, error = %err, "heartbeat channel send failed, falling back to relay");
                send_envelope(
                    inner,
                    SignalEnvelope::new(
                        inner.config.local_id.clone(),
                        ping.peer.clone(),
                        SignalPayload::Heartbeat { nonce: ping.nonce },
                    ),
                );
            }
        } else {
            send_envelope(
                inner,
                SignalEnvelope::new(
                    inner.config.local_id.clone(),
                    ping.peer.clone(),
                    SignalPayload::Heartbeat { nonce: ping.nonce },
                ),
            );
        }
    }

    for peer in lost {
        invoke(handler(inner, |h| h.heartbeat_lost.clone()), |f| {
            f(peer.clone())
        });
        fail_peer(inner, &peer, "Heartbeat lost").await;
    }
}
