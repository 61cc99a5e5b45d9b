//! `webrtc`-crate-backed implementation of the [`Transport`] seam.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use signal_proto::{CandidateInit, PeerId};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::{
    ChannelReliability, ChannelState, EventSink, IceState, PeerState, SdpKind, Transport,
    TransportError, TransportEvent, TransportFactory, VideoSink, VideoTrackInfo,
};

/// Per-channel outbound queue depth. Reliable sends beyond this surface
/// `Backpressured`; unreliable sends drop.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub uri: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<IceServerConfig>,
}

impl WebRtcConfig {
    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![server.uri.clone()],
                username: server.username.clone().unwrap_or_default(),
                credential: server.password.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

struct ChannelEntry {
    state: ChannelState,
    reliability: ChannelReliability,
    outbound: mpsc::Sender<Bytes>,
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    channels: Arc<Mutex<HashMap<String, ChannelEntry>>>,
    events: EventSink,
    video_sink: Arc<Mutex<Option<Arc<dyn VideoSink>>>>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    pub async fn connect(
        config: &WebRtcConfig,
        events: EventSink,
    ) -> Result<Arc<Self>, TransportError> {
        let api = build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(config.rtc_configuration())
                .await
                .map_err(setup_error)?,
        );

        let transport = Arc::new(Self {
            pc: pc.clone(),
            channels: Arc::new(Mutex::new(HashMap::new())),
            events: events.clone(),
            video_sink: Arc::new(Mutex::new(None)),
            closed: AtomicBool::new(false),
        });

        transport.install_pc_handlers();
        Ok(transport)
    }

    fn install_pc_handlers(self: &Arc<Self>) {
        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    if let Some(mapped) = map_peer_state(state) {
                        let _ = events.send(TransportEvent::ConnectionState(mapped));
                    }
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    if let Some(mapped) = map_ice_state(state) {
                        let _ = events.send(TransportEvent::IceState(mapped));
                    }
                })
            }));

        let events = self.events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let events = events.clone();
            Box::pin(async move {
                // None marks the end of gathering; with trickle ICE there is
                // nothing to forward for it.
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid.unwrap_or_default(),
                            sdp_mline_index: u32::from(init.sdp_mline_index.unwrap_or(0)),
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target: "transport", error = %err, "dropping unserializable local candidate");
                    }
                }
            })
        }));

        let events = self.events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::RenegotiationNeeded);
            })
        }));

        // Remote-opened channels (answerer side).
        let channels = self.channels.clone();
        let events = self.events.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let channels = channels.clone();
                let events = events.clone();
                Box::pin(async move {
                    let reliability = if dc.ordered() {
                        ChannelReliability::ReliableOrdered
                    } else {
                        ChannelReliability::UnreliableUnordered
                    };
                    register_channel(dc, reliability, &channels, &events);
                })
            }));

        let events = self.events.clone();
        let sink = self.video_sink.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            let sink = sink.clone();
            Box::pin(async move {
                let info = VideoTrackInfo {
                    id: track.id(),
                    mime_type: track.codec().capability.mime_type.clone(),
                };
                tracing::debug!(target: "transport", track = %info.id, mime = %info.mime_type, "remote track added");
                let _ = events.send(TransportEvent::VideoTrack(info));
                tokio::spawn(async move {
                    loop {
                        match track.read_rtp().await {
                            Ok((packet, _)) => {
                                let consumer = sink.lock().unwrap().clone();
                                if let Some(consumer) = consumer {
                                    consumer.on_rtp(packet.payload.clone(), packet.header.timestamp);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                });
            })
        }));
    }

    fn guard_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(setup_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(setup_error)?;

    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(3)),
        Some(Duration::from_secs(10)),
        Some(Duration::from_millis(500)),
    );

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting)
        .build())
}

fn setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn map_peer_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    match state {
        RTCIceConnectionState::New => Some(IceState::New),
        RTCIceConnectionState::Checking => Some(IceState::Checking),
        RTCIceConnectionState::Connected => Some(IceState::Connected),
        RTCIceConnectionState::Completed => Some(IceState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceState::Failed),
        RTCIceConnectionState::Closed => Some(IceState::Closed),
        RTCIceConnectionState::Unspecified => None,
    }
}

/// Wire a channel's callbacks and its outbound writer task, then record it.
fn register_channel(
    dc: Arc<RTCDataChannel>,
    reliability: ChannelReliability,
    channels: &Arc<Mutex<HashMap<String, ChannelEntry>>>,
    events: &EventSink,
) {
    let label = dc.label().to_string();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_DEPTH);

    // Record the channel before wiring callbacks so an early on_open finds
    // its entry.
    channels.lock().unwrap().insert(
        label.clone(),
        ChannelEntry {
            state: ChannelState::Opening,
            reliability,
            outbound: outbound_tx,
        },
    );

    {
        let channels = channels.clone();
        let events = events.clone();
        let label = label.clone();
        dc.on_open(Box::new(move || {
            let channels = channels.clone();
            let events = events.clone();
            let label = label.clone();
            Box::pin(async move {
                if let Some(entry) = channels.lock().unwrap().get_mut(&label) {
                    entry.state = ChannelState::Open;
                }
                let _ = events.send(TransportEvent::ChannelOpen { label });
            })
        }));
    }

    {
        let channels = channels.clone();
        let events = events.clone();
        let label = label.clone();
        dc.on_close(Box::new(move || {
            let channels = channels.clone();
            let events = events.clone();
            let label = label.clone();
            Box::pin(async move {
                if let Some(entry) = channels.lock().unwrap().get_mut(&label) {
                    entry.state = ChannelState::Closed;
                }
                let _ = events.send(TransportEvent::ChannelClose { label });
            })
        }));
    }

    {
        let events = events.clone();
        let label = label.clone();
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            let events = events.clone();
            let label = label.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::Message {
                    label,
                    payload: message.data,
                });
            })
        }));
    }

    {
        let events = events.clone();
        let label = label.clone();
        dc.on_error(Box::new(move |err| {
            let events = events.clone();
            let label = label.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::Error {
                    reason: format!("channel {label}: {err}"),
                });
            })
        }));
    }

    // Writer task: the only place that touches dc.send, so callers never
    // block on the transport's internal worker.
    tokio::spawn(async move {
        while let Some(payload) = outbound_rx.recv().await {
            if let Err(err) = dc.send(&payload).await {
                tracing::debug!(target: "transport", channel = %label, error = %err, "outbound write failed, stopping writer");
                break;
            }
        }
    });
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn create_offer(&self) -> Result<(), TransportError> {
        self.guard_open()?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))?;
        let _ = self.events.send(TransportEvent::LocalSdp {
            kind: SdpKind::Offer,
            sdp,
        });
        Ok(())
    }

    async fn create_answer(&self) -> Result<(), TransportError> {
        self.guard_open()?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))?;
        let _ = self.events.send(TransportEvent::LocalSdp {
            kind: SdpKind::Answer,
            sdp,
        });
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), TransportError> {
        self.guard_open()?;
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|err| TransportError::BadSdp(err.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: &CandidateInit) -> Result<(), TransportError> {
        self.guard_open()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: Some(candidate.sdp_mid.clone()),
            sdp_mline_index: Some(candidate.sdp_mline_index as u16),
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| TransportError::BadCandidate(err.to_string()))
    }

    async fn open_data_channel(
        &self,
        label: &str,
        reliability: ChannelReliability,
    ) -> Result<(), TransportError> {
        self.guard_open()?;
        let (ordered, max_retransmits) = reliability.sctp_params();
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            max_retransmits,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(setup_error)?;
        register_channel(dc, reliability, &self.channels, &self.events);
        Ok(())
    }

    fn send(&self, label: &str, payload: Bytes) -> Result<(), TransportError> {
        let channels = self.channels.lock().unwrap();
        let entry = channels
            .get(label)
            .ok_or_else(|| TransportError::ChannelNotOpen(label.to_string()))?;
        if entry.state != ChannelState::Open {
            return Err(TransportError::ChannelNotOpen(label.to_string()));
        }
        match entry.outbound.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => match entry.reliability {
                ChannelReliability::ReliableOrdered => {
                    Err(TransportError::Backpressured(label.to_string()))
                }
                // Loss-tolerant mode: a full queue means the message is
                // dropped, which the contract allows.
                ChannelReliability::UnreliableUnordered => Ok(()),
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TransportError::ChannelNotOpen(label.to_string()))
            }
        }
    }

    fn channel_state(&self, label: &str) -> Option<ChannelState> {
        self.channels.lock().unwrap().get(label).map(|e| e.state)
    }

    fn attach_video_sink(&self, sink: Arc<dyn VideoSink>) {
        *self.video_sink.lock().unwrap() = Some(sink);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut channels = self.channels.lock().unwrap();
            for entry in channels.values_mut() {
                entry.state = ChannelState::Closed;
            }
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target: "transport", error = %err, "peer connection close reported an error");
        }
    }
}

/// Factory handed to the manager on production nodes.
pub struct WebRtcFactory {
    config: WebRtcConfig,
}

impl WebRtcFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        _peer: &PeerId,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = WebRtcTransport::connect(&self.config, events).await?;
        Ok(transport as Arc<dyn Transport>)
    }
}
