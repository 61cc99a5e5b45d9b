//! WebSocket link handling and the routing core.
//!
//! A link is authenticated before it enters the directory; every inbound
//! frame is validated, then routed under the rules in `route_envelope`.
//! Delivery is best-effort per link: a dedicated writer task owns the
//! socket's sink, so routing never blocks on a slow peer.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use signal_proto::{EnvelopeError, PeerId, SignalEnvelope, SignalPayload};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::authenticate;
use crate::directory::{Directory, PeerLink, RegisterOutcome};

#[derive(Clone)]
pub struct RelayState {
    pub directory: Arc<Directory>,
    pub jwt_secret: Arc<String>,
}

pub async fn ws_handler(
    State(state): State<RelayState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").cloned().unwrap_or_default();
    // Authentication happens after the upgrade so a rejected peer still
    // receives an error envelope with the reason before the close.
    ws.on_upgrade(move |socket| handle_link(socket, state, token))
}

async fn handle_link(socket: WebSocket, state: RelayState, token: String) {
    let (mut sink, mut stream) = socket.split();

    let peer_id = match authenticate(&token, &state.jwt_secret) {
        Ok(id) => id,
        Err(err) => {
            info!(target: "relay", error = %err, "rejecting unauthenticated link");
            let reply = SignalEnvelope::relay_error("", "Authentication failed");
            let _ = sink.send(Message::Text(reply.encode())).await;
            let _ = sink.close().await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<SignalEnvelope>();
    let link = match state.directory.register(peer_id.clone(), tx) {
        RegisterOutcome::Registered(link) => link,
        RegisterOutcome::Displaced(link, displaced) => {
            info!(target: "relay", peer = %peer_id, "displacing previous link");
            displaced.deliver(SignalEnvelope::relay_error(
                peer_id.clone(),
                "Displaced by new link",
            ));
            link
        }
        RegisterOutcome::Occupied => {
            warn!(target: "relay", peer = %peer_id, "identity already registered, rejecting link");
            let reply = SignalEnvelope::relay_error(peer_id, "Identity already registered");
            let _ = sink.send(Message::Text(reply.encode())).await;
            let _ = sink.close().await;
            return;
        }
    };

    info!(target: "relay", peer = %peer_id, "link established");

    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if sink.send(Message::Text(envelope.encode())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => route_frame(&state.directory, &peer_id, &link, &text),
            Ok(Message::Binary(data)) => {
                if let Ok(text) = std::str::from_utf8(&data) {
                    route_frame(&state.directory, &peer_id, &link, text);
                } else {
                    debug!(target: "relay", peer = %peer_id, "dropping non-utf8 binary frame");
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(target: "relay", peer = %peer_id, error = %err, "link read error");
                break;
            }
        }
    }

    if state.directory.remove(&peer_id, link.link_id) {
        depart(&state.directory, &peer_id);
    }
    writer.abort();
    info!(target: "relay", peer = %peer_id, "link closed");
}

/// Decode one frame and feed it to the router. Invalid envelopes never
/// reach routing; unknown types are answered per the protocol.
fn route_frame(directory: &Directory, sender: &PeerId, link: &Arc<PeerLink>, raw: &str) {
    match SignalEnvelope::decode(raw) {
        Ok(envelope) => route_envelope(directory, sender, link, envelope),
        Err(EnvelopeError::UnknownType { kind, .. }) => {
            debug!(target: "relay", peer = %sender, kind = %kind, "unknown message type");
            link.deliver(SignalEnvelope::relay_error(
                sender.clone(),
                "Unknown message type",
            ));
        }
        Err(err) => {
            warn!(target: "relay", peer = %sender, error = %err, "rejecting malformed envelope");
        }
    }
}

/// The routing rules. `sender` is the authenticated identity of the link
/// the envelope arrived on.
pub fn route_envelope(
    directory: &Directory,
    sender: &PeerId,
    link: &Arc<PeerLink>,
    envelope: SignalEnvelope,
) {
    if envelope.from != *sender {
        warn!(
            target: "relay",
            peer = %sender,
            claimed = %envelope.from,
            "rejecting envelope with forged sender"
        );
        return;
    }

    match &envelope.payload {
        SignalPayload::Join { target } => {
            *link.partner.lock().unwrap() = Some(target.clone());
            match directory.get(target) {
                Some(target_link) => {
                    debug!(target: "relay", from = %sender, to = %target, "join");
                    target_link.deliver(SignalEnvelope::new(
                        sender.clone(),
                        target.clone(),
                        SignalPayload::JoinRequest,
                    ));
                }
                None => {
                    *link.partner.lock().unwrap() = None;
                    link.deliver(SignalEnvelope::relay_error(
                        sender.clone(),
                        "Target not found",
                    ));
                }
            }
        }
        SignalPayload::Leave { reason } => {
            let partner = link.partner.lock().unwrap().take();
            if let Some(partner) = partner {
                if let Some(partner_link) = directory.get(&partner) {
                    partner_link.deliver(SignalEnvelope::new(
                        sender.clone(),
                        partner.clone(),
                        SignalPayload::Leave {
                            reason: reason.clone(),
                        },
                    ));
                }
            }
        }
        // Heartbeats ride the relay when the dedicated channel is not
        // open, so they forward like the negotiation messages.
        SignalPayload::Offer { .. }
        | SignalPayload::Answer { .. }
        | SignalPayload::Candidate(_)
        | SignalPayload::Heartbeat { .. } => {
            if envelope.to.is_empty() {
                link.deliver(SignalEnvelope::relay_error(
                    sender.clone(),
                    "Recipient not found",
                ));
                return;
            }
            match directory.get(&envelope.to) {
                Some(target_link) => target_link.deliver(envelope),
                None => {
                    link.deliver(SignalEnvelope::relay_error(
                        sender.clone(),
                        "Recipient not found",
                    ));
                }
            }
        }
        SignalPayload::JoinRequest | SignalPayload::Error { .. } => {
            link.deliver(SignalEnvelope::relay_error(
                sender.clone(),
                "Unknown message type",
            ));
        }
    }
}

/// Departure: tell every peer partnered with `id` that it is gone.
pub fn depart(directory: &Directory, id: &PeerId) {
    for (partner_id, partner_link) in directory.partners_of(id) {
        debug!(target: "relay", departed = %id, notifying = %partner_id, "departure");
        partner_link.deliver(SignalEnvelope::new(
            id.clone(),
            partner_id.clone(),
            SignalPayload::Leave {
                reason: "Peer disconnected".to_string(),
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DuplicatePolicy;
    use signal_proto::{CandidateInit, SignalKind};

    struct TestPeer {
        id: PeerId,
        link: Arc<PeerLink>,
        rx: mpsc::UnboundedReceiver<SignalEnvelope>,
    }

    fn join_directory(directory: &Directory, id: &str) -> TestPeer {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = match directory.register(PeerId::from(id), tx) {
            RegisterOutcome::Registered(link) => link,
            _ => panic!("registration failed for {id}"),
        };
        TestPeer {
            id: PeerId::from(id),
            link,
            rx,
        }
    }

    fn offer(from: &str, to: &str) -> SignalEnvelope {
        SignalEnvelope::new(
            from,
            to,
            SignalPayload::Offer {
                sdp: "v=0".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn join_notifies_present_target() {
        let directory = Directory::new(DuplicatePolicy::RejectNew);
        let cockpit = join_directory(&directory, "c");
        let mut vehicle = join_directory(&directory, "v");

        route_envelope(
            &directory,
            &cockpit.id,
            &cockpit.link,
            SignalEnvelope::new(
                "c",
                "",
                SignalPayload::Join {
                    target: PeerId::from("v"),
                },
            ),
        );

        let delivered = vehicle.rx.try_recv().unwrap();
        assert_eq!(delivered.kind(), SignalKind::JoinRequest);
        assert_eq!(delivered.from, PeerId::from("c"));
        assert_eq!(
            cockpit.link.partner.lock().unwrap().as_ref(),
            Some(&PeerId::from("v"))
        );
    }

    #[tokio::test]
    async fn join_for_absent_target_reports_error_and_clears_partner() {
        let directory = Directory::new(DuplicatePolicy::RejectNew);
        let mut cockpit = join_directory(&directory, "c");

        route_envelope(
            &directory,
            &cockpit.id,
            &cockpit.link,
            SignalEnvelope::new(
                "c",
                "",
                SignalPayload::Join {
                    target: PeerId::from("ghost"),
                },
            ),
        );

        let reply = cockpit.rx.try_recv().unwrap();
        assert_eq!(
            reply.payload,
            SignalPayload::Error {
                reason: "Target not found".to_string()
            }
        );
        assert!(cockpit.link.partner.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn negotiation_messages_forward_verbatim() {
        let directory = Directory::new(DuplicatePolicy::RejectNew);
        let cockpit = join_directory(&directory, "c");
        let mut vehicle = join_directory(&directory, "v");

        let candidate = SignalEnvelope::new(
            "c",
            "v",
            SignalPayload::Candidate(CandidateInit {
                candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".into(),
                sdp_mid: "0".into(),
                sdp_mline_index: 0,
            }),
        );
        route_envelope(&directory, &cockpit.id, &cockpit.link, candidate.clone());
        assert_eq!(vehicle.rx.try_recv().unwrap(), candidate);

        let heartbeat =
            SignalEnvelope::new("c", "v", SignalPayload::Heartbeat { nonce: 3 });
        route_envelope(&directory, &cockpit.id, &cockpit.link, heartbeat.clone());
        assert_eq!(vehicle.rx.try_recv().unwrap(), heartbeat);
    }

    #[tokio::test]
    async fn unknown_recipient_reports_error() {
        let directory = Directory::new(DuplicatePolicy::RejectNew);
        let mut cockpit = join_directory(&directory, "c");

        route_envelope(&directory, &cockpit.id, &cockpit.link, offer("c", "ghost"));
        let reply = cockpit.rx.try_recv().unwrap();
        assert_eq!(
            reply.payload,
            SignalPayload::Error {
                reason: "Recipient not found".to_string()
            }
        );
    }

    #[tokio::test]
    async fn forged_sender_is_dropped() {
        let directory = Directory::new(DuplicatePolicy::RejectNew);
        let cockpit = join_directory(&directory, "c");
        let mut vehicle = join_directory(&directory, "v");

        route_envelope(&directory, &cockpit.id, &cockpit.link, offer("v", "v"));
        assert!(vehicle.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_sent_relay_kinds_are_answered_with_unknown_type() {
        let directory = Directory::new(DuplicatePolicy::RejectNew);
        let mut cockpit = join_directory(&directory, "c");

        route_envelope(
            &directory,
            &cockpit.id,
            &cockpit.link,
            SignalEnvelope::new("c", "v", SignalPayload::JoinRequest),
        );
        let reply = cockpit.rx.try_recv().unwrap();
        assert_eq!(
            reply.payload,
            SignalPayload::Error {
                reason: "Unknown message type".to_string()
            }
        );
    }

    #[tokio::test]
    async fn leave_reaches_partner_and_departure_notifies_dependents() {
        let directory = Directory::new(DuplicatePolicy::RejectNew);
        let cockpit = join_directory(&directory, "c");
        let mut vehicle = join_directory(&directory, "v");

        route_envelope(
            &directory,
            &cockpit.id,
            &cockpit.link,
            SignalEnvelope::new(
                "c",
                "",
                SignalPayload::Join {
                    target: PeerId::from("v"),
                },
            ),
        );
        vehicle.rx.try_recv().unwrap();

        // Explicit leave goes to the partner and clears the partnership.
        route_envelope(
            &directory,
            &cockpit.id,
            &cockpit.link,
            SignalEnvelope::new(
                "c",
                "",
                SignalPayload::Leave {
                    reason: "operator done".to_string(),
                },
            ),
        );
        let leave = vehicle.rx.try_recv().unwrap();
        assert_eq!(
            leave.payload,
            SignalPayload::Leave {
                reason: "operator done".to_string()
            }
        );

        // Link-drop departure notifies everyone partnered with the peer.
        route_envelope(
            &directory,
            &cockpit.id,
            &cockpit.link,
            SignalEnvelope::new(
                "c",
                "",
                SignalPayload::Join {
                    target: PeerId::from("v"),
                },
            ),
        );
        vehicle.rx.try_recv().unwrap();
        *vehicle.link.partner.lock().unwrap() = Some(PeerId::from("c"));

        assert!(directory.remove(&cockpit.id, cockpit.link.link_id));
        depart(&directory, &cockpit.id);

        let leave = vehicle.rx.try_recv().unwrap();
        assert_eq!(
            leave.payload,
            SignalPayload::Leave {
                reason: "Peer disconnected".to_string()
            }
        );
        assert!(vehicle.link.partner.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_type_frames_get_error_reply() {
        let directory = Directory::new(DuplicatePolicy::RejectNew);
        let mut cockpit = join_directory(&directory, "c");

        route_frame(
            &directory,
            &cockpit.id,
            &cockpit.link,
            r#"{"type":"presence","from":"c","to":""}"#,
        );
        let reply = cockpit.rx.try_recv().unwrap();
        assert_eq!(
            reply.payload,
            SignalPayload::Error {
                reason: "Unknown message type".to_string()
            }
        );

        // Malformed frames are rejected without a reply.
        route_frame(&directory, &cockpit.id, &cockpit.link, "{broken");
        assert!(cockpit.rx.try_recv().is_err());
    }
}
