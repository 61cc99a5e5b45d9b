//! Relay link: a framed bidirectional envelope channel over WebSocket.
//!
//! The connector hides the socket behind a pair of channels so the manager
//! (and its tests) never touch the wire directly. A dedicated writer task
//! owns the sink and a reader task owns the stream; both end when either
//! side goes away.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use signal_proto::SignalEnvelope;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::ManagerError;

/// What the link reports upward. Envelopes arrive in wire order; `Closed` is
/// always the last event of a session.
#[derive(Debug)]
pub enum SignalingEvent {
    Envelope(SignalEnvelope),
    Closed { reason: String },
}

/// Live relay link: push envelopes into `outbound`, drain `events`.
pub struct SignalingSession {
    pub outbound: mpsc::UnboundedSender<SignalEnvelope>,
    pub events: mpsc::UnboundedReceiver<SignalingEvent>,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> Result<SignalingSession, ManagerError>;
}

/// Production connector: WebSocket to the relay with the bearer token as a
/// `token` query parameter.
pub struct WsConnector {
    uri: String,
    token: String,
}

impl WsConnector {
    pub fn new(uri: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            token: token.into(),
        }
    }

    fn endpoint(&self) -> Result<Url, ManagerError> {
        let mut url = Url::parse(&self.uri)
            .map_err(|err| ManagerError::Config(format!("invalid signaling uri {}: {err}", self.uri)))?;
        if !self.token.is_empty() {
            url.query_pairs_mut().append_pair("token", &self.token);
        }
        Ok(url)
    }
}

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(&self) -> Result<SignalingSession, ManagerError> {
        let endpoint = self.endpoint()?;
        let (stream, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(|err| ManagerError::Signaling(format!("websocket connect failed: {err}")))?;
        let (mut sink, mut source) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalEnvelope>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SignalingEvent>();

        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                if sink.send(Message::Text(envelope.encode())).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            // A relay that rejects the link sends one error envelope and
            // closes; that reason is the close reason worth reporting.
            let mut relay_error: Option<String> = None;
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&event_tx, text.as_bytes(), &mut relay_error)
                    }
                    Some(Ok(Message::Binary(data))) => {
                        handle_frame(&event_tx, &data, &mut relay_error)
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .or(relay_error)
                            .unwrap_or_else(|| "link closed by relay".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break relay_error.unwrap_or(format!("websocket error: {err}")),
                    None => break relay_error.unwrap_or_else(|| "link closed".to_string()),
                }
            };
            let _ = event_tx.send(SignalingEvent::Closed { reason });
        });

        Ok(SignalingSession {
            outbound: outbound_tx,
            events: event_rx,
        })
    }
}

fn handle_frame(
    events: &mpsc::UnboundedSender<SignalingEvent>,
    raw: &[u8],
    relay_error: &mut Option<String>,
) {
    let Ok(text) = std::str::from_utf8(raw) else {
        tracing::warn!(target: "signaling", "dropping non-utf8 frame");
        return;
    };
    match SignalEnvelope::decode(text) {
        Ok(envelope) => {
            if envelope.from.is_empty() {
                if let signal_proto::SignalPayload::Error { reason } = &envelope.payload {
                    *relay_error = Some(reason.clone());
                }
            }
            let _ = events.send(SignalingEvent::Envelope(envelope));
        }
        Err(err) => {
            tracing::warn!(target: "signaling", error = %err, "dropping undecodable frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_appends_token_query() {
        let connector = WsConnector::new("wss://relay.example/ws", "abc.def.ghi");
        let url = connector.endpoint().unwrap();
        assert_eq!(url.as_str(), "wss://relay.example/ws?token=abc.def.ghi");
    }

    #[test]
    fn endpoint_without_token_is_untouched() {
        let connector = WsConnector::new("ws://127.0.0.1:8080/ws", "");
        assert_eq!(connector.endpoint().unwrap().as_str(), "ws://127.0.0.1:8080/ws");
    }

    #[test]
    fn invalid_uri_is_a_config_error() {
        let connector = WsConnector::new("not a uri", "t");
        assert!(matches!(
            connector.endpoint(),
            Err(ManagerError::Config(_))
        ));
    }
}
