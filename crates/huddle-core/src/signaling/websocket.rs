use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::errors::{ProtocolError, TransportError};
use crate::signaling::protocol::{Presence, SignalMessage};
use crate::signaling::transport::{SignalingConnector, SignalingLink};

/// Connects to a JSON-over-WebSocket signaling server.
///
/// Room and participant ids are passed both as query parameters and in the
/// initial `join` frame, so the server can resume membership on reconnect.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url).map_err(|e| TransportError::Connect(format!("invalid url: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(TransportError::Connect(format!(
                "unsupported scheme '{other}', expected ws or wss"
            ))),
        }
    }

    pub fn endpoint(&self, presence: &Presence) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("room", presence.room_id.as_str())
            .append_pair("participant", presence.participant_id.as_str());
        url
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, presence: &Presence) -> Result<Box<dyn SignalingLink>, TransportError> {
        let url = self.endpoint(presence);
        tracing::debug!(url = %url.as_str().split('?').next().unwrap_or(""), "opening signaling websocket");
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let mut link = WebSocketLink { stream };
        link.send(&presence.join_message()).await?;
        Ok(Box::new(link))
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SignalingLink for WebSocketLink {
    async fn send(&mut self, message: &SignalMessage) -> Result<(), TransportError> {
        let json = message
            .to_json()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.stream
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<SignalMessage, ProtocolError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(SignalMessage::parse(text.as_str())),
                Ok(Message::Close(frame)) => {
                    tracing::info!("signaling server closed the connection: {frame:?}");
                    return None;
                }
                // Pings are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("signaling websocket error: {e}");
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
