//! Signaling transport
//!
//! WebSocket client connection to the signaling relay. The core only sees
//! a message-in/message-out channel with connect/disconnect primitives;
//! frame parsing and the outbound writer queue live here.

use super::SignalingMessage;
use crate::session::SessionError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Duplex signaling channel to the relay.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open the relay connection. Replaces any previous connection.
    async fn connect(&self, url: &str) -> Result<(), SessionError>;

    /// Close the relay connection.
    async fn disconnect(&self) -> Result<(), SessionError>;

    /// Queue one message for transmission.
    async fn send(&self, message: &SignalingMessage) -> Result<(), SessionError>;

    /// Subscribe to inbound messages.
    fn subscribe(&self) -> broadcast::Receiver<SignalingMessage>;

    fn is_connected(&self) -> bool;
}

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// WebSocket client implementation of [`SignalingTransport`].
pub struct WebSocketSignaling {
    inbound: broadcast::Sender<SignalingMessage>,
    connection: Mutex<Option<Connection>>,
    connected: Arc<AtomicBool>,
}

impl WebSocketSignaling {
    pub fn new() -> Self {
        let (inbound, _) = broadcast::channel(64);
        Self {
            inbound,
            connection: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for WebSocketSignaling {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingTransport for WebSocketSignaling {
    async fn connect(&self, url: &str) -> Result<(), SessionError> {
        let mut slot = self.connection.lock().await;
        if let Some(previous) = slot.take() {
            previous.reader.abort();
            previous.writer.abort();
        }

        let (ws_stream, _) = connect_async(url).await.map_err(|e| {
            SessionError::TransportUnavailable(format!("Failed to connect to {}: {}", url, e))
        })?;
        info!("Signaling connected to {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if write.send(message).await.is_err() {
                    break;
                }
            }
        });

        let inbound = self.inbound.clone();
        let connected = self.connected.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalingMessage::decode_frame(&text) {
                        Ok(Some(message)) => {
                            let _ = inbound.send(message);
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Dropping malformed signaling frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Signaling connection closed by relay");
                        break;
                    }
                    // Binary, ping and pong frames are not part of the protocol.
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Signaling read error: {}", e);
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        self.connected.store(true, Ordering::SeqCst);
        *slot = Some(Connection {
            outbound: outbound_tx,
            reader,
            writer,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.take() {
            let _ = connection.outbound.send(Message::Close(None));
            connection.reader.abort();
            // The writer drains the close frame and exits once the outbound
            // sender is dropped with the Connection.
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: &SignalingMessage) -> Result<(), SessionError> {
        let json = message.to_json()?;
        let slot = self.connection.lock().await;
        let connection = slot.as_ref().ok_or_else(|| {
            SessionError::TransportUnavailable("signaling transport is not connected".to_string())
        })?;
        if !self.is_connected() {
            return Err(SessionError::TransportUnavailable(
                "signaling connection is closed".to_string(),
            ));
        }
        connection.outbound.send(Message::Text(json)).map_err(|_| {
            SessionError::TransportUnavailable("signaling writer task is gone".to_string())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingMessage> {
        self.inbound.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_without_connection_fails() {
        let transport = WebSocketSignaling::new();
        assert!(!transport.is_connected());
        let result = transport
            .send(&SignalingMessage::heartbeat("s-1", 1))
            .await;
        assert!(matches!(
            result,
            Err(SessionError::TransportUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let transport = WebSocketSignaling::new();
        assert!(transport.disconnect().await.is_ok());
        assert!(transport.disconnect().await.is_ok());
    }
}
