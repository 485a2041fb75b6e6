//! WebSocket client for talking to the relay.
//!
//! Used by editors (and the integration tests) to join sessions, push
//! content and receive peer events.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::Result;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, SessionId};

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Something arrived from the relay
    Message(ServerMessage),
    /// Connection lost
    Disconnected,
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// The relay client.
pub struct RelayClient {
    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::Sender<Outgoing>,
    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    server_url: String,
}

impl RelayClient {
    /// Connect to the relay and spawn the reader/writer tasks.
    pub async fn connect(server_url: impl Into<String>) -> Result<Self> {
        let server_url = server_url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(server_url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (event_tx, event_rx) = mpsc::channel(256);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Outgoing>(256);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(outgoing) = outgoing_rx.recv().await {
                let result = match outgoing {
                    Outgoing::Frame(data) => ws_writer.send(Message::Binary(data.into())).await,
                    Outgoing::Close => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });

        let _ = event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode server frames into events
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            if event_tx.send(ClientEvent::Message(server_msg)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(Self {
            outgoing_tx,
            event_rx: Some(event_rx),
            server_url,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub async fn join(&self, session_id: impl Into<SessionId>) -> Result<()> {
        self.send(&ClientMessage::join(session_id)).await
    }

    pub async fn edit(&self, content: impl Into<String>) -> Result<()> {
        self.send(&ClientMessage::edit(content)).await
    }

    pub async fn leave(&self, session_id: impl Into<SessionId>) -> Result<()> {
        self.send(&ClientMessage::leave(session_id)).await
    }

    /// Ask the relay to persist the current session now.
    pub async fn save(&self) -> Result<()> {
        self.send(&ClientMessage::Save).await
    }

    /// Ask the relay to create a note; the reply arrives as `Created`.
    pub async fn create(&self, title: impl Into<String>) -> Result<()> {
        self.send(&ClientMessage::create(title)).await
    }

    /// Ask the relay for a note; the reply arrives as `Opened`.
    pub async fn open(&self, session_id: impl Into<SessionId>) -> Result<()> {
        self.send(&ClientMessage::open(session_id)).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.send(&ClientMessage::Ping).await
    }

    /// Send any client message.
    pub async fn send(&self, msg: &ClientMessage) -> Result<()> {
        let encoded = msg.encode()?;
        self.outgoing_tx
            .send(Outgoing::Frame(encoded))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(())
    }

    /// Close the connection gracefully.
    pub async fn close(self) -> Result<()> {
        self.outgoing_tx
            .send(Outgoing::Close)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(())
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
