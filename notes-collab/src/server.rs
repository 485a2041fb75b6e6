//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Editor A ──┐                        ┌── SessionRegistry (doc id → members)
//!            ├── connection task ─────┤
//! Editor B ──┘   (one per socket)     ├── BroadcastRelay ──► outbound queues
//!                       │             │
//!                       ▼             └── PersistenceDebouncer ──► DocumentStore
//!                LifecycleManager                                  (memory / RocksDB)
//! ```
//!
//! Each connection task selects over inbound frames and its own outbound
//! queue. Everything shared lives behind the [`LifecycleManager`].

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;

use crate::debounce::{PersistenceDebouncer, DEFAULT_SAVE_DELAY};
use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleManager, DEFAULT_OUTBOUND_CAPACITY};
use crate::protocol::{ClientMessage, ConnectionId, ServerEvent, ServerMessage};
use crate::registry::SessionRegistry;
use crate::relay::BroadcastRelay;
use crate::store::{DocumentStore, MemoryStore, RocksStore, StoreConfig};

/// How long open connections get to close on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per connection
    pub outbound_capacity: usize,
    /// Quiet interval before pending content is persisted
    pub save_delay: Duration,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4000".to_string(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            save_delay: DEFAULT_SAVE_DELAY,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub messages_dropped: u64,
    pub persisted_writes: u64,
    pub failed_writes: u64,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    lifecycle: Arc<LifecycleManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Create a server, opening RocksDB if `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksStore::open(store_config)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server on top of an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let relay = Arc::new(BroadcastRelay::new(registry.clone()));
        let debouncer = PersistenceDebouncer::new(store, config.save_delay);
        let lifecycle = Arc::new(LifecycleManager::new(
            registry,
            relay,
            debouncer,
            config.outbound_capacity,
        ));

        Self {
            config,
            lifecycle,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Serve forever.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves. Open
    /// connections are then closed and every pending write is flushed.
    pub async fn serve(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        log::info!("Relay server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let lifecycle = self.lifecycle.clone();
                    let stats = self.stats.clone();
                    let stop = stop_rx.clone();
                    connections.spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, lifecycle, stats, stop).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        log::info!("Shutting down, closing {} connections", connections.len());
        let _ = stop_tx.send(true);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!("{} connections did not close in time, aborting", connections.len());
            connections.shutdown().await;
        }

        let failed = self.lifecycle.debouncer().flush_all().await;
        if failed > 0 {
            log::error!("{failed} sessions could not be persisted on shutdown");
        }
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        lifecycle: Arc<LifecycleManager>,
        stats: Arc<RwLock<ServerStats>>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = lifecycle.on_connect().await;
        let conn_id = conn.id;
        log::info!("WebSocket connection {conn_id} established from {addr}");

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                match ClientMessage::decode(&data) {
                                    Ok(client_msg) => {
                                        if let Some(reply) = dispatch(&lifecycle, conn_id, client_msg).await {
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    outbound = conn.events.recv() => {
                        match outbound {
                            Some(msg) => {
                                ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                            }
                            None => break,
                        }
                    }

                    _ = stop.changed() => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            Ok::<(), Error>(())
        }
        .await;

        lifecycle.on_disconnect(conn_id).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.lifecycle.registry().session_count().await;
        stats.messages_dropped = self.lifecycle.relay().stats().messages_dropped;
        let persistence = self.lifecycle.debouncer().stats();
        stats.persisted_writes = persistence.writes;
        stats.failed_writes = persistence.failures;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }
}

/// Apply one inbound message. Returns the direct reply, if any.
async fn dispatch(
    lifecycle: &LifecycleManager,
    conn: ConnectionId,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Join { session_id } => {
            lifecycle.on_join(conn, &session_id).await;
            None
        }
        ClientMessage::Edit { content } => {
            lifecycle.on_edit(conn, &content).await;
            None
        }
        ClientMessage::Leave { session_id } => {
            lifecycle.on_leave(conn, &session_id).await;
            None
        }
        ClientMessage::Save => Some(match lifecycle.on_save(conn).await {
            Some((session_id, Ok(_))) => ServerMessage::session(session_id, ServerEvent::Saved),
            Some((session_id, Err(e))) => ServerMessage::session(
                session_id,
                ServerEvent::SaveFailed {
                    reason: e.to_string(),
                },
            ),
            None => ServerMessage::direct(ServerEvent::SaveFailed {
                reason: "not in a session".to_string(),
            }),
        }),
        ClientMessage::Ping => Some(ServerMessage::direct(ServerEvent::Pong)),
        ClientMessage::Create { title } => Some(match lifecycle.on_create(&title).await {
            Ok(document) => ServerMessage::direct(ServerEvent::Created(document)),
            Err(e) => ServerMessage::direct(ServerEvent::RequestFailed {
                reason: e.to_string(),
            }),
        }),
        ClientMessage::Open { session_id } => Some(match lifecycle.on_open(&session_id).await {
            Ok(document) => ServerMessage::session(session_id, ServerEvent::Opened(document)),
            Err(e) => ServerMessage::session(
                session_id,
                ServerEvent::RequestFailed {
                    reason: e.to_string(),
                },
            ),
        }),
    }
}
