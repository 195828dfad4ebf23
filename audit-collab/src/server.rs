//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws frame   ┌───────────────┐        ┌──────────────────────┐
//!             ├───────────► │ connection    │ ─────► │ SessionRouter        │
//! Client B ──┘  (per conn)  │ task          │        │  └─ Collaboration-   │
//!                           │  ├─ reader    │ ◄───── │     Service          │
//!                           │  └─ outbox    │ outbox │      ├─ replicas     │
//!                           └───────────────┘        │      ├─ presence     │
//!                                                    │      └─ gateway ─────┼──► RocksDB
//!                     prune task (every N s) ──────► │                      │    / memory
//!                                                    └──────────────────────┘
//! ```
//!
//! The upstream proxy authenticates users and passes their identity in the
//! `x-user-id` and `x-user-name` handshake headers. A handshake without a
//! user id is refused with 401.
//!
//! Binary frames carry bincode, text frames carry JSON. Replies use the
//! encoding of the connection's most recent inbound frame.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::outbox;
use crate::ids::{ConnectionId, UserId};
use crate::protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage, WireCodec};
use crate::service::{CollabConfig, CollaborationService};
use crate::session::{AllowAll, Authorizer, SessionRouter};
use crate::storage::{DocumentStore, MemoryGateway, RocksGateway, StoreConfig, StoreError};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";
/// Environment variable that overrides [`ServerConfig::bind_addr`].
pub const BIND_ENV: &str = "AUDIT_COLLAB_BIND";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub collab: CollabConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            collab: CollabConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read a JSON config file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BoxError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Apply `AUDIT_COLLAB_BIND` if set.
    pub fn with_env_overrides(self) -> Self {
        self.override_bind(std::env::var(BIND_ENV).ok())
    }

    fn override_bind(mut self, bind_addr: Option<String>) -> Self {
        if let Some(addr) = bind_addr.filter(|a| !a.trim().is_empty()) {
            self.bind_addr = addr;
        }
        self
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    pub active_rooms: usize,
    pub open_documents: usize,
}

/// Aborts the prune task when the server stops serving.
struct PruneTask(JoinHandle<()>);

impl Drop for PruneTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    router: Arc<SessionRouter>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    /// Persistent document store (optional)
    store: Option<Arc<DocumentStore>>,
}

impl SyncServer {
    /// Create a server that lets every user join every document.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        Self::with_authorizer(config, Arc::new(AllowAll))
    }

    pub fn with_authorizer(
        config: ServerConfig,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, StoreError> {
        let (service, store) = match &config.storage_path {
            Some(path) => {
                let store = Arc::new(DocumentStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?);
                let gateway = Arc::new(RocksGateway::new(store.clone()));
                let service =
                    CollaborationService::new(config.collab.clone(), gateway.clone(), gateway);
                (service, Some(store))
            }
            None => {
                let gateway = Arc::new(MemoryGateway::new());
                let service =
                    CollaborationService::new(config.collab.clone(), gateway.clone(), gateway);
                (service, None)
            }
        };

        Ok(Self {
            router: Arc::new(SessionRouter::new(Arc::new(service), authorizer)),
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store,
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let gateway = Arc::new(MemoryGateway::new());
        let service = CollaborationService::new(config.collab.clone(), gateway.clone(), gateway);
        Self {
            router: Arc::new(SessionRouter::new(Arc::new(service), Arc::new(AllowAll))),
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store: None,
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let _prune = self.spawn_prune_task();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let router = self.router.clone();
            let stats = self.stats.clone();
            let capacity = self.config.collab.outbox_capacity;

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, router, stats, capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_prune_task(&self) -> Option<PruneTask> {
        let every = self.config.collab.prune_interval;
        if every.is_zero() {
            return None;
        }
        let router = self.router.clone();
        Some(PruneTask(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                router.prune_inactive().await;
            }
        })))
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        router: Arc<SessionRouter>,
        stats: Arc<RwLock<ServerStats>>,
        capacity: usize,
    ) -> Result<(), BoxError> {
        let mut identity = None;
        let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match identify(req) {
                Some(id) => {
                    identity = Some(id);
                    Ok(resp)
                }
                None => Err(unauthorized()),
            }
        })
        .await;

        let (ws_stream, (user_id, display_name)) = match (handshake, identity) {
            (Ok(ws), Some(identity)) => (ws, identity),
            (result, _) => {
                stats.write().await.rejected_handshakes += 1;
                log::warn!("Rejected handshake from {addr}");
                return result.map(|_| ()).map_err(Into::into);
            }
        };

        let (tx, rx) = outbox(capacity);
        let connection_id = router.connect(user_id, display_name, tx);
        log::info!("WebSocket connection {connection_id} established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::pump(ws_stream, rx, connection_id, &router, &stats).await;

        router.disconnect(connection_id).await;
        stats.write().await.active_connections -= 1;
        log::info!("Connection {connection_id} from {addr} closed");
        result
    }

    /// Move frames between the socket and the router until either side closes.
    async fn pump(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        mut rx: crate::broadcast::OutboxReceiver,
        connection_id: ConnectionId,
        router: &SessionRouter,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut codec = WireCodec::Binary;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            codec = WireCodec::Binary;
                            Self::handle_frame(router, connection_id, codec, &data, stats).await;
                        }
                        Some(Ok(Message::Text(text))) => {
                            codec = WireCodec::Json;
                            Self::handle_frame(router, connection_id, codec, text.as_str().as_bytes(), stats).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::error!("WebSocket error on {connection_id}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                // Outgoing replies and broadcasts
                Some(out) = rx.recv() => {
                    ws_sender.send(encode_frame(codec, &out)?).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_frame(
        router: &SessionRouter,
        connection_id: ConnectionId,
        codec: WireCodec,
        bytes: &[u8],
        stats: &RwLock<ServerStats>,
    ) {
        {
            let mut s = stats.write().await;
            s.total_messages += 1;
            s.total_bytes += bytes.len() as u64;
        }

        match codec.decode::<ClientMessage>(bytes) {
            Ok(msg) => {
                // Failures were already reported to the client
                let _ = router.dispatch(connection_id, msg).await;
            }
            Err(e) => {
                stats.write().await.malformed_messages += 1;
                log::warn!("Failed to decode message from {connection_id}: {e}");
                router.reply(
                    connection_id,
                    ServerMessage::error(ErrorCode::MalformedMessage, e.to_string()),
                );
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.router.rooms().room_count();
        stats.open_documents = self.router.service().replicas().resident_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.store.as_ref()
    }
}

/// User id and display name from the handshake headers.
fn identify(req: &Request) -> Option<(UserId, String)> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let user_id = header(USER_ID_HEADER)?;
    let display_name = header(USER_NAME_HEADER).unwrap_or(user_id);
    Some((UserId::from(user_id), display_name.to_string()))
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("missing {USER_ID_HEADER} header")));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

fn encode_frame(codec: WireCodec, msg: &ServerMessage) -> Result<Message, ProtocolError> {
    let bytes = codec.encode(msg)?;
    Ok(match codec {
        WireCodec::Binary => Message::Binary(bytes.into()),
        WireCodec::Json => {
            let text = String::from_utf8(bytes)
                .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
            Message::Text(text.into())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert!(config.storage_path.is_none());
        assert_eq!(config.collab, CollabConfig::default());
    }

    #[test]
    fn test_server_config_from_json() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "bind_addr": "0.0.0.0:7000",
                "storage_path": "/var/lib/audit-collab",
                "collab": { "autosave_interval": 15, "presence_timeout": 120 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/audit-collab")));
        assert_eq!(config.collab.autosave_interval, Duration::from_secs(15));
        assert_eq!(config.collab.presence_timeout, Duration::from_secs(120));
        assert_eq!(config.collab.outbox_capacity, 256);
    }

    #[test]
    fn test_server_config_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(&path, r#"{"bind_addr": "127.0.0.1:0"}"#).unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:0");
        assert!(ServerConfig::load(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_bind_override() {
        let config = ServerConfig::default().override_bind(Some("10.0.0.1:80".into()));
        assert_eq!(config.bind_addr, "10.0.0.1:80");

        let config = ServerConfig::default().override_bind(Some("  ".into()));
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
    }

    #[test]
    fn test_identify_from_headers() {
        let req = Request::builder()
            .uri("/")
            .header(USER_ID_HEADER, "u-17")
            .header(USER_NAME_HEADER, "Dana Reyes")
            .body(())
            .unwrap();
        assert_eq!(
            identify(&req),
            Some((UserId::from("u-17"), "Dana Reyes".to_string()))
        );

        let req = Request::builder()
            .uri("/")
            .header(USER_ID_HEADER, "u-17")
            .body(())
            .unwrap();
        assert_eq!(identify(&req), Some((UserId::from("u-17"), "u-17".to_string())));

        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(identify(&req), None);
    }

    #[test]
    fn test_unauthorized_response() {
        let response = unauthorized();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_json_frames_are_text() {
        let frame = encode_frame(WireCodec::Json, &ServerMessage::Pong { timestamp: 1 }).unwrap();
        assert!(matches!(frame, Message::Text(_)));
        let frame = encode_frame(WireCodec::Binary, &ServerMessage::Pong { timestamp: 1 }).unwrap();
        assert!(matches!(frame, Message::Binary(_)));
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.store().is_none());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert!(server.store().is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
    }
}
