//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - Connection lifecycle with identity handshake headers
//! - Typed send helpers for every session request
//! - Server events delivered on an mpsc channel
//! - A bounded queue of edits made while disconnected, replayed on the
//!   next join of the same document

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::ids::{now_millis, DocumentId, UserId};
use crate::presence::SelectionRange;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, WireCodec};
use crate::server::{USER_ID_HEADER, USER_NAME_HEADER};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Message(ServerMessage),
}

/// Edits made while disconnected.
pub struct PendingUpdates {
    queue: VecDeque<(DocumentId, Vec<u8>)>,
    max_size: usize,
}

impl PendingUpdates {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns false when the queue is full.
    pub fn enqueue(&mut self, document_id: DocumentId, delta: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((document_id, delta));
        true
    }

    /// Remove and return the queued deltas of one document, oldest first.
    pub fn take(&mut self, document_id: &DocumentId) -> Vec<Vec<u8>> {
        let mut taken = Vec::new();
        self.queue.retain(|(doc, delta)| {
            if doc == document_id {
                taken.push(delta.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|(_, d)| d.len()).sum()
    }
}

/// The sync client.
pub struct SyncClient {
    user_id: UserId,
    display_name: String,
    server_url: String,
    codec: WireCodec,

    state: Arc<RwLock<ConnectionState>>,
    pending: Arc<Mutex<PendingUpdates>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,

    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            server_url: server_url.into(),
            codec: WireCodec::Binary,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            pending: Arc::new(Mutex::new(PendingUpdates::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Use JSON text frames instead of bincode binary frames.
    pub fn with_codec(mut self, codec: WireCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let request = self.handshake_request();
        let ws_stream = match request {
            Ok(request) => tokio_tungstenite::connect_async(request).await.map(|(ws, _)| ws),
            Err(e) => Err(e),
        };
        let ws_stream = match ws_stream {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("Connecting to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: encode outgoing requests with the chosen codec
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
        let codec = self.codec;
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let frame = match encode_frame(codec, &msg) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("Failed to encode {msg:?}: {e}");
                        continue;
                    }
                };
                if ws_writer.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode server events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let decoded = match frame {
                    Ok(Message::Binary(data)) => WireCodec::Binary.decode::<ServerMessage>(&data),
                    Ok(Message::Text(text)) => {
                        WireCodec::Json.decode::<ServerMessage>(text.as_str().as_bytes())
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match decoded {
                    Ok(msg) => {
                        if event_tx.send(ClientEvent::Message(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    fn handshake_request(
        &self,
    ) -> Result<
        tokio_tungstenite::tungstenite::handshake::client::Request,
        tokio_tungstenite::tungstenite::Error,
    > {
        let mut request = self.server_url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(USER_ID_HEADER, HeaderValue::from_str(self.user_id.as_str())?);
        headers.insert(USER_NAME_HEADER, HeaderValue::from_str(&self.display_name)?);
        Ok(request)
    }

    /// Close the connection. Queued outgoing messages are still written.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Join a document, then replay edits queued for it while offline.
    pub async fn join(&self, document_id: impl Into<DocumentId>) -> Result<(), ProtocolError> {
        let document_id = document_id.into();
        self.send(ClientMessage::Join {
            document_id: document_id.clone(),
        })
        .await?;

        let queued = self.pending.lock().await.take(&document_id);
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates for {document_id}", queued.len());
        }
        for delta in queued {
            self.send(ClientMessage::Update {
                document_id: document_id.clone(),
                delta,
            })
            .await?;
        }
        Ok(())
    }

    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Leave {}).await
    }

    /// Send a Yrs v1 update. While disconnected the update is queued.
    pub async fn send_update(
        &self,
        document_id: impl Into<DocumentId>,
        delta: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let document_id = document_id.into();
        if *self.state.read().await != ConnectionState::Connected || self.outgoing_tx.is_none() {
            let mut pending = self.pending.lock().await;
            if !pending.enqueue(document_id, delta) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }
        self.send(ClientMessage::Update { document_id, delta }).await
    }

    /// Cursor updates are dropped while disconnected.
    pub async fn send_cursor(
        &self,
        cursor: Option<u64>,
        selection: Option<SelectionRange>,
    ) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(ClientMessage::Cursor { cursor, selection }).await
    }

    pub async fn request_collaborators(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::GetCollaborators {}).await
    }

    pub async fn save(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Save {}).await
    }

    /// Ask for what the server has beyond `state_vector`, or everything.
    pub async fn resync(&self, state_vector: Option<Vec<u8>>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Resync { state_vector }).await
    }

    pub async fn comment(
        &self,
        text: impl Into<String>,
        position: Option<u64>,
    ) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Comment {
            text: text.into(),
            position,
        })
        .await
    }

    pub async fn lock(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Lock {}).await
    }

    pub async fn unlock(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Unlock {}).await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping {
            timestamp: now_millis(),
        })
        .await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn encode_frame(codec: WireCodec, msg: &ClientMessage) -> Result<Message, ProtocolError> {
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
