//! Session protocol messages.
//!
//! Two encodings of the same messages:
//! ```text
//! WebSocket binary frame ── bincode ──┐
//!                                     ├──► ClientMessage / ServerMessage
//! WebSocket text frame   ── JSON ─────┘
//! ```
//!
//! JSON uses kebab-case event names as the outer tag and camelCase fields:
//! `{"join":{"documentId":"D1"}}`. Delta and state vector payloads are raw Yrs
//! v1 bytes in both encodings.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ids::{DocumentId, UserId};
use crate::presence::{PresenceEntry, SelectionRange};
use crate::storage::CommentRecord;

/// Messages a client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        document_id: DocumentId,
    },
    Leave {},
    Update {
        document_id: DocumentId,
        delta: Vec<u8>,
    },
    Cursor {
        cursor: Option<u64>,
        selection: Option<SelectionRange>,
    },
    GetCollaborators {},
    Save {},
    /// Without a state vector the reply carries the full state.
    Resync {
        state_vector: Option<Vec<u8>>,
    },
    Comment {
        text: String,
        position: Option<u64>,
    },
    Lock {},
    Unlock {},
    Ping {
        timestamp: u64,
    },
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Sync {
        document_id: DocumentId,
        /// Full state, or the catch-up diff when `full` is false.
        /// `None` for a document without any changes.
        state: Option<Vec<u8>>,
        full: bool,
        state_vector: Vec<u8>,
        presence: Vec<PresenceEntry>,
    },
    /// `presence` is the document's roster after the join.
    UserJoined {
        document_id: DocumentId,
        user: PresenceEntry,
        presence: Vec<PresenceEntry>,
    },
    /// `presence` is the document's roster after the departure.
    UserLeft {
        document_id: DocumentId,
        user_id: UserId,
        display_name: String,
        presence: Vec<PresenceEntry>,
    },
    Update {
        document_id: DocumentId,
        delta: Vec<u8>,
        origin: UserId,
    },
    Cursor {
        user_id: UserId,
        display_name: String,
        cursor: Option<u64>,
        selection: Option<SelectionRange>,
        color: String,
    },
    Collaborators {
        presence: Vec<PresenceEntry>,
    },
    Saved {
        success: bool,
        /// Milliseconds since the UNIX epoch.
        timestamp: u64,
    },
    Comment {
        comment: CommentRecord,
    },
    LockState {
        document_id: DocumentId,
        holder: Option<UserId>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Pong {
        timestamp: u64,
    },
}

/// Machine-readable error codes carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    Unauthorized,
    NotJoined,
    DocumentMismatch,
    MalformedDelta,
    MalformedMessage,
    DocumentLocked,
    LockConflict,
    LockForbidden,
    CommentRejected,
    /// Messages were dropped for a slow connection; the client should resync.
    ResyncRequired,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::NotJoined => "not-joined",
            Self::DocumentMismatch => "document-mismatch",
            Self::MalformedDelta => "malformed-delta",
            Self::MalformedMessage => "malformed-message",
            Self::DocumentLocked => "document-locked",
            Self::LockConflict => "lock-conflict",
            Self::LockForbidden => "lock-forbidden",
            Self::CommentRejected => "comment-rejected",
            Self::ResyncRequired => "resync-required",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Event name as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync { .. } => "sync",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::Update { .. } => "update",
            Self::Cursor { .. } => "cursor",
            Self::Collaborators { .. } => "collaborators",
            Self::Saved { .. } => "saved",
            Self::Comment { .. } => "comment",
            Self::LockState { .. } => "lock-state",
            Self::Error { .. } => "error",
            Self::Pong { .. } => "pong",
        }
    }
}

/// Frame encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireCodec {
    /// bincode, carried in binary frames
    #[default]
    Binary,
    /// JSON, carried in text frames
    Json,
}

impl WireCodec {
    pub fn encode<T: Serialize>(self, msg: &T) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::Binary => bincode::serde::encode_to_vec(msg, bincode::config::standard())
                .map_err(|e| ProtocolError::SerializationError(e.to_string())),
            Self::Json => {
                serde_json::to_vec(msg).map_err(|e| ProtocolError::SerializationError(e.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, ProtocolError> {
        match self {
            Self::Binary => {
                let (msg, _) =
                    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
                Ok(msg)
            }
            Self::Json => serde_json::from_slice(bytes)
                .map_err(|e| ProtocolError::DeserializationError(e.to_string())),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_json_shape() {
        let msg = ClientMessage::Join {
            document_id: DocumentId::from("D1"),
        };
        let json = String::from_utf8(WireCodec::Json.encode(&msg).unwrap()).unwrap();
        assert_eq!(json, r#"{"join":{"documentId":"D1"}}"#);

        let msg: ClientMessage = WireCodec::Json
            .decode(br#"{"get-collaborators":{}}"#)
            .unwrap();
        assert_eq!(msg, ClientMessage::GetCollaborators {});
    }

    #[test]
    fn test_resync_json_with_and_without_state_vector() {
        let full: ClientMessage = WireCodec::Json
            .decode(br#"{"resync":{"stateVector":null}}"#)
            .unwrap();
        assert_eq!(full, ClientMessage::Resync { state_vector: None });

        let diff: ClientMessage = WireCodec::Json
            .decode(br#"{"resync":{"stateVector":[0]}}"#)
            .unwrap();
        assert_eq!(diff, ClientMessage::Resync { state_vector: Some(vec![0]) });
    }

    #[test]
    fn test_server_json_event_names() {
        let msg = ServerMessage::LockState {
            document_id: DocumentId::from("D1"),
            holder: Some(UserId::from("alice")),
        };
        let json = String::from_utf8(WireCodec::Json.encode(&msg).unwrap()).unwrap();
        assert_eq!(json, r#"{"lock-state":{"documentId":"D1","holder":"alice"}}"#);
        assert_eq!(msg.kind(), "lock-state");

        let err = ServerMessage::error(ErrorCode::DocumentMismatch, "wrong document");
        let json = String::from_utf8(WireCodec::Json.encode(&err).unwrap()).unwrap();
        assert!(json.contains(r#""code":"document-mismatch""#));
    }

    #[test]
    fn test_binary_update_preserves_delta() {
        let delta: Vec<u8> = (0..=255).collect();
        let msg = ClientMessage::Update {
            document_id: DocumentId::from("D1"),
            delta: delta.clone(),
        };
        let bytes = WireCodec::Binary.encode(&msg).unwrap();
        let decoded: ClientMessage = WireCodec::Binary.decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_garbage() {
        let result: Result<ClientMessage, _> = WireCodec::Binary.decode(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtocolError::DeserializationError(_))));

        let result: Result<ClientMessage, _> = WireCodec::Json.decode(br#"{"teleport":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_error_code_strings_match_serde() {
        for code in [ErrorCode::NotJoined, ErrorCode::LockConflict, ErrorCode::Unauthorized] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }
}
