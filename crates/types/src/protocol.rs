//! Socket protocol: JSON text frames tagged by a `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{SealedMessage, Subscription};

/// Client-assigned tail identifier, scoped to one socket. Must be a
/// non-negative integer; anything else closes the socket as a bad tail
/// message.
pub type TailId = u64;

/// Websocket close codes. Values are part of the client contract and must
/// not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    BadFrameFormat,
    AuthMessageExpected,
    BadAuthToken,
    AuthRejected,
    InternalAuthError,
    IdleTimeout,
    InternalQueryError,
    BadTailMessage,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            CloseCode::BadFrameFormat => 4000,
            CloseCode::AuthMessageExpected => 4001,
            CloseCode::BadAuthToken => 4002,
            CloseCode::AuthRejected => 4003,
            CloseCode::InternalAuthError => 4004,
            CloseCode::IdleTimeout => 4005,
            CloseCode::InternalQueryError => 4006,
            CloseCode::BadTailMessage => 4007,
        }
    }

    /// Default human-readable reason sent with the close frame.
    pub fn reason(self) -> &'static str {
        match self {
            CloseCode::BadFrameFormat => "Bad message format",
            CloseCode::AuthMessageExpected => "Auth message expected",
            CloseCode::BadAuthToken => "Bad auth token",
            CloseCode::AuthRejected => "Authentication rejected",
            CloseCode::InternalAuthError | CloseCode::InternalQueryError => "Internal error",
            CloseCode::IdleTimeout => "Idle socket",
            CloseCode::BadTailMessage => "Bad message",
        }
    }
}

/// Frames the server writes to a socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Authentication accepted; tail commands may follow.
    Ready,
    Pong,
    /// A batch of messages for one tail, in strictly increasing id order.
    Messages {
        id: TailId,
        messages: Vec<SealedMessage>,
        #[serde(rename = "isDone")]
        is_done: bool,
    },
    Subscribed {
        subs: Vec<Subscription>,
    },
    Unsubscribed {
        subs: Vec<Subscription>,
    },
}

/// Protocol violations found while interpreting a client frame.
#[derive(Debug, thiserror::Error)]
pub enum ClientFrameError {
    #[error("auth message expected")]
    AuthExpected,

    #[error("auth token must be a string")]
    BadAuthToken,

    #[error("malformed {kind} message: {source}")]
    BadCommand {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientFrameError {
    pub fn close_code(&self) -> CloseCode {
        match self {
            ClientFrameError::AuthExpected => CloseCode::AuthMessageExpected,
            ClientFrameError::BadAuthToken => CloseCode::BadAuthToken,
            ClientFrameError::BadCommand { .. } => CloseCode::BadTailMessage,
        }
    }
}

fn frame_type(frame: &JsonValue) -> Option<&str> {
    frame.get("type").and_then(JsonValue::as_str)
}

/// The first frame on every socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub token: String,
    /// Opaque client-chosen id, used to suppress echoes of the client's own
    /// subscription changes.
    pub client_id: Option<String>,
}

impl AuthRequest {
    pub fn from_frame(frame: &JsonValue) -> Result<Self, ClientFrameError> {
        if frame_type(frame) != Some("auth") {
            return Err(ClientFrameError::AuthExpected);
        }
        let token = match frame.get("token") {
            Some(JsonValue::String(token)) => token.clone(),
            _ => return Err(ClientFrameError::BadAuthToken),
        };
        let client_id = match frame.get("clientId") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(id)) => Some(id.clone()),
            Some(other) => Some(other.to_string()),
        };
        Ok(Self { token, client_id })
    }
}

/// Opens (or replaces) a tail.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTailRequest {
    pub id: TailId,
    /// Cursor to resume after. Absent means the beginning of history.
    #[serde(default)]
    pub start: Option<String>,
    /// Include the message at `start` itself.
    #[serde(default)]
    pub inclusive: Option<bool>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExtendTailRequest {
    pub id: TailId,
    /// Total number of messages the client wants on this tail so far.
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CloseTailRequest {
    pub id: TailId,
}

/// Commands accepted on an authenticated socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    NewTail(NewTailRequest),
    ExtendTail(ExtendTailRequest),
    CloseTail(CloseTailRequest),
    /// Unrecognized `type`; ignored by the server.
    Unknown(Option<String>),
}

impl Command {
    pub fn from_frame(frame: JsonValue) -> Result<Self, ClientFrameError> {
        fn decode<T: serde::de::DeserializeOwned>(
            kind: &str,
            frame: JsonValue,
        ) -> Result<T, ClientFrameError> {
            serde_json::from_value(frame).map_err(|source| ClientFrameError::BadCommand {
                kind: kind.to_string(),
                source,
            })
        }

        match frame_type(&frame) {
            Some("ping") => Ok(Command::Ping),
            Some("new-tail") => decode("new-tail", frame).map(Command::NewTail),
            Some("extend-tail") => decode("extend-tail", frame).map(Command::ExtendTail),
            Some("close-tail") => decode("close-tail", frame).map(Command::CloseTail),
            other => Ok(Command::Unknown(other.map(String::from))),
        }
    }
}
