//! Per-socket transport adapter.
//!
//! A [`Connection`] is the manager-side view of one websocket. The socket's
//! reader and writer halves live in their own tasks; the connection only
//! holds the outbound queue feeding the writer and the manager's event queue,
//! which is where its "closed" notification is delivered.

use std::{
    fmt,
    time::{Duration, Instant},
};

use roost_types::{CloseCode, ServerFrame};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::manager::Event;

/// Manager-generated socket key. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

/// Instructions for a socket's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized JSON frame
    Text(String),
    /// Send a close frame and stop writing
    Close { code: u16, reason: String },
}

pub struct Connection {
    id: SocketId,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<Event>,
    last_activity: Instant,
    client_id: Option<String>,
    closing: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("closing", &self.closing)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(
        id: SocketId,
        outbound: mpsc::UnboundedSender<Outbound>,
        events: mpsc::UnboundedSender<Event>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            outbound,
            events,
            last_activity: now,
            client_id: None,
            closing: false,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn set_client_id(&mut self, client_id: Option<String>) {
        self.client_id = client_id;
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    /// Whether `close` has been requested. A closing connection drops
    /// inbound frames and outbound sends.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Record activity and parse an inbound frame.
    ///
    /// Returns `None` if the connection is closing or the frame is not
    /// JSON, in which case the connection is closed with
    /// [`CloseCode::BadFrameFormat`].
    pub fn on_data(&mut self, raw: &[u8], now: Instant) -> Option<JsonValue> {
        if self.closing {
            return None;
        }
        self.last_activity = now;
        match serde_json::from_slice(raw) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!(socket = %self.id, error = %e, "Unparseable frame");
                self.close(CloseCode::BadFrameFormat, CloseCode::BadFrameFormat.reason());
                None
            }
        }
    }

    /// Serialize and queue a frame. There is no backpressure; callers do
    /// their own flow control.
    pub fn send(&self, frame: &ServerFrame) {
        if self.closing {
            return;
        }
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(socket = %self.id, error = %e, "Failed to serialize frame");
                return;
            }
        };
        // The writer may already be gone; its close notification is on the way.
        let _ = self.outbound.send(Outbound::Text(text));
    }

    /// Request shutdown. The manager receives the closed notification
    /// through its event queue, after the current event finishes, no matter
    /// when the transport itself reports the close.
    pub fn close(&mut self, code: CloseCode, reason: &str) {
        if self.closing {
            return;
        }
        self.closing = true;
        debug!(socket = %self.id, code = code.code(), reason, "Closing socket");
        let _ = self.outbound.send(Outbound::Close {
            code: code.code(),
            reason: reason.to_string(),
        });
        let _ = self.events.send(Event::Closed { socket: self.id });
    }
}
