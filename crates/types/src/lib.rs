//! Shared domain and wire types for Roost.
//!
//! Messages are identified by a store-assigned, strictly increasing
//! [`MessageId`]. That id never leaves the server in raw form: before a
//! message is written to a client socket it is turned into a
//! [`SealedMessage`] whose `id` is an opaque cursor string.

use serde::{Deserialize, Serialize};

pub mod protocol;

pub use protocol::{
    AuthRequest, ClientFrameError, CloseCode, CloseTailRequest, Command, ExtendTailRequest,
    NewTailRequest, ServerFrame, TailId,
};

/// Store-assigned message identifier. Totally ordered, never reused.
pub type MessageId = u64;

/// Numeric user identifier assigned by the user table.
pub type UserId = i64;

/// Body and header fields of a zephyr notice, without its identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub class: String,
    pub instance: String,
    pub sender: String,
    pub recipient: String,
    #[serde(default)]
    pub realm: String,
    #[serde(default)]
    pub opcode: String,
    #[serde(default)]
    pub signature: String,
    /// Notice body
    pub message: String,
    /// Sender-supplied timestamp (milliseconds since epoch)
    pub time: i64,
    /// Time the bridge received the notice (milliseconds since epoch)
    pub receive_time: i64,
    /// Zephyr authentication status (1 authentic, 0 unauthenticated, -1 failed)
    #[serde(default)]
    pub auth: i8,
}

/// A durable message as returned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(flatten)]
    pub record: MessageRecord,
}

impl Message {
    /// Replace the raw identifier with an external cursor.
    pub fn seal(&self, cursor: String) -> SealedMessage {
        SealedMessage {
            id: cursor,
            record: self.record.clone(),
        }
    }
}

/// A message in the form clients see it: the id is an opaque cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    pub id: String,
    #[serde(flatten)]
    pub record: MessageRecord,
}

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
}

/// A subscription triple. A `None` instance subscribes to every instance of
/// the class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub class: String,
    pub instance: Option<String>,
    pub recipient: String,
}

impl Subscription {
    pub fn new(
        class: impl Into<String>,
        instance: Option<String>,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            class: class.into(),
            instance,
            recipient: recipient.into(),
        }
    }

    /// Whether a message addressed to `(class, instance, recipient)` falls
    /// under this subscription. Class and instance compare case-insensitively.
    pub fn covers(&self, record: &MessageRecord) -> bool {
        downcase(&self.class) == downcase(&record.class)
            && self.recipient == record.recipient
            && self
                .instance
                .as_deref()
                .map(|inst| downcase(inst) == downcase(&record.instance))
                .unwrap_or(true)
    }
}

/// Zephyr class and instance names are case-insensitive.
pub fn downcase(value: &str) -> String {
    value.to_lowercase()
}
