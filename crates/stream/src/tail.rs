//! Tails: flow-controlled cursors over a filtered view of the message stream.
//!
//! A tail moves between three phases:
//!
//! - **Full**: every wanted message has been sent. No query is outstanding
//!   and live messages are not routed to the tail. Raising the credit with
//!   [`Tail::extend`] starts a history query and moves to `Waiting`.
//! - **Waiting**: a history query is outstanding. Live messages that match
//!   are buffered instead of sent, because the query result may or may not
//!   contain them. When the query completes the tail goes back to `Full`,
//!   issues another query (more credit arrived, or the store capped the
//!   result), or hands off to `Streaming`.
//! - **Streaming**: the last query reached the end of history with credit to
//!   spare, so live messages are forwarded as they arrive until the credit
//!   runs out.
//!
//! The handoff from `Waiting` to `Streaming` is where exactly-once delivery is
//! decided: the query result and the live buffer cover overlapping ranges of
//! the same id space, so after sending the result every buffered message at
//! or below the new `last_sent` is dropped and only the remainder is flushed.

use std::mem;

use roost_types::{CloseCode, Message, MessageId, SealedMessage, ServerFrame, TailId};
use tracing::{debug, error};

use crate::{
    connection::Connection,
    cursor::CursorCodec,
    filter::Filter,
    store::{QueryResult, StoreError},
};

/// Externally visible phase of a tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailPhase {
    Full,
    Waiting,
    Streaming,
}

/// A history query a tail wants issued. At most one is outstanding per tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub tail: TailId,
    /// Identifies the tail instance; a reused tail id gets a new serial.
    pub serial: u64,
    /// Exclusive lower bound
    pub after: MessageId,
    pub limit: u64,
    pub filter: Filter,
}

#[derive(Debug)]
enum State {
    Full,
    Waiting { buffer: Vec<(MessageId, SealedMessage)> },
    Streaming,
}

#[derive(Debug)]
pub struct Tail {
    id: TailId,
    serial: u64,
    filter: Filter,
    state: State,
    last_sent: MessageId,
    messages_sent: u64,
    messages_wanted: u64,
    closed: bool,
}

impl Tail {
    /// Create a tail positioned after `start`, with no credit.
    pub fn new(id: TailId, serial: u64, start: MessageId, filter: Filter) -> Self {
        Self {
            id,
            serial,
            filter,
            state: State::Full,
            last_sent: start,
            messages_sent: 0,
            messages_wanted: 0,
            closed: false,
        }
    }

    pub fn id(&self) -> TailId {
        self.id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn last_sent(&self) -> MessageId {
        self.last_sent
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn messages_wanted(&self) -> u64 {
        self.messages_wanted
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn phase(&self) -> TailPhase {
        match self.state {
            State::Full => TailPhase::Full,
            State::Waiting { .. } => TailPhase::Waiting,
            State::Streaming => TailPhase::Streaming,
        }
    }

    /// Whether live messages should be routed to this tail.
    pub fn is_active(&self) -> bool {
        !self.closed && !matches!(self.state, State::Full)
    }

    /// Raise the credit so that `count` messages in total have been asked
    /// for, and start a query if the tail is idle.
    pub fn extend(&mut self, count: u64) -> Option<HistoryQuery> {
        if self.closed {
            return None;
        }
        let wanted = count.saturating_sub(self.messages_sent);
        self.messages_wanted = self.messages_wanted.max(wanted);
        self.fire_query()
    }

    fn fire_query(&mut self) -> Option<HistoryQuery> {
        if self.closed || self.messages_wanted == 0 || !matches!(self.state, State::Full) {
            return None;
        }
        self.state = State::Waiting { buffer: Vec::new() };
        Some(HistoryQuery {
            tail: self.id,
            serial: self.serial,
            after: self.last_sent,
            limit: self.messages_wanted,
            filter: self.filter.clone(),
        })
    }

    /// Apply a completed history query. Returns the follow-up query, if any.
    pub fn on_query_result(
        &mut self,
        result: QueryResult,
        codec: &CursorCodec,
        conn: &Connection,
    ) -> Option<HistoryQuery> {
        if self.closed {
            return None;
        }
        let buffer = match mem::replace(&mut self.state, State::Full) {
            State::Waiting { buffer } => buffer,
            other => {
                debug!(tail = self.id, "Query result for a tail that is not waiting");
                self.state = other;
                return None;
            }
        };

        let last_id = result.messages.last().map(|m| m.id);
        let sealed = result
            .messages
            .iter()
            .map(|m| m.seal(codec.seal(m.id)))
            .collect();
        self.emit(conn, sealed, result.is_done);
        if let Some(last_id) = last_id {
            self.last_sent = self.last_sent.max(last_id);
        }

        if !result.is_done || self.messages_wanted == 0 {
            // Either more history remains or there is no room for live
            // messages. The buffer is dropped; anything in it is durable.
            return self.fire_query();
        }

        // Hand off to live streaming. Buffered messages at or below the query
        // cutoff were already sent as part of the result.
        let cutoff = self.last_sent;
        let room = usize::try_from(self.messages_wanted).unwrap_or(usize::MAX);
        let pending: Vec<(MessageId, SealedMessage)> = buffer
            .into_iter()
            .filter(|(id, _)| *id > cutoff)
            .take(room)
            .collect();
        if let Some((last_id, _)) = pending.last() {
            let last_id = *last_id;
            let messages = pending.into_iter().map(|(_, message)| message).collect();
            self.emit(conn, messages, true);
            self.last_sent = last_id;
        }

        if self.messages_wanted > 0 {
            self.state = State::Streaming;
        }
        None
    }

    /// A history query failed. The socket is closed and the client resumes
    /// from its last cursor after reconnecting.
    pub fn on_query_failed(&mut self, err: &StoreError, conn: &mut Connection) {
        if self.closed {
            return;
        }
        error!(tail = self.id, socket = %conn.id(), error = %err, "Failed to get messages");
        self.state = State::Full;
        conn.close(
            CloseCode::InternalQueryError,
            CloseCode::InternalQueryError.reason(),
        );
    }

    /// Offer a live message. `sealed_id` is the message's cursor.
    pub fn on_message(&mut self, message: &Message, sealed_id: &str, conn: &Connection) {
        if self.closed || message.id <= self.last_sent || !self.filter.matches(&message.record) {
            return;
        }
        match &mut self.state {
            State::Full => {}
            State::Waiting { buffer } => {
                buffer.push((message.id, message.seal(sealed_id.to_string())));
            }
            State::Streaming => {
                self.emit(conn, vec![message.seal(sealed_id.to_string())], true);
                self.last_sent = message.id;
                if self.messages_wanted == 0 {
                    self.state = State::Full;
                }
            }
        }
    }

    /// Detach from the socket. Safe from any phase; the tail is inert
    /// afterwards.
    pub fn close(&mut self) {
        self.closed = true;
        self.state = State::Full;
    }

    fn emit(&mut self, conn: &Connection, messages: Vec<SealedMessage>, is_done: bool) {
        let count = messages.len() as u64;
        conn.send(&ServerFrame::Messages {
            id: self.id,
            messages,
            is_done,
        });
        self.messages_sent += count;
        self.messages_wanted = self.messages_wanted.saturating_sub(count);
    }
}
