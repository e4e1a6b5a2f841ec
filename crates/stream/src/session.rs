//! Per-user sessions.
//!
//! An [`ActiveUser`] aggregates every authenticated socket a user has open,
//! and every tail opened on those sockets. It lives exactly as long as the
//! user has at least one socket.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use roost_types::{CloseCode, Command, Message, NewTailRequest, ServerFrame, TailId, User};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, SocketId},
    cursor::CursorCodec,
    filter::Filter,
    store::{QueryResult, StoreError},
    tail::{HistoryQuery, Tail},
};

#[derive(Debug)]
struct SocketSession {
    conn: Connection,
    tails: HashMap<TailId, Tail>,
}

#[derive(Debug)]
pub struct ActiveUser {
    user: User,
    sockets: HashMap<SocketId, SocketSession>,
    next_serial: u64,
}

impl ActiveUser {
    pub fn new(user: User) -> Self {
        Self {
            user,
            sockets: HashMap::new(),
            next_serial: 0,
        }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Number of open sockets. The session is dropped when this reaches zero.
    pub fn ref_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn has_socket(&self, socket: SocketId) -> bool {
        self.sockets.contains_key(&socket)
    }

    /// Number of tails currently receiving live messages.
    pub fn active_tail_count(&self) -> usize {
        self.sockets
            .values()
            .flat_map(|s| s.tails.values())
            .filter(|t| t.is_active())
            .count()
    }

    pub fn tail_count(&self) -> usize {
        self.sockets.values().map(|s| s.tails.len()).sum()
    }

    pub fn add_socket(&mut self, conn: Connection) {
        info!(user = self.user.id, socket = %conn.id(), "Socket authenticated");
        self.sockets.insert(
            conn.id(),
            SocketSession {
                conn,
                tails: HashMap::new(),
            },
        );
    }

    /// Detach a closed socket and close its tails.
    pub fn remove_socket(&mut self, socket: SocketId) -> bool {
        let Some(mut session) = self.sockets.remove(&socket) else {
            return false;
        };
        for tail in session.tails.values_mut() {
            tail.close();
        }
        debug!(
            user = self.user.id,
            socket = %socket,
            tails = session.tails.len(),
            remaining = self.sockets.len(),
            "Socket removed"
        );
        true
    }

    /// Process a frame from one of this user's sockets. Returns a history
    /// query to issue, if the command started one.
    pub fn handle_frame(
        &mut self,
        socket: SocketId,
        raw: &[u8],
        now: Instant,
        codec: &CursorCodec,
    ) -> Option<HistoryQuery> {
        let Self {
            sockets,
            next_serial,
            user,
        } = self;
        let session = sockets.get_mut(&socket)?;
        let frame = session.conn.on_data(raw, now)?;

        let command = match Command::from_frame(frame) {
            Ok(command) => command,
            Err(e) => {
                warn!(user = user.id, socket = %socket, error = %e, "Bad client message");
                let code = e.close_code();
                session.conn.close(code, code.reason());
                return None;
            }
        };

        match command {
            Command::Ping => {
                session.conn.send(&ServerFrame::Pong);
                None
            }
            Command::NewTail(request) => {
                *next_serial += 1;
                session.new_tail(request, *next_serial, codec);
                None
            }
            Command::ExtendTail(request) => session
                .tails
                .get_mut(&request.id)
                .and_then(|tail| tail.extend(request.count)),
            Command::CloseTail(request) => {
                if let Some(mut tail) = session.tails.remove(&request.id) {
                    tail.close();
                }
                None
            }
            Command::Unknown(kind) => {
                debug!(socket = %socket, kind = ?kind, "Ignoring unknown message type");
                None
            }
        }
    }

    /// Route a history query result to its tail. Results for a tail that was
    /// closed or replaced since the query started are discarded.
    pub fn on_query_result(
        &mut self,
        socket: SocketId,
        tail_id: TailId,
        serial: u64,
        result: Result<QueryResult, StoreError>,
        codec: &CursorCodec,
    ) -> Option<HistoryQuery> {
        let session = self.sockets.get_mut(&socket)?;
        let tail = session.tails.get_mut(&tail_id)?;
        if tail.serial() != serial {
            debug!(socket = %socket, tail = tail_id, "Discarding stale query result");
            return None;
        }
        match result {
            Ok(result) => tail.on_query_result(result, codec, &session.conn),
            Err(e) => {
                tail.on_query_failed(&e, &mut session.conn);
                None
            }
        }
    }

    /// Offer a live message to every active tail.
    pub fn on_message(&mut self, message: &Message, sealed_id: &str) {
        for SocketSession { conn, tails } in self.sockets.values_mut() {
            for tail in tails.values_mut().filter(|t| t.is_active()) {
                tail.on_message(message, sealed_id, conn);
            }
        }
    }

    /// Send a frame to every socket except those belonging to
    /// `exclude_client_id`.
    pub fn broadcast(&self, exclude_client_id: Option<&str>, frame: &ServerFrame) {
        for session in self.sockets.values() {
            if exclude_client_id.is_some() && session.conn.client_id() == exclude_client_id {
                continue;
            }
            session.conn.send(frame);
        }
    }

    /// Close sockets with no inbound traffic for longer than `timeout`.
    pub fn sweep_idle(&mut self, now: Instant, timeout: Duration) -> usize {
        let mut closed = 0;
        for session in self.sockets.values_mut() {
            if !session.conn.is_closing() && session.conn.is_idle(now, timeout) {
                info!(user = self.user.id, socket = %session.conn.id(), "Closing idle socket");
                session
                    .conn
                    .close(CloseCode::IdleTimeout, CloseCode::IdleTimeout.reason());
                closed += 1;
            }
        }
        closed
    }
}

impl SocketSession {
    fn new_tail(&mut self, request: NewTailRequest, serial: u64, codec: &CursorCodec) {
        let start = match request.start.as_deref() {
            None => 0,
            Some(cursor) => match codec.unseal(cursor) {
                Ok(id) => id,
                Err(e) => {
                    warn!(socket = %self.conn.id(), error = %e, "Bad start cursor");
                    self.conn
                        .close(CloseCode::BadTailMessage, CloseCode::BadTailMessage.reason());
                    return;
                }
            },
        };
        let start = if request.inclusive.unwrap_or(false) {
            start.saturating_sub(1)
        } else {
            start
        };

        if let Some(mut previous) = self.tails.remove(&request.id) {
            debug!(socket = %self.conn.id(), tail = request.id, "Replacing tail");
            previous.close();
        }
        let filter = Filter::from_request(&request);
        self.tails
            .insert(request.id, Tail::new(request.id, serial, start, filter));
    }
}

#[cfg(test)]
mod tests {
    use roost_types::{MessageRecord, Subscription};

    use super::*;
    use crate::{
        connection::{
            Outbound,
            testing::{TestSocket, close_code, drain, frames},
        },
        tail::TailPhase,
    };

    fn codec() -> CursorCodec {
        CursorCodec::new("session-tests").unwrap()
    }

    fn user() -> User {
        User {
            id: 1,
            display_name: "alice".to_string(),
        }
    }

    fn message(id: u64) -> Message {
        Message {
            id,
            record: MessageRecord {
                class: "help".to_string(),
                instance: "test".to_string(),
                sender: "alice@ATHENA.MIT.EDU".to_string(),
                recipient: String::new(),
                realm: "ATHENA.MIT.EDU".to_string(),
                opcode: String::new(),
                signature: String::new(),
                message: "hi".to_string(),
                time: 0,
                receive_time: 0,
                auth: 1,
            },
        }
    }

    /// A session with one socket; the socket's receivers are returned.
    fn session_with_socket(
        id: u64,
    ) -> (
        ActiveUser,
        tokio::sync::mpsc::UnboundedReceiver<Outbound>,
    ) {
        let TestSocket { conn, outbound, .. } = TestSocket::new(id);
        let mut session = ActiveUser::new(user());
        session.add_socket(conn);
        (session, outbound)
    }

    fn send(session: &mut ActiveUser, socket: u64, frame: &str) -> Option<HistoryQuery> {
        session.handle_frame(SocketId(socket), frame.as_bytes(), Instant::now(), &codec())
    }

    #[test]
    fn test_ping() {
        let (mut session, mut outbound) = session_with_socket(1);
        assert_eq!(send(&mut session, 1, r#"{"type":"ping"}"#), None);
        assert_eq!(frames(&mut outbound), vec![ServerFrame::Pong]);
    }

    #[test]
    fn test_new_tail_then_extend_starts_query() {
        let (mut session, _outbound) = session_with_socket(1);
        let cursor = codec().seal(41);

        let frame = format!(
            r#"{{"type":"new-tail","id":3,"start":"{}","inclusive":true,"class":"Help"}}"#,
            cursor
        );
        assert_eq!(send(&mut session, 1, &frame), None);
        assert_eq!(session.tail_count(), 1);

        let query = send(&mut session, 1, r#"{"type":"extend-tail","id":3,"count":10}"#).unwrap();
        assert_eq!(query.tail, 3);
        assert_eq!(query.after, 40);
        assert_eq!(query.limit, 10);
        assert_eq!(query.filter, Filter::new(Some("help"), None, None));
        assert_eq!(session.active_tail_count(), 1);

        // Unknown tail ids are ignored.
        assert_eq!(send(&mut session, 1, r#"{"type":"extend-tail","id":9,"count":10}"#), None);
    }

    #[test]
    fn test_bad_start_cursor_closes_socket() {
        let (mut session, mut outbound) = session_with_socket(1);
        send(&mut session, 1, r#"{"type":"new-tail","id":1,"start":"forged"}"#);

        assert_eq!(close_code(&drain(&mut outbound)), Some(4007));
        assert_eq!(session.tail_count(), 0);
    }

    #[test]
    fn test_non_numeric_tail_id_closes_socket() {
        let (mut session, mut outbound) = session_with_socket(1);
        send(&mut session, 1, r#"{"type":"new-tail","id":"one"}"#);

        let items = drain(&mut outbound);
        assert_eq!(close_code(&items), Some(4007));
        assert_eq!(items.len(), 1);
        assert_eq!(session.tail_count(), 0);
    }

    #[test]
    fn test_tail_id_reuse_replaces_previous_tail() {
        let codec = codec();
        let (mut session, mut outbound) = session_with_socket(1);

        send(&mut session, 1, r#"{"type":"new-tail","id":1}"#);
        let first = send(&mut session, 1, r#"{"type":"extend-tail","id":1,"count":5}"#).unwrap();

        send(&mut session, 1, r#"{"type":"new-tail","id":1,"class":"other"}"#);
        assert_eq!(session.tail_count(), 1);

        // The first tail's query completes after it was replaced.
        let result = QueryResult {
            messages: vec![message(1)],
            is_done: true,
        };
        let next = session.on_query_result(SocketId(1), 1, first.serial, Ok(result), &codec);
        assert_eq!(next, None);
        assert!(frames(&mut outbound).is_empty());

        let second = send(&mut session, 1, r#"{"type":"extend-tail","id":1,"count":5}"#).unwrap();
        assert_ne!(second.serial, first.serial);
        assert_eq!(second.filter, Filter::new(Some("other"), None, None));
    }

    #[test]
    fn test_close_tail_discards_results() {
        let codec = codec();
        let (mut session, mut outbound) = session_with_socket(1);

        send(&mut session, 1, r#"{"type":"new-tail","id":1}"#);
        let query = send(&mut session, 1, r#"{"type":"extend-tail","id":1,"count":5}"#).unwrap();
        send(&mut session, 1, r#"{"type":"close-tail","id":1}"#);
        assert_eq!(session.tail_count(), 0);

        session.on_query_result(SocketId(1), 1, query.serial, Ok(QueryResult::default()), &codec);
        assert!(frames(&mut outbound).is_empty());
    }

    #[test]
    fn test_live_messages_reach_streaming_tails() {
        let codec = codec();
        let (mut session, mut outbound) = session_with_socket(1);

        send(&mut session, 1, r#"{"type":"new-tail","id":1}"#);
        let query = send(&mut session, 1, r#"{"type":"extend-tail","id":1,"count":5}"#).unwrap();
        let done = QueryResult {
            messages: vec![],
            is_done: true,
        };
        session.on_query_result(SocketId(1), 1, query.serial, Ok(done), &codec);
        frames(&mut outbound);

        session.on_message(&message(1), &codec.seal(1));
        match frames(&mut outbound).as_slice() {
            [ServerFrame::Messages { id, messages, is_done }] => {
                assert_eq!(*id, 1);
                assert!(*is_done);
                assert_eq!(messages[0].id, codec.seal(1));
            }
            other => panic!("unexpected frames {:?}", other),
        }
    }

    #[test]
    fn test_query_failure_closes_only_that_socket() {
        let codec = codec();
        let (mut session, mut first) = session_with_socket(1);
        let TestSocket {
            conn,
            outbound: mut second,
            ..
        } = TestSocket::new(2);
        session.add_socket(conn);

        send(&mut session, 1, r#"{"type":"new-tail","id":1}"#);
        let query = send(&mut session, 1, r#"{"type":"extend-tail","id":1,"count":5}"#).unwrap();
        session.on_query_result(
            SocketId(1),
            1,
            query.serial,
            Err(StoreError::Unavailable("down".to_string())),
            &codec,
        );

        assert_eq!(close_code(&drain(&mut first)), Some(4006));
        assert!(drain(&mut second).is_empty());
    }

    #[test]
    fn test_broadcast_skips_originating_client() {
        let (mut session, mut first) = session_with_socket(1);
        let TestSocket {
            mut conn,
            outbound: mut second,
            ..
        } = TestSocket::new(2);
        conn.set_client_id(Some("B".to_string()));
        session.add_socket(conn);
        if let Some(s) = session.sockets.get_mut(&SocketId(1)) {
            s.conn.set_client_id(Some("A".to_string()));
        }

        let frame = ServerFrame::Subscribed {
            subs: vec![Subscription::new("help", None, "")],
        };
        session.broadcast(Some("A"), &frame);
        assert!(frames(&mut first).is_empty());
        assert_eq!(frames(&mut second), vec![frame.clone()]);

        session.broadcast(None, &frame);
        assert_eq!(frames(&mut first), vec![frame.clone()]);
        assert_eq!(frames(&mut second), vec![frame]);
    }

    #[test]
    fn test_remove_socket_closes_tails() {
        let codec = codec();
        let (mut session, _outbound) = session_with_socket(1);
        send(&mut session, 1, r#"{"type":"new-tail","id":1}"#);
        let query = send(&mut session, 1, r#"{"type":"extend-tail","id":1,"count":5}"#).unwrap();
        assert_eq!(session.active_tail_count(), 1);

        assert!(session.remove_socket(SocketId(1)));
        assert!(!session.remove_socket(SocketId(1)));
        assert_eq!(session.ref_count(), 0);
        assert_eq!(
            session.on_query_result(SocketId(1), 1, query.serial, Ok(QueryResult::default()), &codec),
            None
        );
    }

    #[test]
    fn test_sweep_idle() {
        let (mut session, mut outbound) = session_with_socket(1);
        let timeout = Duration::from_secs(60);

        assert_eq!(session.sweep_idle(Instant::now(), timeout), 0);
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(session.sweep_idle(later, timeout), 1);
        // Already closing
        assert_eq!(session.sweep_idle(later, timeout), 0);
        assert_eq!(close_code(&drain(&mut outbound)), Some(4005));
    }

    #[test]
    fn test_tail_phase_visible_after_handoff() {
        let codec = codec();
        let (mut session, _outbound) = session_with_socket(1);
        send(&mut session, 1, r#"{"type":"new-tail","id":1}"#);
        let query = send(&mut session, 1, r#"{"type":"extend-tail","id":1,"count":1}"#).unwrap();
        let result = QueryResult {
            messages: vec![message(1)],
            is_done: true,
        };
        session.on_query_result(SocketId(1), 1, query.serial, Ok(result), &codec);

        let phase = session.sockets[&SocketId(1)].tails[&1].phase();
        assert_eq!(phase, TailPhase::Full);
        assert_eq!(session.active_tail_count(), 0);
    }
}
