//! The connection manager actor.
//!
//! One tokio task owns every connection, session and tail. Everything that
//! can change that state arrives as an [`Event`] on a single queue and is
//! applied in order:
//!
//! - socket lifecycle and inbound frames, from the per-socket tasks
//! - auth checks and history queries, which run as spawned tasks and post
//!   their results back
//! - messages and subscription notices from the bus
//!
//! Because events are applied one at a time, a tail's history/live handoff
//! never races with live delivery to the same tail.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use roost_types::{AuthRequest, CloseCode, Message, ServerFrame, Subscription, TailId, User, UserId};
use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};

use crate::{
    auth::{AuthError, Authenticator},
    connection::{Connection, Outbound, SocketId},
    cursor::CursorCodec,
    session::ActiveUser,
    store::{MessageStore, QueryOptions, QueryResult, StoreError},
    tail::HistoryQuery,
    types::ManagerOptions,
};

/// How often session counts are logged at debug level.
const STATS_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Notices from the message bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A saved message and the users it was delivered to
    Message {
        message: Message,
        user_ids: Vec<UserId>,
    },
    Subscribed {
        user: UserId,
        client_id: Option<String>,
        subs: Vec<Subscription>,
    },
    Unsubscribed {
        user: UserId,
        client_id: Option<String>,
        sub: Subscription,
    },
}

/// Inputs to the connection manager.
#[derive(Debug)]
pub enum Event {
    Opened {
        socket: SocketId,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    Data {
        socket: SocketId,
        raw: Vec<u8>,
    },
    /// The socket is gone, or is going. May be delivered more than once.
    Closed {
        socket: SocketId,
    },
    AuthChecked {
        socket: SocketId,
        result: Result<User, AuthError>,
    },
    QueryCompleted {
        user: UserId,
        socket: SocketId,
        tail: TailId,
        serial: u64,
        result: Result<QueryResult, StoreError>,
    },
    Bus(BusEvent),
    Shutdown,
}

/// Cloneable sender side of the manager's queue.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    events: mpsc::UnboundedSender<Event>,
    next_socket: Arc<AtomicU64>,
}

impl ManagerHandle {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            next_socket: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a new transport. Returns its id and the queue its writer
    /// should drain.
    pub fn open_socket(&self) -> (SocketId, mpsc::UnboundedReceiver<Outbound>) {
        let socket = SocketId(self.next_socket.fetch_add(1, Ordering::Relaxed) + 1);
        let (outbound, rx) = mpsc::unbounded_channel();
        self.send(Event::Opened { socket, outbound });
        (socket, rx)
    }

    pub fn data(&self, socket: SocketId, raw: impl Into<Vec<u8>>) {
        self.send(Event::Data {
            socket,
            raw: raw.into(),
        });
    }

    pub fn closed(&self, socket: SocketId) {
        self.send(Event::Closed { socket });
    }

    pub fn publish(&self, event: BusEvent) {
        self.send(Event::Bus(event));
    }

    pub fn shutdown(&self) {
        self.send(Event::Shutdown);
    }

    fn send(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("Connection manager is not running");
        }
    }
}

/// A socket that has not finished authenticating.
#[derive(Debug)]
struct PendingSocket {
    conn: Connection,
    /// An auth check is in flight; further frames are ignored.
    checking: bool,
}

pub struct ConnectionManager {
    store: Arc<dyn MessageStore>,
    auth: Arc<dyn Authenticator>,
    codec: CursorCodec,
    options: ManagerOptions,
    handle: ManagerHandle,
    unauthenticated: HashMap<SocketId, PendingSocket>,
    sessions: HashMap<UserId, ActiveUser>,
    socket_users: HashMap<SocketId, UserId>,
}

impl ConnectionManager {
    pub fn new(
        store: Arc<dyn MessageStore>,
        auth: Arc<dyn Authenticator>,
        codec: CursorCodec,
        options: ManagerOptions,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            store,
            auth,
            codec,
            options,
            handle: ManagerHandle::new(tx),
            unauthenticated: HashMap::new(),
            sessions: HashMap::new(),
            socket_users: HashMap::new(),
        };
        (manager, rx)
    }

    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    pub fn codec(&self) -> &CursorCodec {
        &self.codec
    }

    pub fn unauthenticated_count(&self) -> usize {
        self.unauthenticated.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, user: UserId) -> Option<&ActiveUser> {
        self.sessions.get(&user)
    }

    /// Apply one event.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Opened { socket, outbound } => {
                let conn = Connection::new(socket, outbound, self.handle.events.clone(), Instant::now());
                debug!(socket = %socket, "Socket opened");
                self.unauthenticated.insert(
                    socket,
                    PendingSocket {
                        conn,
                        checking: false,
                    },
                );
            }
            Event::Data { socket, raw } => self.on_data(socket, &raw, Instant::now()),
            Event::Closed { socket } => self.on_closed(socket),
            Event::AuthChecked { socket, result } => self.on_auth_checked(socket, result),
            Event::QueryCompleted {
                user,
                socket,
                tail,
                serial,
                result,
            } => {
                let Some(session) = self.sessions.get_mut(&user) else {
                    return;
                };
                if let Some(query) = session.on_query_result(socket, tail, serial, result, &self.codec)
                {
                    self.spawn_query(user, socket, query);
                }
            }
            Event::Bus(event) => self.on_bus_event(event),
            Event::Shutdown => {}
        }
    }

    fn on_data(&mut self, socket: SocketId, raw: &[u8], now: Instant) {
        if let Some(pending) = self.unauthenticated.get_mut(&socket) {
            let Some(frame) = pending.conn.on_data(raw, now) else {
                return;
            };
            if pending.checking {
                debug!(socket = %socket, "Ignoring message during auth check");
                return;
            }
            let request = match AuthRequest::from_frame(&frame) {
                Ok(request) => request,
                Err(e) => {
                    debug!(socket = %socket, error = %e, "Rejecting first message");
                    let code = e.close_code();
                    pending.conn.close(code, code.reason());
                    return;
                }
            };
            pending.checking = true;
            pending.conn.set_client_id(request.client_id);

            let auth = self.auth.clone();
            let events = self.handle.events.clone();
            let token = request.token;
            tokio::spawn(async move {
                let result = auth.check_auth_token(&token).await;
                let _ = events.send(Event::AuthChecked { socket, result });
            });
            return;
        }

        let Some(user) = self.socket_users.get(&socket).copied() else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&user) else {
            return;
        };
        if let Some(query) = session.handle_frame(socket, raw, now, &self.codec) {
            self.spawn_query(user, socket, query);
        }
    }

    fn on_auth_checked(&mut self, socket: SocketId, result: Result<User, AuthError>) {
        // Closed while the check was running.
        let Some(PendingSocket { mut conn, .. }) = self.unauthenticated.remove(&socket) else {
            debug!(socket = %socket, "Auth completed for a closed socket");
            return;
        };
        if conn.is_closing() {
            return;
        }

        match result {
            Ok(user) => {
                conn.send(&ServerFrame::Ready);
                self.socket_users.insert(socket, user.id);
                self.sessions
                    .entry(user.id)
                    .or_insert_with(|| ActiveUser::new(user))
                    .add_socket(conn);
            }
            Err(AuthError::User(reason)) => {
                info!(socket = %socket, reason = %reason, "Auth rejected");
                conn.close(CloseCode::AuthRejected, &reason);
            }
            Err(e) => {
                error!(socket = %socket, error = %e, "Auth check failed");
                let code = CloseCode::InternalAuthError;
                conn.close(code, code.reason());
            }
        }
    }

    fn on_closed(&mut self, socket: SocketId) {
        if self.unauthenticated.remove(&socket).is_some() {
            debug!(socket = %socket, "Unauthenticated socket closed");
            return;
        }
        let Some(user) = self.socket_users.remove(&socket) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&user) else {
            return;
        };
        session.remove_socket(socket);
        if session.ref_count() == 0 {
            info!(user, "Session ended");
            self.sessions.remove(&user);
        }
    }

    fn on_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Message { message, user_ids } => {
                let sealed_id = self.codec.seal(message.id);
                for user in user_ids {
                    if let Some(session) = self.sessions.get_mut(&user) {
                        session.on_message(&message, &sealed_id);
                    }
                }
            }
            BusEvent::Subscribed {
                user,
                client_id,
                subs,
            } => self.broadcast(user, client_id.as_deref(), &ServerFrame::Subscribed { subs }),
            BusEvent::Unsubscribed {
                user,
                client_id,
                sub,
            } => self.broadcast(
                user,
                client_id.as_deref(),
                &ServerFrame::Unsubscribed { subs: vec![sub] },
            ),
        }
    }

    /// Send a frame to every socket of `user`, except those of the
    /// originating client.
    pub fn broadcast(&self, user: UserId, exclude_client_id: Option<&str>, frame: &ServerFrame) {
        if let Some(session) = self.sessions.get(&user) {
            session.broadcast(exclude_client_id, frame);
        }
    }

    fn spawn_query(&self, user: UserId, socket: SocketId, query: HistoryQuery) {
        let store = self.store.clone();
        let events = self.handle.events.clone();
        tokio::spawn(async move {
            let result = store
                .get_messages(user, query.after, &query.filter, QueryOptions::forward(query.limit))
                .await;
            if let Err(e) = &result {
                warn!(user, socket = %socket, tail = query.tail, error = %e, "History query failed");
            }
            let _ = events.send(Event::QueryCompleted {
                user,
                socket,
                tail: query.tail,
                serial: query.serial,
                result,
            });
        });
    }

    /// Close unauthenticated sockets idle past their timeout.
    pub fn sweep_unauthenticated(&mut self, now: Instant) -> usize {
        let timeout = self.options.unauthenticated_socket_timeout;
        let mut closed = 0;
        for pending in self.unauthenticated.values_mut() {
            if !pending.conn.is_closing() && pending.conn.is_idle(now, timeout) {
                info!(socket = %pending.conn.id(), "Closing idle unauthenticated socket");
                let code = CloseCode::IdleTimeout;
                pending.conn.close(code, code.reason());
                closed += 1;
            }
        }
        closed
    }

    /// Close authenticated sockets idle past their timeout.
    pub fn sweep_authenticated(&mut self, now: Instant) -> usize {
        let timeout = self.options.socket_idle_timeout;
        self.sessions
            .values_mut()
            .map(|session| session.sweep_idle(now, timeout))
            .sum()
    }

    fn log_stats(&self) {
        let sockets: usize = self.sessions.values().map(ActiveUser::ref_count).sum();
        let tails: usize = self.sessions.values().map(ActiveUser::tail_count).sum();
        debug!(
            unauthenticated = self.unauthenticated.len(),
            sessions = self.sessions.len(),
            sockets,
            tails,
            "Connection stats"
        );
    }

    /// Run until a shutdown event arrives.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        let mut unauthenticated_sweep =
            interval(sweep_period(self.options.unauthenticated_socket_timeout));
        let mut idle_sweep = interval(sweep_period(self.options.socket_idle_timeout));
        let mut stats = interval(STATS_INTERVAL);
        for timer in [&mut unauthenticated_sweep, &mut idle_sweep, &mut stats] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!("Connection manager started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(Event::Shutdown) | None => break,
                    Some(event) => self.handle_event(event),
                },
                _ = unauthenticated_sweep.tick() => {
                    self.sweep_unauthenticated(Instant::now());
                }
                _ = idle_sweep.tick() => {
                    self.sweep_authenticated(Instant::now());
                }
                _ = stats.tick() => self.log_stats(),
            }
        }
        info!(sessions = self.sessions.len(), "Connection manager stopped");
    }
}

/// Sweeps run at half the timeout.
fn sweep_period(timeout: Duration) -> Duration {
    (timeout / 2).max(Duration::from_millis(1))
}
