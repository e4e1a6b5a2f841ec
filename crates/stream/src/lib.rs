//! Roost delivery engine
//!
//! Real-time delivery of a totally ordered message stream to many
//! authenticated websocket clients.
//!
//! # Features
//!
//! - **Tails**: each socket opens any number of independent cursors into the
//!   user's messages, each with its own filter and flow-control credit
//! - **Seamless catch-up**: a tail replays history from the store and then
//!   switches to live delivery with no duplicates and no gaps
//! - **Opaque cursors**: message ids are sealed with an HMAC before they
//!   leave the server
//! - **Multi-socket sessions**: subscription changes made by one client are
//!   pushed to the user's other clients
//! - **Idle reaping**: silent sockets are closed, with a shorter deadline for
//!   sockets that never authenticate
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use roost_stream::{StaticAuthenticator, server, types::ServerOptions};
//! use roost_types::User;
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = ServerOptions {
//!         port: 8080,
//!         host: "127.0.0.1".to_string(),
//!         ..Default::default()
//!     };
//!     let auth = StaticAuthenticator::new().with_user(
//!         "secret-token",
//!         User { id: 1, display_name: "alice".to_string() },
//!     );
//!
//!     server::start_server(options, Arc::new(auth), async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//!     .unwrap();
//! }
//! ```
//!
//! # Protocol
//!
//! Sockets connect to `/v1/socket` and exchange JSON text frames tagged by
//! `type`. The first client frame authenticates:
//!
//! ```text
//! > {"type": "auth", "token": "secret-token", "clientId": "tab-1"}
//! < {"type": "ready"}
//! ```
//!
//! A tail is opened, then given credit. History arrives first; once the tail
//! has caught up it keeps streaming live messages until the credit is spent.
//!
//! ```text
//! > {"type": "new-tail", "id": 1, "start": null, "class": "help"}
//! > {"type": "extend-tail", "id": 1, "count": 50}
//! < {"type": "messages", "id": 1, "isDone": true, "messages": [{"id": "AAAAAAAAAAFx...", ...}]}
//! ```
//!
//! `count` is cumulative: it is the total number of messages the client has
//! asked for on that tail, not an increment. A `start` cursor resumes after
//! that message, or at it with `"inclusive": true`.

pub mod auth;
pub mod bus;
pub mod connection;
pub mod cursor;
pub mod filter;
pub mod manager;
pub mod server;
pub mod session;
pub mod store;
pub mod tail;
pub mod types;

// Re-export commonly used items
pub use auth::{AuthError, Authenticator, StaticAuthenticator};
pub use bus::Subscriber;
pub use cursor::{CursorCodec, CursorError};
pub use filter::Filter;
pub use manager::{BusEvent, ConnectionManager, Event, ManagerHandle};
pub use server::{App, AppState, ServeError, create_router, start_server};
pub use store::{MemoryStore, MessageStore, QueryOptions, QueryResult, StoreError};
pub use types::{ManagerOptions, ServerOptions};
