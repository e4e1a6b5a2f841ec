//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::MAX_MESSAGES_RETURNED;

/// Secret used when none is configured. Cursors minted with it are only
/// as private as this source file.
pub const DEFAULT_CURSOR_SECRET: &str = "roost-development-secret";

/// Server configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Port to listen on (0 for auto-assign)
    pub port: u16,
    /// Host to bind to
    pub host: String,
    /// Authenticated sockets with no inbound traffic for this long are closed
    pub socket_idle_timeout_ms: u64,
    /// Sockets that have not authenticated within this long are closed
    pub unauthenticated_socket_timeout_ms: u64,
    /// HMAC key for message cursors
    pub cursor_secret: String,
    /// Cap on messages returned by one history query
    pub max_messages_returned: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "127.0.0.1".to_string(),
            socket_idle_timeout_ms: 60_000,
            unauthenticated_socket_timeout_ms: 10_000,
            cursor_secret: DEFAULT_CURSOR_SECRET.to_string(),
            max_messages_returned: MAX_MESSAGES_RETURNED,
        }
    }
}

impl ServerOptions {
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            socket_idle_timeout: Duration::from_millis(self.socket_idle_timeout_ms),
            unauthenticated_socket_timeout: Duration::from_millis(
                self.unauthenticated_socket_timeout_ms,
            ),
        }
    }
}

/// Timeouts used by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
    pub socket_idle_timeout: Duration,
    pub unauthenticated_socket_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        ServerOptions::default().manager_options()
    }
}
