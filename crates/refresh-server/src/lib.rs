//! Browser refresh WebSocket server for the devwatch watch loop.
//!
//! Hosts a loopback WebSocket endpoint that a browser page connects to,
//! holds that single connection open, and pushes short control messages
//! (`Reload` / `Wait`) to it on behalf of the watch loop. Delivery is
//! best-effort: with no browser attached the message is dropped, never
//! queued, and a failed send never fails the watch loop.

use std::time::Duration;

mod connection;
mod endpoint;
mod server;
mod upgrade;

pub use connection::{BrowserConnection, SendError, Sender};
pub use endpoint::{AUTO_RELOAD_ENV, DEFAULT_HOST, resolve_bind_addr};
pub use server::{RefreshServer, ServerConfig};

/// Text payload telling the browser to reload the page.
pub const RELOAD_MESSAGE: &str = "Reload";

/// Text payload telling the browser a rebuild is in progress.
pub const WAIT_MESSAGE: &str = "Wait";

/// Send buffer capacity.
///
/// The protocol is two short control messages, so a handful of slots is
/// plenty; if the buffer ever fills the connection is wedged and dropping
/// the message is the correct best-effort outcome.
pub const SEND_BUFFER_SIZE: usize = 16;

/// How often the write pump sends a transport-level ping to the browser.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Errors produced by the refresh server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("not a websocket upgrade request")]
    NotAnUpgrade,

    #[error("server already started")]
    AlreadyRunning,
}
