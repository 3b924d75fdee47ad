//! Refresh WebSocket server.
//!
//! Binds a loopback TCP port (OS-assigned by default), upgrades incoming
//! requests to WebSocket, and keeps a single browser connection at a time
//! that the watch loop pushes `Reload` / `Wait` messages to.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::connection::{self, BrowserConnection};
use crate::endpoint::{AUTO_RELOAD_ENV, resolve_bind_addr};
use crate::{RELOAD_MESSAGE, ServerError, WAIT_MESSAGE, upgrade};

/// Server configuration, derived once at startup and immutable thereafter.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// TCP port to bind (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let (host, port) = resolve_bind_addr(None);
        Self { host, port }
    }
}

impl ServerConfig {
    /// Builds the configuration from the [`AUTO_RELOAD_ENV`] override,
    /// falling back to loopback with an OS-assigned port.
    pub fn from_env() -> Self {
        let raw = std::env::var(AUTO_RELOAD_ENV).ok();
        let (host, port) = resolve_bind_addr(raw.as_deref());
        Self { host, port }
    }
}

/// The browser refresh server.
///
/// Holds at most one browser connection at a time; a newly connecting
/// browser (e.g. after a reload) replaces the previous connection.
pub struct RefreshServer {
    config: ServerConfig,
    browser: Mutex<Option<BrowserConnection>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    started: AtomicBool,
}

impl RefreshServer {
    /// Creates a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            browser: Mutex::new(None),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Creates a new server configured from the environment.
    pub fn from_env() -> Arc<Self> {
        Self::new(ServerConfig::from_env())
    }

    /// Binds the endpoint, spawns the accept loop, and returns the
    /// client-facing connection URL (`ws://host:port`, with the real port
    /// once the 0 sentinel has been resolved).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the endpoint cannot be bound and
    /// [`ServerError::AlreadyRunning`] on a second call.
    pub async fn start(self: &Arc<Self>) -> Result<String, ServerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: format!("{}:{}", self.config.host, self.config.port),
                source,
            })?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("refresh server listening on {local_addr}");

        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.accept_loop(listener).await;
        });

        Ok(format!("ws://{}:{}", self.config.host, local_addr.port()))
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`start`](Self::start) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Returns `true` if a browser is currently connected and alive.
    pub async fn has_browser(&self) -> bool {
        let lock = self.browser.lock().await;
        match lock.as_ref() {
            Some(conn) => conn.sender().is_connected(),
            None => false,
        }
    }

    /// Sends a text message to the connected browser, best-effort.
    ///
    /// A no-op when no browser is attached or the connection has already
    /// signalled closure; a failed send is logged and swallowed. A missed
    /// refresh notification is never fatal to the watch loop.
    pub async fn send(&self, message: &str) {
        let lock = self.browser.lock().await;
        let Some(conn) = lock.as_ref() else {
            return;
        };

        let sender = conn.sender();
        if !sender.is_connected() {
            return;
        }

        if let Err(e) = sender.send_text(message) {
            tracing::debug!("refresh message dropped: {e}");
        }
    }

    /// Tells the browser to reload the page.
    pub async fn reload(&self) {
        self.send(RELOAD_MESSAGE).await;
    }

    /// Tells the browser a rebuild is in progress.
    pub async fn send_wait(&self) {
        self.send(WAIT_MESSAGE).await;
    }

    /// Gracefully shuts the server down. Idempotent.
    ///
    /// Closes the browser connection with a normal-closure frame, stops
    /// the accept loop, and releases the listener. Subsequent calls (and
    /// subsequent [`send`](Self::send)s) are no-ops.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(conn) = self.browser.lock().await.take() {
            conn.close_and_wait().await;
        }
    }

    /// Accepts connections until the cancel token fires.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("refresh server shutting down");
                    if let Some(conn) = self.browser.lock().await.take() {
                        conn.close_and_wait().await;
                    }
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                match server.handle_connection(stream, peer_addr).await {
                                    Ok(()) => {}
                                    Err(ServerError::NotAnUpgrade) => {
                                        tracing::debug!(%peer_addr, "rejected non-upgrade request");
                                    }
                                    Err(e) => {
                                        tracing::warn!(%peer_addr, "connection error: {e}");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Handles a single TCP connection: upgrades to WS and attaches it.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        // Non-upgrade requests are answered with HTTP 400 inside the
        // upgrade step and must not disturb the attached browser, so the
        // slot is only touched after the handshake succeeds.
        let ws_stream = upgrade::accept_websocket(stream).await?;
        tracing::info!(%peer_addr, "browser connected");

        let conn = connection::spawn_connection(ws_stream, peer_addr, self.cancel.clone());

        // Swap old for new under a single lock acquisition so concurrent
        // handshakes cannot both observe an empty slot. A reconnecting
        // browser replaces the previous session.
        let old = {
            let mut lock = self.browser.lock().await;
            // A shutdown may have raced the handshake; don't attach to a
            // disposed server.
            if self.cancel.is_cancelled() {
                drop(lock);
                conn.close_and_wait().await;
                return Ok(());
            }
            lock.replace(conn)
        };

        if let Some(old) = old {
            if old.sender().is_connected() {
                tracing::info!(%peer_addr, "replacing active browser connection");
            } else {
                tracing::debug!("clearing stale browser connection");
            }
            old.close_and_wait().await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    /// Reads frames until the next text frame, skipping transport pings.
    /// Returns `None` on close or error.
    async fn next_text<S>(ws: &mut S) -> Option<String>
    where
        S: futures_util::Stream<
                Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
            > + Unpin,
    {
        loop {
            let frame = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")?;
            match frame {
                Ok(WsMessage::Text(t)) => return Some(t.as_str().to_owned()),
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    #[tokio::test]
    async fn start_returns_loopback_ws_url_with_real_port() {
        let server = RefreshServer::new(ServerConfig::default());
        let url = server.start().await.unwrap();

        let port = server.port().await;
        assert!(port > 0, "port 0 sentinel should resolve on bind");
        assert_eq!(url, format!("ws://127.0.0.1:{port}"));
        assert!(!server.has_browser().await);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let server = RefreshServer::new(ServerConfig::default());
        server.start().await.unwrap();

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyRunning));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn bind_error_surfaces_from_start() {
        let first = RefreshServer::new(ServerConfig::default());
        let url = first.start().await.unwrap();
        let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();

        // Same port again must fail to bind.
        let second = RefreshServer::new(ServerConfig {
            host: "127.0.0.1".to_owned(),
            port,
        });
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));

        first.shutdown().await;
    }

    #[tokio::test]
    async fn send_without_browser_is_noop() {
        let server = RefreshServer::new(ServerConfig::default());
        server.start().await.unwrap();

        // Nothing attached: must complete silently.
        server.reload().await;
        server.send_wait().await;
        server.send("arbitrary payload").await;

        server.shutdown().await;
    }

    #[tokio::test]
    async fn reload_and_wait_reach_the_browser() {
        let server = RefreshServer::new(ServerConfig::default());
        let url = server.start().await.unwrap();

        let (mut ws, _) = connect_async(&url).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(server.has_browser().await);

        server.reload().await;
        assert_eq!(next_text(&mut ws).await.as_deref(), Some("Reload"));

        server.send_wait().await;
        assert_eq!(next_text(&mut ws).await.as_deref(), Some("Wait"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_the_browser_connection() {
        let server = RefreshServer::new(ServerConfig::default());
        let url = server.start().await.unwrap();

        let (mut ws, _) = connect_async(&url).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        server.shutdown().await;

        // The client observes a normal closure (or the stream ending).
        assert_eq!(next_text(&mut ws).await, None);
    }

    #[tokio::test]
    async fn double_shutdown_is_noop() {
        let server = RefreshServer::new(ServerConfig::default());
        server.start().await.unwrap();

        server.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn send_after_shutdown_is_noop() {
        let server = RefreshServer::new(ServerConfig::default());
        let url = server.start().await.unwrap();

        let (_ws, _) = connect_async(&url).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        server.shutdown().await;

        assert!(!server.has_browser().await);
        server.reload().await; // Must not panic or error.
    }

    #[tokio::test]
    async fn second_browser_replaces_first() {
        let server = RefreshServer::new(ServerConfig::default());
        let url = server.start().await.unwrap();

        let (mut ws1, _) = connect_async(&url).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(server.has_browser().await);

        let (mut ws2, _) = connect_async(&url).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        // The first client is closed out; the second receives the message.
        server.reload().await;
        assert_eq!(next_text(&mut ws1).await, None);
        assert_eq!(next_text(&mut ws2).await.as_deref(), Some("Reload"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn non_upgrade_request_gets_400() {
        let server = RefreshServer::new(ServerConfig::default());
        server.start().await.unwrap();
        let port = server.port().await;

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .expect("timed out waiting for response")
            .unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(
            response.starts_with("HTTP/1.1 400"),
            "expected 400, got: {response}"
        );

        server.shutdown().await;
    }

    #[tokio::test]
    async fn non_upgrade_request_leaves_browser_attached() {
        let server = RefreshServer::new(ServerConfig::default());
        let url = server.start().await.unwrap();
        let port = server.port().await;

        let (mut ws, _) = connect_async(&url).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(server.has_browser().await);

        // A plain HTTP probe on the same port must be rejected locally
        // without evicting the attached browser.
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .expect("timed out waiting for response")
            .unwrap();

        assert!(server.has_browser().await);
        server.reload().await;
        assert_eq!(next_text(&mut ws).await.as_deref(), Some("Reload"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_connects_leave_one_live_connection() {
        let server = RefreshServer::new(ServerConfig::default());
        let url = server.start().await.unwrap();

        let (r1, r2) = tokio::join!(connect_async(&url), connect_async(&url));
        let (mut ws1, _) = r1.unwrap();
        let (mut ws2, _) = r2.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert!(server.has_browser().await);
        server.reload().await;

        // Exactly one client stays attached and receives the message;
        // the loser observes a normal closure.
        let t1 = next_text(&mut ws1).await;
        let t2 = next_text(&mut ws2).await;
        assert!(
            matches!(
                (t1.as_deref(), t2.as_deref()),
                (Some("Reload"), None) | (None, Some("Reload"))
            ),
            "expected one live connection, got {t1:?} / {t2:?}"
        );

        server.shutdown().await;
    }

    #[tokio::test]
    async fn browser_initiated_close_detaches_the_connection() {
        let server = RefreshServer::new(ServerConfig::default());
        let url = server.start().await.unwrap();

        let (mut ws, _) = connect_async(&url).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(server.has_browser().await);

        ws.send(WsMessage::Close(None)).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert!(!server.has_browser().await);
        server.reload().await; // Dropped, not queued.

        server.shutdown().await;
    }
}
