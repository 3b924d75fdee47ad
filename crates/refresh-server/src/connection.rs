//! Browser connection management: read/write pumps and best-effort sends.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::{SEND_BUFFER_SIZE, WS_PING_PERIOD};

/// Handle for sending text frames to the connected browser.
///
/// Cloneable and cheap — wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Queues a text frame for delivery.
    ///
    /// Returns `Err` if the send buffer is full or the browser has
    /// disconnected. Callers are free to ignore the result: refresh
    /// notifications are best-effort.
    pub fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.tx
            .try_send(WsMessage::Text(text.to_owned().into()))
            .map_err(|_| SendError)
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send channel is full or the connection closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to a browser.
///
/// Owns the read/write pump tasks and provides a [`Sender`] for
/// asynchronous message delivery.
pub struct BrowserConnection {
    sender: Sender,
    cancel: CancellationToken,
    write_task: JoinHandle<()>,
    read_task: JoinHandle<()>,
}

impl BrowserConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Signals shutdown and waits for both pumps to finish.
    ///
    /// The write pump sends a normal-closure Close frame on its way out.
    pub async fn close_and_wait(self) {
        self.cancel.cancel();
        let _ = self.write_task.await;
        let _ = self.read_task.await;
    }
}

/// Runs the read and write pumps for an upgraded WebSocket connection.
///
/// Returns the [`BrowserConnection`] handle. The pumps run as background
/// tokio tasks and stop when the browser disconnects or the cancel token
/// (a child of the server's own) is triggered.
pub fn spawn_connection<S>(
    ws_stream: S,
    peer_addr: SocketAddr,
    server_cancel: CancellationToken,
) -> BrowserConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let (ws_sink, ws_stream) = ws_stream.split();

    let write_cancel = cancel.clone();
    let write_task = tokio::spawn(write_pump(ws_sink, rx, write_cancel));

    let read_cancel = cancel.clone();
    let read_sender = sender.clone();
    let read_task = tokio::spawn(async move {
        read_pump(ws_stream, read_sender, read_cancel.clone()).await;
        // When the read pump exits, cancel the write pump too so the
        // close frame goes out and the socket unwinds.
        read_cancel.cancel();
        tracing::info!(%peer_addr, "browser disconnected");
    });

    BrowserConnection {
        sender,
        cancel,
        write_task,
        read_task,
    }
}

/// Write pump: drains the send channel and sends keepalive pings.
///
/// On shutdown it sends a normal-closure Close frame before releasing
/// the sink, so the browser sees a clean teardown.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the immediate first tick.
    ping_interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::debug!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::debug!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort normal closure.
    let _ = sink.send(WsMessage::Close(None)).await;
    let _ = sink.close().await;
}

/// Read pump: watches for close/errors and answers transport pings.
///
/// The browser sends no application-level messages; anything other than
/// control frames is noted and ignored.
async fn read_pump<S>(mut stream: S, sender: Sender, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        match ws_msg {
                            WsMessage::Ping(data) => {
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Pong(_) => {}
                            WsMessage::Close(_) => {
                                tracing::debug!("received close frame from browser");
                                break;
                            }
                            WsMessage::Text(_) | WsMessage::Binary(_) => {
                                tracing::debug!("ignoring unexpected message from browser");
                            }
                            WsMessage::Frame(_) => {} // Raw frames ignored.
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!("read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                }
            }
        }
    }
}
