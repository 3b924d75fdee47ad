//! HTTP upgrade handling for incoming connections.
//!
//! Reads the request head from the raw socket before tungstenite sees it:
//! anything that is not a WebSocket upgrade request is answered with
//! HTTP 400 and dropped, everything else gets the 101 response and is
//! handed over as a server-role WebSocket stream.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;

use crate::ServerError;

/// Maximum size of an acceptable request head.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// Upgrades an incoming connection to WebSocket.
///
/// Non-upgrade requests (health checks, plain HTTP probes) receive an
/// HTTP 400 response and surface as [`ServerError::NotAnUpgrade`]; the
/// caller logs them and moves on without touching the attached browser.
pub(crate) async fn accept_websocket(
    mut stream: TcpStream,
) -> Result<WebSocketStream<TcpStream>, ServerError> {
    let head = match read_request_head(&mut stream).await {
        Ok(head) => head,
        Err(e) => {
            let _ = stream.write_all(BAD_REQUEST).await;
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };

    let Some(key) = upgrade_key(&head) else {
        let _ = stream.write_all(BAD_REQUEST).await;
        let _ = stream.shutdown().await;
        return Err(ServerError::NotAnUpgrade);
    };

    let accept = derive_accept_key(key.as_bytes());
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await?;

    Ok(WebSocketStream::from_raw_socket(stream, Role::Server, None).await)
}

/// Reads from the socket until the end of the request head (`\r\n\r\n`).
///
/// An RFC 6455 client sends no frames before it has seen the 101
/// response, so on the upgrade path the head terminator is the last byte
/// on the wire here.
async fn read_request_head(stream: &mut TcpStream) -> Result<Vec<u8>, ServerError> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            // Peer closed before completing the request.
            return Err(ServerError::NotAnUpgrade);
        }
        head.extend_from_slice(&buf[..n]);

        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() > MAX_REQUEST_HEAD {
            return Err(ServerError::NotAnUpgrade);
        }
    }
}

/// Returns the `Sec-WebSocket-Key` value if the request head is a
/// well-formed WebSocket upgrade request (RFC 6455 §4.2.1).
fn upgrade_key(head: &[u8]) -> Option<String> {
    let head = std::str::from_utf8(head).ok()?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next()?;
    if !request_line.starts_with("GET ") {
        return None;
    }

    let mut upgrade = false;
    let mut connection = false;
    let mut version = false;
    let mut key = None;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        if name.eq_ignore_ascii_case("upgrade") {
            upgrade = value.eq_ignore_ascii_case("websocket");
        } else if name.eq_ignore_ascii_case("connection") {
            connection = value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        } else if name.eq_ignore_ascii_case("sec-websocket-version") {
            version = value == "13";
        } else if name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.to_owned());
        }
    }

    if upgrade && connection && version { key } else { None }
}
