//! WebSocket tunneling.
//!
//! An `Upgrade: websocket` request is relayed by hand: the relay opens a
//! raw TCP (or TLS) connection to the target, replays the client's
//! handshake line and headers, relays the target's handshake response, and
//! then lifts the client connection out of the HTTP server so the two
//! sockets can be spliced together. No framing awareness: bytes are piped
//! in both directions until either side closes.

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::HOST;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::Response;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::relay::engine::text_response;

/// Cap on the size of the target's handshake response head.
const MAX_HANDSHAKE_HEAD: usize = 16 * 1024;

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

type BoxedIo = Box<dyn Io>;

/// Relays a WebSocket upgrade request. Always produces a response for the
/// client; on success it is the target's own handshake response, and the
/// byte tunnel is spawned in the background.
pub(crate) async fn handle_upgrade(mut request: Request<Body>) -> Response {
    // The caller verified the URI is absolute.
    let Some(authority) = request.uri().authority().cloned() else {
        return text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Cannot respond to relative (non-absolute) requests: {}", request.uri()),
        );
    };
    let scheme = request.uri().scheme_str().unwrap_or("http").to_string();

    tracing::info!(url = %request.uri(), "upgrading to websocket");

    let mut target = match dial(&scheme, authority.host(), authority.port_u16()).await {
        Ok(target) => target,
        Err(error) => {
            tracing::error!(host = %authority, %error, "error setting up target websocket");
            return text_response(
                StatusCode::NOT_FOUND,
                format!("Could not dial connect {authority}: {error}"),
            );
        }
    };

    if let Err(error) = write_handshake(&mut target, &request).await {
        tracing::error!(host = %authority, %error, "could not write the WS request");
        return text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Could not write the WS request: {authority} {error}"),
        );
    }

    // Relay the target's handshake response head verbatim; any bytes the
    // target sent beyond the head belong to the tunnel.
    let (head, leftover) = match read_handshake_head(&mut target).await {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::error!(host = %authority, %error, "could not read the WS handshake response");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Could not read the WS handshake response: {authority} {error}"),
            );
        }
    };

    let Some(on_upgrade) = request.extensions_mut().remove::<OnUpgrade>() else {
        tracing::error!("connection does not support hijacking");
        return text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Does not support hijacking".to_string(),
        );
    };

    if head.status == StatusCode::SWITCHING_PROTOCOLS {
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => tunnel(TokioIo::new(upgraded), target, leftover).await,
                Err(error) => tracing::error!(%error, "websocket client hijack failed"),
            }
        });
    } else {
        tracing::warn!(status = %head.status, "target refused the websocket handshake");
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    response
}

/// Opens the raw connection to the target, wrapping it in TLS when the
/// outbound scheme is https.
async fn dial(
    scheme: &str,
    host: &str,
    port: Option<u16>,
) -> Result<BoxedIo, Box<dyn std::error::Error + Send + Sync>> {
    let port = port.unwrap_or(if scheme == "https" { 443 } else { 80 });
    let stream = TcpStream::connect((host, port)).await?;

    if scheme != "https" {
        return Ok(Box::new(stream));
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_string())?;
    let stream = connector.connect(server_name, stream).await?;

    Ok(Box::new(stream))
}

/// Replays the client's handshake to the target: request line, Host, the
/// remaining headers, then a blank line.
async fn write_handshake(
    target: &mut BoxedIo,
    request: &Request<Body>,
) -> Result<(), std::io::Error> {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();

    let mut handshake = format!(
        "{} {} {:?}\r\nHost: {}\r\n",
        request.method(),
        request.uri(),
        request.version(),
        host
    )
    .into_bytes();

    for (name, value) in request.headers() {
        if name == HOST {
            continue;
        }
        handshake.extend_from_slice(name.as_str().as_bytes());
        handshake.extend_from_slice(b": ");
        handshake.extend_from_slice(value.as_bytes());
        handshake.extend_from_slice(b"\r\n");
    }
    handshake.extend_from_slice(b"\r\n");

    target.write_all(&handshake).await?;
    target.flush().await
}

struct HandshakeHead {
    status: StatusCode,
    headers: HeaderMap,
}

/// Reads the target's response head (through the blank line) and parses the
/// status and headers out of it. Bytes read past the head are returned for
/// the tunnel to deliver.
async fn read_handshake_head(
    target: &mut BoxedIo,
) -> Result<(HandshakeHead, Vec<u8>), Box<dyn std::error::Error + Send + Sync>> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(position) = find_head_end(&buffer) {
            break position;
        }
        if buffer.len() > MAX_HANDSHAKE_HEAD {
            return Err("handshake response head too large".into());
        }

        let read = target.read(&mut chunk).await?;
        if read == 0 {
            return Err("connection closed during handshake".into());
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let head = std::str::from_utf8(&buffer[..head_end])?;
    let leftover = buffer[head_end + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let code = status_line
        .split_whitespace()
        .nth(1)
        .ok_or("malformed handshake status line")?;
    let status = StatusCode::from_bytes(code.as_bytes())?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or("malformed handshake header")?;
        headers.append(
            HeaderName::from_bytes(name.trim().as_bytes())?,
            HeaderValue::from_str(value.trim())?,
        );
    }

    Ok((HandshakeHead { status, headers }, leftover))
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Pipes bytes between the hijacked client connection and the target.
/// When either direction finishes, both endpoints drop and the pair closes.
async fn tunnel(client: impl AsyncRead + AsyncWrite + Unpin + Send, target: BoxedIo, leftover: Vec<u8>) {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    if !leftover.is_empty() && client_write.write_all(&leftover).await.is_err() {
        return;
    }

    let client_to_target = async {
        let _ = tokio::io::copy(&mut client_read, &mut target_write).await;
    };
    let target_to_client = async {
        let _ = tokio::io::copy(&mut target_read, &mut client_write).await;
    };

    tokio::select! {
        _ = client_to_target => {}
        _ = target_to_client => {}
    }

    tracing::debug!("websocket tunnel closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_the_end_of_the_head() {
        assert_eq!(find_head_end(b"HTTP/1.1 101 X\r\n\r\nrest"), Some(14));
        assert_eq!(find_head_end(b"HTTP/1.1 101 X\r\n"), None);
    }

    #[tokio::test]
    async fn parses_a_handshake_head() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: abc123=\r\n\
\r\nframe-bytes";
        let (reader, mut writer) = tokio::io::duplex(1024);
        writer.write_all(raw).await.unwrap();
        drop(writer);

        let mut boxed: BoxedIo = Box::new(reader);
        let (head, leftover) = read_handshake_head(&mut boxed).await.unwrap();

        assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(head.headers.get("Sec-WebSocket-Accept").unwrap(), "abc123=");
        assert_eq!(leftover, b"frame-bytes");
    }

    #[tokio::test]
    async fn rejects_an_unterminated_head() {
        let (reader, mut writer) = tokio::io::duplex(1024);
        writer.write_all(b"HTTP/1.1 101 partial").await.unwrap();
        drop(writer);

        let mut boxed: BoxedIo = Box::new(reader);
        assert!(read_handshake_head(&mut boxed).await.is_err());
    }
}
