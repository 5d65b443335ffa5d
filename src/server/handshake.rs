//! Upgrade handshake
//!
//! Reads the HTTP request head off a raw stream and answers the WebSocket
//! upgrade request.
//!
//! ```http
//! GET / HTTP/1.1
//! Host: localhost:3000
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use bytes::{Buf, BytesMut};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// GUID appended to the client key before hashing
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Most headers accepted in a request head
const MAX_HEADERS: usize = 64;

/// Response sent when the upgrade request carries no key
pub const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

/// Errors that can occur while reading the request head
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Malformed request: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("Request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Connection closed before request head completed")]
    ConnectionClosed,

    #[error("Timed out waiting for request head")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for handshake operations
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Compute the `Sec-WebSocket-Accept` token for a client key
pub fn compute_accept_key(client_key: impl AsRef<[u8]>) -> String {
    let mut sha = Sha1::new();
    sha.update(client_key.as_ref());
    sha.update(WS_GUID.as_bytes());
    B64.encode(sha.finalize())
}

/// Render the `101 Switching Protocols` response for an accept token
pub fn switching_protocols_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key
    )
}

/// A parsed HTTP request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Header names as sent, values as raw bytes
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Look up a header value, ignoring name case
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }

    /// Look up a header value that is valid UTF-8
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    /// Whether the request asks to switch protocols
    ///
    /// Requires an `Upgrade` header and a `Connection` header listing the
    /// `upgrade` token.
    pub fn is_upgrade(&self) -> bool {
        let connection_upgrade = self
            .header_str("connection")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false);

        connection_upgrade && self.header("upgrade").is_some()
    }
}

/// Decision for an upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Switch protocols, answering with this accept token
    Accept { accept_key: String },
    /// Answer 400 and close
    Reject,
}

impl HandshakeOutcome {
    /// Bytes to write back to the peer
    pub fn response(&self) -> Vec<u8> {
        match self {
            Self::Accept { accept_key } => switching_protocols_response(accept_key).into_bytes(),
            Self::Reject => BAD_REQUEST_RESPONSE.to_vec(),
        }
    }
}

/// Answer an upgrade request from its headers
///
/// A missing or empty `Sec-WebSocket-Key` is rejected. The key is not
/// checked for base64 shape, and `Sec-WebSocket-Version` is not checked.
pub fn respond(head: &RequestHead) -> HandshakeOutcome {
    match head.header("sec-websocket-key") {
        Some(key) if !key.is_empty() => HandshakeOutcome::Accept {
            accept_key: compute_accept_key(key),
        },
        _ => HandshakeOutcome::Reject,
    }
}

/// Try to parse a complete request head from the front of `buf`
///
/// Returns the head and the number of bytes it used, or `None` if more
/// bytes are needed.
pub fn parse_request_head(
    buf: &[u8],
    max_request_bytes: usize,
) -> HandshakeResult<Option<(RequestHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf)? {
        httparse::Status::Complete(consumed) => {
            if consumed > max_request_bytes {
                return Err(HandshakeError::TooLarge(max_request_bytes));
            }

            let head = RequestHead {
                method: req.method.unwrap_or_default().to_string(),
                path: req.path.unwrap_or_default().to_string(),
                headers: req
                    .headers
                    .iter()
                    .map(|h| (h.name.to_string(), h.value.to_vec()))
                    .collect(),
            };
            Ok(Some((head, consumed)))
        }
        httparse::Status::Partial => {
            if buf.len() >= max_request_bytes {
                return Err(HandshakeError::TooLarge(max_request_bytes));
            }
            Ok(None)
        }
    }
}

/// Read a request head from `stream`
///
/// Bytes that arrive after the head stay in `buf`.
pub async fn read_request_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max_request_bytes: usize,
) -> HandshakeResult<RequestHead>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            if let Some((head, consumed)) = parse_request_head(&buf[..], max_request_bytes)? {
                buf.advance(consumed);
                return Ok(head);
            }
        }

        if stream.read_buf(buf).await? == 0 {
            return Err(HandshakeError::ConnectionClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const UPGRADE_REQUEST: &[u8] = b"GET / HTTP/1.1\r\n\
        Host: localhost:3000\r\n\
        Upgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    fn parse(bytes: &[u8]) -> RequestHead {
        parse_request_head(bytes, 8192).unwrap().unwrap().0
    }

    #[test]
    fn test_accept_key_vector() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_respond_accepts_with_token() {
        let head = parse(UPGRADE_REQUEST);
        assert!(head.is_upgrade());

        let outcome = respond(&head);
        assert_eq!(
            outcome,
            HandshakeOutcome::Accept {
                accept_key: "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=".to_string()
            }
        );

        let response = String::from_utf8(outcome.response()).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Upgrade: websocket\r\n"));
        assert!(response.contains("Connection: Upgrade\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_respond_rejects_missing_key() {
        let head = parse(
            b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        );
        assert!(head.is_upgrade());

        let outcome = respond(&head);
        assert_eq!(outcome, HandshakeOutcome::Reject);
        assert_eq!(outcome.response(), BAD_REQUEST_RESPONSE);
    }

    #[test]
    fn test_respond_rejects_empty_key() {
        let head = parse(b"GET / HTTP/1.1\r\nSec-WebSocket-Key: \r\n\r\n");
        assert_eq!(respond(&head), HandshakeOutcome::Reject);
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let head = parse(b"GET / HTTP/1.1\r\nSEC-WEBSOCKET-KEY: abc\r\n\r\n");
        assert_eq!(head.header("sec-websocket-key"), Some(&b"abc"[..]));
        assert_eq!(head.header_str("Sec-WebSocket-Key"), Some("abc"));
        assert!(head.header("origin").is_none());
    }

    #[test]
    fn test_plain_get_is_not_upgrade() {
        let head = parse(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/");
        assert!(!head.is_upgrade());

        let head = parse(b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n");
        assert!(!head.is_upgrade());
    }

    #[test]
    fn test_partial_head_needs_more() {
        let partial = &UPGRADE_REQUEST[..20];
        assert!(parse_request_head(partial, 8192).unwrap().is_none());
    }

    #[test]
    fn test_head_too_large() {
        let partial = &UPGRADE_REQUEST[..40];
        assert!(matches!(
            parse_request_head(partial, 32),
            Err(HandshakeError::TooLarge(32))
        ));
    }

    #[test]
    fn test_malformed_head() {
        assert!(matches!(
            parse_request_head(b"\x00\x01garbage\r\n\r\n", 8192),
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_read_request_head_keeps_trailing_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let mut bytes = UPGRADE_REQUEST.to_vec();
        bytes.extend_from_slice(&[0x81, 0x80]);
        client.write_all(&bytes).await.unwrap();

        let mut buf = BytesMut::with_capacity(1024);
        let head = read_request_head(&mut server, &mut buf, 8192).await.unwrap();

        assert_eq!(head.header_str("host"), Some("localhost:3000"));
        assert_eq!(&buf[..], &[0x81, 0x80]);
    }

    #[tokio::test]
    async fn test_read_request_head_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            read_request_head(&mut server, &mut buf, 8192).await
        });

        for chunk in UPGRADE_REQUEST.chunks(7) {
            client.write_all(chunk).await.unwrap();
            tokio::task::yield_now().await;
        }

        let head = reader.await.unwrap().unwrap();
        assert!(head.is_upgrade());
    }

    #[tokio::test]
    async fn test_read_request_head_connection_closed() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(client);

        let mut buf = BytesMut::new();
        let result = read_request_head(&mut server, &mut buf, 8192).await;
        assert!(matches!(result, Err(HandshakeError::ConnectionClosed)));
    }
}
