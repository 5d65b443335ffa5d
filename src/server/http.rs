//! Plain HTTP responder
//!
//! Serves the fixed document for non-upgrade `GET /` requests.

use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::handshake::RequestHead;

/// Response sent when the document cannot be opened
pub const NOT_FOUND_RESPONSE: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// What the responder did with a plain HTTP request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentOutcome {
    /// The document was sent, with its size in bytes
    Served(u64),
    /// The document could not be opened; 404 was sent
    NotFound,
    /// The request was not `GET /`; nothing was sent
    Unhandled,
}

/// Answer a non-upgrade request
///
/// Only `GET /` gets a response. The caller closes the stream afterwards.
pub async fn serve_document<W>(
    writer: &mut W,
    head: &RequestHead,
    document: &Path,
) -> std::io::Result<DocumentOutcome>
where
    W: AsyncWrite + Unpin,
{
    if head.method != "GET" || head.path != "/" {
        debug!("No handler for {} {}", head.method, head.path);
        return Ok(DocumentOutcome::Unhandled);
    }

    let mut file = match tokio::fs::File::open(document).await {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open document {}: {}", document.display(), e);
            writer.write_all(NOT_FOUND_RESPONSE).await?;
            writer.shutdown().await?;
            return Ok(DocumentOutcome::NotFound);
        }
    };
    let len = file.metadata().await?.len();

    let header = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        len
    );
    writer.write_all(header.as_bytes()).await?;
    let sent = tokio::io::copy(&mut file, writer).await?;
    writer.shutdown().await?;

    debug!("Served {} ({} bytes)", document.display(), sent);
    Ok(DocumentOutcome::Served(sent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handshake::parse_request_head;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn head(request: &[u8]) -> RequestHead {
        parse_request_head(request, 8192).unwrap().unwrap().0
    }

    async fn serve(request: &[u8], document: &Path) -> (DocumentOutcome, String) {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let outcome = serve_document(&mut server, &head(request), document)
            .await
            .unwrap();
        drop(server);

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        (outcome, response)
    }

    #[tokio::test]
    async fn test_serves_document_for_root() {
        let temp_dir = TempDir::new().unwrap();
        let document = temp_dir.path().join("index.html");
        std::fs::write(&document, "<h1>relay</h1>").unwrap();

        let (outcome, response) = serve(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &document).await;

        assert_eq!(outcome, DocumentOutcome::Served(14));
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Length: 14\r\n"));
        assert!(response.ends_with("\r\n\r\n<h1>relay</h1>"));
    }

    #[tokio::test]
    async fn test_missing_document_is_404() {
        let temp_dir = TempDir::new().unwrap();
        let document = temp_dir.path().join("missing.html");

        let (outcome, response) = serve(b"GET / HTTP/1.1\r\n\r\n", &document).await;

        assert_eq!(outcome, DocumentOutcome::NotFound);
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn test_other_paths_unhandled() {
        let temp_dir = TempDir::new().unwrap();
        let document = temp_dir.path().join("index.html");
        std::fs::write(&document, "x").unwrap();

        for request in [
            &b"GET /other HTTP/1.1\r\n\r\n"[..],
            &b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n"[..],
        ] {
            let (outcome, response) = serve(request, &document).await;
            assert_eq!(outcome, DocumentOutcome::Unhandled);
            assert!(response.is_empty());
        }
    }
}
