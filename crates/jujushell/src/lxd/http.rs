//! Minimal HTTP/1.1 transport over the LXD unix socket.
//!
//! Every request dials its own stream, so a stalled or poisoned exchange
//! never affects other sessions talking to the daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use super::error::Error;

/// Host header value used on the daemon socket; LXD ignores it but HTTP/1.1
/// requires one.
const LXD_HOST: &str = "lxd";

#[derive(Debug, Clone)]
pub(crate) struct UnixHttp {
    socket: Arc<PathBuf>,
}

impl UnixHttp {
    pub fn new(socket: PathBuf) -> Self {
        Self {
            socket: Arc::new(socket),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Perform one request against the daemon and buffer the whole response.
    pub async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &[(&'static str, String)],
        body: Bytes,
    ) -> Result<(StatusCode, HeaderMap, Bytes), Error> {
        let stream = UnixStream::connect(self.socket.as_ref())
            .await
            .map_err(|err| Error::Connect {
                socket: self.socket.display().to_string(),
                reason: err.to_string(),
            })?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("LXD connection terminated: {err}");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path_and_query)
            .header(HOST, LXD_HOST);
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|err| Error::Transport(err.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        let (parts, body) = response.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|err| Error::Transport(err.to_string()))?
            .to_bytes();
        Ok((parts.status, parts.headers, bytes))
    }
}

/// Percent-encode a value for use in a query string.
pub(crate) fn query_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    use super::*;

    #[test]
    fn query_encoding_keeps_path_characters() {
        assert_eq!(
            query_encode("/home/ubuntu/.local/share/juju"),
            "/home/ubuntu/.local/share/juju"
        );
        assert_eq!(query_encode("a b+c"), "a%20b%2Bc");
    }

    #[tokio::test]
    async fn performs_a_request_over_a_unix_socket() {
        let dir = std::env::temp_dir().join(format!("jujushell-http-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("lxd.socket");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            let body = r#"{"type": "sync", "metadata": {"name": "ts-1"}}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });

        let http = UnixHttp::new(path.clone());
        let (status, _, body) = http
            .request(Method::GET, "/1.0/containers/ts-1", &[], Bytes::new())
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with(br#"{"type": "sync""#));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_socket_is_a_connect_error() {
        let http = UnixHttp::new(PathBuf::from("/nonexistent/lxd.socket"));
        match http
            .request(Method::GET, "/1.0", &[], Bytes::new())
            .await
        {
            Err(Error::Connect { socket, .. }) => {
                assert_eq!(socket, "/nonexistent/lxd.socket");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
