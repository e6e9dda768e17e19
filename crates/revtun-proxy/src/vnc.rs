//! VNC bridge: noVNC in the browser, websockify toward the tunnel

use crate::middleware::{html_error, no_cache};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::middleware::from_fn;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::StatusCode;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::{debug, error, warn};

/// First bytes of every RFB server greeting
pub const VNC_MAGIC: &[u8] = b"RFB";

const WEBSOCKET_PROTOCOL: &str = "binary";

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Revtun VNC</title>
<meta http-equiv="refresh" content="0; url=vnc.html?autoconnect=true&amp;resize=scale&amp;path=vnc">
</head>
<body></body>
</html>
"#;

#[derive(Debug, Clone)]
pub(crate) struct VncBackend {
    pub(crate) addr: String,
    pub(crate) shutdown: CancellationToken,
}

pub(crate) fn router(backend: VncBackend, novnc_root: Option<PathBuf>) -> Router {
    let has_client = novnc_root.is_some();
    let router = Router::new()
        .route("/vnc", get(websocket))
        .route("/", get(move || index(has_client)))
        .with_state(Arc::new(backend));

    let router = match novnc_root {
        Some(root) => router.fallback_service(ServeDir::new(root).not_found_service(
            tower::service_fn(|_: Request| async {
                Ok::<_, Infallible>(html_error(StatusCode::NOT_FOUND, "not found"))
            }),
        )),
        None => router.fallback(|| async { html_error(StatusCode::NOT_FOUND, "not found") }),
    };

    router.layer(from_fn(no_cache))
}

async fn index(has_client: bool) -> Response {
    match has_client {
        true => Html(INDEX_HTML).into_response(),
        false => html_error(StatusCode::NOT_FOUND, "noVNC is not configured"),
    }
}

async fn websocket(State(backend): State<Arc<VncBackend>>, ws: WebSocketUpgrade) -> Response {
    let backend = backend.as_ref().clone();
    ws.protocols([WEBSOCKET_PROTOCOL])
        .on_upgrade(move |socket| websockify(socket, backend))
}

/// Tracks the backend greeting until enough bytes were seen
#[derive(Debug, Default)]
struct MagicSniffer {
    seen: Vec<u8>,
}

impl MagicSniffer {
    /// False once the backend sent something other than the RFB greeting
    fn accept(&mut self, chunk: &[u8]) -> bool {
        if self.seen.len() >= VNC_MAGIC.len() {
            return true;
        }
        let take = (VNC_MAGIC.len() - self.seen.len()).min(chunk.len());
        self.seen.extend_from_slice(&chunk[..take]);
        VNC_MAGIC.starts_with(&self.seen)
    }
}

async fn websockify(mut socket: WebSocket, backend: VncBackend) {
    let tcp = match TcpStream::connect(&backend.addr).await {
        Ok(tcp) => tcp,
        Err(e) => {
            error!(backend = %backend.addr, "VNC backend dial failed: {}", e);
            let text = format!("tcp dialing failed: {}", e);
            let _ = socket.send(Message::Text(text.into())).await;
            let _ = SinkExt::close(&mut socket).await;
            return;
        }
    };
    debug!(backend = %backend.addr, "VNC bridge connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut tcp_rx, mut tcp_tx) = tcp.into_split();

    let client_to_backend = async move {
        while let Some(Ok(message)) = ws_rx.next().await {
            let data = match message {
                Message::Binary(data) => data,
                Message::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Message::Close(_) => break,
                _ => continue,
            };
            if tcp_tx.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = tcp_tx.shutdown().await;
    };

    let addr = backend.addr.clone();
    let backend_to_client = async move {
        let mut sniffer = MagicSniffer::default();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = match tcp_rx.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if !sniffer.accept(&buf[..n]) {
                warn!(backend = %addr, "Attempt to connect to a non-VNC port");
                break;
            }
            let message = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    };

    tokio::select! {
        _ = backend.shutdown.cancelled() => {}
        _ = client_to_backend => {}
        _ = backend_to_client => {}
    }
    debug!(backend = %backend.addr, "VNC bridge closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniffer_accepts_rfb_greeting() {
        let mut sniffer = MagicSniffer::default();
        assert!(sniffer.accept(b"RFB 003.008\n"));
        assert!(sniffer.accept(b"anything afterwards"));
    }

    #[test]
    fn test_sniffer_across_chunks() {
        let mut sniffer = MagicSniffer::default();
        assert!(sniffer.accept(b"R"));
        assert!(sniffer.accept(b"F"));
        assert!(!sniffer.accept(b"X"));
    }

    #[test]
    fn test_sniffer_rejects_other_protocols() {
        let mut sniffer = MagicSniffer::default();
        assert!(!sniffer.accept(b"SSH-2.0-OpenSSH_9.6\r\n"));
    }
}
