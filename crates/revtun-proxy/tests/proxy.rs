use axum::extract::Request;
use axum::Router;
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use revtun_proto::AccessList;
use revtun_proxy::{
    ProxyKind, ProxyTarget, SelfSignedCertificateProvider, TunnelProxy, TunnelProxyConfig,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

#[derive(Debug)]
struct TrustAll;

impl ServerCertVerifier for TrustAll {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

async fn tls_connect(addr: SocketAddr) -> TlsStream<TcpStream> {
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(TrustAll))
    .with_no_client_auth();

    let tcp = TcpStream::connect(addr).await.unwrap();
    TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap()
}

async fn https_get(addr: SocketAddr, path: &str, authorization: Option<String>) -> Reply {
    let tls = tls_connect(addr).await;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    let mut request = http::Request::get(path).header(http::header::HOST, "public.example.com");
    if let Some(authorization) = authorization {
        request = request.header(http::header::AUTHORIZATION, authorization);
    }
    let response = sender
        .send_request(request.body(Empty::<Bytes>::new()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    Reply {
        status,
        headers,
        body: String::from_utf8(body.to_vec()).unwrap(),
    }
}

/// Backend answering with the host header and request target it saw
async fn backend() -> u16 {
    let app = Router::new().fallback(|req: Request| async move {
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        format!("{} {}", host, req.uri())
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn target(backend_port: u16) -> ProxyTarget {
    ProxyTarget {
        bind_host: "127.0.0.1".into(),
        bind_port: 0,
        backend_host: "127.0.0.1".into(),
        backend_port,
        kind: ProxyKind::Http,
        acl: None,
        host_header: None,
        basic_auth: None,
    }
}

fn proxy(target: ProxyTarget, config: TunnelProxyConfig) -> TunnelProxy {
    let certs = SelfSignedCertificateProvider::new(vec!["localhost".into()]).unwrap();
    TunnelProxy::new(target, Arc::new(config), Arc::new(certs))
}

#[tokio::test]
async fn test_http_proxy_forwards_request() {
    let backend_port = backend().await;
    let proxy = proxy(target(backend_port), TunnelProxyConfig::default());
    let addr = proxy.start().await.unwrap();

    let reply = https_get(addr, "/hello?x=1", None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "public.example.com /hello?x=1");
    assert_eq!(
        reply.headers["x-revtun-proxy"],
        format!("127.0.0.1:{}", addr.port()).as_str()
    );

    proxy.stop().await;
}

#[tokio::test]
async fn test_host_header_override() {
    let backend_port = backend().await;
    let mut target = target(backend_port);
    target.host_header = Some("intranet.local".into());
    let proxy = proxy(target, TunnelProxyConfig::default());
    let addr = proxy.start().await.unwrap();

    let reply = https_get(addr, "/", None).await;
    assert_eq!(reply.body, "intranet.local /");

    proxy.stop().await;
}

#[tokio::test]
async fn test_acl_rejects_with_forbidden() {
    let backend_port = backend().await;
    let mut target = target(backend_port);
    target.acl = AccessList::parse("10.0.0.0/8").unwrap();
    let proxy = proxy(target, TunnelProxyConfig::default());
    let addr = proxy.start().await.unwrap();

    let reply = https_get(addr, "/", None).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert!(reply
        .body
        .contains("[403] Revtun tunnel proxy: Access rejected by ACL"));
    assert!(reply.headers.contains_key("x-revtun-proxy"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_basic_auth_required_from_callers() {
    let backend_port = backend().await;
    let mut target = target(backend_port);
    target.basic_auth = Some(("alice".into(), "wonderland".into()));
    let proxy = proxy(target, TunnelProxyConfig::default());
    let addr = proxy.start().await.unwrap();

    let reply = https_get(addr, "/", None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        reply.headers[http::header::WWW_AUTHENTICATE],
        r#"Basic realm="restricted", charset="UTF-8""#
    );

    let credentials = base64::engine::general_purpose::STANDARD.encode("alice:wonderland");
    let reply = https_get(addr, "/", Some(format!("Basic {}", credentials))).await;
    assert_eq!(reply.status, StatusCode::OK);

    proxy.stop().await;
}

#[tokio::test]
async fn test_backend_down_is_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_port = closed.local_addr().unwrap().port();
    drop(closed);

    let proxy = proxy(target(closed_port), TunnelProxyConfig::default());
    let addr = proxy.start().await.unwrap();

    let reply = https_get(addr, "/", None).await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert!(reply.body.contains("[502] Revtun tunnel proxy:"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_vnc_index_is_not_cached() {
    let mut target = target(5900);
    target.kind = ProxyKind::Vnc;
    let config = TunnelProxyConfig {
        novnc_root: Some(std::env::temp_dir()),
        ..Default::default()
    };
    let proxy = proxy(target, config);
    let addr = proxy.start().await.unwrap();

    let reply = https_get(addr, "/", None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.body.contains("path=vnc"));
    assert_eq!(
        reply.headers[http::header::CACHE_CONTROL],
        "no-cache, no-store, must-revalidate"
    );

    proxy.stop().await;
}

/// VNC-like backend: sends `greeting` on accept, then echoes
async fn greeting_backend(greeting: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                if stream.write_all(greeting).await.is_err() {
                    return;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

async fn vnc_socket(addr: SocketAddr) -> WebSocketStream<TlsStream<TcpStream>> {
    let tls = tls_connect(addr).await;
    let mut request = "wss://localhost/vnc".into_client_request().unwrap();
    request
        .headers_mut()
        .insert("sec-websocket-protocol", "binary".parse().unwrap());
    let (socket, response) = tokio_tungstenite::client_async(request, tls).await.unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    socket
}

async fn next_message(socket: &mut WebSocketStream<TlsStream<TcpStream>>) -> Option<Message> {
    tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("no websocket message in time")
        .and_then(Result::ok)
}

fn vnc_proxy(backend_port: u16) -> TunnelProxy {
    let mut target = target(backend_port);
    target.kind = ProxyKind::Vnc;
    proxy(target, TunnelProxyConfig::default())
}

#[tokio::test]
async fn test_vnc_bridge_relays_both_directions() {
    let backend_port = greeting_backend(b"RFB 003.008\n").await;
    let proxy = vnc_proxy(backend_port);
    let addr = proxy.start().await.unwrap();

    let mut socket = vnc_socket(addr).await;
    match next_message(&mut socket).await {
        Some(Message::Binary(data)) => assert_eq!(&data[..], b"RFB 003.008\n"),
        other => panic!("expected the RFB greeting, got {:?}", other),
    }

    socket
        .send(Message::Binary(b"RFB 003.008\n".to_vec().into()))
        .await
        .unwrap();
    match next_message(&mut socket).await {
        Some(Message::Binary(data)) => assert_eq!(&data[..], b"RFB 003.008\n"),
        other => panic!("expected the echoed client version, got {:?}", other),
    }

    let _ = socket.close(None).await;
    proxy.stop().await;
}

#[tokio::test]
async fn test_vnc_bridge_closes_on_non_vnc_backend() {
    let backend_port = greeting_backend(b"SSH-2.0-OpenSSH_9.6\r\n").await;
    let proxy = vnc_proxy(backend_port);
    let addr = proxy.start().await.unwrap();

    let mut socket = vnc_socket(addr).await;
    match next_message(&mut socket).await {
        None | Some(Message::Close(_)) => {}
        Some(other) => panic!("backend bytes leaked to the client: {:?}", other),
    }

    proxy.stop().await;
}

#[tokio::test]
async fn test_bind_conflict() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut target = target(1);
    target.bind_port = taken.local_addr().unwrap().port();
    let proxy = proxy(target, TunnelProxyConfig::default());

    let err = proxy.start().await.unwrap_err();
    assert!(matches!(err, revtun_proxy::ProxyError::BindError { .. }));
}
