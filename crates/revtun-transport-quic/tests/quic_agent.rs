use revtun_proto::{AgentHello, ForwardingSpec, HelloResponse, CHANNEL_TYPE, UNKNOWN_REQUEST};
use revtun_transport::dialer::unknown_request;
use revtun_transport::{AgentTransport, TransportError};
use revtun_transport_quic::{QuicConfig, QuicConnector, QuicListener};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn hello() -> AgentHello {
    AgentHello {
        agent_id: "agent-1".to_string(),
        auth_id: "auth-1".to_string(),
        name: None,
        session_id: "session-1".to_string(),
        version: "0.7.0".to_string(),
        tunnels: vec![ForwardingSpec::new("127.0.0.1", 22)],
    }
}

#[tokio::test]
async fn test_hello_channel_and_request_over_quic() {
    let _ = tracing_subscriber::fmt::try_init();

    let server_config = Arc::new(QuicConfig::server_self_signed().unwrap());
    let listener = QuicListener::new("127.0.0.1:0".parse().unwrap(), server_config).unwrap();
    let server_addr = listener.local_addr().unwrap();

    // echo service the agent will dial
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = echo.accept().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
    });

    let agent = tokio::spawn(async move {
        let connector = QuicConnector::new(Arc::new(QuicConfig::client_insecure())).unwrap();
        let (connection, response) = connector
            .connect(server_addr, "localhost", hello())
            .await
            .unwrap();
        assert!(matches!(response, HelloResponse::Accepted { .. }));
        connection.serve(Arc::new(unknown_request)).await;
    });

    let connection = listener.accept().await.unwrap();
    let (received, replier) = connection.accept_hello().await.unwrap();
    assert_eq!(received, hello());
    replier
        .respond(HelloResponse::Accepted { tunnels: vec![] })
        .await
        .unwrap();

    let mut channel = connection
        .open_channel(CHANNEL_TYPE, echo_addr.to_string().as_bytes())
        .await
        .unwrap();
    channel.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    channel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    let reply = connection.request("tunnel_allowed", b"x").await.unwrap();
    assert!(!reply.ok);
    assert_eq!(reply.message(), UNKNOWN_REQUEST);

    connection.close("test done").await;
    assert!(connection.is_closed());
    agent.await.unwrap();
}

#[tokio::test]
async fn test_channel_rejected_when_agent_cannot_dial() {
    let server_config = Arc::new(QuicConfig::server_self_signed().unwrap());
    let listener = QuicListener::new("127.0.0.1:0".parse().unwrap(), server_config).unwrap();
    let server_addr = listener.local_addr().unwrap();

    // grab a port nobody listens on
    let closed_port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };

    tokio::spawn(async move {
        let connector = QuicConnector::new(Arc::new(QuicConfig::client_insecure())).unwrap();
        let (connection, _) = connector
            .connect(server_addr, "localhost", hello())
            .await
            .unwrap();
        connection.serve(Arc::new(unknown_request)).await;
    });

    let connection = listener.accept().await.unwrap();
    let (_, replier) = connection.accept_hello().await.unwrap();
    replier
        .respond(HelloResponse::Accepted { tunnels: vec![] })
        .await
        .unwrap();

    let payload = format!("127.0.0.1:{}", closed_port);
    let err = connection
        .open_channel(CHANNEL_TYPE, payload.as_bytes())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::ChannelRejected(_)));
}
