//! End-to-end tests: a real gateway on an ephemeral port, local TCP
//! destinations, and clients speaking both wire formats.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mailgate_client::{StreamEvent, TunnelClient, TunnelStream};
use mailgate_core::{codec, GateResult, Message, WireFormat};
use mailgate_server::config::ConfigFile;
use mailgate_server::{CliOverrides, GatewayServer, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Gateway {
    url: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<GateResult<()>>,
}

async fn start_gateway() -> Gateway {
    let overrides = CliOverrides {
        port: Some(0),
        bind: Some("127.0.0.1".into()),
        ..Default::default()
    };
    let config = ServerConfig::resolve(ConfigFile::default(), &overrides).unwrap();
    let server = GatewayServer::bind(&config).await.unwrap();
    let url = format!("ws://{}", server.local_addr());

    let (stop, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run(async move {
        let _ = stop_rx.await;
    }));
    Gateway { url, stop, task }
}

/// Echo every byte back; close once the peer half-closes.
async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = sock.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    port
}

/// A port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn read_data(stream: &mut TunnelStream, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        match timeout(WAIT, stream.next_event()).await.unwrap() {
            Some(StreamEvent::Data(bytes)) => out.extend_from_slice(&bytes),
            other => panic!("expected data, got {other:?}"),
        }
    }
    out
}

async fn next_event(stream: &mut TunnelStream) -> Option<StreamEvent> {
    timeout(WAIT, stream.next_event()).await.unwrap()
}

async fn raw_connect(url: &str) -> RawWs {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn raw_send(ws: &mut RawWs, json: &str) {
    ws.send(WsMessage::Text(json.to_string())).await.unwrap();
}

async fn raw_recv(ws: &mut RawWs) -> Message {
    loop {
        match timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap() {
            WsMessage::Text(text) => {
                return codec::decode(text.as_bytes(), WireFormat::Json).unwrap()
            }
            WsMessage::Binary(_) => panic!("JSON session answered with a binary frame"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn echo_round_trip_then_half_close() {
    let gateway = start_gateway().await;
    let echo = echo_server().await;

    let client = TunnelClient::connect(&gateway.url).await.unwrap();
    let mut stream = client.open("127.0.0.1", echo).await.unwrap();
    assert_eq!(stream.id(), 1);

    stream.send(b"A\r\n".to_vec()).unwrap();
    assert_eq!(read_data(&mut stream, 3).await, b"A\r\n");

    stream.end().unwrap();
    assert_eq!(next_event(&mut stream).await, Some(StreamEvent::End));
    assert_eq!(next_event(&mut stream).await, Some(StreamEvent::Close));
    assert_eq!(next_event(&mut stream).await, None);

    client.close().await;
    let _ = gateway.stop.send(());
    timeout(WAIT, gateway.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn refused_destination_reports_error_then_close() {
    let gateway = start_gateway().await;
    let port = closed_port().await;

    let mut ws = raw_connect(&gateway.url).await;
    raw_send(
        &mut ws,
        &format!(r#"{{"type":"open","request_id":1,"host":"127.0.0.1","port":{port}}}"#),
    )
    .await;

    match raw_recv(&mut ws).await {
        Message::Error {
            stream_id,
            request_id,
            message,
        } => {
            assert_eq!(stream_id, 1);
            assert_eq!(request_id, Some(1));
            assert!(!message.is_empty());
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(raw_recv(&mut ws).await, Message::Close { stream_id: 1 });

    // Nothing else is queued for the dead stream.
    raw_send(&mut ws, r#"{"type":"ping","id":9}"#).await;
    assert_eq!(raw_recv(&mut ws).await, Message::Pong { id: 9 });
}

#[tokio::test]
async fn failed_opens_still_consume_stream_ids() {
    let gateway = start_gateway().await;
    let echo = echo_server().await;
    let refused = closed_port().await;

    let client = TunnelClient::connect(&gateway.url).await.unwrap();
    assert!(client.open("127.0.0.1", refused).await.is_err());
    let stream = client.open("127.0.0.1", echo).await.unwrap();
    assert_eq!(stream.id(), 2);
}

#[tokio::test]
async fn concurrent_streams_are_isolated() {
    let gateway = start_gateway().await;
    let echo = echo_server().await;

    let client = TunnelClient::connect(&gateway.url).await.unwrap();
    let mut first = client.open("127.0.0.1", echo).await.unwrap();
    let mut second = client.open("127.0.0.1", echo).await.unwrap();
    assert_ne!(first.id(), second.id());

    second.send(b"second stream".to_vec()).unwrap();
    first.send(b"first".to_vec()).unwrap();

    assert_eq!(read_data(&mut first, 5).await, b"first");
    assert_eq!(read_data(&mut second, 13).await, b"second stream");

    first.end().unwrap();
    assert_eq!(next_event(&mut first).await, Some(StreamEvent::End));
    assert_eq!(next_event(&mut first).await, Some(StreamEvent::Close));

    // The other stream keeps working.
    second.send(b"still here".to_vec()).unwrap();
    assert_eq!(read_data(&mut second, 10).await, b"still here");
}

#[tokio::test]
async fn writes_arrive_in_order_and_acks_follow_the_bytes() {
    let gateway = start_gateway().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (received_tx, received_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut all = Vec::new();
        sock.read_to_end(&mut all).await.unwrap();
        let _ = received_tx.send(all);
    });

    let client = TunnelClient::connect(&gateway.url).await.unwrap();
    let mut stream = client.open("127.0.0.1", port).await.unwrap();

    let mut expected = Vec::new();
    for i in 0..200 {
        let chunk = format!("chunk-{i};");
        expected.extend_from_slice(chunk.as_bytes());
        stream.send(chunk.into_bytes()).unwrap();
    }
    timeout(WAIT, stream.send_acked(b"last".to_vec())).await.unwrap().unwrap();
    expected.extend_from_slice(b"last");
    stream.end().unwrap();

    let received = timeout(WAIT, received_rx).await.unwrap().unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn empty_write_is_acknowledged() {
    let gateway = start_gateway().await;
    let echo = echo_server().await;

    let client = TunnelClient::connect(&gateway.url).await.unwrap();
    let mut stream = client.open("127.0.0.1", echo).await.unwrap();
    timeout(WAIT, stream.send_acked(Vec::new())).await.unwrap().unwrap();

    stream.send(b"x".to_vec()).unwrap();
    assert_eq!(read_data(&mut stream, 1).await, b"x");
}

#[tokio::test]
async fn disconnect_closes_destination_sockets() {
    let gateway = start_gateway().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = TunnelClient::connect(&gateway.url).await.unwrap();
    let _stream = client.open("127.0.0.1", port).await.unwrap();
    let (mut peer, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

    client.close().await;

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, peer.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0, "destination socket should be closed with the session");
}

#[tokio::test]
async fn messages_for_unknown_streams_are_ignored() {
    let gateway = start_gateway().await;
    let mut ws = raw_connect(&gateway.url).await;

    raw_send(&mut ws, r#"{"type":"data","stream_id":42,"data":[104,105]}"#).await;
    raw_send(&mut ws, r#"{"type":"end","stream_id":42}"#).await;
    raw_send(&mut ws, r#"{"type":"not-a-message"}"#).await;
    raw_send(&mut ws, r#"{"type":"ping","id":1}"#).await;

    assert_eq!(raw_recv(&mut ws).await, Message::Pong { id: 1 });
}

#[tokio::test]
async fn json_session_gets_json_replies() {
    let gateway = start_gateway().await;
    let echo = echo_server().await;
    let mut ws = raw_connect(&gateway.url).await;

    raw_send(
        &mut ws,
        &format!(r#"{{"type":"open","request_id":3,"host":"127.0.0.1","port":{echo}}}"#),
    )
    .await;
    assert_eq!(
        raw_recv(&mut ws).await,
        Message::Opened {
            request_id: 3,
            stream_id: 1
        }
    );

    raw_send(&mut ws, r#"{"type":"data","stream_id":1,"data":[72,73]}"#).await;
    let mut echoed = Vec::new();
    while echoed.len() < 2 {
        match raw_recv(&mut ws).await {
            Message::Data { stream_id, data, .. } => {
                assert_eq!(stream_id, 1);
                echoed.extend_from_slice(&data);
            }
            other => panic!("expected data, got {other:?}"),
        }
    }
    assert_eq!(echoed, b"HI");
}

#[tokio::test]
async fn ping_over_cbor_session() {
    let gateway = start_gateway().await;
    let client = TunnelClient::connect(&gateway.url).await.unwrap();
    let rtt = client.ping().await.unwrap();
    assert!(rtt < WAIT);
}

#[tokio::test]
async fn server_shutdown_ends_sessions_and_streams() {
    let gateway = start_gateway().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = TunnelClient::connect(&gateway.url).await.unwrap();
    let mut stream = client.open("127.0.0.1", port).await.unwrap();
    let (mut peer, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

    let _ = gateway.stop.send(());
    timeout(WAIT, gateway.task).await.unwrap().unwrap().unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, peer.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(next_event(&mut stream).await, None);
}
