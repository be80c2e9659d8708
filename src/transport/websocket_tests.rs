use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio::sync::oneshot;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_hdr_async, connect_async};
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tungstenite::protocol::Message as WsMessage;

use super::frame::{ValueFrame, decode_value_frame, encode_value_frame};
use super::message::Properties;
use super::value::Value;
use super::websocket::{SUBPROTOCOL_V40, SUBPROTOCOL_V41, serve};
use crate::broker::engine::{Server, SharedServer, lock};
use crate::client::{Client, ClientEvent};
use crate::config::ClientSettings;
use crate::utils::error::Nt4Error;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

async fn start_server(server: Server) -> (SocketAddr, SharedServer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shared = server.into_shared();
    tokio::spawn(serve(listener, shared.clone()));
    (addr, shared)
}

async fn connect_with(addr: SocketAddr, name: &str, protocol: &'static str) -> Ws {
    let mut request = format!("ws://{addr}/nt/{name}")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol));
    let (ws, response) = connect_async(request).await.unwrap();
    assert_eq!(
        response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
        protocol
    );
    ws
}

async fn connect(addr: SocketAddr, name: &str) -> Ws {
    connect_with(addr, name, SUBPROTOCOL_V41).await
}

async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(WsMessage::text(value.to_string())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> WsMessage {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("websocket error");
        if matches!(msg, WsMessage::Text(_) | WsMessage::Binary(_)) {
            return msg;
        }
    }
}

/// Next control message; the server sends one per text frame.
async fn recv_control(ws: &mut Ws) -> serde_json::Value {
    match recv(ws).await {
        WsMessage::Text(text) => {
            let parsed: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            let batch = parsed.as_array().expect("control payload must be an array");
            assert_eq!(batch.len(), 1);
            batch[0].clone()
        }
        other => panic!("expected a text frame, got {other:?}"),
    }
}

async fn recv_frame(ws: &mut Ws) -> ValueFrame {
    match recv(ws).await {
        WsMessage::Binary(bytes) => decode_value_frame(&bytes).unwrap(),
        other => panic!("expected a binary frame, got {other:?}"),
    }
}

async fn assert_silent(ws: &mut Ws) {
    let res = timeout(Duration::from_millis(200), ws.next()).await;
    assert!(res.is_err(), "unexpected message: {res:?}");
}

async fn wait_until(server: &SharedServer, check: impl Fn(&Server) -> bool) {
    for _ in 0..300 {
        if check(&lock(server)) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("server never reached the expected state");
}

async fn next_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

fn subscribe_all(subuid: i64) -> serde_json::Value {
    json!([{"method": "subscribe", "params": {"subuid": subuid, "topics": [""], "options": {"prefixMatch": true}}}])
}

fn publish(name: &str, type_str: &str, pubuid: i64) -> serde_json::Value {
    json!([{"method": "publish", "params": {"name": name, "type": type_str, "pubuid": pubuid}}])
}

fn has_subscription(server: &Server, conn: u64, subuid: i64) -> bool {
    server
        .connection(conn)
        .and_then(|c| c.subscription(subuid))
        .is_some()
}

#[tokio::test]
async fn test_publish_announces_to_all_and_forwards_values() {
    let (addr, server) = start_server(Server::new()).await;

    let mut c2 = connect(addr, "c2").await;
    send_json(&mut c2, subscribe_all(1)).await;
    wait_until(&server, |s| has_subscription(s, 1, 1)).await;

    let mut c1 = connect(addr, "c1").await;
    send_json(&mut c1, publish("/robot/speed", "double", 1)).await;

    assert_eq!(
        recv_control(&mut c1).await,
        json!({"method": "announce", "params": {
            "name": "/robot/speed", "id": 1, "type": "double", "properties": {}, "pubuid": 1
        }})
    );
    assert_eq!(
        recv_control(&mut c2).await,
        json!({"method": "announce", "params": {
            "name": "/robot/speed", "id": 1, "type": "double", "properties": {}
        }})
    );

    let ts = 1_700_000_000_000_001;
    let bytes = encode_value_frame(1, ts, 1, &Value::Double(2.5)).unwrap();
    c1.send(WsMessage::binary(bytes)).await.unwrap();

    assert_eq!(
        recv_frame(&mut c2).await,
        ValueFrame::new(1, ts, Value::Double(2.5))
    );
    wait_until(&server, |s| {
        s.topic("/robot/speed")
            .and_then(|t| t.value.as_ref())
            .is_some_and(|v| v.value == Value::Double(2.5) && v.timestamp == ts)
    })
    .await;

    // values are never echoed to their sender
    assert_silent(&mut c1).await;
}

#[tokio::test]
async fn test_disconnect_unannounces_to_client_mirror() {
    let (addr, server) = start_server(Server::new()).await;

    let settings = ClientSettings {
        host: "127.0.0.1".to_string(),
        port: addr.port(),
        name: Some("mirror".to_string()),
        reconnect_delay_ms: 100,
    };
    let client = Client::new(&settings);
    let mut events = client.events();
    client.start();
    next_event(&mut events, |e| matches!(e, ClientEvent::Connected)).await;
    wait_until(&server, |s| has_subscription(s, 1, 1)).await;

    let mut c1 = connect(addr, "c1").await;
    send_json(&mut c1, publish("/robot/speed", "double", 1)).await;
    recv_control(&mut c1).await;
    let bytes = encode_value_frame(1, 42, 1, &Value::Double(2.5)).unwrap();
    c1.send(WsMessage::binary(bytes)).await.unwrap();

    next_event(&mut events, |e| matches!(e, ClientEvent::ValueChanged { .. })).await;
    let topic = client.topic("/robot/speed").expect("mirrored");
    assert_eq!(topic.id, 1);
    assert_eq!(topic.value, Some(Value::Double(2.5)));

    c1.close(None).await.unwrap();

    let event = next_event(&mut events, |e| matches!(e, ClientEvent::Unannounced { .. })).await;
    assert_eq!(
        event,
        ClientEvent::Unannounced {
            name: "/robot/speed".to_string(),
            id: 1
        }
    );
    assert!(client.topic("/robot/speed").is_none());
    assert!(lock(&server).topic("/robot/speed").is_none());

    client.disconnect();
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_prefix_subscription_applies_to_later_topics() {
    let (addr, server) = start_server(Server::new()).await;

    let mut c2 = connect(addr, "c2").await;
    send_json(
        &mut c2,
        json!([{"method": "subscribe", "params": {"subuid": 7, "topics": ["/robot"], "options": {"prefixMatch": true}}}]),
    )
    .await;
    wait_until(&server, |s| has_subscription(s, 1, 7)).await;

    let mut c1 = connect(addr, "c1").await;
    send_json(&mut c1, publish("/robot/speed", "double", 1)).await;
    send_json(&mut c1, publish("/other/x", "int", 2)).await;

    assert_eq!(recv_control(&mut c2).await["params"]["name"], "/robot/speed");
    assert_eq!(recv_control(&mut c2).await["params"]["name"], "/other/x");

    let mut message = encode_value_frame(1, 10, 1, &Value::Double(1.0)).unwrap();
    message.extend(encode_value_frame(2, 10, 2, &Value::Integer(3)).unwrap());
    c1.send(WsMessage::binary(message)).await.unwrap();

    assert_eq!(
        recv_frame(&mut c2).await,
        ValueFrame::new(1, 10, Value::Double(1.0))
    );
    assert_silent(&mut c2).await;

    wait_until(&server, |s| {
        s.topic("/other/x")
            .and_then(|t| t.value.as_ref())
            .is_some_and(|v| v.value == Value::Integer(3))
    })
    .await;
}

#[tokio::test]
async fn test_new_connection_gets_announce_before_value() {
    let mut server = Server::new();
    server.publish("/a", "double", Properties::new()).unwrap();
    server.set_value("/a", Value::Double(1.0)).unwrap();
    server.publish("/b", "string", Properties::new()).unwrap();
    server
        .set_value("/b", Value::String("x".to_string()))
        .unwrap();
    server.publish("/c", "int", Properties::new()).unwrap();
    let (addr, _server) = start_server(server).await;

    let mut ws = connect(addr, "late").await;
    send_json(&mut ws, subscribe_all(1)).await;

    let mut announced = Vec::new();
    let mut frames = Vec::new();
    for _ in 0..7 {
        match recv(&mut ws).await {
            WsMessage::Text(text) => {
                let parsed: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                let id = parsed[0]["params"]["id"].as_i64().unwrap();
                announced.push(id);
            }
            WsMessage::Binary(bytes) => {
                let frame = decode_value_frame(&bytes).unwrap();
                assert!(
                    announced.contains(&frame.topic_id),
                    "value for id {} before its announce",
                    frame.topic_id
                );
                frames.push(frame.topic_id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(announced, vec![1, 2, 3]);
    // snapshot values, then the subscribe's initial values
    assert_eq!(frames, vec![1, 2, 1, 2]);
}

#[tokio::test]
async fn test_client_value_before_announce_lands_on_server() {
    let (addr, server) = start_server(Server::new()).await;

    let settings = ClientSettings {
        host: "127.0.0.1".to_string(),
        port: addr.port(),
        name: None,
        reconnect_delay_ms: 100,
    };
    let client = Client::new(&settings);
    let mut events = client.events();
    client.start();
    next_event(&mut events, |e| matches!(e, ClientEvent::Connected)).await;

    let pubuid = client.publish("/c/x", "int", Properties::new()).unwrap();
    client.set_value(pubuid, Value::Integer(5)).unwrap();

    wait_until(&server, |s| {
        s.topic("/c/x")
            .and_then(|t| t.value.as_ref())
            .is_some_and(|v| v.value == Value::Integer(5))
    })
    .await;

    client.set_value(pubuid, Value::Integer(6)).unwrap();
    wait_until(&server, |s| {
        s.topic("/c/x")
            .and_then(|t| t.value.as_ref())
            .is_some_and(|v| v.value == Value::Integer(6))
    })
    .await;

    client.unpublish(pubuid).unwrap();
    wait_until(&server, |s| s.topic("/c/x").is_none()).await;
    client.disconnect();
}

/// Accepts one session on `listener` and closes it when `close` fires, then
/// hands the listener to the real server.
async fn drop_first_session(
    listener: TcpListener,
    server: SharedServer,
    close: oneshot::Receiver<()>,
) {
    let (stream, _) = listener.accept().await.unwrap();
    let accept = |_: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        resp.headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL_V41));
        Ok(resp)
    };
    let mut ws = accept_hdr_async(stream, accept).await.unwrap();
    let _ = close.await;
    let _ = ws.close(None).await;
    drop(ws);
    serve(listener, server).await;
}

#[tokio::test]
async fn test_client_reconnects_and_rebuilds_mirror() {
    let mut server = Server::new();
    server.publish("/keep", "double", Properties::new()).unwrap();
    server.set_value("/keep", Value::Double(1.0)).unwrap();
    let server = server.into_shared();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (close_tx, close_rx) = oneshot::channel();
    tokio::spawn(drop_first_session(listener, server.clone(), close_rx));

    let settings = ClientSettings {
        host: "127.0.0.1".to_string(),
        port: addr.port(),
        name: Some("flaky".to_string()),
        reconnect_delay_ms: 500,
    };
    let client = Client::new(&settings);
    let mut events = client.events();
    client.start();
    next_event(&mut events, |e| matches!(e, ClientEvent::Connected)).await;
    let pubuid = client.publish("/mine", "int", Properties::new()).unwrap();

    close_tx.send(()).unwrap();
    next_event(&mut events, |e| matches!(e, ClientEvent::Disconnected)).await;
    assert!(!client.is_connected());
    assert!(client.topics().is_empty());
    assert!(matches!(
        client.set_value(pubuid, Value::Integer(1)),
        Err(Nt4Error::NotConnected)
    ));

    next_event(&mut events, |e| matches!(e, ClientEvent::Connected)).await;
    // subuid 1 went to the dropped session; counters survive the reset
    wait_until(&server, |s| {
        s.connection(1)
            .and_then(|c| c.subscription(2))
            .is_some_and(|sub| sub.patterns == vec![String::new()] && sub.options.prefix_match)
    })
    .await;

    next_event(&mut events, |e| {
        matches!(e, ClientEvent::Announced { name, .. } if name == "/keep")
    })
    .await;
    let keep = client.topic("/keep").expect("mirror rebuilt");
    assert_eq!(keep.id, 1);
    client.disconnect();
}

#[tokio::test]
async fn test_rtt_probe_is_echoed_to_sender() {
    let (addr, _server) = start_server(Server::new()).await;
    let mut ws = connect(addr, "rtt").await;

    let probe = ValueFrame::rtt(123).encode().unwrap();
    ws.send(WsMessage::binary(probe)).await.unwrap();

    let reply = recv_frame(&mut ws).await;
    assert!(reply.is_rtt());
    assert_eq!(reply.value, Value::Integer(0));
    assert!(reply.timestamp > 123);
}

#[tokio::test]
async fn test_malformed_text_keeps_connection_open() {
    let (addr, _server) = start_server(Server::new()).await;
    let mut ws = connect(addr, "sloppy").await;

    ws.send(WsMessage::text("not json")).await.unwrap();
    ws.send(WsMessage::binary(vec![0xc1])).await.unwrap();
    // array32 header claiming u32::MAX doubles, no body
    ws.send(WsMessage::binary(vec![0x94, 0x01, 0x00, 0x11, 0xdd, 0xff, 0xff, 0xff, 0xff]))
        .await
        .unwrap();
    send_json(&mut ws, publish("/still/here", "boolean", 1)).await;

    assert_eq!(recv_control(&mut ws).await["params"]["name"], "/still/here");
}

#[tokio::test]
async fn test_fallback_subprotocol_is_accepted() {
    let (addr, _server) = start_server(Server::new()).await;
    let mut ws = connect_with(addr, "legacy", SUBPROTOCOL_V40).await;
    send_json(&mut ws, publish("/legacy", "double", 1)).await;
    assert_eq!(recv_control(&mut ws).await["method"], "announce");
}

#[tokio::test]
async fn test_handshake_without_subprotocol_is_rejected() {
    let (addr, server) = start_server(Server::new()).await;
    let res = connect_async(format!("ws://{addr}/nt/nobody")).await;
    assert!(res.is_err());
    assert_eq!(lock(&server).connection_count(), 0);
}
