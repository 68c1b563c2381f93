//! End-to-end invocation tests over an in-memory duplex transport.
//!
//! The client side speaks raw protocol frames so the exact wire shapes are
//! visible in each test.

use std::sync::Arc;
use std::time::Duration;

use beckon_session::{stream, Hub, JsonFramed, ServerConfig, ServerConnection};
use beckon_wire::{CompletionMessage, Message};
use serde_json::{json, Value};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct TestClient {
    framed: JsonFramed<DuplexStream>,
}

impl TestClient {
    async fn send_raw(&mut self, text: &str) {
        self.framed.send_text(text).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        timeout(Duration::from_secs(5), self.framed.recv())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("connection closed")
    }

    async fn recv_completion(&mut self) -> CompletionMessage {
        match self.recv().await {
            Message::Completion(completion) => completion,
            other => panic!("expected completion, got {other:?}"),
        }
    }
}

async fn connect(hub: Hub) -> TestClient {
    let (client_io, server_io) = duplex(16 * 1024);
    let connection = ServerConnection::new(
        Arc::new(hub),
        JsonFramed::new(server_io),
        ServerConfig::default(),
    );
    tokio::spawn(connection.run());

    let mut framed = JsonFramed::new(client_io);
    framed
        .send_text(r#"{"protocol":"json","version":1}"#)
        .await
        .unwrap();
    let response = framed.recv_text().await.unwrap().unwrap();
    assert_eq!(response, "{}");
    TestClient { framed }
}

/// Hub mirroring a small production hub, recording each invocation on a
/// queue so tests can assert the method actually ran.
fn invocation_hub() -> (Hub, mpsc::UnboundedReceiver<String>) {
    let (queue, queue_rx) = mpsc::unbounded_channel::<String>();

    let q = queue.clone();
    let simple = move || {
        let q = q.clone();
        async move {
            q.send("Simple()".into()).unwrap();
        }
    };
    let q = queue.clone();
    let simple_int = move |value: i64| {
        let q = q.clone();
        async move {
            q.send(format!("SimpleInt({value})")).unwrap();
            value + 1
        }
    };
    let q = queue.clone();
    let simple_float = move |value: f64| {
        let q = q.clone();
        async move {
            q.send(format!("SimpleFloat({value})")).unwrap();
            (value * 10.0, value * 100.0)
        }
    };
    let q = queue.clone();
    let simple_string = move |value1: String, value2: String| {
        let q = q.clone();
        async move {
            q.send(format!("SimpleString({value1}, {value2})")).unwrap();
            (value1 + &value2).to_lowercase()
        }
    };
    let q = queue.clone();
    let async_chan = move || {
        let q = q.clone();
        async move {
            q.send("Async()".into()).unwrap();
            let (tx, rx) = stream(1);
            tokio::spawn(async move {
                let _ = tx.send(true).await;
            });
            rx
        }
    };
    let q = queue.clone();
    let async_closed_chan = move || {
        let q = q.clone();
        async move {
            q.send("AsyncClosedChan()".into()).unwrap();
            let (tx, rx) = stream::<bool>(1);
            drop(tx);
            rx
        }
    };
    let q = queue.clone();
    let panics = move || {
        let q = q.clone();
        async move {
            q.send("Panic()".into()).unwrap();
            panic!("Don't panic!");
            #[allow(unreachable_code)]
            ()
        }
    };
    let counter = |count: u32| async move {
        let (tx, rx) = stream(1);
        tokio::spawn(async move {
            for i in 0..count {
                if tx.send(i).await.is_err() {
                    break;
                }
            }
        });
        rx
    };
    let identity = |value: Value| async move { value };

    let hub = Hub::builder()
        .method("Simple", simple)
        .method("SimpleInt", simple_int)
        .method("SimpleFloat", simple_float)
        .method("SimpleString", simple_string)
        .streaming("Async", async_chan)
        .streaming("AsyncClosedChan", async_closed_chan)
        .method("Panic", panics)
        .streaming("Counter", counter)
        .method("Identity", identity)
        .build();
    (hub, queue_rx)
}

async fn expect_queued(queue: &mut mpsc::UnboundedReceiver<String>, expected: &str) {
    let entry = timeout(Duration::from_secs(5), queue.recv())
        .await
        .expect("timed out waiting for invocation")
        .unwrap();
    assert_eq!(entry, expected);
}

#[tokio::test]
async fn simple_invocation_returns_a_completion() {
    let (hub, mut queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":1,"invocationId": "123","target":"simple"}"#)
        .await;
    expect_queued(&mut queue, "Simple()").await;

    let completion = conn.recv_completion().await;
    assert_eq!(completion.invocation_id, "123");
    assert!(completion.result.is_none());
    assert!(completion.error.is_none());
}

#[tokio::test]
async fn non_blocking_invocation_returns_no_completion() {
    let (hub, mut queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":1,"target":"simple"}"#).await;
    expect_queued(&mut queue, "Simple()").await;

    let silent = timeout(Duration::from_millis(1000), conn.framed.recv()).await;
    assert!(silent.is_err(), "received unexpected frame: {silent:?}");
}

#[tokio::test]
async fn invocation_id_of_wrong_type_yields_error_completion() {
    let (hub, _queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":1,"invocationId":1}"#).await;

    let completion = conn.recv_completion().await;
    assert!(completion.error.is_some());
}

#[tokio::test]
async fn invalid_json_closes_the_connection_with_an_error() {
    let (hub, _queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(
        r#"{"type":1,"invocationId": "4444","target":"simpleint", arguments[CanNotParse]}"#,
    )
    .await;

    match timeout(Duration::from_millis(1000), conn.framed.recv())
        .await
        .expect("timed out waiting for close")
        .unwrap()
        .expect("connection closed without close frame")
    {
        Message::Close(close) => assert!(close.error.is_some()),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn simple_int_invocation_returns_the_incremented_value() {
    let (hub, mut queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":1,"invocationId": "666","target":"simpleint","arguments":[314]}"#)
        .await;
    expect_queued(&mut queue, "SimpleInt(314)").await;

    let completion = conn.recv_completion().await;
    assert_eq!(completion.invocation_id, "666");
    assert_eq!(completion.result, Some(json!(315)));
    assert!(completion.error.is_none());
}

#[tokio::test]
async fn simple_int_with_unbindable_argument_returns_an_error() {
    let (hub, _queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(
        r#"{"type":1,"invocationId": "555","target":"simpleint","arguments":["CantParse"]}"#,
    )
    .await;

    let completion = conn.recv_completion().await;
    assert_eq!(completion.invocation_id, "555");
    assert!(completion.error.is_some());
    assert!(completion.result.is_none());
}

#[tokio::test]
async fn simple_float_invocation_returns_both_values() {
    let (hub, mut queue) = invocation_hub();
    let mut conn = connect(hub).await;

    let value = 3.1415_f64;
    conn.send_raw(
        r#"{"type":1,"invocationId": "8087","target":"simplefloat","arguments":[3.1415]}"#,
    )
    .await;
    expect_queued(&mut queue, &format!("SimpleFloat({value})")).await;

    let completion = conn.recv_completion().await;
    assert_eq!(completion.invocation_id, "8087");
    assert_eq!(
        completion.result,
        Some(json!([value * 10.0, value * 100.0]))
    );
    assert!(completion.error.is_none());
}

#[tokio::test]
async fn simple_string_invocation_lowercases_the_concatenation() {
    let (hub, mut queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(
        r#"{"type":1,"invocationId": "6502","target":"simplestring","arguments":["Camel", "Cased"]}"#,
    )
    .await;
    expect_queued(&mut queue, "SimpleString(Camel, Cased)").await;

    let completion = conn.recv_completion().await;
    assert_eq!(completion.invocation_id, "6502");
    assert_eq!(completion.result, Some(json!("camelcased")));
    assert!(completion.error.is_none());
}

#[tokio::test]
async fn async_invocation_resolves_with_the_first_streamed_value() {
    let (hub, mut queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":1,"invocationId": "mfg","target":"async"}"#)
        .await;
    expect_queued(&mut queue, "Async()").await;

    let completion = conn.recv_completion().await;
    assert_eq!(completion.invocation_id, "mfg");
    assert_eq!(completion.result, Some(json!(true)));
    assert!(completion.error.is_none());
}

#[tokio::test]
async fn pre_closed_stream_surfaces_as_an_error_completion() {
    let (hub, mut queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":1,"invocationId": "ouch","target":"asyncclosedchan"}"#)
        .await;
    expect_queued(&mut queue, "AsyncClosedChan()").await;

    let completion = conn.recv_completion().await;
    assert_eq!(completion.invocation_id, "ouch");
    assert!(completion.result.is_none());
    assert!(completion.error.is_some());
}

#[tokio::test]
async fn panicking_method_returns_an_error_but_no_result() {
    let (hub, mut queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":1,"invocationId": "???","target":"panic"}"#)
        .await;
    expect_queued(&mut queue, "Panic()").await;

    let completion = conn.recv_completion().await;
    assert_eq!(completion.invocation_id, "???");
    assert!(completion.result.is_none());
    assert!(completion.error.as_deref().unwrap().contains("Don't panic!"));
}

#[tokio::test]
async fn missing_method_returns_an_error() {
    let (hub, _queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":1,"invocationId": "0000","target":"missing"}"#)
        .await;

    let completion = conn.recv_completion().await;
    assert_eq!(completion.invocation_id, "0000");
    assert!(completion.result.is_none());
    assert!(!completion.error.as_deref().unwrap_or_default().is_empty());
}

#[tokio::test]
async fn stream_invocation_yields_items_then_an_empty_completion() {
    let (hub, _queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":4,"invocationId":"s1","target":"counter","arguments":[3]}"#)
        .await;

    for expected in 0..3 {
        match conn.recv().await {
            Message::StreamItem(item) => {
                assert_eq!(item.invocation_id, "s1");
                assert_eq!(item.item, json!(expected));
            }
            other => panic!("expected stream item, got {other:?}"),
        }
    }
    let completion = conn.recv_completion().await;
    assert_eq!(completion.invocation_id, "s1");
    assert!(completion.result.is_none());
    assert!(completion.error.is_none());
}

#[tokio::test]
async fn stream_invocation_of_non_streaming_method_is_an_error() {
    let (hub, _queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":4,"invocationId":"s2","target":"simpleint","arguments":[1]}"#)
        .await;

    let completion = conn.recv_completion().await;
    assert_eq!(completion.invocation_id, "s2");
    assert!(completion.error.is_some());
}

#[tokio::test]
async fn cancel_invocation_stops_an_active_stream() {
    let ticker = |_interval_ms: u64| async move {
        let (tx, rx) = stream(1);
        tokio::spawn(async move {
            for i in 0u64.. {
                if tx.send(i).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
        rx
    };
    let hub = Hub::builder().streaming("Ticker", ticker).build();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":4,"invocationId":"t1","target":"ticker","arguments":[50]}"#)
        .await;
    match conn.recv().await {
        Message::StreamItem(item) => assert_eq!(item.invocation_id, "t1"),
        other => panic!("expected stream item, got {other:?}"),
    }

    conn.send_raw(r#"{"type":5,"invocationId":"t1"}"#).await;

    // A cancelled stream never completes; at most items already in flight
    // may still arrive.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    loop {
        match timeout(Duration::from_millis(200), conn.framed.recv()).await {
            Err(_) => break,
            Ok(frame) => match frame.unwrap().expect("connection closed") {
                Message::StreamItem(_) => {
                    assert!(
                        tokio::time::Instant::now() < deadline,
                        "stream kept producing after cancellation"
                    );
                }
                other => panic!("unexpected frame after cancel: {other:?}"),
            },
        }
    }
}

#[tokio::test]
async fn ping_is_a_no_op() {
    let (hub, mut queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":6}"#).await;
    conn.send_raw(r#"{"type":1,"invocationId":"1","target":"simpleint","arguments":[1]}"#)
        .await;
    expect_queued(&mut queue, "SimpleInt(1)").await;
    let completion = conn.recv_completion().await;
    assert_eq!(completion.result, Some(json!(2)));
}

#[tokio::test]
async fn close_ends_the_connection() {
    let (hub, _queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":7}"#).await;

    let eof = timeout(Duration::from_secs(5), conn.framed.recv())
        .await
        .expect("timed out waiting for connection end")
        .unwrap();
    assert!(eof.is_none());
}

#[tokio::test]
async fn whole_floats_narrow_into_integer_parameters() {
    let (hub, mut queue) = invocation_hub();
    let mut conn = connect(hub).await;

    conn.send_raw(r#"{"type":1,"invocationId":"n1","target":"simpleint","arguments":[3.0]}"#)
        .await;
    expect_queued(&mut queue, "SimpleInt(3)").await;
    assert_eq!(conn.recv_completion().await.result, Some(json!(4)));

    conn.send_raw(r#"{"type":1,"invocationId":"n2","target":"simpleint","arguments":[3.14]}"#)
        .await;
    let completion = conn.recv_completion().await;
    assert_eq!(completion.invocation_id, "n2");
    assert!(completion.error.is_some());
}

#[tokio::test]
async fn identity_round_trips_json_scalars() {
    let (hub, _queue) = invocation_hub();
    let mut conn = connect(hub).await;

    for (i, value) in [json!(42.5), json!("x"), json!(true), json!([1, 2, 3])]
        .into_iter()
        .enumerate()
    {
        let frame = format!(
            r#"{{"type":1,"invocationId":"id{i}","target":"identity","arguments":[{value}]}}"#
        );
        conn.send_raw(&frame).await;
        let completion = conn.recv_completion().await;
        assert_eq!(completion.result, Some(value));
    }
}

#[tokio::test]
async fn handshake_with_unsupported_protocol_is_rejected() {
    let (hub, _queue) = invocation_hub();
    let (client_io, server_io) = duplex(16 * 1024);
    let connection = ServerConnection::new(
        Arc::new(hub),
        JsonFramed::new(server_io),
        ServerConfig::default(),
    );
    let server = tokio::spawn(connection.run());

    let mut framed = JsonFramed::new(client_io);
    framed
        .send_text(r#"{"protocol":"messagepack","version":1}"#)
        .await
        .unwrap();
    let response = framed.recv_text().await.unwrap().unwrap();
    assert!(response.contains("error"));

    assert!(server.await.unwrap().is_err());
}
