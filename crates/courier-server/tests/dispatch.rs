//! End-to-end tests using real WebSocket clients against a server bound to
//! an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use courier_broker::testing::{Failure, FlakyBroker};
use courier_broker::Brokers;
use courier_core::Identity;
use courier_server::{start, CourierConfig, ServerHandle, StaticResolver};
use courier_telemetry::DispatchMetrics;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn resolver() -> StaticResolver {
    StaticResolver::new()
        .with("driver-7", Identity::fulfiller(7))
        .with("driver-9", Identity::fulfiller(9))
        .with("user-100", Identity::requester(100))
        .with("user-101", Identity::requester(101))
}

async fn boot(brokers: Brokers) -> ServerHandle {
    let mut config = CourierConfig::default();
    config.server.host = "127.0.0.1".into();
    config.server.port = 0;
    start(&config, brokers, Arc::new(resolver()), Arc::new(DispatchMetrics::new()))
        .await
        .unwrap()
}

async fn connect(port: u16, path: &str) -> WsStream {
    let url = format!("ws://127.0.0.1:{port}{path}");
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

/// Connect and consume the `connected` greeting.
async fn join(port: u16, path: &str) -> WsStream {
    let mut ws = connect(port, path).await;
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "connected");
    ws
}

async fn send(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping transport pings.
async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

/// Next frame of type `ty`, skipping any other frames.
async fn next_of_type(ws: &mut WsStream, ty: &str) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == ty {
            return frame;
        }
    }
}

async fn assert_quiet(ws: &mut WsStream) {
    let got = timeout(QUIET, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await;
    assert!(matches!(got, Err(_) | Ok(None)), "unexpected frame: {got:?}");
}

async fn close_code(ws: &mut WsStream) -> u16 {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.unwrap();
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(Message::Close(None))) => panic!("close without a code"),
            Some(Ok(_)) => continue,
            other => panic!("expected a close frame, got {other:?}"),
        }
    }
}

async fn post(port: u16, path: &str, body: Option<Value>) -> reqwest::Response {
    let client = reqwest::Client::new();
    let req = client.post(format!("http://127.0.0.1:{port}{path}"));
    let req = match body {
        Some(body) => req.json(&body),
        None => req,
    };
    req.send().await.unwrap()
}

async fn get_json(port: u16, path: &str) -> Value {
    reqwest::get(format!("http://127.0.0.1:{port}{path}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

// ── Connection lifecycle ──

#[tokio::test]
async fn driver_gets_connected_greeting() {
    let server = boot(Brokers::standalone()).await;
    let mut ws = connect(server.port, "/ws/driver/driver-7").await;

    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "connected");
    assert_eq!(hello["identity_id"], "7");
    assert_eq!(hello["message"], "WebSocket connected successfully");

    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn bad_token_is_closed_with_policy_violation() {
    let server = boot(Brokers::standalone()).await;

    let mut ws = connect(server.port, "/ws/driver/nobody").await;
    assert_eq!(close_code(&mut ws).await, 1008);

    // A requester token on the driver endpoint is also refused.
    let mut ws = connect(server.port, "/ws/driver/user-100").await;
    assert_eq!(close_code(&mut ws).await, 1008);

    let stats = get_json(server.port, "/ws/stats").await;
    assert_eq!(stats["active_drivers"], 0);
    assert_eq!(stats["metrics"]["auth_failures"], 2);

    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn malformed_frame_closes_connection() {
    let server = boot(Brokers::standalone()).await;
    let mut ws = join(server.port, "/ws/driver/driver-7").await;

    ws.send(Message::text("{not json")).await.unwrap();
    assert_eq!(close_code(&mut ws).await, 1008);

    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn unknown_and_incomplete_frames_are_ignored() {
    let server = boot(Brokers::standalone()).await;
    let mut ws = join(server.port, "/ws/driver/driver-7").await;

    send(&mut ws, json!({"type": "driver_location", "lat": 41.3})).await;
    send(&mut ws, json!({"type": "request_lock"})).await;
    send(&mut ws, json!({"no_type": true})).await;
    send(&mut ws, json!({"type": "ping"})).await;

    // Only the ping is answered and the connection is still open.
    assert_eq!(next_json(&mut ws).await, json!({"type": "pong"}));
    assert_quiet(&mut ws).await;

    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn requester_may_only_ping() {
    let server = boot(Brokers::standalone()).await;
    let mut user = join(server.port, "/ws/user/user-100").await;

    send(&mut user, json!({"type": "request_lock", "order_id": 42})).await;
    send(&mut user, json!({"type": "viewing_order", "order_id": 42})).await;
    send(&mut user, json!({"type": "ping"})).await;

    assert_eq!(next_json(&mut user).await, json!({"type": "pong"}));
    assert_quiet(&mut user).await;

    // The ignored request did not take the lock.
    let mut driver = join(server.port, "/ws/driver/driver-7").await;
    send(&mut driver, json!({"type": "request_lock", "order_id": 42})).await;
    assert_eq!(next_json(&mut driver).await["type"], "lock_acquired");

    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn stats_count_identities_not_connections() {
    let server = boot(Brokers::standalone()).await;
    let _a = join(server.port, "/ws/driver/driver-7").await;
    let _b = join(server.port, "/ws/driver/driver-7").await;
    let _c = join(server.port, "/ws/driver/driver-9").await;
    let _u = join(server.port, "/ws/user/user-100").await;

    let stats = get_json(server.port, "/ws/stats").await;
    assert_eq!(stats["active_drivers"], 2);
    assert_eq!(stats["active_users"], 1);
    assert_eq!(stats["total_connections"], 3);
    assert_eq!(stats["local_connections"], 4);
    assert_eq!(stats["mode"], "standalone");

    server.shutdown(TIMEOUT).await;
}

// ── Viewing and locking ──

#[tokio::test]
async fn two_drivers_one_offer() {
    let server = boot(Brokers::standalone()).await;
    let mut d7 = join(server.port, "/ws/driver/driver-7").await;
    let mut d9 = join(server.port, "/ws/driver/driver-9").await;

    send(&mut d7, json!({"type": "viewing_order", "order_id": 42, "order_type": "taxi"})).await;
    let expected = json!({"type": "viewer_count", "order_id": 42, "count": 1});
    assert_eq!(next_json(&mut d7).await, expected);
    assert_eq!(next_json(&mut d9).await, expected);

    send(&mut d9, json!({"type": "viewing_order", "order_id": 42, "order_type": "taxi"})).await;
    let expected = json!({"type": "viewer_count", "order_id": 42, "count": 2});
    assert_eq!(next_json(&mut d7).await, expected);
    assert_eq!(next_json(&mut d9).await, expected);

    send(&mut d7, json!({"type": "request_lock", "order_id": 42})).await;
    assert_eq!(
        next_json(&mut d7).await,
        json!({"type": "lock_acquired", "order_id": 42, "message": "You can now accept this order"})
    );

    send(&mut d9, json!({"type": "request_lock", "order_id": 42})).await;
    assert_eq!(
        next_json(&mut d9).await,
        json!({"type": "lock_failed", "order_id": 42, "message": "Another driver is accepting this order"})
    );
    // Lock outcomes go only to the requester.
    assert_quiet(&mut d7).await;

    // The holder asking again still succeeds.
    send(&mut d7, json!({"type": "request_lock", "order_id": 42})).await;
    assert_eq!(next_json(&mut d7).await["type"], "lock_acquired");

    // The accept workflow releases the lock; driver 9 can now take it.
    let resp = post(server.port, "/internal/locks/42/release", None).await;
    assert_eq!(resp.status(), 200);
    send(&mut d9, json!({"type": "request_lock", "order_id": 42})).await;
    assert_eq!(next_json(&mut d9).await["type"], "lock_acquired");

    send(&mut d7, json!({"type": "stop_viewing_order", "order_id": 42})).await;
    let expected = json!({"type": "viewer_count", "order_id": 42, "count": 1});
    assert_eq!(next_of_type(&mut d9, "viewer_count").await, expected);

    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn disconnect_stops_viewing() {
    let server = boot(Brokers::standalone()).await;
    let mut d7 = join(server.port, "/ws/driver/driver-7").await;
    let mut d9 = join(server.port, "/ws/driver/driver-9").await;

    send(&mut d7, json!({"type": "viewing_order", "order_id": 5})).await;
    assert_eq!(next_json(&mut d9).await["count"], 1);

    d7.close(None).await.unwrap();
    drop(d7);

    let frame = next_of_type(&mut d9, "viewer_count").await;
    assert_eq!(frame, json!({"type": "viewer_count", "order_id": 5, "count": 0}));

    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn viewing_outlives_the_connection_that_marked_it() {
    let server = boot(Brokers::standalone()).await;
    let mut d9 = join(server.port, "/ws/driver/driver-9").await;
    let mut phone = join(server.port, "/ws/driver/driver-7").await;
    let mut tablet = join(server.port, "/ws/driver/driver-7").await;

    send(&mut phone, json!({"type": "viewing_order", "order_id": 5})).await;
    assert_eq!(next_json(&mut d9).await["count"], 1);

    // Driver 7 is still online through the tablet.
    phone.close(None).await.unwrap();
    drop(phone);
    assert_quiet(&mut d9).await;

    tablet.close(None).await.unwrap();
    drop(tablet);
    assert_eq!(
        next_of_type(&mut d9, "viewer_count").await,
        json!({"type": "viewer_count", "order_id": 5, "count": 0})
    );

    send(&mut d9, json!({"type": "viewing_order", "order_id": 5})).await;
    assert_eq!(
        next_of_type(&mut d9, "viewer_count").await,
        json!({"type": "viewer_count", "order_id": 5, "count": 1})
    );

    server.shutdown(TIMEOUT).await;
}

// ── Push path ──

#[tokio::test]
async fn new_order_reaches_drivers_only() {
    let server = boot(Brokers::standalone()).await;
    let mut d7 = join(server.port, "/ws/driver/driver-7").await;
    let mut d9 = join(server.port, "/ws/driver/driver-9").await;
    let mut user = join(server.port, "/ws/user/user-100").await;

    let order = json!({"id": 42, "type": "taxi", "price": 25000.0});
    let resp = post(server.port, "/internal/events", Some(json!({"type": "new_order", "order": order}))).await;
    assert_eq!(resp.status(), 202);

    let expected = json!({"type": "new_order", "order": order});
    assert_eq!(next_json(&mut d7).await, expected);
    assert_eq!(next_json(&mut d9).await, expected);
    assert_quiet(&mut user).await;

    server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn accepted_order_notifies_drivers_and_its_requester() {
    let server = boot(Brokers::standalone()).await;
    let mut d9 = join(server.port, "/ws/driver/driver-9").await;
    let mut owner = join(server.port, "/ws/user/user-100").await;
    let mut other = join(server.port, "/ws/user/user-101").await;

    let event = json!({
        "type": "order_accepted",
        "order_id": 42,
        "order_type": "taxi",
        "requester_id": "100",
        "driver_id": "7",
        "driver": {"name": "Aziz", "car_number": "01A123BC"}
    });
    assert_eq!(post(server.port, "/internal/events", Some(event)).await.status(), 202);

    assert_eq!(
        next_json(&mut d9).await,
        json!({"type": "order_accepted", "order_id": 42, "order_type": "taxi", "driver_id": "7"})
    );
    assert_eq!(
        next_json(&mut owner).await,
        json!({
            "type": "order_accepted",
            "order_id": 42,
            "order_type": "taxi",
            "driver": {"name": "Aziz", "car_number": "01A123BC"}
        })
    );
    assert_quiet(&mut other).await;

    let done = json!({"type": "order_completed", "order_id": 42, "requester_id": "100"});
    assert_eq!(post(server.port, "/internal/events", Some(done)).await.status(), 202);
    assert_eq!(
        next_json(&mut owner).await,
        json!({"type": "order_completed", "order_id": 42})
    );
    assert_quiet(&mut d9).await;

    server.shutdown(TIMEOUT).await;
}

// ── Several instances sharing one broker ──

#[tokio::test]
async fn instances_share_locks_and_fanout() {
    let shared = Arc::new(FlakyBroker::new());
    let a = boot(Brokers::with_shared(shared.clone())).await;
    let b = boot(Brokers::with_shared(shared.clone())).await;

    let mut d7 = join(a.port, "/ws/driver/driver-7").await;
    let mut d9 = join(b.port, "/ws/driver/driver-9").await;

    // Viewers on both instances are counted together.
    send(&mut d7, json!({"type": "viewing_order", "order_id": 42})).await;
    assert_eq!(next_json(&mut d9).await["count"], 1);
    send(&mut d9, json!({"type": "viewing_order", "order_id": 42})).await;
    assert_eq!(next_of_type(&mut d7, "viewer_count").await["count"], 1);
    assert_eq!(next_of_type(&mut d7, "viewer_count").await["count"], 2);

    send(&mut d7, json!({"type": "request_lock", "order_id": 42})).await;
    assert_eq!(next_of_type(&mut d7, "lock_acquired").await["order_id"], 42);
    send(&mut d9, json!({"type": "request_lock", "order_id": 42})).await;
    assert_eq!(next_of_type(&mut d9, "lock_failed").await["order_id"], 42);

    // An event pushed to one instance reaches drivers on both.
    let cancel = json!({"type": "order_cancelled", "order_id": 42});
    assert_eq!(post(b.port, "/internal/events", Some(cancel)).await.status(), 202);
    assert_eq!(next_of_type(&mut d7, "order_cancelled").await["order_id"], 42);
    assert_eq!(next_of_type(&mut d9, "order_cancelled").await["order_id"], 42);

    let stats = get_json(a.port, "/ws/stats").await;
    assert_eq!(stats["mode"], "distributed");
    assert_eq!(stats["active_drivers"], 2);

    a.shutdown(TIMEOUT).await;
    b.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn broker_outage_degrades_to_local_delivery() {
    let shared = Arc::new(FlakyBroker::new());
    let server = boot(Brokers::with_shared(shared.clone())).await;
    let mut d7 = join(server.port, "/ws/driver/driver-7").await;
    let mut d9 = join(server.port, "/ws/driver/driver-9").await;

    send(&mut d7, json!({"type": "request_lock", "order_id": 42})).await;
    assert_eq!(next_json(&mut d7).await["type"], "lock_acquired");

    shared.set_failure(Failure::Down);

    // Fanout still reaches this instance's drivers.
    send(&mut d9, json!({"type": "viewing_order", "order_id": 42})).await;
    assert_eq!(next_json(&mut d7).await, json!({"type": "viewer_count", "order_id": 42, "count": 1}));
    assert_eq!(next_json(&mut d9).await, json!({"type": "viewer_count", "order_id": 42, "count": 1}));

    // The grant made before the outage still excludes driver 9.
    send(&mut d9, json!({"type": "request_lock", "order_id": 42})).await;
    assert_eq!(next_json(&mut d9).await["type"], "lock_failed");

    let health = get_json(server.port, "/health").await;
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["mode"], "distributed");

    let stats = get_json(server.port, "/ws/stats").await;
    assert_eq!(stats["active_drivers"], 2);
    assert!(stats["metrics"]["fanout_local_fallbacks"].as_u64().unwrap() >= 1);

    server.shutdown(TIMEOUT).await;
}
