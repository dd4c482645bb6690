//! Integration tests for the HTTP surface and the remote driver.
//!
//! A local driver is served over `serve_listener`, and a [`RemoteDriver`]
//! pointed at it must behave like the driver it fronts: same turn output,
//! same notifications through the relay, same errors.
//!
//! Covers:
//! - a remote turn against the mock runtime, plus relayed notifications
//! - driver errors cross the wire with their kind intact
//! - the stream endpoint resynchronizes consumers that fell behind
//! - the hub pump replays, then tails live events
//! - idle stream consumers are released as soon as they disconnect
//! - `/health` reports driver and stream state

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agent_runtime::config::{DriverMode, RemoteConfig};
use agent_runtime::driver::{
    ExecutionDriver, MockDriver, RemoteDriver, ThreadRef, TurnRequest, UnavailableDriver,
};
use agent_runtime::relay::SseChunkParser;
use agent_runtime::rpc::message::Notification;
use agent_runtime::server::hub::RESYNC_METHOD;
use agent_runtime::server::{serve_listener, NotificationHub, ServerState};
use agent_runtime::turn::{DeltaCallback, TurnStatus};
use agent_runtime::AppError;

struct Served {
    base_url: String,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
}

impl Drop for Served {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(driver: Arc<dyn ExecutionDriver>, buffer_capacity: usize) -> Served {
    let state = Arc::new(ServerState::new(driver, buffer_capacity));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let shutdown = CancellationToken::new();
    tokio::spawn(serve_listener(Arc::clone(&state), listener, shutdown.clone()));
    Served {
        base_url: format!("http://{addr}"),
        state,
        shutdown,
    }
}

fn remote(base_url: &str) -> RemoteDriver {
    RemoteDriver::from_config(&RemoteConfig {
        base_url: Some(base_url.to_owned()),
        identifier: "bot-7".into(),
        reconnect_delay_ms: 20,
        ..RemoteConfig::default()
    })
    .expect("remote driver")
}

// ── Remote turns ────────────────────────────────────────────────────────────

/// A remote turn returns the served driver's output, and the relay delivers
/// the turn's notifications.
#[tokio::test]
async fn remote_turn_against_mock_runtime() {
    let served = serve(Arc::new(MockDriver::new()), 64).await;
    let driver = remote(&served.base_url);

    let methods = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&methods);
    let _subscription = driver.subscribe_notifications(Arc::new(move |n: &Notification| {
        sink.lock().expect("lock").push(n.method.clone());
    }));

    let session = driver
        .bootstrap_session(&ThreadRef::new("t1"))
        .await
        .expect("bootstrap");
    assert_eq!(session.external_thread_id.as_deref(), Some("mock-thread-t1"));
    assert_eq!(session.runtime, DriverMode::Mock);

    let chunks = Arc::new(Mutex::new(Vec::<String>::new()));
    let chunk_sink = Arc::clone(&chunks);
    let on_delta: DeltaCallback = Arc::new(move |chunk: &str| {
        chunk_sink.lock().expect("lock").push(chunk.to_owned());
    });
    let outcome = driver
        .run_turn(TurnRequest {
            thread: ThreadRef::new("t1"),
            turn_id: "local-1".into(),
            text: "hi".into(),
            on_delta: Some(on_delta),
        })
        .await
        .expect("remote turn");

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.output_text, "mock reply: hi");
    assert_eq!(outcome.turn_id, "local-1");
    assert_eq!(*chunks.lock().expect("lock"), vec!["mock reply: hi"]);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !methods.lock().expect("lock").iter().any(|m| m == "turn/completed") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("turn/completed relayed");
    assert_eq!(
        methods.lock().expect("lock").first().map(String::as_str),
        Some("turn/started")
    );

    let interrupted = driver
        .interrupt_turn(&ThreadRef::new("t1"), "local-1")
        .await
        .expect("interrupt");
    assert!(!interrupted.interrupted);
}

/// Account operations round-trip through the HTTP surface.
#[tokio::test]
async fn remote_account_operations() {
    let served = serve(Arc::new(MockDriver::new()), 64).await;
    let driver = remote(&served.base_url);

    assert_eq!(driver.read_account().await.expect("read")["account"]["type"], "apiKey");
    assert!(driver.logout().await.expect("logout")["account"].is_null());
    assert_eq!(
        driver
            .login_start(json!({ "type": "apiKey", "apiKey": "sk" }))
            .await
            .expect("login")["account"]["type"],
        "apiKey"
    );
    assert_eq!(driver.login_cancel(json!({})).await.expect("cancel")["status"], "canceled");
    assert_eq!(
        driver.read_rate_limits().await.expect("limits")["rateLimits"]["primary"]["windowDurationMins"],
        300
    );
    assert!(served.state.hub().latest_cursor() >= 2, "account updates were published");
}

// ── Errors ──────────────────────────────────────────────────────────────────

/// An unavailable runtime's error arrives as the same `Unavailable`.
#[tokio::test]
async fn remote_unavailable_error_is_preserved() {
    let served = serve(Arc::new(UnavailableDriver::new("runtime disabled")), 64).await;
    let driver = remote(&served.base_url);

    let err = driver.read_account().await.expect_err("must fail");
    assert_eq!(err, AppError::Unavailable("runtime disabled".into()));

    let err = driver
        .bootstrap_session(&ThreadRef::new("t1"))
        .await
        .expect_err("must fail");
    assert_eq!(err, AppError::Unavailable("runtime disabled".into()));
}

/// The error body carries the kind and detail text.
#[tokio::test]
async fn error_body_shape() {
    let served = serve(Arc::new(UnavailableDriver::new("runtime disabled")), 64).await;

    let response = reqwest::Client::new()
        .post(format!("{}/agent/account/read", served.base_url))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 503);
    let body: Value = response.json().await.expect("json body");
    assert_eq!(
        body,
        json!({ "error": { "kind": "unavailable", "message": "runtime disabled" } })
    );
}

/// An unreachable runtime is an HTTP error.
#[tokio::test]
async fn unreachable_runtime_is_http_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let driver = remote(&format!("http://{addr}"));

    let err = driver.read_account().await.expect_err("must fail");
    assert!(matches!(err, AppError::Http(_)), "got {err:?}");
}

// ── Stream ──────────────────────────────────────────────────────────────────

async fn read_stream(url: String, wanted: usize) -> Vec<Value> {
    let response = reqwest::Client::new()
        .get(url)
        .send()
        .await
        .expect("stream request")
        .error_for_status()
        .expect("stream status");
    let mut bytes = response.bytes_stream();
    let mut parser = SseChunkParser::default();
    let mut payloads = Vec::new();
    while payloads.len() < wanted {
        let chunk = bytes.next().await.expect("stream open").expect("chunk");
        payloads.extend(parser.feed(&chunk));
    }
    payloads
}

/// A consumer resuming from before the retained window gets a resync
/// marker below the oldest retained cursor, then the retained events.
#[tokio::test]
async fn stream_resyncs_lagging_consumer() {
    let mock = Arc::new(MockDriver::new());
    let served = serve(mock.clone(), 2).await;
    for n in 1..=5 {
        mock.emit(&Notification::new("item/agentMessage/delta", json!({ "delta": n.to_string() })));
    }

    let payloads = tokio::time::timeout(
        Duration::from_secs(5),
        read_stream(format!("{}/agent/stream?cursor=0", served.base_url), 3),
    )
    .await
    .expect("stream delivers");

    assert_eq!(payloads[0]["method"], RESYNC_METHOD);
    assert_eq!(payloads[0]["cursor"], 3);
    assert_eq!(payloads[0]["params"]["oldestCursor"], 4);
    assert_eq!(payloads[1]["cursor"], 4);
    assert_eq!(payloads[2]["cursor"], 5);
    assert_eq!(payloads[2]["params"]["delta"], "5");
}

/// The pump replays retained events, then follows live publications.
#[tokio::test]
async fn hub_pump_replays_then_tails() {
    let hub = Arc::new(NotificationHub::new(8));
    for n in 1..=2 {
        hub.publish(Notification::new("turn/started", json!({ "n": n })));
    }
    let (tx, mut rx) = mpsc::channel(16);
    tokio::spawn(Arc::clone(&hub).pump(1, tx));

    let replayed = rx.recv().await.expect("replayed event");
    assert_eq!(replayed.cursor, 2);

    tokio::time::timeout(Duration::from_secs(1), async {
        while hub.consumer_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pump attached");
    hub.publish(Notification::new("turn/completed", json!({ "n": 3 })));

    let live = rx.recv().await.expect("live event");
    assert_eq!(live.cursor, 3);
    assert_eq!(live.method, "turn/completed");

    drop(rx);
    wait_for_consumers(&hub, 0).await;
}

async fn wait_for_consumers(hub: &NotificationHub, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while hub.consumer_count() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("consumer count settles");
}

/// Consumers that disconnect from an idle stream are released without any
/// further publication.
#[tokio::test]
async fn idle_stream_consumers_are_released() {
    let served = serve(Arc::new(MockDriver::new()), 64).await;
    let client = reqwest::Client::new();

    let mut responses = Vec::new();
    for _ in 0..3 {
        let response = client
            .get(format!("{}/agent/stream?cursor=0", served.base_url))
            .send()
            .await
            .expect("stream opens");
        assert!(response.status().is_success());
        responses.push(response);
    }
    wait_for_consumers(served.state.hub(), 3).await;

    drop(responses);
    wait_for_consumers(served.state.hub(), 0).await;
}

// ── Health ──────────────────────────────────────────────────────────────────

/// `/health` wraps the driver snapshot with stream state; the remote
/// driver's health includes the remote one.
#[tokio::test]
async fn health_reports_driver_and_stream() {
    let served = serve(Arc::new(MockDriver::new()), 64).await;

    let body: Value = reqwest::get(format!("{}/health", served.base_url))
        .await
        .expect("health request")
        .json()
        .await
        .expect("json body");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["driver"]["runtime"], "mock");
    assert_eq!(body["stream"]["latestCursor"], 0);

    let driver = remote(&served.base_url);
    let health = driver.health().await;
    assert_eq!(health["runtime"], "remote");
    assert_eq!(health["available"], true);
    assert_eq!(health["remote"]["driver"]["runtime"], "mock");
}
