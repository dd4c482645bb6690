//! Integration tests for the reconnecting notification relay.
//!
//! A scripted stream endpoint ends the first connection after cursor 3 and
//! replays from cursor 2 on the second, so the relay has to resume from
//! its last cursor and drop what it already delivered.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;

use agent_runtime::config::RemoteConfig;
use agent_runtime::driver::{ExecutionDriver, RemoteDriver};
use agent_runtime::relay::Replay;
use agent_runtime::rpc::message::Notification;

#[derive(Default)]
struct Script {
    connections: AtomicUsize,
    cursors: Mutex<Vec<u64>>,
}

#[derive(Deserialize)]
struct StreamQuery {
    cursor: u64,
}

fn chunk(cursor: u64, method: &str) -> String {
    let event = json!({ "cursor": cursor, "method": method, "params": { "n": cursor } });
    format!("id: {cursor}\ndata: {event}\n\n")
}

async fn stream(State(script): State<Arc<Script>>, Query(query): Query<StreamQuery>) -> impl IntoResponse {
    script.cursors.lock().expect("lock").push(query.cursor);
    let body: String = match script.connections.fetch_add(1, Ordering::SeqCst) {
        0 => (1..=3).map(|c| chunk(c, "item/agentMessage/delta")).collect(),
        1 => {
            let mut body: String = (2..=4).map(|c| chunk(c, "item/agentMessage/delta")).collect();
            body.push_str(&chunk(5, "thread/tokenUsage/updated"));
            body.push_str(&chunk(6, "turn/completed"));
            body
        }
        _ => String::new(),
    };
    ([(CONTENT_TYPE, "text/event-stream")], body)
}

async fn spawn_stream_server(script: Arc<Script>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/agent/stream", get(stream)).with_state(script);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn remote(base_url: String) -> RemoteDriver {
    RemoteDriver::from_config(&RemoteConfig {
        base_url: Some(base_url),
        reconnect_delay_ms: 20,
        ..RemoteConfig::default()
    })
    .expect("remote driver")
}

/// The relay reconnects from its last cursor, delivers each forwardable
/// event exactly once, and stops when the last subscriber leaves.
#[tokio::test]
async fn relay_resumes_without_duplicates() {
    let script = Arc::new(Script::default());
    let driver = remote(spawn_stream_server(Arc::clone(&script)).await);
    assert!(!driver.relay().is_running());

    let seen = Arc::new(Mutex::new(Vec::<(String, u64)>::new()));
    let sink = Arc::clone(&seen);
    let subscription = driver.subscribe_notifications(Arc::new(move |n: &Notification| {
        sink.lock()
            .expect("lock")
            .push((n.method.clone(), n.params["n"].as_u64().unwrap_or_default()));
    }));
    assert!(driver.relay().is_running());

    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.lock().expect("lock").len() < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("five events relayed");

    let seen = seen.lock().expect("lock").clone();
    let numbers: Vec<u64> = seen.iter().map(|(_, n)| *n).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 6], "duplicates and non-forwardable events dropped");
    assert_eq!(seen.last().map(|(m, _)| m.as_str()), Some("turn/completed"));

    let cursors = script.cursors.lock().expect("lock").clone();
    assert_eq!(&cursors[..2], &[0, 3], "second connection resumes from cursor 3");
    assert_eq!(driver.relay().last_cursor(), 6);

    let Replay::Events(retained) = driver.relay().replay_since(3) else {
        panic!("expected retained events");
    };
    let retained: Vec<u64> = retained.iter().map(|event| event.cursor).collect();
    assert_eq!(retained, vec![4, 6]);

    drop(subscription);
    assert!(!driver.relay().is_running());
    assert_eq!(driver.relay().subscriber_count(), 0);
}

/// A relay keeps retrying an unreachable runtime until unsubscribed.
#[tokio::test]
async fn relay_retries_unreachable_runtime() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let driver = remote(format!("http://{addr}"));

    let subscription = driver.subscribe_notifications(Arc::new(|_: &Notification| {}));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(driver.relay().is_running());
    assert_eq!(driver.relay().last_cursor(), 0);

    subscription.unsubscribe();
    assert!(!driver.relay().is_running());
}
