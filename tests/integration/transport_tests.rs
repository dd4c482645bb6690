//! Integration tests for the JSON-RPC stdio transport.
//!
//! Covers:
//! - replies arriving out of order complete the right callers
//! - every pending request is rejected when the agent exits
//! - concurrent first calls share a single launch
//! - the restart counter tracks forced restarts, not plain requests
//! - a dead agent is replaced transparently on the next call
//! - timed-out calls restart and retry, giving up after `max_restarts`
//! - approval requests get the configured decision; unknown server
//!   requests get method-not-found
//! - notifications reach subscribers in order
//! - a configured api key logs in an unauthenticated agent without
//!   blocking startup

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use agent_runtime::config::AppServerConfig;
use agent_runtime::errors::METHOD_NOT_FOUND;
use agent_runtime::rpc::message::Notification;
use agent_runtime::rpc::{AppServerClient, SessionState};
use agent_runtime::AppError;

use super::test_helpers::{error_reply, notification, reply, silent, test_config, Action, FakeLauncher};

fn echo(frame: &Value) -> Vec<Action> {
    if frame.get("id").is_none() {
        return Vec::new();
    }
    vec![Action::Send(reply(frame, frame["params"].clone()))]
}

// ── Correlation ─────────────────────────────────────────────────────────────

/// The agent answers the second request first; each caller still gets its
/// own result.
#[tokio::test]
async fn out_of_order_replies_match_ids() {
    let stash: Mutex<Option<Value>> = Mutex::new(None);
    let launcher = FakeLauncher::new(move |frame: &Value| {
        if frame["method"] != "slow" {
            return Vec::new();
        }
        let mut stash = stash.lock().expect("lock");
        match stash.take() {
            None => {
                *stash = Some(frame.clone());
                Vec::new()
            }
            Some(first) => vec![
                Action::Send(reply(frame, frame["params"].clone())),
                Action::Send(reply(&first, first["params"].clone())),
            ],
        }
    });
    let client = AppServerClient::new(test_config(), launcher.clone());
    client.ensure_started().await.expect("agent starts");

    let (a, b) = tokio::join!(
        client.request("slow", json!({ "name": "a" })),
        client.request("slow", json!({ "name": "b" })),
    );

    assert_eq!(a.expect("a completes"), json!({ "name": "a" }));
    assert_eq!(b.expect("b completes"), json!({ "name": "b" }));
}

/// RPC error replies surface as `AppError::Rpc` and do not restart.
#[tokio::test]
async fn rpc_error_is_not_retried() {
    let launcher = FakeLauncher::new(|frame: &Value| {
        if frame["method"] != "thread/start" {
            return Vec::new();
        }
        vec![Action::Send(error_reply(frame, -32602, "invalid params"))]
    });
    let client = AppServerClient::new(test_config(), launcher.clone());

    let err = client.request("thread/start", json!({})).await.expect_err("must fail");

    assert_eq!(
        err,
        AppError::Rpc {
            code: -32602,
            message: "invalid params".into(),
        }
    );
    assert_eq!(launcher.spawns(), 1);
    assert_eq!(client.restart_count(), 0);
}

// ── Disconnect ──────────────────────────────────────────────────────────────

/// When the agent exits, every in-flight request fails with
/// `Disconnected` instead of waiting for its deadline.
#[tokio::test]
async fn exit_rejects_all_pending() {
    let launcher = FakeLauncher::new(silent);
    let mut config = test_config();
    config.max_restarts = 0;
    config.request_timeout_ms = 10_000;
    let client = AppServerClient::new(config, launcher.clone());
    client.ensure_started().await.expect("agent starts");

    let calls = (0..3).map(|n| {
        let client = client.clone();
        tokio::spawn(async move { client.request("hang", json!({ "n": n })).await })
    });
    let handles: Vec<_> = calls.collect();
    launcher.wait_for("hang", 3).await;

    launcher.inject(Action::Exit);

    for handle in handles {
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("rejected before the deadline")
            .expect("task completes");
        assert!(
            matches!(outcome, Err(AppError::Disconnected(_))),
            "expected Disconnected, got {outcome:?}"
        );
    }
}

/// After the agent dies, the next call launches a replacement.
#[tokio::test]
async fn dead_agent_is_replaced_on_next_call() {
    let launcher = FakeLauncher::new(echo);
    let client = AppServerClient::new(test_config(), launcher.clone());
    client.request("ping", json!({})).await.expect("first call");

    launcher.inject(Action::Exit);
    tokio::time::timeout(Duration::from_secs(2), async {
        while client.health().await.state != SessionState::Degraded {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session marked degraded");

    let value = client.request("ping", json!({ "again": true })).await.expect("second call");

    assert_eq!(value, json!({ "again": true }));
    assert_eq!(launcher.spawns(), 2);
    assert_eq!(client.restart_count(), 1);
}

// ── Restart and retry ───────────────────────────────────────────────────────

/// The first process never answers; the call restarts the agent once and
/// succeeds on the replacement.
#[tokio::test]
async fn timed_out_request_succeeds_after_one_restart() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let launcher = FakeLauncher::new(move |frame: &Value| {
        if frame["method"] != "ping" {
            return Vec::new();
        }
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return Vec::new();
        }
        vec![Action::Send(reply(frame, json!({ "pong": true })))]
    });
    let client = AppServerClient::new(test_config(), launcher.clone());

    let value = client
        .request_with_timeout("ping", json!({}), Duration::from_millis(200))
        .await
        .expect("succeeds after restart");

    assert_eq!(value, json!({ "pong": true }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.restart_count(), 1);
    assert_eq!(launcher.spawns(), 2);
}

/// An agent that never answers costs exactly `max_restarts` restarts before
/// the timeout reaches the caller.
#[tokio::test]
async fn persistent_timeout_gives_up_after_max_restarts() {
    let launcher = FakeLauncher::new(silent);
    let config = test_config();
    let max_restarts = config.max_restarts;
    let client = AppServerClient::new(config, launcher.clone());

    let err = client
        .request_with_timeout("ping", json!({}), Duration::from_millis(100))
        .await
        .expect_err("must give up");

    assert!(matches!(err, AppError::RequestTimeout(_)), "expected RequestTimeout, got {err:?}");
    assert_eq!(client.restart_count(), max_restarts);
    assert_eq!(launcher.spawns(), max_restarts as usize + 1);
    assert_eq!(launcher.received_method("ping").len(), max_restarts as usize + 1);
    assert!(client.health().await.last_error.is_some());
}

// ── Lifecycle ───────────────────────────────────────────────────────────────

/// Five concurrent first calls result in exactly one launch.
#[tokio::test]
async fn concurrent_start_launches_once() {
    let launcher = FakeLauncher::with_delay(echo, Duration::from_millis(50));
    let client = AppServerClient::new(test_config(), launcher.clone());

    let starts: Vec<_> = (0..5)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.ensure_started().await })
        })
        .collect();
    for start in starts {
        start.await.expect("task completes").expect("start succeeds");
    }

    assert_eq!(launcher.spawns(), 1);
    assert_eq!(launcher.received_method("initialize").len(), 1);
    assert_eq!(launcher.received_method("initialized").len(), 1);
}

/// Forced restarts increment the counter; ordinary requests do not; a new
/// client starts from zero.
#[tokio::test]
async fn restart_count_tracks_forced_restarts() {
    let launcher = FakeLauncher::new(echo);
    let client = AppServerClient::new(test_config(), launcher.clone());
    client.ensure_started().await.expect("agent starts");
    assert_eq!(client.restart_count(), 0);

    client.force_restart("test").await;
    assert_eq!(client.restart_count(), 1);

    for n in 0..3 {
        client.request("ping", json!({ "n": n })).await.expect("request");
    }
    assert_eq!(client.restart_count(), 1);
    assert_eq!(launcher.spawns(), 2);

    let fresh = AppServerClient::new(test_config(), launcher.clone());
    assert_eq!(fresh.restart_count(), 0);

    let health = client.health().await;
    assert!(health.running);
    assert!(health.initialized);
    assert_eq!(health.restart_count, 1);
}

/// Stopping leaves the transport stopped until the next call.
#[tokio::test]
async fn stop_then_request_relaunches() {
    let launcher = FakeLauncher::new(echo);
    let client = AppServerClient::new(test_config(), launcher.clone());
    client.ensure_started().await.expect("agent starts");

    client.stop().await;
    let health = client.health().await;
    assert!(!health.running);
    assert_eq!(health.state, SessionState::Stopped);

    client.request("ping", json!({})).await.expect("relaunches");
    assert_eq!(launcher.spawns(), 2);
}

// ── Server requests ─────────────────────────────────────────────────────────

/// Approval requests are declined by default; unknown methods get
/// method-not-found; custom handlers are consulted.
#[tokio::test]
async fn server_requests_are_answered() {
    let launcher = FakeLauncher::new(|frame: &Value| {
        if frame["method"] == "trigger" {
            vec![
                Action::Send(json!({
                    "jsonrpc": "2.0",
                    "id": "srv-1",
                    "method": "item/commandExecution/requestApproval",
                    "params": { "command": "rm -rf /" },
                })),
                Action::Send(json!({ "jsonrpc": "2.0", "id": 77, "method": "tool/unknown", "params": {} })),
                Action::Send(json!({ "jsonrpc": "2.0", "id": 78, "method": "custom/echo", "params": { "x": 1 } })),
                Action::Send(reply(frame, json!({}))),
            ]
        } else {
            Vec::new()
        }
    });
    let client = AppServerClient::new(test_config(), launcher.clone());
    client.add_server_request_handler(Arc::new(|method: &str, params: &Value| {
        (method == "custom/echo").then(|| Ok(params.clone()))
    }));

    client.request("trigger", json!({})).await.expect("trigger");

    let replies = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let replies: Vec<Value> = launcher
                .received()
                .into_iter()
                .filter(|frame| frame.get("method").is_none())
                .collect();
            if replies.len() >= 3 {
                return replies;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("three replies written");

    let by_id = |id: Value| {
        replies
            .iter()
            .find(|frame| frame["id"] == id)
            .cloned()
            .expect("reply present")
    };
    assert_eq!(by_id(json!("srv-1"))["result"]["decision"], "decline");
    assert_eq!(by_id(json!(77))["error"]["code"], METHOD_NOT_FOUND);
    assert_eq!(by_id(json!(78))["result"], json!({ "x": 1 }));
}

// ── Notifications ───────────────────────────────────────────────────────────

/// Subscribers see notifications in the order the agent wrote them, and
/// stop seeing them once unsubscribed.
#[tokio::test]
async fn notifications_fan_out_in_order() {
    let launcher = FakeLauncher::new(|frame: &Value| {
        if frame["method"] != "go" {
            return Vec::new();
        }
        let mut actions: Vec<Action> = (1..=3)
            .map(|n| Action::Send(notification("item/agentMessage/delta", json!({ "delta": n.to_string() }))))
            .collect();
        actions.push(Action::Send(reply(frame, json!({}))));
        actions
    });
    let client = AppServerClient::new(test_config(), launcher.clone());
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&seen);
    let subscription = client.subscribe(Arc::new(move |n: &Notification| {
        sink.lock().expect("lock").push(n.params["delta"].as_str().unwrap_or_default().to_owned());
    }));
    assert_eq!(client.subscriber_count(), 1);

    client.request("go", json!({})).await.expect("go");
    // Notifications were written before the reply, on the same pipe.
    assert_eq!(*seen.lock().expect("lock"), vec!["1", "2", "3"]);

    subscription.unsubscribe();
    assert_eq!(client.subscriber_count(), 0);
    client.request("go", json!({})).await.expect("go again");
    assert_eq!(seen.lock().expect("lock").len(), 3);
}

// ── Auth bootstrap ──────────────────────────────────────────────────────────

fn auth_script(account: Value) -> impl Fn(&Value) -> Vec<Action> + Send + Sync + 'static {
    move |frame: &Value| match frame["method"].as_str() {
        Some("account/read") => vec![Action::Send(reply(frame, json!({ "account": account.clone() })))],
        Some("account/login/start") => vec![Action::Send(reply(frame, json!({ "type": "apiKey" })))],
        _ => echo(frame),
    }
}

fn keyed_config() -> AppServerConfig {
    AppServerConfig {
        api_key: Some("sk-test".into()),
        ..test_config()
    }
}

/// With a configured key and no account, startup logs in with that key and
/// the client stays usable while it does.
#[tokio::test]
async fn unauthenticated_agent_logs_in_with_configured_key() {
    let launcher = FakeLauncher::new(auth_script(Value::Null));
    let client = AppServerClient::new(keyed_config(), launcher.clone());

    tokio::time::timeout(Duration::from_secs(1), client.ensure_started())
        .await
        .expect("start does not wait on auth")
        .expect("agent starts");
    launcher.wait_for("account/login/start", 1).await;

    let login = launcher.received_method("account/login/start");
    assert_eq!(login.len(), 1);
    assert_eq!(login[0]["params"]["type"], "apiKey");
    assert_eq!(login[0]["params"]["apiKey"], "sk-test");

    let value = tokio::time::timeout(Duration::from_secs(1), client.request("ping", json!({ "n": 1 })))
        .await
        .expect("no deadlock after bootstrap")
        .expect("request succeeds");
    assert_eq!(value, json!({ "n": 1 }));
    assert_eq!(launcher.spawns(), 1);
    assert_eq!(client.restart_count(), 0);
}

/// An already authenticated agent is left alone.
#[tokio::test]
async fn authenticated_agent_skips_login() {
    let launcher = FakeLauncher::new(auth_script(json!({ "type": "apiKey" })));
    let client = AppServerClient::new(keyed_config(), launcher.clone());

    tokio::time::timeout(Duration::from_secs(1), client.ensure_started())
        .await
        .expect("start does not wait on auth")
        .expect("agent starts");
    launcher.wait_for("account/read", 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(launcher.received_method("account/login/start").is_empty());
    client.request("ping", json!({})).await.expect("request succeeds");
    assert_eq!(launcher.spawns(), 1);
}

/// Without a key, startup does not touch account state.
#[tokio::test]
async fn no_key_skips_auth_bootstrap() {
    let launcher = FakeLauncher::new(auth_script(Value::Null));
    let client = AppServerClient::new(test_config(), launcher.clone());

    client.request("ping", json!({})).await.expect("request succeeds");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(launcher.received_method("account/read").is_empty());
    assert!(launcher.received_method("account/login/start").is_empty());
}
