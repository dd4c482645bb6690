//! Shared test helpers for transport-level integration tests.
//!
//! [`FakeLauncher`] stands in for the agent binary: each launch wires the
//! client to an in-memory agent over duplex pipes. The agent answers
//! `initialize` on its own, records every frame it receives, and hands
//! every other request to a per-test script that decides which frames to
//! send back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use agent_runtime::config::AppServerConfig;
use agent_runtime::rpc::spawner::{AgentLauncher, AgentProcess, LaunchFuture};

/// What the fake agent does in response to a frame.
#[derive(Debug, Clone)]
pub enum Action {
    /// Write a frame to the client.
    Send(Value),
    /// Close both pipes, as if the process died.
    Exit,
}

/// Maps an inbound request or notification to the agent's reaction.
pub type Script = Arc<dyn Fn(&Value) -> Vec<Action> + Send + Sync>;

/// Launcher producing in-memory agents driven by a [`Script`].
pub struct FakeLauncher {
    spawns: AtomicUsize,
    script: Script,
    launch_delay: Duration,
    received: Arc<Mutex<Vec<Value>>>,
    inject: Mutex<Option<mpsc::UnboundedSender<Action>>>,
}

impl FakeLauncher {
    pub fn new(script: impl Fn(&Value) -> Vec<Action> + Send + Sync + 'static) -> Arc<Self> {
        Self::with_delay(script, Duration::ZERO)
    }

    /// Launcher whose launches take `delay` before the agent is up.
    pub fn with_delay(
        script: impl Fn(&Value) -> Vec<Action> + Send + Sync + 'static,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            spawns: AtomicUsize::new(0),
            script: Arc::new(script),
            launch_delay: delay,
            received: Arc::new(Mutex::new(Vec::new())),
            inject: Mutex::new(None),
        })
    }

    /// Number of agents launched so far.
    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Every frame received by any agent, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().expect("lock").clone()
    }

    /// Frames received for `method`.
    pub fn received_method(&self, method: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|frame| frame["method"] == method)
            .collect()
    }

    /// Make the current agent perform `action` unprompted.
    pub fn inject(&self, action: Action) {
        let sender = self.inject.lock().expect("lock").clone();
        sender
            .expect("an agent must be running")
            .send(action)
            .expect("agent task alive");
    }

    /// Wait until `count` frames for `method` have been received.
    pub async fn wait_for(&self, method: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.received_method(method).len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("agent never received {count} x {method}"));
    }
}

impl AgentLauncher for FakeLauncher {
    fn launch(&self) -> LaunchFuture<'_> {
        Box::pin(async move {
            if !self.launch_delay.is_zero() {
                tokio::time::sleep(self.launch_delay).await;
            }
            self.spawns.fetch_add(1, Ordering::SeqCst);

            let (client_stdin, agent_stdin) = tokio::io::duplex(64 * 1024);
            let (agent_stdout, client_stdout) = tokio::io::duplex(64 * 1024);
            let (tx, rx) = mpsc::unbounded_channel();
            *self.inject.lock().expect("lock") = Some(tx);

            tokio::spawn(run_agent(
                agent_stdin,
                agent_stdout,
                Arc::clone(&self.script),
                Arc::clone(&self.received),
                rx,
            ));

            Ok(AgentProcess {
                stdin: Box::new(client_stdin),
                stdout: Box::new(client_stdout),
                stderr: None,
                child: None,
            })
        })
    }
}

async fn run_agent(
    input: DuplexStream,
    mut output: DuplexStream,
    script: Script,
    received: Arc<Mutex<Vec<Value>>>,
    mut inject: mpsc::UnboundedReceiver<Action>,
) {
    let mut lines = BufReader::new(input).lines();
    loop {
        let actions = tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { return };
                let Ok(frame) = serde_json::from_str::<Value>(&line) else { continue };
                received.lock().expect("lock").push(frame.clone());
                if frame["method"] == "initialize" {
                    vec![Action::Send(reply(&frame, json!({ "userAgent": "fake-agent/0.0" })))]
                } else if frame.get("method").is_some() {
                    script(&frame)
                } else {
                    Vec::new()
                }
            }
            Some(action) = inject.recv() => vec![action],
        };

        for action in actions {
            match action {
                Action::Send(frame) => {
                    let mut bytes = serde_json::to_vec(&frame).expect("serialize frame");
                    bytes.push(b'\n');
                    if output.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Action::Exit => return,
            }
        }
    }
}

/// Successful reply to `request`.
pub fn reply(request: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": request["id"], "result": result })
}

/// Error reply to `request`.
pub fn error_reply(request: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "error": { "code": code, "message": message },
    })
}

/// Notification frame.
pub fn notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

/// Script that ignores everything.
pub fn silent(_frame: &Value) -> Vec<Action> {
    Vec::new()
}

/// App-server settings with short deadlines for tests.
pub fn test_config() -> AppServerConfig {
    AppServerConfig {
        command: "fake-agent".into(),
        request_timeout_ms: 2_000,
        startup_timeout_ms: 2_000,
        shutdown_grace_ms: 50,
        max_restarts: 2,
        ..AppServerConfig::default()
    }
}
