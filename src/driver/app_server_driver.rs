//! Local app-server subprocess implementation of [`ExecutionDriver`].
//!
//! Composes the transport ([`AppServerClient`]), the thread binder and the
//! turn orchestrator. Account operations map one-to-one onto the agent's
//! `account/*` methods.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::info;

use crate::binder::ThreadBinder;
use crate::config::{AppServerConfig, DriverMode};
use crate::driver::{
    DriverFuture, ExecutionDriver, InterruptOutcome, SessionInfo, ThreadRef, TurnOutcome, TurnRequest,
};
use crate::rpc::message::Notification;
use crate::rpc::spawner::AgentLauncher;
use crate::rpc::AppServerClient;
use crate::subscribers::{Handler, Subscription};
use crate::turn::{Turn, TurnInput, TurnOrchestrator};

/// Runtime backed by an agent subprocess.
#[derive(Debug)]
pub struct AppServerDriver {
    client: AppServerClient,
    binder: ThreadBinder,
    orchestrator: TurnOrchestrator,
}

impl AppServerDriver {
    /// Driver spawning the configured agent binary.
    #[must_use]
    pub fn from_config(config: AppServerConfig, turn_timeout: Duration) -> Self {
        Self::with_client(AppServerClient::from_config(config), turn_timeout)
    }

    /// Driver over a custom launcher.
    #[must_use]
    pub fn with_launcher(config: AppServerConfig, launcher: Arc<dyn AgentLauncher>, turn_timeout: Duration) -> Self {
        Self::with_client(AppServerClient::new(config, launcher), turn_timeout)
    }

    /// Driver over an existing client.
    #[must_use]
    pub fn with_client(client: AppServerClient, turn_timeout: Duration) -> Self {
        Self {
            binder: ThreadBinder::new(client.clone()),
            orchestrator: TurnOrchestrator::new(client.clone(), turn_timeout),
            client,
        }
    }

    /// Underlying transport client.
    #[must_use]
    pub fn client(&self) -> &AppServerClient {
        &self.client
    }

    /// Thread bindings.
    #[must_use]
    pub fn binder(&self) -> &ThreadBinder {
        &self.binder
    }

    /// Turn orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &TurnOrchestrator {
        &self.orchestrator
    }

    async fn seed(&self, thread: &ThreadRef) {
        if let Some(external) = thread.external_thread_id.as_deref() {
            if self.binder.bound(&thread.thread_id).await.is_none() {
                self.binder.seed(&thread.thread_id, external).await;
            }
        }
    }
}

fn outcome(turn: Turn) -> TurnOutcome {
    TurnOutcome {
        status: turn.status(),
        output_text: turn.output_text(),
        error: turn.error().map(str::to_owned),
        runtime_metadata: json!({
            "runtime": DriverMode::AppServer,
            "threadId": turn.thread_id,
            "externalThreadId": turn.external_thread_id,
            "externalTurnId": turn.external_turn_id(),
        }),
        turn_id: turn.turn_id,
    }
}

impl ExecutionDriver for AppServerDriver {
    fn kind(&self) -> DriverMode {
        DriverMode::AppServer
    }

    fn bootstrap_session<'a>(&'a self, thread: &'a ThreadRef) -> DriverFuture<'a, SessionInfo> {
        Box::pin(async move {
            self.client.ensure_started().await?;
            self.seed(thread).await;
            let external = self.binder.resolve(&thread.thread_id).await?;
            info!(thread_id = thread.thread_id.as_str(), external_thread_id = external.as_str(), "session bootstrapped");
            Ok(SessionInfo {
                thread_id: thread.thread_id.clone(),
                external_thread_id: Some(external),
                runtime: DriverMode::AppServer,
            })
        })
    }

    fn run_turn(&self, request: TurnRequest) -> DriverFuture<'_, TurnOutcome> {
        Box::pin(async move {
            self.seed(&request.thread).await;
            let TurnRequest {
                thread,
                turn_id,
                text,
                on_delta,
            } = request;

            let turn = self
                .binder
                .with_thread(&thread.thread_id, |external_thread_id| {
                    self.orchestrator.run(TurnInput {
                        turn_id: turn_id.clone(),
                        thread_id: thread.thread_id.clone(),
                        external_thread_id,
                        text: text.clone(),
                        on_delta: on_delta.clone(),
                    })
                })
                .await?;
            Ok(outcome(turn))
        })
    }

    fn interrupt_turn<'a>(&'a self, _thread: &'a ThreadRef, turn_id: &'a str) -> DriverFuture<'a, InterruptOutcome> {
        Box::pin(async move {
            Ok(InterruptOutcome {
                interrupted: self.orchestrator.interrupt(turn_id),
            })
        })
    }

    fn read_account(&self) -> DriverFuture<'_, Value> {
        Box::pin(self.client.request("account/read", json!({})))
    }

    fn login_start(&self, params: Value) -> DriverFuture<'_, Value> {
        Box::pin(self.client.request("account/login/start", params))
    }

    fn login_cancel(&self, params: Value) -> DriverFuture<'_, Value> {
        Box::pin(self.client.request("account/login/cancel", params))
    }

    fn logout(&self) -> DriverFuture<'_, Value> {
        Box::pin(self.client.request("account/logout", json!({})))
    }

    fn read_rate_limits(&self) -> DriverFuture<'_, Value> {
        Box::pin(self.client.request("account/rateLimits/read", json!({})))
    }

    fn subscribe_notifications(&self, handler: Handler<Notification>) -> Subscription {
        self.client.subscribe(handler)
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = Value> + Send + '_>> {
        Box::pin(async move {
            let transport = self.client.health().await;
            json!({
                "runtime": DriverMode::AppServer,
                "available": true,
                "activeTurns": self.orchestrator.active_turns(),
                "transport": transport,
            })
        })
    }
}
