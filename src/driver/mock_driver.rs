//! In-process driver with canned behaviour.
//!
//! Turns echo the user text back as `mock reply: <text>`, streamed one word
//! at a time through the same notifications a real agent emits
//! (`turn/started`, `item/agentMessage/delta`, `item/completed`,
//! `turn/completed`). Useful for local development of callers and for
//! exercising the HTTP surface without an agent binary.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{json, Value};
use tracing::debug;

use crate::config::DriverMode;
use crate::driver::{
    DriverFuture, ExecutionDriver, InterruptOutcome, SessionInfo, ThreadRef, TurnOutcome, TurnRequest,
};
use crate::rpc::message::Notification;
use crate::subscribers::{Handler, SubscriberSet, Subscription};
use crate::turn::TurnStatus;

/// Canned-response runtime.
#[derive(Debug)]
pub struct MockDriver {
    subscribers: SubscriberSet<Notification>,
    logged_in: AtomicBool,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Mock runtime with a logged-in account.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: SubscriberSet::new(),
            logged_in: AtomicBool::new(true),
        }
    }

    /// Deliver `notification` to every subscriber.
    pub fn emit(&self, notification: &Notification) {
        self.subscribers.emit(notification);
    }

    fn external_thread_id(thread: &ThreadRef) -> String {
        thread
            .external_thread_id
            .clone()
            .unwrap_or_else(|| format!("mock-thread-{}", thread.thread_id))
    }

    fn account_state(&self) -> Value {
        if self.logged_in.load(Ordering::SeqCst) {
            json!({ "account": { "type": "apiKey" }, "requiresOpenaiAuth": false })
        } else {
            json!({ "account": null, "requiresOpenaiAuth": true })
        }
    }

    fn set_logged_in(&self, logged_in: bool) -> Value {
        self.logged_in.store(logged_in, Ordering::SeqCst);
        let state = self.account_state();
        self.emit(&Notification::new("account/updated", state.clone()));
        state
    }
}

impl ExecutionDriver for MockDriver {
    fn kind(&self) -> DriverMode {
        DriverMode::Mock
    }

    fn bootstrap_session<'a>(&'a self, thread: &'a ThreadRef) -> DriverFuture<'a, SessionInfo> {
        Box::pin(async move {
            Ok(SessionInfo {
                thread_id: thread.thread_id.clone(),
                external_thread_id: Some(Self::external_thread_id(thread)),
                runtime: DriverMode::Mock,
            })
        })
    }

    fn run_turn(&self, request: TurnRequest) -> DriverFuture<'_, TurnOutcome> {
        Box::pin(async move {
            let thread_id = Self::external_thread_id(&request.thread);
            let turn_id = format!("mock-turn-{}", request.turn_id);
            let reply = format!("mock reply: {}", request.text);
            debug!(turn_id = request.turn_id.as_str(), "mock turn");

            self.emit(&Notification::new(
                "turn/started",
                json!({ "threadId": thread_id, "turn": { "id": turn_id, "status": "inProgress" } }),
            ));
            for chunk in reply.split_inclusive(' ') {
                if let Some(on_delta) = &request.on_delta {
                    on_delta(chunk);
                }
                self.emit(&Notification::new(
                    "item/agentMessage/delta",
                    json!({ "threadId": thread_id, "turnId": turn_id, "delta": chunk }),
                ));
            }
            self.emit(&Notification::new(
                "item/completed",
                json!({
                    "threadId": thread_id,
                    "turnId": turn_id,
                    "item": { "type": "agentMessage", "text": reply },
                }),
            ));
            self.emit(&Notification::new(
                "turn/completed",
                json!({ "threadId": thread_id, "turn": { "id": turn_id, "status": "completed" } }),
            ));

            Ok(TurnOutcome {
                turn_id: request.turn_id,
                status: TurnStatus::Completed,
                output_text: reply,
                error: None,
                runtime_metadata: json!({
                    "runtime": DriverMode::Mock,
                    "externalThreadId": thread_id,
                    "externalTurnId": turn_id,
                }),
            })
        })
    }

    fn interrupt_turn<'a>(&'a self, _thread: &'a ThreadRef, _turn_id: &'a str) -> DriverFuture<'a, InterruptOutcome> {
        // Mock turns finish before run_turn returns.
        Box::pin(async move { Ok(InterruptOutcome { interrupted: false }) })
    }

    fn read_account(&self) -> DriverFuture<'_, Value> {
        Box::pin(async move { Ok(self.account_state()) })
    }

    fn login_start(&self, _params: Value) -> DriverFuture<'_, Value> {
        Box::pin(async move { Ok(self.set_logged_in(true)) })
    }

    fn login_cancel(&self, _params: Value) -> DriverFuture<'_, Value> {
        Box::pin(async move { Ok(json!({ "status": "canceled" })) })
    }

    fn logout(&self) -> DriverFuture<'_, Value> {
        Box::pin(async move { Ok(self.set_logged_in(false)) })
    }

    fn read_rate_limits(&self) -> DriverFuture<'_, Value> {
        Box::pin(async move {
            Ok(json!({ "rateLimits": { "primary": { "usedPercent": 0, "windowDurationMins": 300 } } }))
        })
    }

    fn subscribe_notifications(&self, handler: Handler<Notification>) -> Subscription {
        self.subscribers.subscribe(handler)
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = Value> + Send + '_>> {
        Box::pin(async move {
            json!({
                "runtime": DriverMode::Mock,
                "available": true,
                "subscribers": self.subscribers.len(),
            })
        })
    }
}
