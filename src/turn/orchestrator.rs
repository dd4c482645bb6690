//! Runs turns against the app-server and tracks the ones in flight.
//!
//! [`TurnOrchestrator::run`] subscribes to the client's notifications
//! *before* sending `turn/start`, so nothing emitted between the request
//! and its response is lost. Matching notifications are queued on an
//! unbounded channel and folded into a [`TurnAccumulator`] after the start
//! response has fixed (or failed to fix) the agent-side turn id.
//!
//! The wait races three events: a terminal notification, the turn
//! deadline, and a local interrupt. Every exit path drops the subscription
//! and the registry entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rpc::message::{Notification, TurnPayload};
use crate::rpc::AppServerClient;
use crate::turn::accumulator::{DeltaCallback, Step, TurnAccumulator};
use crate::turn::model::{Turn, TurnStatus};
use crate::{AppError, Result};

/// Everything needed to start one turn on a bound thread.
#[derive(Clone)]
pub struct TurnInput {
    /// Caller-assigned turn id.
    pub turn_id: String,
    /// Internal thread id.
    pub thread_id: String,
    /// Agent-side thread id from the binder.
    pub external_thread_id: String,
    /// User text.
    pub text: String,
    /// Per-chunk callback.
    pub on_delta: Option<DeltaCallback>,
}

impl std::fmt::Debug for TurnInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnInput")
            .field("turn_id", &self.turn_id)
            .field("thread_id", &self.thread_id)
            .field("external_thread_id", &self.external_thread_id)
            .field("streaming", &self.on_delta.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct ActiveTurn {
    external_thread_id: String,
    external_turn_id: Option<String>,
    cancel: CancellationToken,
    /// Interrupted before the agent turn id was known; `run` sends
    /// `turn/interrupt` once it is.
    interrupt_deferred: bool,
}

type Registry = Mutex<HashMap<String, ActiveTurn>>;

/// Removes a turn from the registry when the run ends, however it ends.
struct Registration<'a> {
    registry: &'a Registry,
    turn_id: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        lock(self.registry).remove(&self.turn_id);
    }
}

/// `turn/start` params for a single text input.
#[must_use]
pub fn start_params(external_thread_id: &str, text: &str) -> Value {
    json!({
        "threadId": external_thread_id,
        "input": [{ "type": "text", "text": text }],
    })
}

/// Drives turns over one [`AppServerClient`].
#[derive(Debug, Clone)]
pub struct TurnOrchestrator {
    client: AppServerClient,
    timeout: Duration,
    active: Arc<Registry>,
}

impl TurnOrchestrator {
    /// Orchestrator whose turns give up after `timeout`.
    #[must_use]
    pub fn new(client: AppServerClient, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Underlying transport client.
    #[must_use]
    pub fn client(&self) -> &AppServerClient {
        &self.client
    }

    /// Number of turns currently waiting for completion.
    #[must_use]
    pub fn active_turns(&self) -> usize {
        lock(&self.active).len()
    }

    /// Whether `turn_id` is still in progress.
    #[must_use]
    pub fn is_active(&self, turn_id: &str) -> bool {
        lock(&self.active).contains_key(turn_id)
    }

    /// Start a turn and wait for it to reach a terminal status.
    ///
    /// A turn that ends `failed` or `interrupted` is still `Ok`; inspect
    /// [`Turn::status`].
    ///
    /// # Errors
    ///
    /// - Any error from `turn/start` itself, unchanged (the binder looks
    ///   for thread-missing RPC errors).
    /// - [`AppError::TurnTimeout`] when no terminal notification arrives
    ///   in time. The agent-side turn is not cancelled.
    pub async fn run(&self, input: TurnInput) -> Result<Turn> {
        let TurnInput {
            turn_id,
            thread_id,
            external_thread_id,
            text,
            on_delta,
        } = input;

        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let filter_thread = external_thread_id.clone();
        let subscription = self.client.subscribe(Arc::new(move |notification: &Notification| {
            let relevant = notification
                .thread_id()
                .map_or(notification.method == "error", |id| id == filter_thread);
            if relevant {
                let _ = tx.send(notification.clone());
            }
        }));

        let cancel = CancellationToken::new();
        let _registration = self.register(&turn_id, &external_thread_id, cancel.clone());
        let mut accumulator = TurnAccumulator::new(
            Turn::new(turn_id.as_str(), thread_id, external_thread_id.as_str()),
            on_delta,
        );

        info!(turn_id = turn_id.as_str(), external_thread_id = external_thread_id.as_str(), "starting turn");
        let response = self
            .client
            .request("turn/start", start_params(&external_thread_id, &text))
            .await?;

        let payload = TurnPayload::from_container(&response);
        if let Some(id) = payload.id.as_deref() {
            accumulator.adopt_turn_id(id);
        }
        let mut recorded = self.record_external_turn_id(&turn_id, accumulator.external_turn_id());

        let fast_status = payload
            .status
            .as_deref()
            .and_then(TurnStatus::parse)
            .filter(|status| status.is_terminal());
        if let Some(status) = fast_status {
            debug!(turn_id = turn_id.as_str(), %status, "turn resolved by start response");
            accumulator.finish(status, payload.error);
            return Ok(accumulator.into_turn());
        }

        let deadline = sleep_until(Instant::now() + self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    accumulator.finish(TurnStatus::Interrupted, None);
                    if self.interrupt_deferred(&turn_id) {
                        match accumulator.external_turn_id() {
                            Some(external_turn_id) => {
                                self.send_interrupt(&turn_id, &external_thread_id, external_turn_id);
                            }
                            None => warn!(
                                turn_id = turn_id.as_str(),
                                "agent turn id never reported, cannot send turn/interrupt"
                            ),
                        }
                    }
                    break;
                }
                received = rx.recv() => {
                    let Some(notification) = received else {
                        return Err(AppError::Turn(format!(
                            "notification stream closed while turn {turn_id} was in progress"
                        )));
                    };
                    if let Step::Terminal(status) = accumulator.apply(&notification) {
                        debug!(turn_id = turn_id.as_str(), %status, "turn completed");
                        break;
                    }
                    if !recorded {
                        recorded = self.record_external_turn_id(&turn_id, accumulator.external_turn_id());
                    }
                }
                () = &mut deadline => {
                    warn!(turn_id = turn_id.as_str(), timeout_secs = self.timeout.as_secs(), "turn timed out");
                    return Err(AppError::TurnTimeout(format!(
                        "turn {turn_id} produced no terminal notification within {}s",
                        self.timeout.as_secs()
                    )));
                }
            }
        }

        drop(subscription);
        let turn = accumulator.into_turn();
        info!(turn_id = turn_id.as_str(), status = %turn.status(), "turn finished");
        Ok(turn)
    }

    /// Interrupt an in-flight turn.
    ///
    /// The waiting run resolves as `interrupted` immediately; the
    /// `turn/interrupt` request is then sent in the background and a
    /// failure is only logged. When the agent turn id is not known yet the
    /// request is sent by the run as soon as the `turn/start` reply
    /// supplies it. Returns `false` when the turn is not in progress. Must
    /// be called from within a Tokio runtime.
    pub fn interrupt(&self, turn_id: &str) -> bool {
        let active = {
            let mut registry = lock(&self.active);
            let Some(active) = registry.get_mut(turn_id) else {
                debug!(turn_id, "interrupt ignored: turn not in progress");
                return false;
            };
            if active.external_turn_id.is_none() {
                active.interrupt_deferred = true;
            }
            active.clone()
        };

        active.cancel.cancel();
        info!(turn_id, "turn interrupted locally");

        match active.external_turn_id.as_deref() {
            Some(external_turn_id) => self.send_interrupt(turn_id, &active.external_thread_id, external_turn_id),
            None => debug!(turn_id, "agent turn id unknown, deferring turn/interrupt"),
        }
        true
    }

    fn send_interrupt(&self, turn_id: &str, external_thread_id: &str, external_turn_id: &str) {
        let client = self.client.clone();
        let params = json!({
            "threadId": external_thread_id,
            "turnId": external_turn_id,
        });
        let turn_id = turn_id.to_owned();
        tokio::spawn(async move {
            if let Err(err) = client.request("turn/interrupt", params).await {
                warn!(turn_id = turn_id.as_str(), %err, "turn/interrupt failed");
            }
        });
    }

    fn interrupt_deferred(&self, turn_id: &str) -> bool {
        lock(&self.active)
            .get(turn_id)
            .is_some_and(|active| active.interrupt_deferred)
    }

    fn register(&self, turn_id: &str, external_thread_id: &str, cancel: CancellationToken) -> Registration<'_> {
        lock(&self.active).insert(
            turn_id.to_owned(),
            ActiveTurn {
                external_thread_id: external_thread_id.to_owned(),
                external_turn_id: None,
                cancel,
                interrupt_deferred: false,
            },
        );
        Registration {
            registry: &self.active,
            turn_id: turn_id.to_owned(),
        }
    }

    fn record_external_turn_id(&self, turn_id: &str, external_turn_id: Option<&str>) -> bool {
        let Some(external_turn_id) = external_turn_id else {
            return false;
        };
        if let Some(active) = lock(&self.active).get_mut(turn_id) {
            active.external_turn_id = Some(external_turn_id.to_owned());
        }
        true
    }
}

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, ActiveTurn>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
