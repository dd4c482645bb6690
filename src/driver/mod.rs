//! Transport-agnostic execution driver abstraction.
//!
//! The [`ExecutionDriver`] trait decouples callers (the HTTP surface, the
//! CLI, persistence collaborators) from how a turn actually runs: canned
//! replies, a permanently unavailable stub, a remote HTTP runtime, or a
//! local app-server subprocess. Every variant implements the same
//! contract so callers never branch on the transport.

pub mod app_server_driver;
pub mod mock_driver;
pub mod remote_driver;
pub mod unavailable_driver;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{DriverMode, RuntimeConfig};
use crate::rpc::message::Notification;
use crate::subscribers::{Handler, Subscription};
use crate::turn::{DeltaCallback, TurnStatus};
use crate::Result;

pub use app_server_driver::AppServerDriver;
pub use mock_driver::MockDriver;
pub use remote_driver::RemoteDriver;
pub use unavailable_driver::UnavailableDriver;

/// Boxed future returned by driver operations.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A conversation thread as known to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRef {
    /// Internal thread id.
    pub thread_id: String,
    /// Previously bound agent-side thread id, if the caller persisted one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_thread_id: Option<String>,
}

impl ThreadRef {
    /// Thread with no known external binding.
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            external_thread_id: None,
        }
    }

    /// Thread already bound to `external_thread_id`.
    #[must_use]
    pub fn with_external(mut self, external_thread_id: impl Into<String>) -> Self {
        self.external_thread_id = Some(external_thread_id.into());
        self
    }
}

/// Result of [`ExecutionDriver::bootstrap_session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Internal thread id.
    pub thread_id: String,
    /// Bound agent-side thread id.
    #[serde(default)]
    pub external_thread_id: Option<String>,
    /// Driver that owns the session.
    pub runtime: DriverMode,
}

/// One turn to execute.
#[derive(Clone)]
pub struct TurnRequest {
    /// Thread the turn belongs to.
    pub thread: ThreadRef,
    /// Caller-assigned turn id.
    pub turn_id: String,
    /// User text.
    pub text: String,
    /// Optional per-chunk callback for streamed output.
    pub on_delta: Option<DeltaCallback>,
}

impl std::fmt::Debug for TurnRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnRequest")
            .field("thread", &self.thread)
            .field("turn_id", &self.turn_id)
            .field("streaming", &self.on_delta.is_some())
            .finish_non_exhaustive()
    }
}

/// Final result of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    /// Caller-assigned turn id.
    pub turn_id: String,
    /// Terminal status.
    pub status: TurnStatus,
    /// Concatenated assistant text.
    pub output_text: String,
    /// Error text recorded during the turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Driver-specific details (external ids, runtime name).
    #[serde(default)]
    pub runtime_metadata: Value,
}

/// Result of [`ExecutionDriver::interrupt_turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptOutcome {
    /// Whether an in-progress turn was interrupted.
    pub interrupted: bool,
}

/// Uniform turn-execution contract over every runtime variant.
pub trait ExecutionDriver: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> DriverMode;

    /// Prepare the runtime and bind `thread` to an agent-side thread.
    ///
    /// # Errors
    ///
    /// Transport or configuration errors from the underlying runtime.
    fn bootstrap_session<'a>(&'a self, thread: &'a ThreadRef) -> DriverFuture<'a, SessionInfo>;

    /// Execute one turn to a terminal status. A `failed` or `interrupted`
    /// turn is still `Ok`.
    ///
    /// # Errors
    ///
    /// [`AppError::TurnTimeout`](crate::AppError::TurnTimeout) when the turn
    /// never completes, or a transport/configuration error.
    fn run_turn(&self, request: TurnRequest) -> DriverFuture<'_, TurnOutcome>;

    /// Interrupt an in-progress turn. Best effort on the agent side.
    ///
    /// # Errors
    ///
    /// Configuration or remote HTTP errors; agent-side failures are logged.
    fn interrupt_turn<'a>(&'a self, thread: &'a ThreadRef, turn_id: &'a str) -> DriverFuture<'a, InterruptOutcome>;

    /// Current account state.
    ///
    /// # Errors
    ///
    /// Transport or configuration errors.
    fn read_account(&self) -> DriverFuture<'_, Value>;

    /// Begin a login flow.
    ///
    /// # Errors
    ///
    /// Transport or configuration errors.
    fn login_start(&self, params: Value) -> DriverFuture<'_, Value>;

    /// Cancel a pending login flow.
    ///
    /// # Errors
    ///
    /// Transport or configuration errors.
    fn login_cancel(&self, params: Value) -> DriverFuture<'_, Value>;

    /// Log out.
    ///
    /// # Errors
    ///
    /// Transport or configuration errors.
    fn logout(&self) -> DriverFuture<'_, Value>;

    /// Current rate-limit snapshot.
    ///
    /// # Errors
    ///
    /// Transport or configuration errors.
    fn read_rate_limits(&self) -> DriverFuture<'_, Value>;

    /// Receive every notification the runtime emits until the returned
    /// subscription is dropped.
    fn subscribe_notifications(&self, handler: Handler<Notification>) -> Subscription;

    /// Operational snapshot.
    fn health(&self) -> Pin<Box<dyn Future<Output = Value> + Send + '_>>;
}

/// Build the driver selected by `config`.
///
/// Missing prerequisites (no remote `base_url`, no app-server `command`)
/// produce an [`UnavailableDriver`] rather than a half-working one.
#[must_use]
pub fn from_config(config: &RuntimeConfig) -> Arc<dyn ExecutionDriver> {
    let mode = config.driver.mode;
    let driver: Arc<dyn ExecutionDriver> = match mode {
        DriverMode::Mock => Arc::new(MockDriver::new()),
        DriverMode::Unavailable => Arc::new(UnavailableDriver::new("disabled by configuration")),
        DriverMode::Remote => match RemoteDriver::from_config(&config.remote) {
            Ok(driver) => Arc::new(driver),
            Err(err) => {
                warn!(%err, "remote driver not configured");
                Arc::new(UnavailableDriver::new("remote.base_url is not configured"))
            }
        },
        DriverMode::AppServer => {
            if config.app_server.command.trim().is_empty() {
                warn!("app_server.command is empty");
                Arc::new(UnavailableDriver::new("app_server.command is not configured"))
            } else {
                Arc::new(AppServerDriver::from_config(
                    config.app_server.clone(),
                    config.turn.timeout(),
                ))
            }
        }
    };
    info!(requested = mode.as_str(), selected = driver.kind().as_str(), "execution driver ready");
    driver
}
