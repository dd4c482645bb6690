//! Transport state shared between the client and its background tasks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::METHOD_NOT_FOUND;
use crate::rpc::message::{Notification, RpcError};
use crate::subscribers::SubscriberSet;

/// Number of diagnostic lines retained for health reports.
pub const DIAGNOSTIC_TAIL: usize = 40;

/// Lifecycle of the transport's current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No process has been launched yet.
    NotStarted,
    /// A launch and handshake are in progress.
    Starting,
    /// Handshake complete; requests may flow.
    Initialized,
    /// The process died or the handshake failed; the next call restarts.
    Degraded,
    /// Stopped explicitly.
    Stopped,
}

/// Answers a server-initiated request, or declines by returning `None`.
pub type ServerRequestHandler =
    Arc<dyn Fn(&str, &Value) -> Option<std::result::Result<Value, RpcError>> + Send + Sync>;

/// Snapshot exposed to operational tooling.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportHealth {
    /// Whether a process is currently running.
    pub running: bool,
    /// Whether the handshake has completed for the current process.
    pub initialized: bool,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Restarts performed since the client was constructed.
    pub restart_count: u32,
    /// Most recent transport failure.
    pub last_error: Option<String>,
    /// When the current process finished its handshake.
    pub ready_at: Option<DateTime<Utc>>,
    /// Requests awaiting replies.
    pub pending_requests: usize,
    /// Tail of recent stderr and lifecycle lines.
    pub recent_diagnostics: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct StatusRecord {
    pub(crate) state: SessionState,
    pub(crate) generation: u64,
    pub(crate) last_error: Option<String>,
    pub(crate) ready_at: Option<DateTime<Utc>>,
}

/// State shared by the client, its reader task and its stderr drain.
pub(crate) struct TransportShared {
    pub(crate) subscribers: SubscriberSet<Notification>,
    handlers: RwLock<Vec<ServerRequestHandler>>,
    status: Mutex<StatusRecord>,
    diagnostics: Mutex<VecDeque<String>>,
}

impl TransportShared {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: SubscriberSet::new(),
            handlers: RwLock::new(Vec::new()),
            status: Mutex::new(StatusRecord {
                state: SessionState::NotStarted,
                generation: 0,
                last_error: None,
                ready_at: None,
            }),
            diagnostics: Mutex::new(VecDeque::with_capacity(DIAGNOSTIC_TAIL)),
        }
    }

    pub(crate) fn status(&self) -> MutexGuard<'_, StatusRecord> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_handler(&self, handler: ServerRequestHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Offer a server request to each handler in registration order; the
    /// first to produce an outcome answers. Nobody answering yields a
    /// method-not-found error reply.
    pub(crate) fn handle_server_request(
        &self,
        method: &str,
        params: &Value,
    ) -> std::result::Result<Value, RpcError> {
        let handlers: Vec<ServerRequestHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for handler in handlers {
            if let Some(outcome) = handler(method, params) {
                debug!(method, ok = outcome.is_ok(), "server request handled");
                return outcome;
            }
        }

        warn!(method, "no handler for server request");
        Err(RpcError {
            code: METHOD_NOT_FOUND,
            message: format!("unhandled server request: {method}"),
        })
    }

    /// Record that the process of `generation` is gone. A stale reader from
    /// an earlier generation does not touch the current status.
    pub(crate) fn session_lost(&self, generation: u64, reason: &str) {
        {
            let mut status = self.status();
            if status.generation == generation
                && matches!(status.state, SessionState::Initialized | SessionState::Starting)
            {
                status.state = SessionState::Degraded;
                status.last_error = Some(reason.to_owned());
                status.ready_at = None;
            }
        }
        self.record_diagnostic(format!("session {generation} lost: {reason}"));
    }

    pub(crate) fn record_diagnostic(&self, line: String) {
        let mut tail = self
            .diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if tail.len() == DIAGNOSTIC_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    pub(crate) fn diagnostics(&self) -> Vec<String> {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
