//! One live agent process and its in-flight request table.
//!
//! An [`RpcSession`] is created for every process launch and discarded on
//! exit or restart. It owns:
//!
//! - the next-request-id counter (starting at 1),
//! - the in-flight map of id → [`PendingRequest`],
//! - the write half of the agent's stdin,
//! - the OS process handle, when there is one.
//!
//! Every pending request is removed from the map exactly once: by the reader
//! when the matching reply arrives, by the caller when its deadline fires or
//! its future is dropped, or by [`RpcSession::close`], which rejects all that
//! remain with [`AppError::Disconnected`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::rpc::message::{notification_frame, reply_frame, request_frame, RpcError};
use crate::rpc::spawner::{self, BoxedWriter};
use crate::{AppError, Result};

/// A request awaiting its reply.
#[derive(Debug)]
pub struct PendingRequest {
    /// Method name, kept for diagnostics.
    pub method: String,
    completion: oneshot::Sender<Result<Value>>,
}

#[derive(Debug, Default)]
struct PendingTable {
    /// Set once the session is closed; later registrations fail fast.
    closed: Option<String>,
    entries: HashMap<u64, PendingRequest>,
}

/// Transport state for one agent process.
pub struct RpcSession {
    generation: u64,
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    child: tokio::sync::Mutex<Option<Child>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("generation", &self.generation)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RpcSession {
    /// Wrap a freshly launched process.
    #[must_use]
    pub fn new(generation: u64, stdin: BoxedWriter, child: Option<Child>) -> Self {
        Self {
            generation,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingTable::default()),
            writer: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(child),
            cancel: CancellationToken::new(),
        }
    }

    /// Launch counter value this session was created under.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Token cancelled when the session shuts down; background tasks
    /// attached to the process watch it.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.table().closed.is_some()
    }

    /// Number of requests still awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.table().entries.len()
    }

    /// Issue a request and wait for its reply.
    ///
    /// # Errors
    ///
    /// - [`AppError::Disconnected`] if the session is closed before or while
    ///   waiting.
    /// - [`AppError::Transport`] if the frame cannot be written.
    /// - [`AppError::RequestTimeout`] if no reply arrives within `timeout`.
    /// - [`AppError::Rpc`] if the agent replies with an error object.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut table = self.table();
            if let Some(reason) = &table.closed {
                return Err(AppError::Disconnected(reason.clone()));
            }
            table.entries.insert(
                id,
                PendingRequest {
                    method: method.to_owned(),
                    completion: tx,
                },
            );
        }

        // Removes the entry if this future is dropped or times out.
        let guard = PendingGuard { session: self, id };

        trace!(id, method, "rpc request");
        self.write_frame(&request_frame(id, method, &params)).await?;

        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(guard);

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_dropped)) => Err(AppError::Disconnected(format!(
                "request {method} abandoned by transport"
            ))),
            Err(_elapsed) => Err(AppError::RequestTimeout(format!(
                "{method} (id {id}) got no reply within {timeout:?}"
            ))),
        }
    }

    /// Send a notification; no reply is expected.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Disconnected`] or [`AppError::Transport`].
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let closed = self.table().closed.clone();
        if let Some(reason) = closed {
            return Err(AppError::Disconnected(reason));
        }
        self.write_frame(&notification_frame(method, &params)).await
    }

    /// Answer a server-initiated request.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if the write fails.
    pub async fn reply(&self, id: &Value, outcome: &std::result::Result<Value, RpcError>) -> Result<()> {
        self.write_frame(&reply_frame(id, outcome)).await
    }

    /// Deliver a reply to the request with `id`.
    ///
    /// Returns `false` when no such request is pending (already timed out,
    /// already answered, or never issued).
    pub fn complete(&self, id: u64, outcome: std::result::Result<Value, RpcError>) -> bool {
        let Some(pending) = self.table().entries.remove(&id) else {
            return false;
        };
        let result = outcome.map_err(AppError::from);
        if pending.completion.send(result).is_err() {
            debug!(id, method = pending.method.as_str(), "reply arrived after caller left");
        }
        true
    }

    /// Close the session and reject every pending request.
    ///
    /// Idempotent; the first reason wins.
    pub fn close(&self, reason: &str) {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut table = self.table();
            if table.closed.is_none() {
                table.closed = Some(reason.to_owned());
            }
            table.entries.drain().collect()
        };

        for (id, pending) in drained {
            debug!(id, method = pending.method.as_str(), reason, "rejecting pending request");
            let _ = pending
                .completion
                .send(Err(AppError::Disconnected(reason.to_owned())));
        }
        self.cancel.cancel();
    }

    /// Close the session and stop the process.
    pub async fn shutdown(&self, reason: &str, grace: Duration) {
        self.close(reason);
        {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await.ok();
        }
        if let Some(child) = self.child.lock().await.take() {
            spawner::terminate(child, grace).await;
        }
    }

    /// Whether the OS process is still running. In-memory sessions report
    /// running until closed.
    pub async fn process_running(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    async fn write_frame(&self, frame: &Value) -> Result<()> {
        let mut bytes = serde_json::to_vec(frame)
            .map_err(|e| AppError::Protocol(format!("failed to serialise outbound message: {e}")))?;
        bytes.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| AppError::Transport(format!("write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| AppError::Transport(format!("flush failed: {e}")))
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PendingGuard<'a> {
    session: &'a RpcSession,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.table().entries.remove(&self.id);
    }
}
