//! Internal thread id → agent-side thread id bindings.
//!
//! A binding is created once with `thread/start` and cached for the life
//! of the process. The map lock is held across the `thread/start` call so
//! two turns racing on a new thread create exactly one external thread.

use std::collections::HashMap;
use std::future::Future;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::rpc::AppServerClient;
use crate::{AppError, Result};

/// Cache of thread bindings backed by `thread/start`.
#[derive(Debug)]
pub struct ThreadBinder {
    client: AppServerClient,
    bindings: Mutex<HashMap<String, String>>,
}

impl ThreadBinder {
    /// Binder creating threads through `client`.
    #[must_use]
    pub fn new(client: AppServerClient) -> Self {
        Self {
            client,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Record a binding that already exists on the agent side.
    pub async fn seed(&self, thread_id: &str, external_thread_id: &str) {
        self.bindings
            .lock()
            .await
            .insert(thread_id.to_owned(), external_thread_id.to_owned());
    }

    /// Cached binding, if any.
    pub async fn bound(&self, thread_id: &str) -> Option<String> {
        self.bindings.lock().await.get(thread_id).cloned()
    }

    /// Drop a binding; the next [`resolve`](Self::resolve) creates a new
    /// external thread.
    pub async fn invalidate(&self, thread_id: &str) -> Option<String> {
        self.bindings.lock().await.remove(thread_id)
    }

    /// External thread id for `thread_id`, creating one on first use.
    ///
    /// # Errors
    ///
    /// Propagates `thread/start` failures, or [`AppError::Protocol`] when
    /// the response carries no thread id.
    pub async fn resolve(&self, thread_id: &str) -> Result<String> {
        let mut bindings = self.bindings.lock().await;
        if let Some(external) = bindings.get(thread_id) {
            return Ok(external.clone());
        }

        let result = self.client.request("thread/start", json!({})).await?;
        let external = external_thread_id(&result).ok_or_else(|| {
            AppError::Protocol("thread/start result carries no thread id".into())
        })?;
        info!(thread_id, external_thread_id = external.as_str(), "thread bound");
        bindings.insert(thread_id.to_owned(), external.clone());
        Ok(external)
    }

    /// Run `op` against the bound external thread. If the agent reports the
    /// thread missing, the binding is recreated and `op` retried once.
    ///
    /// # Errors
    ///
    /// Whatever `op` or [`resolve`](Self::resolve) returns on the final
    /// attempt.
    pub async fn with_thread<T, F, Fut>(&self, thread_id: &str, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let external = self.resolve(thread_id).await?;
        match op(external.clone()).await {
            Err(err) if err.is_thread_missing() => {
                warn!(thread_id, external_thread_id = external.as_str(), %err, "external thread missing, recreating");
                self.invalidate(thread_id).await;
                let external = self.resolve(thread_id).await?;
                op(external).await
            }
            outcome => outcome,
        }
    }
}

/// Pull the thread id out of a `thread/start` result.
#[must_use]
pub fn external_thread_id(result: &Value) -> Option<String> {
    result
        .get("thread")
        .and_then(|thread| thread.get("id"))
        .or_else(|| result.get("threadId"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}
