//! App-server client: lifecycle, request correlation, and restart policy.
//!
//! [`AppServerClient`] is a cheap, cloneable handle around one logical
//! connection to the agent. The underlying process is launched lazily by
//! [`AppServerClient::ensure_started`] and replaced transparently when it
//! dies.
//!
//! # Lifecycle
//!
//! Starts, restarts and stops serialize on one async lock. Concurrent
//! callers of `ensure_started` therefore share a single in-flight launch:
//! the first caller spawns and handshakes, the others wait on the lock and
//! then find the session ready. No request is ever written to a
//! half-started or half-stopped process.
//!
//! # Retry policy
//!
//! Recoverable errors ([`AppError::is_recoverable`]) force a restart and
//! retry the same call, at most `max_restarts` times per call. Structured
//! RPC errors are returned immediately.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::AppServerConfig;
use crate::rpc::handshake;
use crate::rpc::message::Notification;
use crate::rpc::reader::{spawn_reader, spawn_stderr_drain};
use crate::rpc::session::RpcSession;
use crate::rpc::spawner::{AgentLauncher, AgentProcess, ProcessLauncher};
use crate::rpc::state::{ServerRequestHandler, SessionState, TransportHealth, TransportShared};
use crate::subscribers::{Handler, Subscription};
use crate::Result;

type SessionFuture<'a> = Pin<Box<dyn Future<Output = Result<Arc<RpcSession>>> + Send + 'a>>;

struct ClientInner {
    config: AppServerConfig,
    launcher: Arc<dyn AgentLauncher>,
    shared: Arc<TransportShared>,
    session: RwLock<Option<Arc<RpcSession>>>,
    lifecycle: tokio::sync::Mutex<()>,
    restart_count: AtomicU32,
    generation: AtomicU64,
}

/// Handle to the agent's JSON-RPC transport.
#[derive(Clone)]
pub struct AppServerClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for AppServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServerClient")
            .field("command", &self.inner.config.command)
            .field("restart_count", &self.restart_count())
            .finish_non_exhaustive()
    }
}

impl AppServerClient {
    /// Client that spawns the configured agent binary.
    #[must_use]
    pub fn from_config(config: AppServerConfig) -> Self {
        let launcher = Arc::new(ProcessLauncher::from_config(&config));
        Self::new(config, launcher)
    }

    /// Client over an arbitrary launcher.
    ///
    /// Registers a default handler that answers `*requestApproval` server
    /// requests with the configured decision.
    #[must_use]
    pub fn new(config: AppServerConfig, launcher: Arc<dyn AgentLauncher>) -> Self {
        let shared = Arc::new(TransportShared::new());
        let decision = config.approval_decision;
        shared.add_handler(Arc::new(move |method: &str, _params: &Value| {
            method
                .ends_with("requestApproval")
                .then(|| Ok(json!({ "decision": decision.as_str() })))
        }));

        Self {
            inner: Arc::new(ClientInner {
                config,
                launcher,
                shared,
                session: RwLock::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                restart_count: AtomicU32::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Settings this client was built with.
    #[must_use]
    pub fn config(&self) -> &AppServerConfig {
        &self.inner.config
    }

    /// Launch and handshake the agent unless a ready session exists.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Handshake`](crate::AppError::Handshake) when the
    /// launch or the `initialize` exchange fails.
    pub async fn ensure_started(&self) -> Result<()> {
        self.ready_session().await.map(|_| ())
    }

    /// Issue a request with the configured default deadline.
    ///
    /// # Errors
    ///
    /// See [`AppServerClient::request_with_timeout`].
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.request_with_timeout(method, params, self.inner.config.request_timeout())
            .await
    }

    /// Issue a request, restarting the agent on recoverable failures.
    ///
    /// # Errors
    ///
    /// - [`AppError::Rpc`](crate::AppError::Rpc): the agent replied with an
    ///   error object; never retried.
    /// - Any recoverable error once `max_restarts` restarts have been spent.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let max_restarts = self.inner.config.max_restarts;
        let mut restarts = 0;

        loop {
            let mut generation = None;
            let outcome = match self.ready_session().await {
                Ok(session) => {
                    generation = Some(session.generation());
                    session.call(method, params.clone(), timeout).await
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_recoverable() && restarts < max_restarts => {
                    restarts += 1;
                    warn!(method, attempt = restarts, %err, "recoverable transport error, restarting agent");
                    self.restart_generation(generation, &err.to_string()).await;
                }
                Err(err) => {
                    if err.is_recoverable() {
                        self.inner.shared.status().last_error = Some(err.to_string());
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Send a notification to the agent.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the agent cannot be started or written to.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.ready_session().await?.notify(method, params).await
    }

    /// Stop the current process and reject everything in flight.
    ///
    /// The next call launches a fresh process. The restart counter
    /// increments even when no process was running.
    pub async fn force_restart(&self, reason: &str) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.restart_locked(reason).await;
    }

    /// Restart on behalf of a failed call. When several concurrent calls
    /// fail on the same process, only the first tears it down; the rest
    /// find a newer session and go straight to their retry.
    async fn restart_generation(&self, failed: Option<u64>, reason: &str) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if let Some(failed) = failed {
            match self.current_session() {
                Some(current) if current.generation() == failed => {}
                _ => return,
            }
        }
        self.restart_locked(reason).await;
    }

    async fn restart_locked(&self, reason: &str) {
        let count = self.inner.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut status = self.inner.shared.status();
            status.state = SessionState::Degraded;
            status.last_error = Some(reason.to_owned());
            status.ready_at = None;
        }
        self.inner
            .shared
            .record_diagnostic(format!("forced restart #{count}: {reason}"));
        info!(restart_count = count, reason, "forcing agent restart");

        if let Some(session) = self.take_session() {
            session.shutdown(reason, self.inner.config.shutdown_grace()).await;
        }
    }

    /// Stop the agent without counting a restart.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.shared.status().state = SessionState::Stopped;
        if let Some(session) = self.take_session() {
            session
                .shutdown("client stopped", self.inner.config.shutdown_grace())
                .await;
        }
        info!("agent transport stopped");
    }

    /// Register a notification handler. Subscriptions survive restarts.
    pub fn subscribe(&self, handler: Handler<Notification>) -> Subscription {
        self.inner.shared.subscribers.subscribe(handler)
    }

    /// Number of live notification subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.shared.subscribers.len()
    }

    /// Register a handler for server-initiated requests. Handlers are
    /// consulted in registration order, after the built-in approval handler.
    pub fn add_server_request_handler(&self, handler: ServerRequestHandler) {
        self.inner.shared.add_handler(handler);
    }

    /// Restarts performed since construction.
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.inner.restart_count.load(Ordering::SeqCst)
    }

    /// Snapshot for operational tooling.
    pub async fn health(&self) -> TransportHealth {
        let session = self.current_session();
        let (running, pending_requests) = match &session {
            Some(session) => (session.process_running().await, session.pending_count()),
            None => (false, 0),
        };

        let status = self.inner.shared.status();
        TransportHealth {
            running,
            initialized: running && status.state == SessionState::Initialized,
            state: status.state,
            restart_count: self.restart_count(),
            last_error: status.last_error.clone(),
            ready_at: status.ready_at,
            pending_requests,
            recent_diagnostics: self.inner.shared.diagnostics(),
        }
    }

    // Boxed: the auth bootstrap spawned by `start_locked` calls back into
    // `request`, and a named future type keeps that recursion finite.
    fn ready_session(&self) -> SessionFuture<'_> {
        Box::pin(async move {
            if let Some(session) = self.current_ready() {
                return Ok(session);
            }

            let _lifecycle = self.inner.lifecycle.lock().await;
            if let Some(session) = self.current_ready() {
                return Ok(session);
            }

            if let Some(stale) = self.take_session() {
                let count = self.inner.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
                info!(restart_count = count, "replacing lost agent session");
                stale
                    .shutdown("agent session lost", self.inner.config.shutdown_grace())
                    .await;
            }

            self.start_locked().await
        })
    }

    /// Launch, wire up and handshake a new process. Caller holds the
    /// lifecycle lock.
    async fn start_locked(&self) -> Result<Arc<RpcSession>> {
        let shared = &self.inner.shared;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut status = shared.status();
            status.state = SessionState::Starting;
            status.generation = generation;
        }

        let AgentProcess {
            stdin,
            stdout,
            stderr,
            child,
        } = match self.inner.launcher.launch().await {
            Ok(process) => process,
            Err(err) => {
                shared.session_lost(generation, &err.to_string());
                return Err(err);
            }
        };

        let session = Arc::new(RpcSession::new(generation, stdin, child));
        // Detached; both tasks end when the session's token is cancelled.
        drop(spawn_reader(Arc::clone(&session), stdout, Arc::clone(shared)));
        if let Some(stderr) = stderr {
            drop(spawn_stderr_drain(&session, stderr, Arc::clone(shared)));
        }

        let config = &self.inner.config;
        if let Err(err) =
            handshake::perform(&session, &config.protocol_version, config.startup_timeout()).await
        {
            warn!(generation, %err, "agent handshake failed");
            session
                .shutdown("handshake failed", config.shutdown_grace())
                .await;
            shared.session_lost(generation, &err.to_string());
            return Err(err);
        }

        *self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));
        {
            let mut status = shared.status();
            status.state = SessionState::Initialized;
            status.ready_at = Some(Utc::now());
        }
        shared.record_diagnostic(format!("session {generation} initialized"));
        info!(generation, "agent session initialized");

        // Marked initialized first: the bootstrap's own requests must find
        // a ready session instead of waiting on the lifecycle lock we hold.
        if let Some(api_key) = config.api_key.clone() {
            tokio::spawn(handshake::bootstrap_auth(self.clone(), api_key));
        }

        Ok(session)
    }

    fn current_session(&self) -> Option<Arc<RpcSession>> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn current_ready(&self) -> Option<Arc<RpcSession>> {
        let session = self.current_session()?;
        if session.is_closed() {
            return None;
        }
        let ready = self.inner.shared.status().state == SessionState::Initialized;
        ready.then_some(session)
    }

    fn take_session(&self) -> Option<Arc<RpcSession>> {
        self.inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
