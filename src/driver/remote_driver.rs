//! Remote HTTP runtime implementation of [`ExecutionDriver`].
//!
//! Commands are plain JSON POSTs against the runtime's `/agent/*` routes;
//! notifications arrive through a [`NotificationRelay`] on
//! `/agent/stream`. Error bodies of the form
//! `{"error": {"kind": "...", "message": "..."}}` are mapped back onto
//! [`AppError`] so an unavailable remote stays distinguishable from a
//! network failure.
//!
//! The remote start call returns only the final text, so `on_delta` is
//! invoked once with the whole output.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{DriverMode, RemoteConfig};
use crate::driver::{
    DriverFuture, ExecutionDriver, InterruptOutcome, SessionInfo, ThreadRef, TurnOutcome, TurnRequest,
};
use crate::relay::NotificationRelay;
use crate::rpc::message::Notification;
use crate::subscribers::{Handler, Subscription};
use crate::{AppError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    kind: String,
    message: String,
}

/// Runtime reached over HTTP.
#[derive(Debug)]
pub struct RemoteDriver {
    http: reqwest::Client,
    base_url: String,
    identifier: String,
    request_timeout: Duration,
    relay: NotificationRelay,
}

/// Join `path` onto `base_url`, keeping any path prefix the base carries.
///
/// # Errors
///
/// Returns [`AppError::Config`] when the result is not a valid URL.
pub fn endpoint(base_url: &str, path: &str) -> Result<Url> {
    let joined = format!("{}{path}", base_url.trim_end_matches('/'));
    Url::parse(&joined).map_err(|err| AppError::Config(format!("invalid remote url {joined}: {err}")))
}

impl RemoteDriver {
    /// Driver for the runtime at `config.base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when `base_url` is missing or invalid,
    /// or [`AppError::Http`] when the HTTP client cannot be built.
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|base| !base.is_empty())
            .ok_or_else(|| AppError::Config("remote.base_url is not configured".into()))?
            .trim_end_matches('/')
            .to_owned();

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let relay = NotificationRelay::new(
            http.clone(),
            endpoint(&base_url, "/agent/stream")?,
            config.reconnect_delay(),
            config.buffer_capacity,
        );

        Ok(Self {
            http,
            base_url,
            identifier: config.identifier.clone(),
            request_timeout: config.request_timeout(),
            relay,
        })
    }

    /// The notification relay feeding subscribers.
    #[must_use]
    pub fn relay(&self) -> &NotificationRelay {
        &self.relay
    }

    fn url(&self, path: &str) -> Result<Url> {
        let mut url = endpoint(&self.base_url, path)?;
        if !self.identifier.is_empty() {
            url.query_pairs_mut().append_pair("identifier", &self.identifier);
        }
        Ok(url)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let request = self.http.post(self.url(path)?).json(body);
        self.send(request).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.http.get(self.url(path)?);
        self.send(request).await
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.timeout(self.request_timeout).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        Err(remote_error(status, &body))
    }
}

fn remote_error(status: StatusCode, body: &str) -> AppError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { error }) => {
            debug!(%status, kind = error.kind.as_str(), "remote runtime error");
            AppError::from_kind(&error.kind, error.message)
        }
        Err(_) => AppError::Http(format!("remote runtime returned {status}: {body}")),
    }
}

impl ExecutionDriver for RemoteDriver {
    fn kind(&self) -> DriverMode {
        DriverMode::Remote
    }

    fn bootstrap_session<'a>(&'a self, thread: &'a ThreadRef) -> DriverFuture<'a, SessionInfo> {
        Box::pin(async move {
            let body = serde_json::to_value(thread)?;
            self.post("/agent/session/bootstrap", &body).await
        })
    }

    fn run_turn(&self, request: TurnRequest) -> DriverFuture<'_, TurnOutcome> {
        Box::pin(async move {
            let body = json!({
                "threadId": request.thread.thread_id,
                "externalThreadId": request.thread.external_thread_id,
                "turnId": request.turn_id,
                "text": request.text,
            });
            let outcome: TurnOutcome = self.post("/agent/turns/start", &body).await?;
            if let Some(on_delta) = &request.on_delta {
                if !outcome.output_text.is_empty() {
                    on_delta(&outcome.output_text);
                }
            }
            Ok(outcome)
        })
    }

    fn interrupt_turn<'a>(&'a self, thread: &'a ThreadRef, turn_id: &'a str) -> DriverFuture<'a, InterruptOutcome> {
        Box::pin(async move {
            let body = serde_json::to_value(thread)?;
            let path = format!("/agent/turns/{turn_id}/interrupt");
            self.post(&path, &body).await
        })
    }

    fn read_account(&self) -> DriverFuture<'_, Value> {
        Box::pin(async move { self.post("/agent/account/read", &json!({})).await })
    }

    fn login_start(&self, params: Value) -> DriverFuture<'_, Value> {
        Box::pin(async move { self.post("/agent/account/login/start", &params).await })
    }

    fn login_cancel(&self, params: Value) -> DriverFuture<'_, Value> {
        Box::pin(async move { self.post("/agent/account/login/cancel", &params).await })
    }

    fn logout(&self) -> DriverFuture<'_, Value> {
        Box::pin(async move { self.post("/agent/account/logout", &json!({})).await })
    }

    fn read_rate_limits(&self) -> DriverFuture<'_, Value> {
        Box::pin(async move { self.get("/agent/account/rate-limits").await })
    }

    fn subscribe_notifications(&self, handler: Handler<Notification>) -> Subscription {
        self.relay.subscribe(handler)
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = Value> + Send + '_>> {
        Box::pin(async move {
            let remote = match self.get::<Value>("/health").await {
                Ok(remote) => remote,
                Err(err) => {
                    warn!(%err, "remote health check failed");
                    json!({ "error": err.to_string() })
                }
            };
            json!({
                "runtime": DriverMode::Remote,
                "available": remote.get("error").is_none(),
                "baseUrl": self.base_url,
                "relay": {
                    "running": self.relay.is_running(),
                    "lastCursor": self.relay.last_cursor(),
                    "subscribers": self.relay.subscriber_count(),
                },
                "remote": remote,
            })
        })
    }
}
