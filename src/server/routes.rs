//! HTTP surface exposing a local driver as a remote runtime.
//!
//! Routes:
//!
//! | Method | Path | Driver operation |
//! |---|---|---|
//! | POST | `/agent/session/bootstrap` | `bootstrap_session` |
//! | POST | `/agent/turns/start` | `run_turn` |
//! | POST | `/agent/turns/{turn_id}/interrupt` | `interrupt_turn` |
//! | GET | `/agent/stream?cursor=N` | hub replay + live tail (SSE) |
//! | POST | `/agent/account/read` | `read_account` |
//! | POST | `/agent/account/login/start` | `login_start` |
//! | POST | `/agent/account/login/cancel` | `login_cancel` |
//! | POST | `/agent/account/logout` | `logout` |
//! | GET | `/agent/account/rate-limits` | `read_rate_limits` |
//! | GET | `/health` | `health` |
//!
//! Failures render as `{"error": {"kind", "message"}}` with a status code
//! derived from the error kind.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{ExecutionDriver, InterruptOutcome, SessionInfo, ThreadRef, TurnOutcome, TurnRequest};
use crate::relay::BufferedNotification;
use crate::server::hub::NotificationHub;
use crate::subscribers::Subscription;
use crate::{AppError, Result};

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Shared state behind every route.
pub struct ServerState {
    driver: Arc<dyn ExecutionDriver>,
    hub: Arc<NotificationHub>,
    _feed: Subscription,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("driver", &self.driver.kind())
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}

impl ServerState {
    /// State serving `driver`, retaining `buffer_capacity` notifications.
    #[must_use]
    pub fn new(driver: Arc<dyn ExecutionDriver>, buffer_capacity: usize) -> Self {
        let hub = Arc::new(NotificationHub::new(buffer_capacity));
        let feed = NotificationHub::attach(&hub, driver.as_ref());
        Self {
            driver,
            hub,
            _feed: feed,
        }
    }

    /// The served driver.
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn ExecutionDriver> {
        &self.driver
    }

    /// Notification hub feeding `/agent/stream`.
    #[must_use]
    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }
}

/// [`AppError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

/// HTTP status for an error kind.
#[must_use]
pub fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::Config(_) | AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::TurnTimeout(_) | AppError::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        AppError::Transport(_)
        | AppError::Disconnected(_)
        | AppError::Handshake(_)
        | AppError::Rpc { .. }
        | AppError::Protocol(_)
        | AppError::Http(_) => StatusCode::BAD_GATEWAY,
        AppError::Turn(_) => StatusCode::CONFLICT,
        AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(kind = self.0.kind(), error = %self.0, "request failed");
        }
        let body = json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.detail(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
struct IdentifierQuery {
    identifier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    cursor: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartTurnBody {
    thread_id: String,
    #[serde(default)]
    external_thread_id: Option<String>,
    #[serde(default)]
    turn_id: Option<String>,
    text: String,
}

/// Build the router over `state`.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/agent/session/bootstrap", post(bootstrap_session))
        .route("/agent/turns/start", post(start_turn))
        .route("/agent/turns/{turn_id}/interrupt", post(interrupt_turn))
        .route("/agent/stream", get(stream))
        .route("/agent/account/read", post(read_account))
        .route("/agent/account/login/start", post(login_start))
        .route("/agent/account/login/cancel", post(login_cancel))
        .route("/agent/account/logout", post(logout))
        .route("/agent/account/rate-limits", get(rate_limits))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve on `127.0.0.1:{port}` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the port cannot be bound.
pub async fn serve(state: Arc<ServerState>, port: u16, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind}: {err}")))?;
    serve_listener(state, listener, ct).await
}

/// Serve on an already-bound listener until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Io` if the server loop fails.
pub async fn serve_listener(state: Arc<ServerState>, listener: TcpListener, ct: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, runtime = state.driver.kind().as_str(), "runtime http surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(ct.cancelled_owned())
        .await?;
    info!("runtime http surface stopped");
    Ok(())
}

async fn bootstrap_session(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<IdentifierQuery>,
    Json(thread): Json<ThreadRef>,
) -> ApiResult<SessionInfo> {
    debug!(identifier = ?query.identifier, thread_id = thread.thread_id.as_str(), "bootstrap");
    Ok(Json(state.driver.bootstrap_session(&thread).await?))
}

async fn start_turn(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<IdentifierQuery>,
    Json(body): Json<StartTurnBody>,
) -> ApiResult<TurnOutcome> {
    let turn_id = body.turn_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    debug!(identifier = ?query.identifier, turn_id = turn_id.as_str(), "turn start");
    let mut thread = ThreadRef::new(body.thread_id);
    thread.external_thread_id = body.external_thread_id;

    let outcome = state
        .driver
        .run_turn(TurnRequest {
            thread,
            turn_id,
            text: body.text,
            on_delta: None,
        })
        .await?;
    Ok(Json(outcome))
}

async fn interrupt_turn(
    State(state): State<Arc<ServerState>>,
    Path(turn_id): Path<String>,
    Json(thread): Json<ThreadRef>,
) -> ApiResult<InterruptOutcome> {
    Ok(Json(state.driver.interrupt_turn(&thread, &turn_id).await?))
}

async fn read_account(State(state): State<Arc<ServerState>>) -> ApiResult<Value> {
    Ok(Json(state.driver.read_account().await?))
}

async fn login_start(State(state): State<Arc<ServerState>>, Json(params): Json<Value>) -> ApiResult<Value> {
    Ok(Json(state.driver.login_start(params).await?))
}

async fn login_cancel(State(state): State<Arc<ServerState>>, Json(params): Json<Value>) -> ApiResult<Value> {
    Ok(Json(state.driver.login_cancel(params).await?))
}

async fn logout(State(state): State<Arc<ServerState>>) -> ApiResult<Value> {
    Ok(Json(state.driver.logout().await?))
}

async fn rate_limits(State(state): State<Arc<ServerState>>) -> ApiResult<Value> {
    Ok(Json(state.driver.read_rate_limits().await?))
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let driver = state.driver.health().await;
    Json(json!({
        "status": "ok",
        "driver": driver,
        "stream": {
            "latestCursor": state.hub.latest_cursor(),
            "consumers": state.hub.consumer_count(),
        },
    }))
}

async fn stream(State(state): State<Arc<ServerState>>, Query(query): Query<StreamQuery>) -> Response {
    debug!(cursor = query.cursor, "stream consumer attached");
    let (tx, rx) = mpsc::channel::<BufferedNotification>(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(Arc::clone(&state.hub).pump(query.cursor, tx));

    let events = ReceiverStream::new(rx).filter_map(|event| async move {
        match Event::default().id(event.cursor.to_string()).json_data(&event) {
            Ok(sse) => Some(Ok::<Event, Infallible>(sse)),
            Err(err) => {
                warn!(%err, cursor = event.cursor, "failed to encode stream event");
                None
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}
