//! JSON-RPC 2.0 message types.
//!
//! Every inbound line is parsed once, at the transport boundary, into an
//! [`IncomingMessage`]. Downstream code matches on variants instead of
//! probing optional fields. Notification payloads are further classified
//! into [`AgentNotification`], a finite set with an explicit
//! [`AgentNotification::Unhandled`] fallback.
//!
//! # Known notification methods
//!
//! | Method                       | Maps to                                   |
//! |------------------------------|-------------------------------------------|
//! | `item/agentMessage/delta`    | [`AgentNotification::AgentMessageDelta`]  |
//! | `item/completed`             | [`AgentNotification::ItemCompleted`]      |
//! | `error`                      | [`AgentNotification::Error`]              |
//! | `turn/started`               | [`AgentNotification::TurnStarted`]        |
//! | `turn/completed`             | [`AgentNotification::TurnCompleted`]      |
//! | `account/updated`            | [`AgentNotification::AccountUpdated`]     |
//! | `account/rateLimits/updated` | [`AgentNotification::RateLimitsUpdated`]  |
//! | *(any other)*                | [`AgentNotification::Unhandled`]          |

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{AppError, Result};

/// Protocol version tag carried by every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Structured error object from a JSON-RPC error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        Self::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

/// A notification as received from the agent: method plus raw params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification method name.
    pub method: String,
    /// Method-specific payload (`null` when absent).
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    /// Build a notification.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Classify into the finite set of notifications the engine acts on.
    #[must_use]
    pub fn classify(&self) -> AgentNotification {
        classify_notification(&self.method, &self.params)
    }

    /// External thread id the notification refers to, if any.
    #[must_use]
    pub fn thread_id(&self) -> Option<&str> {
        str_field(&self.params, &["threadId", "thread_id"])
            .or_else(|| self.params.get("thread").and_then(|t| str_field(t, &["id"])))
    }

    /// External turn id the notification refers to, if any.
    #[must_use]
    pub fn turn_id(&self) -> Option<&str> {
        str_field(&self.params, &["turnId", "turn_id"])
            .or_else(|| self.params.get("turn").and_then(|t| str_field(t, &["id"])))
    }
}

/// One parsed inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Reply to a request this side issued.
    Response {
        /// Correlation id.
        id: u64,
        /// `result` on success, `error` on failure.
        outcome: std::result::Result<Value, RpcError>,
    },
    /// Request initiated by the agent; must be answered.
    ServerRequest {
        /// Correlation id, echoed verbatim in the reply.
        id: Value,
        /// Request method.
        method: String,
        /// Request payload.
        params: Value,
    },
    /// Fire-and-forget message from the agent.
    Notification(Notification),
    /// Valid JSON that fits none of the shapes above.
    Unrecognized(Value),
}

/// Parse one NDJSON line.
///
/// Returns `Ok(None)` for blank lines.
///
/// # Errors
///
/// Returns [`AppError::Protocol`]`("malformed json: …")` if the line is not
/// valid JSON.
pub fn parse_line(line: &str) -> Result<Option<IncomingMessage>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(trimmed)?;
    Ok(Some(classify(value)))
}

/// Sort a JSON value into exactly one [`IncomingMessage`] variant.
#[must_use]
pub fn classify(value: Value) -> IncomingMessage {
    let Value::Object(mut map) = value else {
        return IncomingMessage::Unrecognized(value);
    };

    let id = map.get("id").filter(|id| !id.is_null()).cloned();
    let method = map.get("method").and_then(Value::as_str).map(str::to_owned);

    match (id, method) {
        (Some(id), Some(method)) => IncomingMessage::ServerRequest {
            id,
            method,
            params: map.remove("params").unwrap_or(Value::Null),
        },
        (None, Some(method)) => IncomingMessage::Notification(Notification {
            method,
            params: map.remove("params").unwrap_or(Value::Null),
        }),
        (Some(id), None) => {
            let Some(numeric) = numeric_id(&id) else {
                return IncomingMessage::Unrecognized(Value::Object(map));
            };
            if let Some(error) = map.remove("error") {
                let outcome = Err(parse_rpc_error(&error));
                IncomingMessage::Response {
                    id: numeric,
                    outcome,
                }
            } else if let Some(result) = map.remove("result") {
                IncomingMessage::Response {
                    id: numeric,
                    outcome: Ok(result),
                }
            } else {
                IncomingMessage::Unrecognized(Value::Object(map))
            }
        }
        (None, None) => IncomingMessage::Unrecognized(Value::Object(map)),
    }
}

/// Build a request frame.
#[must_use]
pub fn request_frame(id: u64, method: &str, params: &Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build a notification frame.
#[must_use]
pub fn notification_frame(method: &str, params: &Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
}

/// Build a reply frame for a server-initiated request.
#[must_use]
pub fn reply_frame(id: &Value, outcome: &std::result::Result<Value, RpcError>) -> Value {
    match outcome {
        Ok(result) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result }),
        Err(error) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": error }),
    }
}

/// Status reported inside a `turn` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnPayload {
    /// External turn id.
    pub id: Option<String>,
    /// Raw status string (`inProgress`, `completed`, …).
    pub status: Option<String>,
    /// Error message, when the turn failed.
    pub error: Option<String>,
}

impl TurnPayload {
    /// Extract the `turn` object from a `turn/start` result or a
    /// `turn/completed` params object.
    #[must_use]
    pub fn from_container(container: &Value) -> Self {
        let turn = container.get("turn").unwrap_or(container);
        Self {
            id: str_field(turn, &["id", "turnId"]).map(str::to_owned),
            status: str_field(turn, &["status"]).map(str::to_owned),
            error: turn.get("error").and_then(error_message),
        }
    }
}

/// Notifications the engine understands.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentNotification {
    /// Incremental assistant text.
    AgentMessageDelta {
        /// External thread id.
        thread_id: Option<String>,
        /// External turn id.
        turn_id: Option<String>,
        /// Text fragment.
        delta: String,
    },
    /// An item finished; carries full agent-message text when it is one.
    ItemCompleted {
        /// External thread id.
        thread_id: Option<String>,
        /// External turn id.
        turn_id: Option<String>,
        /// Full text of a completed agent message.
        agent_text: Option<String>,
    },
    /// The agent reported an error; the turn may still complete afterwards.
    Error {
        /// External thread id.
        thread_id: Option<String>,
        /// External turn id.
        turn_id: Option<String>,
        /// Error text.
        message: String,
        /// Whether the agent is retrying on its own.
        will_retry: bool,
    },
    /// A turn began.
    TurnStarted {
        /// External thread id.
        thread_id: Option<String>,
        /// Turn payload.
        turn: TurnPayload,
    },
    /// A turn reached its terminal state.
    TurnCompleted {
        /// External thread id.
        thread_id: Option<String>,
        /// Turn payload carrying final status and error.
        turn: TurnPayload,
    },
    /// Account state changed.
    AccountUpdated(Value),
    /// Rate limits changed.
    RateLimitsUpdated(Value),
    /// Anything else; ignored by the orchestrator.
    Unhandled {
        /// Method name.
        method: String,
    },
}

fn classify_notification(method: &str, params: &Value) -> AgentNotification {
    let thread_id = || {
        str_field(params, &["threadId", "thread_id"]).map(str::to_owned)
    };
    let turn_id = || str_field(params, &["turnId", "turn_id"]).map(str::to_owned);

    match method {
        "item/agentMessage/delta" => AgentNotification::AgentMessageDelta {
            thread_id: thread_id(),
            turn_id: turn_id(),
            delta: str_field(params, &["delta", "text"]).unwrap_or_default().to_owned(),
        },
        "item/completed" => {
            let item = params.get("item").unwrap_or(&Value::Null);
            let is_agent_message = matches!(
                str_field(item, &["type"]),
                Some("agentMessage" | "agent_message" | "assistantMessage")
            );
            AgentNotification::ItemCompleted {
                thread_id: thread_id(),
                turn_id: turn_id(),
                agent_text: if is_agent_message {
                    str_field(item, &["text"]).map(str::to_owned)
                } else {
                    None
                },
            }
        }
        "error" => AgentNotification::Error {
            thread_id: thread_id(),
            turn_id: turn_id(),
            message: params
                .get("error")
                .and_then(error_message)
                .or_else(|| str_field(params, &["message"]).map(str::to_owned))
                .unwrap_or_else(|| "agent reported an error".to_owned()),
            will_retry: params
                .get("willRetry")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        "turn/started" => AgentNotification::TurnStarted {
            thread_id: thread_id(),
            turn: TurnPayload::from_container(params),
        },
        "turn/completed" => AgentNotification::TurnCompleted {
            thread_id: thread_id(),
            turn: TurnPayload::from_container(params),
        },
        "account/updated" => AgentNotification::AccountUpdated(params.clone()),
        "account/rateLimits/updated" => AgentNotification::RateLimitsUpdated(params.clone()),
        other => AgentNotification::Unhandled {
            method: other.to_owned(),
        },
    }
}

fn numeric_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_rpc_error(error: &Value) -> RpcError {
    RpcError {
        code: error.get("code").and_then(Value::as_i64).unwrap_or(-32603),
        message: error_message(error).unwrap_or_else(|| "unknown error".to_owned()),
    }
}

fn error_message(error: &Value) -> Option<String> {
    match error {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => str_field(error, &["message"]).map(str::to_owned),
        _ => None,
    }
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
}
