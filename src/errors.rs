//! Error types shared across the runtime engine.

use thiserror::Error;

/// Shared engine result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// JSON-RPC error code for a method nobody handles.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Engine error enumeration covering every failure class.
///
/// The variants fall into four families:
///
/// - **transport-recoverable**: [`Transport`](Self::Transport),
///   [`Disconnected`](Self::Disconnected), [`Handshake`](Self::Handshake) and
///   [`RequestTimeout`](Self::RequestTimeout). The app-server client restarts
///   the agent process and retries these a bounded number of times.
/// - **protocol**: [`Rpc`](Self::Rpc) carries a structured error reply from
///   the agent. Surfaced immediately, never triggers a restart.
/// - **turn-level**: [`Turn`](Self::Turn) and [`TurnTimeout`](Self::TurnTimeout).
/// - **configuration**: [`Config`](Self::Config) and
///   [`Unavailable`](Self::Unavailable); the latter is the single stable error
///   returned by an execution driver that was never configured.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    #[error("config: {0}")]
    Config(String),
    /// Writing to the agent process failed.
    #[error("transport: {0}")]
    Transport(String),
    /// The agent process went away while a request was in flight.
    #[error("disconnected: {0}")]
    Disconnected(String),
    /// Spawning the agent or the `initialize` exchange failed.
    #[error("handshake: {0}")]
    Handshake(String),
    /// No reply arrived for a request before its deadline.
    #[error("request timeout: {0}")]
    RequestTimeout(String),
    /// The agent answered with a structured JSON-RPC error.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message reported by the agent.
        message: String,
    },
    /// A message violated the wire protocol (malformed JSON, bad shape).
    #[error("protocol: {0}")]
    Protocol(String),
    /// A turn produced no terminal notification before its deadline.
    #[error("turn timeout: {0}")]
    TurnTimeout(String),
    /// A turn could not be started or tracked.
    #[error("turn: {0}")]
    Turn(String),
    /// The execution driver is permanently unavailable.
    #[error("agent runtime unavailable: {0}")]
    Unavailable(String),
    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Remote runtime HTTP failure.
    #[error("http: {0}")]
    Http(String),
    /// File-system or I/O operation failure.
    #[error("io: {0}")]
    Io(String),
}

impl AppError {
    /// Whether this failure justifies restarting the agent process and
    /// retrying the request.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Disconnected(_) | Self::Handshake(_) | Self::RequestTimeout(_)
        )
    }

    /// Whether the agent reported that an external thread no longer exists.
    #[must_use]
    pub fn is_thread_missing(&self) -> bool {
        let Self::Rpc { message, .. } = self else {
            return false;
        };
        let lower = message.to_ascii_lowercase();
        lower.contains("thread")
            && (lower.contains("not found")
                || lower.contains("unknown")
                || lower.contains("no such")
                || lower.contains("does not exist"))
    }

    /// Stable machine-readable name of the variant, used in HTTP error
    /// bodies.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Transport(_) => "transport",
            Self::Disconnected(_) => "disconnected",
            Self::Handshake(_) => "handshake",
            Self::RequestTimeout(_) => "request_timeout",
            Self::Rpc { .. } => "rpc",
            Self::Protocol(_) => "protocol",
            Self::TurnTimeout(_) => "turn_timeout",
            Self::Turn(_) => "turn",
            Self::Unavailable(_) => "unavailable",
            Self::NotFound(_) => "not_found",
            Self::Http(_) => "http",
            Self::Io(_) => "io",
        }
    }

    /// Rebuild an error from its [`kind`](Self::kind) and detail text.
    /// Kinds without a dedicated mapping become [`Http`](Self::Http).
    #[must_use]
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "config" => Self::Config(message),
            "unavailable" => Self::Unavailable(message),
            "not_found" => Self::NotFound(message),
            "turn_timeout" => Self::TurnTimeout(message),
            "turn" => Self::Turn(message),
            _ => Self::Http(format!("{kind}: {message}")),
        }
    }

    /// Detail text without the variant prefix.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Config(detail)
            | Self::Transport(detail)
            | Self::Disconnected(detail)
            | Self::Handshake(detail)
            | Self::RequestTimeout(detail)
            | Self::Protocol(detail)
            | Self::TurnTimeout(detail)
            | Self::Turn(detail)
            | Self::Unavailable(detail)
            | Self::NotFound(detail)
            | Self::Http(detail)
            | Self::Io(detail) => detail.clone(),
            Self::Rpc { code, message } => format!("{code}: {message}"),
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed json: {err}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
