//! Runtime configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Keychain service name used for stored credentials.
pub const KEYRING_SERVICE: &str = "agent-runtime";

/// Which execution driver backs the runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DriverMode {
    /// Canned responses; no external process.
    Mock,
    /// Every operation fails with a stable configuration error.
    Unavailable,
    /// Remote HTTP runtime with a streaming notification relay.
    Remote,
    /// Local agent subprocess speaking JSON-RPC over stdio.
    #[default]
    AppServer,
}

impl DriverMode {
    /// Configuration spelling of the mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Unavailable => "unavailable",
            Self::Remote => "remote",
            Self::AppServer => "app_server",
        }
    }
}

/// Driver selection table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct DriverConfig {
    /// Selected driver variant.
    #[serde(default)]
    pub mode: DriverMode,
}

/// Decision returned to the agent for server-initiated approval requests.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Allow the requested action.
    Accept,
    /// Refuse the requested action.
    #[default]
    Decline,
}

impl ApprovalDecision {
    /// Wire value sent back to the agent.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
        }
    }
}

/// Local agent subprocess settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AppServerConfig {
    /// Agent binary; an empty command leaves the driver unavailable.
    #[serde(default)]
    pub command: String,
    /// Arguments passed to the agent binary.
    #[serde(default = "default_app_server_args")]
    pub args: Vec<String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables inherited from the host, beyond the
    /// built-in allowlist.
    #[serde(default)]
    pub env_passthrough: Vec<String>,
    /// Default per-request deadline.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Deadline for the `initialize` exchange.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Grace period between SIGTERM and a forced kill.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Maximum process restarts attempted within one request.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Protocol version announced in `initialize`.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Decision for server-initiated approval requests.
    #[serde(default)]
    pub approval_decision: ApprovalDecision,
    /// Auto-login API key (populated at runtime, never read from TOML).
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for AppServerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: default_app_server_args(),
            cwd: None,
            env_passthrough: Vec::new(),
            request_timeout_ms: default_request_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_restarts: default_max_restarts(),
            protocol_version: default_protocol_version(),
            approval_decision: ApprovalDecision::default(),
            api_key: None,
        }
    }
}

impl AppServerConfig {
    /// Default per-request deadline.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Deadline for the `initialize` exchange.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Grace period between SIGTERM and a forced kill.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Remote HTTP runtime settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RemoteConfig {
    /// Base URL of the remote runtime; absent leaves the driver unavailable.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Opaque caller identity forwarded as the `identifier` query parameter.
    #[serde(default)]
    pub identifier: String,
    /// Fixed delay before the relay reconnects after a stream failure.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Deadline for non-streaming HTTP calls.
    #[serde(default = "default_remote_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Number of relayed notifications retained for replay.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            identifier: String::new(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            request_timeout_ms: default_remote_request_timeout_ms(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

impl RemoteConfig {
    /// Fixed delay before the relay reconnects.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Deadline for non-streaming HTTP calls.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Turn execution settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TurnConfig {
    /// Maximum wait for a terminal notification.
    #[serde(default = "default_turn_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_turn_timeout_seconds(),
        }
    }
}

impl TurnConfig {
    /// Maximum wait for a terminal notification.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Settings for the `serve` HTTP surface.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Loopback port the runtime listens on.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Number of notifications retained for stream replay.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

fn default_app_server_args() -> Vec<String> {
    vec!["app-server".into()]
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_startup_timeout_ms() -> u64 {
    15_000
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

fn default_max_restarts() -> u32 {
    2
}

fn default_protocol_version() -> String {
    "2".into()
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_remote_request_timeout_ms() -> u64 {
    600_000
}

fn default_buffer_capacity() -> usize {
    512
}

fn default_turn_timeout_seconds() -> u64 {
    600
}

fn default_http_port() -> u16 {
    8787
}

/// Runtime configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Driver selection.
    #[serde(default)]
    pub driver: DriverConfig,
    /// Local agent subprocess settings.
    #[serde(default)]
    pub app_server: AppServerConfig,
    /// Remote runtime settings.
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Turn execution settings.
    #[serde(default)]
    pub turn: TurnConfig,
    /// HTTP surface settings.
    #[serde(default)]
    pub server: ServerConfig,
}

impl RuntimeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the auto-login API key from the OS keychain with env-var fallback.
    ///
    /// A missing key is not an error; the agent then relies on whatever
    /// authentication it already has.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the keychain task panics.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.app_server.api_key = load_credential("app_server_api_key", "AGENT_RUNTIME_API_KEY").await?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.app_server.max_restarts > 10 {
            return Err(AppError::Config(
                "app_server.max_restarts must not exceed 10".into(),
            ));
        }

        if self.app_server.request_timeout_ms == 0 || self.app_server.startup_timeout_ms == 0 {
            return Err(AppError::Config(
                "app_server timeouts must be greater than zero".into(),
            ));
        }

        if self.turn.timeout_seconds == 0 {
            return Err(AppError::Config(
                "turn.timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.remote.buffer_capacity == 0 || self.server.buffer_capacity == 0 {
            return Err(AppError::Config(
                "buffer_capacity must be greater than zero".into(),
            ));
        }

        if self.remote.reconnect_delay_ms == 0 {
            return Err(AppError::Config(
                "remote.reconnect_delay_ms must be greater than zero".into(),
            ));
        }

        if let Some(url) = self.remote.base_url.as_deref() {
            reqwest::Url::parse(url)
                .map_err(|err| AppError::Config(format!("remote.base_url invalid: {err}")))?;
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<Option<String>> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(Some(value)),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            debug!(key = keyring_key, ?err, "keychain lookup failed, trying env var");
        }
    }

    Ok(env::var(env_key).ok().filter(|value| !value.is_empty()))
}
