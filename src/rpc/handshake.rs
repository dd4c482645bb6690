//! Initialization handshake and authentication bootstrap.
//!
//! After the agent process is launched the client performs:
//!
//! 1. **`initialize`** request carrying the protocol version and client
//!    identity. Nothing else may be sent before it succeeds.
//! 2. **`initialized`** notification.
//!
//! Once the session is marked initialized, and only if an API key was
//! configured, [`bootstrap_auth`] runs in the background: it reads the
//! current account and logs in only when the agent reports no account.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::rpc::client::AppServerClient;
use crate::rpc::session::RpcSession;
use crate::{AppError, Result};

/// Client name announced in `initialize`.
pub const CLIENT_NAME: &str = "agent-runtime";

/// Build the `initialize` params.
#[must_use]
pub fn initialize_params(protocol_version: &str) -> Value {
    json!({
        "protocolVersion": protocol_version,
        "clientInfo": {
            "name": CLIENT_NAME,
            "title": "Agent Runtime",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "processId": std::process::id(),
    })
}

/// Run the `initialize` / `initialized` exchange on a fresh session.
///
/// # Errors
///
/// Any failure, including an RPC error reply, is reported as
/// [`AppError::Handshake`] so the caller treats it as recoverable.
pub async fn perform(session: &RpcSession, protocol_version: &str, timeout: Duration) -> Result<Value> {
    let result = session
        .call("initialize", initialize_params(protocol_version), timeout)
        .await
        .map_err(|err| AppError::Handshake(format!("initialize failed: {err}")))?;

    session
        .notify("initialized", json!({}))
        .await
        .map_err(|err| AppError::Handshake(format!("initialized notification failed: {err}")))?;

    debug!(generation = session.generation(), "handshake: initialized");
    Ok(result)
}

/// Whether an `account/read` result reports no authenticated account.
#[must_use]
pub fn is_unauthenticated(account_state: &Value) -> bool {
    match account_state.get("account") {
        None | Some(Value::Null) => true,
        Some(_) => false,
    }
}

/// Log in with `api_key` if the agent is not authenticated yet.
///
/// Runs through the public client API, so it must only be called after the
/// session is marked initialized; otherwise the nested requests would
/// re-enter the start path.
pub async fn bootstrap_auth(client: AppServerClient, api_key: String) {
    let state = match client.request("account/read", json!({})).await {
        Ok(state) => state,
        Err(err) => {
            warn!(%err, "auth bootstrap: account/read failed");
            return;
        }
    };

    if !is_unauthenticated(&state) {
        debug!("auth bootstrap: already authenticated");
        return;
    }

    let params = json!({ "type": "apiKey", "apiKey": api_key });
    match client.request("account/login/start", params).await {
        Ok(_) => info!("auth bootstrap: logged in with configured api key"),
        Err(err) => warn!(%err, "auth bootstrap: login failed"),
    }
}
