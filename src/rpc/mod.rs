//! JSON-RPC 2.0 transport over an agent process's stdio.
//!
//! Submodules:
//! - `codec`: line framing with a per-line size limit.
//! - `message`: tagged inbound message and notification types.
//! - `spawner`: process launching behind the [`spawner::AgentLauncher`] seam.
//! - `session`: one process's request table and writer.
//! - `reader`: stdout dispatch and stderr capture tasks.
//! - `handshake`: `initialize` exchange and auth bootstrap.
//! - `state`: lifecycle status shared with background tasks.
//! - `client`: the public [`AppServerClient`] handle.

pub mod client;
pub mod codec;
pub mod handshake;
pub mod message;
mod reader;
pub mod session;
pub mod spawner;
pub mod state;

pub use client::AppServerClient;
pub use message::{AgentNotification, IncomingMessage, Notification, RpcError};
pub use state::{ServerRequestHandler, SessionState, TransportHealth};
