#![forbid(unsafe_code)]

//! Agent runtime execution engine.
//!
//! Hands chat turns to a long-lived agent process over line-delimited
//! JSON-RPC, or to a remote runtime over HTTP, and relays the agent's
//! notifications to any number of subscribers.

pub mod binder;
pub mod config;
pub mod driver;
pub mod errors;
pub mod relay;
pub mod rpc;
pub mod server;
pub mod subscribers;
pub mod turn;

pub use config::RuntimeConfig;
pub use errors::{AppError, Result};
