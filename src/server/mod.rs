//! Remote runtime HTTP surface backed by a local execution driver.

pub mod hub;
pub mod routes;

pub use hub::NotificationHub;
pub use routes::{router, serve, serve_listener, ServerState};
