//! Driver used when no runtime is configured.
//!
//! Every operation fails with the same [`AppError::Unavailable`], so callers
//! can tell a configuration problem apart from a transient transport one.

use std::future::Future;
use std::pin::Pin;

use serde_json::{json, Value};

use crate::config::DriverMode;
use crate::driver::{
    DriverFuture, ExecutionDriver, InterruptOutcome, SessionInfo, ThreadRef, TurnOutcome, TurnRequest,
};
use crate::rpc::message::Notification;
use crate::subscribers::{Handler, Subscription};
use crate::{AppError, Result};

/// Permanently unavailable runtime.
#[derive(Debug, Clone)]
pub struct UnavailableDriver {
    reason: String,
}

impl UnavailableDriver {
    /// Driver failing with `reason`.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The error every operation returns.
    #[must_use]
    pub fn error(&self) -> AppError {
        AppError::Unavailable(self.reason.clone())
    }

    fn fail<T: Send + 'static>(&self) -> DriverFuture<'_, T> {
        let err = self.error();
        Box::pin(async move { Result::<T>::Err(err) })
    }
}

impl ExecutionDriver for UnavailableDriver {
    fn kind(&self) -> DriverMode {
        DriverMode::Unavailable
    }

    fn bootstrap_session<'a>(&'a self, _thread: &'a ThreadRef) -> DriverFuture<'a, SessionInfo> {
        self.fail()
    }

    fn run_turn(&self, _request: TurnRequest) -> DriverFuture<'_, TurnOutcome> {
        self.fail()
    }

    fn interrupt_turn<'a>(&'a self, _thread: &'a ThreadRef, _turn_id: &'a str) -> DriverFuture<'a, InterruptOutcome> {
        self.fail()
    }

    fn read_account(&self) -> DriverFuture<'_, Value> {
        self.fail()
    }

    fn login_start(&self, _params: Value) -> DriverFuture<'_, Value> {
        self.fail()
    }

    fn login_cancel(&self, _params: Value) -> DriverFuture<'_, Value> {
        self.fail()
    }

    fn logout(&self) -> DriverFuture<'_, Value> {
        self.fail()
    }

    fn read_rate_limits(&self) -> DriverFuture<'_, Value> {
        self.fail()
    }

    fn subscribe_notifications(&self, _handler: Handler<Notification>) -> Subscription {
        Subscription::noop()
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = Value> + Send + '_>> {
        Box::pin(async move {
            json!({
                "runtime": DriverMode::Unavailable,
                "available": false,
                "reason": self.reason,
            })
        })
    }
}
