//! Turn orchestration: the turn record, the notification fold, and the
//! orchestrator that races completion against a deadline.

pub mod accumulator;
pub mod model;
pub mod orchestrator;

pub use accumulator::{DeltaCallback, Step, TurnAccumulator};
pub use model::{Turn, TurnStatus};
pub use orchestrator::{TurnInput, TurnOrchestrator};
