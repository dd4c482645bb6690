//! Folds a turn's notifications into a [`Turn`].
//!
//! Correlation rules:
//!
//! - Notifications for another external thread are ignored.
//! - While the external turn id is unknown, the first notification that
//!   carries one fixes it. After that, notifications for other turn ids on
//!   the same thread are ignored.
//! - Deltas append to the output. A completed agent-message item is kept
//!   only as fallback text for turns that streamed no deltas.
//! - `error` records a message (last write wins) without ending the turn.
//! - `turn/completed` is authoritative for status and is the only event
//!   that resolves the turn.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::rpc::message::{AgentNotification, Notification};
use crate::turn::model::{Turn, TurnStatus};

/// Callback invoked for each streamed text chunk.
pub type DeltaCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Result of applying one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Not for this turn, or not a kind the orchestrator acts on.
    Ignored,
    /// Applied; the turn is still in progress.
    Progress,
    /// The turn reached a terminal status.
    Terminal(TurnStatus),
}

/// Mutable fold state for one turn.
pub struct TurnAccumulator {
    turn: Turn,
    saw_delta: bool,
    fallback_text: Option<String>,
    on_delta: Option<DeltaCallback>,
}

impl std::fmt::Debug for TurnAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnAccumulator")
            .field("turn", &self.turn)
            .field("saw_delta", &self.saw_delta)
            .finish_non_exhaustive()
    }
}

impl TurnAccumulator {
    /// Start folding into `turn`.
    #[must_use]
    pub fn new(turn: Turn, on_delta: Option<DeltaCallback>) -> Self {
        Self {
            turn,
            saw_delta: false,
            fallback_text: None,
            on_delta,
        }
    }

    /// The turn as folded so far.
    #[must_use]
    pub fn turn(&self) -> &Turn {
        &self.turn
    }

    /// Agent-side turn id, once known.
    #[must_use]
    pub fn external_turn_id(&self) -> Option<&str> {
        self.turn.external_turn_id()
    }

    /// Fix the agent-side turn id if it is not known yet.
    pub fn adopt_turn_id(&mut self, id: &str) {
        if self.turn.set_external_turn_id(id) {
            debug!(turn_id = self.turn.turn_id.as_str(), external_turn_id = id, "turn id discovered");
        }
    }

    /// Apply one notification.
    pub fn apply(&mut self, notification: &Notification) -> Step {
        let kind = notification.classify();
        let (thread_id, turn_id) = correlation(&kind);

        if let Some(thread_id) = thread_id {
            if thread_id != self.turn.external_thread_id {
                return Step::Ignored;
            }
        }
        if let Some(turn_id) = turn_id {
            match self.turn.external_turn_id() {
                Some(known) if known != turn_id => return Step::Ignored,
                Some(_) => {}
                None => self.adopt_turn_id(turn_id),
            }
        }

        match kind {
            AgentNotification::AgentMessageDelta { delta, .. } => {
                self.saw_delta = true;
                self.turn.append(&delta);
                if let Some(callback) = &self.on_delta {
                    callback(&delta);
                }
                Step::Progress
            }
            AgentNotification::ItemCompleted { agent_text, .. } => {
                if let Some(text) = agent_text {
                    if !self.saw_delta {
                        self.fallback_text = Some(text);
                    }
                }
                Step::Progress
            }
            AgentNotification::Error {
                message, will_retry, ..
            } => {
                trace!(message = message.as_str(), will_retry, "turn error notification");
                self.turn.record_error(message);
                Step::Progress
            }
            AgentNotification::TurnCompleted { turn, .. } => {
                let status = turn
                    .status
                    .as_deref()
                    .and_then(TurnStatus::parse)
                    .filter(|status| status.is_terminal())
                    .unwrap_or(TurnStatus::Completed);
                self.finish(status, turn.error);
                Step::Terminal(self.turn.status())
            }
            AgentNotification::TurnStarted { .. }
            | AgentNotification::AccountUpdated(_)
            | AgentNotification::RateLimitsUpdated(_)
            | AgentNotification::Unhandled { .. } => Step::Ignored,
        }
    }

    /// Force a terminal status, folding fallback text into the output when
    /// no deltas arrived.
    pub fn finish(&mut self, status: TurnStatus, error: Option<String>) {
        if !self.saw_delta {
            if let Some(text) = self.fallback_text.take() {
                self.turn.append(&text);
            }
        }
        self.turn.finish(status, error);
    }

    /// Consume the accumulator and return the turn.
    #[must_use]
    pub fn into_turn(self) -> Turn {
        self.turn
    }
}

fn correlation(kind: &AgentNotification) -> (Option<&str>, Option<&str>) {
    match kind {
        AgentNotification::AgentMessageDelta {
            thread_id, turn_id, ..
        }
        | AgentNotification::ItemCompleted {
            thread_id, turn_id, ..
        }
        | AgentNotification::Error {
            thread_id, turn_id, ..
        } => (thread_id.as_deref(), turn_id.as_deref()),
        AgentNotification::TurnStarted { thread_id, turn }
        | AgentNotification::TurnCompleted { thread_id, turn } => {
            (thread_id.as_deref(), turn.id.as_deref())
        }
        AgentNotification::AccountUpdated(_)
        | AgentNotification::RateLimitsUpdated(_)
        | AgentNotification::Unhandled { .. } => (None, None),
    }
}
