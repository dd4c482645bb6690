//! Turn record and status state machine.
//!
//! ```text
//! inProgress ──▶ completed
//!            ├─▶ interrupted
//!            └─▶ failed
//! ```
//!
//! Terminal states admit no further transitions; once a turn leaves
//! `inProgress` every mutator is a no-op that returns `false`.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnStatus {
    /// Started; waiting for a terminal notification.
    InProgress,
    /// Finished normally.
    Completed,
    /// Stopped by an interrupt.
    Interrupted,
    /// Finished with an error.
    Failed,
}

impl TurnStatus {
    /// Parse a wire status string. Unknown strings yield `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "inProgress" | "in_progress" | "running" | "started" => Some(Self::InProgress),
            "completed" | "complete" | "succeeded" => Some(Self::Completed),
            "interrupted" | "cancelled" | "canceled" => Some(Self::Interrupted),
            "failed" | "error" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "inProgress",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    /// Whether the status is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request/response exchange with the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    /// Caller-assigned turn id.
    pub turn_id: String,
    /// Internal thread id.
    pub thread_id: String,
    /// Agent-side thread id.
    pub external_thread_id: String,
    external_turn_id: Option<String>,
    status: TurnStatus,
    fragments: Vec<String>,
    error: Option<String>,
}

impl Turn {
    /// A new turn in `inProgress`.
    pub fn new(
        turn_id: impl Into<String>,
        thread_id: impl Into<String>,
        external_thread_id: impl Into<String>,
    ) -> Self {
        Self {
            turn_id: turn_id.into(),
            thread_id: thread_id.into(),
            external_thread_id: external_thread_id.into(),
            external_turn_id: None,
            status: TurnStatus::InProgress,
            fragments: Vec::new(),
            error: None,
        }
    }

    /// Agent-side turn id, once known.
    #[must_use]
    pub fn external_turn_id(&self) -> Option<&str> {
        self.external_turn_id.as_deref()
    }

    /// Record the agent-side turn id. Only the first id is kept, and a
    /// terminal turn accepts none.
    pub fn set_external_turn_id(&mut self, id: &str) -> bool {
        if self.status.is_terminal() || self.external_turn_id.is_some() {
            return false;
        }
        self.external_turn_id = Some(id.to_owned());
        true
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TurnStatus {
        self.status
    }

    /// Accumulated text fragments, in arrival order.
    #[must_use]
    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    /// Recorded error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Concatenated fragments.
    #[must_use]
    pub fn output_text(&self) -> String {
        self.fragments.concat()
    }

    /// Append a text fragment.
    pub fn append(&mut self, fragment: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.fragments.push(fragment.to_owned());
        true
    }

    /// Record an error message; the last one wins.
    pub fn record_error(&mut self, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.error = Some(message.into());
        true
    }

    /// Move to a terminal status. An `error` of `None` keeps any earlier
    /// recorded error.
    pub fn finish(&mut self, status: TurnStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        if error.is_some() {
            self.error = error;
        }
        self.status = status;
        true
    }
}
