//! Fixed-capacity notification ring indexed by `cursor % capacity`.
//!
//! Cursors start at 1 and only grow. A slot is overwritten when a cursor
//! `capacity` positions later lands on it, so the ring always retains the
//! window `(latest - capacity, latest]`. Cursors may have gaps (a relay
//! only keeps forwardable events); a slot is trusted only when its stored
//! cursor equals the one being looked up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::message::Notification;

/// A notification stamped with its stream position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedNotification {
    /// Strictly increasing position, starting at 1.
    pub cursor: u64,
    /// Notification method.
    pub method: String,
    /// Notification params.
    #[serde(default)]
    pub params: Value,
    /// When the event was stamped.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl BufferedNotification {
    /// Stamp `notification` with `cursor` at the current time.
    #[must_use]
    pub fn stamp(cursor: u64, notification: Notification) -> Self {
        Self {
            cursor,
            method: notification.method,
            params: notification.params,
            created_at: Utc::now(),
        }
    }

    /// The unstamped notification.
    #[must_use]
    pub fn notification(&self) -> Notification {
        Notification::new(self.method.clone(), self.params.clone())
    }
}

/// Result of [`NotificationRing::since`].
#[derive(Debug, Clone, PartialEq)]
pub enum Replay {
    /// Every retained event after the requested cursor, in cursor order.
    Events(Vec<BufferedNotification>),
    /// The requested cursor fell out of the window; the consumer must
    /// resynchronize. `oldest` is the first cursor still retained.
    Resync {
        /// Oldest retained cursor.
        oldest: u64,
        /// Newest cursor.
        latest: u64,
    },
}

/// Arena ring of the last `capacity` notifications.
#[derive(Debug)]
pub struct NotificationRing {
    slots: Vec<Option<BufferedNotification>>,
    latest: u64,
}

impl NotificationRing {
    /// Ring retaining up to `capacity` events (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            latest: 0,
        }
    }

    /// Maximum number of retained events.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Highest cursor seen, or 0 when empty.
    #[must_use]
    pub fn latest_cursor(&self) -> u64 {
        self.latest
    }

    /// Lowest cursor still retained.
    #[must_use]
    pub fn oldest_cursor(&self) -> Option<u64> {
        let floor = self.window_floor();
        self.slots
            .iter()
            .flatten()
            .map(|event| event.cursor)
            .filter(|cursor| *cursor >= floor)
            .min()
    }

    /// Stamp the next cursor on `notification` and store it.
    pub fn push(&mut self, notification: Notification) -> BufferedNotification {
        let event = BufferedNotification::stamp(self.latest + 1, notification);
        self.store(event.clone());
        event
    }

    /// Store an already-stamped event. Events at or below the latest
    /// cursor are rejected.
    pub fn insert(&mut self, event: BufferedNotification) -> bool {
        if event.cursor <= self.latest {
            return false;
        }
        self.store(event);
        true
    }

    /// Events after `cursor`, or a resync marker when some of them were
    /// already evicted.
    #[must_use]
    pub fn since(&self, cursor: u64) -> Replay {
        if cursor >= self.latest {
            return Replay::Events(Vec::new());
        }
        let floor = self.window_floor();
        if cursor + 1 < floor {
            return Replay::Resync {
                oldest: self.oldest_cursor().unwrap_or(floor),
                latest: self.latest,
            };
        }

        let events = (cursor + 1..=self.latest)
            .filter_map(|wanted| {
                self.slot(wanted)
                    .filter(|event| event.cursor == wanted)
                    .cloned()
            })
            .collect();
        Replay::Events(events)
    }

    fn store(&mut self, event: BufferedNotification) {
        self.latest = event.cursor;
        let index = self.index(event.cursor);
        self.slots[index] = Some(event);
    }

    fn slot(&self, cursor: u64) -> Option<&BufferedNotification> {
        self.slots[self.index(cursor)].as_ref()
    }

    fn index(&self, cursor: u64) -> usize {
        let capacity = self.slots.len() as u64;
        // Bounded by capacity, which came from a usize.
        usize::try_from(cursor % capacity).unwrap_or_default()
    }

    /// Smallest cursor the window can still hold.
    fn window_floor(&self) -> u64 {
        let capacity = self.slots.len() as u64;
        self.latest.saturating_sub(capacity) + 1
    }
}
