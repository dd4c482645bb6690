//! Cursor-stamping fan-out of driver notifications for stream consumers.
//!
//! Every notification the driver emits is stamped with the next cursor,
//! kept in a [`NotificationRing`] and broadcast live. A consumer resuming
//! from cursor `N` gets the retained events after `N` followed by the live
//! tail, with duplicates removed by cursor. When the events it needs are no
//! longer retained (it resumed too far back, or lagged behind the live
//! channel) it first receives a `stream/resync` marker stamped one below
//! the oldest retained cursor, so cursors seen by a consumer never regress.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::driver::ExecutionDriver;
use crate::relay::{BufferedNotification, NotificationRing, Replay};
use crate::rpc::message::Notification;
use crate::subscribers::Subscription;

/// Method of the marker sent when a consumer must resynchronize.
pub const RESYNC_METHOD: &str = "stream/resync";

/// Ring plus live broadcast of stamped notifications.
#[derive(Debug)]
pub struct NotificationHub {
    ring: Mutex<NotificationRing>,
    live: broadcast::Sender<BufferedNotification>,
}

impl NotificationHub {
    /// Hub retaining `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(capacity.max(1));
        Self {
            ring: Mutex::new(NotificationRing::new(capacity)),
            live,
        }
    }

    /// Forward every notification `driver` emits into `hub`.
    pub fn attach(hub: &Arc<Self>, driver: &dyn ExecutionDriver) -> Subscription {
        let hub = Arc::clone(hub);
        driver.subscribe_notifications(Arc::new(move |notification: &Notification| {
            hub.publish(notification.clone());
        }))
    }

    /// Stamp, retain and broadcast `notification`.
    pub fn publish(&self, notification: Notification) -> BufferedNotification {
        let mut ring = self.ring();
        let event = ring.push(notification);
        // Sent under the ring lock so live order matches cursor order.
        let _ = self.live.send(event.clone());
        debug!(cursor = event.cursor, method = event.method.as_str(), "notification published");
        event
    }

    /// Highest cursor stamped so far.
    #[must_use]
    pub fn latest_cursor(&self) -> u64 {
        self.ring().latest_cursor()
    }

    /// Retained events after `cursor`.
    #[must_use]
    pub fn replay_since(&self, cursor: u64) -> Replay {
        self.ring().since(cursor)
    }

    /// Number of live stream consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.live.receiver_count()
    }

    /// Feed `tx` with everything after `cursor`, then the live tail, until
    /// the receiving side goes away. An idle consumer is released as soon
    /// as it disconnects, not at the next publication.
    pub async fn pump(self: Arc<Self>, cursor: u64, tx: mpsc::Sender<BufferedNotification>) {
        // Subscribe before replaying so nothing published in between is missed.
        let mut live = {
            let _ring = self.ring();
            self.live.subscribe()
        };
        let mut last = cursor;

        if !self.catch_up(&mut last, &tx).await {
            return;
        }
        loop {
            let received = tokio::select! {
                () = tx.closed() => break,
                received = live.recv() => received,
            };
            match received {
                Ok(event) => {
                    if event.cursor <= last {
                        continue;
                    }
                    last = event.cursor;
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, last, "stream consumer lagged, replaying from ring");
                    if !self.catch_up(&mut last, &tx).await {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(last, "stream consumer detached");
    }

    /// Send retained events after `last`, preceded by resync markers while
    /// the ring no longer covers `last`. Returns `false` once the consumer
    /// has gone away.
    async fn catch_up(&self, last: &mut u64, tx: &mpsc::Sender<BufferedNotification>) -> bool {
        loop {
            match self.replay_since(*last) {
                Replay::Events(events) => {
                    for event in events {
                        if event.cursor <= *last {
                            continue;
                        }
                        *last = event.cursor;
                        if tx.send(event).await.is_err() {
                            return false;
                        }
                    }
                    return true;
                }
                Replay::Resync { oldest, latest } => {
                    let marker = resync_marker(*last, oldest, latest);
                    warn!(requested = *last, oldest, latest, "stream consumer must resync");
                    *last = marker.cursor;
                    if tx.send(marker).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn ring(&self) -> MutexGuard<'_, NotificationRing> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marker telling a consumer at `requested` that events before `oldest`
/// were evicted. Its cursor sits right below `oldest`, above `requested`.
#[must_use]
pub fn resync_marker(requested: u64, oldest: u64, latest: u64) -> BufferedNotification {
    BufferedNotification {
        cursor: oldest.saturating_sub(1).max(requested),
        method: RESYNC_METHOD.to_owned(),
        params: json!({
            "requestedCursor": requested,
            "oldestCursor": oldest,
            "latestCursor": latest,
        }),
        created_at: Utc::now(),
    }
}
