//! Reconnecting notification relay for a remote runtime.
//!
//! One background loop per relay reads `GET {base}/agent/stream?cursor=N`,
//! decodes each chunk into a [`BufferedNotification`], drops anything at or
//! below the last cursor seen, and fans forwardable events out to the
//! relay's subscribers. A read failure waits a fixed delay and reconnects
//! from the last cursor seen.
//!
//! The loop starts with the first subscriber and is cancelled when the
//! last subscription is dropped. Dropping the relay stops it as well.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::relay::ring::{BufferedNotification, NotificationRing, Replay};
use crate::relay::sse::SseChunkParser;
use crate::rpc::message::Notification;
use crate::subscribers::{Handler, SubscriberSet, Subscription};
use crate::Result;

/// Methods the relay passes on; everything else is dropped.
pub const FORWARDABLE_METHODS: &[&str] = &[
    "item/agentMessage/delta",
    "item/completed",
    "error",
    "turn/started",
    "turn/completed",
    "account/updated",
    "account/rateLimits/updated",
    "stream/resync",
];

/// Whether `method` is relayed to subscribers.
#[must_use]
pub fn is_forwardable(method: &str) -> bool {
    FORWARDABLE_METHODS.contains(&method)
}

struct RelayInner {
    http: reqwest::Client,
    stream_url: Url,
    reconnect_delay: Duration,
    subscribers: SubscriberSet<Notification>,
    ring: Mutex<NotificationRing>,
    last_cursor: AtomicU64,
    stream_loop: Mutex<Option<CancellationToken>>,
}

/// Subscriber-driven stream reader for a remote runtime.
pub struct NotificationRelay {
    inner: Arc<RelayInner>,
}

impl std::fmt::Debug for NotificationRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRelay")
            .field("stream_url", &self.inner.stream_url.as_str())
            .field("last_cursor", &self.last_cursor())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl NotificationRelay {
    /// Relay reading from `stream_url`, retaining `capacity` events.
    #[must_use]
    pub fn new(http: reqwest::Client, stream_url: Url, reconnect_delay: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                http,
                stream_url,
                reconnect_delay,
                subscribers: SubscriberSet::new(),
                ring: Mutex::new(NotificationRing::new(capacity)),
                last_cursor: AtomicU64::new(0),
                stream_loop: Mutex::new(None),
            }),
        }
    }

    /// Register `handler`; the first subscriber starts the stream loop.
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, handler: Handler<Notification>) -> Subscription {
        let weak: Weak<RelayInner> = Arc::downgrade(&self.inner);
        let subscription = self.inner.subscribers.subscribe_with(handler, move || {
            if let Some(inner) = weak.upgrade() {
                inner.stop_if_idle();
            }
        });
        RelayInner::ensure_running(&self.inner);
        subscription
    }

    /// Live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Whether the stream loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.inner.stream_loop).is_some()
    }

    /// Highest cursor received so far.
    #[must_use]
    pub fn last_cursor(&self) -> u64 {
        self.inner.last_cursor.load(Ordering::SeqCst)
    }

    /// Retained forwardable events after `cursor`.
    #[must_use]
    pub fn replay_since(&self, cursor: u64) -> Replay {
        lock(&self.inner.ring).since(cursor)
    }
}

impl Drop for NotificationRelay {
    fn drop(&mut self) {
        if let Some(token) = lock(&self.inner.stream_loop).take() {
            token.cancel();
        }
    }
}

impl RelayInner {
    fn ensure_running(this: &Arc<Self>) {
        let mut stream_loop = lock(&this.stream_loop);
        if stream_loop.is_some() || this.subscribers.is_empty() {
            return;
        }
        let token = CancellationToken::new();
        *stream_loop = Some(token.clone());
        info!(url = this.stream_url.as_str(), "starting notification relay");
        tokio::spawn(run_stream(Arc::clone(this), token));
    }

    fn stop_if_idle(&self) {
        let mut stream_loop = lock(&self.stream_loop);
        if !self.subscribers.is_empty() {
            return;
        }
        if let Some(token) = stream_loop.take() {
            info!("last relay subscriber gone, stopping stream");
            token.cancel();
        }
    }

    async fn stream_once(&self, cancel: &CancellationToken) -> Result<()> {
        let cursor = self.last_cursor.load(Ordering::SeqCst);
        let mut url = self.stream_url.clone();
        url.query_pairs_mut().append_pair("cursor", &cursor.to_string());

        debug!(cursor, "connecting relay stream");
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;

        let mut bytes = response.bytes_stream();
        let mut parser = SseChunkParser::default();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                next = bytes.next() => next,
            };
            let Some(chunk) = next else {
                return Ok(());
            };
            for payload in parser.feed(&chunk?) {
                self.deliver(payload);
            }
        }
    }

    fn deliver(&self, payload: Value) {
        let event: BufferedNotification = match serde_json::from_value(payload) {
            Ok(event) => event,
            Err(err) => {
                debug!(%err, "dropping undecodable relay event");
                return;
            }
        };

        let last = self.last_cursor.load(Ordering::SeqCst);
        if event.cursor <= last {
            trace!(cursor = event.cursor, last, "dropping already seen event");
            return;
        }
        self.last_cursor.store(event.cursor, Ordering::SeqCst);

        if !is_forwardable(&event.method) {
            trace!(method = event.method.as_str(), "dropping non-forwardable event");
            return;
        }
        lock(&self.ring).insert(event.clone());
        self.subscribers.emit(&event.notification());
    }
}

async fn run_stream(inner: Arc<RelayInner>, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        match inner.stream_once(&cancel).await {
            Ok(()) => debug!("relay stream ended"),
            Err(err) => warn!(%err, cursor = inner.last_cursor.load(Ordering::SeqCst), "relay stream failed"),
        }
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(inner.reconnect_delay) => {}
        }
    }
    debug!("relay loop stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
