//! Topic event publisher.
//!
//! [`EventPublisher`] owns one append-only buffer chain per topic and hands
//! out [`Subscription`] cursors over them. Publishes flow through a bounded
//! queue drained by [`EventPublisher::run`]; subscribes snapshot current
//! state through a registered [`SnapshotHandler`] before going live, with
//! captured snapshots cached per `(topic, key, namespace)` scope.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use fxhash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::stream::buffer::{BufferItem, EventBuffer};
use crate::stream::event::{Event, Payload, Topic};
use crate::stream::snapshot::{self, SnapshotHandler};
use crate::stream::subscription::{SubscribeRequest, Subscription};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for an [`EventPublisher`].
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// How long captured snapshots stay reusable for later subscribers with
    /// the same scope. Zero disables the cache.
    pub snapshot_cache_ttl: Duration,
    /// Depth of the bounded publish queue between producers and the
    /// [`EventPublisher::run`] loop.
    pub publish_queue_depth: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            snapshot_cache_ttl: Duration::from_secs(10),
            publish_queue_depth: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned when publishing events.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The publish loop has stopped; no more events will be accepted.
    #[error("event publisher is shut down")]
    Closed,
    /// The bounded publish queue is at capacity.
    #[error("publish queue is full")]
    QueueFull,
}

/// Errors returned by [`EventPublisher::subscribe`].
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// No snapshot handler is registered for the requested topic.
    #[error("unknown topic: {0}")]
    UnknownTopic(Topic),
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Counters for publisher activity.
///
/// All counters are monotonic and updated with relaxed ordering.
#[derive(Debug, Default)]
pub struct PublisherMetrics {
    /// Events appended to topic buffers.
    pub events_published: AtomicU64,
    /// Publishes rejected because the queue was at capacity.
    pub publish_queue_rejections: AtomicU64,
    /// Snapshots captured through a handler.
    pub snapshots_taken: AtomicU64,
    /// Snapshots served from the cache instead of a handler.
    pub snapshot_cache_hits: AtomicU64,
    /// Subscriptions opened over the publisher's lifetime.
    pub subscriptions_opened: AtomicU64,
    /// Subscriptions terminated by close-subscription events or shutdown.
    pub subscriptions_force_closed: AtomicU64,
}

impl PublisherMetrics {
    /// Events appended to topic buffers.
    #[must_use]
    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    /// Publishes rejected because the queue was at capacity.
    #[must_use]
    pub fn publish_queue_rejections(&self) -> u64 {
        self.publish_queue_rejections.load(Ordering::Relaxed)
    }

    /// Snapshots captured through a handler.
    #[must_use]
    pub fn snapshots_taken(&self) -> u64 {
        self.snapshots_taken.load(Ordering::Relaxed)
    }

    /// Snapshots served from the cache instead of a handler.
    #[must_use]
    pub fn snapshot_cache_hits(&self) -> u64 {
        self.snapshot_cache_hits.load(Ordering::Relaxed)
    }

    /// Subscriptions opened over the publisher's lifetime.
    #[must_use]
    pub fn subscriptions_opened(&self) -> u64 {
        self.subscriptions_opened.load(Ordering::Relaxed)
    }

    /// Subscriptions terminated by close-subscription events or shutdown.
    #[must_use]
    pub fn subscriptions_force_closed(&self) -> u64 {
        self.subscriptions_force_closed.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Subscription tracking
// ---------------------------------------------------------------------------

/// Identifier the publisher assigns to each subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug)]
struct SubscriptionEntry {
    token: String,
    close_tx: watch::Sender<bool>,
}

/// Registry of live subscriptions, keyed by id and indexed by the token
/// each subscriber authenticated with.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionTracker {
    next_id: AtomicU64,
    entries: Mutex<FxHashMap<SubscriptionId, SubscriptionEntry>>,
}

impl SubscriptionTracker {
    pub(crate) fn register(&self, token: &str) -> (SubscriptionId, watch::Receiver<bool>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (close_tx, close_rx) = watch::channel(false);
        let entry = SubscriptionEntry {
            token: token.to_owned(),
            close_tx,
        };
        self.entries.lock().unwrap().insert(id, entry);
        (id, close_rx)
    }

    pub(crate) fn unregister(&self, id: SubscriptionId) {
        self.entries.lock().unwrap().remove(&id);
    }

    /// Force-closes every live subscription. Returns how many were closed.
    pub(crate) fn force_close_all(&self) -> u64 {
        self.close_where(|_| true)
    }

    /// Force-closes subscriptions whose token is in `secret_ids`.
    pub(crate) fn force_close_matching(&self, secret_ids: &FxHashSet<&str>) -> u64 {
        self.close_where(|token| secret_ids.contains(token))
    }

    fn close_where(&self, should_close: impl Fn(&str) -> bool) -> u64 {
        let mut entries = self.entries.lock().unwrap();
        let mut closed: u64 = 0;
        entries.retain(|_, entry| {
            if !should_close(&entry.token) {
                return true;
            }
            let _ = entry.close_tx.send(true);
            closed += 1;
            false
        });
        closed
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

// ---------------------------------------------------------------------------
// Snapshot cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SnapshotCacheKey {
    topic: Topic,
    key: String,
    namespace: String,
}

impl SnapshotCacheKey {
    fn for_request(req: &SubscribeRequest) -> Self {
        Self {
            topic: req.topic.clone(),
            key: req.key.clone(),
            namespace: req.namespace.clone(),
        }
    }
}

#[derive(Debug)]
struct CachedSnapshot {
    head: Arc<BufferItem>,
    expires_at: Instant,
}

// ---------------------------------------------------------------------------
// EventPublisher
// ---------------------------------------------------------------------------

/// Fan-out point between event producers and topic subscribers.
///
/// Owns one append-only buffer per topic, the bounded publish queue, the
/// snapshot cache, and the registry of live subscriptions. Thread-safe via
/// internal locks; buffer appends happen only on the [`EventPublisher::run`]
/// loop, so subscribers observe one publish order per topic.
///
/// # Panics
///
/// All methods on this type panic if an internal lock has been poisoned
/// (i.e., a thread panicked while holding the lock). This should not occur
/// under normal operation.
pub struct EventPublisher {
    handlers: RwLock<FxHashMap<Topic, Arc<dyn SnapshotHandler>>>,
    buffers: Mutex<FxHashMap<Topic, Arc<EventBuffer>>>,
    snap_cache: Mutex<FxHashMap<SnapshotCacheKey, CachedSnapshot>>,
    publish_tx: mpsc::Sender<Vec<Event>>,
    publish_rx: Mutex<Option<mpsc::Receiver<Vec<Event>>>>,
    tracker: Arc<SubscriptionTracker>,
    metrics: Arc<PublisherMetrics>,
    config: PublisherConfig,
}

impl EventPublisher {
    /// Creates a publisher with no registered topics.
    #[must_use]
    pub fn new(config: PublisherConfig) -> Self {
        // The mpsc channel rejects a zero-capacity buffer.
        let (publish_tx, publish_rx) = mpsc::channel(config.publish_queue_depth.max(1));
        Self {
            handlers: RwLock::default(),
            buffers: Mutex::default(),
            snap_cache: Mutex::default(),
            publish_tx,
            publish_rx: Mutex::new(Some(publish_rx)),
            tracker: Arc::new(SubscriptionTracker::default()),
            metrics: Arc::new(PublisherMetrics::default()),
            config,
        }
    }

    /// Registers the snapshot handler that seeds new subscriptions on
    /// `topic`. Subscribing to a topic with no handler fails.
    pub fn register_snapshot_handler(
        &self,
        topic: impl Into<Topic>,
        handler: impl SnapshotHandler + 'static,
    ) {
        let topic = topic.into();
        tracing::debug!(%topic, "snapshot handler registered");
        self.handlers.write().unwrap().insert(topic, Arc::new(handler));
    }

    /// Queues a batch of events for the publish loop, waiting for queue
    /// capacity when it is full.
    ///
    /// # Errors
    ///
    /// [`PublishError::Closed`] once the publish loop has stopped.
    pub async fn publish(&self, events: Vec<Event>) -> Result<(), PublishError> {
        self.publish_tx
            .send(events)
            .await
            .map_err(|_| PublishError::Closed)
    }

    /// Queues a batch of events without waiting.
    ///
    /// # Errors
    ///
    /// [`PublishError::QueueFull`] when the queue is at capacity,
    /// [`PublishError::Closed`] once the publish loop has stopped.
    pub fn try_publish(&self, events: Vec<Event>) -> Result<(), PublishError> {
        self.publish_tx.try_send(events).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => {
                self.metrics
                    .publish_queue_rejections
                    .fetch_add(1, Ordering::Relaxed);
                PublishError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }

    /// Drains the publish queue until `shutdown` flips to `true`, then
    /// force-closes every live subscription.
    ///
    /// Only one call ever drains; a second call logs and returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut publish_rx = match self.publish_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                tracing::warn!("publish loop is already running");
                return;
            }
        };

        tracing::debug!("publish loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Shutdown sender gone; treat as a stop request.
                        break;
                    }
                }
                batch = publish_rx.recv() => {
                    match batch {
                        Some(events) => self.publish_events(events),
                        None => break,
                    }
                }
            }
        }

        let closed = self.tracker.force_close_all();
        self.metrics
            .subscriptions_force_closed
            .fetch_add(closed, Ordering::Relaxed);
        tracing::debug!(closed, "publish loop stopped");
    }

    /// Appends a published batch to its topic buffers.
    ///
    /// Close-subscription events are intercepted here and terminate the
    /// matching subscriptions; they are never appended to a buffer.
    fn publish_events(&self, events: Vec<Event>) {
        let mut by_topic: FxHashMap<Topic, Vec<Event>> = FxHashMap::default();
        for event in events {
            if let Payload::CloseSubscription(secret_ids) = &event.payload {
                let tokens: FxHashSet<&str> = secret_ids.iter().map(String::as_str).collect();
                let closed = self.tracker.force_close_matching(&tokens);
                self.metrics
                    .subscriptions_force_closed
                    .fetch_add(closed, Ordering::Relaxed);
                tracing::debug!(closed, "close-subscription event intercepted");
                continue;
            }
            by_topic.entry(event.topic.clone()).or_default().push(event);
        }

        for (topic, events) in by_topic {
            #[allow(clippy::cast_possible_truncation)]
            let count = events.len() as u64;
            self.metrics
                .events_published
                .fetch_add(count, Ordering::Relaxed);
            self.topic_buffer(&topic).append(events);
        }
    }

    /// Opens a subscription on `req.topic` scoped by `req`.
    ///
    /// A subscriber whose `req.index` matches the newest buffered index
    /// resumes in place and streams only what follows. Anyone else is
    /// seeded with a snapshot, prefixed with a new-snapshot marker when the
    /// subscriber held a stale view it must discard.
    ///
    /// # Errors
    ///
    /// [`SubscribeError::UnknownTopic`] when no snapshot handler is
    /// registered for `req.topic`.
    pub fn subscribe(&self, req: SubscribeRequest) -> Result<Subscription, SubscribeError> {
        let handler = self
            .handlers
            .read()
            .unwrap()
            .get(&req.topic)
            .cloned()
            .ok_or_else(|| SubscribeError::UnknownTopic(req.topic.clone()))?;

        let buffer = self.topic_buffer(&req.topic);
        let topic_tail = buffer.tail();

        let start = if req.index > 0 && topic_tail.first_index() == req.index {
            // Caught up exactly: stream forward from the live tail.
            topic_tail
        } else {
            let snapshot_head = self.snapshot_for(&req, handler.as_ref(), topic_tail);
            if req.index > 0 {
                // Stale view: tell the subscriber to discard it before the
                // replacement snapshot arrives.
                let reset = EventBuffer::new();
                let start = reset.tail();
                reset.append(vec![Event::new(
                    req.topic.clone(),
                    0,
                    Payload::NewSnapshotToFollow,
                )]);
                reset.append_item(snapshot_head);
                start
            } else {
                snapshot_head
            }
        };

        let (id, closed) = self.tracker.register(&req.token);
        self.metrics
            .subscriptions_opened
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(topic = %req.topic, %id, "subscription opened");
        Ok(Subscription::new(req, start, id, closed, Arc::clone(&self.tracker)))
    }

    /// Returns a snapshot head for `req`, from the cache when a live entry
    /// matches its scope.
    fn snapshot_for(
        &self,
        req: &SubscribeRequest,
        handler: &dyn SnapshotHandler,
        topic_tail: Arc<BufferItem>,
    ) -> Arc<BufferItem> {
        if self.config.snapshot_cache_ttl.is_zero() {
            self.metrics.snapshots_taken.fetch_add(1, Ordering::Relaxed);
            return snapshot::capture(req, handler, topic_tail);
        }

        let key = SnapshotCacheKey::for_request(req);
        if let Some(head) = self.cached_snapshot(&key) {
            self.metrics
                .snapshot_cache_hits
                .fetch_add(1, Ordering::Relaxed);
            return head;
        }

        // Racing captures each produce a valid snapshot; the later insert
        // wins the cache slot.
        let head = snapshot::capture(req, handler, topic_tail);
        self.metrics.snapshots_taken.fetch_add(1, Ordering::Relaxed);
        let cached = CachedSnapshot {
            head: Arc::clone(&head),
            expires_at: Instant::now() + self.config.snapshot_cache_ttl,
        };
        self.snap_cache.lock().unwrap().insert(key, cached);
        head
    }

    fn cached_snapshot(&self, key: &SnapshotCacheKey) -> Option<Arc<BufferItem>> {
        let cache = self.snap_cache.lock().unwrap();
        let entry = cache.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(Arc::clone(&entry.head))
    }

    /// Returns the buffer for `topic`, creating it on first use.
    fn topic_buffer(&self, topic: &Topic) -> Arc<EventBuffer> {
        let mut buffers = self.buffers.lock().unwrap();
        match buffers.get(topic) {
            Some(buffer) => Arc::clone(buffer),
            None => {
                let buffer = Arc::new(EventBuffer::new());
                buffers.insert(topic.clone(), Arc::clone(&buffer));
                buffer
            }
        }
    }

    /// Activity counters for this publisher.
    #[must_use]
    pub fn metrics(&self) -> &Arc<PublisherMetrics> {
        &self.metrics
    }

    /// Number of currently open subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.tracker.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
