//! Subscription cursors over topic streams.
//!
//! A [`Subscription`] is one consumer's view of a topic: a cursor over the
//! buffer chain plus the key, namespace, and identity scope delivery is
//! narrowed by. Filtering happens lazily in [`Subscription::next`], so one
//! shared chain serves subscribers with different visibility.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::acl::Authorizer;
use crate::stream::buffer::BufferItem;
use crate::stream::event::{Event, Payload, PayloadEvents, Topic};
use crate::stream::publisher::{SubscriptionId, SubscriptionTracker};

// ---------------------------------------------------------------------------
// SubscribeRequest
// ---------------------------------------------------------------------------

/// Scope of one subscription.
#[derive(Clone)]
pub struct SubscribeRequest {
    /// Topic to stream.
    pub topic: Topic,
    /// Key delivery is narrowed to. Empty streams every key.
    pub key: String,
    /// Namespace delivery is narrowed to. Empty streams every namespace.
    pub namespace: String,
    /// Credential secret ID the subscriber authenticated with. Matched
    /// against close-subscription payloads for forced termination.
    pub token: String,
    /// Last index the subscriber has seen; zero when it has no view yet.
    pub index: u64,
    /// Read-permission scope. `None` delivers without permission checks.
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

impl SubscribeRequest {
    /// A wildcard request for `topic`: every key, every namespace, no
    /// authorizer, no prior view.
    #[must_use]
    pub fn new(topic: impl Into<Topic>) -> Self {
        Self {
            topic: topic.into(),
            key: String::new(),
            namespace: String::new(),
            token: String::new(),
            index: 0,
            authorizer: None,
        }
    }

    /// Immutable delivery test for one event under this scope.
    fn matches(&self, event: &Event) -> bool {
        if !(self.key.is_empty() && self.namespace.is_empty())
            && !event.payload.matches_key(&self.key, &self.namespace)
        {
            return false;
        }
        match &self.authorizer {
            Some(authorizer) => event.payload.is_readable(authorizer.as_ref()),
            None => true,
        }
    }

    /// Mutating delivery filter for a candidate event.
    ///
    /// Applies the key scope and then the permission scope through the
    /// payload's own predicates, so a batch payload is compacted to the
    /// visible subset before it leaves the pipeline. Runs for a wildcard
    /// scope too: control payloads that must never reach a consumer fail
    /// their predicates and are dropped here.
    fn narrow(&self, event: &mut Event) -> bool {
        if !event.payload.filter_by_key(&self.key, &self.namespace) {
            return false;
        }
        match &self.authorizer {
            Some(authorizer) => event.payload.has_read_permission(authorizer.as_ref()),
            None => true,
        }
    }
}

// The token is a credential secret; keep it out of logs.
impl fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("topic", &self.topic)
            .field("key", &self.key)
            .field("namespace", &self.namespace)
            .field("token", &"<redacted>")
            .field("index", &self.index)
            .field("authorizer", &self.authorizer.as_ref().map(|_| "<dyn>"))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SubscriptionError
// ---------------------------------------------------------------------------

/// Errors surfaced by [`Subscription::next`].
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The publisher terminated this subscription. The consumer's view is
    /// no longer valid: reset local state and resubscribe.
    #[error("subscription closed by server, client must reset state and resubscribe")]
    Closed,
    /// The snapshot capture feeding this subscription failed.
    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// One consumer's cursor over a topic stream.
///
/// Created by [`EventPublisher::subscribe`]. Dropping the handle
/// unsubscribes.
///
/// [`EventPublisher::subscribe`]: crate::stream::publisher::EventPublisher::subscribe
#[derive(Debug)]
pub struct Subscription {
    req: SubscribeRequest,
    current: Arc<BufferItem>,
    closed: watch::Receiver<bool>,
    id: SubscriptionId,
    tracker: Arc<SubscriptionTracker>,
}

impl Subscription {
    pub(crate) fn new(
        req: SubscribeRequest,
        current: Arc<BufferItem>,
        id: SubscriptionId,
        closed: watch::Receiver<bool>,
        tracker: Arc<SubscriptionTracker>,
    ) -> Self {
        Self {
            req,
            current,
            closed,
            id,
            tracker,
        }
    }

    /// Identifier assigned by the publisher.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Scope this subscription was created with.
    #[must_use]
    pub fn request(&self) -> &SubscribeRequest {
        &self.req
    }

    /// Returns the next deliverable event.
    ///
    /// Awaits the buffer chain, narrows each item to the subscription's key
    /// and permission scope, and skips items with nothing visible. A batch
    /// that narrows to one event is delivered unwrapped; several survivors
    /// arrive as one [`Payload::Batch`] carrying the first survivor's index.
    /// A published batch payload is itself compacted to the visible subset
    /// before delivery.
    ///
    /// # Errors
    ///
    /// [`SubscriptionError::Closed`] once the publisher force-closes this
    /// subscription, [`SubscriptionError::SnapshotFailed`] when the snapshot
    /// feeding it failed.
    pub async fn next(&mut self) -> Result<Event, SubscriptionError> {
        loop {
            if *self.closed.borrow() {
                return Err(SubscriptionError::Closed);
            }

            let next = tokio::select! {
                item = self.current.next_item() => item,
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        // Publisher gone; nothing will ever close us cleanly.
                        return Err(SubscriptionError::Closed);
                    }
                    continue;
                }
            };

            if let Some(message) = next.error() {
                return Err(SubscriptionError::SnapshotFailed(message.to_owned()));
            }
            self.current = next;

            let events = filter_events(&self.req, self.current.events());
            if events.is_empty() {
                continue;
            }
            let mut event = event_from_batch(&self.req, events);
            if !self.req.narrow(&mut event) {
                continue;
            }
            return Ok(event);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.tracker.unregister(self.id);
    }
}

/// Narrows a buffer item's events to those visible under `req`.
///
/// Same two passes as [`PayloadEvents`]: count first, then copy survivors,
/// so the shared slice is cloned wholesale when everything passes and not
/// at all when nothing does.
fn filter_events(req: &SubscribeRequest, events: &[Event]) -> Vec<Event> {
    let size = events.iter().filter(|event| req.matches(event)).count();

    if size == 0 {
        return Vec::new();
    }
    if size == events.len() {
        return events.to_vec();
    }

    let mut filtered = Vec::with_capacity(size);
    filtered.extend(events.iter().filter(|event| req.matches(event)).cloned());
    filtered
}

/// Collapses surviving events into the one event [`Subscription::next`]
/// returns: a sole survivor passes through unchanged, several are wrapped
/// as a batch indexed by the first.
fn event_from_batch(req: &SubscribeRequest, mut events: Vec<Event>) -> Event {
    if events.len() == 1 {
        return events.remove(0);
    }
    let index = events.first().map_or(0, |event| event.index);
    Event::new(
        req.topic.clone(),
        index,
        Payload::Batch(PayloadEvents::new(events)),
    )
}

// ===========================================================================
// Tests
// ===========================================================================
