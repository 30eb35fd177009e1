//! Event envelope and payload contract for topic streams.
//!
//! Everything a topic buffer carries is an [`Event`]: a topic, the
//! state-store index that produced it, and a [`Payload`]. Payloads answer the
//! two delivery questions — key scope and read permission — so the
//! subscription machinery can narrow a shared changefeed per subscriber
//! without understanding payload internals. Control signals (snapshot
//! boundaries, forced termination) travel through the same channel as data,
//! distinguished only by payload variant.

use std::fmt;
use std::sync::Arc;

use crate::acl::Authorizer;

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// Identifies one stream of events.
///
/// Opaque to the distribution layer: topics are compared, hashed, and
/// displayed, never interpreted. Cheap to clone; every event carries one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(Arc<str>);

impl Topic {
    /// Creates a topic from its name.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// The topic name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self(Arc::from(name))
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

// ---------------------------------------------------------------------------
// DataPayload
// ---------------------------------------------------------------------------

/// Contract for domain payloads carried in [`Payload::Data`].
///
/// These two predicates are the only questions the distribution layer ever
/// asks a payload. Both are total: a payload that cannot match simply
/// answers `false`, there is no error case. Implementations conventionally
/// treat an empty `key` or `namespace` as a wildcard on that axis.
pub trait DataPayload: fmt::Debug + Send + Sync {
    /// Returns `true` if this payload belongs to `key` in `namespace`.
    fn filter_by_key(&self, key: &str, namespace: &str) -> bool;

    /// Returns `true` if `authorizer` grants read on the resource this
    /// payload describes. The authorizer is queried, never mutated.
    fn has_read_permission(&self, authorizer: &dyn Authorizer) -> bool;
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// The body of an [`Event`].
///
/// A closed set of variants dispatched by [`Payload::filter_by_key`] and
/// [`Payload::has_read_permission`]. Domain data flows through
/// [`Payload::Data`]; the remaining variants are produced and consumed by
/// the distribution layer itself.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Domain data. Shared and immutable; filtering queries it but never
    /// changes it.
    Data(Arc<dyn DataPayload>),

    /// An ordered batch of events delivered as one payload. The only
    /// variant whose predicates mutate: they narrow the batch in place.
    Batch(PayloadEvents),

    /// Marks the end of a subscription's snapshot burst; everything after
    /// it is a live update. Passes every filter so all subscribers observe
    /// the boundary.
    EndOfSnapshot,

    /// Tells the subscriber its view is stale: discard local state, a fresh
    /// snapshot follows. Passes every filter.
    NewSnapshotToFollow,

    /// Orders termination of every subscription authenticated with one of
    /// the carried token secret IDs. The publisher intercepts this variant
    /// by type before any filtering or buffer append; its predicates fail
    /// everything as a safety net so it can never reach a consumer. The ID
    /// list may contain duplicates.
    CloseSubscription(Vec<String>),
}

impl Payload {
    /// Applies the key scope to this payload.
    ///
    /// Pure for every variant except [`Payload::Batch`], which is compacted
    /// in place to the matching subset. The return value reports whether
    /// anything survived: on `false` the caller discards the whole payload.
    /// Callers that still need the original batch must clone it first.
    #[must_use]
    pub fn filter_by_key(&mut self, key: &str, namespace: &str) -> bool {
        match self {
            Payload::Data(payload) => payload.filter_by_key(key, namespace),
            Payload::Batch(batch) => batch.filter_by_key(key, namespace),
            Payload::EndOfSnapshot | Payload::NewSnapshotToFollow => true,
            Payload::CloseSubscription(_) => false,
        }
    }

    /// Applies the read-permission scope to this payload.
    ///
    /// Same query/mutate contract as [`Payload::filter_by_key`]: pure for
    /// simple variants, narrows a batch in place.
    #[must_use]
    pub fn has_read_permission(&mut self, authorizer: &dyn Authorizer) -> bool {
        match self {
            Payload::Data(payload) => payload.has_read_permission(authorizer),
            Payload::Batch(batch) => batch.has_read_permission(authorizer),
            Payload::EndOfSnapshot | Payload::NewSnapshotToFollow => true,
            Payload::CloseSubscription(_) => false,
        }
    }

    /// Immutable form of the key predicate, used while counting batch
    /// survivors. A nested batch matches if any of its events match, and is
    /// kept whole.
    pub(crate) fn matches_key(&self, key: &str, namespace: &str) -> bool {
        match self {
            Payload::Data(payload) => payload.filter_by_key(key, namespace),
            Payload::Batch(batch) => batch
                .items
                .iter()
                .any(|event| event.payload.matches_key(key, namespace)),
            Payload::EndOfSnapshot | Payload::NewSnapshotToFollow => true,
            Payload::CloseSubscription(_) => false,
        }
    }

    /// Immutable form of the permission predicate.
    pub(crate) fn is_readable(&self, authorizer: &dyn Authorizer) -> bool {
        match self {
            Payload::Data(payload) => payload.has_read_permission(authorizer),
            Payload::Batch(batch) => batch
                .items
                .iter()
                .any(|event| event.payload.is_readable(authorizer)),
            Payload::EndOfSnapshot | Payload::NewSnapshotToFollow => true,
            Payload::CloseSubscription(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A single change notification on a topic stream.
///
/// Created once by the publisher path and shared immutably from then on.
/// The only exception is a [`Payload::Batch`] being narrowed by its owning
/// subscription.
#[derive(Debug, Clone)]
pub struct Event {
    /// Topic this event was published on.
    pub topic: Topic,
    /// State-store index that produced the event. Monotonic per topic,
    /// assigned by the publisher path; zero for control events.
    pub index: u64,
    /// The event body.
    pub payload: Payload,
}

impl Event {
    /// Creates an event.
    #[must_use]
    pub fn new(topic: Topic, index: u64, payload: Payload) -> Self {
        Self {
            topic,
            index,
            payload,
        }
    }

    /// Builds the control event that terminates every subscription
    /// authenticated with one of `token_secret_ids`.
    ///
    /// Publish it like any other event; the publisher intercepts it before
    /// any buffer append, so topic and index are irrelevant and it is never
    /// delivered. Duplicate IDs are harmless.
    #[must_use]
    pub fn close_subscription(token_secret_ids: Vec<String>) -> Self {
        Self {
            topic: Topic::from(""),
            index: 0,
            payload: Payload::CloseSubscription(token_secret_ids),
        }
    }

    /// Returns `true` if this is the end-of-snapshot marker.
    ///
    /// Variant identity, not structural equality: a data payload with no
    /// fields is never mistaken for the marker.
    #[inline]
    #[must_use]
    pub fn is_end_of_snapshot(&self) -> bool {
        matches!(self.payload, Payload::EndOfSnapshot)
    }

    /// Returns `true` if this is the new-snapshot-to-follow marker.
    #[inline]
    #[must_use]
    pub fn is_new_snapshot_to_follow(&self) -> bool {
        matches!(self.payload, Payload::NewSnapshotToFollow)
    }
}

// ---------------------------------------------------------------------------
// PayloadEvents
// ---------------------------------------------------------------------------

/// An ordered batch of events filtered as a unit.
///
/// Not safe for concurrent filtering: both predicates take `&mut self` and
/// compact `items` in place, so each instance is filtered by exactly one
/// owner. Subscriptions clone the batch per subscriber before filtering.
#[derive(Debug, Clone)]
pub struct PayloadEvents {
    /// The wrapped events, in publish order. Filtering only ever subsets
    /// this sequence, never reorders it.
    pub items: Vec<Event>,
}

impl PayloadEvents {
    /// Wraps `items` as a batch payload.
    #[must_use]
    pub fn new(items: Vec<Event>) -> Self {
        Self { items }
    }

    /// Number of wrapped events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` when nothing is left to deliver.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Narrows the batch to events matching the key scope, compacting any
    /// inner batches along the way. Returns whether any survived.
    #[must_use]
    pub fn filter_by_key(&mut self, key: &str, namespace: &str) -> bool {
        self.filter(|event| event.payload.filter_by_key(key, namespace))
    }

    /// Narrows the batch to events `authorizer` may read. Returns whether
    /// any survived.
    #[must_use]
    pub fn has_read_permission(&mut self, authorizer: &dyn Authorizer) -> bool {
        self.filter(|event| event.payload.has_read_permission(authorizer))
    }

    /// Compacts `items` to the events matching `keep`.
    ///
    /// Two passes: the first counts survivors. When all or none survive the
    /// sequence is left alone (emptied in place for none), so the common
    /// cases allocate nothing. Only a strict non-empty subset pays for a
    /// copy, into a vector of exact capacity, preserving order.
    ///
    /// `keep` takes each event mutably so inner batches are narrowed
    /// through their own predicates as they are visited. The second pass
    /// re-applies it, a no-op on an already narrowed element.
    fn filter(&mut self, keep: impl Fn(&mut Event) -> bool) -> bool {
        let mut size = 0;
        for event in &mut self.items {
            if keep(event) {
                size += 1;
            }
        }

        if size == 0 {
            self.items.clear();
            return false;
        }
        if size == self.items.len() {
            return true;
        }

        let mut filtered = Vec::with_capacity(size);
        for event in &mut self.items {
            if keep(event) {
                filtered.push(event.clone());
            }
        }
        self.items = filtered;
        true
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AllowAll, DenyAll};

    /// Helper: a key/value-style payload scoped to a key and namespace.
    #[derive(Debug)]
    struct KvPayload {
        key: String,
        namespace: String,
    }

    impl DataPayload for KvPayload {
        fn filter_by_key(&self, key: &str, namespace: &str) -> bool {
            (key.is_empty() || self.key == key)
                && (namespace.is_empty() || self.namespace == namespace)
        }

        fn has_read_permission(&self, authorizer: &dyn Authorizer) -> bool {
            authorizer.can_read(&self.key)
        }
    }

    /// Grants reads only on a single key.
    struct OnlyKey(&'static str);

    impl Authorizer for OnlyKey {
        fn can_read(&self, resource: &str) -> bool {
            resource == self.0
        }
    }

    fn kv_event(index: u64, key: &str) -> Event {
        Event::new(
            Topic::from("kv"),
            index,
            Payload::Data(Arc::new(KvPayload {
                key: key.to_owned(),
                namespace: "default".to_owned(),
            })),
        )
    }

    /// Batch of KV events with indexes 1..=len.
    fn kv_batch(keys: &[&str]) -> PayloadEvents {
        let items = (1u64..).zip(keys).map(|(i, key)| kv_event(i, key)).collect();
        PayloadEvents::new(items)
    }

    fn surviving_indexes(batch: &PayloadEvents) -> Vec<u64> {
        batch.items.iter().map(|event| event.index).collect()
    }

    // --- Topic tests ---

    #[test]
    fn topic_compares_and_displays_by_name() {
        let topic = Topic::from("kv");
        assert_eq!(topic, Topic::new("kv"));
        assert_ne!(topic, Topic::from("sessions"));
        assert_eq!(topic.to_string(), "kv");
        assert_eq!(topic.as_str(), "kv");
    }

    // --- Batch filter tests ---

    #[test]
    fn all_pass_filter_leaves_items_in_place() {
        let mut batch = kv_batch(&["a", "a", "a"]);
        let before = batch.items.as_ptr();

        assert!(batch.filter_by_key("a", "default"));
        assert_eq!(batch.len(), 3);
        assert_eq!(surviving_indexes(&batch), vec![1, 2, 3]);
        assert_eq!(batch.items.as_ptr(), before);
    }

    #[test]
    fn wildcard_filter_matches_everything() {
        let mut batch = kv_batch(&["a", "b", "c"]);
        let before = batch.items.as_ptr();

        assert!(batch.filter_by_key("", ""));
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.items.as_ptr(), before);
    }

    #[test]
    fn all_fail_filter_empties_the_batch() {
        let mut batch = kv_batch(&["a", "b", "c"]);
        assert!(!batch.filter_by_key("zzz", "default"));
        assert!(batch.is_empty());
    }

    #[test]
    fn partial_filter_keeps_original_order() {
        let mut batch = kv_batch(&["a", "b", "a", "c", "a"]);
        assert!(batch.filter_by_key("a", "default"));
        assert_eq!(surviving_indexes(&batch), vec![1, 3, 5]);
    }

    #[test]
    fn partial_filter_keeps_exactly_the_matches() {
        // Five events, two matching.
        let mut batch = kv_batch(&["a", "b", "b", "a", "c"]);
        assert!(batch.filter_by_key("b", "default"));
        assert_eq!(batch.len(), 2);
        assert!(batch
            .items
            .iter()
            .all(|event| event.payload.matches_key("b", "default")));
    }

    #[test]
    fn empty_batch_filters_to_false() {
        let mut batch = PayloadEvents::new(Vec::new());
        assert!(!batch.filter_by_key("a", "default"));
        assert!(!batch.has_read_permission(&AllowAll));
        assert!(batch.is_empty());
    }

    #[test]
    fn namespace_scopes_the_key_filter() {
        let mut batch = kv_batch(&["a", "b"]);
        assert!(!batch.filter_by_key("a", "other"));
        assert!(batch.is_empty());
    }

    #[test]
    fn key_scenario_filters_by_requested_key() {
        let original = kv_batch(&["key-a", "key-b", "key-a"]);

        let mut by_a = original.clone();
        assert!(by_a.filter_by_key("key-a", "default"));
        assert_eq!(surviving_indexes(&by_a), vec![1, 3]);

        let mut by_c = original;
        assert!(!by_c.filter_by_key("key-c", "default"));
        assert!(by_c.is_empty());
    }

    #[test]
    fn read_permission_narrows_by_authorizer() {
        let mut batch = kv_batch(&["a", "b"]);
        assert!(batch.has_read_permission(&AllowAll));
        assert_eq!(batch.len(), 2);

        assert!(!batch.has_read_permission(&DenyAll));
        assert!(batch.is_empty());
    }

    #[test]
    fn read_permission_keeps_only_granted_events() {
        let mut batch = kv_batch(&["a", "b", "a"]);
        assert!(batch.has_read_permission(&OnlyKey("a")));
        assert_eq!(surviving_indexes(&batch), vec![1, 3]);
    }

    #[test]
    fn nested_batch_matches_through_inner_events() {
        let inner = PayloadEvents::new(vec![kv_event(2, "b")]);
        let mut outer = PayloadEvents::new(vec![
            kv_event(1, "a"),
            Event::new(Topic::from("kv"), 2, Payload::Batch(inner)),
        ]);

        assert!(outer.filter_by_key("b", "default"));
        assert_eq!(outer.len(), 1);
        assert!(matches!(outer.items[0].payload, Payload::Batch(_)));
    }

    #[test]
    fn nested_batches_are_narrowed_in_place() {
        let inner = PayloadEvents::new(vec![kv_event(1, "a"), kv_event(2, "b")]);
        let mut outer = PayloadEvents::new(vec![
            Event::new(Topic::from("kv"), 1, Payload::Batch(inner)),
            kv_event(3, "b"),
        ]);

        assert!(outer.filter_by_key("a", "default"));
        assert_eq!(outer.len(), 1);
        match &outer.items[0].payload {
            Payload::Batch(batch) => assert_eq!(surviving_indexes(batch), vec![1]),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn payload_filter_narrows_a_wrapped_batch() {
        let mut payload = Payload::Batch(kv_batch(&["a", "b"]));
        assert!(payload.filter_by_key("a", "default"));
        match &payload {
            Payload::Batch(batch) => assert_eq!(surviving_indexes(batch), vec![1]),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    // --- Framing payload tests ---

    #[test]
    fn framing_events_pass_every_filter() {
        for mut payload in [Payload::EndOfSnapshot, Payload::NewSnapshotToFollow] {
            assert!(payload.filter_by_key("", ""));
            assert!(payload.filter_by_key("any-key", "any-namespace"));
            assert!(payload.has_read_permission(&AllowAll));
            assert!(payload.has_read_permission(&DenyAll));
        }
    }

    #[test]
    fn framing_events_survive_batch_filtering() {
        let mut batch = PayloadEvents::new(vec![
            kv_event(1, "a"),
            Event::new(Topic::from("kv"), 2, Payload::EndOfSnapshot),
        ]);

        assert!(batch.filter_by_key("zzz", ""));
        assert_eq!(batch.len(), 1);
        assert!(batch.items[0].is_end_of_snapshot());

        assert!(batch.has_read_permission(&DenyAll));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn framing_queries_use_variant_identity() {
        let empty_data = Event::new(
            Topic::from("kv"),
            1,
            Payload::Data(Arc::new(KvPayload {
                key: String::new(),
                namespace: String::new(),
            })),
        );
        assert!(!empty_data.is_end_of_snapshot());
        assert!(!empty_data.is_new_snapshot_to_follow());

        let end = Event::new(Topic::from("kv"), 2, Payload::EndOfSnapshot);
        assert!(end.is_end_of_snapshot());
        assert!(!end.is_new_snapshot_to_follow());

        let fresh = Event::new(Topic::from("kv"), 3, Payload::NewSnapshotToFollow);
        assert!(fresh.is_new_snapshot_to_follow());
        assert!(!fresh.is_end_of_snapshot());
    }

    // --- Close-subscription payload tests ---

    #[test]
    fn close_subscription_fails_every_filter() {
        let tokens = vec!["tok-a".to_owned(), "tok-a".to_owned(), "tok-b".to_owned()];
        let mut event = Event::close_subscription(tokens);

        assert!(!event.payload.filter_by_key("", ""));
        assert!(!event.payload.filter_by_key("any", "any"));
        assert!(!event.payload.has_read_permission(&AllowAll));
        assert!(!event.payload.has_read_permission(&DenyAll));
    }

    #[test]
    fn close_subscription_keeps_duplicate_tokens() {
        let event =
            Event::close_subscription(vec!["tok-a".into(), "tok-a".into(), "tok-b".into()]);
        match &event.payload {
            Payload::CloseSubscription(ids) => {
                assert_eq!(ids, &["tok-a", "tok-a", "tok-b"]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn close_subscription_is_dropped_from_batches() {
        let mut batch = PayloadEvents::new(vec![
            kv_event(1, "a"),
            Event::close_subscription(vec!["tok-a".into()]),
        ]);

        assert!(batch.filter_by_key("", ""));
        assert_eq!(surviving_indexes(&batch), vec![1]);
    }
}
