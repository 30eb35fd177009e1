//! Append-only topic buffer linking batches of events to their successors.
//!
//! One buffer exists per topic. The publisher appends batches at the tail;
//! any number of subscriptions walk the chain independently, each holding
//! the item it last consumed. Nothing retains old items except the readers
//! positioned on them, so memory is bounded by the slowest reader.
//!
//! Writes are single-writer: only the publisher's run loop appends to a
//! topic buffer, and a snapshot buffer is written by one capture call before
//! any reader sees it.

use std::sync::{Arc, OnceLock, RwLock};

use tokio::sync::Notify;

use crate::stream::event::Event;

// ---------------------------------------------------------------------------
// BufferLink
// ---------------------------------------------------------------------------

/// Connects a buffer item to its successor.
///
/// `next` is set exactly once, when the writer appends the following item;
/// `ready` wakes every reader awaiting that append. A splice sentinel shares
/// the link of the item it aliases, so readers of either chain observe the
/// same successor.
#[derive(Debug, Default)]
struct BufferLink {
    next: OnceLock<Arc<BufferItem>>,
    ready: Notify,
}

// ---------------------------------------------------------------------------
// BufferItem
// ---------------------------------------------------------------------------

/// One appended batch in a buffer chain.
///
/// Readers hold an `Arc<BufferItem>` as their cursor and follow the link to
/// the next batch. Items with no events are position markers (the initial
/// tail of a fresh buffer, splice sentinels); subscriptions skip them.
#[derive(Debug)]
pub(crate) struct BufferItem {
    events: Vec<Event>,
    error: Option<String>,
    link: Arc<BufferLink>,
}

impl BufferItem {
    fn new(events: Vec<Event>) -> Self {
        Self {
            events,
            error: None,
            link: Arc::new(BufferLink::default()),
        }
    }

    fn new_error(message: String) -> Self {
        Self {
            events: Vec::new(),
            error: Some(message),
            link: Arc::new(BufferLink::default()),
        }
    }

    /// An empty item aliasing `link`, used to follow another chain's tail.
    fn sentinel(link: Arc<BufferLink>) -> Self {
        Self {
            events: Vec::new(),
            error: None,
            link,
        }
    }

    /// Events carried by this item. Empty for position markers.
    pub(crate) fn events(&self) -> &[Event] {
        &self.events
    }

    /// Index of the first event, or zero when the item carries none.
    pub(crate) fn first_index(&self) -> u64 {
        self.events.first().map_or(0, |event| event.index)
    }

    /// Error recorded in place of events by a failed snapshot capture.
    pub(crate) fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Waits until the successor item is linked and returns it.
    ///
    /// Wait-free when the successor already exists. Cancel-safe: dropping
    /// the future leaves the cursor where it was.
    pub(crate) async fn next_item(&self) -> Arc<BufferItem> {
        loop {
            let ready = self.link.ready.notified();
            tokio::pin!(ready);
            // Register for the wakeup before checking, so an append between
            // the check and the await is not missed.
            ready.as_mut().enable();
            if let Some(next) = self.link.next.get() {
                return Arc::clone(next);
            }
            ready.await;
        }
    }

    /// Returns the successor if it is already linked.
    pub(crate) fn try_next(&self) -> Option<Arc<BufferItem>> {
        self.link.next.get().map(Arc::clone)
    }

    /// Returns the successor, or an empty sentinel that will observe it
    /// once the writer appends one.
    pub(crate) fn next_link(&self) -> Arc<BufferItem> {
        match self.link.next.get() {
            Some(next) => Arc::clone(next),
            None => Arc::new(Self::sentinel(Arc::clone(&self.link))),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBuffer
// ---------------------------------------------------------------------------

/// Unbounded append-only chain of event batches for one topic.
///
/// The buffer itself retains only the tail; everything earlier is kept
/// alive solely by readers still positioned there.
#[derive(Debug)]
pub(crate) struct EventBuffer {
    tail: RwLock<Arc<BufferItem>>,
}

impl EventBuffer {
    /// Creates a buffer whose tail is an empty position marker.
    pub(crate) fn new() -> Self {
        Self {
            tail: RwLock::new(Arc::new(BufferItem::new(Vec::new()))),
        }
    }

    /// Appends a batch of events.
    pub(crate) fn append(&self, events: Vec<Event>) {
        self.append_item(Arc::new(BufferItem::new(events)));
    }

    /// Records a failed snapshot capture; readers reaching this item
    /// surface the error instead of events.
    pub(crate) fn append_error(&self, message: String) {
        self.append_item(Arc::new(BufferItem::new_error(message)));
    }

    /// Links `item` after the current tail and makes it the new tail.
    pub(crate) fn append_item(&self, item: Arc<BufferItem>) {
        let mut tail = self.tail.write().unwrap();
        let prev = std::mem::replace(&mut *tail, Arc::clone(&item));
        prev.link
            .next
            .set(item)
            .expect("append past an already linked tail");
        prev.link.ready.notify_waiters();
    }

    /// The current tail. New readers start here: the tail item itself has
    /// already been consumed or is empty, so delivery begins with the next
    /// append.
    pub(crate) fn tail(&self) -> Arc<BufferItem> {
        Arc::clone(&self.tail.read().unwrap())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Authorizer;
    use crate::stream::event::{DataPayload, Payload, Topic};

    #[derive(Debug)]
    struct Noop;

    impl DataPayload for Noop {
        fn filter_by_key(&self, _key: &str, _namespace: &str) -> bool {
            true
        }

        fn has_read_permission(&self, _authorizer: &dyn Authorizer) -> bool {
            true
        }
    }

    fn batch(indexes: &[u64]) -> Vec<Event> {
        indexes
            .iter()
            .map(|&index| Event::new(Topic::from("t"), index, Payload::Data(Arc::new(Noop))))
            .collect()
    }

    #[test]
    fn fresh_buffer_tail_is_an_empty_marker() {
        let buffer = EventBuffer::new();
        let tail = buffer.tail();

        assert!(tail.events().is_empty());
        assert_eq!(tail.first_index(), 0);
        assert!(tail.error().is_none());
        assert!(tail.try_next().is_none());
    }

    #[test]
    fn append_links_after_the_previous_tail() {
        let buffer = EventBuffer::new();
        let start = buffer.tail();

        buffer.append(batch(&[5, 5]));

        let next = start.try_next().expect("tail should be linked");
        assert_eq!(next.events().len(), 2);
        assert_eq!(next.first_index(), 5);
        assert!(next.try_next().is_none());
    }

    #[test]
    fn chain_preserves_append_order() {
        let buffer = EventBuffer::new();
        let mut item = buffer.tail();

        buffer.append(batch(&[1]));
        buffer.append(batch(&[2]));
        buffer.append(batch(&[3]));

        let mut seen = Vec::new();
        while let Some(next) = item.try_next() {
            seen.push(next.first_index());
            item = next;
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn error_item_carries_the_message() {
        let buffer = EventBuffer::new();
        let start = buffer.tail();

        buffer.append_error("handler failed".to_owned());

        let next = start.try_next().expect("error item should be linked");
        assert_eq!(next.error(), Some("handler failed"));
        assert!(next.events().is_empty());
    }

    #[test]
    fn next_link_aliases_the_unlinked_tail() {
        let buffer = EventBuffer::new();
        let tail = buffer.tail();
        let sentinel = tail.next_link();

        assert!(sentinel.events().is_empty());
        assert!(sentinel.try_next().is_none());

        buffer.append(batch(&[3]));

        let through_sentinel = sentinel.try_next().expect("sentinel should follow append");
        assert_eq!(through_sentinel.first_index(), 3);
    }

    #[test]
    fn next_link_returns_an_existing_successor() {
        let buffer = EventBuffer::new();
        let start = buffer.tail();
        buffer.append(batch(&[7]));

        let next = start.next_link();
        assert_eq!(next.first_index(), 7);
    }

    #[tokio::test]
    async fn next_item_wakes_a_waiting_reader() {
        let buffer = EventBuffer::new();
        let tail = buffer.tail();

        let (item, ()) = tokio::join!(tail.next_item(), async {
            buffer.append(batch(&[7]));
        });
        assert_eq!(item.first_index(), 7);
    }

    #[tokio::test]
    async fn next_item_wakes_every_waiting_reader() {
        let buffer = EventBuffer::new();
        let first = buffer.tail();
        let second = buffer.tail();

        let (a, b, ()) = tokio::join!(first.next_item(), second.next_item(), async {
            buffer.append(batch(&[9]));
        });
        assert_eq!(a.first_index(), 9);
        assert_eq!(b.first_index(), 9);
    }

    #[tokio::test]
    async fn next_item_returns_immediately_when_linked() {
        let buffer = EventBuffer::new();
        let start = buffer.tail();
        buffer.append(batch(&[4]));

        let item = start.next_item().await;
        assert_eq!(item.first_index(), 4);
    }
}
