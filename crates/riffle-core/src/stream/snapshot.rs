//! Snapshot capture and splice onto the live topic stream.
//!
//! A subscriber that cannot resume needs the current state before live
//! updates make sense. The topic's [`SnapshotHandler`] writes that state as
//! events into a private buffer; the capture then appends an end-of-snapshot
//! marker and links the live topic chain at the first batch the snapshot
//! does not already cover. Subscribers walk one seamless chain: state burst,
//! marker, live events.

use std::error::Error;
use std::sync::Arc;

use crate::stream::buffer::{BufferItem, EventBuffer};
use crate::stream::event::{Event, Payload};
use crate::stream::subscription::SubscribeRequest;

/// Outcome of a snapshot capture: the state-store index the snapshot was
/// taken at.
pub type SnapshotResult = Result<u64, Box<dyn Error + Send + Sync>>;

// ---------------------------------------------------------------------------
// SnapshotHandler
// ---------------------------------------------------------------------------

/// Writes the current state of a topic as a burst of events.
///
/// Implementations append any number of events through the appender and
/// return the index their view reflects. Live batches at or below that
/// index are dropped when the capture is spliced onto the topic stream.
pub trait SnapshotHandler: Send + Sync {
    /// Captures state for `req` into `appender`.
    fn snapshot(&self, req: &SubscribeRequest, appender: &mut SnapshotAppender<'_>)
        -> SnapshotResult;
}

impl<F> SnapshotHandler for F
where
    F: Fn(&SubscribeRequest, &mut SnapshotAppender<'_>) -> SnapshotResult + Send + Sync,
{
    fn snapshot(
        &self,
        req: &SubscribeRequest,
        appender: &mut SnapshotAppender<'_>,
    ) -> SnapshotResult {
        self(req, appender)
    }
}

// ---------------------------------------------------------------------------
// SnapshotAppender
// ---------------------------------------------------------------------------

/// Write handle a [`SnapshotHandler`] uses to emit snapshot events.
///
/// Restricts the handler to appends. The buffer behind it belongs to the
/// capture and becomes visible to subscribers only once the capture
/// completes.
#[derive(Debug)]
pub struct SnapshotAppender<'a> {
    buffer: &'a EventBuffer,
}

impl SnapshotAppender<'_> {
    /// Appends a batch of snapshot events.
    pub fn append(&mut self, events: Vec<Event>) {
        self.buffer.append(events);
    }
}

// ---------------------------------------------------------------------------
// Capture and splice
// ---------------------------------------------------------------------------

/// Captures a snapshot for `req` and returns the head of its chain.
///
/// Runs `handler` into a fresh buffer, appends the end-of-snapshot marker at
/// the index it returns, then splices the live chain starting from
/// `topic_tail`. Handler failure is recorded as an error item in place of
/// the marker; subscriptions reading the capture surface it.
pub(crate) fn capture(
    req: &SubscribeRequest,
    handler: &dyn SnapshotHandler,
    topic_tail: Arc<BufferItem>,
) -> Arc<BufferItem> {
    let buffer = EventBuffer::new();
    let head = buffer.tail();

    let mut appender = SnapshotAppender { buffer: &buffer };
    match handler.snapshot(req, &mut appender) {
        Ok(index) => {
            buffer.append(vec![Event::new(
                req.topic.clone(),
                index,
                Payload::EndOfSnapshot,
            )]);
            splice(&buffer, topic_tail, index);
        }
        Err(error) => {
            tracing::warn!(topic = %req.topic, %error, "snapshot capture failed");
            buffer.append_error(error.to_string());
        }
    }

    head
}

/// Walks the live chain from `topic_tail` and links the first batch the
/// snapshot does not cover after the captured burst.
fn splice(buffer: &EventBuffer, topic_tail: Arc<BufferItem>, snapshot_index: u64) {
    let mut item = topic_tail;
    loop {
        match item.try_next() {
            // Reached the live tail: follow its link so later appends flow
            // into the captured chain.
            None => {
                buffer.append_item(item.next_link());
                return;
            }
            Some(next) => {
                if let Some(message) = next.error() {
                    buffer.append_error(message.to_owned());
                    return;
                }
                if next.first_index() > snapshot_index {
                    buffer.append_item(next);
                    return;
                }
                item = next;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
