//! # Topic Event Streaming
//!
//! Publish/subscribe distribution of state change events over per-topic
//! append-only buffer chains.
//!
//! ## Overview
//!
//! This module provides the in-process changefeed layer:
//!
//! - **Event**: Envelope of topic, state-store index, and payload
//! - **Publisher**: Fan-out point owning one buffer chain per topic
//! - **Snapshot**: Seeds new subscribers with current state before live updates
//! - **Subscription**: Per-consumer cursor filtered by key, namespace, and permission
//!
//! ## Key Design Principles
//!
//! 1. **One chain per topic** - Every subscriber walks the same immutable items
//! 2. **Filtering is lazy** - Visibility is decided per subscriber at delivery
//! 3. **Control flows as data** - Snapshot markers and forced closes are events
//! 4. **History lives as long as a reader** - Items are freed once the slowest
//!    cursor moves past them
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use riffle_core::stream::{EventPublisher, PublisherConfig, SubscribeRequest};
//!
//! let publisher = Arc::new(EventPublisher::new(PublisherConfig::default()));
//! publisher.register_snapshot_handler("kv", |req, appender| {
//!     // Write current state as events, report the index it reflects.
//!     appender.append(state.changes_for(&req.key));
//!     Ok(state.index())
//! });
//!
//! // Drive the publish queue until shutdown flips to true.
//! let background = Arc::clone(&publisher);
//! tokio::spawn(async move { background.run(shutdown_rx).await });
//!
//! publisher.publish(vec![event]).await?;
//!
//! let mut sub = publisher.subscribe(SubscribeRequest::new("kv"))?;
//! while let Ok(event) = sub.next().await {
//!     apply(event);
//! }
//! ```
//!
//! ## Module Structure
//!
//! - [`event`]: Event envelope, payload contract, and batch filtering
//! - [`publisher`]: Publish queue, topic buffers, and the snapshot cache
//! - [`snapshot`]: Snapshot capture and splice onto the live chain
//! - [`subscription`]: Subscription cursors and delivery scoping
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  publish() / try_publish()  ┌────────────────┐
//! │ Producers │────────────────────────────▶│ EventPublisher │
//! └───────────┘       bounded queue         │   run() loop   │
//!                                           └───────┬────────┘
//!                         append (close events      │
//!                         intercepted by type)      ▼
//!                                       ┌──────────────────────┐
//!                                       │   per-topic buffer   │
//!                                       │ (append-only chain)  │
//!                                       └──────────┬───────────┘
//!                    snapshot + splice             │ next_item()
//! ┌─────────────────┐              ┌───────────────▼──────────────┐
//! │ SnapshotHandler │─────────────▶│         Subscription         │
//! └─────────────────┘    seeds     │ next() filters by key,       │
//!                                  │ namespace, and authorizer    │
//!                                  └──────────────────────────────┘
//! ```

pub(crate) mod buffer;
pub mod event;
pub mod publisher;
pub mod snapshot;
pub mod subscription;

// Re-export key types
pub use event::{DataPayload, Event, Payload, PayloadEvents, Topic};
pub use publisher::{
    EventPublisher, PublishError, PublisherConfig, PublisherMetrics, SubscribeError,
    SubscriptionId,
};
pub use snapshot::{SnapshotAppender, SnapshotHandler, SnapshotResult};
pub use subscription::{SubscribeRequest, Subscription, SubscriptionError};
