//! # Riffle Core
//!
//! In-process publish/subscribe distribution of state change events.
//!
//! This crate provides:
//! - **Events**: Envelope and payload contract with per-subscriber filtering
//! - **Publisher**: Per-topic append-only buffers fed by a bounded publish queue
//! - **Snapshots**: New subscribers seeded from current state, with caching
//! - **Subscriptions**: Async cursors scoped by key, namespace, and permission
//!
//! ## Design Principles
//!
//! 1. **Immutable history** - Buffer items are shared between subscribers, never rewritten
//! 2. **Lazy filtering** - Delivery scope is applied per subscriber at read time
//! 3. **Control as data** - Snapshot boundaries and forced closes travel as events
//!
//! ## Example
//!
//! ```rust,ignore
//! use riffle_core::stream::{EventPublisher, PublisherConfig, SubscribeRequest};
//!
//! let publisher = EventPublisher::new(PublisherConfig::default());
//! publisher.register_snapshot_handler("kv", kv_snapshot);
//!
//! let mut sub = publisher.subscribe(SubscribeRequest::new("kv"))?;
//! let event = sub.next().await?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod acl;
pub mod stream;

// Re-export key types
pub use stream::{Event, EventPublisher, Payload, SubscribeRequest, Subscription, Topic};

/// Result type for riffle-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for riffle-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Publish-side errors
    #[error("Publish error: {0}")]
    Publish(#[from] stream::PublishError),

    /// Subscribe-side errors
    #[error("Subscribe error: {0}")]
    Subscribe(#[from] stream::SubscribeError),

    /// Subscription delivery errors
    #[error("Subscription error: {0}")]
    Subscription(#[from] stream::SubscriptionError),
}
