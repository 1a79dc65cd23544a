//! Bridging pipeline between the HTTP side and the broker.
//!
//! ```text
//! ingest ──► OutboundQueue ──► PublisherLoop ──► ConnectionManager ──► broker
//!              (bounded)        (single task)
//! ```
//!
//! 1. [`queue`] - Bounded FIFO with close-then-drain semantics
//! 2. [`publisher`] - The single consumer forwarding to the broker
//! 3. [`lifecycle`] - Startup wiring and ordered shutdown

pub mod lifecycle;
pub mod publisher;
pub mod queue;
