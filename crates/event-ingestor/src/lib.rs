//! # Event Ingestor
//!
//! Subscribes to `state_changed` events on a live session, flattens each
//! frame into the canonical event, joins device/area context from the
//! catalog read replica, and enqueues into the bounded pipeline channel.
//!
//! The pipeline protects connection liveness: when it is full, events are
//! dropped at the tail (bounded, observable loss) rather than blocking the
//! WebSocket reader; when the writer signals high-water, the enqueue path
//! rejects incoming events under a dedicated counter instead.

pub mod flatten;
pub mod ingest;
pub mod metrics;
pub mod pipeline;

pub use flatten::{flatten_event, FlattenError};
pub use ingest::EventIngestor;
pub use pipeline::{EnqueueOutcome, EventPipeline};
