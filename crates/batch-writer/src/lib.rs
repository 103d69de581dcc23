//! # Enrichment & Batch Writer
//!
//! Consumes canonical events from the pipeline, normalizes and enriches
//! them, routes each to a time-series point, and writes per-measurement
//! batches under size+time flush rules.
//!
//! Hard contracts owned here:
//! - **at-least-once** delivery to storage (retry queue + failed-batch spool)
//! - **size+time flush**: a batch goes out when it reaches `batch_size` or
//!   when the flush timer expires, whichever comes first
//! - **bounded memory**: in-flight bytes are tracked; past
//!   `writer.high_water_bytes` the ingestor's enqueue path flips from
//!   drop-tail to reject-incoming
//! - **classified retries**: network/5xx/429 retry with jittered backoff,
//!   other 4xx drop the batch

pub mod enrich;
pub mod metrics;
pub mod normalize;
pub mod route;
pub mod spool;
pub mod writer;

pub use enrich::{EnrichmentCache, EnrichmentProvider};
pub use route::{CardinalityTracker, RAW_MEASUREMENT};
pub use spool::{Spool, SpooledBatch};
pub use writer::BatchWriter;
