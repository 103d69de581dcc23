//! # Retention & Aggregator
//!
//! A cooperative scheduler runs three compaction job kinds (daily, weekly,
//! monthly) against the time-series store. Each job is at-most-once per
//! scheduled instant, guarded by an advisory leader lock in the catalog;
//! runs are persisted through the `Scheduled -> Running -> {Complete |
//! Failed}` state machine.
//!
//! Detectors are pure functions over a window of points. A failed detector
//! never blocks the others, and aggregate rows key on
//! `(detector, natural-key, date)` so a replayed job overwrites its own
//! partial output.

pub mod daily;
pub mod detectors;
pub mod metrics;
pub mod monthly;
pub mod retention;
pub mod scheduler;
pub mod weekly;

pub use scheduler::AggregationScheduler;
