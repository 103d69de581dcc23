//! Prometheus metrics for event ingestion
//!
//! - `events_enqueued_total` - events accepted onto the pipeline
//! - `pipeline_dropped_total` - drop-tail losses (pipeline full)
//! - `pipeline_backpressured_total` - rejects while the writer holds the
//!   high-water flag (counted separately from random drops)
//! - `events_invalid_total{reason}` - frames failing validation

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    pub static ref EVENTS_ENQUEUED: IntCounter = register_int_counter!(
        "events_enqueued_total",
        "Events accepted onto the pipeline"
    )
    .expect("register events_enqueued_total");

    pub static ref PIPELINE_DROPPED: IntCounter = register_int_counter!(
        "pipeline_dropped_total",
        "Events dropped at the pipeline tail because the channel was full"
    )
    .expect("register pipeline_dropped_total");

    pub static ref PIPELINE_BACKPRESSURED: IntCounter = register_int_counter!(
        "pipeline_backpressured_total",
        "Events rejected while the writer signalled backpressure"
    )
    .expect("register pipeline_backpressured_total");

    pub static ref EVENTS_INVALID: IntCounterVec = register_int_counter_vec!(
        "events_invalid_total",
        "Inbound frames failing validation",
        &["reason"]
    )
    .expect("register events_invalid_total");
}
