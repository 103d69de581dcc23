//! Prometheus metrics for the batch writer
//!
//! - `points_written_total{measurement}` - points confirmed by the store
//! - `write_retries_total{measurement}` - retriable write failures
//! - `write_dropped_total{measurement}` - non-retriable batches dropped
//! - `writer_in_flight_bytes` - bytes held in batches and the retry queue
//! - `batches_spooled_total{measurement}` - batches parked in the spool
//! - `tag_overflow_total{tag}` - tag values collapsed to OVERFLOW

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge,
};

lazy_static! {
    pub static ref POINTS_WRITTEN: IntCounterVec = register_int_counter_vec!(
        "points_written_total",
        "Points confirmed written to the time-series store",
        &["measurement"]
    )
    .expect("register points_written_total");

    pub static ref WRITE_RETRIES: IntCounterVec = register_int_counter_vec!(
        "write_retries_total",
        "Retriable write failures",
        &["measurement"]
    )
    .expect("register write_retries_total");

    pub static ref WRITE_DROPPED: IntCounterVec = register_int_counter_vec!(
        "write_dropped_total",
        "Batches dropped on non-retriable write rejection",
        &["measurement"]
    )
    .expect("register write_dropped_total");

    pub static ref IN_FLIGHT_BYTES: IntGauge = register_int_gauge!(
        "writer_in_flight_bytes",
        "Bytes held by accumulating batches and the retry queue"
    )
    .expect("register writer_in_flight_bytes");

    pub static ref BATCHES_SPOOLED: IntCounterVec = register_int_counter_vec!(
        "batches_spooled_total",
        "Batches parked in the failed-batch spool",
        &["measurement"]
    )
    .expect("register batches_spooled_total");

    pub static ref TAG_OVERFLOW: IntCounterVec = register_int_counter_vec!(
        "tag_overflow_total",
        "Tag values collapsed to OVERFLOW at the cardinality bound",
        &["tag"]
    )
    .expect("register tag_overflow_total");
}
