//! Prometheus metrics for aggregation jobs
//!
//! - `aggregate_job_runs_total{job, outcome}` - job executions
//! - `detector_rows_total{detector}` - aggregate rows emitted
//! - `detector_failures_total{detector}` - detectors that errored in a run

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec};

lazy_static! {
    pub static ref JOB_RUNS: IntCounterVec = register_int_counter_vec!(
        "aggregate_job_runs_total",
        "Aggregation job executions by outcome",
        &["job", "outcome"]
    )
    .expect("register aggregate_job_runs_total");

    pub static ref DETECTOR_ROWS: IntCounterVec = register_int_counter_vec!(
        "detector_rows_total",
        "Aggregate rows emitted per detector",
        &["detector"]
    )
    .expect("register detector_rows_total");

    pub static ref DETECTOR_FAILURES: IntCounterVec = register_int_counter_vec!(
        "detector_failures_total",
        "Detector failures (other detectors continue)",
        &["detector"]
    )
    .expect("register detector_failures_total");
}
