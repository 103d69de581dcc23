//! Prometheus metrics for the connection manager
//!
//! - `ha_connects_total{endpoint, outcome}` - connection attempts
//! - `ha_reconnects_total{endpoint}` - sessions re-acquired after loss
//! - `ha_breaker_state{endpoint}` - 0=Closed, 1=Open, 2=Half-Open
//! - `ha_keepalive_failures_total{endpoint}` - missed pongs
//! - `ha_session_frames_dropped_total{endpoint}` - inbound frames dropped
//!   because a subscriber channel was full

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec,
};

lazy_static! {
    pub static ref CONNECTS: IntCounterVec = register_int_counter_vec!(
        "ha_connects_total",
        "Connection attempts by endpoint and outcome",
        &["endpoint", "outcome"]
    )
    .expect("register ha_connects_total");

    pub static ref RECONNECTS: IntCounterVec = register_int_counter_vec!(
        "ha_reconnects_total",
        "Sessions re-acquired after a session loss",
        &["endpoint"]
    )
    .expect("register ha_reconnects_total");

    pub static ref BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        "ha_breaker_state",
        "Circuit breaker state (0=Closed, 1=Open, 2=Half-Open)",
        &["endpoint"]
    )
    .expect("register ha_breaker_state");

    pub static ref KEEPALIVE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "ha_keepalive_failures_total",
        "Pings without a pong within the liveness window",
        &["endpoint"]
    )
    .expect("register ha_keepalive_failures_total");

    pub static ref SESSION_FRAMES_DROPPED: IntCounterVec = register_int_counter_vec!(
        "ha_session_frames_dropped_total",
        "Inbound frames dropped because the subscriber channel was full",
        &["endpoint"]
    )
    .expect("register ha_session_frames_dropped_total");
}

use crate::breaker::BreakerState;

pub fn set_breaker_state(endpoint: &str, state: BreakerState) {
    let value = match state {
        BreakerState::Closed => 0,
        BreakerState::Open => 1,
        BreakerState::HalfOpen => 2,
    };
    BREAKER_STATE.with_label_values(&[endpoint]).set(value);
}
