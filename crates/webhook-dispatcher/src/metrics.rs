//! Prometheus metrics for webhook dispatch
//!
//! - `webhook_attempts_total{subscription}` - delivery attempts made
//! - `webhook_delivered_total{subscription}` - deliveries reaching 2xx
//! - `webhook_giving_up_total{subscription}` - deliveries past retry budget
//! - `webhook_mailbox_dropped_total{subscription}` - oldest-event drops on
//!   mailbox overflow
//! - `webhook_tee_lagged_total` - broadcast tee overruns

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    pub static ref ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "webhook_attempts_total",
        "Webhook delivery attempts",
        &["subscription"]
    )
    .expect("register webhook_attempts_total");

    pub static ref DELIVERED: IntCounterVec = register_int_counter_vec!(
        "webhook_delivered_total",
        "Webhook deliveries confirmed with 2xx",
        &["subscription"]
    )
    .expect("register webhook_delivered_total");

    pub static ref GIVING_UP: IntCounterVec = register_int_counter_vec!(
        "webhook_giving_up_total",
        "Webhook deliveries abandoned after the retry schedule",
        &["subscription"]
    )
    .expect("register webhook_giving_up_total");

    pub static ref MAILBOX_DROPPED: IntCounterVec = register_int_counter_vec!(
        "webhook_mailbox_dropped_total",
        "Oldest undelivered events dropped on mailbox overflow",
        &["subscription"]
    )
    .expect("register webhook_mailbox_dropped_total");

    pub static ref TEE_LAGGED: IntCounter = register_int_counter!(
        "webhook_tee_lagged_total",
        "Events missed because the dispatcher lagged the broadcast tee"
    )
    .expect("register webhook_tee_lagged_total");
}
