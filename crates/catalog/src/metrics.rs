//! Prometheus metrics for registry discovery
//!
//! - `registry_upserts_total{kind}` - rows written by sweeps and updates
//! - `registry_updates_total{kind, action}` - registry-update events applied
//! - `registry_unknown_device_total` - entities referencing unknown devices
//! - `registry_sweeps_total{outcome}` - reconciliation sweeps
//! - `catalog_tombstones_purged_total{kind}` - hard-deleted tombstones

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec};

lazy_static! {
    pub static ref REGISTRY_UPSERTS: IntCounterVec = register_int_counter_vec!(
        "registry_upserts_total",
        "Catalog rows upserted",
        &["kind"]
    )
    .expect("register registry_upserts_total");

    pub static ref REGISTRY_UPDATES: IntCounterVec = register_int_counter_vec!(
        "registry_updates_total",
        "Registry-update events applied",
        &["kind", "action"]
    )
    .expect("register registry_updates_total");

    pub static ref UNKNOWN_DEVICE_REFS: IntCounterVec = register_int_counter_vec!(
        "registry_unknown_device_total",
        "Entities accepted with a device_id the catalog has not seen",
        &["kind"]
    )
    .expect("register registry_unknown_device_total");

    pub static ref SWEEPS: IntCounterVec = register_int_counter_vec!(
        "registry_sweeps_total",
        "Reconciliation sweeps by outcome",
        &["outcome"]
    )
    .expect("register registry_sweeps_total");

    pub static ref TOMBSTONES_PURGED: IntCounterVec = register_int_counter_vec!(
        "catalog_tombstones_purged_total",
        "Soft-deleted rows hard-deleted after the grace period",
        &["kind"]
    )
    .expect("register catalog_tombstones_purged_total");
}
