//! Retention pass
//!
//! Bucket expiration (raw 7d, daily 90d, weekly 52w) is enforced by the
//! storage layer itself; this component only reads and writes. What the
//! aggregator does own is the catalog side: tombstoned rows are
//! hard-deleted once they have gone the grace period without a registry
//! touch or a referring event.

use tracing::info;

use haflow_catalog::CatalogStore;

pub async fn run(catalog: &CatalogStore, grace_days: u32) -> anyhow::Result<u64> {
    let purged = catalog.purge_tombstones(grace_days).await?;
    if purged > 0 {
        info!(purged, grace_days, "catalog tombstones hard-deleted");
    }
    Ok(purged)
}
