//! Tracked object inventory.

use crate::{
    errors::ServiceResult,
    models::bucket::Bucket,
    services::{metadata, orchestrator::Orchestrator},
};
use sqlx::SqliteConnection;
use std::collections::HashSet;
use tracing::info;

/// Rows changed by one resync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InventoryDiff {
    pub inserted: usize,
    pub deleted: usize,
}

impl Orchestrator {
    /// Make the cached object list of `bucket` match what its home backend
    /// holds right now: a full rescan, never an incremental update.
    pub async fn track_bucket_objects(
        &self,
        conn: &mut SqliteConnection,
        bucket: &Bucket,
    ) -> ServiceResult<InventoryDiff> {
        let home = metadata::get_storage(conn, bucket.storage_id).await?;
        let cached = metadata::list_objects(conn, bucket.id).await?;
        let live: HashSet<String> = self
            .backend
            .list_objects(&home, &bucket.name)
            .await?
            .into_iter()
            .collect();

        let mut diff = InventoryDiff::default();
        let known: HashSet<&str> = cached.iter().map(|o| o.name.as_str()).collect();

        for name in live.iter().filter(|name| !known.contains(name.as_str())) {
            metadata::insert_object(conn, bucket.id, name).await?;
            diff.inserted += 1;
        }
        for stale in cached.iter().filter(|o| !live.contains(&o.name)) {
            metadata::delete_object(conn, stale.id).await?;
            diff.deleted += 1;
        }

        info!(
            bucket = %bucket.name,
            inserted = diff.inserted,
            deleted = diff.deleted,
            "object inventory synced"
        );
        Ok(diff)
    }
}
