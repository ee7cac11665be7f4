//! Replica reconciliation and the master-bucket lifecycle.
//!
//! Metadata is the source of desired state: edges are written first, then
//! the backends are driven towards them. Anything that blocks establishing a
//! copy (creating the bucket, mirroring into it) aborts the unit of work.
//! Cleanup of copies that are no longer wanted only warns.

use crate::{
    errors::{ServiceError, ServiceResult},
    models::{
        bucket::{Bucket, BucketView, EditBucket, NewBucket, ReplicaLocation},
        storage_deployment::StorageDeployment,
    },
    services::{
        metadata,
        orchestrator::Orchestrator,
        placement,
        policy_store::{
            self, PolicyScope, REPLICA_LOCATIONS, ReplicaPolicy, TARGET_REPLICA_COUNT, ZONES,
        },
    },
};
use sqlx::SqliteConnection;
use std::collections::BTreeSet;
use tracing::{info, warn};

const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

/// Edges changed by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaDiff {
    pub added: Vec<i64>,
    pub removed: Vec<i64>,
}

impl ReplicaDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// S3 bucket naming rules: 3-63 characters of lowercase letters, digits,
/// dots and hyphens, alphanumeric at both ends, not an IPv4 address.
pub fn validate_bucket_name(name: &str) -> ServiceResult<()> {
    let invalid = |reason: &str| -> ServiceResult<()> {
        Err(ServiceError::validation(format!(
            "bucket name `{}` {}",
            name, reason
        )))
    };

    if name.len() < BUCKET_NAME_MIN_LEN || name.len() > BUCKET_NAME_MAX_LEN {
        return invalid("must be between 3 and 63 characters");
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return invalid("may only contain lowercase letters, digits, dots and hyphens");
    }
    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return invalid("must start and end with a letter or digit");
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return invalid("cannot contain consecutive dots or dot-hyphen pairs");
    }
    if is_ipv4_like(name) {
        return invalid("must not look like an IP address");
    }
    Ok(())
}

fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

impl Orchestrator {
    /// Create `bucket` on `storage` unless it already exists there.
    pub async fn ensure_bucket_creation(
        &self,
        storage: &StorageDeployment,
        bucket: &str,
    ) -> ServiceResult<()> {
        if !self.backend.bucket_exists(storage, bucket).await? {
            info!(bucket, storage = %storage.alias, "creating bucket");
            self.backend.create_bucket(storage, bucket).await?;
        }
        Ok(())
    }

    /// Force-delete `bucket` on `storage` if it exists there.
    pub async fn ensure_bucket_deletion(
        &self,
        storage: &StorageDeployment,
        bucket: &str,
    ) -> ServiceResult<()> {
        if self.backend.bucket_exists(storage, bucket).await? {
            info!(bucket, storage = %storage.alias, "deleting bucket");
            self.backend.delete_bucket(storage, bucket).await?;
        }
        Ok(())
    }

    /// Subscribe the bucket's home copy to change events on our webhook
    /// queue. Skipped, with a warning, when onboarding found no such queue.
    pub async fn setup_bucket_notifications(
        &self,
        home: &StorageDeployment,
        bucket: &Bucket,
    ) -> ServiceResult<()> {
        if home.event_queue_id.is_empty() {
            warn!(bucket = %bucket.name, storage = %home.alias, "no webhook event queue; notifications not configured");
            return Ok(());
        }
        self.backend
            .add_bucket_notification(home, &bucket.name, &home.event_queue_id)
            .await?;
        Ok(())
    }

    /// Mirror the home copy of `bucket` onto every current replica. Failures
    /// are logged per replica; the next event retries.
    pub async fn replicate_bucket(
        &self,
        conn: &mut SqliteConnection,
        bucket: &Bucket,
    ) -> ServiceResult<()> {
        let home = metadata::get_storage(conn, bucket.storage_id).await?;
        for storage_id in metadata::list_replica_ids(conn, bucket.id).await? {
            let replica = metadata::get_storage(conn, storage_id).await?;
            match self.backend.mirror(&home, &replica, &bucket.name).await {
                Ok(elapsed) => info!(
                    bucket = %bucket.name,
                    storage_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "replica mirrored"
                ),
                Err(err) => warn!(
                    bucket = %bucket.name,
                    storage_id,
                    error = %err,
                    "mirroring to replica failed"
                ),
            }
        }
        Ok(())
    }

    async fn add_replica(
        &self,
        conn: &mut SqliteConnection,
        bucket: &Bucket,
        storage_id: i64,
    ) -> ServiceResult<()> {
        metadata::insert_replica_location(
            conn,
            ReplicaLocation {
                bucket_id: bucket.id,
                storage_id,
            },
        )
        .await?;

        let replica = metadata::get_storage(conn, storage_id).await?;
        self.ensure_bucket_creation(&replica, &bucket.name).await?;

        let home = metadata::get_storage(conn, bucket.storage_id).await?;
        let elapsed = self.backend.mirror(&home, &replica, &bucket.name).await?;
        info!(
            bucket = %bucket.name,
            storage_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "replica added"
        );

        self.refresh_load_balancer(conn).await
    }

    /// Drop the replica edge. The remote copy is force-deleted only when
    /// `delete_remote` is set.
    async fn remove_replica(
        &self,
        conn: &mut SqliteConnection,
        bucket: &Bucket,
        storage_id: i64,
        delete_remote: bool,
    ) -> ServiceResult<()> {
        metadata::delete_replica_location(
            conn,
            ReplicaLocation {
                bucket_id: bucket.id,
                storage_id,
            },
        )
        .await?;

        if delete_remote {
            let replica = metadata::get_storage(conn, storage_id).await?;
            if let Err(err) = self.ensure_bucket_deletion(&replica, &bucket.name).await {
                warn!(bucket = %bucket.name, storage_id, error = %err, "replica copy not deleted");
            }
        }
        info!(bucket = %bucket.name, storage_id, delete_remote, "replica removed");

        self.refresh_load_balancer(conn).await
    }

    /// Converge the replica edges of `bucket` onto `desired`.
    pub async fn set_replicas(
        &self,
        conn: &mut SqliteConnection,
        bucket: &Bucket,
        desired: &[i64],
    ) -> ServiceResult<ReplicaDiff> {
        if desired.contains(&bucket.storage_id) {
            return Err(ServiceError::validation(format!(
                "bucket `{}` cannot be replicated onto its home deployment",
                bucket.name
            )));
        }

        let existing: BTreeSet<i64> = metadata::list_replica_ids(conn, bucket.id)
            .await?
            .into_iter()
            .collect();
        let wanted: BTreeSet<i64> = desired.iter().copied().collect();

        let mut diff = ReplicaDiff::default();
        for storage_id in desired {
            if !existing.contains(storage_id) && !diff.added.contains(storage_id) {
                self.add_replica(conn, bucket, *storage_id).await?;
                diff.added.push(*storage_id);
            }
        }
        for storage_id in existing.difference(&wanted) {
            self.remove_replica(conn, bucket, *storage_id, true).await?;
            diff.removed.push(*storage_id);
        }
        Ok(diff)
    }

    pub async fn resolve_bucket_replicas(
        &self,
        conn: &mut SqliteConnection,
        bucket: &Bucket,
    ) -> ServiceResult<ReplicaDiff> {
        let desired = placement::resolve_desired_replicas(conn, bucket).await?;
        self.set_replicas(conn, bucket, &desired).await
    }

    /// Re-resolve every bucket, e.g. after cluster zones changed.
    pub async fn resolve_all_buckets(&self, conn: &mut SqliteConnection) -> ServiceResult<()> {
        for bucket in metadata::list_buckets(conn).await? {
            self.resolve_bucket_replicas(conn, &bucket).await?;
        }
        Ok(())
    }

    /// Provision a bucket homed at `new.storage_id` and converge its
    /// replicas. An existing bucket of the same name is kept as is, including
    /// its policies.
    pub async fn add_master_bucket(
        &self,
        conn: &mut SqliteConnection,
        new: &NewBucket,
    ) -> ServiceResult<Bucket> {
        validate_bucket_name(&new.name)?;

        let bucket = match metadata::find_bucket_by_name(conn, &new.name).await? {
            Some(existing) => existing,
            None => {
                metadata::get_storage(conn, new.storage_id).await?;
                placement::validate_explicit_replicas(conn, new.storage_id, &new.replica_locations)
                    .await?;

                let bucket = metadata::insert_bucket(conn, new.storage_id, &new.name).await?;
                let scope = PolicyScope::Bucket(bucket.id);
                if let Some(zones) = &new.zones {
                    policy_store::set(conn, scope, ZONES, zones).await?;
                }
                if new.target_replica_count != 0 {
                    policy_store::set(conn, scope, TARGET_REPLICA_COUNT, &new.target_replica_count)
                        .await?;
                }
                if !new.replica_locations.is_empty() {
                    policy_store::set(conn, scope, REPLICA_LOCATIONS, &new.replica_locations)
                        .await?;
                }
                info!(bucket = %bucket.name, storage_id = bucket.storage_id, "master bucket registered");
                bucket
            }
        };

        let home = metadata::get_storage(conn, bucket.storage_id).await?;
        self.ensure_bucket_creation(&home, &bucket.name).await?;
        self.setup_bucket_notifications(&home, &bucket).await?;
        self.refresh_load_balancer(conn).await?;
        self.track_bucket_objects(conn, &bucket).await?;
        self.resolve_bucket_replicas(conn, &bucket).await?;

        Ok(bucket)
    }

    /// Replace the placement policy of a bucket and re-resolve it.
    pub async fn edit_master_bucket(
        &self,
        conn: &mut SqliteConnection,
        edit: &EditBucket,
    ) -> ServiceResult<Bucket> {
        let bucket = metadata::get_bucket(conn, edit.id).await?;
        let scope = PolicyScope::Bucket(bucket.id);

        policy_store::set(conn, scope, TARGET_REPLICA_COUNT, &edit.target_replica_count).await?;
        if let Some(zones) = &edit.zones {
            policy_store::set(conn, scope, ZONES, zones).await?;
        }
        if edit.replica_locations.is_empty() {
            policy_store::delete(conn, scope, REPLICA_LOCATIONS).await?;
        } else {
            placement::validate_explicit_replicas(conn, bucket.storage_id, &edit.replica_locations)
                .await?;
            policy_store::set(conn, scope, REPLICA_LOCATIONS, &edit.replica_locations).await?;
        }

        self.resolve_bucket_replicas(conn, &bucket).await?;
        Ok(bucket)
    }

    pub async fn list_master_buckets(
        &self,
        conn: &mut SqliteConnection,
    ) -> ServiceResult<Vec<BucketView>> {
        let mut views = Vec::new();
        for bucket in metadata::list_buckets(conn).await? {
            let policy = ReplicaPolicy::load(conn, bucket.id).await?;
            let replicas = metadata::list_replica_ids(conn, bucket.id).await?;
            views.push(BucketView {
                bucket,
                target_replica_count: policy.target_replica_count,
                zones: policy.zones,
                replica_locations: policy.replica_locations,
                replicas,
            });
        }
        Ok(views)
    }

    /// Remove every replica, then the master copy and the bucket row.
    pub async fn delete_master_bucket(
        &self,
        conn: &mut SqliteConnection,
        bucket: &Bucket,
    ) -> ServiceResult<()> {
        self.remove_master_bucket(conn, bucket, true).await
    }

    pub async fn delete_master_bucket_by_id(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: i64,
    ) -> ServiceResult<()> {
        let bucket = metadata::get_bucket(conn, bucket_id).await?;
        self.delete_master_bucket(conn, &bucket).await
    }

    /// Shared by bucket deletion and storage decommissioning, which keeps
    /// the remote master and replica copies unless the removal is permanent.
    pub(crate) async fn remove_master_bucket(
        &self,
        conn: &mut SqliteConnection,
        bucket: &Bucket,
        delete_remote: bool,
    ) -> ServiceResult<()> {
        for storage_id in metadata::list_replica_ids(conn, bucket.id).await? {
            self.remove_replica(conn, bucket, storage_id, delete_remote).await?;
        }

        if delete_remote {
            let home = metadata::get_storage(conn, bucket.storage_id).await?;
            if let Err(err) = self.ensure_bucket_deletion(&home, &bucket.name).await {
                warn!(bucket = %bucket.name, error = %err, "master copy not deleted");
            }
        }

        metadata::delete_bucket(conn, bucket.id).await?;
        info!(bucket = %bucket.name, "master bucket deleted");

        self.refresh_load_balancer(conn).await
    }
}
