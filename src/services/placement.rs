//! Placement: which storage deployments should hold a replica of a bucket.

use crate::{
    errors::{ServiceError, ServiceResult},
    models::bucket::Bucket,
    services::{
        metadata,
        policy_store::{self, PolicyScope, ReplicaPolicy, ZONES},
    },
};
use sqlx::SqliteConnection;
use std::collections::{BTreeSet, HashSet};
use tracing::warn;

/// Desired replica storage ids for `bucket`, in placement order.
///
/// An explicit `replica_locations` list wins outright. Otherwise the
/// candidates are the deployments of every non-home cluster whose zones
/// intersect the bucket's zones (any non-home cluster when the bucket has
/// none), and the first `target_replica_count` of them in listing order are
/// taken. The home deployment is never part of the result.
pub async fn resolve_desired_replicas(
    conn: &mut SqliteConnection,
    bucket: &Bucket,
) -> ServiceResult<Vec<i64>> {
    let policy = ReplicaPolicy::load(conn, bucket.id).await?;

    if let Some(explicit) = policy.replica_locations {
        let known: HashSet<i64> = metadata::list_storage_deployments(conn)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let mut seen = HashSet::new();
        return Ok(explicit
            .into_iter()
            .filter(|id| {
                if *id == bucket.storage_id || !known.contains(id) {
                    warn!(bucket = %bucket.name, storage_id = id, "ignoring unusable explicit replica location");
                    return false;
                }
                seen.insert(*id)
            })
            .collect());
    }

    if policy.target_replica_count == 0 {
        return Ok(Vec::new());
    }

    let home = metadata::get_storage(conn, bucket.storage_id).await?;
    let allowed: BTreeSet<String> = policy.zones.into_iter().collect();

    let mut candidate_clusters = HashSet::new();
    for cluster in metadata::list_clusters(conn).await? {
        if cluster.id == home.cluster_id {
            continue;
        }
        let eligible = allowed.is_empty() || {
            let zones = policy_store::get(conn, PolicyScope::Cluster(cluster.id), ZONES)
                .await?
                .value;
            zones.iter().any(|zone| allowed.contains(zone))
        };
        if eligible {
            candidate_clusters.insert(cluster.id);
        }
    }

    Ok(metadata::list_storage_deployments(conn)
        .await?
        .into_iter()
        .filter(|s| candidate_clusters.contains(&s.cluster_id))
        .map(|s| s.id)
        .take(policy.target_replica_count as usize)
        .collect())
}

pub async fn resolve_desired_replicas_by_id(
    conn: &mut SqliteConnection,
    bucket_id: i64,
) -> ServiceResult<Vec<i64>> {
    let bucket = metadata::get_bucket(conn, bucket_id).await?;
    resolve_desired_replicas(conn, &bucket).await
}

/// Reject an explicit replica list naming the home deployment or a
/// deployment that does not exist.
pub async fn validate_explicit_replicas(
    conn: &mut SqliteConnection,
    home_storage_id: i64,
    replicas: &[i64],
) -> ServiceResult<()> {
    for id in replicas {
        if *id == home_storage_id {
            return Err(ServiceError::validation(format!(
                "storage deployment {} is the bucket's home and cannot hold a replica",
                id
            )));
        }
        metadata::get_storage(conn, *id).await?;
    }
    Ok(())
}
