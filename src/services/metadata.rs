//! Relational metadata: clusters, deployments, buckets, replica edges and
//! the tracked object cache.
//!
//! Every function takes the caller's session (`&mut SqliteConnection`, usually
//! a transaction) so a whole mutation commits or rolls back together.

use crate::{
    errors::{ServiceError, ServiceResult},
    models::{
        bucket::{Bucket, ReplicaLocation},
        cluster::Cluster,
        faas_deployment::FaaSDeployment,
        object::ObjectRecord,
        storage_deployment::{NewStorageDeployment, StorageDeployment},
    },
};
use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

const STORAGE_COLUMNS: &str = "id, cluster_id, alias, endpoint, access_key, secret_key, use_ssl, \
                               deployment_id, event_queue_id, management_url";

/// Map `RowNotFound` onto the domain's not-found error.
fn not_found(what: impl FnOnce() -> String) -> impl FnOnce(sqlx::Error) -> ServiceError {
    move |err| match err {
        sqlx::Error::RowNotFound => ServiceError::NotFound(what()),
        other => ServiceError::Store(other),
    }
}

// --- clusters ---

pub async fn list_clusters(conn: &mut SqliteConnection) -> ServiceResult<Vec<Cluster>> {
    Ok(
        sqlx::query_as::<_, Cluster>("SELECT id, name, created_at FROM clusters ORDER BY id")
            .fetch_all(&mut *conn)
            .await?,
    )
}

pub async fn count_clusters(conn: &mut SqliteConnection) -> ServiceResult<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM clusters")
        .fetch_one(&mut *conn)
        .await?)
}

pub async fn get_cluster(conn: &mut SqliteConnection, id: i64) -> ServiceResult<Cluster> {
    sqlx::query_as::<_, Cluster>("SELECT id, name, created_at FROM clusters WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(not_found(|| format!("cluster {}", id)))
}

pub async fn find_cluster_by_name(
    conn: &mut SqliteConnection,
    name: &str,
) -> ServiceResult<Option<Cluster>> {
    Ok(
        sqlx::query_as::<_, Cluster>("SELECT id, name, created_at FROM clusters WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn insert_cluster(conn: &mut SqliteConnection, name: &str) -> ServiceResult<Cluster> {
    Ok(sqlx::query_as::<_, Cluster>(
        "INSERT INTO clusters (name, created_at) VALUES (?, ?) RETURNING id, name, created_at",
    )
    .bind(name)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?)
}

pub async fn delete_cluster(conn: &mut SqliteConnection, id: i64) -> ServiceResult<()> {
    sqlx::query("DELETE FROM clusters WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// --- storage deployments ---

pub async fn list_storage_deployments(
    conn: &mut SqliteConnection,
) -> ServiceResult<Vec<StorageDeployment>> {
    let sql = format!("SELECT {} FROM storage_deployments ORDER BY id", STORAGE_COLUMNS);
    Ok(sqlx::query_as::<_, StorageDeployment>(&sql)
        .fetch_all(&mut *conn)
        .await?)
}

pub async fn list_storage_for_cluster(
    conn: &mut SqliteConnection,
    cluster_id: i64,
) -> ServiceResult<Vec<StorageDeployment>> {
    let sql = format!(
        "SELECT {} FROM storage_deployments WHERE cluster_id = ? ORDER BY id",
        STORAGE_COLUMNS
    );
    Ok(sqlx::query_as::<_, StorageDeployment>(&sql)
        .bind(cluster_id)
        .fetch_all(&mut *conn)
        .await?)
}

pub async fn get_storage(conn: &mut SqliteConnection, id: i64) -> ServiceResult<StorageDeployment> {
    let sql = format!("SELECT {} FROM storage_deployments WHERE id = ?", STORAGE_COLUMNS);
    sqlx::query_as::<_, StorageDeployment>(&sql)
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(not_found(|| format!("storage deployment {}", id)))
}

pub async fn find_storage_by_endpoint(
    conn: &mut SqliteConnection,
    endpoint: &str,
) -> ServiceResult<Option<StorageDeployment>> {
    let sql = format!(
        "SELECT {} FROM storage_deployments WHERE endpoint = ?",
        STORAGE_COLUMNS
    );
    Ok(sqlx::query_as::<_, StorageDeployment>(&sql)
        .bind(endpoint)
        .fetch_optional(&mut *conn)
        .await?)
}

pub async fn find_storage_by_alias(
    conn: &mut SqliteConnection,
    alias: &str,
) -> ServiceResult<Option<StorageDeployment>> {
    let sql = format!("SELECT {} FROM storage_deployments WHERE alias = ?", STORAGE_COLUMNS);
    Ok(sqlx::query_as::<_, StorageDeployment>(&sql)
        .bind(alias)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Look a deployment up by the identity the backend stamps on its events.
pub async fn find_storage_by_deployment_id(
    conn: &mut SqliteConnection,
    deployment_id: &str,
) -> ServiceResult<Option<StorageDeployment>> {
    if deployment_id.is_empty() {
        return Ok(None);
    }
    let sql = format!(
        "SELECT {} FROM storage_deployments WHERE deployment_id = ? ORDER BY id LIMIT 1",
        STORAGE_COLUMNS
    );
    Ok(sqlx::query_as::<_, StorageDeployment>(&sql)
        .bind(deployment_id)
        .fetch_optional(&mut *conn)
        .await?)
}

pub async fn insert_storage(
    conn: &mut SqliteConnection,
    new: &NewStorageDeployment,
    deployment_id: &str,
    event_queue_id: &str,
) -> ServiceResult<StorageDeployment> {
    let sql = format!(
        "INSERT INTO storage_deployments (cluster_id, alias, endpoint, access_key, secret_key, \
         use_ssl, deployment_id, event_queue_id, management_url) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {}",
        STORAGE_COLUMNS
    );
    Ok(sqlx::query_as::<_, StorageDeployment>(&sql)
        .bind(new.cluster_id)
        .bind(&new.alias)
        .bind(&new.endpoint)
        .bind(&new.access_key)
        .bind(&new.secret_key)
        .bind(new.use_ssl)
        .bind(deployment_id)
        .bind(event_queue_id)
        .bind(&new.management_url)
        .fetch_one(&mut *conn)
        .await?)
}

pub async fn update_storage_identity(
    conn: &mut SqliteConnection,
    id: i64,
    deployment_id: &str,
    event_queue_id: &str,
) -> ServiceResult<()> {
    sqlx::query("UPDATE storage_deployments SET deployment_id = ?, event_queue_id = ? WHERE id = ?")
        .bind(deployment_id)
        .bind(event_queue_id)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn delete_storage(conn: &mut SqliteConnection, id: i64) -> ServiceResult<()> {
    sqlx::query("DELETE FROM storage_deployments WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// --- function deployments ---

pub async fn list_faas(conn: &mut SqliteConnection) -> ServiceResult<Vec<FaaSDeployment>> {
    Ok(sqlx::query_as::<_, FaaSDeployment>(
        "SELECT id, cluster_id, url FROM faas_deployments ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn list_faas_for_cluster(
    conn: &mut SqliteConnection,
    cluster_id: i64,
) -> ServiceResult<Vec<FaaSDeployment>> {
    Ok(sqlx::query_as::<_, FaaSDeployment>(
        "SELECT id, cluster_id, url FROM faas_deployments WHERE cluster_id = ? ORDER BY id",
    )
    .bind(cluster_id)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn get_faas(conn: &mut SqliteConnection, id: i64) -> ServiceResult<FaaSDeployment> {
    sqlx::query_as::<_, FaaSDeployment>(
        "SELECT id, cluster_id, url FROM faas_deployments WHERE id = ?",
    )
    .bind(id)
    .fetch_one(&mut *conn)
    .await
    .map_err(not_found(|| format!("function deployment {}", id)))
}

pub async fn insert_faas(
    conn: &mut SqliteConnection,
    cluster_id: i64,
    url: &str,
) -> ServiceResult<FaaSDeployment> {
    Ok(sqlx::query_as::<_, FaaSDeployment>(
        "INSERT INTO faas_deployments (cluster_id, url) VALUES (?, ?) RETURNING id, cluster_id, url",
    )
    .bind(cluster_id)
    .bind(url)
    .fetch_one(&mut *conn)
    .await?)
}

pub async fn update_faas_url(conn: &mut SqliteConnection, id: i64, url: &str) -> ServiceResult<()> {
    let result = sqlx::query("UPDATE faas_deployments SET url = ? WHERE id = ?")
        .bind(url)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ServiceError::not_found(format!("function deployment {}", id)));
    }
    Ok(())
}

pub async fn delete_faas(conn: &mut SqliteConnection, id: i64) -> ServiceResult<()> {
    sqlx::query("DELETE FROM faas_deployments WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// --- buckets ---

pub async fn list_buckets(conn: &mut SqliteConnection) -> ServiceResult<Vec<Bucket>> {
    Ok(sqlx::query_as::<_, Bucket>(
        "SELECT id, storage_id, name, created_at FROM buckets ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn list_buckets_homed_at(
    conn: &mut SqliteConnection,
    storage_id: i64,
) -> ServiceResult<Vec<Bucket>> {
    Ok(sqlx::query_as::<_, Bucket>(
        "SELECT id, storage_id, name, created_at FROM buckets WHERE storage_id = ? ORDER BY id",
    )
    .bind(storage_id)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn get_bucket(conn: &mut SqliteConnection, id: i64) -> ServiceResult<Bucket> {
    sqlx::query_as::<_, Bucket>("SELECT id, storage_id, name, created_at FROM buckets WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(not_found(|| format!("bucket {}", id)))
}

pub async fn find_bucket_by_name(
    conn: &mut SqliteConnection,
    name: &str,
) -> ServiceResult<Option<Bucket>> {
    Ok(sqlx::query_as::<_, Bucket>(
        "SELECT id, storage_id, name, created_at FROM buckets WHERE name = ?",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?)
}

pub async fn insert_bucket(
    conn: &mut SqliteConnection,
    storage_id: i64,
    name: &str,
) -> ServiceResult<Bucket> {
    Ok(sqlx::query_as::<_, Bucket>(
        "INSERT INTO buckets (storage_id, name, created_at) VALUES (?, ?, ?) \
         RETURNING id, storage_id, name, created_at",
    )
    .bind(storage_id)
    .bind(name)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?)
}

pub async fn delete_bucket(conn: &mut SqliteConnection, id: i64) -> ServiceResult<()> {
    sqlx::query("DELETE FROM buckets WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// --- replica edges ---

/// Storage ids currently holding a replica of `bucket_id`, in id order.
pub async fn list_replica_ids(
    conn: &mut SqliteConnection,
    bucket_id: i64,
) -> ServiceResult<Vec<i64>> {
    Ok(sqlx::query_scalar(
        "SELECT storage_id FROM replica_locations WHERE bucket_id = ? ORDER BY storage_id",
    )
    .bind(bucket_id)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn list_replica_locations_at(
    conn: &mut SqliteConnection,
    storage_id: i64,
) -> ServiceResult<Vec<ReplicaLocation>> {
    Ok(sqlx::query_as::<_, ReplicaLocation>(
        "SELECT bucket_id, storage_id FROM replica_locations WHERE storage_id = ? ORDER BY bucket_id",
    )
    .bind(storage_id)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn list_replica_locations(
    conn: &mut SqliteConnection,
) -> ServiceResult<Vec<ReplicaLocation>> {
    Ok(sqlx::query_as::<_, ReplicaLocation>(
        "SELECT bucket_id, storage_id FROM replica_locations ORDER BY bucket_id, storage_id",
    )
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn insert_replica_location(
    conn: &mut SqliteConnection,
    location: ReplicaLocation,
) -> ServiceResult<()> {
    sqlx::query(
        "INSERT INTO replica_locations (bucket_id, storage_id) VALUES (?, ?) \
         ON CONFLICT(bucket_id, storage_id) DO NOTHING",
    )
    .bind(location.bucket_id)
    .bind(location.storage_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_replica_location(
    conn: &mut SqliteConnection,
    location: ReplicaLocation,
) -> ServiceResult<()> {
    sqlx::query("DELETE FROM replica_locations WHERE bucket_id = ? AND storage_id = ?")
        .bind(location.bucket_id)
        .bind(location.storage_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// --- tracked objects ---

pub async fn list_objects(
    conn: &mut SqliteConnection,
    bucket_id: i64,
) -> ServiceResult<Vec<ObjectRecord>> {
    Ok(sqlx::query_as::<_, ObjectRecord>(
        "SELECT id, bucket_id, name, tracked_at FROM objects WHERE bucket_id = ? ORDER BY name",
    )
    .bind(bucket_id)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn insert_object(
    conn: &mut SqliteConnection,
    bucket_id: i64,
    name: &str,
) -> ServiceResult<()> {
    sqlx::query(
        "INSERT INTO objects (id, bucket_id, name, tracked_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(bucket_id, name) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(bucket_id)
    .bind(name)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_object(conn: &mut SqliteConnection, id: Uuid) -> ServiceResult<()> {
    sqlx::query("DELETE FROM objects WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// --- bucket/function association ---

/// A bucket together with the function URLs co-located with its copies.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketFunctions {
    pub bucket_id: i64,
    pub bucket_name: String,
    /// Home-cluster functions first, then those of each replica's cluster.
    /// May contain duplicates; the routing generator de-duplicates.
    pub urls: Vec<String>,
}

/// Associate every bucket with the function deployments of each cluster that
/// holds a copy of it.
pub async fn bucket_function_urls(
    conn: &mut SqliteConnection,
) -> ServiceResult<Vec<BucketFunctions>> {
    let buckets = list_buckets(&mut *conn).await?;

    let rows: Vec<(i64, String)> = sqlx::query_as(
        "SELECT bucket_id, url FROM ( \
             SELECT b.id AS bucket_id, 0 AS tier, s.id AS storage_id, f.id AS faas_id, f.url AS url \
             FROM buckets b \
             JOIN storage_deployments s ON s.id = b.storage_id \
             JOIN faas_deployments f ON f.cluster_id = s.cluster_id \
             UNION ALL \
             SELECT r.bucket_id, 1, s.id, f.id, f.url \
             FROM replica_locations r \
             JOIN storage_deployments s ON s.id = r.storage_id \
             JOIN faas_deployments f ON f.cluster_id = s.cluster_id \
         ) ORDER BY bucket_id, tier, storage_id, faas_id",
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(buckets
        .into_iter()
        .map(|bucket| BucketFunctions {
            urls: rows
                .iter()
                .filter(|(bucket_id, _)| *bucket_id == bucket.id)
                .map(|(_, url)| url.clone())
                .collect(),
            bucket_id: bucket.id,
            bucket_name: bucket.name,
        })
        .collect())
}
