//! Topology mutations: clusters, storage deployments and function
//! deployments, and the reconciliation each of them triggers.

use crate::{
    errors::{ServiceError, ServiceResult},
    models::{
        bucket::NewBucket,
        cluster::{Cluster, ClusterView, EditCluster, NewCluster},
        faas_deployment::{EditFaaSDeployment, FaaSDeployment, NewFaaSDeployment},
        storage_deployment::{NewStorageDeployment, StorageDeployment},
    },
    services::{
        backend::{BackendError, ServerInfo},
        metadata,
        orchestrator::Orchestrator,
        policy_store::{self, PolicyScope, ZONES},
    },
};
use sqlx::SqliteConnection;
use std::{collections::BTreeSet, time::Instant};
use tracing::{info, warn};

async fn validate_new_storage(
    conn: &mut SqliteConnection,
    new: &NewStorageDeployment,
) -> ServiceResult<()> {
    if new.alias.trim().is_empty() || new.endpoint.trim().is_empty() {
        return Err(ServiceError::validation("alias and endpoint are required"));
    }
    metadata::get_cluster(conn, new.cluster_id).await?;
    if metadata::find_storage_by_alias(conn, &new.alias).await?.is_some() {
        return Err(ServiceError::validation(format!(
            "alias `{}` is already in use",
            new.alias
        )));
    }
    Ok(())
}

/// The record `new` will become, for talking to its backend before it has
/// a row.
fn unregistered(new: &NewStorageDeployment) -> StorageDeployment {
    StorageDeployment {
        id: 0,
        cluster_id: new.cluster_id,
        alias: new.alias.clone(),
        endpoint: new.endpoint.clone(),
        access_key: new.access_key.clone(),
        secret_key: new.secret_key.clone(),
        use_ssl: new.use_ssl,
        deployment_id: String::new(),
        event_queue_id: String::new(),
        management_url: new.management_url.clone(),
    }
}

impl Orchestrator {
    /// Register a cluster, or return the existing one of that name untouched.
    pub async fn add_cluster(
        &self,
        conn: &mut SqliteConnection,
        new: &NewCluster,
    ) -> ServiceResult<Cluster> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(ServiceError::validation("cluster name is required"));
        }
        if let Some(existing) = metadata::find_cluster_by_name(conn, name).await? {
            return Ok(existing);
        }

        let cluster = metadata::insert_cluster(conn, name).await?;
        if !new.zones.is_empty() {
            policy_store::set(conn, PolicyScope::Cluster(cluster.id), ZONES, &new.zones).await?;
        }
        info!(cluster = %cluster.name, zones = ?new.zones, "cluster registered");
        Ok(cluster)
    }

    /// Replace the zones of a cluster and re-resolve every bucket.
    pub async fn edit_cluster(
        &self,
        conn: &mut SqliteConnection,
        edit: &EditCluster,
    ) -> ServiceResult<Cluster> {
        let cluster = metadata::get_cluster(conn, edit.id).await?;
        policy_store::set(conn, PolicyScope::Cluster(cluster.id), ZONES, &edit.zones).await?;
        self.resolve_all_buckets(conn).await?;
        Ok(cluster)
    }

    pub async fn cluster_zones(
        &self,
        conn: &mut SqliteConnection,
        cluster_id: i64,
    ) -> ServiceResult<Vec<String>> {
        Ok(policy_store::get(conn, PolicyScope::Cluster(cluster_id), ZONES)
            .await?
            .value)
    }

    pub async fn list_clusters(&self, conn: &mut SqliteConnection) -> ServiceResult<Vec<ClusterView>> {
        let mut views = Vec::new();
        for cluster in metadata::list_clusters(conn).await? {
            let zones = self.cluster_zones(conn, cluster.id).await?;
            views.push(ClusterView { cluster, zones });
        }
        Ok(views)
    }

    /// Remove a cluster with every storage and function deployment it owns.
    pub async fn delete_cluster(
        &self,
        conn: &mut SqliteConnection,
        cluster_id: i64,
        permanent: bool,
    ) -> ServiceResult<()> {
        let cluster = metadata::get_cluster(conn, cluster_id).await?;

        for storage in metadata::list_storage_for_cluster(conn, cluster.id).await? {
            self.delete_storage_deployment(conn, &storage, permanent).await?;
        }
        for faas in metadata::list_faas_for_cluster(conn, cluster.id).await? {
            metadata::delete_faas(conn, faas.id).await?;
        }
        metadata::delete_cluster(conn, cluster.id).await?;
        info!(cluster = %cluster.name, permanent, "cluster deleted");

        self.refresh_load_balancer(conn).await
    }

    /// Point the backend at our webhook, restart it and wait until it
    /// reports its identity again.
    pub async fn onboard_backend(&self, storage: &StorageDeployment) -> ServiceResult<ServerInfo> {
        self.backend.configure_alias(storage).await?;
        self.backend
            .set_notification_target(storage, &self.webhook_url)
            .await?;
        self.backend.restart_service(storage).await?;
        info!(storage = %storage.alias, "restarting storage deployment");

        let started = Instant::now();
        let mut last_err = None;
        for attempt in 1..=self.readiness.attempts {
            tokio::time::sleep(self.readiness.interval).await;
            match self.backend.server_info(storage).await {
                Ok(info) => {
                    info!(
                        storage = %storage.alias,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "storage deployment restarted"
                    );
                    return Ok(info);
                }
                Err(err) => {
                    warn!(storage = %storage.alias, attempt, error = %err, "storage deployment not ready");
                    last_err = Some(err);
                }
            }
        }

        if let Some(err) = last_err {
            warn!(storage = %storage.alias, error = %err, "giving up on storage deployment");
        }
        Err(BackendError::NotReady {
            alias: storage.alias.clone(),
            attempts: self.readiness.attempts,
        }
        .into())
    }

    /// Onboard a storage deployment (or re-onboard the one already known at
    /// that endpoint) and adopt the buckets it holds.
    ///
    /// Buckets unknown to the federation become master buckets homed here.
    /// Buckets already homed elsewhere become replicas.
    pub async fn add_storage_deployment(
        &self,
        conn: &mut SqliteConnection,
        new: &NewStorageDeployment,
    ) -> ServiceResult<StorageDeployment> {
        let info = self.onboard_storage_deployment(conn, new).await?;
        self.register_storage_deployment(conn, new, &info).await
    }

    /// Validate `new` and bring its backend up (alias, webhook target,
    /// restart, readiness poll). Only reads from `conn`, so callers can run
    /// it outside a write transaction.
    pub async fn onboard_storage_deployment(
        &self,
        conn: &mut SqliteConnection,
        new: &NewStorageDeployment,
    ) -> ServiceResult<ServerInfo> {
        let storage = match metadata::find_storage_by_endpoint(conn, &new.endpoint).await? {
            Some(existing) => existing,
            None => {
                validate_new_storage(conn, new).await?;
                unregistered(new)
            }
        };
        self.onboard_backend(&storage).await
    }

    /// Persist a storage deployment whose backend reported `info`, then
    /// adopt the buckets it holds.
    pub async fn register_storage_deployment(
        &self,
        conn: &mut SqliteConnection,
        new: &NewStorageDeployment,
        info: &ServerInfo,
    ) -> ServiceResult<StorageDeployment> {
        let queue = info.webhook_queue().unwrap_or_default();
        if queue.is_empty() {
            warn!(storage = %new.alias, "backend reports no webhook event queue");
        }

        let storage = match metadata::find_storage_by_endpoint(conn, &new.endpoint).await? {
            Some(mut existing) => {
                metadata::update_storage_identity(conn, existing.id, &info.deployment_id, queue)
                    .await?;
                existing.deployment_id = info.deployment_id.clone();
                existing.event_queue_id = queue.to_string();
                existing
            }
            None => {
                // Checked again: another writer may have taken the alias
                // while the backend was restarting.
                validate_new_storage(conn, new).await?;
                metadata::insert_storage(conn, new, &info.deployment_id, queue).await?
            }
        };

        self.adopt_buckets(conn, &storage).await?;
        Ok(storage)
    }

    /// Register what the backend already holds.
    async fn adopt_buckets(
        &self,
        conn: &mut SqliteConnection,
        storage: &StorageDeployment,
    ) -> ServiceResult<()> {
        for name in self.backend.list_buckets(storage).await? {
            match metadata::find_bucket_by_name(conn, &name).await? {
                Some(bucket) if bucket.storage_id != storage.id => {
                    let existing = metadata::list_replica_ids(conn, bucket.id).await?;
                    if !existing.contains(&storage.id) {
                        info!(bucket = %name, storage = %storage.alias, "adopting replica");
                        let mut desired = existing;
                        desired.push(storage.id);
                        self.set_replicas(conn, &bucket, &desired).await?;
                    }
                }
                Some(_) => {}
                None => {
                    info!(bucket = %name, storage = %storage.alias, "adopting master bucket");
                    self.add_master_bucket(
                        conn,
                        &NewBucket {
                            storage_id: storage.id,
                            name,
                            ..Default::default()
                        },
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Decommission a storage deployment.
    ///
    /// Buckets homed here leave the federation (their remote master is kept
    /// unless `permanent`). Replica edges pointing here are dropped and the
    /// affected buckets re-resolved, so placement may pick a new replica.
    pub async fn delete_storage_deployment(
        &self,
        conn: &mut SqliteConnection,
        storage: &StorageDeployment,
        permanent: bool,
    ) -> ServiceResult<()> {
        for bucket in metadata::list_buckets_homed_at(conn, storage.id).await? {
            self.remove_master_bucket(conn, &bucket, permanent).await?;
        }

        let mut affected = BTreeSet::new();
        for location in metadata::list_replica_locations_at(conn, storage.id).await? {
            let bucket = metadata::get_bucket(conn, location.bucket_id).await?;
            metadata::delete_replica_location(conn, location).await?;
            if permanent {
                if let Err(err) = self.ensure_bucket_deletion(storage, &bucket.name).await {
                    warn!(bucket = %bucket.name, storage = %storage.alias, error = %err, "replica copy not deleted");
                }
            }
            affected.insert(location.bucket_id);
        }

        metadata::delete_storage(conn, storage.id).await?;
        info!(storage = %storage.alias, permanent, "storage deployment deleted");

        for bucket_id in affected {
            let bucket = metadata::get_bucket(conn, bucket_id).await?;
            self.resolve_bucket_replicas(conn, &bucket).await?;
        }
        self.refresh_load_balancer(conn).await
    }

    pub async fn delete_storage_deployment_by_id(
        &self,
        conn: &mut SqliteConnection,
        storage_id: i64,
        permanent: bool,
    ) -> ServiceResult<()> {
        let storage = metadata::get_storage(conn, storage_id).await?;
        self.delete_storage_deployment(conn, &storage, permanent).await
    }

    pub async fn add_faas_deployment(
        &self,
        conn: &mut SqliteConnection,
        new: &NewFaaSDeployment,
    ) -> ServiceResult<FaaSDeployment> {
        let url = new.url.trim();
        if url.is_empty() {
            return Err(ServiceError::validation("function url is required"));
        }
        metadata::get_cluster(conn, new.cluster_id).await?;
        let faas = metadata::insert_faas(conn, new.cluster_id, url).await?;
        info!(url = %faas.url, cluster_id = faas.cluster_id, "function deployment registered");
        self.refresh_load_balancer(conn).await?;
        Ok(faas)
    }

    pub async fn edit_faas_deployment(
        &self,
        conn: &mut SqliteConnection,
        edit: &EditFaaSDeployment,
    ) -> ServiceResult<FaaSDeployment> {
        let url = edit.url.trim();
        if url.is_empty() {
            return Err(ServiceError::validation("function url is required"));
        }
        metadata::update_faas_url(conn, edit.id, url).await?;
        self.refresh_load_balancer(conn).await?;
        metadata::get_faas(conn, edit.id).await
    }

    pub async fn delete_faas_deployment(
        &self,
        conn: &mut SqliteConnection,
        faas_id: i64,
    ) -> ServiceResult<()> {
        let faas = metadata::get_faas(conn, faas_id).await?;
        metadata::delete_faas(conn, faas.id).await?;
        self.refresh_load_balancer(conn).await
    }
}
