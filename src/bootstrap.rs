//! Startup reconciliation and first-run bootstrap from a JSON file.

use crate::{
    errors::{ServiceError, ServiceResult},
    models::{
        bucket::NewBucket, cluster::NewCluster, faas_deployment::NewFaaSDeployment,
        storage_deployment::NewStorageDeployment,
    },
    services::{metadata, orchestrator::Orchestrator},
};
use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::SqliteConnection;
use std::path::Path;
use tracing::{info, warn};

/// Initial federation layout, loaded once into an empty database.
#[derive(Debug, Default, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterEntry>,
    #[serde(default)]
    pub storage_deployments: Vec<StorageEntry>,
    #[serde(default)]
    pub faas_deployments: Vec<FaaSEntry>,
    #[serde(default)]
    pub buckets: Vec<BucketEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ClusterEntry {
    pub name: String,
    #[serde(default)]
    pub zones: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct StorageEntry {
    pub cluster_name: String,
    pub alias: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub management_url: String,
}

#[derive(Debug, Deserialize)]
pub struct FaaSEntry {
    pub cluster_name: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct BucketEntry {
    pub storage_alias: String,
    pub name: String,
    #[serde(default)]
    pub target_replica_count: u32,
    #[serde(default)]
    pub zones: Option<Vec<String>>,
}

pub fn load_config_file(path: impl AsRef<Path>) -> Result<BootstrapConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading bootstrap file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing bootstrap file {}", path.display()))
}

async fn cluster_id_by_name(conn: &mut SqliteConnection, name: &str) -> ServiceResult<i64> {
    metadata::find_cluster_by_name(conn, name)
        .await?
        .map(|c| c.id)
        .ok_or_else(|| ServiceError::not_found(format!("cluster `{}`", name)))
}

impl Orchestrator {
    /// Register everything in `config` on `conn`. Entries are applied in
    /// dependency order and the first invalid one aborts the whole load.
    pub async fn apply_bootstrap(
        &self,
        conn: &mut SqliteConnection,
        config: &BootstrapConfig,
    ) -> ServiceResult<()> {
        if config.clusters.is_empty() {
            return Err(ServiceError::validation("bootstrap defines no clusters"));
        }

        for entry in &config.clusters {
            self.add_cluster(
                conn,
                &NewCluster {
                    name: entry.name.clone(),
                    zones: entry.zones.clone(),
                },
            )
            .await?;
        }

        for entry in &config.faas_deployments {
            let cluster_id = cluster_id_by_name(conn, &entry.cluster_name).await?;
            self.add_faas_deployment(
                conn,
                &NewFaaSDeployment {
                    cluster_id,
                    url: entry.url.clone(),
                },
            )
            .await?;
        }

        for entry in &config.storage_deployments {
            let cluster_id = cluster_id_by_name(conn, &entry.cluster_name).await?;
            self.add_storage_deployment(
                conn,
                &NewStorageDeployment {
                    cluster_id,
                    alias: entry.alias.clone(),
                    endpoint: entry.endpoint.clone(),
                    access_key: entry.access_key.clone(),
                    secret_key: entry.secret_key.clone(),
                    use_ssl: entry.use_ssl,
                    management_url: entry.management_url.clone(),
                },
            )
            .await?;
        }

        for entry in &config.buckets {
            let storage = metadata::find_storage_by_alias(conn, &entry.storage_alias)
                .await?
                .ok_or_else(|| {
                    ServiceError::not_found(format!("storage deployment `{}`", entry.storage_alias))
                })?;
            self.add_master_bucket(
                conn,
                &NewBucket {
                    storage_id: storage.id,
                    name: entry.name.clone(),
                    target_replica_count: entry.target_replica_count,
                    zones: entry.zones.clone(),
                    replica_locations: Vec::new(),
                },
            )
            .await?;
        }

        info!(
            clusters = config.clusters.len(),
            storage_deployments = config.storage_deployments.len(),
            faas_deployments = config.faas_deployments.len(),
            buckets = config.buckets.len(),
            "bootstrap loaded"
        );
        Ok(())
    }

    /// Bring an existing federation back in line with the backends: each
    /// step runs in its own transaction and failures only warn.
    pub async fn reconcile_existing(&self) -> ServiceResult<()> {
        let storages = {
            let mut conn = self.db.acquire().await?;
            metadata::list_storage_deployments(&mut conn).await?
        };
        for storage in storages {
            let record = NewStorageDeployment {
                cluster_id: storage.cluster_id,
                alias: storage.alias.clone(),
                endpoint: storage.endpoint.clone(),
                access_key: storage.access_key.clone(),
                secret_key: storage.secret_key.clone(),
                use_ssl: storage.use_ssl,
                management_url: storage.management_url.clone(),
            };
            let onboarded = {
                let mut conn = self.db.acquire().await?;
                self.onboard_storage_deployment(&mut conn, &record).await
            };
            let info = match onboarded {
                Ok(info) => info,
                Err(err) => {
                    warn!(error = %err, storage = %storage.alias, "re-onboarding failed");
                    continue;
                }
            };
            let mut tx = self.begin_write().await?;
            match self.register_storage_deployment(&mut tx, &record, &info).await {
                Ok(_) => tx.commit().await?,
                Err(err) => {
                    warn!(error = %err, storage = %storage.alias, "re-onboarding failed")
                }
            }
        }

        let buckets = {
            let mut conn = self.db.acquire().await?;
            metadata::list_buckets(&mut conn).await?
        };
        for bucket in buckets {
            let mut tx = self.begin_write().await?;
            let outcome = match self.track_bucket_objects(&mut tx, &bucket).await {
                Ok(_) => self.resolve_bucket_replicas(&mut tx, &bucket).await.map(|_| ()),
                Err(err) => Err(err),
            };
            match outcome {
                Ok(_) => tx.commit().await?,
                Err(err) => warn!(error = %err, bucket = %bucket.name, "startup resync failed"),
            }
        }

        let mut conn = self.db.acquire().await?;
        if let Err(err) = self.configure_load_balancer(&mut conn).await {
            warn!(error = %err, "load balancer reconfiguration failed");
        }
        Ok(())
    }
}

/// Background startup task. `/readyz` turns green once it returns, whatever
/// the outcome.
pub async fn run_startup(orchestrator: Orchestrator, config_path: String) {
    if let Err(err) = startup(&orchestrator, &config_path).await {
        warn!(error = %err, "startup reconciliation incomplete");
    }
    orchestrator.mark_ready();
    info!("startup reconciliation finished");
}

async fn startup(orchestrator: &Orchestrator, config_path: &str) -> Result<()> {
    let existing = {
        let mut conn = orchestrator.db.acquire().await?;
        metadata::count_clusters(&mut conn).await?
    };

    if existing > 0 {
        info!(clusters = existing, "reconciling existing federation");
        orchestrator.reconcile_existing().await?;
        return Ok(());
    }

    let config = load_config_file(config_path)?;
    let mut tx = orchestrator.begin_write().await?;
    orchestrator.apply_bootstrap(&mut tx, &config).await?;
    tx.commit().await?;
    Ok(())
}
