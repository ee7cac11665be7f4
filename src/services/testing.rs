//! In-memory collaborators and fixtures for service tests.

use crate::{
    db::{self, memory_pool},
    models::{
        cluster::Cluster,
        load_balancer::ServerMap,
        storage_deployment::{NewStorageDeployment, StorageDeployment},
    },
    services::{
        backend::{BackendError, BackendResult, ServerInfo, StorageBackend},
        load_balancer::{LoadBalancer, ProxyAdmin, ProxyError},
        metadata,
        orchestrator::{Orchestrator, ReadinessPoll},
        policy_store::{self, PolicyScope, ZONES},
    },
};
use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

pub const WEBHOOK_QUEUE: &str = "arn:minio:sqs::fado:webhook";

#[derive(Default)]
struct BackendState {
    /// alias -> bucket -> object keys
    buckets: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    calls: Vec<String>,
    failing: BTreeSet<&'static str>,
    info: BTreeMap<String, ServerInfo>,
    info_failures: u32,
}

/// Storage backend keeping buckets in memory and recording every call as
/// `"<op> <alias>[/<bucket>]"`.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    fn record(&self, op: &'static str, target: String) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{} {}", op, target));
        if state.failing.contains(op) {
            return Err(BackendError::Command {
                command: format!("{} {}", op, target),
                status: 1,
                stderr: "injected failure".into(),
            });
        }
        Ok(())
    }

    /// Make every later call of `op` fail.
    pub fn fail(&self, op: &'static str) {
        self.state.lock().unwrap().failing.insert(op);
    }

    /// Fail the next `n` server info polls.
    pub fn fail_info_polls(&self, n: u32) {
        self.state.lock().unwrap().info_failures = n;
    }

    pub fn set_info(&self, alias: &str, info: ServerInfo) {
        self.state
            .lock()
            .unwrap()
            .info
            .insert(alias.to_string(), info);
    }

    pub fn put_bucket(&self, alias: &str, bucket: &str) {
        self.state
            .lock()
            .unwrap()
            .buckets
            .entry(alias.to_string())
            .or_default()
            .entry(bucket.to_string())
            .or_default();
    }

    pub fn put_object(&self, alias: &str, bucket: &str, key: &str) {
        self.state
            .lock()
            .unwrap()
            .buckets
            .entry(alias.to_string())
            .or_default()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string());
    }

    pub fn has_bucket(&self, alias: &str, bucket: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .buckets
            .get(alias)
            .is_some_and(|b| b.contains_key(bucket))
    }

    pub fn objects(&self, alias: &str, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .buckets
            .get(alias)
            .and_then(|b| b.get(bucket))
            .map(|objects| objects.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Recorded calls whose operation is `op`.
    pub fn calls(&self, op: &str) -> Vec<String> {
        let prefix = format!("{} ", op);
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}

#[async_trait]
impl StorageBackend for FakeBackend {
    async fn configure_alias(&self, storage: &StorageDeployment) -> BackendResult<()> {
        self.record("alias", storage.alias.clone())
    }

    async fn bucket_exists(&self, storage: &StorageDeployment, bucket: &str) -> BackendResult<bool> {
        Ok(self.has_bucket(&storage.alias, bucket))
    }

    async fn create_bucket(&self, storage: &StorageDeployment, bucket: &str) -> BackendResult<()> {
        self.record("mb", format!("{}/{}", storage.alias, bucket))?;
        self.put_bucket(&storage.alias, bucket);
        Ok(())
    }

    async fn delete_bucket(&self, storage: &StorageDeployment, bucket: &str) -> BackendResult<()> {
        self.record("rb", format!("{}/{}", storage.alias, bucket))?;
        if let Some(buckets) = self.state.lock().unwrap().buckets.get_mut(&storage.alias) {
            buckets.remove(bucket);
        }
        Ok(())
    }

    async fn list_buckets(&self, storage: &StorageDeployment) -> BackendResult<Vec<String>> {
        self.record("ls", storage.alias.clone())?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .buckets
            .get(&storage.alias)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_objects(
        &self,
        storage: &StorageDeployment,
        bucket: &str,
    ) -> BackendResult<Vec<String>> {
        self.record("ls-objects", format!("{}/{}", storage.alias, bucket))?;
        Ok(self.objects(&storage.alias, bucket))
    }

    async fn set_notification_target(
        &self,
        storage: &StorageDeployment,
        _webhook_url: &str,
    ) -> BackendResult<()> {
        self.record("webhook", storage.alias.clone())
    }

    async fn add_bucket_notification(
        &self,
        storage: &StorageDeployment,
        bucket: &str,
        _event_queue_id: &str,
    ) -> BackendResult<()> {
        self.record("event", format!("{}/{}", storage.alias, bucket))
    }

    async fn mirror(
        &self,
        source: &StorageDeployment,
        destination: &StorageDeployment,
        bucket: &str,
    ) -> BackendResult<Duration> {
        self.record(
            "mirror",
            format!("{}/{} {}", source.alias, bucket, destination.alias),
        )?;
        let objects = self.objects(&source.alias, bucket);
        let mut state = self.state.lock().unwrap();
        let target = state
            .buckets
            .entry(destination.alias.clone())
            .or_default()
            .entry(bucket.to_string())
            .or_default();
        *target = objects.into_iter().collect();
        Ok(Duration::from_millis(1))
    }

    async fn restart_service(&self, storage: &StorageDeployment) -> BackendResult<()> {
        self.record("restart", storage.alias.clone())
    }

    async fn server_info(&self, storage: &StorageDeployment) -> BackendResult<ServerInfo> {
        self.record("info", storage.alias.clone())?;
        let mut state = self.state.lock().unwrap();
        if state.info_failures > 0 {
            state.info_failures -= 1;
            return Err(BackendError::Command {
                command: format!("admin info {}", storage.alias),
                status: 1,
                stderr: "server not initialized".into(),
            });
        }
        Ok(state
            .info
            .get(&storage.alias)
            .cloned()
            .unwrap_or_else(|| ServerInfo {
                deployment_id: format!("{}-id", storage.alias),
                event_queue_ids: vec![WEBHOOK_QUEUE.to_string()],
            }))
    }
}

/// Proxy admin holding one server map and recording every push.
#[derive(Default)]
pub struct FakeProxy {
    servers: Mutex<ServerMap>,
    pushes: Mutex<Vec<ServerMap>>,
}

impl FakeProxy {
    pub fn pushes(&self) -> Vec<ServerMap> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProxyAdmin for FakeProxy {
    async fn get_servers(&self) -> Result<ServerMap, ProxyError> {
        Ok(self.servers.lock().unwrap().clone())
    }

    async fn replace_servers(&self, servers: &ServerMap) -> Result<(), ProxyError> {
        *self.servers.lock().unwrap() = servers.clone();
        self.pushes.lock().unwrap().push(servers.clone());
        Ok(())
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub pool: Arc<SqlitePool>,
    pub backend: Arc<FakeBackend>,
    pub proxy: Arc<FakeProxy>,
}

/// Orchestrator over an in-memory database and fake collaborators, with no
/// settle or readiness delays.
pub async fn harness() -> Harness {
    harness_with(
        memory_pool().await,
        ReadinessPoll {
            attempts: 3,
            interval: Duration::ZERO,
        },
    )
}

pub fn harness_with(pool: SqlitePool, readiness: ReadinessPoll) -> Harness {
    let pool = Arc::new(pool);
    let backend = Arc::new(FakeBackend::default());
    let proxy = Arc::new(FakeProxy::default());
    let balancer = LoadBalancer::with_settle_delay(proxy.clone(), "443", None, Duration::ZERO);
    let orchestrator = Orchestrator::new(
        pool.clone(),
        backend.clone(),
        balancer,
        "https://server.fado/api/notify",
    )
    .with_readiness(readiness);
    Harness {
        orchestrator,
        pool,
        backend,
        proxy,
    }
}

/// SQLite file in a scratch directory, removed on drop. Unlike the
/// in-memory pool it allows several connections, so writers really contend.
pub struct TempDb {
    pub pool: SqlitePool,
    dir: PathBuf,
}

impl TempDb {
    pub async fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("fado-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let url = format!("sqlite://{}", dir.join("fado.db").display());
        let pool = db::connect(&url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        Self { pool, dir }
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub async fn cluster(conn: &mut SqliteConnection, name: &str, zones: &[&str]) -> Cluster {
    let cluster = metadata::insert_cluster(conn, name).await.unwrap();
    if !zones.is_empty() {
        let zones: Vec<String> = zones.iter().map(|z| z.to_string()).collect();
        policy_store::set(conn, PolicyScope::Cluster(cluster.id), ZONES, &zones)
            .await
            .unwrap();
    }
    cluster
}

/// Storage deployment as onboarding would have recorded it.
pub async fn storage(conn: &mut SqliteConnection, cluster_id: i64, alias: &str) -> StorageDeployment {
    metadata::insert_storage(
        conn,
        &NewStorageDeployment {
            cluster_id,
            alias: alias.to_string(),
            endpoint: format!("{}:9000", alias),
            access_key: "minio".into(),
            secret_key: "minio123".into(),
            ..Default::default()
        },
        &format!("{}-id", alias),
        WEBHOOK_QUEUE,
    )
    .await
    .unwrap()
}
