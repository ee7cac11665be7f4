//! Shared state of the control plane.
//!
//! `Orchestrator` plays the role of the service object handlers talk to. Its
//! operations are spread over the sibling modules as `impl Orchestrator`
//! blocks, one per component.

use crate::services::{backend::StorageBackend, load_balancer::LoadBalancer};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// Fixed-count, fixed-interval wait for a restarted backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPoll {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPoll {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    /// Shared SQLite pool; every mutation runs in one transaction from it.
    pub db: Arc<SqlitePool>,

    pub backend: Arc<dyn StorageBackend>,

    pub balancer: LoadBalancer,

    /// URL backends deliver change notifications to.
    pub webhook_url: String,

    pub readiness: ReadinessPoll,

    ready: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<SqlitePool>,
        backend: Arc<dyn StorageBackend>,
        balancer: LoadBalancer,
        webhook_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            backend,
            balancer,
            webhook_url: webhook_url.into(),
            readiness: ReadinessPoll::default(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessPoll) -> Self {
        self.readiness = readiness;
        self
    }

    /// Open a write transaction. `BEGIN IMMEDIATE` takes the write lock up
    /// front, so a competing writer waits out the busy timeout instead of
    /// failing when its read lock cannot be upgraded.
    pub async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.db.begin_with("BEGIN IMMEDIATE").await
    }

    /// Whether startup reconciliation has finished.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::ServiceError,
        models::cluster::NewCluster,
        services::{
            metadata,
            testing::{TempDb, harness_with},
        },
    };

    fn new_cluster(name: &str) -> NewCluster {
        NewCluster {
            name: name.into(),
            zones: vec![],
        }
    }

    #[tokio::test]
    async fn concurrent_writers_queue_instead_of_failing() {
        let db = TempDb::new().await;
        let h = harness_with(db.pool.clone(), ReadinessPoll::default());

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move {
                let mut tx = orchestrator.begin_write().await?;
                orchestrator.add_cluster(&mut tx, &new_cluster("a")).await?;
                tokio::time::sleep(Duration::from_millis(200)).await;
                tx.commit().await?;
                Ok::<_, ServiceError>(())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Reads, then writes, while the first transaction still holds the
        // write lock.
        let mut tx = h.orchestrator.begin_write().await.unwrap();
        h.orchestrator
            .add_cluster(&mut tx, &new_cluster("b"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        first.await.unwrap().unwrap();
        let mut conn = h.pool.acquire().await.unwrap();
        assert_eq!(metadata::count_clusters(&mut conn).await.unwrap(), 2);
    }
}
