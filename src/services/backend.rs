//! Storage backend adapter.
//!
//! `StorageBackend` is everything the control plane needs from a remote
//! object store. `McBackend` implements it by shelling out to the MinIO `mc`
//! client; tests swap in an in-memory fake.

use crate::models::storage_deployment::StorageDeployment;
use async_trait::async_trait;
use serde::Deserialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{process::Command, sync::Mutex};
use tracing::debug;

/// Name of the webhook notification target registered on every backend.
pub const WEBHOOK_TARGET: &str = "notify_webhook:fado";

/// Suffix identifying the event queue that feeds our webhook.
pub const WEBHOOK_QUEUE_SUFFIX: &str = "fado:webhook";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("could not run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected output from `{command}`: {reason}")]
    Output { command: String, reason: String },
    #[error("storage deployment `{alias}` not ready after {attempts} attempts")]
    NotReady { alias: String, attempts: u32 },
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Identity a backend reports about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerInfo {
    pub deployment_id: String,
    /// Configured notification queue ARNs.
    pub event_queue_ids: Vec<String>,
}

impl ServerInfo {
    /// The queue that delivers to our webhook, if the backend has one.
    pub fn webhook_queue(&self) -> Option<&str> {
        self.event_queue_ids
            .iter()
            .map(String::as_str)
            .find(|id| id.ends_with(WEBHOOK_QUEUE_SUFFIX))
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Register (or refresh) local credentials for `storage`.
    async fn configure_alias(&self, storage: &StorageDeployment) -> BackendResult<()>;

    async fn bucket_exists(&self, storage: &StorageDeployment, bucket: &str) -> BackendResult<bool>;

    /// Create `bucket`; succeeds if it already exists.
    async fn create_bucket(&self, storage: &StorageDeployment, bucket: &str) -> BackendResult<()>;

    /// Force-delete `bucket` including its contents.
    async fn delete_bucket(&self, storage: &StorageDeployment, bucket: &str) -> BackendResult<()>;

    async fn list_buckets(&self, storage: &StorageDeployment) -> BackendResult<Vec<String>>;

    /// Recursive listing of object keys in `bucket`.
    async fn list_objects(
        &self,
        storage: &StorageDeployment,
        bucket: &str,
    ) -> BackendResult<Vec<String>>;

    /// Point the backend's webhook notification target at `webhook_url`.
    async fn set_notification_target(
        &self,
        storage: &StorageDeployment,
        webhook_url: &str,
    ) -> BackendResult<()>;

    /// Subscribe `bucket` to created and removed events on `event_queue_id`.
    async fn add_bucket_notification(
        &self,
        storage: &StorageDeployment,
        bucket: &str,
        event_queue_id: &str,
    ) -> BackendResult<()>;

    /// Make `bucket` on `destination` an exact copy of `bucket` on `source`:
    /// differing objects are overwritten and extraneous ones removed.
    async fn mirror(
        &self,
        source: &StorageDeployment,
        destination: &StorageDeployment,
        bucket: &str,
    ) -> BackendResult<Duration>;

    async fn restart_service(&self, storage: &StorageDeployment) -> BackendResult<()>;

    async fn server_info(&self, storage: &StorageDeployment) -> BackendResult<ServerInfo>;
}

/// `mc` command-line adapter.
///
/// `mc` keeps aliases in a shared config file, so alias writes and mirrors
/// (which re-register both ends) are serialized on one lock.
#[derive(Clone)]
pub struct McBackend {
    binary: String,
    alias_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Deserialize)]
struct LsEntry {
    #[serde(default)]
    status: String,
    #[serde(default)]
    key: String,
    #[serde(default, rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct AdminInfo {
    info: AdminInfoBody,
}

#[derive(Debug, Deserialize)]
struct AdminInfoBody {
    #[serde(rename = "deploymentID", default)]
    deployment_id: String,
    #[serde(rename = "sqsARN", default)]
    sqs_arn: Vec<String>,
}

impl McBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            alias_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Run `mc` with `args`. `label` names the invocation in logs and errors
    /// so credentials passed as arguments never leave this function.
    async fn run(&self, label: &str, args: &[&str]) -> BackendResult<Vec<u8>> {
        debug!(command = label, "running mc");
        let output = Command::new(&self.binary)
            .args(args)
            .arg("--no-color")
            .output()
            .await
            .map_err(|source| BackendError::Spawn {
                command: label.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(BackendError::Command {
                command: label.to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn set_alias(&self, storage: &StorageDeployment) -> BackendResult<()> {
        // `alias set` overwrites in place; the alias never disappears.
        self.run(
            &format!("alias set {}", storage.alias),
            &[
                "alias",
                "set",
                &storage.alias,
                &storage.url(),
                &storage.access_key,
                &storage.secret_key,
            ],
        )
        .await?;
        Ok(())
    }

    fn parse_ls(label: &str, stdout: &[u8]) -> BackendResult<Vec<LsEntry>> {
        String::from_utf8_lossy(stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<LsEntry>(line).map_err(|err| BackendError::Output {
                    command: label.to_string(),
                    reason: err.to_string(),
                })
            })
            .filter(|entry| !matches!(entry, Ok(e) if e.status == "error"))
            .collect()
    }
}

#[async_trait]
impl StorageBackend for McBackend {
    async fn configure_alias(&self, storage: &StorageDeployment) -> BackendResult<()> {
        let _guard = self.alias_lock.lock().await;
        self.set_alias(storage).await
    }

    async fn bucket_exists(&self, storage: &StorageDeployment, bucket: &str) -> BackendResult<bool> {
        Ok(self
            .list_buckets(storage)
            .await?
            .iter()
            .any(|name| name == bucket))
    }

    async fn create_bucket(&self, storage: &StorageDeployment, bucket: &str) -> BackendResult<()> {
        let target = format!("{}/{}", storage.alias, bucket);
        self.run(&format!("mb {}", target), &["mb", "--ignore-existing", &target])
            .await?;
        Ok(())
    }

    async fn delete_bucket(&self, storage: &StorageDeployment, bucket: &str) -> BackendResult<()> {
        let target = format!("{}/{}", storage.alias, bucket);
        self.run(&format!("rb {}", target), &["rb", "--force", &target])
            .await?;
        Ok(())
    }

    async fn list_buckets(&self, storage: &StorageDeployment) -> BackendResult<Vec<String>> {
        let label = format!("ls {}", storage.alias);
        let stdout = self.run(&label, &["ls", "--json", &storage.alias]).await?;
        Ok(Self::parse_ls(&label, &stdout)?
            .into_iter()
            .map(|entry| entry.key.trim_end_matches('/').to_string())
            .filter(|name| !name.is_empty())
            .collect())
    }

    async fn list_objects(
        &self,
        storage: &StorageDeployment,
        bucket: &str,
    ) -> BackendResult<Vec<String>> {
        let target = format!("{}/{}", storage.alias, bucket);
        let label = format!("ls --recursive {}", target);
        let stdout = self
            .run(&label, &["ls", "--json", "--recursive", &target])
            .await?;
        Ok(Self::parse_ls(&label, &stdout)?
            .into_iter()
            .filter(|entry| entry.kind != "folder")
            .map(|entry| entry.key)
            .collect())
    }

    async fn set_notification_target(
        &self,
        storage: &StorageDeployment,
        webhook_url: &str,
    ) -> BackendResult<()> {
        let endpoint = format!("endpoint={}", webhook_url);
        self.run(
            &format!("admin config set {} {}", storage.alias, WEBHOOK_TARGET),
            &["admin", "config", "set", &storage.alias, WEBHOOK_TARGET, &endpoint],
        )
        .await?;
        Ok(())
    }

    async fn add_bucket_notification(
        &self,
        storage: &StorageDeployment,
        bucket: &str,
        event_queue_id: &str,
    ) -> BackendResult<()> {
        let target = format!("{}/{}", storage.alias, bucket);
        self.run(
            &format!("event add {}", target),
            &[
                "event",
                "add",
                &target,
                event_queue_id,
                "--event",
                "put,delete",
                "--ignore-existing",
            ],
        )
        .await?;
        Ok(())
    }

    async fn mirror(
        &self,
        source: &StorageDeployment,
        destination: &StorageDeployment,
        bucket: &str,
    ) -> BackendResult<Duration> {
        let _guard = self.alias_lock.lock().await;
        let from = format!("{}/{}", source.alias, bucket);
        let to = format!("{}/{}", destination.alias, bucket);
        let started = Instant::now();
        self.run(
            &format!("mirror {} {}", from, to),
            &["mirror", "--remove", "--overwrite", &from, &to],
        )
        .await?;
        Ok(started.elapsed())
    }

    async fn restart_service(&self, storage: &StorageDeployment) -> BackendResult<()> {
        self.run(
            &format!("admin service restart {}", storage.alias),
            &["admin", "service", "restart", &storage.alias],
        )
        .await?;
        Ok(())
    }

    async fn server_info(&self, storage: &StorageDeployment) -> BackendResult<ServerInfo> {
        let label = format!("admin info {}", storage.alias);
        let stdout = self
            .run(&label, &["admin", "info", "--json", &storage.alias])
            .await?;
        let parsed: AdminInfo =
            serde_json::from_slice(&stdout).map_err(|err| BackendError::Output {
                command: label,
                reason: err.to_string(),
            })?;
        Ok(ServerInfo {
            deployment_id: parsed.info.deployment_id,
            event_queue_ids: parsed.info.sqs_arn,
        })
    }
}
