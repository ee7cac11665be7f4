//! Represents an object-storage backend attached to a cluster.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A storage backend (one MinIO deployment) inside a cluster.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct StorageDeployment {
    /// Internal row id.
    pub id: i64,

    /// Owning cluster.
    pub cluster_id: i64,

    /// Admin CLI alias; unique across the federation.
    pub alias: String,

    /// `host:port` of the S3 endpoint.
    pub endpoint: String,

    /// Access key used by the admin CLI.
    pub access_key: String,

    /// Secret key used by the admin CLI. Never serialized in API responses.
    #[serde(skip_serializing, default)]
    pub secret_key: String,

    /// Whether the endpoint speaks TLS.
    pub use_ssl: bool,

    /// Deployment identity assigned by the backend. Webhook events carry it.
    pub deployment_id: String,

    /// Event queue identifier (ARN) bucket notifications are published to.
    pub event_queue_id: String,

    /// Optional admin console URL, informational only.
    pub management_url: String,
}

impl StorageDeployment {
    /// Full endpoint URL including the scheme.
    pub fn url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}", scheme, self.endpoint)
    }
}

/// Input for registering (or re-onboarding) a storage deployment.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct NewStorageDeployment {
    pub cluster_id: i64,
    pub alias: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub management_url: String,
}
