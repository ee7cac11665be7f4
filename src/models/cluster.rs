//! Represents a cluster, the unit zones are attached to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A cluster hosting storage and function deployments.
///
/// The zone labels of a cluster are kept as its cluster-scoped `zones` policy
/// rather than as a column, so they share the override/default semantics of
/// every other policy.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Cluster {
    /// Internal row id.
    pub id: i64,

    /// Unique human-readable name.
    pub name: String,

    /// When this cluster was registered.
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct NewCluster {
    pub name: String,
    #[serde(default)]
    pub zones: Vec<String>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct EditCluster {
    pub id: i64,
    #[serde(default)]
    pub zones: Vec<String>,
}

/// A cluster with its zones, as listed by the API.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ClusterView {
    #[serde(flatten)]
    pub cluster: Cluster,
    pub zones: Vec<String>,
}
