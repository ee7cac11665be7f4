//! Represents a function endpoint living in a cluster.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A function (FaaS) deployment that bucket traffic may be routed to.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FaaSDeployment {
    /// Internal row id.
    pub id: i64,

    /// Owning cluster.
    pub cluster_id: i64,

    /// Upstream address handed to the reverse proxy as-is.
    pub url: String,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct NewFaaSDeployment {
    pub cluster_id: i64,
    pub url: String,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct EditFaaSDeployment {
    pub id: i64,
    pub url: String,
}
