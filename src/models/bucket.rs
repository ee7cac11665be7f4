//! Represents a logical bucket and the replica edges the reconciler owns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A federated bucket.
///
/// Every bucket has exactly one home (master) storage deployment holding the
/// authoritative copy. Replicas live in `replica_locations` and never include
/// the home deployment.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Bucket {
    /// Internal row id.
    pub id: i64,

    /// Home storage deployment id.
    pub storage_id: i64,

    /// Globally unique bucket name, identical on every backend holding a copy.
    pub name: String,

    /// When this bucket was first registered.
    pub created_at: DateTime<Utc>,
}

/// A (bucket, storage deployment) replica edge.
#[derive(Serialize, Deserialize, Clone, Copy, FromRow, Debug, PartialEq, Eq)]
pub struct ReplicaLocation {
    pub bucket_id: i64,
    pub storage_id: i64,
}

/// Input for provisioning a master bucket.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct NewBucket {
    /// Home storage deployment.
    pub storage_id: i64,
    pub name: String,
    #[serde(default)]
    pub target_replica_count: u32,
    /// Allowed replica zones; `None` leaves the default (unrestricted).
    #[serde(default)]
    pub zones: Option<Vec<String>>,
    /// Explicit replica deployments; empty means resolve from zones and count.
    #[serde(default)]
    pub replica_locations: Vec<i64>,
}

/// New placement policy for an existing bucket.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct EditBucket {
    pub id: i64,
    #[serde(default)]
    pub target_replica_count: u32,
    #[serde(default)]
    pub zones: Option<Vec<String>>,
    /// Empty clears any explicit list.
    #[serde(default)]
    pub replica_locations: Vec<i64>,
}

/// A bucket with its placement policy and current replicas, as listed by
/// the API.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct BucketView {
    #[serde(flatten)]
    pub bucket: Bucket,
    pub target_replica_count: u32,
    pub zones: Vec<String>,
    /// Explicit replica list, when one is set.
    pub replica_locations: Option<Vec<i64>>,
    /// Storage deployments currently holding a replica.
    pub replicas: Vec<i64>,
}
