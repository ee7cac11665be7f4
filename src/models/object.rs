//! Represents a tracked object name inside a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A cached view of one object present at a bucket's home backend.
///
/// The cache is rebuilt by a full rescan of the backend and is never treated
/// as authoritative.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ObjectRecord {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: i64,

    /// Full object key within the bucket.
    pub name: String,

    /// When the rescan first saw this object.
    pub tracked_at: DateTime<Utc>,
}
