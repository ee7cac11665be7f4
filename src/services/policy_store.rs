//! Scoped, typed configuration ("policies").
//!
//! A policy is a named value with a registered default. Overrides can be
//! stored per scope (global, per cluster, per bucket); an override shadows
//! the default only when it exists for the requested owner. All values share
//! one JSON text representation, and each `PolicyKey` fixes the Rust shape a
//! policy decodes into, so callers never handle untyped values.
//!
//! Decoding is strict on both paths: a default or an override that does not
//! fit the key's shape is a `ServiceError::Decode`, never a silent fallback.
//! Zero matching override rows simply means "use the default".

use crate::{
    errors::{ServiceError, ServiceResult},
    models::load_balancer::RouteSettings,
};
use serde::{Serialize, de::DeserializeOwned};
use sqlx::SqliteConnection;
use std::{collections::BTreeMap, marker::PhantomData};

/// Owner of a policy override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyScope {
    Global,
    Cluster(i64),
    Bucket(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Cluster,
    Bucket,
}

impl PolicyScope {
    fn kind(self) -> ScopeKind {
        match self {
            PolicyScope::Global => ScopeKind::Global,
            PolicyScope::Cluster(_) => ScopeKind::Cluster,
            PolicyScope::Bucket(_) => ScopeKind::Bucket,
        }
    }
}

/// Name of a registered policy plus the shape its value decodes into.
pub struct PolicyKey<T> {
    pub name: &'static str,
    scopes: &'static [ScopeKind],
    _shape: PhantomData<fn() -> T>,
}

impl<T> PolicyKey<T> {
    const fn new(name: &'static str, scopes: &'static [ScopeKind]) -> Self {
        Self {
            name,
            scopes,
            _shape: PhantomData,
        }
    }

    fn check_scope(&self, scope: PolicyScope) -> ServiceResult<()> {
        if self.scopes.contains(&scope.kind()) {
            Ok(())
        } else {
            Err(ServiceError::validation(format!(
                "policy `{}` cannot be set at {:?} scope",
                self.name,
                scope.kind()
            )))
        }
    }
}

impl<T> Clone for PolicyKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PolicyKey<T> {}

pub type RouteMap = BTreeMap<String, RouteSettings>;

pub const ZONES: PolicyKey<Vec<String>> =
    PolicyKey::new("zones", &[ScopeKind::Cluster, ScopeKind::Bucket]);
pub const TARGET_REPLICA_COUNT: PolicyKey<u32> =
    PolicyKey::new("target_replica_count", &[ScopeKind::Bucket]);
pub const REPLICA_LOCATIONS: PolicyKey<Vec<i64>> =
    PolicyKey::new("replica_locations", &[ScopeKind::Bucket]);
pub const LB_POLICY: PolicyKey<String> = PolicyKey::new("lb_policy", &[ScopeKind::Global]);
pub const LB_MATCH_HEADER: PolicyKey<String> =
    PolicyKey::new("lb_match_header", &[ScopeKind::Global]);
pub const LB_ROUTES: PolicyKey<RouteMap> = PolicyKey::new("lb_routes", &[ScopeKind::Global]);
pub const LB_ROUTE_OVERRIDES: PolicyKey<RouteMap> =
    PolicyKey::new("lb_route_overrides", &[ScopeKind::Global]);

/// A resolved policy value and whether it came from an override.
#[derive(Debug, Clone, PartialEq)]
pub struct Scoped<T> {
    pub value: T,
    pub explicitly_set: bool,
}

struct Registered {
    id: i64,
    default_value: String,
}

async fn registered(conn: &mut SqliteConnection, name: &'static str) -> ServiceResult<Registered> {
    let row: Option<(i64, String)> =
        sqlx::query_as("SELECT id, default_value FROM policies WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
    row.map(|(id, default_value)| Registered { id, default_value })
        .ok_or_else(|| ServiceError::not_found(format!("policy `{}`", name)))
}

fn decode<T: DeserializeOwned>(policy: &'static str, raw: &str) -> ServiceResult<T> {
    serde_json::from_str(raw).map_err(|source| ServiceError::Decode { policy, source })
}

async fn load_override(
    conn: &mut SqliteConnection,
    scope: PolicyScope,
    policy_id: i64,
) -> ServiceResult<Option<String>> {
    let query = match scope {
        PolicyScope::Global => {
            sqlx::query_scalar("SELECT value FROM global_policies WHERE policy_id = ?")
                .bind(policy_id)
        }
        PolicyScope::Cluster(owner) => sqlx::query_scalar(
            "SELECT value FROM cluster_policies WHERE policy_id = ? AND cluster_id = ?",
        )
        .bind(policy_id)
        .bind(owner),
        PolicyScope::Bucket(owner) => sqlx::query_scalar(
            "SELECT value FROM bucket_policies WHERE policy_id = ? AND bucket_id = ?",
        )
        .bind(policy_id)
        .bind(owner),
    };
    Ok(query.fetch_optional(&mut *conn).await?)
}

/// Resolve `key` for `scope`: the registered default, shadowed by the
/// scope's override if one is stored.
pub async fn get<T: DeserializeOwned>(
    conn: &mut SqliteConnection,
    scope: PolicyScope,
    key: PolicyKey<T>,
) -> ServiceResult<Scoped<T>> {
    key.check_scope(scope)?;
    let policy = registered(conn, key.name).await?;
    let default = decode(key.name, &policy.default_value)?;

    match load_override(conn, scope, policy.id).await? {
        Some(raw) => Ok(Scoped {
            value: decode(key.name, &raw)?,
            explicitly_set: true,
        }),
        None => Ok(Scoped {
            value: default,
            explicitly_set: false,
        }),
    }
}

/// Store (or replace) the override of `key` at `scope`.
pub async fn set<T: Serialize>(
    conn: &mut SqliteConnection,
    scope: PolicyScope,
    key: PolicyKey<T>,
    value: &T,
) -> ServiceResult<()> {
    key.check_scope(scope)?;
    let policy = registered(conn, key.name).await?;
    let raw = serde_json::to_string(value).map_err(|source| ServiceError::Decode {
        policy: key.name,
        source,
    })?;

    let query = match scope {
        PolicyScope::Global => sqlx::query(
            "INSERT INTO global_policies (policy_id, value) VALUES (?, ?) \
             ON CONFLICT(policy_id) DO UPDATE SET value = excluded.value",
        )
        .bind(policy.id)
        .bind(raw),
        PolicyScope::Cluster(owner) => sqlx::query(
            "INSERT INTO cluster_policies (cluster_id, policy_id, value) VALUES (?, ?, ?) \
             ON CONFLICT(cluster_id, policy_id) DO UPDATE SET value = excluded.value",
        )
        .bind(owner)
        .bind(policy.id)
        .bind(raw),
        PolicyScope::Bucket(owner) => sqlx::query(
            "INSERT INTO bucket_policies (bucket_id, policy_id, value) VALUES (?, ?, ?) \
             ON CONFLICT(bucket_id, policy_id) DO UPDATE SET value = excluded.value",
        )
        .bind(owner)
        .bind(policy.id)
        .bind(raw),
    };
    query.execute(&mut *conn).await?;
    Ok(())
}

/// Drop the override of `key` at `scope`, reverting it to the default.
pub async fn delete<T>(
    conn: &mut SqliteConnection,
    scope: PolicyScope,
    key: PolicyKey<T>,
) -> ServiceResult<()> {
    key.check_scope(scope)?;
    let policy = registered(conn, key.name).await?;

    let query = match scope {
        PolicyScope::Global => {
            sqlx::query("DELETE FROM global_policies WHERE policy_id = ?").bind(policy.id)
        }
        PolicyScope::Cluster(owner) => {
            sqlx::query("DELETE FROM cluster_policies WHERE policy_id = ? AND cluster_id = ?")
                .bind(policy.id)
                .bind(owner)
        }
        PolicyScope::Bucket(owner) => {
            sqlx::query("DELETE FROM bucket_policies WHERE policy_id = ? AND bucket_id = ?")
                .bind(policy.id)
                .bind(owner)
        }
    };
    query.execute(&mut *conn).await?;
    Ok(())
}

pub async fn get_global<T: DeserializeOwned>(
    conn: &mut SqliteConnection,
    key: PolicyKey<T>,
) -> ServiceResult<T> {
    Ok(get(conn, PolicyScope::Global, key).await?.value)
}

pub async fn set_global<T: Serialize>(
    conn: &mut SqliteConnection,
    key: PolicyKey<T>,
    value: &T,
) -> ServiceResult<()> {
    set(conn, PolicyScope::Global, key, value).await
}

pub async fn delete_global<T>(conn: &mut SqliteConnection, key: PolicyKey<T>) -> ServiceResult<()> {
    delete(conn, PolicyScope::Global, key).await
}

/// Placement-relevant policy of one bucket.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplicaPolicy {
    /// Zones replicas may be placed in; empty means unrestricted.
    pub zones: Vec<String>,
    pub target_replica_count: u32,
    /// Explicit replica list; when present, zones and count are ignored.
    pub replica_locations: Option<Vec<i64>>,
}

impl ReplicaPolicy {
    pub async fn load(conn: &mut SqliteConnection, bucket_id: i64) -> ServiceResult<Self> {
        let scope = PolicyScope::Bucket(bucket_id);
        let explicit = get(conn, scope, REPLICA_LOCATIONS).await?;
        Ok(Self {
            zones: get(conn, scope, ZONES).await?.value,
            target_replica_count: get(conn, scope, TARGET_REPLICA_COUNT).await?.value,
            replica_locations: (explicit.explicitly_set && !explicit.value.is_empty())
                .then_some(explicit.value),
        })
    }
}

/// Global routing defaults applied to buckets without an override.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingPolicy {
    /// Upstream selection policy name.
    pub policy: String,
    /// Request header whose value selects the bucket.
    pub match_header: String,
}

impl RoutingPolicy {
    pub async fn load(conn: &mut SqliteConnection) -> ServiceResult<Self> {
        Ok(Self {
            policy: get_global(conn, LB_POLICY).await?,
            match_header: get_global(conn, LB_MATCH_HEADER).await?,
        })
    }

    pub async fn store(&self, conn: &mut SqliteConnection) -> ServiceResult<()> {
        set_global(conn, LB_POLICY, &self.policy).await?;
        set_global(conn, LB_MATCH_HEADER, &self.match_header).await
    }
}
