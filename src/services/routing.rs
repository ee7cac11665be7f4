//! Routing table generation.

use crate::{
    errors::ServiceResult,
    models::load_balancer::{RouteConfig, RouteSettings},
    services::{
        metadata,
        policy_store::{self, LB_ROUTE_OVERRIDES, LB_ROUTES, RouteMap, RoutingPolicy},
    },
};
use sqlx::SqliteConnection;
use std::collections::HashSet;
use tracing::debug;

/// Generated per-bucket routes and the header they match on.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingTable {
    pub match_header: String,
    pub routes: Vec<RouteSettings>,
}

impl RoutingTable {
    pub fn to_routes(&self) -> Vec<RouteConfig> {
        self.routes
            .iter()
            .map(|route| route.to_route(&self.match_header))
            .collect()
    }
}

/// Order-preserving de-duplication, dropping empty entries.
fn unique_upstreams(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .filter(|url| !url.is_empty() && seen.insert(url.clone()))
        .collect()
}

/// Build one route per bucket from the bucket/function association.
///
/// A bucket with an override uses its policy and upstreams verbatim. Others
/// get the global `lb_policy` over every associated function URL. Buckets
/// with neither an override nor any function are left out. The generated
/// table is stored as `lb_routes`; overrides whose bucket no longer exists
/// are pruned from `lb_route_overrides`.
pub async fn generate_routes(conn: &mut SqliteConnection) -> ServiceResult<RoutingTable> {
    let routing = RoutingPolicy::load(conn).await?;
    let overrides = policy_store::get_global(conn, LB_ROUTE_OVERRIDES).await?;
    let associations = metadata::bucket_function_urls(conn).await?;

    let mut routes = Vec::with_capacity(associations.len());
    let mut generated = RouteMap::new();
    let mut residual = RouteMap::new();

    for association in associations {
        let settings = match overrides.get(&association.bucket_name) {
            Some(custom) => {
                let settings = RouteSettings {
                    bucket_name: association.bucket_name.clone(),
                    ..custom.clone()
                };
                residual.insert(association.bucket_name.clone(), settings.clone());
                settings
            }
            None if association.urls.is_empty() => {
                debug!(bucket = %association.bucket_name, "no functions associated, no route");
                continue;
            }
            None => RouteSettings {
                bucket_name: association.bucket_name.clone(),
                policy: routing.policy.clone(),
                upstreams: unique_upstreams(association.urls),
            },
        };
        generated.insert(settings.bucket_name.clone(), settings.clone());
        routes.push(settings);
    }

    policy_store::set_global(conn, LB_ROUTES, &generated).await?;
    policy_store::set_global(conn, LB_ROUTE_OVERRIDES, &residual).await?;

    Ok(RoutingTable {
        match_header: routing.match_header,
        routes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::memory_pool,
        models::bucket::ReplicaLocation,
        services::testing::{cluster, storage},
    };

    #[test]
    fn upstreams_keep_first_occurrence_order() {
        let urls = vec![
            "f2".to_string(),
            "f1".to_string(),
            String::new(),
            "f2".to_string(),
            "f3".to_string(),
        ];
        assert_eq!(unique_upstreams(urls), vec!["f2", "f1", "f3"]);
    }

    #[tokio::test]
    async fn default_policy_applies_to_buckets_without_override() {
        let pool = memory_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let a = cluster(&mut conn, "a", &[]).await;
        let s1 = storage(&mut conn, a.id, "s1").await;
        metadata::insert_faas(&mut conn, a.id, "f1").await.unwrap();
        metadata::insert_faas(&mut conn, a.id, "f2").await.unwrap();
        metadata::insert_bucket(&mut conn, s1.id, "photos").await.unwrap();
        policy_store::set_global(&mut conn, policy_store::LB_POLICY, &"round_robin".to_string())
            .await
            .unwrap();

        let table = generate_routes(&mut conn).await.unwrap();

        assert_eq!(table.match_header, "X-Fado-Bucket");
        assert_eq!(
            table.routes,
            vec![RouteSettings {
                bucket_name: "photos".into(),
                policy: "round_robin".into(),
                upstreams: vec!["f1".into(), "f2".into()],
            }]
        );
        let stored = policy_store::get_global(&mut conn, LB_ROUTES).await.unwrap();
        assert_eq!(stored["photos"], table.routes[0]);
    }

    #[tokio::test]
    async fn upstreams_follow_home_then_replica_clusters() {
        let pool = memory_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let a = cluster(&mut conn, "a", &[]).await;
        let b = cluster(&mut conn, "b", &[]).await;
        let s1 = storage(&mut conn, a.id, "s1").await;
        let s2 = storage(&mut conn, b.id, "s2").await;
        metadata::insert_faas(&mut conn, b.id, "fb").await.unwrap();
        metadata::insert_faas(&mut conn, a.id, "fa").await.unwrap();
        // Shared URL registered in both clusters shows up once.
        metadata::insert_faas(&mut conn, b.id, "fa").await.unwrap();
        let bucket = metadata::insert_bucket(&mut conn, s1.id, "photos").await.unwrap();
        metadata::insert_replica_location(
            &mut conn,
            ReplicaLocation {
                bucket_id: bucket.id,
                storage_id: s2.id,
            },
        )
        .await
        .unwrap();

        let table = generate_routes(&mut conn).await.unwrap();
        assert_eq!(table.routes[0].upstreams, vec!["fa", "fb"]);
    }

    #[tokio::test]
    async fn override_is_used_verbatim_and_stale_ones_are_pruned() {
        let pool = memory_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let a = cluster(&mut conn, "a", &[]).await;
        let s1 = storage(&mut conn, a.id, "s1").await;
        metadata::insert_faas(&mut conn, a.id, "f1").await.unwrap();
        metadata::insert_bucket(&mut conn, s1.id, "photos").await.unwrap();
        let bare = cluster(&mut conn, "bare", &[]).await;
        let s9 = storage(&mut conn, bare.id, "s9").await;
        metadata::insert_bucket(&mut conn, s9.id, "empty").await.unwrap();

        let custom = RouteSettings {
            bucket_name: String::new(),
            policy: "first".into(),
            upstreams: vec!["edge:9000".into(), "edge:9000".into()],
        };
        let mut overrides = RouteMap::new();
        overrides.insert("photos".into(), custom.clone());
        overrides.insert("gone".into(), custom.clone());
        policy_store::set_global(&mut conn, LB_ROUTE_OVERRIDES, &overrides)
            .await
            .unwrap();

        let table = generate_routes(&mut conn).await.unwrap();

        assert_eq!(table.routes.len(), 1);
        let route = &table.routes[0];
        assert_eq!(route.bucket_name, "photos");
        assert_eq!(route.policy, "first");
        assert_eq!(route.upstreams, custom.upstreams);

        let residual = policy_store::get_global(&mut conn, LB_ROUTE_OVERRIDES)
            .await
            .unwrap();
        assert_eq!(residual.keys().collect::<Vec<_>>(), vec!["photos"]);
    }
}
