//! Defines the HTTP surface of the control plane.
//!
//! ## Structure
//! - **Health**: `GET /healthz`, `GET /readyz`
//! - **Webhook**: `POST /api/notify`, acknowledged before processing
//! - **Buckets**: `GET|POST|PUT /api/buckets`, `DELETE /api/buckets/{id}`,
//!   `GET /api/objects?bucket_id=`
//! - **Topology**: clusters, storage deployments and function deployments,
//!   with `?permanent=` on the deletes that can touch remote copies
//! - **Load balancer**: `GET /api/load-balancer` plus two `PUT` endpoints

use crate::{
    handlers::{
        bucket_handlers::{create_bucket, delete_bucket, edit_bucket, list_buckets, list_objects},
        health_handlers::{healthz, readyz},
        load_balancer_handlers::{get_load_balancer, put_route_overrides, put_settings},
        notify_handlers::notify,
        topology_handlers::{
            create_cluster, create_faas_deployment, create_storage_deployment, delete_cluster,
            delete_faas_deployment, delete_storage_deployment, edit_cluster, edit_faas_deployment,
            list_clusters, list_faas_deployments, list_storage_deployments,
        },
    },
    services::orchestrator::Orchestrator,
};
use axum::{
    Router,
    routing::{delete, get, post, put},
};

/// Build the router for every control-plane endpoint.
///
/// The router carries the shared `Orchestrator` to all handlers.
pub fn routes() -> Router<Orchestrator> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/notify", post(notify))
        .route(
            "/api/buckets",
            get(list_buckets).post(create_bucket).put(edit_bucket),
        )
        .route("/api/buckets/{id}", delete(delete_bucket))
        .route("/api/objects", get(list_objects))
        .route(
            "/api/clusters",
            get(list_clusters).post(create_cluster).put(edit_cluster),
        )
        .route("/api/clusters/{id}", delete(delete_cluster))
        .route(
            "/api/storage-deployments",
            get(list_storage_deployments).post(create_storage_deployment),
        )
        .route(
            "/api/storage-deployments/{id}",
            delete(delete_storage_deployment),
        )
        .route(
            "/api/faas-deployments",
            get(list_faas_deployments)
                .post(create_faas_deployment)
                .put(edit_faas_deployment),
        )
        .route("/api/faas-deployments/{id}", delete(delete_faas_deployment))
        .route("/api/load-balancer", get(get_load_balancer))
        .route("/api/load-balancer/settings", put(put_settings))
        .route("/api/load-balancer/route-overrides", put(put_route_overrides))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        orchestrator::ReadinessPoll,
        testing::{Harness, TempDb, harness, harness_with},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use std::time::{Duration, Instant};
    use tower::ServiceExt;

    async fn send(h: &Harness, req: Request<Body>) -> (StatusCode, Value) {
        let app = routes().with_state(h.orchestrator.clone());
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn json_req(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoints_report_liveness_and_startup_state() {
        let h = harness().await;

        let (status, _) = send(&h, get_req("/healthz")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&h, get_req("/readyz")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        h.orchestrator.mark_ready();
        let (status, _) = send(&h, get_req("/readyz")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn notify_acknowledges_unparseable_payloads() {
        let h = harness().await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/notify")
            .body(Body::from("not json"))
            .unwrap();

        let app = routes().with_state(h.orchestrator.clone());
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
        assert!(h.backend.calls("mirror").is_empty());
    }

    #[tokio::test]
    async fn created_cluster_is_listed_with_its_zones() {
        let h = harness().await;

        let (status, created) = send(
            &h,
            json_req("POST", "/api/clusters", json!({"name": "edge", "zones": ["eu"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["name"], "edge");

        let (status, listed) = send(&h, get_req("/api/clusters")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["name"], "edge");
        assert_eq!(listed[0]["zones"], json!(["eu"]));
    }

    #[tokio::test]
    async fn service_errors_map_to_generic_client_errors() {
        let h = harness().await;

        let (status, body) = send(
            &h,
            json_req("POST", "/api/clusters", json!({"name": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Bad Request");

        let req = Request::builder()
            .method("DELETE")
            .uri("/api/buckets/42")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&h, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Not Found");

        let (status, _) = send(&h, get_req("/api/objects")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn load_balancer_settings_round_through_the_api() {
        let h = harness().await;

        let (status, view) = send(
            &h,
            json_req(
                "PUT",
                "/api/load-balancer/settings",
                json!({"policy": "round_robin", "match_header": "X-Bucket"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["policy"], "round_robin");
        assert_eq!(view["match_header"], "X-Bucket");

        let (status, _) = send(
            &h,
            json_req("PUT", "/api/load-balancer/settings", json!({"policy": "first"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cluster_writes_proceed_while_a_storage_backend_restarts() {
        let db = TempDb::new().await;
        let h = harness_with(
            db.pool.clone(),
            ReadinessPoll {
                attempts: 3,
                interval: Duration::from_millis(400),
            },
        );
        let (status, cluster) =
            send(&h, json_req("POST", "/api/clusters", json!({"name": "a"}))).await;
        assert_eq!(status, StatusCode::CREATED);

        let onboarding = {
            let app = routes().with_state(h.orchestrator.clone());
            let req = json_req(
                "POST",
                "/api/storage-deployments",
                json!({
                    "cluster_id": cluster["id"],
                    "alias": "s1",
                    "endpoint": "s1:9000",
                    "access_key": "ak",
                    "secret_key": "sk"
                }),
            );
            tokio::spawn(async move { app.oneshot(req).await.unwrap().status() })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let (status, _) = send(&h, json_req("POST", "/api/clusters", json!({"name": "b"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(started.elapsed() < Duration::from_millis(300));

        assert_eq!(onboarding.await.unwrap(), StatusCode::CREATED);
        let (_, listed) = send(&h, get_req("/api/storage-deployments")).await;
        assert_eq!(listed[0]["deployment_id"], "s1-id");
    }
}
