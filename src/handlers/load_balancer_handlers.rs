//! HTTP handlers for load-balancer administration.

use crate::{
    errors::AppError,
    services::{
        load_balancer::LoadBalancerSettings, orchestrator::Orchestrator, policy_store::RouteMap,
    },
};
use axum::{Json, extract::State, response::IntoResponse};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RouteOverridesReq {
    #[serde(default)]
    pub route_overrides: RouteMap,
}

/// `GET /api/load-balancer`
pub async fn get_load_balancer(
    State(orchestrator): State<Orchestrator>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = orchestrator.db.acquire().await?;
    Ok(Json(orchestrator.get_load_balancer(&mut conn).await?))
}

/// `PUT /api/load-balancer/settings`
pub async fn put_settings(
    State(orchestrator): State<Orchestrator>,
    Json(settings): Json<LoadBalancerSettings>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = orchestrator.begin_write().await?;
    orchestrator
        .set_load_balancer_settings(&mut tx, &settings)
        .await?;
    let view = orchestrator.get_load_balancer(&mut tx).await?;
    tx.commit().await?;
    Ok(Json(view))
}

/// `PUT /api/load-balancer/route-overrides`
pub async fn put_route_overrides(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<RouteOverridesReq>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = orchestrator.begin_write().await?;
    orchestrator
        .set_route_overrides(&mut tx, req.route_overrides)
        .await?;
    let view = orchestrator.get_load_balancer(&mut tx).await?;
    tx.commit().await?;
    Ok(Json(view))
}
