//! HTTP handlers for clusters, storage deployments and function deployments.

use crate::{
    errors::AppError,
    models::{
        cluster::{EditCluster, NewCluster},
        faas_deployment::{EditFaaSDeployment, NewFaaSDeployment},
        storage_deployment::NewStorageDeployment,
    },
    services::{metadata, orchestrator::Orchestrator},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

/// `?permanent=true` also deletes the remote copies.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub permanent: bool,
}

/// `GET /api/clusters`
pub async fn list_clusters(
    State(orchestrator): State<Orchestrator>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = orchestrator.db.acquire().await?;
    Ok(Json(orchestrator.list_clusters(&mut conn).await?))
}

/// `POST /api/clusters`
pub async fn create_cluster(
    State(orchestrator): State<Orchestrator>,
    Json(new): Json<NewCluster>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = orchestrator.begin_write().await?;
    let cluster = orchestrator.add_cluster(&mut tx, &new).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(cluster)))
}

/// `PUT /api/clusters`
pub async fn edit_cluster(
    State(orchestrator): State<Orchestrator>,
    Json(edit): Json<EditCluster>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = orchestrator.begin_write().await?;
    let cluster = orchestrator.edit_cluster(&mut tx, &edit).await?;
    tx.commit().await?;
    Ok(Json(cluster))
}

/// `DELETE /api/clusters/{id}?permanent=`
pub async fn delete_cluster(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<i64>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = orchestrator.begin_write().await?;
    orchestrator
        .delete_cluster(&mut tx, id, query.permanent)
        .await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/storage-deployments`
pub async fn list_storage_deployments(
    State(orchestrator): State<Orchestrator>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = orchestrator.db.acquire().await?;
    Ok(Json(metadata::list_storage_deployments(&mut conn).await?))
}

/// `POST /api/storage-deployments`
///
/// Restarts the backend and waits for it, so this can take several seconds.
/// The wait happens before the write transaction opens.
pub async fn create_storage_deployment(
    State(orchestrator): State<Orchestrator>,
    Json(new): Json<NewStorageDeployment>,
) -> Result<impl IntoResponse, AppError> {
    let info = {
        let mut conn = orchestrator.db.acquire().await?;
        orchestrator.onboard_storage_deployment(&mut conn, &new).await?
    };
    let mut tx = orchestrator.begin_write().await?;
    let storage = orchestrator
        .register_storage_deployment(&mut tx, &new, &info)
        .await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(storage)))
}

/// `DELETE /api/storage-deployments/{id}?permanent=`
pub async fn delete_storage_deployment(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<i64>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = orchestrator.begin_write().await?;
    orchestrator
        .delete_storage_deployment_by_id(&mut tx, id, query.permanent)
        .await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/faas-deployments`
pub async fn list_faas_deployments(
    State(orchestrator): State<Orchestrator>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = orchestrator.db.acquire().await?;
    Ok(Json(metadata::list_faas(&mut conn).await?))
}

/// `POST /api/faas-deployments`
pub async fn create_faas_deployment(
    State(orchestrator): State<Orchestrator>,
    Json(new): Json<NewFaaSDeployment>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = orchestrator.begin_write().await?;
    let faas = orchestrator.add_faas_deployment(&mut tx, &new).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(faas)))
}

/// `PUT /api/faas-deployments`
pub async fn edit_faas_deployment(
    State(orchestrator): State<Orchestrator>,
    Json(edit): Json<EditFaaSDeployment>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = orchestrator.begin_write().await?;
    let faas = orchestrator.edit_faas_deployment(&mut tx, &edit).await?;
    tx.commit().await?;
    Ok(Json(faas))
}

/// `DELETE /api/faas-deployments/{id}`
pub async fn delete_faas_deployment(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = orchestrator.begin_write().await?;
    orchestrator.delete_faas_deployment(&mut tx, id).await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}
