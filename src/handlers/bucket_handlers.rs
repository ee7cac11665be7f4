//! HTTP handlers for master buckets and their tracked objects.
//! Each mutation runs in one transaction that commits only if the whole
//! reconciliation succeeded.

use crate::{
    errors::AppError,
    models::bucket::{EditBucket, NewBucket},
    services::{metadata, orchestrator::Orchestrator},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ObjectsQuery {
    pub bucket_id: Option<i64>,
}

/// `GET /api/buckets`
pub async fn list_buckets(
    State(orchestrator): State<Orchestrator>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = orchestrator.db.acquire().await?;
    let buckets = orchestrator.list_master_buckets(&mut conn).await?;
    Ok(Json(buckets))
}

/// `POST /api/buckets`
pub async fn create_bucket(
    State(orchestrator): State<Orchestrator>,
    Json(new): Json<NewBucket>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = orchestrator.begin_write().await?;
    let bucket = orchestrator.add_master_bucket(&mut tx, &new).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(bucket)))
}

/// `PUT /api/buckets`
pub async fn edit_bucket(
    State(orchestrator): State<Orchestrator>,
    Json(edit): Json<EditBucket>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = orchestrator.begin_write().await?;
    let bucket = orchestrator.edit_master_bucket(&mut tx, &edit).await?;
    tx.commit().await?;
    Ok(Json(bucket))
}

/// `DELETE /api/buckets/{id}`
pub async fn delete_bucket(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = orchestrator.begin_write().await?;
    orchestrator.delete_master_bucket_by_id(&mut tx, id).await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/objects?bucket_id=`
pub async fn list_objects(
    State(orchestrator): State<Orchestrator>,
    Query(query): Query<ObjectsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let bucket_id = query
        .bucket_id
        .ok_or_else(|| AppError::bad_request("bucket_id is required"))?;
    let mut conn = orchestrator.db.acquire().await?;
    let bucket = metadata::get_bucket(&mut conn, bucket_id).await?;
    let objects = metadata::list_objects(&mut conn, bucket.id).await?;
    Ok(Json(objects))
}
