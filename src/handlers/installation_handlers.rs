//! Administrative HTTP handlers for installations and their buckets.

use crate::{
    errors::AppError,
    models::{
        bucket::{Bucket, BucketAction},
        installation::{Installation, NewInstallation},
        pattern::BucketPattern,
    },
    services::{
        intake_service::{IntakeService, TeardownReport, TerminationRequest},
        lifecycle::PassOutcome,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ListInstallationsQuery {
    #[serde(default)]
    pub include_terminated: bool,
}

/// Body of `POST /installations/{id}/buckets`.
#[derive(Debug, Deserialize)]
pub struct CreateBucketReq {
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub rename_existing: bool,
}

/// `GET /installations`
pub async fn list_installations(
    State(service): State<IntakeService>,
    Query(query): Query<ListInstallationsQuery>,
) -> Result<Json<Vec<Installation>>, AppError> {
    Ok(Json(service.store.list(query.include_terminated).await?))
}

/// `POST /installations`
pub async fn create_installation(
    State(service): State<IntakeService>,
    Json(body): Json<NewInstallation>,
) -> Result<impl IntoResponse, AppError> {
    let installation = service.create_installation(body).await?;
    Ok((StatusCode::CREATED, Json(installation)))
}

/// `GET /installations/{id}`; `id` may also be the root folder id.
pub async fn get_installation(
    State(service): State<IntakeService>,
    Path(ident): Path<String>,
) -> Result<Json<Installation>, AppError> {
    service
        .find_installation(&ident)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("installation `{}` not found", ident)))
}

/// `POST /installations/{id}/terminate`
pub async fn mark_for_termination(
    State(service): State<IntakeService>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let request: TerminationRequest = service.mark_for_termination(id).await?;
    let status = if request.already_marked {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(request)))
}

/// `DELETE /installations/{id}`: cancel every channel and delete the
/// installation outright.
pub async fn teardown_installation(
    State(service): State<IntakeService>,
    Path(id): Path<i64>,
) -> Result<Json<TeardownReport>, AppError> {
    Ok(Json(service.teardown(id).await?))
}

/// `POST /installations/{id}/maintain`: run one maintenance pass now.
pub async fn maintain_installation(
    State(service): State<IntakeService>,
    Path(id): Path<i64>,
) -> Result<Json<PassOutcome>, AppError> {
    Ok(Json(service.maintain(id, Utc::now()).await?))
}

/// `GET /installations/{id}/buckets`
pub async fn list_buckets(
    State(service): State<IntakeService>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<Bucket>>, AppError> {
    Ok(Json(service.list_buckets(id).await?))
}

/// `POST /installations/{id}/buckets`
pub async fn create_bucket(
    State(service): State<IntakeService>,
    Path(id): Path<i64>,
    Json(body): Json<CreateBucketReq>,
) -> Result<impl IntoResponse, AppError> {
    let action: BucketAction = body.action.parse()?;
    let bucket = service
        .create_bucket(id, &body.name, action, body.rename_existing)
        .await?;
    Ok((StatusCode::CREATED, Json(bucket)))
}

/// `POST /installations/{id}/pattern`
pub async fn apply_pattern(
    State(service): State<IntakeService>,
    Path(id): Path<i64>,
    Json(pattern): Json<BucketPattern>,
) -> Result<impl IntoResponse, AppError> {
    let buckets = service.apply_pattern(id, &pattern).await?;
    Ok((StatusCode::CREATED, Json(buckets)))
}
