use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, StoreError};
use crate::handlers::{DeleteQuery, resolve_pagination, validate_phase_filter};
use crate::models::{
    CreateNodePoolRequest, ResourceStatusResponse, UpdateNodePoolRequest,
    UpsertControllerStatusRequest,
};
use crate::publisher::nodepool_lifecycle_event;
use crate::server::{AppState, UserEmail};
use crate::{aggregator, nodepool_db, status_db};

#[derive(Debug, Deserialize)]
pub struct ListNodePoolsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub cluster_id: Option<Uuid>,
    pub status: Option<String>,
}

/// List node pools owned by the caller
pub async fn list_nodepools(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Query(query): Query<ListNodePoolsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (limit, offset) = resolve_pagination(&state.settings, query.limit, query.offset)?;
    validate_phase_filter(query.status.as_deref())?;

    let mut response = nodepool_db::list_nodepools(
        &state.pool,
        &owner,
        offset,
        limit,
        query.cluster_id,
        query.status.as_deref(),
    )
    .await?;

    for nodepool in response.items.iter_mut() {
        aggregator::refresh_nodepool_status(&state.pool, nodepool).await?;
    }

    Ok(Json(response))
}

/// Create a new node pool under an existing cluster
pub async fn create_nodepool(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Json(req): Json<CreateNodePoolRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let nodepool = nodepool_db::create_nodepool(&state.pool, &owner, &req).await?;

    let event = nodepool_lifecycle_event("created", &nodepool, &state.settings.event_source);
    state
        .publisher
        .publish_nodepool_lifecycle(&event)
        .await
        .map_err(StoreError::Transport)?;

    Ok((StatusCode::CREATED, Json(nodepool)))
}

/// Get a node pool by ID
pub async fn get_nodepool(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let mut nodepool = nodepool_db::get_nodepool(&state.pool, &owner, id).await?;
    aggregator::refresh_nodepool_status(&state.pool, &mut nodepool).await?;
    Ok(Json(nodepool))
}

/// Update a node pool's spec, bumping its generation
pub async fn update_nodepool(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateNodePoolRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let nodepool = nodepool_db::update_nodepool_spec(
        &state.pool,
        &owner,
        id,
        &req.spec,
        req.resource_version.as_deref(),
    )
    .await?;

    let event = nodepool_lifecycle_event("updated", &nodepool, &state.settings.event_source);
    state
        .publisher
        .publish_nodepool_lifecycle(&event)
        .await
        .map_err(StoreError::Transport)?;

    Ok(Json(nodepool))
}

/// Soft-delete a node pool
pub async fn delete_nodepool(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Path(id): Path<Uuid>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mut current = nodepool_db::get_nodepool(&state.pool, &owner, id).await?;
    aggregator::refresh_nodepool_status(&state.pool, &mut current).await?;

    let nodepool = nodepool_db::soft_delete_nodepool(
        &state.pool,
        &owner,
        id,
        query.force,
        &state.settings.deletable_phases,
    )
    .await?;

    let event = nodepool_lifecycle_event("deleted", &nodepool, &state.settings.event_source);
    state
        .publisher
        .publish_nodepool_lifecycle(&event)
        .await
        .map_err(StoreError::Transport)?;

    Ok(Json(nodepool))
}

/// Aggregated status plus the per-controller breakdown
pub async fn get_nodepool_status(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let mut nodepool = nodepool_db::get_nodepool(&state.pool, &owner, id).await?;
    aggregator::refresh_nodepool_status(&state.pool, &mut nodepool).await?;
    let controllers = status_db::list_nodepool_controller_status(&state.pool, id).await?;
    Ok(Json(ResourceStatusResponse {
        id: nodepool.id,
        generation: nodepool.generation,
        status: nodepool.status,
        controllers,
    }))
}

/// Controller status upsert for a node pool. Not owner-scoped.
pub async fn put_nodepool_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpsertControllerStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let report = status_db::upsert_nodepool_controller_status(&state.pool, id, &req).await?;
    Ok(Json(report))
}

/// Publish an immediate reconcile event for this node pool
pub async fn trigger_nodepool_reconcile(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let nodepool = nodepool_db::get_nodepool(&state.pool, &owner, id).await?;
    let event = state
        .scheduler
        .trigger_nodepool(nodepool.cluster_id, nodepool.id)
        .await
        .map_err(StoreError::Transport)?;
    Ok((StatusCode::ACCEPTED, Json(event)))
}
