use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, StoreError};
use crate::models::{
    CreateClusterRequest, Phase, ReactiveConfig, ResourceStatusResponse, UpdateClusterRequest,
    UpsertControllerStatusRequest,
};
use crate::publisher::cluster_lifecycle_event;
use crate::server::{ApiSettings, AppState, UserEmail};
use crate::{aggregator, db, status_db};

#[derive(Debug, Deserialize)]
pub struct ListClustersQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub platform: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
}

/// Clamp-free pagination: out-of-range values are rejected, not adjusted.
pub fn resolve_pagination(
    settings: &ApiSettings,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<(i64, i64), StoreError> {
    let limit = limit.unwrap_or(settings.page_limit_default);
    if limit < 1 || limit > settings.page_limit_max {
        return Err(StoreError::validation(
            "limit",
            format!("must be between 1 and {}", settings.page_limit_max),
        ));
    }
    let offset = offset.unwrap_or(0);
    if offset < 0 {
        return Err(StoreError::validation("offset", "must be non-negative"));
    }
    Ok((limit, offset))
}

pub fn validate_platform_filter(platform: Option<&str>) -> Result<(), StoreError> {
    match platform {
        None | Some("gcp") | Some("aws") | Some("azure") => Ok(()),
        Some(other) => Err(StoreError::validation(
            "platform",
            format!("unknown platform '{other}'"),
        )),
    }
}

pub fn validate_phase_filter(phase: Option<&str>) -> Result<(), StoreError> {
    match phase {
        None => Ok(()),
        Some(value) => match Phase::parse(value) {
            Some(_) => Ok(()),
            None => Err(StoreError::validation(
                "status",
                format!("unknown phase '{value}'"),
            )),
        },
    }
}

/// List clusters owned by the caller
pub async fn list_clusters(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Query(query): Query<ListClustersQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (limit, offset) = resolve_pagination(&state.settings, query.limit, query.offset)?;
    validate_platform_filter(query.platform.as_deref())?;
    validate_phase_filter(query.status.as_deref())?;

    let mut response = db::list_clusters(
        &state.pool,
        &owner,
        offset,
        limit,
        query.platform.as_deref(),
        query.status.as_deref(),
    )
    .await?;

    for cluster in response.items.iter_mut() {
        aggregator::refresh_cluster_status(&state.pool, cluster).await?;
    }

    Ok(Json(response))
}

/// Create a new cluster
pub async fn create_cluster(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Json(req): Json<CreateClusterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cluster = db::create_cluster(&state.pool, &owner, &req).await?;

    let event = cluster_lifecycle_event("created", &cluster, &state.settings.event_source);
    state
        .publisher
        .publish_cluster_lifecycle(&event)
        .await
        .map_err(StoreError::Transport)?;

    Ok((StatusCode::CREATED, Json(cluster)))
}

/// Get a cluster by ID
pub async fn get_cluster(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let mut cluster = db::get_cluster(&state.pool, &owner, id).await?;
    aggregator::refresh_cluster_status(&state.pool, &mut cluster).await?;
    Ok(Json(cluster))
}

/// Update a cluster's spec, bumping its generation
pub async fn update_cluster(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateClusterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cluster = db::update_cluster_spec(
        &state.pool,
        &owner,
        id,
        &req.spec,
        req.resource_version.as_deref(),
    )
    .await?;

    let event = cluster_lifecycle_event("updated", &cluster, &state.settings.event_source);
    state
        .publisher
        .publish_cluster_lifecycle(&event)
        .await
        .map_err(StoreError::Transport)?;

    Ok(Json(cluster))
}

/// Soft-delete a cluster, cascading to its node pools
pub async fn delete_cluster(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Path(id): Path<Uuid>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    // Refresh first so the phase gate sees current reality, not a stale block.
    let mut current = db::get_cluster(&state.pool, &owner, id).await?;
    aggregator::refresh_cluster_status(&state.pool, &mut current).await?;

    let cluster = db::soft_delete_cluster(
        &state.pool,
        &owner,
        id,
        query.force,
        &state.settings.deletable_phases,
    )
    .await?;

    let event = cluster_lifecycle_event("deleted", &cluster, &state.settings.event_source);
    state
        .publisher
        .publish_cluster_lifecycle(&event)
        .await
        .map_err(StoreError::Transport)?;

    Ok(Json(cluster))
}

/// Aggregated status plus the per-controller breakdown
pub async fn get_cluster_status(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let mut cluster = db::get_cluster(&state.pool, &owner, id).await?;
    aggregator::refresh_cluster_status(&state.pool, &mut cluster).await?;
    let controllers = status_db::list_cluster_controller_status(&state.pool, id).await?;
    Ok(Json(ResourceStatusResponse {
        id: cluster.id,
        generation: cluster.generation,
        status: cluster.status,
        controllers,
    }))
}

/// Controller status upsert. Not owner-scoped: controllers are not the
/// resource owner, and authorization is handled outside this service.
pub async fn put_cluster_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpsertControllerStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let report = status_db::upsert_cluster_controller_status(&state.pool, id, &req).await?;
    Ok(Json(report))
}

/// Publish an immediate reconcile event for this cluster
pub async fn trigger_cluster_reconcile(
    State(state): State<AppState>,
    UserEmail(owner): UserEmail,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cluster = db::get_cluster(&state.pool, &owner, id).await?;
    let event = state
        .scheduler
        .trigger_cluster(cluster.id)
        .await
        .map_err(StoreError::Transport)?;
    Ok((StatusCode::ACCEPTED, Json(event)))
}

/// Read the reactive reconciliation config
pub async fn get_reactive_config(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let config = db::get_reactive_config(&state.pool).await?;
    Ok(Json(config))
}

/// Replace the reactive reconciliation config; the poll loop applies it
/// within one poll interval
pub async fn put_reactive_config(
    State(state): State<AppState>,
    Json(config): Json<ReactiveConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let stored = db::set_reactive_config(&state.pool, &config).await?;
    Ok(Json(stored))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ApiSettings {
        ApiSettings {
            page_limit_default: 50,
            page_limit_max: 100,
            deletable_phases: vec![Phase::Pending, Phase::Failed],
            dev_default_user: None,
            event_source: "test".to_string(),
        }
    }

    #[test]
    fn pagination_defaults_apply() {
        let (limit, offset) = resolve_pagination(&settings(), None, None).expect("defaults");
        assert_eq!((limit, offset), (50, 0));
    }

    #[test]
    fn pagination_bounds_are_rejected_not_clamped() {
        let s = settings();
        assert!(resolve_pagination(&s, Some(0), None).is_err());
        assert!(resolve_pagination(&s, Some(101), None).is_err());
        assert!(resolve_pagination(&s, Some(100), None).is_ok());
        assert!(resolve_pagination(&s, None, Some(-1)).is_err());
        assert!(resolve_pagination(&s, Some(1), Some(0)).is_ok());
    }

    #[test]
    fn filters_validate_against_known_values() {
        assert!(validate_platform_filter(None).is_ok());
        assert!(validate_platform_filter(Some("gcp")).is_ok());
        assert!(validate_platform_filter(Some("ibm")).is_err());
        assert!(validate_phase_filter(Some("Ready")).is_ok());
        assert!(validate_phase_filter(Some("ready")).is_err());
    }
}
