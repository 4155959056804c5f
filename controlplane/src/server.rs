use anyhow::{Context, Result, bail};
use axum::{
    Json, Router,
    extract::{FromRequestParts, State},
    http::{StatusCode, request::Parts},
    response::IntoResponse,
    routing::{get, post},
};
use deadpool_postgres::Pool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::args::ServerArgs;
use crate::error::{ApiError, StoreError};
use crate::models::Phase;
use crate::publisher::{JetStreamPublisher, Publisher};
use crate::reactive::ReactiveReconciler;
use crate::scheduler::{PeriodicScheduler, SchedulerConfig};
use crate::{db, handlers, nodepool_handlers};

/// Knobs the handlers need at request time.
pub struct ApiSettings {
    pub page_limit_default: i64,
    pub page_limit_max: i64,
    pub deletable_phases: Vec<Phase>,
    pub dev_default_user: Option<String>,
    pub event_source: String,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub publisher: Arc<dyn Publisher>,
    pub scheduler: Arc<PeriodicScheduler>,
    pub reactive: Arc<ReactiveReconciler>,
    pub settings: Arc<ApiSettings>,
}

/// Caller identity from the `X-User-Email` header, used only as the opaque
/// owner string. In dev mode a configured default stands in for the header.
pub struct UserEmail(pub String);

impl FromRequestParts<AppState> for UserEmail {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(value) = parts.headers.get("x-user-email") {
            let email = value.to_str().map_err(|_| {
                ApiError(StoreError::validation(
                    "x-user-email",
                    "header is not valid UTF-8",
                ))
            })?;
            if !email.is_empty() {
                return Ok(UserEmail(email.to_string()));
            }
        }
        if let Some(ref default_user) = state.settings.dev_default_user {
            return Ok(UserEmail(default_user.clone()));
        }
        Err(ApiError(StoreError::validation(
            "x-user-email",
            "header is required",
        )))
    }
}

fn parse_deletable_phases(raw: &[String]) -> Result<Vec<Phase>> {
    let mut phases = Vec::with_capacity(raw.len());
    for value in raw {
        let value = value.trim();
        match Phase::parse(value) {
            Some(phase) => phases.push(phase),
            None => bail!("unknown phase '{value}' in --deletable-phases"),
        }
    }
    if phases.is_empty() {
        bail!("--deletable-phases must name at least one phase");
    }
    Ok(phases)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/v1/clusters",
            get(handlers::list_clusters).post(handlers::create_cluster),
        )
        .route(
            "/api/v1/clusters/{id}",
            get(handlers::get_cluster)
                .put(handlers::update_cluster)
                .delete(handlers::delete_cluster),
        )
        .route(
            "/api/v1/clusters/{id}/status",
            get(handlers::get_cluster_status).put(handlers::put_cluster_status),
        )
        .route(
            "/api/v1/clusters/{id}/reconcile",
            post(handlers::trigger_cluster_reconcile),
        )
        .route(
            "/api/v1/nodepools",
            get(nodepool_handlers::list_nodepools).post(nodepool_handlers::create_nodepool),
        )
        .route(
            "/api/v1/nodepools/{id}",
            get(nodepool_handlers::get_nodepool)
                .put(nodepool_handlers::update_nodepool)
                .delete(nodepool_handlers::delete_nodepool),
        )
        .route(
            "/api/v1/nodepools/{id}/status",
            get(nodepool_handlers::get_nodepool_status)
                .put(nodepool_handlers::put_nodepool_status),
        )
        .route(
            "/api/v1/nodepools/{id}/reconcile",
            post(nodepool_handlers::trigger_nodepool_reconcile),
        )
        .route(
            "/api/v1/config/reactive",
            get(handlers::get_reactive_config).put(handlers::put_reactive_config),
        )
        .with_state(state)
}

/// Service health. Degraded (still 200) when the notification bus is down
/// but the store is reachable: the periodic scheduler alone keeps the
/// system correct in that state.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = db::ping(&state.pool).await.is_ok();
    let reactive = state.reactive.status().await;
    let degraded = state.reactive.is_degraded().await;

    let status = if !db_ok {
        "unhealthy"
    } else if degraded {
        "degraded"
    } else {
        "healthy"
    };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": status,
        "database": db_ok,
        "scheduler_running": state.scheduler.is_running(),
        "reactive": reactive,
    });
    (code, Json(body))
}

pub async fn run_server(args: ServerArgs) -> Result<()> {
    let deletable_phases = parse_deletable_phases(&args.deletable_phases)?;
    if args.pagination.page_limit_max < 1 {
        bail!("page_limit_max must be positive");
    }
    if args.pagination.page_limit_default < 1
        || args.pagination.page_limit_default > args.pagination.page_limit_max
    {
        bail!("page_limit_default must be between 1 and page_limit_max");
    }

    let pool = lattice_common::postgres::create_pool(args.postgres.clone()).await;
    tracing::info!("connected to Postgres");
    db::init_schema(&pool).await?;

    let nats = args.nats.connect().await?;
    tracing::info!(url = %args.nats.nats_url, "connected to NATS");
    let publisher: Arc<dyn Publisher> = Arc::new(JetStreamPublisher::new(nats).await?);

    let scheduler_config = SchedulerConfig {
        check_interval: std::time::Duration::from_secs(args.scheduler.check_interval_secs),
        default_interval: std::time::Duration::from_secs(args.scheduler.default_interval_secs),
        max_concurrent: args.scheduler.max_concurrent,
    };
    let scheduler = Arc::new(PeriodicScheduler::new(
        pool.clone(),
        publisher.clone(),
        scheduler_config,
    ));
    scheduler.start().await.context("scheduler refused to start")?;

    let reactive = Arc::new(ReactiveReconciler::new(
        pool.clone(),
        args.postgres.clone(),
        publisher.clone(),
    ));
    // The reactive path is optional: without it the periodic scheduler still
    // converges every resource, just slower.
    if let Err(e) = reactive.start().await {
        tracing::error!(error = ?e, "reactive reconciler failed to start, continuing without it");
    }

    lattice_common::metrics::maybe_spawn_metrics_server();

    let state = AppState {
        pool,
        publisher,
        scheduler: scheduler.clone(),
        reactive: reactive.clone(),
        settings: Arc::new(ApiSettings {
            page_limit_default: args.pagination.page_limit_default,
            page_limit_max: args.pagination.page_limit_max,
            deletable_phases,
            dev_default_user: args.dev_default_user.clone(),
            event_source: args.event_source.clone(),
        }),
    };

    let shutdown = CancellationToken::new();
    lattice_common::shutdown::cancel_on_signal(shutdown.clone());

    let app = router(state);
    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port))
        .await
        .with_context(|| format!("failed to bind port {}", args.port))?;
    tracing::info!(port = args.port, "control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("server error")?;

    reactive.stop().await;
    scheduler.stop().await;
    tracing::info!("control plane stopped gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletable_phases_parse_and_reject() {
        let parsed =
            parse_deletable_phases(&["Pending".to_string(), "Failed".to_string()]).expect("parse");
        assert_eq!(parsed, vec![Phase::Pending, Phase::Failed]);

        assert!(parse_deletable_phases(&["Nope".to_string()]).is_err());
        assert!(parse_deletable_phases(&[]).is_err());
    }
}
