use anyhow::Context;
use deadpool_postgres::Pool;
use lattice_common::now_ms;
use uuid::Uuid;

use crate::error::{StoreError, is_foreign_key_violation};
use crate::models::{
    ClusterStatusInfo, ControllerStatus, NodePoolStatusInfo, UpsertControllerStatusRequest,
};

const STATUS_COLUMNS: &str =
    "controller, observed_generation, conditions, metadata, last_error, updated_at";

fn status_from_row(row: &tokio_postgres::Row) -> Result<ControllerStatus, StoreError> {
    let conditions: serde_json::Value = row.get("conditions");
    let conditions =
        serde_json::from_value(conditions).context("failed to decode status conditions")?;
    let last_error: Option<serde_json::Value> = row.get("last_error");
    let last_error = match last_error {
        Some(value) => Some(serde_json::from_value(value).context("failed to decode last_error")?),
        None => None,
    };
    Ok(ControllerStatus {
        controller: row.get("controller"),
        observed_generation: row.get("observed_generation"),
        conditions,
        metadata: row.get("metadata"),
        last_error,
        updated_at: row.get("updated_at"),
    })
}

fn validate_report(req: &UpsertControllerStatusRequest) -> Result<(), StoreError> {
    if req.controller.is_empty() {
        return Err(StoreError::validation("controller", "must not be empty"));
    }
    if req.observed_generation < 0 {
        return Err(StoreError::validation(
            "observed_generation",
            "must be non-negative",
        ));
    }
    Ok(())
}

/// Insert or replace one controller's report for a cluster.
///
/// The trigger layer marks the cluster's aggregated status dirty in the same
/// transaction; this function never aggregates.
pub async fn upsert_cluster_controller_status(
    pool: &Pool,
    cluster_id: Uuid,
    req: &UpsertControllerStatusRequest,
) -> Result<ControllerStatus, StoreError> {
    validate_report(req)?;

    let client = pool.get().await.context("failed to get db connection")?;

    let live = client
        .query_opt(
            "SELECT id FROM clusters WHERE id = $1 AND deleted_at IS NULL",
            &[&cluster_id],
        )
        .await
        .context("failed to query cluster")?;
    if live.is_none() {
        return Err(StoreError::not_found("cluster", cluster_id));
    }

    let conditions =
        serde_json::to_value(&req.conditions).context("failed to encode conditions")?;
    let last_error = match req.last_error {
        Some(ref e) => Some(serde_json::to_value(e).context("failed to encode last_error")?),
        None => None,
    };
    let now = now_ms();

    let row = match client
        .query_one(
            &format!(
                r#"
                INSERT INTO controller_status
                    (cluster_id, controller, observed_generation, conditions, metadata, last_error, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (cluster_id, controller) DO UPDATE SET
                    observed_generation = EXCLUDED.observed_generation,
                    conditions = EXCLUDED.conditions,
                    metadata = EXCLUDED.metadata,
                    last_error = EXCLUDED.last_error,
                    updated_at = EXCLUDED.updated_at
                RETURNING {STATUS_COLUMNS}
                "#
            ),
            &[
                &cluster_id,
                &req.controller,
                &req.observed_generation,
                &conditions,
                &req.metadata,
                &last_error,
                &now,
            ],
        )
        .await
    {
        Ok(row) => row,
        Err(e) if is_foreign_key_violation(&e) => {
            return Err(StoreError::not_found("cluster", cluster_id));
        }
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context("failed to upsert controller status")
                .into());
        }
    };

    status_from_row(&row)
}

/// Insert or replace one controller's report for a node pool.
pub async fn upsert_nodepool_controller_status(
    pool: &Pool,
    nodepool_id: Uuid,
    req: &UpsertControllerStatusRequest,
) -> Result<ControllerStatus, StoreError> {
    validate_report(req)?;

    let client = pool.get().await.context("failed to get db connection")?;

    let live = client
        .query_opt(
            "SELECT id FROM nodepools WHERE id = $1 AND deleted_at IS NULL",
            &[&nodepool_id],
        )
        .await
        .context("failed to query nodepool")?;
    if live.is_none() {
        return Err(StoreError::not_found("nodepool", nodepool_id));
    }

    let conditions =
        serde_json::to_value(&req.conditions).context("failed to encode conditions")?;
    let last_error = match req.last_error {
        Some(ref e) => Some(serde_json::to_value(e).context("failed to encode last_error")?),
        None => None,
    };
    let now = now_ms();

    let row = match client
        .query_one(
            &format!(
                r#"
                INSERT INTO nodepool_controller_status
                    (nodepool_id, controller, observed_generation, conditions, metadata, last_error, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (nodepool_id, controller) DO UPDATE SET
                    observed_generation = EXCLUDED.observed_generation,
                    conditions = EXCLUDED.conditions,
                    metadata = EXCLUDED.metadata,
                    last_error = EXCLUDED.last_error,
                    updated_at = EXCLUDED.updated_at
                RETURNING {STATUS_COLUMNS}
                "#
            ),
            &[
                &nodepool_id,
                &req.controller,
                &req.observed_generation,
                &conditions,
                &req.metadata,
                &last_error,
                &now,
            ],
        )
        .await
    {
        Ok(row) => row,
        Err(e) if is_foreign_key_violation(&e) => {
            return Err(StoreError::not_found("nodepool", nodepool_id));
        }
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context("failed to upsert controller status")
                .into());
        }
    };

    status_from_row(&row)
}

/// All controller reports for a cluster, newest first. Used for the
/// per-controller breakdown; aggregation uses the generation-filtered query.
pub async fn list_cluster_controller_status(
    pool: &Pool,
    cluster_id: Uuid,
) -> Result<Vec<ControllerStatus>, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {STATUS_COLUMNS} FROM controller_status WHERE cluster_id = $1 ORDER BY updated_at DESC, controller ASC"
            ),
            &[&cluster_id],
        )
        .await
        .context("failed to list controller status")?;

    rows.iter().map(status_from_row).collect()
}

pub async fn list_nodepool_controller_status(
    pool: &Pool,
    nodepool_id: Uuid,
) -> Result<Vec<ControllerStatus>, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {STATUS_COLUMNS} FROM nodepool_controller_status WHERE nodepool_id = $1 ORDER BY updated_at DESC, controller ASC"
            ),
            &[&nodepool_id],
        )
        .await
        .context("failed to list controller status")?;

    rows.iter().map(status_from_row).collect()
}

/// Controller reports pinned to the resource's current generation. Stale
/// reports from earlier generations never reach the aggregator.
pub async fn list_current_cluster_controller_status(
    pool: &Pool,
    cluster_id: Uuid,
    generation: i64,
) -> Result<Vec<ControllerStatus>, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {STATUS_COLUMNS} FROM controller_status WHERE cluster_id = $1 AND observed_generation = $2 ORDER BY controller ASC"
            ),
            &[&cluster_id, &generation],
        )
        .await
        .context("failed to list current controller status")?;

    rows.iter().map(status_from_row).collect()
}

pub async fn list_current_nodepool_controller_status(
    pool: &Pool,
    nodepool_id: Uuid,
    generation: i64,
) -> Result<Vec<ControllerStatus>, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {STATUS_COLUMNS} FROM nodepool_controller_status WHERE nodepool_id = $1 AND observed_generation = $2 ORDER BY controller ASC"
            ),
            &[&nodepool_id, &generation],
        )
        .await
        .context("failed to list current controller status")?;

    rows.iter().map(status_from_row).collect()
}

/// Persist a freshly computed aggregated block and clear the dirty flag.
///
/// Leaves generation, resource_version and updated_at alone: aggregation
/// is a derived view, not a mutation of desired state. Last writer wins
/// under concurrent recomputation.
pub async fn persist_cluster_status(
    pool: &Pool,
    cluster_id: Uuid,
    status: &ClusterStatusInfo,
) -> Result<(), StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let value = serde_json::to_value(status).context("failed to encode cluster status")?;
    client
        .execute(
            "UPDATE clusters SET status = $1, status_dirty = FALSE WHERE id = $2",
            &[&value, &cluster_id],
        )
        .await
        .context("failed to persist cluster status")?;
    Ok(())
}

pub async fn persist_nodepool_status(
    pool: &Pool,
    nodepool_id: Uuid,
    status: &NodePoolStatusInfo,
) -> Result<(), StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let value = serde_json::to_value(status).context("failed to encode nodepool status")?;
    client
        .execute(
            "UPDATE nodepools SET status = $1, status_dirty = FALSE WHERE id = $2",
            &[&value, &nodepool_id],
        )
        .await
        .context("failed to persist nodepool status")?;
    Ok(())
}
