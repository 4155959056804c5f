use anyhow::Context;
use deadpool_postgres::Pool;
use lattice_common::now_ms;
use uuid::Uuid;

use crate::error::{StoreError, is_unique_violation};
use crate::models::{
    CreateNodePoolRequest, ListNodePoolsResponse, NodePool, NodePoolSpec, NodePoolStatusInfo,
    Phase,
};

pub const NODEPOOL_COLUMNS: &str =
    "id, cluster_id, name, owner, generation, resource_version, spec, status, status_dirty, created_at, updated_at, deleted_at";

pub fn nodepool_from_row(row: &tokio_postgres::Row) -> Result<NodePool, StoreError> {
    let spec: serde_json::Value = row.get("spec");
    let spec: NodePoolSpec =
        serde_json::from_value(spec).context("failed to decode nodepool spec")?;
    let status: Option<serde_json::Value> = row.get("status");
    let status: Option<NodePoolStatusInfo> = match status {
        Some(value) => {
            Some(serde_json::from_value(value).context("failed to decode nodepool status")?)
        }
        None => None,
    };
    Ok(NodePool {
        id: row.get("id"),
        cluster_id: row.get("cluster_id"),
        name: row.get("name"),
        owner: row.get("owner"),
        generation: row.get("generation"),
        resource_version: row.get("resource_version"),
        spec,
        status,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
        status_dirty: row.get("status_dirty"),
    })
}

/// Insert a new node pool under an existing, live cluster owned by `owner`.
pub async fn create_nodepool(
    pool: &Pool,
    owner: &str,
    req: &CreateNodePoolRequest,
) -> Result<NodePool, StoreError> {
    if req.name.is_empty() {
        return Err(StoreError::validation("name", "must not be empty"));
    }
    req.spec
        .validate()
        .map_err(|reason| StoreError::Validation {
            field: "spec",
            reason,
        })?;

    let client = pool.get().await.context("failed to get db connection")?;

    // Parent must exist, be live, and belong to the caller.
    let parent = client
        .query_opt(
            "SELECT id FROM clusters WHERE id = $1 AND owner = $2 AND deleted_at IS NULL",
            &[&req.cluster_id, &owner],
        )
        .await
        .context("failed to query parent cluster")?;
    if parent.is_none() {
        return Err(StoreError::not_found("cluster", req.cluster_id));
    }

    let id = Uuid::new_v4();
    let resource_version = Uuid::new_v4().to_string();
    let now = now_ms();
    let spec = serde_json::to_value(&req.spec).context("failed to encode nodepool spec")?;

    let row = match client
        .query_one(
            &format!(
                r#"
                INSERT INTO nodepools
                    (id, cluster_id, name, owner, generation, resource_version, spec, created_at, updated_at)
                VALUES ($1, $2, $3, $4, 1, $5, $6, $7, $7)
                RETURNING {NODEPOOL_COLUMNS}
                "#
            ),
            &[
                &id,
                &req.cluster_id,
                &req.name,
                &owner,
                &resource_version,
                &spec,
                &now,
            ],
        )
        .await
    {
        Ok(row) => row,
        Err(e) if is_unique_violation(&e) => {
            return Err(StoreError::NameConflict {
                kind: "nodepool",
                name: req.name.clone(),
            });
        }
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context("failed to insert nodepool")
                .into());
        }
    };

    nodepool_from_row(&row)
}

/// Get a live node pool by id, scoped to its owner.
pub async fn get_nodepool(pool: &Pool, owner: &str, id: Uuid) -> Result<NodePool, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!(
                "SELECT {NODEPOOL_COLUMNS} FROM nodepools WHERE id = $1 AND owner = $2 AND deleted_at IS NULL"
            ),
            &[&id, &owner],
        )
        .await
        .context("failed to query nodepool")?;

    match row {
        Some(row) => nodepool_from_row(&row),
        None => Err(StoreError::not_found("nodepool", id)),
    }
}

/// Get a live node pool by id regardless of owner (internal lookups only).
pub async fn get_nodepool_any(pool: &Pool, id: Uuid) -> Result<Option<NodePool>, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!(
                "SELECT {NODEPOOL_COLUMNS} FROM nodepools WHERE id = $1 AND deleted_at IS NULL"
            ),
            &[&id],
        )
        .await
        .context("failed to query nodepool")?;

    row.map(|r| nodepool_from_row(&r)).transpose()
}

/// List live node pools owned by `owner`, optionally scoped to one cluster.
pub async fn list_nodepools(
    pool: &Pool,
    owner: &str,
    offset: i64,
    limit: i64,
    cluster_id: Option<Uuid>,
    phase: Option<&str>,
) -> Result<ListNodePoolsResponse, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let mut conditions = vec!["owner = $1".to_string(), "deleted_at IS NULL".to_string()];
    let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = vec![&owner];
    let mut param_idx = 2;

    if let Some(ref cid) = cluster_id {
        conditions.push(format!("cluster_id = ${}", param_idx));
        params.push(cid);
        param_idx += 1;
    }
    if let Some(ref p) = phase {
        conditions.push(format!("status->>'phase' = ${}", param_idx));
        params.push(p);
        param_idx += 1;
    }

    let query = format!(
        r#"
        SELECT {NODEPOOL_COLUMNS}, COUNT(*) OVER() AS full_count
        FROM nodepools
        WHERE {}
        ORDER BY name ASC, id ASC
        LIMIT ${} OFFSET ${}
        "#,
        conditions.join(" AND "),
        param_idx,
        param_idx + 1,
    );
    params.push(&limit);
    params.push(&offset);

    let rows = client
        .query(&query, &params)
        .await
        .context("failed to list nodepools")?;

    let full_count: i64 = rows.first().map(|r| r.get("full_count")).unwrap_or(0);
    let items = rows
        .iter()
        .map(nodepool_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    let truncated = offset + (items.len() as i64) < full_count;

    Ok(ListNodePoolsResponse {
        offset,
        limit,
        full_count,
        truncated,
        items,
    })
}

/// Replace a node pool's spec, bumping the generation by exactly one.
/// Node pool generations move independently of the parent cluster's.
pub async fn update_nodepool_spec(
    pool: &Pool,
    owner: &str,
    id: Uuid,
    spec: &NodePoolSpec,
    expected_version: Option<&str>,
) -> Result<NodePool, StoreError> {
    spec.validate().map_err(|reason| StoreError::Validation {
        field: "spec",
        reason,
    })?;

    let client = pool.get().await.context("failed to get db connection")?;

    let state = client
        .query_opt(
            "SELECT resource_version, deleted_at FROM nodepools WHERE id = $1 AND owner = $2",
            &[&id, &owner],
        )
        .await
        .context("failed to query nodepool state")?;

    let Some(state_row) = state else {
        return Err(StoreError::not_found("nodepool", id));
    };
    let deleted_at: Option<i64> = state_row.get("deleted_at");
    if deleted_at.is_some() {
        return Err(StoreError::PendingDeletion {
            kind: "nodepool",
            id,
        });
    }
    if let Some(expected) = expected_version {
        let current: String = state_row.get("resource_version");
        if current != expected {
            return Err(StoreError::StaleVersion {
                kind: "nodepool",
                id,
            });
        }
    }

    let resource_version = Uuid::new_v4().to_string();
    let now = now_ms();
    let spec_value = serde_json::to_value(spec).context("failed to encode nodepool spec")?;

    let (clause, cas): (&str, Option<&str>) = match expected_version {
        Some(expected) => ("AND resource_version = $5", Some(expected)),
        None => ("", None),
    };
    // The generation bump invalidates every existing controller report, so
    // the cached status block is dirtied in the same statement.
    let query = format!(
        r#"
        UPDATE nodepools
        SET spec = $1, generation = generation + 1, resource_version = $2, updated_at = $3,
            status_dirty = TRUE
        WHERE id = $4 AND deleted_at IS NULL {clause}
        RETURNING {NODEPOOL_COLUMNS}
        "#
    );
    let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
        vec![&spec_value, &resource_version, &now, &id];
    if let Some(ref expected) = cas {
        params.push(expected);
    }

    let row = client
        .query_opt(&query, &params)
        .await
        .context("failed to update nodepool")?;

    match row {
        Some(row) => nodepool_from_row(&row),
        None => Err(StoreError::StaleVersion {
            kind: "nodepool",
            id,
        }),
    }
}

/// Soft-delete a node pool. Idempotent; the schedule row is removed by the
/// store's trigger layer.
pub async fn soft_delete_nodepool(
    pool: &Pool,
    owner: &str,
    id: Uuid,
    force: bool,
    deletable_phases: &[Phase],
) -> Result<NodePool, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {NODEPOOL_COLUMNS} FROM nodepools WHERE id = $1 AND owner = $2"),
            &[&id, &owner],
        )
        .await
        .context("failed to query nodepool")?;

    let Some(row) = row else {
        return Err(StoreError::not_found("nodepool", id));
    };
    let nodepool = nodepool_from_row(&row)?;
    if nodepool.deleted_at.is_some() {
        return Ok(nodepool);
    }
    if !force {
        let phase = nodepool.phase();
        if !deletable_phases.contains(&phase) {
            return Err(StoreError::DeleteRefused {
                kind: "nodepool",
                id,
                phase,
            });
        }
    }

    let now = now_ms();
    let resource_version = Uuid::new_v4().to_string();
    let row = client
        .query_one(
            &format!(
                r#"
                UPDATE nodepools
                SET deleted_at = $1, updated_at = $1, resource_version = $2
                WHERE id = $3 AND deleted_at IS NULL
                RETURNING {NODEPOOL_COLUMNS}
                "#
            ),
            &[&now, &resource_version, &id],
        )
        .await
        .context("failed to soft-delete nodepool")?;

    nodepool_from_row(&row)
}
