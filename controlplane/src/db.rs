use anyhow::Context;
use deadpool_postgres::Pool;
use lattice_common::now_ms;
use uuid::Uuid;

use crate::error::{StoreError, is_unique_violation};
use crate::models::{
    Cluster, ClusterSpec, ClusterStatusInfo, CreateClusterRequest, ListClustersResponse, Phase,
    ReactiveConfig,
};

pub const CLUSTER_COLUMNS: &str =
    "id, name, owner, project, generation, resource_version, spec, status, status_dirty, created_at, updated_at, deleted_at";

/// Initialize the database schema, creating tables if they don't exist.
///
/// Schedule creation, change notification, and status dirtying must be
/// atomic with the writes that cause them; the trigger layer runs inside
/// the writing transaction, so it lives here with the schema.
pub async fn init_schema(pool: &Pool) -> Result<(), StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS clusters (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                owner TEXT NOT NULL,
                project TEXT,
                generation BIGINT NOT NULL DEFAULT 1,
                resource_version TEXT NOT NULL,
                spec JSONB NOT NULL,
                status JSONB,
                status_dirty BOOLEAN NOT NULL DEFAULT FALSE,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                deleted_at BIGINT
            )
            "#,
            &[],
        )
        .await
        .context("failed to create clusters table")?;

    // Name uniqueness only among live rows; a soft-deleted cluster frees
    // its name for reuse.
    client
        .execute(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_clusters_live_name
            ON clusters (name) WHERE deleted_at IS NULL
            "#,
            &[],
        )
        .await
        .context("failed to create cluster name index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS nodepools (
                id UUID PRIMARY KEY,
                cluster_id UUID NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                owner TEXT NOT NULL,
                generation BIGINT NOT NULL DEFAULT 1,
                resource_version TEXT NOT NULL,
                spec JSONB NOT NULL,
                status JSONB,
                status_dirty BOOLEAN NOT NULL DEFAULT FALSE,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                deleted_at BIGINT
            )
            "#,
            &[],
        )
        .await
        .context("failed to create nodepools table")?;

    client
        .execute(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_nodepools_live_name
            ON nodepools (cluster_id, name) WHERE deleted_at IS NULL
            "#,
            &[],
        )
        .await
        .context("failed to create nodepool name index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS controller_status (
                cluster_id UUID NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
                controller TEXT NOT NULL,
                observed_generation BIGINT NOT NULL,
                conditions JSONB NOT NULL,
                metadata JSONB,
                last_error JSONB,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (cluster_id, controller)
            )
            "#,
            &[],
        )
        .await
        .context("failed to create controller_status table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS nodepool_controller_status (
                nodepool_id UUID NOT NULL REFERENCES nodepools(id) ON DELETE CASCADE,
                controller TEXT NOT NULL,
                observed_generation BIGINT NOT NULL,
                conditions JSONB NOT NULL,
                metadata JSONB,
                last_error JSONB,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (nodepool_id, controller)
            )
            "#,
            &[],
        )
        .await
        .context("failed to create nodepool_controller_status table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS reconciliation_schedule (
                cluster_id UUID PRIMARY KEY REFERENCES clusters(id) ON DELETE CASCADE,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                last_reconciled_at BIGINT,
                next_reconcile_at BIGINT NOT NULL,
                reconcile_interval_ms BIGINT NOT NULL,
                healthy_interval_ms BIGINT NOT NULL,
                unhealthy_interval_ms BIGINT NOT NULL,
                adaptive_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                is_healthy BOOLEAN,
                last_health_check BIGINT
            )
            "#,
            &[],
        )
        .await
        .context("failed to create reconciliation_schedule table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS nodepool_reconciliation_schedule (
                nodepool_id UUID PRIMARY KEY REFERENCES nodepools(id) ON DELETE CASCADE,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                last_reconciled_at BIGINT,
                next_reconcile_at BIGINT NOT NULL,
                reconcile_interval_ms BIGINT NOT NULL,
                healthy_interval_ms BIGINT NOT NULL,
                unhealthy_interval_ms BIGINT NOT NULL,
                adaptive_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                is_healthy BOOLEAN,
                last_health_check BIGINT
            )
            "#,
            &[],
        )
        .await
        .context("failed to create nodepool_reconciliation_schedule table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS reactive_reconciliation_config (
                id BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (id),
                enabled BOOLEAN NOT NULL,
                change_types TEXT[] NOT NULL,
                debounce_ms BIGINT NOT NULL,
                max_events_per_minute BIGINT NOT NULL,
                database_poll_interval_ms BIGINT NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create reactive_reconciliation_config table")?;

    let defaults = ReactiveConfig::default();
    client
        .execute(
            r#"
            INSERT INTO reactive_reconciliation_config
                (id, enabled, change_types, debounce_ms, max_events_per_minute, database_poll_interval_ms)
            VALUES (TRUE, $1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
            &[
                &defaults.enabled,
                &defaults.change_types,
                &defaults.debounce_ms,
                &defaults.max_events_per_minute,
                &defaults.database_poll_interval_ms,
            ],
        )
        .await
        .context("failed to seed reactive_reconciliation_config")?;

    init_triggers(&client).await?;

    tracing::info!("database schema initialized");
    Ok(())
}

async fn init_triggers(client: &deadpool_postgres::Client) -> Result<(), StoreError> {
    client
        .batch_execute(
            r#"
            CREATE OR REPLACE FUNCTION lattice_now_ms() RETURNS BIGINT AS $$
                SELECT (extract(epoch FROM clock_timestamp()) * 1000)::BIGINT
            $$ LANGUAGE sql;
            "#,
        )
        .await
        .context("failed to create lattice_now_ms")?;

    // New resources start on a fast cadence: first reconcile one minute out,
    // healthy interval 5 min, unhealthy interval 30 s.
    client
        .batch_execute(
            r#"
            CREATE OR REPLACE FUNCTION clusters_ensure_schedule() RETURNS trigger AS $$
            BEGIN
                INSERT INTO reconciliation_schedule
                    (cluster_id, enabled, next_reconcile_at,
                     reconcile_interval_ms, healthy_interval_ms, unhealthy_interval_ms)
                VALUES (NEW.id, TRUE, lattice_now_ms() + 60000, 300000, 300000, 30000)
                ON CONFLICT (cluster_id) DO NOTHING;
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;

            DROP TRIGGER IF EXISTS trg_clusters_ensure_schedule ON clusters;
            CREATE TRIGGER trg_clusters_ensure_schedule
                AFTER INSERT ON clusters
                FOR EACH ROW EXECUTE FUNCTION clusters_ensure_schedule();
            "#,
        )
        .await
        .context("failed to install cluster schedule trigger")?;

    client
        .batch_execute(
            r#"
            CREATE OR REPLACE FUNCTION clusters_change_notify() RETURNS trigger AS $$
            BEGIN
                IF NEW.deleted_at IS NOT NULL AND OLD.deleted_at IS NULL THEN
                    DELETE FROM reconciliation_schedule WHERE cluster_id = NEW.id;
                    DELETE FROM nodepool_reconciliation_schedule s
                        USING nodepools np
                        WHERE s.nodepool_id = np.id AND np.cluster_id = NEW.id;
                    PERFORM pg_notify('reconcile_change', json_build_object(
                        'cluster_id', NEW.id,
                        'change_type', 'spec',
                        'reason', 'cluster_deleted',
                        'timestamp', lattice_now_ms())::TEXT);
                    RETURN NEW;
                END IF;
                IF NEW.generation > OLD.generation THEN
                    PERFORM pg_notify('reconcile_change', json_build_object(
                        'cluster_id', NEW.id,
                        'change_type', 'spec',
                        'reason', 'generation_increment',
                        'timestamp', lattice_now_ms())::TEXT);
                END IF;
                IF NEW.owner IS DISTINCT FROM OLD.owner THEN
                    PERFORM pg_notify('reconcile_change', json_build_object(
                        'cluster_id', NEW.id,
                        'change_type', 'owner_change',
                        'reason', 'owner_changed',
                        'timestamp', lattice_now_ms())::TEXT);
                END IF;
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;

            DROP TRIGGER IF EXISTS trg_clusters_change_notify ON clusters;
            CREATE TRIGGER trg_clusters_change_notify
                AFTER UPDATE ON clusters
                FOR EACH ROW EXECUTE FUNCTION clusters_change_notify();
            "#,
        )
        .await
        .context("failed to install cluster change trigger")?;

    // Node-pool notifications always validate the parent cluster is live
    // before raising anything that names it.
    client
        .batch_execute(
            r#"
            CREATE OR REPLACE FUNCTION nodepools_ensure_schedule() RETURNS trigger AS $$
            BEGIN
                INSERT INTO nodepool_reconciliation_schedule
                    (nodepool_id, enabled, next_reconcile_at,
                     reconcile_interval_ms, healthy_interval_ms, unhealthy_interval_ms)
                VALUES (NEW.id, TRUE, lattice_now_ms() + 60000, 300000, 300000, 30000)
                ON CONFLICT (nodepool_id) DO NOTHING;
                IF EXISTS (SELECT 1 FROM clusters c WHERE c.id = NEW.cluster_id AND c.deleted_at IS NULL) THEN
                    PERFORM pg_notify('reconcile_change', json_build_object(
                        'cluster_id', NEW.cluster_id,
                        'nodepool_id', NEW.id,
                        'change_type', 'spec',
                        'reason', 'nodepool_created',
                        'timestamp', lattice_now_ms())::TEXT);
                END IF;
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;

            DROP TRIGGER IF EXISTS trg_nodepools_ensure_schedule ON nodepools;
            CREATE TRIGGER trg_nodepools_ensure_schedule
                AFTER INSERT ON nodepools
                FOR EACH ROW EXECUTE FUNCTION nodepools_ensure_schedule();
            "#,
        )
        .await
        .context("failed to install nodepool schedule trigger")?;

    client
        .batch_execute(
            r#"
            CREATE OR REPLACE FUNCTION nodepools_change_notify() RETURNS trigger AS $$
            BEGIN
                IF NEW.deleted_at IS NOT NULL AND OLD.deleted_at IS NULL THEN
                    DELETE FROM nodepool_reconciliation_schedule WHERE nodepool_id = NEW.id;
                    RETURN NEW;
                END IF;
                IF NEW.generation > OLD.generation
                   AND EXISTS (SELECT 1 FROM clusters c WHERE c.id = NEW.cluster_id AND c.deleted_at IS NULL) THEN
                    PERFORM pg_notify('reconcile_change', json_build_object(
                        'cluster_id', NEW.cluster_id,
                        'nodepool_id', NEW.id,
                        'change_type', 'spec',
                        'reason', 'generation_increment',
                        'timestamp', lattice_now_ms())::TEXT);
                END IF;
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;

            DROP TRIGGER IF EXISTS trg_nodepools_change_notify ON nodepools;
            CREATE TRIGGER trg_nodepools_change_notify
                AFTER UPDATE ON nodepools
                FOR EACH ROW EXECUTE FUNCTION nodepools_change_notify();
            "#,
        )
        .await
        .context("failed to install nodepool change trigger")?;

    // Controller reports dirty the aggregated view; they never notify.
    // Node-pool reports dirty both the pool and its owning cluster.
    client
        .batch_execute(
            r#"
            CREATE OR REPLACE FUNCTION controller_status_dirty() RETURNS trigger AS $$
            BEGIN
                UPDATE clusters SET status_dirty = TRUE
                    WHERE id = NEW.cluster_id AND deleted_at IS NULL;
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;

            DROP TRIGGER IF EXISTS trg_controller_status_dirty ON controller_status;
            CREATE TRIGGER trg_controller_status_dirty
                AFTER INSERT OR UPDATE ON controller_status
                FOR EACH ROW EXECUTE FUNCTION controller_status_dirty();

            CREATE OR REPLACE FUNCTION nodepool_controller_status_dirty() RETURNS trigger AS $$
            BEGIN
                UPDATE nodepools SET status_dirty = TRUE
                    WHERE id = NEW.nodepool_id AND deleted_at IS NULL;
                UPDATE clusters c SET status_dirty = TRUE
                    FROM nodepools np
                    WHERE np.id = NEW.nodepool_id AND c.id = np.cluster_id AND c.deleted_at IS NULL;
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;

            DROP TRIGGER IF EXISTS trg_nodepool_controller_status_dirty ON nodepool_controller_status;
            CREATE TRIGGER trg_nodepool_controller_status_dirty
                AFTER INSERT OR UPDATE ON nodepool_controller_status
                FOR EACH ROW EXECUTE FUNCTION nodepool_controller_status_dirty();
            "#,
        )
        .await
        .context("failed to install controller status triggers")?;

    Ok(())
}

pub fn cluster_from_row(row: &tokio_postgres::Row) -> Result<Cluster, StoreError> {
    let spec: serde_json::Value = row.get("spec");
    let spec: ClusterSpec =
        serde_json::from_value(spec).context("failed to decode cluster spec")?;
    let status: Option<serde_json::Value> = row.get("status");
    let status: Option<ClusterStatusInfo> = match status {
        Some(value) => {
            Some(serde_json::from_value(value).context("failed to decode cluster status")?)
        }
        None => None,
    };
    Ok(Cluster {
        id: row.get("id"),
        name: row.get("name"),
        owner: row.get("owner"),
        project: row.get("project"),
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

/// Insert a new cluster owned by `owner`.
pub async fn create_cluster(
    pool: &Pool,
    owner: &str,
    req: &CreateClusterRequest,
) -> Result<Cluster, StoreError> {
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

    let id = Uuid::new_v4();
    let resource_version = Uuid::new_v4().to_string();
    let now = now_ms();
    let spec = serde_json::to_value(&req.spec).context("failed to encode cluster spec")?;

    let row = match client
        .query_one(
            &format!(
                r#"
                INSERT INTO clusters
                    (id, name, owner, project, generation, resource_version, spec, created_at, updated_at)
                VALUES ($1, $2, $3, $4, 1, $5, $6, $7, $7)
                RETURNING {CLUSTER_COLUMNS}
                "#
            ),
            &[&id, &req.name, &owner, &req.project, &resource_version, &spec, &now],
        )
        .await
    {
        Ok(row) => row,
        Err(e) if is_unique_violation(&e) => {
            return Err(StoreError::NameConflict {
                kind: "cluster",
                name: req.name.clone(),
            });
        }
        Err(e) => return Err(anyhow::Error::new(e).context("failed to insert cluster").into()),
    };

    cluster_from_row(&row)
}

/// Get a live cluster by id, scoped to its owner.
pub async fn get_cluster(pool: &Pool, owner: &str, id: Uuid) -> Result<Cluster, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!(
                "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = $1 AND owner = $2 AND deleted_at IS NULL"
            ),
            &[&id, &owner],
        )
        .await
        .context("failed to query cluster")?;

    match row {
        Some(row) => cluster_from_row(&row),
        None => Err(StoreError::not_found("cluster", id)),
    }
}

/// Get a live cluster by id regardless of owner.
///
/// Internal lookups (scheduler, reactive reconciler) use this; the HTTP
/// surface never does.
pub async fn get_cluster_any(pool: &Pool, id: Uuid) -> Result<Option<Cluster>, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = $1 AND deleted_at IS NULL"),
            &[&id],
        )
        .await
        .context("failed to query cluster")?;

    row.map(|r| cluster_from_row(&r)).transpose()
}

/// List live clusters owned by `owner` with pagination and optional
/// platform/phase filters. Uses a window function for the full count.
pub async fn list_clusters(
    pool: &Pool,
    owner: &str,
    offset: i64,
    limit: i64,
    platform: Option<&str>,
    phase: Option<&str>,
) -> Result<ListClustersResponse, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let mut conditions = vec!["owner = $1".to_string(), "deleted_at IS NULL".to_string()];
    let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = vec![&owner];
    let mut param_idx = 2;

    if let Some(ref p) = platform {
        conditions.push(format!("spec->'platform'->>'type' = ${}", param_idx));
        params.push(p);
        param_idx += 1;
    }
    if let Some(ref p) = phase {
        conditions.push(format!("status->>'phase' = ${}", param_idx));
        params.push(p);
        param_idx += 1;
    }

    let query = format!(
        r#"
        SELECT {CLUSTER_COLUMNS}, COUNT(*) OVER() AS full_count
        FROM clusters
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
        .context("failed to list clusters")?;

    let full_count: i64 = rows.first().map(|r| r.get("full_count")).unwrap_or(0);
    let items = rows
        .iter()
        .map(cluster_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    let truncated = offset + (items.len() as i64) < full_count;

    Ok(ListClustersResponse {
        offset,
        limit,
        full_count,
        truncated,
        items,
    })
}

/// Replace a cluster's spec, bumping the generation by exactly one.
///
/// When `expected_version` is given the update is compare-and-swap on the
/// resource version; otherwise concurrent updates serialize on the row lock
/// and each gets its own generation.
pub async fn update_cluster_spec(
    pool: &Pool,
    owner: &str,
    id: Uuid,
    spec: &ClusterSpec,
    expected_version: Option<&str>,
) -> Result<Cluster, StoreError> {
    spec.validate().map_err(|reason| StoreError::Validation {
        field: "spec",
        reason,
    })?;

    let client = pool.get().await.context("failed to get db connection")?;

    let state = client
        .query_opt(
            "SELECT resource_version, deleted_at FROM clusters WHERE id = $1 AND owner = $2",
            &[&id, &owner],
        )
        .await
        .context("failed to query cluster state")?;

    let Some(state_row) = state else {
        return Err(StoreError::not_found("cluster", id));
    };
    let deleted_at: Option<i64> = state_row.get("deleted_at");
    if deleted_at.is_some() {
        return Err(StoreError::PendingDeletion { kind: "cluster", id });
    }
    if let Some(expected) = expected_version {
        let current: String = state_row.get("resource_version");
        if current != expected {
            return Err(StoreError::StaleVersion { kind: "cluster", id });
        }
    }

    let resource_version = Uuid::new_v4().to_string();
    let now = now_ms();
    let spec_value = serde_json::to_value(spec).context("failed to encode cluster spec")?;

    let (clause, cas): (&str, Option<&str>) = match expected_version {
        Some(expected) => ("AND resource_version = $5", Some(expected)),
        None => ("", None),
    };
    // The generation bump invalidates every existing controller report, so
    // the cached status block is dirtied in the same statement.
    let query = format!(
        r#"
        UPDATE clusters
        SET spec = $1, generation = generation + 1, resource_version = $2, updated_at = $3,
            status_dirty = TRUE
        WHERE id = $4 AND deleted_at IS NULL {clause}
        RETURNING {CLUSTER_COLUMNS}
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
        .context("failed to update cluster")?;

    match row {
        Some(row) => cluster_from_row(&row),
        // The CAS lost a race after the state read above.
        None => Err(StoreError::StaleVersion { kind: "cluster", id }),
    }
}

/// Soft-delete a cluster and cascade to its node pools. Idempotent.
///
/// Without `force`, deletion is refused unless the current phase is in
/// `deletable_phases` (a null status block counts as Pending).
pub async fn soft_delete_cluster(
    pool: &Pool,
    owner: &str,
    id: Uuid,
    force: bool,
    deletable_phases: &[Phase],
) -> Result<Cluster, StoreError> {
    let mut client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = $1 AND owner = $2"),
            &[&id, &owner],
        )
        .await
        .context("failed to query cluster")?;

    let Some(row) = row else {
        return Err(StoreError::not_found("cluster", id));
    };
    let cluster = cluster_from_row(&row)?;
    if cluster.deleted_at.is_some() {
        return Ok(cluster);
    }
    if !force {
        let phase = cluster.phase();
        if !deletable_phases.contains(&phase) {
            return Err(StoreError::DeleteRefused {
                kind: "cluster",
                id,
                phase,
            });
        }
    }

    let now = now_ms();
    let resource_version = Uuid::new_v4().to_string();

    let txn = client
        .transaction()
        .await
        .context("failed to begin transaction")?;
    let row = txn
        .query_one(
            &format!(
                r#"
                UPDATE clusters
                SET deleted_at = $1, updated_at = $1, resource_version = $2
                WHERE id = $3 AND deleted_at IS NULL
                RETURNING {CLUSTER_COLUMNS}
                "#
            ),
            &[&now, &resource_version, &id],
        )
        .await
        .context("failed to soft-delete cluster")?;
    txn.execute(
        r#"
        UPDATE nodepools
        SET deleted_at = $1, updated_at = $1, resource_version = gen_random_uuid()::TEXT
        WHERE cluster_id = $2 AND deleted_at IS NULL
        "#,
        &[&now, &id],
    )
    .await
    .context("failed to cascade soft-delete to nodepools")?;
    txn.commit().await.context("failed to commit soft-delete")?;

    cluster_from_row(&row)
}

/// Read the reactive reconciliation config row, falling back to defaults
/// when the row has not been seeded yet.
pub async fn get_reactive_config(pool: &Pool) -> Result<ReactiveConfig, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            r#"
            SELECT enabled, change_types, debounce_ms, max_events_per_minute, database_poll_interval_ms
            FROM reactive_reconciliation_config
            "#,
            &[],
        )
        .await
        .context("failed to query reactive config")?;

    Ok(match row {
        Some(row) => ReactiveConfig {
            enabled: row.get("enabled"),
            change_types: row.get("change_types"),
            debounce_ms: row.get("debounce_ms"),
            max_events_per_minute: row.get("max_events_per_minute"),
            database_poll_interval_ms: row.get("database_poll_interval_ms"),
        },
        None => ReactiveConfig::default(),
    })
}

/// Replace the reactive reconciliation config row.
pub async fn set_reactive_config(
    pool: &Pool,
    config: &ReactiveConfig,
) -> Result<ReactiveConfig, StoreError> {
    config
        .validate()
        .map_err(|reason| StoreError::Validation {
            field: "reactive_config",
            reason,
        })?;

    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            INSERT INTO reactive_reconciliation_config
                (id, enabled, change_types, debounce_ms, max_events_per_minute, database_poll_interval_ms)
            VALUES (TRUE, $1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                change_types = EXCLUDED.change_types,
                debounce_ms = EXCLUDED.debounce_ms,
                max_events_per_minute = EXCLUDED.max_events_per_minute,
                database_poll_interval_ms = EXCLUDED.database_poll_interval_ms
            "#,
            &[
                &config.enabled,
                &config.change_types,
                &config.debounce_ms,
                &config.max_events_per_minute,
                &config.database_poll_interval_ms,
            ],
        )
        .await
        .context("failed to store reactive config")?;

    Ok(config.clone())
}

/// Cheap connectivity probe used by the health endpoint.
pub async fn ping(pool: &Pool) -> Result<(), StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;
    client
        .execute("SELECT 1", &[])
        .await
        .context("failed to ping database")?;
    Ok(())
}
