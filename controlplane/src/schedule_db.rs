use anyhow::Context;
use deadpool_postgres::Pool;
use lattice_common::streams::reasons;
use uuid::Uuid;

use crate::error::StoreError;

/// A resource the periodic scheduler should emit a reconcile event for,
/// together with the schedule fields that decide its reason and priority.
#[derive(Debug, Clone)]
pub struct DueResource {
    /// The resource itself: the cluster id, or the node pool id.
    pub resource_id: Uuid,
    /// Owning cluster; equals `resource_id` for clusters.
    pub cluster_id: Uuid,
    pub generation: i64,
    pub last_reconciled_at: Option<i64>,
    pub next_reconcile_at: i64,
    pub is_healthy: Option<bool>,
    /// Highest generation any controller has reported, 0 if none.
    pub max_observed_generation: i64,
}

impl DueResource {
    pub fn is_unhealthy(&self) -> bool {
        self.is_healthy == Some(false)
    }
}

/// Derive why a row is due. Checked in the order the schedule gives them
/// precedence: never reconciled, timer expiry, then generation drift.
pub fn due_reason(row: &DueResource, now: i64) -> &'static str {
    if row.last_reconciled_at.is_none() {
        reasons::NEVER_RECONCILED
    } else if row.next_reconcile_at <= now {
        match row.is_healthy {
            Some(false) => reasons::UNHEALTHY_RECONCILIATION,
            Some(true) => reasons::HEALTHY_RECONCILIATION,
            None => reasons::PERIODIC_RECONCILIATION,
        }
    } else {
        reasons::GENERATION_MISMATCH
    }
}

fn due_from_row(row: &tokio_postgres::Row, nodepool: bool) -> DueResource {
    let resource_id: Uuid = row.get("resource_id");
    DueResource {
        resource_id,
        cluster_id: if nodepool {
            row.get("cluster_id")
        } else {
            resource_id
        },
        generation: row.get("generation"),
        last_reconciled_at: row.get("last_reconciled_at"),
        next_reconcile_at: row.get("next_reconcile_at"),
        is_healthy: row.get("is_healthy"),
        max_observed_generation: row.get("max_observed"),
    }
}

/// Clusters that are due: never reconciled, timer expired, or the spec moved
/// past everything the controllers have acknowledged. Unhealthy rows sort
/// first so a capped batch serves them before stable ones.
pub async fn find_due_clusters(pool: &Pool, now: i64) -> Result<Vec<DueResource>, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            r#"
            SELECT c.id AS resource_id,
                   c.generation,
                   s.last_reconciled_at,
                   s.next_reconcile_at,
                   s.is_healthy,
                   COALESCE((SELECT MAX(cs.observed_generation)
                             FROM controller_status cs
                             WHERE cs.cluster_id = c.id), 0) AS max_observed
            FROM reconciliation_schedule s
            JOIN clusters c ON c.id = s.cluster_id
            WHERE s.enabled
              AND c.deleted_at IS NULL
              AND (
                    s.last_reconciled_at IS NULL
                 OR s.next_reconcile_at <= $1
                 OR c.generation > COALESCE((SELECT MAX(cs.observed_generation)
                                             FROM controller_status cs
                                             WHERE cs.cluster_id = c.id), 0)
              )
            ORDER BY CASE WHEN s.is_healthy = FALSE THEN 0
                          WHEN s.is_healthy = TRUE THEN 1
                          ELSE 2 END,
                     s.next_reconcile_at ASC
            "#,
            &[&now],
        )
        .await
        .context("failed to find due clusters")?;

    Ok(rows.iter().map(|r| due_from_row(r, false)).collect())
}

/// Node pools that are due; a pool whose parent cluster is soft-deleted is
/// never due (its schedule row is already gone via cascade, this guards the
/// race window).
pub async fn find_due_nodepools(pool: &Pool, now: i64) -> Result<Vec<DueResource>, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            r#"
            SELECT np.id AS resource_id,
                   np.cluster_id,
                   np.generation,
                   s.last_reconciled_at,
                   s.next_reconcile_at,
                   s.is_healthy,
                   COALESCE((SELECT MAX(cs.observed_generation)
                             FROM nodepool_controller_status cs
                             WHERE cs.nodepool_id = np.id), 0) AS max_observed
            FROM nodepool_reconciliation_schedule s
            JOIN nodepools np ON np.id = s.nodepool_id
            JOIN clusters c ON c.id = np.cluster_id AND c.deleted_at IS NULL
            WHERE s.enabled
              AND np.deleted_at IS NULL
              AND (
                    s.last_reconciled_at IS NULL
                 OR s.next_reconcile_at <= $1
                 OR np.generation > COALESCE((SELECT MAX(cs.observed_generation)
                                              FROM nodepool_controller_status cs
                                              WHERE cs.nodepool_id = np.id), 0)
              )
            ORDER BY CASE WHEN s.is_healthy = FALSE THEN 0
                          WHEN s.is_healthy = TRUE THEN 1
                          ELSE 2 END,
                     s.next_reconcile_at ASC
            "#,
            &[&now],
        )
        .await
        .context("failed to find due nodepools")?;

    Ok(rows.iter().map(|r| due_from_row(r, true)).collect())
}

/// Record a successful reconcile dispatch: stamp `last_reconciled_at` and
/// push `next_reconcile_at` out by the cadence the current health earns.
/// Schedules with adaptive pacing disabled keep their fixed interval.
pub async fn advance_cluster_schedule(
    pool: &Pool,
    cluster_id: Uuid,
    now: i64,
) -> Result<(), StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            UPDATE reconciliation_schedule
            SET last_reconciled_at = $1,
                reconcile_interval_ms = CASE WHEN NOT adaptive_enabled THEN reconcile_interval_ms
                                             WHEN is_healthy = FALSE THEN unhealthy_interval_ms
                                             ELSE healthy_interval_ms END,
                next_reconcile_at = $1 + CASE WHEN NOT adaptive_enabled THEN reconcile_interval_ms
                                              WHEN is_healthy = FALSE THEN unhealthy_interval_ms
                                              ELSE healthy_interval_ms END
            WHERE cluster_id = $2
            "#,
            &[&now, &cluster_id],
        )
        .await
        .context("failed to advance cluster schedule")?;
    Ok(())
}

pub async fn advance_nodepool_schedule(
    pool: &Pool,
    nodepool_id: Uuid,
    now: i64,
) -> Result<(), StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            UPDATE nodepool_reconciliation_schedule
            SET last_reconciled_at = $1,
                reconcile_interval_ms = CASE WHEN NOT adaptive_enabled THEN reconcile_interval_ms
                                             WHEN is_healthy = FALSE THEN unhealthy_interval_ms
                                             ELSE healthy_interval_ms END,
                next_reconcile_at = $1 + CASE WHEN NOT adaptive_enabled THEN reconcile_interval_ms
                                              WHEN is_healthy = FALSE THEN unhealthy_interval_ms
                                              ELSE healthy_interval_ms END
            WHERE nodepool_id = $2
            "#,
            &[&now, &nodepool_id],
        )
        .await
        .context("failed to advance nodepool schedule")?;
    Ok(())
}

/// Backstop for rows that predate the trigger layer or lost their schedule
/// some other way: every live resource gets exactly one schedule row, seeded
/// with the configured default interval and an immediate first reconcile.
pub async fn ensure_missing_schedules(
    pool: &Pool,
    default_interval_ms: i64,
    now: i64,
) -> Result<u64, StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    let clusters = client
        .execute(
            r#"
            INSERT INTO reconciliation_schedule
                (cluster_id, enabled, next_reconcile_at,
                 reconcile_interval_ms, healthy_interval_ms, unhealthy_interval_ms)
            SELECT c.id, TRUE, $2, $1, $1, 30000
            FROM clusters c
            WHERE c.deleted_at IS NULL
              AND NOT EXISTS (SELECT 1 FROM reconciliation_schedule s WHERE s.cluster_id = c.id)
            ON CONFLICT (cluster_id) DO NOTHING
            "#,
            &[&default_interval_ms, &now],
        )
        .await
        .context("failed to repair cluster schedules")?;

    let nodepools = client
        .execute(
            r#"
            INSERT INTO nodepool_reconciliation_schedule
                (nodepool_id, enabled, next_reconcile_at,
                 reconcile_interval_ms, healthy_interval_ms, unhealthy_interval_ms)
            SELECT np.id, TRUE, $2, $1, $1, 30000
            FROM nodepools np
            JOIN clusters c ON c.id = np.cluster_id AND c.deleted_at IS NULL
            WHERE np.deleted_at IS NULL
              AND NOT EXISTS (SELECT 1 FROM nodepool_reconciliation_schedule s WHERE s.nodepool_id = np.id)
            ON CONFLICT (nodepool_id) DO NOTHING
            "#,
            &[&default_interval_ms, &now],
        )
        .await
        .context("failed to repair nodepool schedules")?;

    Ok(clusters + nodepools)
}

pub async fn update_cluster_health(
    pool: &Pool,
    cluster_id: Uuid,
    healthy: bool,
    now: i64,
) -> Result<(), StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            "UPDATE reconciliation_schedule SET is_healthy = $1, last_health_check = $2 WHERE cluster_id = $3",
            &[&healthy, &now, &cluster_id],
        )
        .await
        .context("failed to update cluster health")?;
    Ok(())
}

pub async fn update_nodepool_health(
    pool: &Pool,
    nodepool_id: Uuid,
    healthy: bool,
    now: i64,
) -> Result<(), StoreError> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            "UPDATE nodepool_reconciliation_schedule SET is_healthy = $1, last_health_check = $2 WHERE nodepool_id = $3",
            &[&healthy, &now, &nodepool_id],
        )
        .await
        .context("failed to update nodepool health")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(
        last_reconciled_at: Option<i64>,
        next_reconcile_at: i64,
        is_healthy: Option<bool>,
        generation: i64,
        max_observed: i64,
    ) -> DueResource {
        DueResource {
            resource_id: Uuid::new_v4(),
            cluster_id: Uuid::new_v4(),
            generation,
            last_reconciled_at,
            next_reconcile_at,
            is_healthy,
            max_observed_generation: max_observed,
        }
    }

    #[test]
    fn never_reconciled_wins_over_everything() {
        let r = row(None, 0, Some(false), 5, 1);
        assert_eq!(due_reason(&r, 1_000), reasons::NEVER_RECONCILED);
    }

    #[test]
    fn timer_expiry_reason_tracks_health() {
        let now = 10_000;
        assert_eq!(
            due_reason(&row(Some(1), 5_000, Some(true), 1, 1), now),
            reasons::HEALTHY_RECONCILIATION
        );
        assert_eq!(
            due_reason(&row(Some(1), 5_000, Some(false), 1, 1), now),
            reasons::UNHEALTHY_RECONCILIATION
        );
        assert_eq!(
            due_reason(&row(Some(1), 5_000, None, 1, 1), now),
            reasons::PERIODIC_RECONCILIATION
        );
    }

    #[test]
    fn generation_drift_when_timer_not_expired() {
        let now = 10_000;
        let r = row(Some(1), 60_000, Some(true), 3, 1);
        assert_eq!(due_reason(&r, now), reasons::GENERATION_MISMATCH);
    }
}
