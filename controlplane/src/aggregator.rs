//! Lazy status aggregation.
//!
//! The (status_dirty, status) pair on each resource row is a materialized
//! view maintained on read. Controller reports flip the dirty flag inside
//! the store's trigger layer; the next read lands here, recomputes the
//! block from current-generation reports, persists it, and clears the flag.

use deadpool_postgres::Pool;
use lattice_common::now_ms;

use crate::models::{
    Cluster, ClusterStatusInfo, Condition, ConditionStatus, ControllerStatus, NodePool, Phase,
    condition_types, status_reasons,
};
use crate::{error::StoreError, schedule_db, status_db};

/// A resource must be both fully ready and past its early-lifecycle window
/// before it earns the slow cadence.
const HEALTHY_MIN_AGE_MS: i64 = 2 * 60 * 60 * 1000;

/// Compute the aggregated block for a resource at `generation`.
///
/// Only reports whose `observed_generation` equals `generation` count.
/// Condition transition times are carried over from `previous` when the
/// status value did not change.
pub fn compute_status(
    generation: i64,
    reports: &[ControllerStatus],
    previous: Option<&ClusterStatusInfo>,
    now: i64,
) -> ClusterStatusInfo {
    let current: Vec<&ControllerStatus> = reports
        .iter()
        .filter(|r| r.observed_generation == generation)
        .collect();

    let total = current.len();
    let ready = current.iter().filter(|r| report_is_ready(r)).count();
    let has_errors = current.iter().any(|r| r.last_error.is_some());

    let (phase, ready_reason, available_reason, message) = if total == 0 {
        (
            Phase::Pending,
            status_reasons::NO_CONTROLLERS,
            status_reasons::NO_CONTROLLERS,
            "no controllers have reported for this generation".to_string(),
        )
    } else if ready == total && !has_errors {
        (
            Phase::Ready,
            status_reasons::ALL_CONTROLLERS_READY,
            status_reasons::ALL_CONTROLLERS_READY,
            format!("all {total} controllers ready"),
        )
    } else if ready > 0 && !has_errors {
        (
            Phase::Progressing,
            status_reasons::PARTIAL_PROGRESS,
            status_reasons::PARTIAL_PROGRESS,
            format!("{ready} of {total} controllers ready"),
        )
    } else if ready > 0 {
        (
            Phase::Progressing,
            status_reasons::PARTIAL_PROGRESS,
            status_reasons::CONTROLLERS_WITH_ERRORS,
            format!("{ready} of {total} controllers ready, some reporting errors"),
        )
    } else {
        (
            Phase::Failed,
            status_reasons::NO_CONTROLLERS_READY,
            status_reasons::NO_CONTROLLERS_READY,
            format!("none of {total} controllers ready"),
        )
    };

    let ready_status = if phase == Phase::Ready {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };

    let conditions = vec![
        build_condition(
            condition_types::READY,
            ready_status,
            ready_reason,
            &message,
            previous,
            now,
        ),
        build_condition(
            condition_types::AVAILABLE,
            ready_status,
            available_reason,
            &message,
            previous,
            now,
        ),
    ];

    ClusterStatusInfo {
        observed_generation: generation,
        conditions,
        phase,
        reason: ready_reason.to_string(),
        message,
        last_update_time: now,
    }
}

/// A controller counts as ready when it reports Ready or Available True and
/// carries no error.
fn report_is_ready(report: &ControllerStatus) -> bool {
    if report.last_error.is_some() {
        return false;
    }
    report.conditions.iter().any(|c| {
        (c.condition_type == condition_types::READY
            || c.condition_type == condition_types::AVAILABLE)
            && c.status == ConditionStatus::True
    })
}

fn build_condition(
    condition_type: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    previous: Option<&ClusterStatusInfo>,
    now: i64,
) -> Condition {
    let last_transition_time = previous
        .and_then(|p| p.condition(condition_type))
        .filter(|prev| prev.status == status)
        .map(|prev| prev.last_transition_time)
        .unwrap_or(now);
    Condition {
        condition_type: condition_type.to_string(),
        status,
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time,
    }
}

/// Health for scheduling purposes: fully ready and older than the
/// early-lifecycle window.
pub fn resource_is_healthy(status: &ClusterStatusInfo, created_at: i64, now: i64) -> bool {
    let ready = status
        .condition(condition_types::READY)
        .is_some_and(|c| c.status == ConditionStatus::True);
    let available = status
        .condition(condition_types::AVAILABLE)
        .is_some_and(|c| c.status == ConditionStatus::True);
    ready && available && now - created_at > HEALTHY_MIN_AGE_MS
}

/// Bring a cluster's aggregated status up to date if it is dirty.
///
/// On a transient store failure the caller keeps the stale cached block and
/// the dirty flag survives, so the next read retries. Concurrent refreshes
/// are fine: the computation is deterministic and the persisted block is
/// last-writer-wins.
pub async fn refresh_cluster_status(pool: &Pool, cluster: &mut Cluster) -> Result<(), StoreError> {
    if !cluster.status_dirty && cluster.status.is_some() {
        return Ok(());
    }

    let reports = match status_db::list_current_cluster_controller_status(
        pool,
        cluster.id,
        cluster.generation,
    )
    .await
    {
        Ok(reports) => reports,
        Err(e) if cluster.status.is_some() => {
            tracing::warn!(cluster_id = %cluster.id, error = ?e, "status recomputation failed, serving stale block");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let now = now_ms();
    let computed = compute_status(cluster.generation, &reports, cluster.status.as_ref(), now);

    if let Err(e) = status_db::persist_cluster_status(pool, cluster.id, &computed).await {
        tracing::warn!(cluster_id = %cluster.id, error = ?e, "failed to persist aggregated status");
        if cluster.status.is_some() {
            return Ok(());
        }
        return Err(e);
    }

    let healthy = resource_is_healthy(&computed, cluster.created_at, now);
    if let Err(e) = schedule_db::update_cluster_health(pool, cluster.id, healthy, now).await {
        tracing::warn!(cluster_id = %cluster.id, error = ?e, "failed to update schedule health");
    }

    cluster.status = Some(computed);
    cluster.status_dirty = false;
    Ok(())
}

/// Node-pool twin of [`refresh_cluster_status`].
pub async fn refresh_nodepool_status(
    pool: &Pool,
    nodepool: &mut NodePool,
) -> Result<(), StoreError> {
    if !nodepool.status_dirty && nodepool.status.is_some() {
        return Ok(());
    }

    let reports = match status_db::list_current_nodepool_controller_status(
        pool,
        nodepool.id,
        nodepool.generation,
    )
    .await
    {
        Ok(reports) => reports,
        Err(e) if nodepool.status.is_some() => {
            tracing::warn!(nodepool_id = %nodepool.id, error = ?e, "status recomputation failed, serving stale block");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let now = now_ms();
    let computed = compute_status(nodepool.generation, &reports, nodepool.status.as_ref(), now);

    if let Err(e) = status_db::persist_nodepool_status(pool, nodepool.id, &computed).await {
        tracing::warn!(nodepool_id = %nodepool.id, error = ?e, "failed to persist aggregated status");
        if nodepool.status.is_some() {
            return Ok(());
        }
        return Err(e);
    }

    let healthy = resource_is_healthy(&computed, nodepool.created_at, now);
    if let Err(e) = schedule_db::update_nodepool_health(pool, nodepool.id, healthy, now).await {
        tracing::warn!(nodepool_id = %nodepool.id, error = ?e, "failed to update schedule health");
    }

    nodepool.status = Some(computed);
    nodepool.status_dirty = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ControllerError;

    const NOW: i64 = 1_700_000_000_000;

    fn report(
        controller: &str,
        observed_generation: i64,
        ready: bool,
        last_error: Option<ControllerError>,
    ) -> ControllerStatus {
        ControllerStatus {
            controller: controller.to_string(),
            observed_generation,
            conditions: vec![Condition {
                condition_type: condition_types::READY.to_string(),
                status: if ready {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                },
                reason: "Reconciled".to_string(),
                message: String::new(),
                last_transition_time: NOW - 1_000,
            }],
            metadata: None,
            last_error,
            updated_at: NOW - 1_000,
        }
    }

    fn err() -> Option<ControllerError> {
        Some(ControllerError {
            code: "ProvisionFailed".to_string(),
            message: "quota exceeded".to_string(),
        })
    }

    #[test]
    fn no_reports_is_pending() {
        let status = compute_status(1, &[], None, NOW);
        assert_eq!(status.phase, Phase::Pending);
        assert_eq!(status.reason, status_reasons::NO_CONTROLLERS);
        assert_eq!(status.observed_generation, 1);
        let ready = status.condition(condition_types::READY).expect("ready");
        assert_eq!(ready.status, ConditionStatus::False);
    }

    #[test]
    fn single_ready_report_is_ready() {
        let reports = vec![report("c1", 1, true, None)];
        let status = compute_status(1, &reports, None, NOW);
        assert_eq!(status.phase, Phase::Ready);
        assert_eq!(status.reason, status_reasons::ALL_CONTROLLERS_READY);
        for c in &status.conditions {
            assert_eq!(c.status, ConditionStatus::True);
        }
    }

    #[test]
    fn stale_generations_are_invisible() {
        // Every report predates the current generation: same as no reports.
        let reports = vec![report("c1", 1, true, None), report("c2", 1, true, None)];
        let status = compute_status(2, &reports, None, NOW);
        assert_eq!(status.phase, Phase::Pending);
        assert_eq!(status.reason, status_reasons::NO_CONTROLLERS);
    }

    #[test]
    fn mixed_generations_count_only_current() {
        let reports = vec![
            report("c1", 1, true, None),
            report("c2", 2, false, None),
        ];
        let status = compute_status(2, &reports, None, NOW);
        assert_eq!(status.phase, Phase::Failed);
        assert_eq!(status.reason, status_reasons::NO_CONTROLLERS_READY);
    }

    #[test]
    fn partial_progress_without_errors() {
        let reports = vec![report("c1", 1, true, None), report("c2", 1, false, None)];
        let status = compute_status(1, &reports, None, NOW);
        assert_eq!(status.phase, Phase::Progressing);
        assert_eq!(
            status.condition(condition_types::AVAILABLE).unwrap().reason,
            status_reasons::PARTIAL_PROGRESS
        );
    }

    #[test]
    fn partial_progress_with_errors_flags_available() {
        let reports = vec![report("c1", 1, true, None), report("c2", 1, false, err())];
        let status = compute_status(1, &reports, None, NOW);
        assert_eq!(status.phase, Phase::Progressing);
        assert_eq!(
            status.condition(condition_types::READY).unwrap().reason,
            status_reasons::PARTIAL_PROGRESS
        );
        assert_eq!(
            status.condition(condition_types::AVAILABLE).unwrap().reason,
            status_reasons::CONTROLLERS_WITH_ERRORS
        );
    }

    #[test]
    fn ready_condition_with_error_does_not_count() {
        let reports = vec![report("c1", 1, true, err())];
        let status = compute_status(1, &reports, None, NOW);
        assert_eq!(status.phase, Phase::Failed);
    }

    #[test]
    fn conditions_are_ordered_ready_then_available() {
        let status = compute_status(1, &[], None, NOW);
        assert_eq!(status.conditions[0].condition_type, condition_types::READY);
        assert_eq!(
            status.conditions[1].condition_type,
            condition_types::AVAILABLE
        );
    }

    #[test]
    fn transition_time_preserved_when_status_unchanged() {
        let reports = vec![report("c1", 1, true, None)];
        let first = compute_status(1, &reports, None, NOW);
        let second = compute_status(1, &reports, Some(&first), NOW + 60_000);
        assert_eq!(
            second.condition(condition_types::READY).unwrap().last_transition_time,
            first.condition(condition_types::READY).unwrap().last_transition_time,
        );
        assert_eq!(second.last_update_time, NOW + 60_000);

        // Status flips: transition time moves.
        let third = compute_status(1, &[], Some(&second), NOW + 120_000);
        assert_eq!(
            third.condition(condition_types::READY).unwrap().last_transition_time,
            NOW + 120_000
        );
    }

    #[test]
    fn recomputation_is_idempotent() {
        let reports = vec![report("c1", 3, true, None), report("c2", 3, false, None)];
        let a = compute_status(3, &reports, None, NOW);
        let b = compute_status(3, &reports, Some(&a), NOW);
        assert_eq!(a, b);
    }

    #[test]
    fn health_requires_readiness_and_age() {
        let reports = vec![report("c1", 1, true, None)];
        let ready = compute_status(1, &reports, None, NOW);
        let failed = compute_status(1, &[report("c1", 1, false, None)], None, NOW);

        // Fresh resources never count as healthy, ready or not.
        assert!(!resource_is_healthy(&ready, NOW - 1_000, NOW));
        assert!(resource_is_healthy(&ready, NOW - 3 * 60 * 60 * 1000, NOW));
        assert!(!resource_is_healthy(&failed, NOW - 3 * 60 * 60 * 1000, NOW));
    }
}
