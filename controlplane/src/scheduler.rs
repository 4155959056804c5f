use anyhow::{Result, bail};
use deadpool_postgres::Pool;
use lattice_common::metrics::{
    KIND_CLUSTER, KIND_NODEPOOL, record_manual_trigger, record_reconcile_error,
    record_reconcile_published, record_schedules_repaired,
};
use lattice_common::now_ms;
use lattice_common::streams::{ReconcileEvent, event_types, reasons};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::publisher::Publisher;
use crate::schedule_db::{self, DueResource, due_reason};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub check_interval: Duration,
    pub default_interval: Duration,
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            default_interval: Duration::from_secs(300),
            max_concurrent: 50,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            bail!("check_interval must be positive");
        }
        if self.default_interval.is_zero() {
            bail!("default_interval must be positive");
        }
        if self.max_concurrent == 0 {
            bail!("max_concurrent must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetKind {
    Cluster,
    NodePool,
}

impl TargetKind {
    fn label(self) -> &'static str {
        match self {
            TargetKind::Cluster => KIND_CLUSTER,
            TargetKind::NodePool => KIND_NODEPOOL,
        }
    }
}

#[derive(Debug, Clone)]
struct Target {
    kind: TargetKind,
    row: DueResource,
    reason: &'static str,
}

/// Deduplicate by resource id (highest generation wins), serve unhealthy
/// resources first, then cap the batch.
fn select_batch(targets: Vec<Target>, max: usize) -> Vec<Target> {
    let mut by_id: HashMap<Uuid, Target> = HashMap::new();
    for target in targets {
        match by_id.get(&target.row.resource_id) {
            Some(existing) if existing.row.generation >= target.row.generation => {}
            _ => {
                by_id.insert(target.row.resource_id, target);
            }
        }
    }

    let mut selected: Vec<Target> = by_id.into_values().collect();
    selected.sort_by_key(|t| {
        let health_rank = match t.row.is_healthy {
            Some(false) => 0,
            Some(true) => 1,
            None => 2,
        };
        (health_rank, t.row.next_reconcile_at, t.row.resource_id)
    });
    selected.truncate(max);
    selected
}

fn reconcile_event(target: &Target, timestamp: i64) -> ReconcileEvent {
    let (event_type, nodepool_id) = match target.kind {
        TargetKind::Cluster => (event_types::CLUSTER_RECONCILE, None),
        TargetKind::NodePool => (
            event_types::NODEPOOL_RECONCILE,
            Some(target.row.resource_id),
        ),
    };
    ReconcileEvent {
        event_type: event_type.to_string(),
        cluster_id: target.row.cluster_id,
        nodepool_id,
        reason: target.reason.to_string(),
        generation: target.row.generation,
        timestamp,
        metadata: Default::default(),
    }
}

struct Inner {
    pool: Pool,
    publisher: Arc<dyn Publisher>,
    config: SchedulerConfig,
    running: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Background loop that finds due resources, fans out reconcile events, and
/// advances schedules. One per process.
#[derive(Clone)]
pub struct PeriodicScheduler {
    inner: Arc<Inner>,
}

impl PeriodicScheduler {
    pub fn new(pool: Pool, publisher: Arc<dyn Publisher>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                publisher,
                config,
                running: AtomicBool::new(false),
                cancel: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Launch the worker loop. No-op when already running; refuses to start
    /// on an invalid config.
    pub async fn start(&self) -> Result<()> {
        self.inner.config.validate()?;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let this = self.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            this.run_loop(loop_cancel).await;
        });

        *self.inner.cancel.lock().await = Some(cancel);
        *self.inner.worker.lock().await = Some(handle);
        tracing::info!(
            check_interval_secs = self.inner.config.check_interval.as_secs(),
            max_concurrent = self.inner.config.max_concurrent,
            "periodic scheduler started"
        );
        Ok(())
    }

    /// Signal the loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = self.inner.cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.inner.worker.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = ?e, "scheduler worker exited abnormally");
            }
        }
        tracing::info!("periodic scheduler stopped");
    }

    /// Publish an out-of-band reconcile event for a cluster. Does not touch
    /// the schedule; generation 0 means "no generation assertion".
    pub async fn trigger_cluster(&self, cluster_id: Uuid) -> Result<ReconcileEvent> {
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("trigger".to_string(), "api".to_string());
        let event = ReconcileEvent {
            event_type: event_types::CLUSTER_RECONCILE.to_string(),
            cluster_id,
            nodepool_id: None,
            reason: reasons::MANUAL_TRIGGER.to_string(),
            generation: 0,
            timestamp: now_ms(),
            metadata,
        };
        self.inner.publisher.publish_cluster_reconcile(&event).await?;
        record_manual_trigger(KIND_CLUSTER);
        Ok(event)
    }

    pub async fn trigger_nodepool(
        &self,
        cluster_id: Uuid,
        nodepool_id: Uuid,
    ) -> Result<ReconcileEvent> {
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("trigger".to_string(), "api".to_string());
        let event = ReconcileEvent {
            event_type: event_types::NODEPOOL_RECONCILE.to_string(),
            cluster_id,
            nodepool_id: Some(nodepool_id),
            reason: reasons::MANUAL_TRIGGER.to_string(),
            generation: 0,
            timestamp: now_ms(),
            metadata,
        };
        self.inner
            .publisher
            .publish_nodepool_reconcile(&event)
            .await?;
        record_manual_trigger(KIND_NODEPOOL);
        Ok(event)
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        // The first tick of a tokio interval fires immediately, so a freshly
        // started scheduler sweeps without waiting a full check interval.
        let mut tick = tokio::time::interval(self.inner.config.check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            self.tick_once(&cancel).await;
        }
    }

    async fn tick_once(&self, cancel: &CancellationToken) {
        let now = now_ms();

        let default_interval_ms = self.inner.config.default_interval.as_millis() as i64;
        match schedule_db::ensure_missing_schedules(&self.inner.pool, default_interval_ms, now)
            .await
        {
            Ok(0) => {}
            Ok(repaired) => {
                record_schedules_repaired(repaired);
                tracing::warn!(repaired, "recreated missing schedule rows");
            }
            Err(e) => tracing::error!(error = ?e, "failed to repair schedules"),
        }

        let mut targets = Vec::new();

        match schedule_db::find_due_clusters(&self.inner.pool, now).await {
            Ok(rows) => targets.extend(rows.into_iter().map(|row| Target {
                kind: TargetKind::Cluster,
                reason: due_reason(&row, now),
                row,
            })),
            Err(e) => {
                tracing::error!(error = ?e, "failed to find due clusters");
                record_reconcile_error(KIND_CLUSTER);
            }
        }
        match schedule_db::find_due_nodepools(&self.inner.pool, now).await {
            Ok(rows) => targets.extend(rows.into_iter().map(|row| Target {
                kind: TargetKind::NodePool,
                reason: due_reason(&row, now),
                row,
            })),
            Err(e) => {
                tracing::error!(error = ?e, "failed to find due nodepools");
                record_reconcile_error(KIND_NODEPOOL);
            }
        }

        let due = targets.len();
        let batch = select_batch(targets, self.inner.config.max_concurrent);

        let mut published = 0_u64;
        let mut errors = 0_u64;
        for target in &batch {
            if cancel.is_cancelled() {
                break;
            }
            let event = reconcile_event(target, now_ms());
            let result = match target.kind {
                TargetKind::Cluster => {
                    self.inner.publisher.publish_cluster_reconcile(&event).await
                }
                TargetKind::NodePool => {
                    self.inner
                        .publisher
                        .publish_nodepool_reconcile(&event)
                        .await
                }
            };
            match result {
                Ok(()) => {
                    published += 1;
                    record_reconcile_published(target.kind.label());
                    // A failed publish leaves the schedule untouched so the
                    // next tick retries the same resource.
                    let advanced = match target.kind {
                        TargetKind::Cluster => {
                            schedule_db::advance_cluster_schedule(
                                &self.inner.pool,
                                target.row.resource_id,
                                now_ms(),
                            )
                            .await
                        }
                        TargetKind::NodePool => {
                            schedule_db::advance_nodepool_schedule(
                                &self.inner.pool,
                                target.row.resource_id,
                                now_ms(),
                            )
                            .await
                        }
                    };
                    if let Err(e) = advanced {
                        tracing::error!(resource_id = %target.row.resource_id, error = ?e, "failed to advance schedule");
                        record_reconcile_error(target.kind.label());
                        errors += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(resource_id = %target.row.resource_id, reason = target.reason, error = ?e, "failed to publish reconcile event");
                    record_reconcile_error(target.kind.label());
                    errors += 1;
                }
            }
        }

        if due > 0 || errors > 0 {
            tracing::info!(due, published, errors, "reconcile tick complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::testing::RecordingPublisher;

    fn test_pool() -> Pool {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some("127.0.0.1".to_string());
        cfg.dbname = Some("postgres".to_string());
        cfg.user = Some("postgres".to_string());
        cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), postgres::NoTls)
            .expect("create pool")
    }

    fn target(
        kind: TargetKind,
        resource_id: Uuid,
        generation: i64,
        is_healthy: Option<bool>,
        next_reconcile_at: i64,
    ) -> Target {
        Target {
            kind,
            reason: reasons::PERIODIC_RECONCILIATION,
            row: DueResource {
                resource_id,
                cluster_id: resource_id,
                generation,
                last_reconciled_at: Some(0),
                next_reconcile_at,
                is_healthy,
                max_observed_generation: 0,
            },
        }
    }

    #[test]
    fn batch_dedups_by_id_keeping_highest_generation() {
        let id = Uuid::new_v4();
        let batch = select_batch(
            vec![
                target(TargetKind::Cluster, id, 2, None, 10),
                target(TargetKind::Cluster, id, 5, None, 10),
                target(TargetKind::Cluster, id, 3, None, 10),
            ],
            10,
        );
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].row.generation, 5);
    }

    #[test]
    fn batch_serves_unhealthy_first_then_caps() {
        let unhealthy = target(TargetKind::Cluster, Uuid::new_v4(), 1, Some(false), 500);
        let healthy = target(TargetKind::Cluster, Uuid::new_v4(), 1, Some(true), 10);
        let unknown = target(TargetKind::NodePool, Uuid::new_v4(), 1, None, 1);

        let batch = select_batch(vec![healthy, unknown, unhealthy], 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].row.is_healthy, Some(false));
        assert_eq!(batch[1].row.is_healthy, Some(true));
    }

    #[test]
    fn batch_orders_within_group_by_next_reconcile() {
        let a = target(TargetKind::Cluster, Uuid::new_v4(), 1, Some(false), 900);
        let b = target(TargetKind::Cluster, Uuid::new_v4(), 1, Some(false), 100);
        let batch = select_batch(vec![a, b], 10);
        assert_eq!(batch[0].row.next_reconcile_at, 100);
        assert_eq!(batch[1].row.next_reconcile_at, 900);
    }

    #[test]
    fn config_refuses_non_positive_values() {
        let mut config = SchedulerConfig::default();
        config.check_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.max_concurrent = 0;
        assert!(config.validate().is_err());

        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn manual_trigger_publishes_sentinel_generation() {
        let publisher = Arc::new(RecordingPublisher::default());
        let scheduler = PeriodicScheduler::new(
            test_pool(),
            publisher.clone(),
            SchedulerConfig::default(),
        );

        let cluster_id = Uuid::new_v4();
        let event = scheduler.trigger_cluster(cluster_id).await.expect("trigger");
        assert_eq!(event.generation, 0);
        assert_eq!(event.reason, reasons::MANUAL_TRIGGER);

        let nodepool_id = Uuid::new_v4();
        scheduler
            .trigger_nodepool(cluster_id, nodepool_id)
            .await
            .expect("trigger");

        let events = publisher.reconcile_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].resource_id(), nodepool_id);
    }

    #[tokio::test]
    async fn manual_trigger_surfaces_publish_failure() {
        let publisher = Arc::new(RecordingPublisher::failing());
        let scheduler =
            PeriodicScheduler::new(test_pool(), publisher, SchedulerConfig::default());
        assert!(scheduler.trigger_cluster(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let publisher = Arc::new(RecordingPublisher::default());
        let config = SchedulerConfig {
            check_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let scheduler = PeriodicScheduler::new(test_pool(), publisher, config);

        assert!(!scheduler.is_running());
        scheduler.start().await.expect("start");
        scheduler.start().await.expect("second start is a no-op");
        assert!(scheduler.is_running());

        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn start_refuses_invalid_config() {
        let publisher = Arc::new(RecordingPublisher::default());
        let config = SchedulerConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        let scheduler = PeriodicScheduler::new(test_pool(), publisher, config);
        assert!(scheduler.start().await.is_err());
        assert!(!scheduler.is_running());
    }
}
