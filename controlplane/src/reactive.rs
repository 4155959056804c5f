//! Reactive reconciliation.
//!
//! Owns the change notification bus and turns debounced store notifications
//! into reconcile events carrying the resource's current generation. The
//! enable flag and tuning live in the store so operators can flip them at
//! runtime; a poll loop applies transitions without a restart.

use anyhow::Result;
use deadpool_postgres::Pool;
use lattice_common::args::PostgresArgs;
use lattice_common::metrics::{
    KIND_CLUSTER, KIND_NODEPOOL, record_reactive_error, record_reactive_published,
    record_reactive_rate_limited,
};
use lattice_common::now_ms;
use lattice_common::streams::{ChangeNotification, ReconcileEvent, event_types};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::ReactiveConfig;
use crate::notify::ChangeNotificationBus;
use crate::publisher::Publisher;
use crate::{db, nodepool_db};

const NOTIFICATION_BUFFER: usize = 1024;

/// Fixed-window limiter: at most `max_per_minute` events in any one-minute
/// window starting at the first event of the window.
struct RateLimiter {
    max_per_minute: i64,
    window_start: i64,
    count: i64,
}

impl RateLimiter {
    fn new(max_per_minute: i64) -> Self {
        Self {
            max_per_minute,
            window_start: 0,
            count: 0,
        }
    }

    fn allow(&mut self, now: i64) -> bool {
        if now - self.window_start >= 60_000 {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.max_per_minute {
            return false;
        }
        self.count += 1;
        true
    }
}

#[derive(Default)]
struct Stats {
    received: AtomicU64,
    published: AtomicU64,
    rate_limited: AtomicU64,
    errored: AtomicU64,
    last_event_ms: AtomicI64,
}

/// Point-in-time view of the reactive pipeline, surfaced on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct ReactiveStatus {
    pub running: bool,
    pub enabled: bool,
    pub bus_connected: bool,
    pub received: u64,
    pub published: u64,
    pub debounced: u64,
    pub rate_limited: u64,
    pub dropped: u64,
    pub errored: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_ms: Option<i64>,
}

struct ActiveBus {
    bus: ChangeNotificationBus,
    consumer: JoinHandle<()>,
    applied: ReactiveConfig,
}

struct Inner {
    pool: Pool,
    pg_args: PostgresArgs,
    publisher: Arc<dyn Publisher>,
    stats: Stats,
    running: AtomicBool,
    enabled: AtomicBool,
    active: Mutex<Option<ActiveBus>>,
    cancel: Mutex<Option<CancellationToken>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ReactiveReconciler {
    inner: Arc<Inner>,
}

impl ReactiveReconciler {
    pub fn new(pool: Pool, pg_args: PostgresArgs, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                pg_args,
                publisher,
                stats: Stats::default(),
                running: AtomicBool::new(false),
                enabled: AtomicBool::new(false),
                active: Mutex::new(None),
                cancel: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the control loop. When the stored config is disabled the
    /// reconciler is running but idle; the poll loop picks up transitions.
    pub async fn start(&self) -> Result<()> {
        let config = db::get_reactive_config(&self.inner.pool).await?;
        config
            .validate()
            .map_err(|reason| anyhow::anyhow!("invalid reactive config: {reason}"))?;

        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            control_loop(inner, loop_cancel).await;
        });
        *self.inner.cancel.lock().await = Some(cancel);
        *self.inner.worker.lock().await = Some(handle);
        tracing::info!(enabled = config.enabled, "reactive reconciler started");
        Ok(())
    }

    /// Tear down the bus and the control loop. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = self.inner.cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.inner.worker.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = ?e, "reactive control loop exited abnormally");
            }
        }
        tracing::info!("reactive reconciler stopped");
    }

    /// Degraded means: supposed to be listening, but the notification
    /// connection is down. The store and publisher may still be fine.
    pub async fn is_degraded(&self) -> bool {
        if !self.is_running() || !self.inner.enabled.load(Ordering::SeqCst) {
            return false;
        }
        let active = self.inner.active.lock().await;
        match active.as_ref() {
            Some(a) => !a.bus.is_connected(),
            None => true,
        }
    }

    pub async fn status(&self) -> ReactiveStatus {
        let active = self.inner.active.lock().await;
        let bus_counters = active.as_ref().map(|a| a.bus.counters());
        let stats = &self.inner.stats;
        let last = stats.last_event_ms.load(Ordering::Relaxed);
        ReactiveStatus {
            running: self.is_running(),
            enabled: self.inner.enabled.load(Ordering::SeqCst),
            bus_connected: active.as_ref().is_some_and(|a| a.bus.is_connected()),
            received: stats.received.load(Ordering::Relaxed),
            published: stats.published.load(Ordering::Relaxed),
            debounced: bus_counters.map(|c| c.debounced).unwrap_or(0),
            rate_limited: stats.rate_limited.load(Ordering::Relaxed),
            dropped: bus_counters.map(|c| c.dropped).unwrap_or(0),
            errored: stats.errored.load(Ordering::Relaxed),
            last_event_ms: (last > 0).then_some(last),
        }
    }
}

async fn control_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut poll_interval = Duration::from_millis(30_000);
    loop {
        match db::get_reactive_config(&inner.pool).await {
            Ok(config) => {
                poll_interval = Duration::from_millis(config.database_poll_interval_ms.max(1) as u64);
                inner.enabled.store(config.enabled, Ordering::SeqCst);
                apply_config(&inner, &cancel, config).await;
            }
            Err(e) => {
                tracing::warn!(error = ?e, "failed to refresh reactive config");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    teardown(&inner).await;
}

/// Start, stop, or restart the bus so its state matches the stored config.
async fn apply_config(inner: &Arc<Inner>, cancel: &CancellationToken, config: ReactiveConfig) {
    let mut active = inner.active.lock().await;

    if !config.enabled {
        if let Some(a) = active.take() {
            tracing::info!("reactive reconciliation disabled, stopping bus");
            a.bus.stop().await;
            a.consumer.abort();
        }
        return;
    }

    if let Some(a) = active.take() {
        if a.applied == config {
            *active = Some(a);
            return;
        }
        tracing::info!("reactive config changed, restarting bus");
        a.bus.stop().await;
        a.consumer.abort();
    } else {
        tracing::info!("reactive reconciliation enabled, starting bus");
    }

    let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let bus = ChangeNotificationBus::new(inner.pg_args.clone(), config.debounce_ms, tx);
    bus.start().await;

    let consumer_inner = inner.clone();
    let consumer_cancel = cancel.clone();
    let consumer_config = config.clone();
    let consumer = tokio::spawn(async move {
        consume(consumer_inner, consumer_config, rx, consumer_cancel).await;
    });

    *active = Some(ActiveBus {
        bus,
        consumer,
        applied: config,
    });
}

async fn teardown(inner: &Arc<Inner>) {
    let mut active = inner.active.lock().await;
    if let Some(a) = active.take() {
        a.bus.stop().await;
        a.consumer.abort();
    }
}

async fn consume(
    inner: Arc<Inner>,
    config: ReactiveConfig,
    mut rx: mpsc::Receiver<ChangeNotification>,
    cancel: CancellationToken,
) {
    let mut limiter = RateLimiter::new(config.max_events_per_minute);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            notification = rx.recv() => {
                let Some(notification) = notification else { break };
                process(&inner, &config, &mut limiter, notification).await;
            }
        }
    }
}

async fn process(
    inner: &Arc<Inner>,
    config: &ReactiveConfig,
    limiter: &mut RateLimiter,
    notification: ChangeNotification,
) {
    inner.stats.received.fetch_add(1, Ordering::Relaxed);

    if !config
        .change_types
        .iter()
        .any(|t| t == &notification.change_type)
    {
        return;
    }
    if !limiter.allow(now_ms()) {
        inner.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
        record_reactive_rate_limited();
        return;
    }

    // Resolve the live resource; a notification that outlived its resource
    // is dropped without a sound.
    let event = if let Some(nodepool_id) = notification.nodepool_id {
        match nodepool_db::get_nodepool_any(&inner.pool, nodepool_id).await {
            Ok(Some(nodepool)) => {
                // The cascade makes a live pool under a deleted cluster a
                // narrow race, but the contract is: never publish for a
                // resource whose parent is gone.
                match db::get_cluster_any(&inner.pool, nodepool.cluster_id).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        tracing::debug!(nodepool_id = %nodepool_id, "parent cluster gone, dropping notification");
                        return;
                    }
                    Err(e) => {
                        inner.stats.errored.fetch_add(1, Ordering::Relaxed);
                        record_reactive_error();
                        tracing::warn!(nodepool_id = %nodepool_id, error = ?e, "failed to resolve parent cluster for notification");
                        return;
                    }
                }
                build_event(
                    event_types::NODEPOOL_RECONCILE,
                    nodepool.cluster_id,
                    Some(nodepool.id),
                    nodepool.generation,
                    &notification,
                )
            }
            Ok(None) => {
                tracing::debug!(nodepool_id = %nodepool_id, "nodepool gone, dropping notification");
                return;
            }
            Err(e) => {
                inner.stats.errored.fetch_add(1, Ordering::Relaxed);
                record_reactive_error();
                tracing::warn!(nodepool_id = %nodepool_id, error = ?e, "failed to resolve nodepool for notification");
                return;
            }
        }
    } else {
        match db::get_cluster_any(&inner.pool, notification.cluster_id).await {
            Ok(Some(cluster)) => build_event(
                event_types::CLUSTER_RECONCILE,
                cluster.id,
                None,
                cluster.generation,
                &notification,
            ),
            Ok(None) => {
                tracing::debug!(cluster_id = %notification.cluster_id, "cluster gone, dropping notification");
                return;
            }
            Err(e) => {
                inner.stats.errored.fetch_add(1, Ordering::Relaxed);
                record_reactive_error();
                tracing::warn!(cluster_id = %notification.cluster_id, error = ?e, "failed to resolve cluster for notification");
                return;
            }
        }
    };

    let result = if event.nodepool_id.is_some() {
        inner.publisher.publish_nodepool_reconcile(&event).await
    } else {
        inner.publisher.publish_cluster_reconcile(&event).await
    };
    match result {
        Ok(()) => {
            inner.stats.published.fetch_add(1, Ordering::Relaxed);
            inner.stats.last_event_ms.store(now_ms(), Ordering::Relaxed);
            record_reactive_published(if event.nodepool_id.is_some() {
                KIND_NODEPOOL
            } else {
                KIND_CLUSTER
            });
        }
        Err(e) => {
            inner.stats.errored.fetch_add(1, Ordering::Relaxed);
            record_reactive_error();
            tracing::error!(cluster_id = %event.cluster_id, error = ?e, "failed to publish reactive reconcile event");
        }
    }
}

fn build_event(
    event_type: &str,
    cluster_id: uuid::Uuid,
    nodepool_id: Option<uuid::Uuid>,
    generation: i64,
    notification: &ChangeNotification,
) -> ReconcileEvent {
    let mut metadata = std::collections::BTreeMap::new();
    metadata.insert(
        "change_type".to_string(),
        notification.change_type.clone(),
    );
    ReconcileEvent {
        event_type: event_type.to_string(),
        cluster_id,
        nodepool_id,
        reason: notification.reason.clone(),
        generation,
        timestamp: now_ms(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn limiter_caps_per_window() {
        let mut limiter = RateLimiter::new(3);
        assert!(limiter.allow(NOW));
        assert!(limiter.allow(NOW + 10));
        assert!(limiter.allow(NOW + 20));
        assert!(!limiter.allow(NOW + 30));
        assert!(!limiter.allow(NOW + 59_999));
    }

    #[test]
    fn limiter_resets_on_new_window() {
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.allow(NOW));
        assert!(limiter.allow(NOW + 1));
        assert!(!limiter.allow(NOW + 2));
        assert!(limiter.allow(NOW + 60_000));
        assert!(limiter.allow(NOW + 60_001));
        assert!(!limiter.allow(NOW + 60_002));
    }

    #[test]
    fn event_carries_change_type_metadata() {
        let notification = ChangeNotification {
            cluster_id: uuid::Uuid::new_v4(),
            nodepool_id: None,
            change_type: "spec".to_string(),
            reason: "generation_increment".to_string(),
            timestamp: NOW,
        };
        let event = build_event(
            event_types::CLUSTER_RECONCILE,
            notification.cluster_id,
            None,
            7,
            &notification,
        );
        assert_eq!(event.generation, 7);
        assert_eq!(event.reason, "generation_increment");
        assert_eq!(event.metadata["change_type"], "spec");
    }
}
