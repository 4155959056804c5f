//! Change notification bus.
//!
//! A dedicated Postgres session (never a pooled one: LISTEN subscriptions do
//! not survive pool recycling) subscribes to the `reconcile_change` channel
//! and feeds debounced [`ChangeNotification`]s to the reactive reconciler.
//! Delivery is best-effort: when the downstream consumer stalls the reader
//! drops notifications, and the periodic scheduler's generation-mismatch
//! detection keeps the system correct.

use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use lattice_common::args::PostgresArgs;
use lattice_common::metrics::{
    record_notification_connection_error, record_notification_debounced,
    record_notification_dropped, record_notification_malformed, record_notification_received,
};
use lattice_common::now_ms;
use lattice_common::streams::{ChangeNotification, NOTIFY_CHANNEL};
use postgres::NoTls;
use std::collections::HashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_postgres::AsyncMessage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const GC_MAX_AGE_MS: i64 = 5 * 60 * 1000;
const GC_INTERVAL_MS: i64 = 60 * 1000;

type DebounceKey = (Uuid, Option<Uuid>, String);

struct DebounceState {
    entries: HashMap<DebounceKey, i64>,
    last_gc: i64,
}

/// Drops notifications whose `(resource, change_type)` key was already seen
/// within the window. Entries older than five minutes are collected
/// opportunistically on the write path.
pub struct Debouncer {
    window_ms: i64,
    state: RwLock<DebounceState>,
}

impl Debouncer {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            state: RwLock::new(DebounceState {
                entries: HashMap::new(),
                last_gc: 0,
            }),
        }
    }

    pub fn should_forward(&self, notification: &ChangeNotification, now: i64) -> bool {
        let key = (
            notification.cluster_id,
            notification.nodepool_id,
            notification.change_type.clone(),
        );
        {
            let state = self.state.read().expect("debouncer lock poisoned");
            if let Some(&last) = state.entries.get(&key) {
                if now - last < self.window_ms {
                    return false;
                }
            }
        }

        let mut state = self.state.write().expect("debouncer lock poisoned");
        // Re-check: another writer may have won between the locks.
        if let Some(&last) = state.entries.get(&key) {
            if now - last < self.window_ms {
                return false;
            }
        }
        state.entries.insert(key, now);

        if now - state.last_gc >= GC_INTERVAL_MS {
            state.last_gc = now;
            state.entries.retain(|_, last| now - *last < GC_MAX_AGE_MS);
        }
        true
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.state
            .read()
            .expect("debouncer lock poisoned")
            .entries
            .len()
    }
}

#[derive(Default)]
struct BusCounters {
    received: AtomicU64,
    debounced: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BusCountersSnapshot {
    pub received: u64,
    pub debounced: u64,
    pub dropped: u64,
    pub malformed: u64,
}

struct BusInner {
    pg: PostgresArgs,
    debouncer: Debouncer,
    tx: mpsc::Sender<ChangeNotification>,
    running: AtomicBool,
    connected: AtomicBool,
    counters: BusCounters,
    cancel: Mutex<Option<CancellationToken>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ChangeNotificationBus {
    inner: Arc<BusInner>,
}

impl ChangeNotificationBus {
    pub fn new(
        pg: PostgresArgs,
        debounce_window_ms: i64,
        tx: mpsc::Sender<ChangeNotification>,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                pg,
                debouncer: Debouncer::new(debounce_window_ms),
                tx,
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                counters: BusCounters::default(),
                cancel: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// True once the LISTEN subscription is established; false while the
    /// reader is reconnecting.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> BusCountersSnapshot {
        BusCountersSnapshot {
            received: self.inner.counters.received.load(Ordering::Relaxed),
            debounced: self.inner.counters.debounced.load(Ordering::Relaxed),
            dropped: self.inner.counters.dropped.load(Ordering::Relaxed),
            malformed: self.inner.counters.malformed.load(Ordering::Relaxed),
        }
    }

    /// Open the dedicated connection and spawn the single reader task.
    /// No-op when already running.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            reader_loop(inner, loop_cancel).await;
        });
        *self.inner.cancel.lock().await = Some(cancel);
        *self.inner.worker.lock().await = Some(handle);
    }

    /// Unsubscribe, close the connection, and wait for the reader. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = self.inner.cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.inner.worker.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = ?e, "notification reader exited abnormally");
            }
        }
        tracing::info!("change notification bus stopped");
    }
}

async fn reader_loop(inner: Arc<BusInner>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let result = listen_once(&inner, &cancel).await;
        inner.connected.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => break,
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                record_notification_connection_error();
                tracing::warn!(error = ?e, "notification connection lost, reconnecting");
                // Jittered sleep well under a second; never busy-loops.
                if lattice_common::wait::wait_with_backoff(&cancel, 2, Duration::from_millis(500))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

async fn listen_once(inner: &BusInner, cancel: &CancellationToken) -> Result<()> {
    let (client, mut messages, pump) = connect_and_pump(&inner.pg).await?;
    client
        .batch_execute(&format!("LISTEN {NOTIFY_CHANNEL}"))
        .await
        .context("failed to LISTEN on notification channel")?;
    inner.connected.store(true, Ordering::SeqCst);
    tracing::info!(channel = NOTIFY_CHANNEL, "listening for change notifications");

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            msg = messages.recv() => match msg {
                None => break Err(anyhow!("notification connection closed")),
                Some(AsyncMessage::Notification(n)) => handle_payload(inner, n.payload()),
                Some(_) => {}
            }
        }
    };
    pump.abort();
    drop(client);
    result
}

async fn connect_and_pump(
    pg: &PostgresArgs,
) -> Result<(
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<AsyncMessage>,
    JoinHandle<()>,
)> {
    let config = lattice_common::postgres::direct_config(pg);
    if let Some(ref ca_cert) = pg.postgres_ca_cert {
        let tls = lattice_common::postgres::tls_from_ca_cert(ca_cert)?;
        let (client, connection) = config
            .connect(tls)
            .await
            .context("failed to open notification connection")?;
        Ok(pump_messages(client, connection))
    } else {
        let (client, connection) = config
            .connect(NoTls)
            .await
            .context("failed to open notification connection")?;
        Ok(pump_messages(client, connection))
    }
}

fn pump_messages<S, T>(
    client: tokio_postgres::Client,
    connection: tokio_postgres::Connection<S, T>,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<AsyncMessage>,
    JoinHandle<()>,
)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let mut connection = connection;
    let handle = tokio::spawn(async move {
        let mut stream = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = stream.next().await {
            match message {
                Ok(m) => {
                    if tx.send(m).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "notification connection error");
                    break;
                }
            }
        }
    });
    (client, rx, handle)
}

fn handle_payload(inner: &BusInner, payload: &str) {
    inner.counters.received.fetch_add(1, Ordering::Relaxed);
    record_notification_received();
    let notification: ChangeNotification = match serde_json::from_str(payload) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, payload, "discarding malformed change notification");
            inner.counters.malformed.fetch_add(1, Ordering::Relaxed);
            record_notification_malformed();
            return;
        }
    };

    if !inner.debouncer.should_forward(&notification, now_ms()) {
        inner.counters.debounced.fetch_add(1, Ordering::Relaxed);
        record_notification_debounced();
        return;
    }

    match inner.tx.try_send(notification) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(n)) => {
            // Consumer is stalled. Dropping is safe: periodic reconciliation
            // will catch the change via generation mismatch.
            inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            record_notification_dropped();
            tracing::warn!(cluster_id = %n.cluster_id, "downstream consumer full, dropping notification");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::warn!("notification consumer closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::streams::change_types;

    const NOW: i64 = 1_700_000_000_000;

    fn notification(cluster_id: Uuid, change_type: &str) -> ChangeNotification {
        ChangeNotification {
            cluster_id,
            nodepool_id: None,
            change_type: change_type.to_string(),
            reason: "generation_increment".to_string(),
            timestamp: NOW,
        }
    }

    #[test]
    fn burst_for_one_key_collapses_to_one() {
        let debouncer = Debouncer::new(2_000);
        let n = notification(Uuid::new_v4(), change_types::SPEC);
        let forwarded = (0..100)
            .filter(|i| debouncer.should_forward(&n, NOW + i * 10))
            .count();
        assert_eq!(forwarded, 1);
    }

    #[test]
    fn distinct_keys_do_not_interfere() {
        let debouncer = Debouncer::new(2_000);
        let a = notification(Uuid::new_v4(), change_types::SPEC);
        let b = notification(Uuid::new_v4(), change_types::SPEC);
        let c = notification(a.cluster_id, change_types::OWNER_CHANGE);
        assert!(debouncer.should_forward(&a, NOW));
        assert!(debouncer.should_forward(&b, NOW));
        assert!(debouncer.should_forward(&c, NOW));
    }

    #[test]
    fn key_forwards_again_after_window() {
        let debouncer = Debouncer::new(2_000);
        let n = notification(Uuid::new_v4(), change_types::SPEC);
        assert!(debouncer.should_forward(&n, NOW));
        assert!(!debouncer.should_forward(&n, NOW + 1_999));
        assert!(debouncer.should_forward(&n, NOW + 2_000));
    }

    #[test]
    fn nodepool_and_cluster_keys_are_distinct() {
        let debouncer = Debouncer::new(2_000);
        let cluster = notification(Uuid::new_v4(), change_types::SPEC);
        let mut pool = cluster.clone();
        pool.nodepool_id = Some(Uuid::new_v4());
        assert!(debouncer.should_forward(&cluster, NOW));
        assert!(debouncer.should_forward(&pool, NOW));
    }

    #[test]
    fn stale_entries_are_collected() {
        let debouncer = Debouncer::new(2_000);
        for _ in 0..10 {
            let n = notification(Uuid::new_v4(), change_types::SPEC);
            assert!(debouncer.should_forward(&n, NOW));
        }
        assert_eq!(debouncer.tracked_keys(), 10);

        // Far enough in the future that every earlier entry is past the GC
        // horizon; the insert that triggers GC is the only survivor.
        let later = NOW + GC_MAX_AGE_MS + GC_INTERVAL_MS;
        let n = notification(Uuid::new_v4(), change_types::SPEC);
        assert!(debouncer.should_forward(&n, later));
        assert_eq!(debouncer.tracked_keys(), 1);
    }
}
