use anyhow::{Context, Result};
use async_nats::jetstream::{self, message::PublishMessage};
use async_trait::async_trait;
use lattice_common::now_ms;
use lattice_common::streams::{LifecycleEvent, ReconcileEvent, headers, stream_names, topics};
use uuid::Uuid;

use crate::models::{Cluster, NodePool};

/// The only outbound coupling the core has. Everything that leaves the
/// process goes through one of these four operations.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_cluster_lifecycle(&self, event: &LifecycleEvent) -> Result<()>;
    async fn publish_nodepool_lifecycle(&self, event: &LifecycleEvent) -> Result<()>;
    async fn publish_cluster_reconcile(&self, event: &ReconcileEvent) -> Result<()>;
    async fn publish_nodepool_reconcile(&self, event: &ReconcileEvent) -> Result<()>;
}

/// JetStream-backed publisher. Lifecycle and reconcile events for a resource
/// kind share that kind's stream; headers duplicate the filterable fields.
pub struct JetStreamPublisher {
    jetstream: jetstream::Context,
}

impl JetStreamPublisher {
    /// Create the publisher and ensure both streams exist.
    pub async fn new(nats: async_nats::Client) -> Result<Self> {
        let jetstream = jetstream::new(nats);

        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_names::CLUSTER_EVENTS.to_string(),
                subjects: vec![topics::CLUSTER_ALL.to_string()],
                ..Default::default()
            })
            .await
            .context("failed to get or create cluster events stream")?;
        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_names::NODEPOOL_EVENTS.to_string(),
                subjects: vec![topics::NODEPOOL_ALL.to_string()],
                ..Default::default()
            })
            .await
            .context("failed to get or create nodepool events stream")?;

        Ok(Self { jetstream })
    }

    async fn publish(
        &self,
        subject: &'static str,
        message_id: String,
        event_headers: async_nats::HeaderMap,
        payload: bytes::Bytes,
    ) -> Result<()> {
        let publish = PublishMessage::build()
            .payload(payload)
            .message_id(message_id)
            .headers(event_headers);

        let ack = self
            .jetstream
            .send_publish(subject, publish)
            .await
            .context("failed to publish event")?;
        ack.await.context("failed to get publish ack")?;
        Ok(())
    }
}

fn lifecycle_headers(event: &LifecycleEvent) -> async_nats::HeaderMap {
    let mut map = async_nats::HeaderMap::new();
    map.insert(headers::EVENT_TYPE, event.event_type.as_str());
    map.insert(headers::CLUSTER_ID, event.cluster_id.to_string().as_str());
    if let Some(nodepool_id) = event.nodepool_id {
        map.insert(headers::NODEPOOL_ID, nodepool_id.to_string().as_str());
    }
    map
}

fn reconcile_headers(event: &ReconcileEvent) -> async_nats::HeaderMap {
    let mut map = async_nats::HeaderMap::new();
    map.insert(headers::EVENT_TYPE, event.event_type.as_str());
    map.insert(headers::CLUSTER_ID, event.cluster_id.to_string().as_str());
    if let Some(nodepool_id) = event.nodepool_id {
        map.insert(headers::NODEPOOL_ID, nodepool_id.to_string().as_str());
    }
    map.insert(headers::REASON, event.reason.as_str());
    map
}

#[async_trait]
impl Publisher for JetStreamPublisher {
    async fn publish_cluster_lifecycle(&self, event: &LifecycleEvent) -> Result<()> {
        let payload: bytes::Bytes =
            serde_json::to_vec(event)
                .context("failed to serialize event")?
                .into();
        self.publish(
            topics::CLUSTER_LIFECYCLE,
            event.id.to_string(),
            lifecycle_headers(event),
            payload,
        )
        .await
    }

    async fn publish_nodepool_lifecycle(&self, event: &LifecycleEvent) -> Result<()> {
        let payload: bytes::Bytes =
            serde_json::to_vec(event)
                .context("failed to serialize event")?
                .into();
        self.publish(
            topics::NODEPOOL_LIFECYCLE,
            event.id.to_string(),
            lifecycle_headers(event),
            payload,
        )
        .await
    }

    async fn publish_cluster_reconcile(&self, event: &ReconcileEvent) -> Result<()> {
        let payload: bytes::Bytes =
            serde_json::to_vec(event)
                .context("failed to serialize event")?
                .into();
        let message_id = format!(
            "{}:{}:{}",
            event.event_type, event.cluster_id, event.timestamp
        );
        self.publish(
            topics::CLUSTER_RECONCILE,
            message_id,
            reconcile_headers(event),
            payload,
        )
        .await
    }

    async fn publish_nodepool_reconcile(&self, event: &ReconcileEvent) -> Result<()> {
        let payload: bytes::Bytes =
            serde_json::to_vec(event)
                .context("failed to serialize event")?
                .into();
        let message_id = format!(
            "{}:{}:{}",
            event.event_type,
            event.resource_id(),
            event.timestamp
        );
        self.publish(
            topics::NODEPOOL_RECONCILE,
            message_id,
            reconcile_headers(event),
            payload,
        )
        .await
    }
}

/// Build the lightweight announcement for a cluster create/update/delete.
pub fn cluster_lifecycle_event(action: &str, cluster: &Cluster, source: &str) -> LifecycleEvent {
    LifecycleEvent {
        id: Uuid::new_v4(),
        event_type: format!("cluster.{action}"),
        cluster_id: cluster.id,
        nodepool_id: None,
        generation: cluster.generation,
        timestamp: now_ms(),
        source: source.to_string(),
    }
}

pub fn nodepool_lifecycle_event(action: &str, nodepool: &NodePool, source: &str) -> LifecycleEvent {
    LifecycleEvent {
        id: Uuid::new_v4(),
        event_type: format!("nodepool.{action}"),
        cluster_id: nodepool.cluster_id,
        nodepool_id: Some(nodepool.id),
        generation: nodepool.generation,
        timestamp: now_ms(),
        source: source.to_string(),
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum Published {
        ClusterLifecycle(LifecycleEvent),
        NodepoolLifecycle(LifecycleEvent),
        ClusterReconcile(ReconcileEvent),
        NodepoolReconcile(ReconcileEvent),
    }

    /// Records everything it is asked to publish; optionally fails every
    /// publish to exercise error paths.
    #[derive(Default)]
    pub struct RecordingPublisher {
        pub published: Mutex<Vec<Published>>,
        pub fail: bool,
    }

    impl RecordingPublisher {
        pub fn failing() -> Self {
            Self {
                published: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub fn reconcile_events(&self) -> Vec<ReconcileEvent> {
            self.published
                .lock()
                .expect("publisher lock")
                .iter()
                .filter_map(|p| match p {
                    Published::ClusterReconcile(e) | Published::NodepoolReconcile(e) => {
                        Some(e.clone())
                    }
                    _ => None,
                })
                .collect()
        }

        fn record(&self, item: Published) -> Result<()> {
            if self.fail {
                anyhow::bail!("publish failed");
            }
            self.published.lock().expect("publisher lock").push(item);
            Ok(())
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish_cluster_lifecycle(&self, event: &LifecycleEvent) -> Result<()> {
            self.record(Published::ClusterLifecycle(event.clone()))
        }
        async fn publish_nodepool_lifecycle(&self, event: &LifecycleEvent) -> Result<()> {
            self.record(Published::NodepoolLifecycle(event.clone()))
        }
        async fn publish_cluster_reconcile(&self, event: &ReconcileEvent) -> Result<()> {
            self.record(Published::ClusterReconcile(event.clone()))
        }
        async fn publish_nodepool_reconcile(&self, event: &ReconcileEvent) -> Result<()> {
            self.record(Published::NodepoolReconcile(event.clone()))
        }
    }
}
