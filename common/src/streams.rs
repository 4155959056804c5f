//! Outbound wire contract shared by the control plane and its controllers.
//!
//! Two logical JetStream streams exist: one for cluster traffic and one for
//! node-pool traffic. Lifecycle and reconcile events for a resource kind
//! share that kind's stream; controllers self-filter on the subject and the
//! duplicated message headers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Postgres notification channel raised by the store's trigger layer.
pub const NOTIFY_CHANNEL: &str = "reconcile_change";

pub mod stream_names {
    pub const CLUSTER_EVENTS: &str = "cluster-events";
    pub const NODEPOOL_EVENTS: &str = "nodepool-events";
}

pub mod topics {
    pub const CLUSTER_LIFECYCLE: &str = "lattice.cluster.lifecycle";
    pub const CLUSTER_RECONCILE: &str = "lattice.cluster.reconcile";
    pub const NODEPOOL_LIFECYCLE: &str = "lattice.nodepool.lifecycle";
    pub const NODEPOOL_RECONCILE: &str = "lattice.nodepool.reconcile";

    /// Subject wildcard binding a kind's lifecycle and reconcile subjects
    /// onto one stream.
    pub const CLUSTER_ALL: &str = "lattice.cluster.>";
    pub const NODEPOOL_ALL: &str = "lattice.nodepool.>";
}

pub mod event_types {
    pub const CLUSTER_RECONCILE: &str = "cluster.reconcile";
    pub const NODEPOOL_RECONCILE: &str = "nodepool.reconcile";
}

/// Message headers duplicated from the payload for downstream filtering.
pub mod headers {
    pub const EVENT_TYPE: &str = "event_type";
    pub const CLUSTER_ID: &str = "cluster_id";
    pub const NODEPOOL_ID: &str = "nodepool_id";
    pub const REASON: &str = "reason";
}

pub mod change_types {
    pub const SPEC: &str = "spec";
    pub const STATUS: &str = "status";
    pub const CONTROLLER_STATUS: &str = "controller_status";
    pub const OWNER_CHANGE: &str = "owner_change";
}

pub mod reasons {
    pub const NEVER_RECONCILED: &str = "never_reconciled";
    pub const HEALTHY_RECONCILIATION: &str = "healthy_reconciliation";
    pub const UNHEALTHY_RECONCILIATION: &str = "unhealthy_reconciliation";
    pub const PERIODIC_RECONCILIATION: &str = "periodic_reconciliation";
    pub const GENERATION_MISMATCH: &str = "generation_mismatch";
    pub const MANUAL_TRIGGER: &str = "manual_trigger";
    pub const GENERATION_INCREMENT: &str = "generation_increment";
    pub const OWNER_CHANGED: &str = "owner_changed";
    pub const CLUSTER_DELETED: &str = "cluster_deleted";
    pub const NODEPOOL_CREATED: &str = "nodepool_created";
}

/// Announcement of a create/update/delete. Carries no spec payload;
/// consumers fetch the resource if they care.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub cluster_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodepool_id: Option<Uuid>,
    pub generation: i64,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub source: String,
}

/// Instruction for subscribed controllers to re-examine a resource.
///
/// `generation` is the value observed by the publisher at publish time; 0 is
/// a sentinel meaning no generation assertion (manual triggers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub cluster_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodepool_id: Option<Uuid>,
    pub reason: String,
    pub generation: i64,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ReconcileEvent {
    pub fn resource_id(&self) -> Uuid {
        self.nodepool_id.unwrap_or(self.cluster_id)
    }
}

/// Payload carried on the `reconcile_change` Postgres channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub cluster_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodepool_id: Option<Uuid>,
    pub change_type: String,
    pub reason: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_event_wire_fields() {
        let event = LifecycleEvent {
            id: Uuid::nil(),
            event_type: "cluster.created".to_string(),
            cluster_id: Uuid::nil(),
            nodepool_id: None,
            generation: 1,
            timestamp: 1_700_000_000_000,
            source: "lattice-controlplane".to_string(),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "cluster.created");
        assert!(value.get("nodepool_id").is_none());
        assert_eq!(value["generation"], 1);
    }

    #[test]
    fn reconcile_event_round_trips_with_metadata() {
        let mut metadata = BTreeMap::new();
        metadata.insert("change_type".to_string(), "spec".to_string());
        let event = ReconcileEvent {
            event_type: "nodepool.reconcile".to_string(),
            cluster_id: Uuid::new_v4(),
            nodepool_id: Some(Uuid::new_v4()),
            reason: reasons::GENERATION_INCREMENT.to_string(),
            generation: 4,
            timestamp: 1_700_000_000_000,
            metadata,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let back: ReconcileEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.resource_id(), event.nodepool_id.unwrap());
        assert_eq!(back.metadata["change_type"], "spec");
    }

    #[test]
    fn change_notification_accepts_trigger_payload() {
        // Shape produced by the store's PL/pgSQL triggers.
        let payload = r#"{"cluster_id":"6f2c9c30-38dd-4a5e-9f47-0e6f34efcb01","change_type":"spec","reason":"generation_increment","timestamp":1700000000000}"#;
        let n: ChangeNotification = serde_json::from_str(payload).expect("deserialize");
        assert_eq!(n.change_type, change_types::SPEC);
        assert!(n.nodepool_id.is_none());
    }
}
