use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Aggregated lifecycle phase of a cluster or node pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Progressing,
    Ready,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Progressing => "Progressing",
            Phase::Ready => "Ready",
            Phase::Failed => "Failed",
        }
    }

    pub fn parse(value: &str) -> Option<Phase> {
        match value {
            "Pending" => Some(Phase::Pending),
            "Progressing" => Some(Phase::Progressing),
            "Ready" => Some(Phase::Ready),
            "Failed" => Some(Phase::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

pub mod condition_types {
    pub const READY: &str = "Ready";
    pub const AVAILABLE: &str = "Available";
}

pub mod status_reasons {
    pub const NO_CONTROLLERS: &str = "NoControllers";
    pub const ALL_CONTROLLERS_READY: &str = "AllControllersReady";
    pub const PARTIAL_PROGRESS: &str = "PartialProgress";
    pub const CONTROLLERS_WITH_ERRORS: &str = "ControllersWithErrors";
    pub const NO_CONTROLLERS_READY: &str = "NoControllersReady";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    /// Unix epoch milliseconds; moves only when `status` flips.
    pub last_transition_time: i64,
}

/// Aggregated status block derived from controller reports.
///
/// `observed_generation` always equals the resource generation the block was
/// computed against; reports from older generations never influence it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatusInfo {
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
    pub phase: Phase,
    pub reason: String,
    pub message: String,
    /// Unix epoch milliseconds.
    pub last_update_time: i64,
}

impl ClusterStatusInfo {
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// Node pools share the aggregated status shape with clusters.
pub type NodePoolStatusInfo = ClusterStatusInfo;

// =============================================================================
// Specs
// =============================================================================

/// Cloud platform the cluster is provisioned on. Closed set; validators
/// match exhaustively so a new platform cannot ship half-wired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlatformConfig {
    Gcp(GcpPlatform),
    Aws(AwsPlatform),
    Azure(AzurePlatform),
}

impl PlatformConfig {
    pub fn name(&self) -> &'static str {
        match self {
            PlatformConfig::Gcp(_) => "gcp",
            PlatformConfig::Aws(_) => "aws",
            PlatformConfig::Azure(_) => "azure",
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            PlatformConfig::Gcp(gcp) => {
                if gcp.project.is_empty() {
                    return Err("gcp platform requires a project".to_string());
                }
                if gcp.region.is_empty() {
                    return Err("gcp platform requires a region".to_string());
                }
            }
            PlatformConfig::Aws(aws) => {
                if aws.region.is_empty() {
                    return Err("aws platform requires a region".to_string());
                }
            }
            PlatformConfig::Azure(azure) => {
                if azure.subscription_id.is_empty() {
                    return Err("azure platform requires a subscription_id".to_string());
                }
                if azure.location.is_empty() {
                    return Err("azure platform requires a location".to_string());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcpPlatform {
    pub project: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsPlatform {
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzurePlatform {
    pub subscription_id: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseConfig {
    pub channel: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkingConfig {
    pub pod_cidr: String,
    pub service_cidr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_cidr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub base_domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningConfig {
    pub public_key: String,
}

/// Declarative desired state for a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub platform: PlatformConfig,
    pub release: ReleaseConfig,
    pub networking: NetworkingConfig,
    pub dns: DnsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing: Option<SigningConfig>,
}

impl ClusterSpec {
    pub fn validate(&self) -> Result<(), String> {
        self.platform.validate()?;
        if self.release.version.is_empty() {
            return Err("release requires a version".to_string());
        }
        if !is_cidr(&self.networking.pod_cidr) {
            return Err(format!("pod_cidr '{}' is not a CIDR", self.networking.pod_cidr));
        }
        if !is_cidr(&self.networking.service_cidr) {
            return Err(format!(
                "service_cidr '{}' is not a CIDR",
                self.networking.service_cidr
            ));
        }
        if let Some(ref machine_cidr) = self.networking.machine_cidr {
            if !is_cidr(machine_cidr) {
                return Err(format!("machine_cidr '{}' is not a CIDR", machine_cidr));
            }
        }
        if self.dns.base_domain.is_empty() {
            return Err("dns requires a base_domain".to_string());
        }
        if let Some(ref signing) = self.signing {
            if signing.public_key.is_empty() {
                return Err("signing requires a public_key".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalingConfig {
    pub min_replicas: i32,
    pub max_replicas: i32,
}

/// Declarative desired state for a node pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePoolSpec {
    pub replicas: i32,
    pub instance_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<AutoscalingConfig>,
}

impl NodePoolSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.replicas < 0 {
            return Err("replicas must be non-negative".to_string());
        }
        if self.instance_type.is_empty() {
            return Err("instance_type is required".to_string());
        }
        if let Some(ref autoscaling) = self.autoscaling {
            if autoscaling.min_replicas < 0 {
                return Err("autoscaling min_replicas must be non-negative".to_string());
            }
            if autoscaling.max_replicas < autoscaling.min_replicas {
                return Err("autoscaling max_replicas must be >= min_replicas".to_string());
            }
        }
        Ok(())
    }
}

fn is_cidr(value: &str) -> bool {
    let Some((addr, prefix)) = value.split_once('/') else {
        return false;
    };
    let Ok(addr) = addr.parse::<std::net::IpAddr>() else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    match addr {
        std::net::IpAddr::V4(_) => prefix <= 32,
        std::net::IpAddr::V6(_) => prefix <= 128,
    }
}

// =============================================================================
// Resources
// =============================================================================

/// Top-level declarative resource for a managed cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    /// Opaque identity of whoever created the resource; used only for
    /// ownership filtering, never for policy.
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub generation: i64,
    pub resource_version: String,
    pub spec: ClusterSpec,
    pub status: Option<ClusterStatusInfo>,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    /// Unix epoch milliseconds.
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    #[serde(skip)]
    pub status_dirty: bool,
}

impl Cluster {
    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or(Phase::Pending)
    }
}

/// Child resource describing a group of worker machines within a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePool {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub name: String,
    pub owner: String,
    pub generation: i64,
    pub resource_version: String,
    pub spec: NodePoolSpec,
    pub status: Option<NodePoolStatusInfo>,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    /// Unix epoch milliseconds.
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    #[serde(skip)]
    pub status_dirty: bool,
}

impl NodePool {
    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or(Phase::Pending)
    }
}

// =============================================================================
// Controller status
// =============================================================================

/// Structured error a controller attaches to its report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerError {
    pub code: String,
    pub message: String,
}

/// One controller's view of one resource, tagged with the generation the
/// controller observed when it acted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub controller: String,
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ControllerError>,
    /// Unix epoch milliseconds.
    pub updated_at: i64,
}

// =============================================================================
// Requests / responses
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    #[serde(default)]
    pub project: Option<String>,
    pub spec: ClusterSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateClusterRequest {
    pub spec: ClusterSpec,
    /// Optional optimistic-concurrency token; mismatch fails the update.
    #[serde(default)]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNodePoolRequest {
    pub cluster_id: Uuid,
    pub name: String,
    pub spec: NodePoolSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNodePoolRequest {
    pub spec: NodePoolSpec,
    #[serde(default)]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertControllerStatusRequest {
    pub controller: String,
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub last_error: Option<ControllerError>,
}

/// Response containing a paginated list of clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListClustersResponse {
    pub offset: i64,
    pub limit: i64,
    pub full_count: i64,
    pub truncated: bool,
    pub items: Vec<Cluster>,
}

/// Response containing a paginated list of node pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListNodePoolsResponse {
    pub offset: i64,
    pub limit: i64,
    pub full_count: i64,
    pub truncated: bool,
    pub items: Vec<NodePool>,
}

/// Aggregated status plus the per-controller breakdown behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatusResponse {
    pub id: Uuid,
    pub generation: i64,
    pub status: Option<ClusterStatusInfo>,
    pub controllers: Vec<ControllerStatus>,
}

/// Tuning for the reactive reconciliation path; stored as a single row so
/// it can be flipped at runtime without a redeploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactiveConfig {
    pub enabled: bool,
    pub change_types: Vec<String>,
    pub debounce_ms: i64,
    pub max_events_per_minute: i64,
    pub database_poll_interval_ms: i64,
}

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            change_types: vec![
                lattice_common::streams::change_types::SPEC.to_string(),
                lattice_common::streams::change_types::OWNER_CHANGE.to_string(),
            ],
            debounce_ms: 2_000,
            max_events_per_minute: 60,
            database_poll_interval_ms: 30_000,
        }
    }
}

impl ReactiveConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.debounce_ms < 0 {
            return Err("debounce_ms must be non-negative".to_string());
        }
        if self.max_events_per_minute <= 0 {
            return Err("max_events_per_minute must be positive".to_string());
        }
        if self.database_poll_interval_ms <= 0 {
            return Err("database_poll_interval_ms must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gcp_spec() -> ClusterSpec {
        ClusterSpec {
            platform: PlatformConfig::Gcp(GcpPlatform {
                project: "p1".to_string(),
                region: "us-central1".to_string(),
                network: None,
            }),
            release: ReleaseConfig {
                channel: "stable".to_string(),
                version: "1.31.2".to_string(),
            },
            networking: NetworkingConfig {
                pod_cidr: "10.128.0.0/14".to_string(),
                service_cidr: "172.30.0.0/16".to_string(),
                machine_cidr: None,
            },
            dns: DnsConfig {
                base_domain: "clusters.example.com".to_string(),
                zone_id: None,
            },
            signing: None,
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(gcp_spec().validate().is_ok());
    }

    #[test]
    fn platform_fields_are_required() {
        let mut spec = gcp_spec();
        spec.platform = PlatformConfig::Gcp(GcpPlatform {
            project: String::new(),
            region: "us-central1".to_string(),
            network: None,
        });
        assert!(spec.validate().is_err());

        spec.platform = PlatformConfig::Azure(AzurePlatform {
            subscription_id: "sub".to_string(),
            location: String::new(),
            resource_group: None,
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn bad_cidr_is_rejected() {
        let mut spec = gcp_spec();
        spec.networking.pod_cidr = "10.128.0.0".to_string();
        assert!(spec.validate().is_err());
        spec.networking.pod_cidr = "10.128.0.0/40".to_string();
        assert!(spec.validate().is_err());
        spec.networking.pod_cidr = "fd00::/48".to_string();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn platform_tag_round_trips() {
        let spec = gcp_spec();
        let json = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(json["platform"]["type"], "gcp");
        let back: ClusterSpec = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, spec);
    }

    #[test]
    fn nodepool_autoscaling_bounds() {
        let mut spec = NodePoolSpec {
            replicas: 3,
            instance_type: "n2-standard-4".to_string(),
            zones: vec![],
            labels: BTreeMap::new(),
            autoscaling: Some(AutoscalingConfig {
                min_replicas: 5,
                max_replicas: 2,
            }),
        };
        assert!(spec.validate().is_err());
        spec.autoscaling = Some(AutoscalingConfig {
            min_replicas: 1,
            max_replicas: 5,
        });
        assert!(spec.validate().is_ok());
        spec.replicas = -1;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn phase_parse_round_trips() {
        for phase in [Phase::Pending, Phase::Progressing, Phase::Ready, Phase::Failed] {
            assert_eq!(Phase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::parse("Deleting"), None);
    }
}
