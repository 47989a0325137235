//! Typed control-plane resources for the federation API group.
//!
//! These are the resources the controllers themselves consume: type
//! descriptors, member-cluster records, and propagated-version records.
//! Federated and target objects stay schemaless (`DynamicObject`).

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use kube::core::{ApiResource as KubeApiResource, GroupVersionKind};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Annotation on a cluster record marking the cluster hosting the control
/// plane. At most one cluster may carry it.
pub const PRIMARY_CLUSTER_ANNOTATION: &str = "federation.kubefed.io/primary";

/// Condition type written onto federated objects by the sync controller.
pub const PROPAGATION_CONDITION: &str = "Propagation";

// -------- FederatedTypeConfig --------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ResourceScope {
    Cluster,
    Namespaced,
}

/// One side of a type descriptor: the target API or its federated wrapper.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub version: String,
    pub kind: String,
    pub plural_name: String,
    pub scope: ResourceScope,
}

impl ApiResourceDef {
    pub fn group_str(&self) -> &str {
        self.group.as_deref().unwrap_or("")
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind {
            group: self.group_str().to_string(),
            version: self.version.clone(),
            kind: self.kind.clone(),
        }
    }

    pub fn api_resource(&self) -> KubeApiResource {
        let api_version = if self.group_str().is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group_str(), self.version)
        };
        KubeApiResource {
            group: self.group_str().to_string(),
            version: self.version.clone(),
            api_version,
            kind: self.kind.clone(),
            plural: self.plural_name.clone(),
        }
    }

    pub fn namespaced(&self) -> bool {
        self.scope == ResourceScope::Namespaced
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PropagationMode {
    Enabled,
    Disabled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum StatusCollectionMode {
    Enabled,
    Disabled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ControllerState {
    Running,
    NotRunning,
}

/// Describes one federatable type and toggles its controllers.
#[derive(CustomResource, Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "core.kubefed.io",
    version = "v1beta1",
    kind = "FederatedTypeConfig",
    namespaced,
    status = "FederatedTypeConfigStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct FederatedTypeConfigSpec {
    pub target_type: ApiResourceDef,
    pub federated_type: ApiResourceDef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_type: Option<ApiResourceDef>,
    pub propagation: PropagationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_collection: Option<StatusCollectionMode>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FederatedTypeConfigStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation_controller: Option<ControllerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_controller: Option<ControllerState>,
}

impl FederatedTypeConfig {
    pub fn propagation_enabled(&self) -> bool {
        self.spec.propagation == PropagationMode::Enabled
    }

    pub fn status_collection_enabled(&self) -> bool {
        self.spec.status_collection == Some(StatusCollectionMode::Enabled)
    }

    /// Whether target objects of this type live inside namespaces.
    pub fn target_namespaced(&self) -> bool {
        self.spec.target_type.namespaced()
    }

    /// The descriptor for namespaces themselves, which gates every
    /// namespaced sync controller.
    pub fn is_namespace_descriptor(&self) -> bool {
        self.metadata.name.as_deref() == Some("namespaces")
    }
}

// -------- FederatedCluster --------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LocalSecretRef {
    pub name: String,
}

#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClusterConditionType {
    Ready,
    Offline,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: ClusterConditionType,
    /// "True", "False" or "Unknown", as on core conditions.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A member cluster registered with the control plane.
#[derive(CustomResource, Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "core.kubefed.io",
    version = "v1beta1",
    kind = "FederatedCluster",
    namespaced,
    status = "FederatedClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct FederatedClusterSpec {
    pub api_endpoint: String,
    pub secret_ref: LocalSecretRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_tls_validations: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FederatedClusterStatus {
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
}

impl FederatedCluster {
    pub fn is_primary(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(PRIMARY_CLUSTER_ANNOTATION))
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// Ready means a `Ready` condition with status `"True"` whose heartbeat
    /// is fresher than `health_timeout`.
    pub fn is_ready(&self, now: DateTime<Utc>, health_timeout: chrono::Duration) -> bool {
        let Some(status) = &self.status else { return false };
        status
            .conditions
            .iter()
            .find(|c| c.type_ == ClusterConditionType::Ready)
            .map(|c| {
                let fresh = c
                    .last_probe_time
                    .map(|t| now.signed_duration_since(t) <= health_timeout)
                    .unwrap_or(false);
                c.status == "True" && fresh
            })
            .unwrap_or(false)
    }
}

// -------- PropagatedVersion --------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObjectVersion {
    pub cluster_name: String,
    /// The target's `metadata.resourceVersion` observed after the last
    /// successful write into that cluster.
    pub version: String,
}

/// Per-federated-object record tying successful propagations to the template
/// and override hashes in force at the time of write.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "core.kubefed.io",
    version = "v1alpha1",
    kind = "PropagatedVersion",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PropagatedVersionSpec {
    #[serde(default)]
    pub template_version: String,
    #[serde(default)]
    pub override_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_versions: Vec<ClusterObjectVersion>,
}

/// Deterministic record name: `<targetKind>-<name>`, lowercased.
pub fn propagated_version_name(target_kind: &str, name: &str) -> String {
    format!("{}-{}", target_kind, name).to_lowercase()
}

// -------- Federated object status (wire shape) --------

#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropagationStatus {
    #[serde(rename = "OK")]
    Ok,
    WaitingForSync,
    WaitingForRemoval,
    Failed,
    TimedOut,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" or "False".
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericClusterStatus {
    pub name: String,
    pub status: PropagationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_status: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericFederatedStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<GenericCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<GenericClusterStatus>,
}
