//! Flotilla core types – shared vocabulary for the federation controllers.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use kube::core::DynamicObject;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub mod tree;

/// Label stamped on every target object under management.
pub const MANAGED_LABEL_KEY: &str = "kubefed.io/managed";
pub const MANAGED_LABEL_VALUE: &str = "true";

/// Annotation that switches deletion of a federated object to orphaning:
/// targets are unlabeled instead of deleted.
pub const ORPHAN_ANNOTATION: &str = "kubefed.io/orphan";

/// Annotation holding a JSON document with delete options for targets.
pub const DELETE_OPTIONS_ANNOTATION: &str = "kubefed.io/delete-options";

/// Name of the type descriptor for namespaces. Its presence gates the sync
/// controllers of all namespaced types.
pub const NAMESPACES_DESCRIPTOR: &str = "namespaces";

pub const NAMESPACE_KIND: &str = "Namespace";

#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("spec.{0} is missing")]
    MissingField(&'static str),
    #[error("spec.{0} is malformed: expected {1}")]
    Malformed(&'static str, &'static str),
}

/// `(namespace, name)` key addressing one object. Namespace is `None` for
/// cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    pub namespace: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn cluster_scoped(name: &str) -> Self {
        Self { namespace: None, name: name.to_string() }
    }

    pub fn from_obj(obj: &DynamicObject) -> Result<Self, FieldError> {
        let name = obj.metadata.name.clone().ok_or(FieldError::MissingName)?;
        Ok(Self { namespace: obj.metadata.namespace.clone(), name })
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// -------- Managed label --------

pub fn has_managed_label(obj: &DynamicObject) -> bool {
    obj.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(MANAGED_LABEL_KEY))
        .map(|v| v == MANAGED_LABEL_VALUE)
        .unwrap_or(false)
}

/// Stamp the managed label on a raw object body.
pub fn set_managed_label(body: &mut Value) {
    let labels = body
        .as_object_mut()
        .map(|o| o.entry("metadata").or_insert_with(|| Value::Object(Default::default())))
        .and_then(|m| m.as_object_mut())
        .map(|m| m.entry("labels").or_insert_with(|| Value::Object(Default::default())));
    if let Some(Value::Object(labels)) = labels {
        labels.insert(MANAGED_LABEL_KEY.into(), Value::String(MANAGED_LABEL_VALUE.into()));
    }
}

// -------- Annotations --------

fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(|s| s.as_str())
}

pub fn is_orphaning_enabled(obj: &DynamicObject) -> bool {
    annotation(obj, ORPHAN_ANNOTATION).map(|v| v == "true").unwrap_or(false)
}

/// Raw delete-options JSON from the federated object, if present and parseable.
pub fn delete_options(obj: &DynamicObject) -> Option<Value> {
    let raw = annotation(obj, DELETE_OPTIONS_ANNOTATION)?;
    match serde_json::from_str(raw) {
        Ok(v) => Some(v),
        Err(err) => {
            tracing::warn!(error = %err, "ignoring malformed delete-options annotation");
            None
        }
    }
}

// -------- Federated object accessors --------

/// The template body to reproduce in each selected cluster.
pub fn template_of(obj: &DynamicObject) -> Result<Value, FieldError> {
    match tree::get(&obj.data, &["spec", "template"]) {
        Some(v) if v.is_object() => Ok(v.clone()),
        Some(_) => Err(FieldError::Malformed("template", "object")),
        None => Err(FieldError::MissingField("template")),
    }
}

pub fn placement_of(obj: &DynamicObject) -> Option<&Value> {
    tree::get(&obj.data, &["spec", "placement"])
}

pub fn overrides_of(obj: &DynamicObject) -> Option<&Value> {
    tree::get(&obj.data, &["spec", "overrides"])
}

pub fn generation_of(obj: &DynamicObject) -> i64 {
    obj.metadata.generation.unwrap_or(0)
}

// -------- Content hashing --------

/// Hash of the canonical JSON serialization of a value. `serde_json` maps are
/// key-sorted, so equal content yields equal bytes regardless of input order.
pub fn content_hash(v: &Value) -> String {
    let bytes = serde_json::to_vec(v).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn template_hash(obj: &DynamicObject) -> Result<String, FieldError> {
    Ok(content_hash(&template_of(obj)?))
}

/// Hash of the overrides list; a federated object without overrides hashes the
/// JSON null so the value is still fixed-width.
pub fn overrides_hash(obj: &DynamicObject) -> String {
    content_hash(overrides_of(obj).unwrap_or(&Value::Null))
}

// -------- Feature gates --------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeatureGate {
    /// Keep managed resources in member clusters synced with the federated spec.
    PushReconciler,
    /// Collect the raw `.status` of target resources into federated status.
    RawResourceStatusCollection,
}

impl FeatureGate {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "PushReconciler" => Some(Self::PushReconciler),
            "RawResourceStatusCollection" => Some(Self::RawResourceStatusCollection),
            _ => None,
        }
    }
}

/// Known feature gates with their effective values. Configured once at
/// startup and read-only thereafter; passed explicitly into each controller.
#[derive(Debug, Clone)]
pub struct FeatureGates {
    gates: BTreeMap<FeatureGate, bool>,
}

impl Default for FeatureGates {
    fn default() -> Self {
        let mut gates = BTreeMap::new();
        gates.insert(FeatureGate::PushReconciler, true);
        gates.insert(FeatureGate::RawResourceStatusCollection, false);
        Self { gates }
    }
}

impl FeatureGates {
    /// Parse a `Gate=bool,Gate=bool` list on top of the defaults. Unknown
    /// gates and unparseable values are logged and skipped.
    pub fn parse(spec: &str) -> Self {
        let mut out = Self::default();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((name, value)) = part.split_once('=') else {
                tracing::warn!(gate = %part, "feature gate entry missing '='; skipping");
                continue;
            };
            let Some(gate) = FeatureGate::from_name(name.trim()) else {
                tracing::warn!(gate = %name, "unknown feature gate; skipping");
                continue;
            };
            match value.trim().parse::<bool>() {
                Ok(b) => {
                    out.gates.insert(gate, b);
                }
                Err(_) => {
                    tracing::warn!(gate = %name, value = %value, "feature gate value is not a bool; skipping")
                }
            }
        }
        out
    }

    pub fn enabled(&self, gate: FeatureGate) -> bool {
        self.gates.get(&gate).copied().unwrap_or(false)
    }
}

// -------- Controller configuration --------

/// Arguments shared by every controller, collected once at startup.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace holding the control-plane resources (type descriptors,
    /// cluster records).
    pub fed_namespace: String,
    /// When set, federated resources are only watched in this namespace and
    /// the control plane is considered namespace-scoped.
    pub target_namespace: Option<String>,
    /// A cluster whose readiness heartbeat is older than this is not ready.
    pub cluster_health_timeout: Duration,
    /// Timeout for waits that involve member clusters (deletion confirmation).
    pub cluster_wait_timeout: Duration,
    /// Delay before re-running a reconcile that returned `NeedsRecheck`.
    pub recheck_delay: Duration,
    pub gates: FeatureGates,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            fed_namespace: "kube-federation-system".to_string(),
            target_namespace: None,
            cluster_health_timeout: Duration::from_secs(60),
            cluster_wait_timeout: Duration::from_secs(120),
            recheck_delay: Duration::from_secs(10),
            gates: FeatureGates::default(),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs)
}

impl ControllerConfig {
    /// Control-plane scope: a namespaced control plane must not run sync
    /// controllers for cluster-scoped types.
    pub fn limited_scope(&self) -> bool {
        self.target_namespace.is_some()
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(ns) = std::env::var("FLOTILLA_NAMESPACE") {
            cfg.fed_namespace = ns;
        }
        if let Ok(ns) = std::env::var("FLOTILLA_TARGET_NAMESPACE") {
            if !ns.is_empty() {
                cfg.target_namespace = Some(ns);
            }
        }
        if let Some(d) = env_secs("FLOTILLA_CLUSTER_HEALTH_TIMEOUT_SECS") {
            cfg.cluster_health_timeout = d;
        }
        if let Some(d) = env_secs("FLOTILLA_CLUSTER_WAIT_TIMEOUT_SECS") {
            cfg.cluster_wait_timeout = d;
        }
        if let Some(d) = env_secs("FLOTILLA_RECHECK_DELAY_SECS") {
            cfg.recheck_delay = d;
        }
        if let Ok(gates) = std::env::var("FLOTILLA_FEATURE_GATES") {
            cfg.gates = FeatureGates::parse(&gates);
        }
        cfg
    }
}
