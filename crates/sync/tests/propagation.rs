//! Offline checks of the propagation laws: the pure pipeline from federated
//! spec to per-cluster bodies, hashes, and rolled-up status.

#![forbid(unsafe_code)]

use flotilla_api::PropagationStatus;
use flotilla_core::{content_hash, overrides_hash, template_hash, QualifiedName};
use flotilla_hub::{ClusterInfo, ClusterView};
use flotilla_sync::status::{build_status, equal_ignoring_timestamps, StatusSnapshot};
use flotilla_sync::{overrides, placement};
use kube::core::DynamicObject;
use serde_json::json;

fn view(names: &[(&str, bool)]) -> ClusterView {
    ClusterView::new(names.iter().map(|(name, ready)| ClusterInfo {
        name: name.to_string(),
        labels: Default::default(),
        ready: *ready,
        primary: false,
    }))
}

fn federated_configmap(clusters: &[&str], overrides: serde_json::Value) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "types.kubefed.io/v1beta1",
        "kind": "FederatedConfigMap",
        "metadata": {"name": "site", "namespace": "web", "generation": 1},
        "spec": {
            "template": {"data": {"k": "v"}},
            "placement": {"clusters": clusters.iter().map(|c| json!({"name": c})).collect::<Vec<_>>()},
            "overrides": overrides
        }
    }))
    .unwrap()
}

#[test]
fn create_scenario_builds_identical_bodies_without_overrides() {
    let fed = federated_configmap(&["c1", "c2"], json!([]));
    let resolved = placement::resolve(&fed, &view(&[("c1", true), ("c2", true)]));
    assert_eq!(resolved.selected.len(), 2);

    let template = flotilla_core::template_of(&fed).unwrap();
    let parsed = overrides::parse(&fed).unwrap();
    for cluster in &resolved.selected {
        let mut body = template.clone();
        if let Some(items) = parsed.get(cluster) {
            overrides::apply(&mut body, items).unwrap();
        }
        assert_eq!(body, json!({"data": {"k": "v"}}));
    }
}

#[test]
fn override_scenario_changes_only_the_overridden_cluster() {
    let fed = federated_configmap(
        &["c1", "c2"],
        json!([{"clusterName": "c2", "clusterOverrides": [{"path": "/data/k", "value": "v2"}]}]),
    );
    let template = flotilla_core::template_of(&fed).unwrap();
    let parsed = overrides::parse(&fed).unwrap();

    let mut c1_body = template.clone();
    if let Some(items) = parsed.get("c1") {
        overrides::apply(&mut c1_body, items).unwrap();
    }
    assert_eq!(c1_body, json!({"data": {"k": "v"}}));

    let mut c2_body = template.clone();
    overrides::apply(&mut c2_body, &parsed["c2"]).unwrap();
    assert_eq!(c2_body, json!({"data": {"k": "v2"}}));

    // The override hash moves while the template hash stays put.
    let plain = federated_configmap(&["c1", "c2"], json!([]));
    assert_eq!(template_hash(&plain).unwrap(), template_hash(&fed).unwrap());
    assert_ne!(overrides_hash(&plain), overrides_hash(&fed));
}

#[test]
fn hashes_are_stable_across_equivalent_objects() {
    let a = federated_configmap(&["c1"], json!([]));
    let b = federated_configmap(&["c1", "c2"], json!([]));
    // Placement is not part of the template hash.
    assert_eq!(template_hash(&a).unwrap(), template_hash(&b).unwrap());
    assert_eq!(template_hash(&a).unwrap(), content_hash(&json!({"data": {"k": "v"}})));
}

#[test]
fn cluster_loss_scenario_reports_waiting_for_sync() {
    let fed = federated_configmap(&["c1", "c2"], json!([]));
    let resolved = placement::resolve(&fed, &view(&[("c1", true), ("c2", false)]));
    assert_eq!(resolved.selected.iter().map(String::as_str).collect::<Vec<_>>(), ["c1"]);
    assert_eq!(resolved.unready.iter().map(String::as_str).collect::<Vec<_>>(), ["c2"]);

    let snap = StatusSnapshot {
        key: QualifiedName::new(Some("web"), "site"),
        generation: 1,
        outcomes: vec![
            ("c1".to_string(), PropagationStatus::Ok),
            ("c2".to_string(), PropagationStatus::WaitingForSync),
        ],
    };
    let status = build_status(None, &snap, chrono::Utc::now());
    assert_eq!(status.conditions[0].status, "False");
    let c2 = status.clusters.iter().find(|c| c.name == "c2").unwrap();
    assert_eq!(c2.status, PropagationStatus::WaitingForSync);

    // Recovery converges to a True condition and an Ok entry.
    let recovered = StatusSnapshot {
        outcomes: vec![
            ("c1".to_string(), PropagationStatus::Ok),
            ("c2".to_string(), PropagationStatus::Ok),
        ],
        ..snap
    };
    let status = build_status(Some(&status), &recovered, chrono::Utc::now());
    assert_eq!(status.conditions[0].status, "True");
}

#[test]
fn placement_shrink_scenario_drops_the_cluster_entry_once_removed() {
    let key = QualifiedName::new(Some("web"), "site");
    let waiting = build_status(
        None,
        &StatusSnapshot {
            key: key.clone(),
            generation: 2,
            outcomes: vec![
                ("c1".to_string(), PropagationStatus::Ok),
                ("c2".to_string(), PropagationStatus::WaitingForRemoval),
            ],
        },
        chrono::Utc::now(),
    );
    assert_eq!(waiting.conditions[0].status, "False");
    assert!(waiting.clusters.iter().any(|c| c.name == "c2"));

    let done = build_status(
        Some(&waiting),
        &StatusSnapshot {
            key,
            generation: 2,
            outcomes: vec![("c1".to_string(), PropagationStatus::Ok)],
        },
        chrono::Utc::now(),
    );
    assert_eq!(done.conditions[0].status, "True");
    assert!(!done.clusters.iter().any(|c| c.name == "c2"));
    assert!(!equal_ignoring_timestamps(&waiting, &done));
}
