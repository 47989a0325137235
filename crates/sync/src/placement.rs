//! Placement resolution: which clusters should host a federated object.

use std::collections::{BTreeMap, BTreeSet};

use kube::core::DynamicObject;
use serde::Deserialize;
use tracing::warn;

use flotilla_core::placement_of;
use flotilla_hub::ClusterView;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementResult {
    /// Clusters to propagate into this pass: named by placement, known to the
    /// registry, and currently ready.
    pub selected: BTreeSet<String>,
    /// Clusters named by placement and known, but not ready. They keep their
    /// targets and report `WaitingForSync`.
    pub unready: BTreeSet<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Placement {
    #[serde(default)]
    clusters: Option<Vec<ClusterRef>>,
    #[serde(default)]
    cluster_selector: Option<ClusterSelector>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClusterRef {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterSelector {
    #[serde(default)]
    match_labels: BTreeMap<String, String>,
    #[serde(default)]
    match_expressions: Vec<SelectorExpr>,
}

#[derive(Debug, Clone, Deserialize)]
struct SelectorExpr {
    key: String,
    operator: SelectorOp,
    #[serde(default)]
    values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum SelectorOp {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

fn expr_matches(labels: &BTreeMap<String, String>, expr: &SelectorExpr) -> bool {
    let value = labels.get(&expr.key);
    match expr.operator {
        SelectorOp::In => value.map(|v| expr.values.iter().any(|e| e == v)).unwrap_or(false),
        SelectorOp::NotIn => value.map(|v| !expr.values.iter().any(|e| e == v)).unwrap_or(true),
        SelectorOp::Exists => value.is_some(),
        SelectorOp::DoesNotExist => value.is_none(),
    }
}

fn selector_matches(labels: &BTreeMap<String, String>, sel: &ClusterSelector) -> bool {
    sel.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v))
        && sel.match_expressions.iter().all(|e| expr_matches(labels, e))
}

/// Resolve the clusters named by a federated object's placement against the
/// current registry view. Unknown cluster names are silently dropped; an
/// explicit `clusters` list wins over a selector; no placement stanza selects
/// nothing.
pub fn resolve(obj: &DynamicObject, view: &ClusterView) -> PlacementResult {
    let Some(raw) = placement_of(obj) else { return PlacementResult::default() };
    let placement: Placement = match serde_json::from_value(raw.clone()) {
        Ok(p) => p,
        Err(err) => {
            warn!(error = %err, "malformed placement stanza; selecting no clusters");
            return PlacementResult::default();
        }
    };

    let named: BTreeSet<String> = match (&placement.clusters, &placement.cluster_selector) {
        (Some(refs), _) => refs
            .iter()
            .filter(|r| view.get(&r.name).is_some())
            .map(|r| r.name.clone())
            .collect(),
        (None, Some(sel)) => view
            .iter()
            .filter(|c| selector_matches(&c.labels, sel))
            .map(|c| c.name.clone())
            .collect(),
        (None, None) => BTreeSet::new(),
    };

    let mut out = PlacementResult::default();
    for name in named {
        if view.is_ready(&name) {
            out.selected.insert(name);
        } else {
            out.unready.insert(name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_hub::ClusterInfo;
    use serde_json::json;

    fn view(clusters: &[(&str, bool, &[(&str, &str)])]) -> ClusterView {
        ClusterView::new(clusters.iter().map(|(name, ready, labels)| ClusterInfo {
            name: name.to_string(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ready: *ready,
            primary: false,
        }))
    }

    fn fed(placement: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "metadata": {"name": "f", "namespace": "ns"},
            "spec": {"placement": placement}
        }))
        .unwrap()
    }

    fn names(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    #[test]
    fn explicit_list_drops_unknown_names() {
        let v = view(&[("c1", true, &[]), ("c2", true, &[])]);
        let r = resolve(&fed(json!({"clusters": [{"name": "c1"}, {"name": "ghost"}]})), &v);
        assert_eq!(names(&r.selected), ["c1"]);
        assert!(r.unready.is_empty());
    }

    #[test]
    fn unready_clusters_are_split_out() {
        let v = view(&[("c1", true, &[]), ("c2", false, &[])]);
        let r = resolve(&fed(json!({"clusters": [{"name": "c1"}, {"name": "c2"}]})), &v);
        assert_eq!(names(&r.selected), ["c1"]);
        assert_eq!(names(&r.unready), ["c2"]);
    }

    #[test]
    fn selector_match_labels() {
        let v = view(&[
            ("edge1", true, &[("tier", "edge")]),
            ("edge2", true, &[("tier", "edge")]),
            ("core1", true, &[("tier", "core")]),
        ]);
        let r = resolve(&fed(json!({"clusterSelector": {"matchLabels": {"tier": "edge"}}})), &v);
        assert_eq!(names(&r.selected), ["edge1", "edge2"]);
    }

    #[test]
    fn selector_match_expressions() {
        let v = view(&[
            ("a", true, &[("zone", "us-1")]),
            ("b", true, &[("zone", "eu-1")]),
            ("c", true, &[]),
        ]);
        let in_expr = json!({"clusterSelector": {"matchExpressions": [
            {"key": "zone", "operator": "In", "values": ["us-1", "us-2"]}
        ]}});
        assert_eq!(names(&resolve(&fed(in_expr), &v).selected), ["a"]);

        let not_in = json!({"clusterSelector": {"matchExpressions": [
            {"key": "zone", "operator": "NotIn", "values": ["us-1"]}
        ]}});
        assert_eq!(names(&resolve(&fed(not_in), &v).selected), ["b", "c"]);

        let exists = json!({"clusterSelector": {"matchExpressions": [
            {"key": "zone", "operator": "Exists"}
        ]}});
        assert_eq!(names(&resolve(&fed(exists), &v).selected), ["a", "b"]);

        let not_exists = json!({"clusterSelector": {"matchExpressions": [
            {"key": "zone", "operator": "DoesNotExist"}
        ]}});
        assert_eq!(names(&resolve(&fed(not_exists), &v).selected), ["c"]);
    }

    #[test]
    fn empty_selector_matches_every_cluster() {
        let v = view(&[("c1", true, &[]), ("c2", true, &[("x", "y")])]);
        let r = resolve(&fed(json!({"clusterSelector": {}})), &v);
        assert_eq!(names(&r.selected), ["c1", "c2"]);
    }

    #[test]
    fn explicit_list_wins_over_selector() {
        let v = view(&[("c1", true, &[("tier", "edge")]), ("c2", true, &[("tier", "edge")])]);
        let r = resolve(
            &fed(json!({
                "clusters": [{"name": "c1"}],
                "clusterSelector": {"matchLabels": {"tier": "edge"}}
            })),
            &v,
        );
        assert_eq!(names(&r.selected), ["c1"]);
    }

    #[test]
    fn missing_placement_selects_nothing() {
        let v = view(&[("c1", true, &[])]);
        let obj: DynamicObject = serde_json::from_value(json!({
            "metadata": {"name": "f"},
            "spec": {"template": {}}
        }))
        .unwrap();
        assert_eq!(resolve(&obj, &v), PlacementResult::default());
    }
}
