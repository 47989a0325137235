//! Per-cluster override engine: ordered path-based patches on the template.
//!
//! Failures here are structural: they fail the whole propagation for that
//! cluster and are not retried until the federated object changes.

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use serde_json::Value;

use flotilla_core::overrides_of;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum OverrideError {
    #[error("spec.overrides must be a list of {{clusterName, clusterOverrides}} entries")]
    MalformedList,
    #[error("override {index} for cluster {cluster:?} is malformed: {detail}")]
    MalformedEntry { cluster: String, index: usize, detail: String },
    #[error("unknown override op {0:?}")]
    UnknownOp(String),
    #[error("override path {0:?} must start with '/'")]
    PathSyntax(String),
    #[error("override path {0:?} does not resolve")]
    PathMissing(String),
    #[error("override path {0:?} indexes into a non-container value")]
    NotAContainer(String),
    #[error("override op {op:?} at {path:?} requires a value")]
    MissingValue { op: &'static str, path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrideOp {
    Add,
    #[default]
    Replace,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverrideItem {
    pub op: OverrideOp,
    pub path: String,
    pub value: Option<Value>,
}

pub type ClusterOverrides = BTreeMap<String, Vec<OverrideItem>>;

/// Parse `spec.overrides` into per-cluster ordered patch lists.
pub fn parse(obj: &DynamicObject) -> Result<ClusterOverrides, OverrideError> {
    let Some(raw) = overrides_of(obj) else { return Ok(BTreeMap::new()) };
    let Some(entries) = raw.as_array() else { return Err(OverrideError::MalformedList) };

    let mut out = BTreeMap::new();
    for entry in entries {
        let cluster = entry
            .get("clusterName")
            .and_then(Value::as_str)
            .ok_or(OverrideError::MalformedList)?
            .to_string();
        let items = entry.get("clusterOverrides").and_then(Value::as_array);
        let mut parsed = Vec::new();
        for (index, item) in items.into_iter().flatten().enumerate() {
            let path = item
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| OverrideError::MalformedEntry {
                    cluster: cluster.clone(),
                    index,
                    detail: "missing path".to_string(),
                })?
                .to_string();
            let op = match item.get("op").and_then(Value::as_str) {
                None => OverrideOp::Replace,
                Some("add") => OverrideOp::Add,
                Some("replace") => OverrideOp::Replace,
                Some("remove") => OverrideOp::Remove,
                Some(other) => return Err(OverrideError::UnknownOp(other.to_string())),
            };
            let value = item.get("value").cloned();
            parsed.push(OverrideItem { op, path, value });
        }
        out.insert(cluster, parsed);
    }
    Ok(out)
}

/// Split a JSON-Pointer path into unescaped segments.
fn tokenize(path: &str) -> Result<Vec<String>, OverrideError> {
    if !path.starts_with('/') {
        return Err(OverrideError::PathSyntax(path.to_string()));
    }
    Ok(path[1..]
        .split('/')
        .map(|seg| seg.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn navigate<'a>(root: &'a mut Value, segs: &[String], path: &str) -> Result<&'a mut Value, OverrideError> {
    let mut cur = root;
    for seg in segs {
        cur = match cur {
            Value::Object(map) => map
                .get_mut(seg.as_str())
                .ok_or_else(|| OverrideError::PathMissing(path.to_string()))?,
            Value::Array(arr) => {
                let idx: usize = seg
                    .parse()
                    .map_err(|_| OverrideError::PathMissing(path.to_string()))?;
                arr.get_mut(idx).ok_or_else(|| OverrideError::PathMissing(path.to_string()))?
            }
            _ => return Err(OverrideError::NotAContainer(path.to_string())),
        };
    }
    Ok(cur)
}

fn apply_one(body: &mut Value, item: &OverrideItem) -> Result<(), OverrideError> {
    let segs = tokenize(&item.path)?;
    let Some((last, parents)) = segs.split_last() else {
        return Err(OverrideError::PathSyntax(item.path.clone()));
    };
    let parent = navigate(body, parents, &item.path)?;

    match item.op {
        OverrideOp::Remove => match parent {
            Value::Object(map) => {
                map.remove(last.as_str())
                    .ok_or_else(|| OverrideError::PathMissing(item.path.clone()))?;
                Ok(())
            }
            Value::Array(arr) => {
                let idx: usize = last
                    .parse()
                    .map_err(|_| OverrideError::PathMissing(item.path.clone()))?;
                if idx < arr.len() {
                    arr.remove(idx);
                    Ok(())
                } else {
                    Err(OverrideError::PathMissing(item.path.clone()))
                }
            }
            _ => Err(OverrideError::NotAContainer(item.path.clone())),
        },
        OverrideOp::Add | OverrideOp::Replace => {
            let value = item.value.clone().ok_or(OverrideError::MissingValue {
                op: if item.op == OverrideOp::Add { "add" } else { "replace" },
                path: item.path.clone(),
            })?;
            match parent {
                Value::Object(map) => {
                    // add at an existing path behaves as replace, and a
                    // replace of a missing key creates it.
                    map.insert(last.clone(), value);
                    Ok(())
                }
                Value::Array(arr) => {
                    if item.op == OverrideOp::Add && last.as_str() == "-" {
                        arr.push(value);
                        return Ok(());
                    }
                    let idx: usize = last
                        .parse()
                        .map_err(|_| OverrideError::PathMissing(item.path.clone()))?;
                    match item.op {
                        OverrideOp::Add if idx <= arr.len() => {
                            arr.insert(idx, value);
                            Ok(())
                        }
                        OverrideOp::Replace if idx < arr.len() => {
                            arr[idx] = value;
                            Ok(())
                        }
                        _ => Err(OverrideError::PathMissing(item.path.clone())),
                    }
                }
                _ => Err(OverrideError::NotAContainer(item.path.clone())),
            }
        }
    }
}

/// Apply an ordered patch list to a target body, left to right. Later writes
/// to the same path win. Any failure aborts the whole list.
pub fn apply(body: &mut Value, items: &[OverrideItem]) -> Result<(), OverrideError> {
    for item in items {
        apply_one(body, item)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(op: OverrideOp, path: &str, value: Option<Value>) -> OverrideItem {
        OverrideItem { op, path: path.to_string(), value }
    }

    #[test]
    fn replace_and_add_on_objects() {
        let mut body = json!({"data": {"k": "v"}});
        apply(
            &mut body,
            &[
                item(OverrideOp::Replace, "/data/k", Some(json!("v2"))),
                item(OverrideOp::Add, "/data/extra", Some(json!("e"))),
            ],
        )
        .unwrap();
        assert_eq!(body, json!({"data": {"k": "v2", "extra": "e"}}));
    }

    #[test]
    fn later_writes_to_the_same_path_win() {
        let mut body = json!({"data": {"k": "v"}});
        apply(
            &mut body,
            &[
                item(OverrideOp::Replace, "/data/k", Some(json!("first"))),
                item(OverrideOp::Replace, "/data/k", Some(json!("second"))),
            ],
        )
        .unwrap();
        assert_eq!(body, json!({"data": {"k": "second"}}));
    }

    #[test]
    fn array_index_and_append() {
        let mut body = json!({"spec": {"args": ["a", "b"]}});
        apply(
            &mut body,
            &[
                item(OverrideOp::Replace, "/spec/args/1", Some(json!("B"))),
                item(OverrideOp::Add, "/spec/args/-", Some(json!("c"))),
                item(OverrideOp::Add, "/spec/args/0", Some(json!("z"))),
            ],
        )
        .unwrap();
        assert_eq!(body, json!({"spec": {"args": ["z", "a", "B", "c"]}}));
    }

    #[test]
    fn remove_requires_the_path_to_exist() {
        let mut body = json!({"data": {"k": "v"}});
        apply(&mut body, &[item(OverrideOp::Remove, "/data/k", None)]).unwrap();
        assert_eq!(body, json!({"data": {}}));

        let err = apply(&mut body, &[item(OverrideOp::Remove, "/data/k", None)]).unwrap_err();
        assert!(matches!(err, OverrideError::PathMissing(_)));
    }

    #[test]
    fn missing_parents_are_structural_errors() {
        let mut body = json!({"data": {}});
        let err =
            apply(&mut body, &[item(OverrideOp::Replace, "/nope/k", Some(json!(1)))]).unwrap_err();
        assert!(matches!(err, OverrideError::PathMissing(_)));

        let err =
            apply(&mut body, &[item(OverrideOp::Replace, "bad-path", Some(json!(1)))]).unwrap_err();
        assert!(matches!(err, OverrideError::PathSyntax(_)));
    }

    #[test]
    fn scalar_parents_are_not_containers() {
        let mut body = json!({"data": {"k": "v"}});
        let err =
            apply(&mut body, &[item(OverrideOp::Replace, "/data/k/deep", Some(json!(1)))]).unwrap_err();
        assert!(matches!(err, OverrideError::NotAContainer(_)));
    }

    #[test]
    fn pointer_escapes() {
        let mut body = json!({"metadata": {"labels": {"kubefed.io/managed": "true", "a~b": "x"}}});
        apply(
            &mut body,
            &[
                item(OverrideOp::Replace, "/metadata/labels/kubefed.io~1managed", Some(json!("false"))),
                item(OverrideOp::Remove, "/metadata/labels/a~0b", None),
            ],
        )
        .unwrap();
        assert_eq!(body, json!({"metadata": {"labels": {"kubefed.io/managed": "false"}}}));
    }

    #[test]
    fn failure_leaves_error_not_partial_success() {
        let mut body = json!({"data": {"a": "1"}});
        let items = [
            item(OverrideOp::Replace, "/data/a", Some(json!("2"))),
            item(OverrideOp::Remove, "/data/missing", None),
        ];
        assert!(apply(&mut body, &items).is_err());
    }

    #[test]
    fn unrelated_fields_are_untouched() {
        let template = json!({
            "metadata": {"labels": {"app": "web"}},
            "spec": {"replicas": 2, "selector": {"app": "web"}},
            "data": {"k": "v"}
        });
        let mut patched = template.clone();
        apply(&mut patched, &[item(OverrideOp::Replace, "/spec/replicas", Some(json!(5)))]).unwrap();

        assert_eq!(patched["metadata"], template["metadata"]);
        assert_eq!(patched["data"], template["data"]);
        assert_eq!(patched["spec"]["selector"], template["spec"]["selector"]);
        assert_eq!(patched["spec"]["replicas"], json!(5));
    }

    #[test]
    fn parse_reads_per_cluster_lists() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "metadata": {"name": "f", "namespace": "ns"},
            "spec": {"overrides": [
                {"clusterName": "c2", "clusterOverrides": [
                    {"path": "/data/k", "value": "v2"},
                    {"op": "remove", "path": "/data/old"}
                ]},
                {"clusterName": "c3", "clusterOverrides": []}
            ]}
        }))
        .unwrap();
        let parsed = parse(&obj).unwrap();
        assert_eq!(parsed.len(), 2);
        let c2 = &parsed["c2"];
        assert_eq!(c2[0].op, OverrideOp::Replace);
        assert_eq!(c2[0].path, "/data/k");
        assert_eq!(c2[1].op, OverrideOp::Remove);
        assert!(parsed["c3"].is_empty());
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "metadata": {"name": "f"},
            "spec": {"overrides": {"not": "a list"}}
        }))
        .unwrap();
        assert_eq!(parse(&obj).unwrap_err(), OverrideError::MalformedList);

        let obj: DynamicObject = serde_json::from_value(json!({
            "metadata": {"name": "f"},
            "spec": {"overrides": [{"clusterName": "c1", "clusterOverrides": [{"op": "exchange", "path": "/x"}]}]}
        }))
        .unwrap();
        assert!(matches!(parse(&obj).unwrap_err(), OverrideError::UnknownOp(_)));
    }
}
