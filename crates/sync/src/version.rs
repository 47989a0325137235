//! Propagated-version manager.
//!
//! One `PropagatedVersion` record per federated object ties each successful
//! propagation to the target's resourceVersion and the template/override
//! hashes in force at the time of write.

use std::collections::BTreeMap;

use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

use flotilla_api::{propagated_version_name, ClusterObjectVersion, PropagatedVersion, PropagatedVersionSpec};
use flotilla_client::ClientError;
use flotilla_core::QualifiedName;

/// Record key for a federated object: deterministic name, stored in the
/// federated object's namespace (or, for namespace targets, in the namespace
/// itself).
pub fn record_key(target_kind: &str, target_is_namespace: bool, fed: &QualifiedName) -> QualifiedName {
    let namespace =
        if target_is_namespace { Some(fed.name.clone()) } else { fed.namespace.clone() };
    QualifiedName { namespace, name: propagated_version_name(target_kind, &fed.name) }
}

pub struct VersionManager {
    host: Client,
    target_kind: String,
    target_is_namespace: bool,
}

impl VersionManager {
    pub fn new(host: Client, target_kind: &str, target_is_namespace: bool) -> Self {
        Self { host, target_kind: target_kind.to_string(), target_is_namespace }
    }

    pub fn record_key(&self, fed: &QualifiedName) -> QualifiedName {
        record_key(&self.target_kind, self.target_is_namespace, fed)
    }

    fn api(&self, key: &QualifiedName) -> Api<PropagatedVersion> {
        match &key.namespace {
            Some(ns) => Api::namespaced(self.host.clone(), ns),
            None => Api::default_namespaced(self.host.clone()),
        }
    }

    pub async fn get(&self, fed: &QualifiedName) -> Result<Option<PropagatedVersion>, ClientError> {
        let key = self.record_key(fed);
        self.api(&key).get_opt(&key.name).await.map_err(ClientError::from_kube)
    }

    /// Write the record for this pass, merging over optimistic concurrency:
    /// on conflict the record is refetched and the write retried once. An
    /// empty cluster map deletes the record so it exists iff at least one
    /// propagation succeeded.
    pub async fn update(
        &self,
        fed: &QualifiedName,
        template_version: &str,
        override_version: &str,
        cluster_versions: &BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        if cluster_versions.is_empty() {
            return self.delete(fed).await;
        }

        let key = self.record_key(fed);
        let api = self.api(&key);
        let desired = PropagatedVersionSpec {
            template_version: template_version.to_string(),
            override_version: override_version.to_string(),
            cluster_versions: cluster_versions
                .iter()
                .map(|(cluster_name, version)| ClusterObjectVersion {
                    cluster_name: cluster_name.clone(),
                    version: version.clone(),
                })
                .collect(),
        };

        let existing = api.get_opt(&key.name).await.map_err(ClientError::from_kube)?;
        match existing {
            None => {
                let mut record = PropagatedVersion::new(&key.name, desired);
                record.metadata.namespace = key.namespace.clone();
                match api.create(&PostParams::default(), &record).await {
                    Ok(_) => Ok(()),
                    // Lost a create race; the next pass reconverges.
                    Err(err) => match ClientError::from_kube(err) {
                        ClientError::Conflict(_) => Ok(()),
                        other => Err(other),
                    },
                }
            }
            Some(mut record) => {
                if record.spec == desired {
                    debug!(record = %key, "propagated versions unchanged; skipping write");
                    return Ok(());
                }
                record.spec = desired.clone();
                match api.replace(&key.name, &PostParams::default(), &record).await {
                    Ok(_) => Ok(()),
                    Err(err) => match ClientError::from_kube(err) {
                        ClientError::Conflict(_) => {
                            let Some(mut fresh) =
                                api.get_opt(&key.name).await.map_err(ClientError::from_kube)?
                            else {
                                return Err(ClientError::NotFound);
                            };
                            fresh.spec = desired;
                            api.replace(&key.name, &PostParams::default(), &fresh)
                                .await
                                .map(|_| ())
                                .map_err(ClientError::from_kube)
                        }
                        other => Err(other),
                    },
                }
            }
        }
    }

    pub async fn delete(&self, fed: &QualifiedName) -> Result<(), ClientError> {
        let key = self.record_key(fed);
        match self.api(&key).delete(&key.name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(err) => match ClientError::from_kube(err) {
                ClientError::NotFound => Ok(()),
                other => Err(other),
            },
        }
    }
}

/// The recorded per-cluster versions as a map.
pub fn cluster_version_map(record: &PropagatedVersion) -> BTreeMap<String, String> {
    record
        .spec
        .cluster_versions
        .iter()
        .map(|cv| (cv.cluster_name.clone(), cv.version.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keys_are_deterministic() {
        let key = record_key("ConfigMap", false, &QualifiedName::new(Some("web"), "site"));
        assert_eq!(key.name, "configmap-site");
        assert_eq!(key.namespace.as_deref(), Some("web"));
    }

    #[test]
    fn namespace_targets_store_records_in_the_namespace() {
        let key = record_key("Namespace", true, &QualifiedName::new(Some("ns1"), "ns1"));
        assert_eq!(key.name, "namespace-ns1");
        assert_eq!(key.namespace.as_deref(), Some("ns1"));
    }

    #[test]
    fn cluster_version_map_round_trip() {
        let record = PropagatedVersion::new(
            "configmap-site",
            PropagatedVersionSpec {
                template_version: "t1".into(),
                override_version: "o1".into(),
                cluster_versions: vec![
                    ClusterObjectVersion { cluster_name: "c2".into(), version: "8".into() },
                    ClusterObjectVersion { cluster_name: "c1".into(), version: "5".into() },
                ],
            },
        );
        let map = cluster_version_map(&record);
        assert_eq!(map.get("c1").map(String::as_str), Some("5"));
        assert_eq!(map.get("c2").map(String::as_str), Some("8"));
    }
}
