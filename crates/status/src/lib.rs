//! Per-type status controller.
//!
//! When a descriptor enables status collection, this controller watches the
//! target objects across member clusters and copies each target's `.status`
//! subtree verbatim onto the federated object's `clusters[].remoteStatus`.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use kube::core::DynamicObject;
use kube::Client;
use metrics::counter;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_api::FederatedTypeConfig;
use flotilla_client::ResourceClient;
use flotilla_core::{self as core, ControllerConfig, QualifiedName};
use flotilla_hub::ClusterRegistry;
use flotilla_sync::status::{equal_ignoring_timestamps, parse_status};
use flotilla_worker::{EventFilter, Informer, ReconcileStatus, ReconcileWorker, StoreHandle, WorkerOptions};

struct ClusterWatch {
    store: StoreHandle,
    _stop: watch::Sender<()>,
    _informer: Informer,
}

pub struct StatusController {
    config: ControllerConfig,
    tc: FederatedTypeConfig,
    target_is_namespace: bool,
    fed_client: ResourceClient,
    registry: Arc<ClusterRegistry>,
    watches: RwLock<HashMap<String, ClusterWatch>>,
}

/// Start the remote-status collector for one type descriptor.
pub async fn start_status_controller(
    config: ControllerConfig,
    tc: FederatedTypeConfig,
    host: Client,
    registry: Arc<ClusterRegistry>,
    stop: watch::Receiver<()>,
) -> anyhow::Result<()> {
    let fed_def = &tc.spec.federated_type;
    let fed_client = ResourceClient::new(host, fed_def.api_resource(), fed_def.namespaced());
    let target_is_namespace = tc.spec.target_type.kind == core::NAMESPACE_KIND;

    let ctrl = Arc::new(StatusController {
        config,
        target_is_namespace,
        fed_client,
        registry,
        watches: RwLock::new(HashMap::new()),
        tc,
    });

    let opts = WorkerOptions { recheck_delay: ctrl.config.recheck_delay, ..Default::default() };
    let worker = {
        let ctrl = Arc::clone(&ctrl);
        ReconcileWorker::spawn("status", opts, stop.clone(), move |key| {
            let ctrl = Arc::clone(&ctrl);
            async move { ctrl.reconcile(key).await }
        })
    };

    ctrl.ensure_cluster_watches(&worker).await;
    info!(target_kind = %ctrl.tc.spec.target_type.kind, "status controller started");
    tokio::spawn(maintain(ctrl, worker, stop));
    Ok(())
}

async fn maintain(ctrl: Arc<StatusController>, worker: ReconcileWorker, mut stop: watch::Receiver<()>) {
    let mut epoch = ctrl.registry.subscribe();
    let mut retry = tokio::time::interval(Duration::from_secs(30));
    retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = epoch.changed() => {
                if changed.is_err() {
                    return;
                }
                ctrl.ensure_cluster_watches(&worker).await;
            }
            _ = retry.tick() => {
                ctrl.ensure_cluster_watches(&worker).await;
            }
            _ = stop.changed() => {
                info!(target_kind = %ctrl.tc.spec.target_type.kind, "status controller stopping");
                return;
            }
        }
    }
}

fn fed_key_for_target(
    obj: &DynamicObject,
    target_namespaced: bool,
    target_is_namespace: bool,
) -> Option<QualifiedName> {
    let name = obj.metadata.name.clone()?;
    if target_is_namespace {
        Some(QualifiedName { namespace: Some(name.clone()), name })
    } else if target_namespaced {
        Some(QualifiedName { namespace: obj.metadata.namespace.clone(), name })
    } else {
        Some(QualifiedName { namespace: None, name })
    }
}

impl StatusController {
    fn target_key(&self, fed_key: &QualifiedName) -> QualifiedName {
        if self.tc.spec.target_type.namespaced() {
            fed_key.clone()
        } else {
            QualifiedName::cluster_scoped(&fed_key.name)
        }
    }

    async fn ensure_cluster_watches(&self, worker: &ReconcileWorker) {
        let view = self.registry.view();
        let names = view.names();
        self.watches.write().unwrap().retain(|name, _| names.contains(name));

        let missing: Vec<String> = {
            let watches = self.watches.read().unwrap();
            names.into_iter().filter(|n| !watches.contains_key(n)).collect()
        };
        for name in missing {
            match self.build_watch(&name, worker).await {
                Ok(w) => {
                    self.watches.write().unwrap().insert(name, w);
                }
                Err(err) => {
                    warn!(cluster = %name, error = %err, "status watch connection failed; will retry");
                }
            }
        }
    }

    async fn build_watch(&self, name: &str, worker: &ReconcileWorker) -> anyhow::Result<ClusterWatch> {
        let client = self.registry.member_client(name).await?;
        let target = &self.tc.spec.target_type;
        let (stop_tx, stop_rx) = watch::channel(());
        let target_namespaced = target.namespaced();
        let target_is_namespace = self.target_is_namespace;
        let worker = worker.clone();
        let on_event: Arc<dyn Fn(&DynamicObject) + Send + Sync> = Arc::new(move |obj| {
            if let Some(key) = fed_key_for_target(obj, target_namespaced, target_is_namespace) {
                worker.enqueue(key);
            }
        });
        let informer = Informer::start(
            client,
            target.api_resource(),
            target_namespaced,
            self.config.target_namespace.clone(),
            EventFilter::IncludeStatus,
            on_event,
            stop_rx,
        );
        Ok(ClusterWatch { store: informer.store(), _stop: stop_tx, _informer: informer })
    }

    /// Remote statuses per cluster as currently cached.
    fn collect(&self, tkey: &QualifiedName) -> HashMap<String, Value> {
        let watches = self.watches.read().unwrap();
        watches
            .iter()
            .filter_map(|(name, w)| {
                let obj = w.store.get(tkey)?;
                let status = obj.data.get("status")?.clone();
                Some((name.clone(), status))
            })
            .collect()
    }

    async fn reconcile(&self, key: QualifiedName) -> ReconcileStatus {
        match self.reconcile_inner(&key).await {
            Ok(status) => status,
            Err(err) => {
                warn!(key = %key, error = ?err, "remote status collection failed");
                ReconcileStatus::Error
            }
        }
    }

    async fn reconcile_inner(&self, key: &QualifiedName) -> anyhow::Result<ReconcileStatus> {
        let tkey = self.target_key(key);
        let remote = self.collect(&tkey);

        for attempt in 0..2 {
            let Some(fed) = self.fed_client.get(key).await? else {
                return Ok(ReconcileStatus::AllOk);
            };
            let Some(prev) = parse_status(&fed) else {
                // The sync controller has not reported yet; a later pass will.
                debug!(key = %key, "federated object has no status yet");
                return Ok(ReconcileStatus::NeedsRecheck);
            };

            let mut next = prev.clone();
            for entry in &mut next.clusters {
                entry.remote_status = remote.get(&entry.name).cloned();
            }
            if equal_ignoring_timestamps(&prev, &next) {
                return Ok(ReconcileStatus::AllOk);
            }

            let mut updated = fed;
            if let Some(map) = updated.data.as_object_mut() {
                map.insert("status".to_string(), serde_json::to_value(&next)?);
            }
            match self.fed_client.update_status(&updated).await {
                Ok(_) => {
                    counter!("remote_status_writes_total", 1u64);
                    return Ok(ReconcileStatus::AllOk);
                }
                Err(err) if err.is_conflict() && attempt == 0 => continue,
                Err(err) if err.is_not_found() => return Ok(ReconcileStatus::AllOk),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(ReconcileStatus::NeedsRecheck)
    }
}
