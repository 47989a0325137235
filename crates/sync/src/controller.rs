//! The per-type sync controller.
//!
//! Watches federated objects of one configured kind in the host cluster and
//! the corresponding target kind in every member cluster, and drives targets
//! to match template ⊕ overrides for each selected cluster. Per-object
//! reconciles are serial; per-cluster writes within a pass run concurrently
//! and reduce into one propagated-version record update.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use kube::core::DynamicObject;
use kube::Client;
use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use flotilla_api::{FederatedTypeConfig, PropagationStatus};
use flotilla_client::{ClientError, DeletePolicy, ResourceClient};
use flotilla_core::{self as core, ControllerConfig, QualifiedName};
use flotilla_hub::ClusterRegistry;
use flotilla_worker::{EventFilter, Informer, ReconcileStatus, ReconcileWorker, StoreHandle, WorkerOptions};

use crate::overrides::{self, OverrideItem};
use crate::placement;
use crate::status::{spawn_status_writer, StatusSnapshot};
use crate::version::{cluster_version_map, VersionManager};

/// Finalizer held on federated objects while targets may still exist.
pub const SYNC_FINALIZER: &str = "kubefed.io/sync-controller";

struct ClusterConn {
    client: ResourceClient,
    store: StoreHandle,
    // Dropping the sender stops the informer's watch task.
    _stop: watch::Sender<()>,
    _informer: Informer,
}

#[derive(Clone)]
struct ConnSnapshot {
    client: ResourceClient,
    store: StoreHandle,
}

enum ClusterApply {
    /// Target already matches; nothing written.
    UpToDate(String),
    /// Created or updated; the new resourceVersion.
    Written(String),
    /// Transiently blocked (create race, vanished mid-update, missing
    /// namespace); try again shortly.
    Waiting,
    TimedOut,
    /// Failed but worth retrying (API error).
    FailedRetry,
    /// Structural failure; retrying is pointless until the spec changes.
    FailedStructural,
}

pub struct SyncController {
    config: ControllerConfig,
    tc: FederatedTypeConfig,
    target_is_namespace: bool,
    fed_client: ResourceClient,
    fed_store: StoreHandle,
    versions: VersionManager,
    registry: Arc<ClusterRegistry>,
    conns: RwLock<HashMap<String, ClusterConn>>,
    status_tx: mpsc::Sender<StatusSnapshot>,
}

/// Wire up informers, worker, and status writer for one type descriptor.
/// Runs until `stop` fires.
pub async fn start_sync_controller(
    config: ControllerConfig,
    tc: FederatedTypeConfig,
    host: Client,
    registry: Arc<ClusterRegistry>,
    stop: watch::Receiver<()>,
) -> anyhow::Result<()> {
    let fed_def = &tc.spec.federated_type;
    let fed_client = ResourceClient::new(host.clone(), fed_def.api_resource(), fed_def.namespaced());
    let target_kind = tc.spec.target_type.kind.clone();
    let target_is_namespace = target_kind == core::NAMESPACE_KIND;
    let versions = VersionManager::new(host.clone(), &target_kind, target_is_namespace);

    // The federated informer needs the worker, which needs the controller,
    // which needs the informer's store; the slot breaks the cycle.
    let worker_slot: Arc<OnceCell<ReconcileWorker>> = Arc::new(OnceCell::new());
    let on_fed_event: Arc<dyn Fn(&DynamicObject) + Send + Sync> = {
        let slot = Arc::clone(&worker_slot);
        Arc::new(move |obj| {
            if let Some(worker) = slot.get() {
                worker.enqueue_obj(obj);
            }
        })
    };
    let fed_informer = Informer::start(
        host.clone(),
        fed_def.api_resource(),
        fed_def.namespaced(),
        config.target_namespace.clone(),
        EventFilter::IgnoreStatus,
        on_fed_event,
        stop.clone(),
    );

    let (status_tx, status_rx) = mpsc::channel(64);
    spawn_status_writer(fed_client.clone(), status_rx, stop.clone());

    let ctrl = Arc::new(SyncController {
        config: config.clone(),
        target_is_namespace,
        fed_client,
        fed_store: fed_informer.store(),
        versions,
        registry,
        conns: RwLock::new(HashMap::new()),
        status_tx,
        tc,
    });

    let opts = WorkerOptions { recheck_delay: config.recheck_delay, ..Default::default() };
    let worker = {
        let ctrl = Arc::clone(&ctrl);
        ReconcileWorker::spawn("sync", opts, stop.clone(), move |key| {
            let ctrl = Arc::clone(&ctrl);
            async move { ctrl.reconcile(key).await }
        })
    };
    let _ = worker_slot.set(worker.clone());

    ctrl.ensure_cluster_conns(&worker).await;
    info!(
        federated_kind = %ctrl.tc.spec.federated_type.kind,
        target_kind = %ctrl.tc.spec.target_type.kind,
        "sync controller started"
    );
    tokio::spawn(maintain_clusters(ctrl, worker, stop, fed_informer));
    Ok(())
}

/// React to registry membership changes: rebuild member connections and
/// re-enqueue every federated object of the type.
async fn maintain_clusters(
    ctrl: Arc<SyncController>,
    worker: ReconcileWorker,
    mut stop: watch::Receiver<()>,
    _fed_informer: Informer,
) {
    let mut epoch = ctrl.registry.subscribe();
    let mut retry = tokio::time::interval(Duration::from_secs(30));
    retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = epoch.changed() => {
                if changed.is_err() {
                    return;
                }
                ctrl.ensure_cluster_conns(&worker).await;
                ctrl.enqueue_all(&worker);
            }
            _ = retry.tick() => {
                // Retries connections that failed to build earlier.
                ctrl.ensure_cluster_conns(&worker).await;
            }
            _ = stop.changed() => {
                info!(target_kind = %ctrl.tc.spec.target_type.kind, "sync controller stopping");
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
        // The federated namespace object lives in the namespace it federates.
        Some(QualifiedName { namespace: Some(name.clone()), name })
    } else if target_namespaced {
        Some(QualifiedName { namespace: obj.metadata.namespace.clone(), name })
    } else {
        Some(QualifiedName { namespace: None, name })
    }
}

impl SyncController {
    fn target_kind(&self) -> &str {
        &self.tc.spec.target_type.kind
    }

    /// Location of the target for one federated object; the same in every
    /// cluster.
    fn target_key(&self, fed_key: &QualifiedName) -> QualifiedName {
        if self.tc.spec.target_type.namespaced() {
            fed_key.clone()
        } else {
            QualifiedName::cluster_scoped(&fed_key.name)
        }
    }

    fn conn_snapshots(&self) -> BTreeMap<String, ConnSnapshot> {
        self.conns
            .read()
            .unwrap()
            .iter()
            .map(|(name, conn)| {
                (name.clone(), ConnSnapshot { client: conn.client.clone(), store: conn.store.clone() })
            })
            .collect()
    }

    fn enqueue_all(&self, worker: &ReconcileWorker) {
        for key in self.fed_store.keys() {
            worker.enqueue(key);
        }
    }

    async fn ensure_cluster_conns(&self, worker: &ReconcileWorker) {
        let view = self.registry.view();
        let names = view.names();
        self.conns.write().unwrap().retain(|name, _| names.contains(name));

        let missing: Vec<String> = {
            let conns = self.conns.read().unwrap();
            names.into_iter().filter(|n| !conns.contains_key(n)).collect()
        };
        for name in missing {
            match self.build_conn(&name, worker).await {
                Ok(conn) => {
                    info!(cluster = %name, target_kind = %self.target_kind(), "member cluster connected");
                    self.conns.write().unwrap().insert(name, conn);
                }
                Err(err) => {
                    warn!(cluster = %name, error = %err, "member cluster connection failed; will retry");
                    counter!("sync_cluster_connect_failures_total", 1u64);
                }
            }
        }
    }

    async fn build_conn(&self, name: &str, worker: &ReconcileWorker) -> anyhow::Result<ClusterConn> {
        let client = self.registry.member_client(name).await?;
        let target = &self.tc.spec.target_type;
        let resource_client = ResourceClient::new(client.clone(), target.api_resource(), target.namespaced());

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
            EventFilter::IgnoreStatus,
            on_event,
            stop_rx,
        );
        Ok(ClusterConn {
            client: resource_client,
            store: informer.store(),
            _stop: stop_tx,
            _informer: informer,
        })
    }

    async fn reconcile(&self, key: QualifiedName) -> ReconcileStatus {
        let t0 = Instant::now();
        let result = self.reconcile_inner(&key).await;
        histogram!(
            "sync_reconcile_duration_ms",
            t0.elapsed().as_secs_f64() * 1000.0,
            "kind" => self.target_kind().to_string()
        );
        match result {
            Ok(status) => status,
            Err(err) => {
                warn!(key = %key, target_kind = %self.target_kind(), error = ?err, "reconcile failed");
                counter!("sync_reconcile_errors_total", 1u64);
                ReconcileStatus::Error
            }
        }
    }

    async fn reconcile_inner(&self, key: &QualifiedName) -> anyhow::Result<ReconcileStatus> {
        debug!(key = %key, target_kind = %self.target_kind(), "reconciling");

        let fed = match self.fed_store.get(key) {
            Some(obj) => Some(obj),
            None => self.fed_client.get(key).await?,
        };
        let Some(fed) = fed else {
            return self.cleanup_remnants(key).await;
        };

        if fed.metadata.deletion_timestamp.is_some() {
            return self.handle_deletion(&fed, key).await;
        }
        self.ensure_finalizer(&fed, key).await?;

        let view = self.registry.view();
        let placement = placement::resolve(&fed, &view);
        let generation = core::generation_of(&fed);

        let template = match core::template_of(&fed) {
            Ok(t) => t,
            Err(err) => {
                warn!(key = %key, error = %err, "malformed template; propagation suspended");
                self.publish_structural_failure(key, generation, &placement).await;
                return Ok(ReconcileStatus::AllOk);
            }
        };
        let overrides = match overrides::parse(&fed) {
            Ok(o) => o,
            Err(err) => {
                warn!(key = %key, error = %err, "malformed overrides; propagation suspended");
                self.publish_structural_failure(key, generation, &placement).await;
                return Ok(ReconcileStatus::AllOk);
            }
        };

        let template_hash = core::content_hash(&template);
        let override_hash = core::overrides_hash(&fed);
        let record = self.versions.get(key).await?;
        let hashes_current = record
            .as_ref()
            .map(|r| r.spec.template_version == template_hash && r.spec.override_version == override_hash)
            .unwrap_or(false);
        let recorded = record.as_ref().map(cluster_version_map).unwrap_or_default();

        let policy = core::delete_options(&fed).and_then(|v| DeletePolicy::from_delete_options(&v));
        let primary = view.primary().map(str::to_string);
        let conns = self.conn_snapshots();
        let tkey = self.target_key(key);

        let mut outcomes: Vec<(String, PropagationStatus)> = Vec::new();
        let mut retry = false;
        let mut new_versions: BTreeMap<String, String> = BTreeMap::new();

        // Clusters named by placement but unready keep their targets and wait.
        for cluster in &placement.unready {
            outcomes.push((cluster.clone(), PropagationStatus::WaitingForSync));
            retry = true;
            if let Some(v) = recorded.get(cluster) {
                new_versions.insert(cluster.clone(), v.clone());
            }
        }

        let mut apply_futs = Vec::new();
        let tkey_ref = &tkey;
        let template_ref = &template;
        for cluster in &placement.selected {
            let Some(conn) = conns.get(cluster) else {
                // Registered but not yet connected.
                outcomes.push((cluster.clone(), PropagationStatus::WaitingForSync));
                retry = true;
                if let Some(v) = recorded.get(cluster) {
                    new_versions.insert(cluster.clone(), v.clone());
                }
                continue;
            };
            let conn = conn.clone();
            let cluster = cluster.clone();
            let items: &[OverrideItem] = overrides.get(&cluster).map(Vec::as_slice).unwrap_or(&[]);
            let recorded_rv = recorded.get(&cluster).cloned();
            apply_futs.push(async move {
                let applied = tokio::time::timeout(
                    self.config.cluster_wait_timeout,
                    self.apply_to_cluster(
                        &conn,
                        tkey_ref,
                        template_ref,
                        items,
                        recorded_rv.as_deref(),
                        hashes_current,
                    ),
                )
                .await
                .unwrap_or(ClusterApply::TimedOut);
                (cluster, applied)
            });
        }

        for (cluster, applied) in join_all(apply_futs).await {
            match applied {
                ClusterApply::UpToDate(rv) => {
                    outcomes.push((cluster.clone(), PropagationStatus::Ok));
                    new_versions.insert(cluster, rv);
                }
                ClusterApply::Written(rv) => {
                    counter!("sync_propagation_writes_total", 1u64, "kind" => self.target_kind().to_string());
                    outcomes.push((cluster.clone(), PropagationStatus::Ok));
                    new_versions.insert(cluster, rv);
                }
                ClusterApply::Waiting => {
                    outcomes.push((cluster.clone(), PropagationStatus::WaitingForSync));
                    retry = true;
                    if let Some(v) = recorded.get(&cluster) {
                        new_versions.insert(cluster, v.clone());
                    }
                }
                ClusterApply::TimedOut => {
                    outcomes.push((cluster.clone(), PropagationStatus::TimedOut));
                    retry = true;
                    if let Some(v) = recorded.get(&cluster) {
                        new_versions.insert(cluster, v.clone());
                    }
                }
                ClusterApply::FailedRetry => {
                    outcomes.push((cluster, PropagationStatus::Failed));
                    retry = true;
                }
                ClusterApply::FailedStructural => {
                    outcomes.push((cluster, PropagationStatus::Failed));
                }
            }
        }

        // Clusters no longer selected lose their targets; the primary keeps
        // its namespace and is only unlabeled.
        let keep: BTreeSet<&String> = placement.selected.iter().chain(placement.unready.iter()).collect();
        for (name, conn) in &conns {
            if keep.contains(name) {
                continue;
            }
            match self.remove_from_cluster(conn, &tkey, name, primary.as_deref(), policy).await {
                Ok(None) => {}
                Ok(Some(status)) => {
                    outcomes.push((name.clone(), status));
                    retry = true;
                }
                Err(err) => {
                    warn!(cluster = %name, key = %key, error = %err, "target removal failed");
                    outcomes.push((name.clone(), PropagationStatus::Failed));
                    retry = true;
                }
            }
        }

        self.versions.update(key, &template_hash, &override_hash, &new_versions).await?;

        let snapshot = StatusSnapshot { key: key.clone(), generation, outcomes };
        let waiting = snapshot.outcomes.iter().any(|(_, s)| {
            matches!(
                s,
                PropagationStatus::WaitingForSync
                    | PropagationStatus::WaitingForRemoval
                    | PropagationStatus::TimedOut
            )
        });
        let _ = self.status_tx.send(snapshot).await;

        if retry || waiting {
            Ok(ReconcileStatus::NeedsRecheck)
        } else {
            Ok(ReconcileStatus::AllOk)
        }
    }

    /// Build the desired body, then converge the cluster's target onto it.
    async fn apply_to_cluster(
        &self,
        conn: &ConnSnapshot,
        tkey: &QualifiedName,
        template: &Value,
        items: &[OverrideItem],
        recorded_rv: Option<&str>,
        hashes_current: bool,
    ) -> ClusterApply {
        let mut desired = template.clone();
        if !items.is_empty() {
            if let Err(err) = overrides::apply(&mut desired, items) {
                warn!(key = %tkey, error = %err, "override application failed");
                return ClusterApply::FailedStructural;
            }
        }
        self.stamp_desired(&mut desired, tkey);
        core::set_managed_label(&mut desired);
        let desired_obj: DynamicObject = match serde_json::from_value(desired.clone()) {
            Ok(obj) => obj,
            Err(err) => {
                warn!(key = %tkey, error = %err, "desired body is not an object");
                return ClusterApply::FailedStructural;
            }
        };

        let actual = match conn.store.get(tkey) {
            Some(a) => Some(a),
            None => match conn.client.get(tkey).await {
                Ok(a) => a,
                Err(err) => return classify_apply_error(err),
            },
        };

        match actual {
            None => match conn.client.create(&desired_obj).await {
                Ok(created) => {
                    ClusterApply::Written(created.metadata.resource_version.unwrap_or_default())
                }
                // Lost a create race against an informer that lagged.
                Err(err) if err.is_conflict() => ClusterApply::Waiting,
                Err(err) => classify_apply_error(err),
            },
            Some(actual) => self.converge(conn, tkey, &desired_obj, actual, recorded_rv, hashes_current).await,
        }
    }

    /// Adopt-or-update an existing target. An unlabeled target is adopted by
    /// the desired body carrying the managed label.
    async fn converge(
        &self,
        conn: &ConnSnapshot,
        tkey: &QualifiedName,
        desired: &DynamicObject,
        actual: DynamicObject,
        recorded_rv: Option<&str>,
        hashes_current: bool,
    ) -> ClusterApply {
        let actual_rv = actual.metadata.resource_version.clone().unwrap_or_default();
        if core::has_managed_label(&actual) && hashes_current && recorded_rv == Some(actual_rv.as_str()) {
            return ClusterApply::UpToDate(actual_rv);
        }

        let merged = merge_desired(&actual, desired);
        if serde_json::to_value(&merged).ok() == serde_json::to_value(&actual).ok() {
            return ClusterApply::UpToDate(actual_rv);
        }

        match conn.client.update(&merged).await {
            Ok(updated) => ClusterApply::Written(updated.metadata.resource_version.unwrap_or_default()),
            Err(err) if err.is_conflict() => {
                // Refetch and retry once within the same pass.
                match conn.client.get(tkey).await {
                    Ok(Some(fresh)) => {
                        let merged = merge_desired(&fresh, desired);
                        if serde_json::to_value(&merged).ok() == serde_json::to_value(&fresh).ok() {
                            let rv = fresh.metadata.resource_version.unwrap_or_default();
                            return ClusterApply::UpToDate(rv);
                        }
                        match conn.client.update(&merged).await {
                            Ok(updated) => ClusterApply::Written(
                                updated.metadata.resource_version.unwrap_or_default(),
                            ),
                            Err(err) if err.is_conflict() => ClusterApply::Waiting,
                            Err(err) => classify_apply_error(err),
                        }
                    }
                    Ok(None) => ClusterApply::Waiting,
                    Err(err) => classify_apply_error(err),
                }
            }
            Err(err) => classify_apply_error(err),
        }
    }

    /// Delete (or, for the primary's namespace, unlabel) the target in a
    /// cluster that is no longer selected. `None` means nothing was left.
    async fn remove_from_cluster(
        &self,
        conn: &ConnSnapshot,
        tkey: &QualifiedName,
        cluster: &str,
        primary: Option<&str>,
        policy: Option<DeletePolicy>,
    ) -> Result<Option<PropagationStatus>, ClientError> {
        let Some(actual) = conn.client.get(tkey).await? else { return Ok(None) };
        if !core::has_managed_label(&actual) {
            return Ok(None);
        }
        if self.target_is_namespace && primary == Some(cluster) {
            self.unlabel(conn, tkey).await?;
            return Ok(Some(PropagationStatus::WaitingForRemoval));
        }
        conn.client.delete(tkey, policy).await?;
        Ok(Some(PropagationStatus::WaitingForRemoval))
    }

    async fn unlabel(&self, conn: &ConnSnapshot, tkey: &QualifiedName) -> Result<(), ClientError> {
        let mut labels = serde_json::Map::new();
        labels.insert(core::MANAGED_LABEL_KEY.to_string(), Value::Null);
        let patch = json!({"metadata": {"labels": labels}});
        conn.client.patch_merge(tkey, &patch).await.map(|_| ())
    }

    /// Target cleanup for a federated object that vanished without running
    /// its deletion subflow (e.g. finalizer stripped externally).
    async fn cleanup_remnants(&self, key: &QualifiedName) -> anyhow::Result<ReconcileStatus> {
        let tkey = self.target_key(key);
        let primary = self.registry.primary();
        let mut pending = false;
        for (name, conn) in &self.conn_snapshots() {
            match self.remove_from_cluster(conn, &tkey, name, primary.as_deref(), None).await {
                Ok(None) => {}
                Ok(Some(_)) => pending = true,
                Err(err) => {
                    warn!(cluster = %name, key = %key, error = %err, "remnant cleanup failed");
                    pending = true;
                }
            }
        }
        if pending {
            return Ok(ReconcileStatus::NeedsRecheck);
        }
        self.versions.delete(key).await?;
        Ok(ReconcileStatus::AllOk)
    }

    /// Deletion subflow: delete targets everywhere (or unlabel them when
    /// orphaning), wait until confirmed gone, then release the finalizer.
    async fn handle_deletion(&self, fed: &DynamicObject, key: &QualifiedName) -> anyhow::Result<ReconcileStatus> {
        let finalizers = fed.metadata.finalizers.clone().unwrap_or_default();
        if !finalizers.iter().any(|f| f == SYNC_FINALIZER) {
            return Ok(ReconcileStatus::AllOk);
        }

        let orphan = core::is_orphaning_enabled(fed);
        let policy = core::delete_options(fed).and_then(|v| DeletePolicy::from_delete_options(&v));
        let primary = self.registry.primary();
        let tkey = self.target_key(key);
        let mut pending = false;

        for (name, conn) in &self.conn_snapshots() {
            let actual = match conn.client.get(&tkey).await {
                Ok(a) => a,
                Err(err) => {
                    warn!(cluster = %name, key = %key, error = %err, "deletion check failed");
                    pending = true;
                    continue;
                }
            };
            let Some(actual) = actual else { continue };
            if !core::has_managed_label(&actual) {
                continue;
            }
            let keep_object =
                orphan || (self.target_is_namespace && primary.as_deref() == Some(name.as_str()));
            if keep_object {
                if let Err(err) = self.unlabel(conn, &tkey).await {
                    warn!(cluster = %name, key = %key, error = %err, "unlabeling failed");
                    pending = true;
                }
            } else {
                if let Err(err) = conn.client.delete(&tkey, policy).await {
                    warn!(cluster = %name, key = %key, error = %err, "target deletion failed");
                }
                // Deletion is asynchronous; confirm absence on a later pass.
                pending = true;
            }
        }

        if pending {
            return Ok(ReconcileStatus::NeedsRecheck);
        }
        self.versions.delete(key).await?;
        self.remove_finalizer(fed, key).await?;
        debug!(key = %key, "deletion complete; finalizer released");
        Ok(ReconcileStatus::AllOk)
    }

    async fn ensure_finalizer(&self, fed: &DynamicObject, key: &QualifiedName) -> Result<(), ClientError> {
        let mut finalizers = fed.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == SYNC_FINALIZER) {
            return Ok(());
        }
        finalizers.push(SYNC_FINALIZER.to_string());
        self.fed_client
            .patch_merge(key, &json!({"metadata": {"finalizers": finalizers}}))
            .await
            .map(|_| ())
    }

    async fn remove_finalizer(&self, fed: &DynamicObject, key: &QualifiedName) -> Result<(), ClientError> {
        let finalizers = fed.metadata.finalizers.clone().unwrap_or_default();
        if !finalizers.iter().any(|f| f == SYNC_FINALIZER) {
            return Ok(());
        }
        let remaining: Vec<String> = finalizers.into_iter().filter(|f| f != SYNC_FINALIZER).collect();
        match self
            .fed_client
            .patch_merge(key, &json!({"metadata": {"finalizers": remaining}}))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Mark every placed cluster failed without touching targets; used when
    /// the spec itself is unusable.
    async fn publish_structural_failure(
        &self,
        key: &QualifiedName,
        generation: i64,
        placement: &placement::PlacementResult,
    ) {
        let outcomes = placement
            .selected
            .iter()
            .chain(placement.unready.iter())
            .map(|c| (c.clone(), PropagationStatus::Failed))
            .collect();
        let _ = self
            .status_tx
            .send(StatusSnapshot { key: key.clone(), generation, outcomes })
            .await;
    }

    /// Stamp identity onto a desired body: GVK from the descriptor plus the
    /// target name and namespace.
    fn stamp_desired(&self, body: &mut Value, tkey: &QualifiedName) {
        let target = &self.tc.spec.target_type;
        let api_version = if target.group_str().is_empty() {
            target.version.clone()
        } else {
            format!("{}/{}", target.group_str(), target.version)
        };
        core::tree::set(body, &["apiVersion"], Value::String(api_version));
        core::tree::set(body, &["kind"], Value::String(target.kind.clone()));
        core::tree::set(body, &["metadata", "name"], Value::String(tkey.name.clone()));
        match &tkey.namespace {
            Some(ns) if target.namespaced() => {
                core::tree::set(body, &["metadata", "namespace"], Value::String(ns.clone()));
            }
            _ => {}
        }
    }
}

fn classify_apply_error(err: ClientError) -> ClusterApply {
    if err.is_timeout() {
        ClusterApply::TimedOut
    } else if err.is_not_found() || err.is_conflict() {
        // Missing namespace in the member or a write race; both settle.
        ClusterApply::Waiting
    } else {
        ClusterApply::FailedRetry
    }
}

/// Overlay the desired body onto the live object: desired top-level fields
/// replace the live ones wholesale, desired labels and annotations merge into
/// the live metadata, and everything the cluster owns (status, remaining
/// metadata, resourceVersion for optimistic concurrency) is retained.
fn merge_desired(actual: &DynamicObject, desired: &DynamicObject) -> DynamicObject {
    let mut out = actual.clone();
    if let (Some(out_map), Some(desired_map)) = (out.data.as_object_mut(), desired.data.as_object()) {
        for (k, v) in desired_map {
            if k == "status" {
                continue;
            }
            out_map.insert(k.clone(), v.clone());
        }
    }
    let out_labels = out.metadata.labels.get_or_insert_with(Default::default);
    for (k, v) in desired.metadata.labels.iter().flatten() {
        out_labels.insert(k.clone(), v.clone());
    }
    if desired.metadata.annotations.is_some() {
        let out_annotations = out.metadata.annotations.get_or_insert_with(Default::default);
        for (k, v) in desired.metadata.annotations.iter().flatten() {
            out_annotations.insert(k.clone(), v.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dynamic(v: Value) -> DynamicObject {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn merge_keeps_cluster_owned_fields() {
        let actual = dynamic(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm", "namespace": "ns",
                "resourceVersion": "41",
                "uid": "6e3f1a62-0001-0002-0003-94b3cafe0000",
                "labels": {"pre-existing": "yes"}
            },
            "data": {"k": "old"}
        }));
        let desired = dynamic(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns", "labels": {"kubefed.io/managed": "true"}},
            "data": {"k": "new"}
        }));
        let merged = merge_desired(&actual, &desired);
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("41"));
        assert_eq!(merged.metadata.uid, actual.metadata.uid);
        let labels = merged.metadata.labels.unwrap();
        assert_eq!(labels.get("pre-existing").map(String::as_str), Some("yes"));
        assert_eq!(labels.get("kubefed.io/managed").map(String::as_str), Some("true"));
        assert_eq!(merged.data["data"]["k"], json!("new"));
    }

    #[test]
    fn merge_is_a_noop_when_already_converged() {
        let actual = dynamic(json!({
            "metadata": {"name": "cm", "namespace": "ns", "resourceVersion": "7",
                          "labels": {"kubefed.io/managed": "true"}},
            "data": {"k": "v"},
            "status": {"observed": true}
        }));
        let desired = dynamic(json!({
            "metadata": {"name": "cm", "namespace": "ns", "labels": {"kubefed.io/managed": "true"}},
            "data": {"k": "v"}
        }));
        let merged = merge_desired(&actual, &desired);
        assert_eq!(serde_json::to_value(&merged).unwrap(), serde_json::to_value(&actual).unwrap());
    }

    #[test]
    fn target_keys_follow_scope() {
        let ns_obj = dynamic(json!({"metadata": {"name": "web", "namespace": "apps"}}));
        let key = fed_key_for_target(&ns_obj, true, false).unwrap();
        assert_eq!(key, QualifiedName::new(Some("apps"), "web"));

        let ns_target = dynamic(json!({"metadata": {"name": "ns1"}}));
        let key = fed_key_for_target(&ns_target, false, true).unwrap();
        assert_eq!(key, QualifiedName::new(Some("ns1"), "ns1"));
    }
}
