//! Type-configuration controller.
//!
//! Watches `FederatedTypeConfig` descriptors in the federation namespace and
//! starts, stops, or refreshes the per-type sync and status controllers to
//! match. Each running controller is held as a slot keyed by descriptor name
//! (`<name>/status` for status controllers); cluster-scoped descriptors under
//! a namespaced control plane get a placeholder slot instead of a controller.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use kube::api::{Api, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use metrics::counter;
use once_cell::sync::OnceCell;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_api::{ControllerState, FederatedTypeConfig, FederatedTypeConfigStatus};
use flotilla_core::{ControllerConfig, FeatureGate, QualifiedName};
use flotilla_hub::ClusterRegistry;
use flotilla_status::start_status_controller;
use flotilla_sync::start_sync_controller;
use flotilla_worker::{EventFilter, Informer, ReconcileStatus, ReconcileWorker, StoreHandle, WorkerOptions};

pub const TYPE_CONFIG_FINALIZER: &str = "core.kubefed.io/federated-type-config";

struct ControllerHandle {
    stop: watch::Sender<()>,
}

impl ControllerHandle {
    /// Signal stop; safe exactly once since it consumes the handle.
    fn stop(self) {
        drop(self.stop);
    }
}

enum ControllerSlot {
    /// Occupies the slot without a controller, so the "running" predicate is
    /// true while the published state stays `NotRunning`.
    Placeholder,
    Running(ControllerHandle),
}

/// What one reconcile pass should do to the controllers of a descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Plan {
    placeholder: bool,
    start_sync: bool,
    stop_sync: bool,
    refresh_sync: bool,
    start_status: bool,
    stop_status: bool,
}

#[derive(Debug, Clone, Copy)]
struct PlanArgs {
    sync_enabled: bool,
    status_enabled: bool,
    target_namespaced: bool,
    namespace_descriptor_exists: bool,
    limited_scope: bool,
    sync_running: bool,
    status_running: bool,
    generation_advanced: bool,
}

fn plan(args: PlanArgs) -> Plan {
    // A namespaced control plane cannot run controllers for cluster-scoped
    // types; park the slot instead.
    if args.limited_scope && args.sync_enabled && !args.target_namespaced {
        return Plan { placeholder: true, ..Default::default() };
    }

    // A namespaced type cannot sync without the namespaces descriptor: its
    // targets live in namespaces the sync controller must be able to manage.
    let sync_startable =
        args.sync_enabled && (!args.target_namespaced || args.namespace_descriptor_exists);
    let start_sync = !args.sync_running && sync_startable;
    let stop_sync = args.sync_running
        && (!args.sync_enabled || (args.target_namespaced && !args.namespace_descriptor_exists));
    let refresh_sync = args.sync_running && !start_sync && !stop_sync && args.generation_advanced;

    Plan {
        placeholder: false,
        start_sync,
        stop_sync,
        refresh_sync,
        start_status: !args.status_running && args.status_enabled,
        stop_status: args.status_running && !args.status_enabled,
    }
}

pub struct TypeConfigController {
    config: ControllerConfig,
    host: Client,
    registry: Arc<ClusterRegistry>,
    store: StoreHandle,
    slots: RwLock<HashMap<String, ControllerSlot>>,
    worker: Arc<OnceCell<ReconcileWorker>>,
}

/// Run the type-config controller until `stop` fires. Dependent sync and
/// status controllers are stopped with it.
pub async fn start_type_config_controller(
    config: ControllerConfig,
    host: Client,
    registry: Arc<ClusterRegistry>,
    stop: watch::Receiver<()>,
) -> anyhow::Result<()> {
    let ar = ApiResource::erase::<FederatedTypeConfig>(&());

    let worker_slot: Arc<OnceCell<ReconcileWorker>> = Arc::new(OnceCell::new());
    let on_event: Arc<dyn Fn(&DynamicObject) + Send + Sync> = {
        let slot = Arc::clone(&worker_slot);
        Arc::new(move |obj| {
            if let Some(worker) = slot.get() {
                worker.enqueue_obj(obj);
            }
        })
    };
    // Watch only the federation namespace so restrictive authz can be applied
    // to a namespaced control plane.
    let informer = Informer::start(
        host.clone(),
        ar,
        true,
        Some(config.fed_namespace.clone()),
        EventFilter::IgnoreStatus,
        on_event,
        stop.clone(),
    );

    let ctrl = Arc::new(TypeConfigController {
        config,
        host,
        registry,
        store: informer.store(),
        slots: RwLock::new(HashMap::new()),
        worker: Arc::clone(&worker_slot),
    });

    let worker = {
        let ctrl = Arc::clone(&ctrl);
        ReconcileWorker::spawn("typeconfig", WorkerOptions::default(), stop.clone(), move |key| {
            let ctrl = Arc::clone(&ctrl);
            async move { ctrl.reconcile(key).await }
        })
    };
    let _ = worker_slot.set(worker.clone());
    info!(namespace = %ctrl.config.fed_namespace, "type-config controller started");

    // Block until stop fires, keeping the informer alive, then drain slots.
    let mut stop_rx = stop;
    let _ = stop_rx.changed().await;
    drop(informer);
    ctrl.shutdown();
    Ok(())
}

impl TypeConfigController {
    fn api(&self) -> Api<FederatedTypeConfig> {
        Api::namespaced(self.host.clone(), &self.config.fed_namespace)
    }

    fn shutdown(&self) {
        let mut slots = self.slots.write().unwrap();
        for (key, slot) in slots.drain() {
            if let ControllerSlot::Running(handle) = slot {
                debug!(slot = %key, "stopping controller on shutdown");
                handle.stop();
            }
        }
        info!("type-config controller stopped");
    }

    fn slot_running(&self, key: &str) -> bool {
        self.slots.read().unwrap().contains_key(key)
    }

    fn stop_slot(&self, key: &str) {
        let slot = self.slots.write().unwrap().remove(key);
        match slot {
            Some(ControllerSlot::Running(handle)) => {
                info!(slot = %key, "stopping controller");
                handle.stop();
            }
            Some(ControllerSlot::Placeholder) => {}
            None => {}
        }
    }

    fn typed(&self, obj: &DynamicObject) -> Option<FederatedTypeConfig> {
        match serde_json::to_value(obj).and_then(serde_json::from_value) {
            Ok(tc) => Some(tc),
            Err(err) => {
                warn!(error = %err, "descriptor does not parse as FederatedTypeConfig");
                None
            }
        }
    }

    fn namespace_descriptor_exists(&self) -> bool {
        let key = QualifiedName::new(
            Some(&self.config.fed_namespace),
            flotilla_core::NAMESPACES_DESCRIPTOR,
        );
        self.store.get(&key).is_some()
    }

    /// Re-enqueue every namespaced descriptor; their sync controllers start
    /// or stop with the namespaces descriptor.
    fn reenqueue_namespaced(&self, worker: &ReconcileWorker) {
        for obj in self.store.list() {
            let Some(tc) = self.typed(&obj) else { continue };
            if tc.target_namespaced() && !tc.is_namespace_descriptor() {
                worker.enqueue_obj(&obj);
            }
        }
    }

    async fn reconcile(&self, key: QualifiedName) -> ReconcileStatus {
        match self.reconcile_inner(&key).await {
            Ok(status) => status,
            Err(err) => {
                warn!(key = %key, error = ?err, "type-config reconcile failed");
                counter!("typeconfig_reconcile_errors_total", 1u64);
                ReconcileStatus::Error
            }
        }
    }

    async fn reconcile_inner(&self, key: &QualifiedName) -> anyhow::Result<ReconcileStatus> {
        debug!(key = %key, "reconciling type descriptor");
        let Some(obj) = self.store.get(key) else { return Ok(ReconcileStatus::AllOk) };
        let Some(tc) = self.typed(&obj) else { return Ok(ReconcileStatus::AllOk) };
        let name = key.name.clone();
        let status_key = format!("{}/status", name);

        let sync_enabled =
            tc.propagation_enabled() && self.config.gates.enabled(FeatureGate::PushReconciler);
        let status_enabled = tc.status_collection_enabled()
            && self.config.gates.enabled(FeatureGate::RawResourceStatusCollection);

        if tc.metadata.deletion_timestamp.is_some() {
            self.stop_slot(&name);
            self.stop_slot(&status_key);
            if tc.is_namespace_descriptor() {
                info!(key = %key, "namespaces descriptor deleted; reconciling namespaced descriptors");
                if let Some(worker) = self.worker() {
                    self.reenqueue_namespaced(&worker);
                }
            }
            self.remove_finalizer(&tc).await?;
            return Ok(ReconcileStatus::AllOk);
        }

        let added = self.ensure_finalizer(&tc).await?;
        if added && tc.is_namespace_descriptor() {
            // Namespaced descriptors may have been waiting for this one.
            if let Some(worker) = self.worker() {
                self.reenqueue_namespaced(&worker);
            }
        }

        let generation = tc.metadata.generation.unwrap_or(0);
        let observed = tc.status.as_ref().map(|s| s.observed_generation).unwrap_or(0);
        let the_plan = plan(PlanArgs {
            sync_enabled,
            status_enabled,
            target_namespaced: tc.target_namespaced(),
            namespace_descriptor_exists: self.namespace_descriptor_exists()
                || tc.is_namespace_descriptor(),
            limited_scope: self.config.limited_scope(),
            sync_running: self.slot_running(&name),
            status_running: self.slot_running(&status_key),
            generation_advanced: generation != observed,
        });

        if the_plan.placeholder {
            if !self.slot_running(&name) {
                info!(
                    kind = %tc.spec.federated_type.kind,
                    "cluster-scoped type under a namespaced control plane; parking a placeholder slot"
                );
                self.slots.write().unwrap().insert(name.clone(), ControllerSlot::Placeholder);
            }
            self.publish_status(&tc, generation, false, status_enabled.then_some(false)).await?;
            return Ok(ReconcileStatus::AllOk);
        }

        if the_plan.start_sync {
            self.start_sync(&name, &tc).await?;
        } else if the_plan.stop_sync {
            self.stop_slot(&name);
        } else if the_plan.refresh_sync {
            info!(key = %key, "descriptor changed; refreshing sync controller");
            self.stop_slot(&name);
            self.start_sync(&name, &tc).await?;
        }

        if the_plan.start_status {
            self.start_status(&status_key, &tc).await?;
        } else if the_plan.stop_status {
            self.stop_slot(&status_key);
        }

        let sync_running = self.slot_running(&name);
        let status_running = self.slot_running(&status_key);
        self.publish_status(&tc, generation, sync_running, Some(status_running)).await?;
        Ok(ReconcileStatus::AllOk)
    }

    fn worker(&self) -> Option<ReconcileWorker> {
        // Set before the first reconcile can run.
        self.worker.get().cloned()
    }

    async fn start_sync(&self, slot_key: &str, tc: &FederatedTypeConfig) -> anyhow::Result<()> {
        let (stop_tx, stop_rx) = watch::channel(());
        match start_sync_controller(
            self.config.clone(),
            tc.clone(),
            self.host.clone(),
            Arc::clone(&self.registry),
            stop_rx,
        )
        .await
        {
            Ok(()) => {
                info!(kind = %tc.spec.federated_type.kind, "started sync controller");
                self.slots
                    .write()
                    .unwrap()
                    .insert(slot_key.to_string(), ControllerSlot::Running(ControllerHandle { stop: stop_tx }));
                Ok(())
            }
            Err(err) => {
                drop(stop_tx);
                Err(err.context(format!("starting sync controller for {:?}", tc.spec.federated_type.kind)))
            }
        }
    }

    async fn start_status(&self, slot_key: &str, tc: &FederatedTypeConfig) -> anyhow::Result<()> {
        let (stop_tx, stop_rx) = watch::channel(());
        match start_status_controller(
            self.config.clone(),
            tc.clone(),
            self.host.clone(),
            Arc::clone(&self.registry),
            stop_rx,
        )
        .await
        {
            Ok(()) => {
                info!(kind = %tc.spec.federated_type.kind, "started status controller");
                self.slots
                    .write()
                    .unwrap()
                    .insert(slot_key.to_string(), ControllerSlot::Running(ControllerHandle { stop: stop_tx }));
                Ok(())
            }
            Err(err) => {
                drop(stop_tx);
                Err(err.context(format!("starting status controller for {:?}", tc.spec.federated_type.kind)))
            }
        }
    }

    async fn ensure_finalizer(&self, tc: &FederatedTypeConfig) -> anyhow::Result<bool> {
        let mut finalizers = tc.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == TYPE_CONFIG_FINALIZER) {
            return Ok(false);
        }
        finalizers.push(TYPE_CONFIG_FINALIZER.to_string());
        let name = tc.metadata.name.clone().unwrap_or_default();
        self.api()
            .patch(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&json!({"metadata": {"finalizers": finalizers}})),
            )
            .await?;
        Ok(true)
    }

    async fn remove_finalizer(&self, tc: &FederatedTypeConfig) -> anyhow::Result<()> {
        let finalizers = tc.metadata.finalizers.clone().unwrap_or_default();
        if !finalizers.iter().any(|f| f == TYPE_CONFIG_FINALIZER) {
            return Ok(());
        }
        let remaining: Vec<String> =
            finalizers.into_iter().filter(|f| f != TYPE_CONFIG_FINALIZER).collect();
        let name = tc.metadata.name.clone().unwrap_or_default();
        match self
            .api()
            .patch(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&json!({"metadata": {"finalizers": remaining}})),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn publish_status(
        &self,
        tc: &FederatedTypeConfig,
        generation: i64,
        sync_running: bool,
        status_running: Option<bool>,
    ) -> anyhow::Result<()> {
        let state = |running: bool| {
            if running {
                ControllerState::Running
            } else {
                ControllerState::NotRunning
            }
        };
        let desired = FederatedTypeConfigStatus {
            observed_generation: generation,
            propagation_controller: Some(state(sync_running)),
            status_controller: status_running.map(state),
        };
        if tc.status.as_ref() == Some(&desired) {
            return Ok(());
        }
        let name = tc.metadata.name.clone().unwrap_or_default();
        self.api()
            .patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&json!({"status": desired})),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> PlanArgs {
        PlanArgs {
            sync_enabled: true,
            status_enabled: false,
            target_namespaced: true,
            namespace_descriptor_exists: true,
            limited_scope: false,
            sync_running: false,
            status_running: false,
            generation_advanced: false,
        }
    }

    #[test]
    fn enabled_descriptor_starts_a_sync_controller() {
        let p = plan(args());
        assert!(p.start_sync);
        assert!(!p.stop_sync && !p.refresh_sync && !p.placeholder);
    }

    #[test]
    fn disabling_propagation_stops_the_controller() {
        let p = plan(PlanArgs { sync_enabled: false, sync_running: true, ..args() });
        assert!(p.stop_sync);
        assert!(!p.start_sync);
    }

    #[test]
    fn namespaced_types_wait_for_the_namespaces_descriptor() {
        let p = plan(PlanArgs { namespace_descriptor_exists: false, ..args() });
        assert!(!p.start_sync);

        let p = plan(PlanArgs {
            namespace_descriptor_exists: false,
            sync_running: true,
            ..args()
        });
        assert!(p.stop_sync, "running controllers stop when the namespaces descriptor goes away");
    }

    #[test]
    fn cluster_scoped_types_get_a_placeholder_under_limited_scope() {
        let p = plan(PlanArgs { limited_scope: true, target_namespaced: false, ..args() });
        assert_eq!(p, Plan { placeholder: true, ..Default::default() });
    }

    #[test]
    fn generation_advance_refreshes_a_running_controller() {
        let p = plan(PlanArgs { sync_running: true, generation_advanced: true, ..args() });
        assert!(p.refresh_sync);
        assert!(!p.start_sync && !p.stop_sync);

        let steady = plan(PlanArgs { sync_running: true, ..args() });
        assert_eq!(steady, Plan::default());
    }

    #[test]
    fn status_controller_follows_its_own_flag() {
        let p = plan(PlanArgs { status_enabled: true, ..args() });
        assert!(p.start_status);

        let p = plan(PlanArgs { status_running: true, ..args() });
        assert!(p.stop_status);

        let p = plan(PlanArgs { status_enabled: true, status_running: true, ..args() });
        assert!(!p.start_status && !p.stop_status);
    }
}
