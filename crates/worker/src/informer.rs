//! Long-lived watch cache for one `(cluster, kind)` pair.
//!
//! The watch task is the only writer of the cache; consumers read through a
//! cheap cloneable handle. Event callbacks fire only for semantic changes so
//! downstream queues are not churned by status or resourceVersion noise.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::TryStreamExt;
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::watcher::{self, Event};
use kube::Client;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_core::{tree, QualifiedName};

fn relist_secs() -> u64 {
    std::env::var("FLOTILLA_RELIST_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(300)
}

fn backoff_max_secs() -> u64 {
    std::env::var("FLOTILLA_WATCH_BACKOFF_MAX_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30)
}

/// Read access to the informer's cache.
#[derive(Clone, Default)]
pub struct StoreHandle {
    inner: Arc<RwLock<FxHashMap<QualifiedName, DynamicObject>>>,
}

impl StoreHandle {
    pub fn get(&self, key: &QualifiedName) -> Option<DynamicObject> {
        self.inner.read().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<QualifiedName> {
        self.inner.read().unwrap().keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<DynamicObject> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which updates are forwarded to the change callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFilter {
    /// Only semantic changes: spec + metadata, minus server-managed noise.
    #[default]
    IgnoreStatus,
    /// Semantic changes plus `.status` changes (for status collection).
    IncludeStatus,
}

/// Strip the fields that change without the object meaningfully changing.
fn stripped(obj: &DynamicObject, filter: EventFilter) -> Value {
    let mut v = serde_json::to_value(obj).unwrap_or(Value::Null);
    if filter == EventFilter::IgnoreStatus {
        if let Some(obj) = v.as_object_mut() {
            obj.remove("status");
        }
    }
    tree::remove(&mut v, &["metadata", "resourceVersion"]);
    tree::remove(&mut v, &["metadata", "managedFields"]);
    v
}

pub(crate) fn semantic_changed(old: &DynamicObject, new: &DynamicObject, filter: EventFilter) -> bool {
    stripped(old, filter) != stripped(new, filter)
}

/// A watch-cache plus change notifications for one kind in one cluster.
pub struct Informer {
    store: StoreHandle,
    synced: watch::Receiver<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl Informer {
    /// Start the watch loop. `on_change` fires for filtered adds/updates and
    /// for every deletion, after the cache has been updated.
    pub fn start(
        client: Client,
        ar: ApiResource,
        namespaced: bool,
        namespace: Option<String>,
        filter: EventFilter,
        on_change: Arc<dyn Fn(&DynamicObject) + Send + Sync>,
        stop: watch::Receiver<()>,
    ) -> Self {
        let store = StoreHandle::default();
        let (synced_tx, synced) = watch::channel(false);
        let task = tokio::spawn(watch_loop(
            client,
            ar,
            namespaced,
            namespace,
            filter,
            store.clone(),
            synced_tx,
            on_change,
            stop,
        ));
        Self { store, synced, task }
    }

    pub fn store(&self) -> StoreHandle {
        self.store.clone()
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait for the first complete list. Returns false if the informer
    /// stopped before syncing.
    pub async fn wait_synced(&self) -> bool {
        let mut rx = self.synced.clone();
        loop {
            if *rx.borrow() {
                return true;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

impl Drop for Informer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch_loop(
    client: Client,
    ar: ApiResource,
    namespaced: bool,
    namespace: Option<String>,
    filter: EventFilter,
    store: StoreHandle,
    synced_tx: watch::Sender<bool>,
    on_change: Arc<dyn Fn(&DynamicObject) + Send + Sync>,
    mut stop: watch::Receiver<()>,
) {
    let kind = ar.kind.clone();
    let relist = relist_secs();
    let backoff_max = backoff_max_secs();
    info!(kind = %kind, ns = ?namespace, relist, "informer starting");

    let mut backoff: u64 = 1;
    loop {
        let api: Api<DynamicObject> = if namespaced {
            match namespace.as_deref() {
                Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
                None => Api::all_with(client.clone(), &ar),
            }
        } else {
            Api::all_with(client.clone(), &ar)
        };

        let cfg = watcher::Config::default();
        let stream = watcher::watcher(api, cfg);
        futures::pin_mut!(stream);

        // Jittered relist: ±10%
        let jitter = ((relist as f64) * 0.1) as i64;
        let jval = if jitter > 0 {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as i64;
            let sign = if (now & 1) == 0 { 1 } else { -1 };
            (now % (jitter + 1)) * sign
        } else {
            0
        };
        let relist_actual = (relist as i64 + jval).max(1) as u64;
        let relist_timer = tokio::time::sleep(Duration::from_secs(relist_actual));
        tokio::pin!(relist_timer);
        debug!(kind = %kind, relist_actual, "watch stream opened");

        let ended = loop {
            tokio::select! {
                maybe_ev = stream.try_next() => {
                    match maybe_ev {
                        Ok(Some(Event::Applied(obj))) => apply_event(&store, filter, &on_change, obj),
                        Ok(Some(Event::Deleted(obj))) => {
                            if let Ok(key) = QualifiedName::from_obj(&obj) {
                                store.inner.write().unwrap().remove(&key);
                            }
                            on_change(&obj);
                        }
                        Ok(Some(Event::Restarted(list))) => {
                            debug!(kind = %kind, count = list.len(), "watch restart");
                            let mut fresh = FxHashMap::default();
                            for obj in &list {
                                if let Ok(key) = QualifiedName::from_obj(obj) {
                                    fresh.insert(key, obj.clone());
                                }
                            }
                            let vanished: Vec<DynamicObject> = {
                                let mut guard = store.inner.write().unwrap();
                                let gone = guard
                                    .iter()
                                    .filter(|(k, _)| !fresh.contains_key(*k))
                                    .map(|(_, v)| v.clone())
                                    .collect();
                                *guard = fresh;
                                gone
                            };
                            let _ = synced_tx.send(true);
                            for obj in &list {
                                on_change(obj);
                            }
                            for obj in &vanished {
                                on_change(obj);
                            }
                        }
                        Ok(None) => break true,
                        Err(err) => {
                            let es = err.to_string();
                            if es.contains("410") || es.to_ascii_lowercase().contains("expired") {
                                warn!(kind = %kind, error = %es, "watch stream expired (410); relisting on restart");
                            } else {
                                warn!(kind = %kind, error = %es, "watch stream error; will backoff and restart");
                            }
                            counter!("watch_errors_total", 1u64);
                            break true;
                        }
                    }
                }
                _ = &mut relist_timer => {
                    debug!(kind = %kind, "periodic relist interval reached; restarting watch");
                    counter!("relist_total", 1u64);
                    break false;
                }
                _ = stop.changed() => {
                    info!(kind = %kind, "informer stopping");
                    return;
                }
            }
        };

        if ended {
            let dur = Duration::from_secs(backoff.min(backoff_max));
            tokio::select! {
                _ = tokio::time::sleep(dur) => {}
                _ = stop.changed() => {
                    info!(kind = %kind, "informer stopping");
                    return;
                }
            }
            backoff = (backoff * 2).min(backoff_max).max(1);
        } else {
            backoff = 1;
        }
        counter!("watch_restarts_total", 1u64);
    }
}

fn apply_event(
    store: &StoreHandle,
    filter: EventFilter,
    on_change: &Arc<dyn Fn(&DynamicObject) + Send + Sync>,
    obj: DynamicObject,
) {
    let Ok(key) = QualifiedName::from_obj(&obj) else { return };
    let changed = {
        let mut guard = store.inner.write().unwrap();
        let changed = match guard.get(&key) {
            Some(prev) => semantic_changed(prev, &obj, filter),
            None => true,
        };
        guard.insert(key, obj.clone());
        changed
    };
    if changed {
        on_change(&obj);
    }
}
