//! Member-cluster registry.
//!
//! Watches `FederatedCluster` records in the federation namespace, derives
//! readiness from heartbeat freshness, tracks the primary marker, and hands
//! out clients for member clusters built from their kubeconfig secrets.
//! Consumers read an immutable `ClusterView` snapshot; membership changes
//! bump an epoch channel they can subscribe to.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::{self, Event};
use kube::{Client, Config};
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_api::FederatedCluster;
use flotilla_core::ControllerConfig;

/// Key in the cluster secret holding a kubeconfig for the member API.
const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown cluster {0:?}")]
    UnknownCluster(String),
    #[error("cluster secret {0:?} missing or lacking a {key} entry", key = KUBECONFIG_SECRET_KEY)]
    SecretMissing(String),
    #[error("cluster kubeconfig unusable: {0}")]
    BadKubeconfig(String),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub ready: bool,
    pub primary: bool,
}

/// Immutable snapshot of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterView {
    clusters: BTreeMap<String, ClusterInfo>,
}

impl ClusterView {
    pub fn new(clusters: impl IntoIterator<Item = ClusterInfo>) -> Self {
        Self { clusters: clusters.into_iter().map(|c| (c.name.clone(), c)).collect() }
    }

    pub fn get(&self, name: &str) -> Option<&ClusterInfo> {
        self.clusters.get(name)
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.clusters.keys().cloned().collect()
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.clusters.get(name).map(|c| c.ready).unwrap_or(false)
    }

    pub fn ready_names(&self) -> BTreeSet<String> {
        self.clusters.values().filter(|c| c.ready).map(|c| c.name.clone()).collect()
    }

    pub fn primary(&self) -> Option<&str> {
        self.clusters.values().find(|c| c.primary).map(|c| c.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterInfo> {
        self.clusters.values()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// Derive a view from the raw records. At most one primary survives; ties are
/// broken by name and logged.
fn build_view(
    records: &HashMap<String, FederatedCluster>,
    now: DateTime<Utc>,
    health_timeout: chrono::Duration,
) -> ClusterView {
    let mut primaries: Vec<&str> = records
        .values()
        .filter(|c| c.is_primary())
        .filter_map(|c| c.metadata.name.as_deref())
        .collect();
    primaries.sort_unstable();
    if primaries.len() > 1 {
        warn!(primaries = ?primaries, "multiple clusters marked primary; using the first");
    }
    let primary = primaries.first().copied();

    let mut clusters = BTreeMap::new();
    for (name, record) in records {
        clusters.insert(
            name.clone(),
            ClusterInfo {
                name: name.clone(),
                labels: record
                    .metadata
                    .labels
                    .clone()
                    .map(|l| l.into_iter().collect())
                    .unwrap_or_default(),
                ready: record.is_ready(now, health_timeout),
                primary: Some(name.as_str()) == primary,
            },
        );
    }
    ClusterView { clusters }
}

pub struct ClusterRegistry {
    host: Client,
    fed_namespace: String,
    health_timeout: chrono::Duration,
    view: ArcSwap<ClusterView>,
    epoch_tx: watch::Sender<u64>,
    epoch_rx: watch::Receiver<u64>,
    records: RwLock<HashMap<String, FederatedCluster>>,
    member_clients: tokio::sync::Mutex<HashMap<String, Client>>,
}

impl ClusterRegistry {
    /// Start the registry watch. The returned handle is shared by every
    /// controller; it stays valid after stop but goes stale.
    pub fn start(host: Client, config: &ControllerConfig, stop: watch::Receiver<()>) -> Arc<Self> {
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let health_timeout = chrono::Duration::from_std(config.cluster_health_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let registry = Arc::new(Self {
            host: host.clone(),
            fed_namespace: config.fed_namespace.clone(),
            health_timeout,
            view: ArcSwap::from_pointee(ClusterView::default()),
            epoch_tx,
            epoch_rx,
            records: RwLock::new(HashMap::new()),
            member_clients: tokio::sync::Mutex::new(HashMap::new()),
        });
        tokio::spawn(registry_loop(Arc::clone(&registry), stop));
        registry
    }

    /// Current membership snapshot.
    pub fn view(&self) -> Arc<ClusterView> {
        self.view.load_full()
    }

    /// Receives a bumped epoch whenever membership or readiness changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }

    pub fn primary(&self) -> Option<String> {
        self.view().primary().map(|s| s.to_string())
    }

    /// Client for a member cluster, built from its kubeconfig secret and
    /// cached until the cluster record changes.
    pub async fn member_client(&self, name: &str) -> Result<Client, RegistryError> {
        {
            let cache = self.member_clients.lock().await;
            if let Some(client) = cache.get(name) {
                return Ok(client.clone());
            }
        }
        let record = self
            .records
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCluster(name.to_string()))?;

        let secret_name = record.spec.secret_ref.name.clone();
        let secrets: Api<Secret> = Api::namespaced(self.host.clone(), &self.fed_namespace);
        let secret = secrets
            .get_opt(&secret_name)
            .await?
            .ok_or_else(|| RegistryError::SecretMissing(secret_name.clone()))?;
        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
            .map(|b| b.0.clone())
            .ok_or_else(|| RegistryError::SecretMissing(secret_name.clone()))?;

        let text = String::from_utf8(raw).map_err(|e| RegistryError::BadKubeconfig(e.to_string()))?;
        let kubeconfig: Kubeconfig =
            serde_yaml::from_str(&text).map_err(|e| RegistryError::BadKubeconfig(e.to_string()))?;
        let kube_config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| RegistryError::BadKubeconfig(e.to_string()))?;
        let client = Client::try_from(kube_config)?;

        let mut cache = self.member_clients.lock().await;
        cache.insert(name.to_string(), client.clone());
        Ok(client)
    }

    async fn record_changed(&self, name: &str) {
        self.member_clients.lock().await.remove(name);
    }

    fn publish(&self) {
        let now = Utc::now();
        let next = {
            let records = self.records.read().unwrap();
            build_view(&records, now, self.health_timeout)
        };
        let prev = self.view.load();
        if **prev != next {
            debug!(clusters = next.len(), ready = next.ready_names().len(), "cluster view updated");
            self.view.store(Arc::new(next));
            self.epoch_tx.send_modify(|e| *e += 1);
            counter!("cluster_view_updates_total", 1u64);
        }
    }
}

async fn registry_loop(registry: Arc<ClusterRegistry>, mut stop: watch::Receiver<()>) {
    let api: Api<FederatedCluster> =
        Api::namespaced(registry.host.clone(), &registry.fed_namespace);
    info!(namespace = %registry.fed_namespace, "cluster registry starting");

    // Readiness decays as heartbeats age even without record events.
    let refresh = registry
        .health_timeout
        .to_std()
        .map(|d| d / 2)
        .unwrap_or_else(|_| std::time::Duration::from_secs(30))
        .max(std::time::Duration::from_secs(5));

    let mut backoff: u64 = 1;
    loop {
        let stream = watcher::watcher(api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        let mut ticker = tokio::time::interval(refresh);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let ended = loop {
            tokio::select! {
                maybe_ev = stream.try_next() => {
                    match maybe_ev {
                        Ok(Some(Event::Applied(cluster))) => {
                            if let Some(name) = cluster.metadata.name.clone() {
                                registry.records.write().unwrap().insert(name.clone(), cluster);
                                registry.record_changed(&name).await;
                                registry.publish();
                            }
                        }
                        Ok(Some(Event::Deleted(cluster))) => {
                            if let Some(name) = cluster.metadata.name.clone() {
                                registry.records.write().unwrap().remove(&name);
                                registry.record_changed(&name).await;
                                registry.publish();
                            }
                        }
                        Ok(Some(Event::Restarted(list))) => {
                            let mut fresh = HashMap::new();
                            for cluster in list {
                                if let Some(name) = cluster.metadata.name.clone() {
                                    fresh.insert(name, cluster);
                                }
                            }
                            *registry.records.write().unwrap() = fresh;
                            registry.member_clients.lock().await.clear();
                            registry.publish();
                        }
                        Ok(None) => break true,
                        Err(err) => {
                            warn!(error = %err, "cluster watch error; will backoff and restart");
                            counter!("cluster_watch_errors_total", 1u64);
                            break true;
                        }
                    }
                }
                _ = ticker.tick() => {
                    registry.publish();
                }
                _ = stop.changed() => {
                    info!("cluster registry stopping");
                    return;
                }
            }
        };

        if ended {
            let dur = std::time::Duration::from_secs(backoff.min(30));
            tokio::select! {
                _ = tokio::time::sleep(dur) => {}
                _ = stop.changed() => return,
            }
            backoff = (backoff * 2).min(30);
        } else {
            backoff = 1;
        }
    }
}
