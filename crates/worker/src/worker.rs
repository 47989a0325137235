//! Rate-limited keyed reconcile queue.
//!
//! Keys deduplicate while queued, run serially per key and concurrently
//! across keys. Errors back off exponentially; `NeedsRecheck` re-enqueues
//! after a fixed delay.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::core::DynamicObject;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use flotilla_core::QualifiedName;

/// Result of one reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStatus {
    AllOk,
    /// Work is pending externally; run again after the recheck delay.
    NeedsRecheck,
    /// The pass failed; run again with backoff.
    Error,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub recheck_delay: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            recheck_delay: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

type BoxFut = Pin<Box<dyn Future<Output = ReconcileStatus> + Send>>;
type ReconcileFn = Arc<dyn Fn(QualifiedName) -> BoxFut + Send + Sync>;

enum Msg {
    Enqueue(QualifiedName),
    EnqueueAfter(QualifiedName, Duration),
}

/// Handle for feeding keys into a running worker. Cheap to clone.
#[derive(Clone)]
pub struct ReconcileWorker {
    name: &'static str,
    tx: mpsc::UnboundedSender<Msg>,
}

impl ReconcileWorker {
    pub fn spawn<F, Fut>(
        name: &'static str,
        opts: WorkerOptions,
        stop: watch::Receiver<()>,
        reconcile: F,
    ) -> Self
    where
        F: Fn(QualifiedName) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReconcileStatus> + Send + 'static,
    {
        let f: ReconcileFn = Arc::new(move |key| Box::pin(reconcile(key)));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(name, opts, f, tx.clone(), rx, stop));
        Self { name, tx }
    }

    pub fn enqueue(&self, key: QualifiedName) {
        if self.tx.send(Msg::Enqueue(key)).is_err() {
            debug!(worker = self.name, "enqueue after worker stop; dropping key");
        }
    }

    pub fn enqueue_after(&self, key: QualifiedName, delay: Duration) {
        if self.tx.send(Msg::EnqueueAfter(key, delay)).is_err() {
            debug!(worker = self.name, "enqueue after worker stop; dropping key");
        }
    }

    pub fn enqueue_obj(&self, obj: &DynamicObject) {
        if let Ok(key) = QualifiedName::from_obj(obj) {
            self.enqueue(key);
        }
    }
}

fn backoff_delay(opts: &WorkerOptions, attempts: u32) -> Duration {
    let exp = opts.backoff_base.saturating_mul(1u32 << attempts.min(16).saturating_sub(1));
    exp.min(opts.backoff_max)
}

async fn dispatch(
    name: &'static str,
    opts: WorkerOptions,
    reconcile: ReconcileFn,
    tx: mpsc::UnboundedSender<Msg>,
    mut rx: mpsc::UnboundedReceiver<Msg>,
    mut stop: watch::Receiver<()>,
) {
    let mut queue: VecDeque<QualifiedName> = VecDeque::new();
    let mut queued: HashSet<QualifiedName> = HashSet::new();
    let mut running: HashSet<QualifiedName> = HashSet::new();
    // Keys enqueued while their reconcile was in flight; re-run on completion.
    let mut dirty: HashSet<QualifiedName> = HashSet::new();
    let mut attempts: HashMap<QualifiedName, u32> = HashMap::new();
    let mut tasks: JoinSet<(QualifiedName, ReconcileStatus, Duration)> = JoinSet::new();

    loop {
        while running.len() < opts.concurrency {
            let Some(key) = queue.pop_front() else { break };
            queued.remove(&key);
            running.insert(key.clone());
            let fut = reconcile(key.clone());
            tasks.spawn(async move {
                let t0 = Instant::now();
                let status = fut.await;
                (key, status, t0.elapsed())
            });
        }

        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(Msg::Enqueue(key)) => {
                        if running.contains(&key) {
                            dirty.insert(key);
                        } else if queued.insert(key.clone()) {
                            queue.push_back(key);
                        }
                    }
                    Some(Msg::EnqueueAfter(key, delay)) => {
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(Msg::Enqueue(key));
                        });
                    }
                    None => break,
                }
            }
            Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                match finished {
                    Ok((key, status, elapsed)) => {
                        running.remove(&key);
                        histogram!("worker_reconcile_duration_ms", elapsed.as_secs_f64() * 1000.0, "worker" => name);
                        counter!("worker_reconcile_total", 1u64, "worker" => name);
                        match status {
                            ReconcileStatus::AllOk => {
                                attempts.remove(&key);
                            }
                            ReconcileStatus::NeedsRecheck => {
                                attempts.remove(&key);
                                let tx = tx.clone();
                                let delay = opts.recheck_delay;
                                let k = key.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    let _ = tx.send(Msg::Enqueue(k));
                                });
                            }
                            ReconcileStatus::Error => {
                                counter!("worker_reconcile_errors_total", 1u64, "worker" => name);
                                let n = attempts.entry(key.clone()).or_insert(0);
                                *n += 1;
                                let delay = backoff_delay(&opts, *n);
                                debug!(worker = name, key = %key, attempts = *n, ?delay, "reconcile error; backing off");
                                let tx = tx.clone();
                                let k = key.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    let _ = tx.send(Msg::Enqueue(k));
                                });
                            }
                        }
                        if dirty.remove(&key) && queued.insert(key.clone()) {
                            queue.push_back(key);
                        }
                    }
                    Err(err) => {
                        // A panicked reconcile loses its key until the next
                        // informer event re-enqueues it.
                        warn!(worker = name, error = %err, "reconcile task failed");
                    }
                }
            }
            _ = stop.changed() => {
                tasks.abort_all();
                break;
            }
        }
    }
    debug!(worker = name, "worker stopped");
}
