#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flotilla_core::QualifiedName;
use flotilla_worker::{ReconcileStatus, ReconcileWorker, WorkerOptions};
use tokio::sync::watch;

fn key(n: &str) -> QualifiedName {
    QualifiedName::new(Some("ns"), n)
}

fn fast_opts() -> WorkerOptions {
    WorkerOptions {
        concurrency: 4,
        recheck_delay: Duration::from_millis(50),
        backoff_base: Duration::from_millis(20),
        backoff_max: Duration::from_millis(200),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_keys_deduplicate() {
    let calls = Arc::new(AtomicU32::new(0));
    let (_stop_tx, stop_rx) = watch::channel(());
    let worker = {
        let calls = Arc::clone(&calls);
        ReconcileWorker::spawn("dedup", fast_opts(), stop_rx, move |_key| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                ReconcileStatus::AllOk
            }
        })
    };

    // One key may start immediately; the rest must coalesce behind it.
    for _ in 0..10 {
        worker.enqueue(key("a"));
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    let n = calls.load(Ordering::SeqCst);
    assert!(n <= 2, "expected at most 2 runs for a burst of duplicates, got {}", n);
    assert!(n >= 1, "expected the key to be reconciled at least once");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_key_serial_cross_key_concurrent() {
    // Track concurrent executions per key; any overlap is a bug.
    let in_flight: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let max_overlap = Arc::new(AtomicU32::new(0));
    let max_total = Arc::new(AtomicU32::new(0));
    let total = Arc::new(AtomicU32::new(0));

    let (_stop_tx, stop_rx) = watch::channel(());
    let worker = {
        let in_flight = Arc::clone(&in_flight);
        let max_overlap = Arc::clone(&max_overlap);
        let max_total = Arc::clone(&max_total);
        let total = Arc::clone(&total);
        ReconcileWorker::spawn("serial", fast_opts(), stop_rx, move |key| {
            let in_flight = Arc::clone(&in_flight);
            let max_overlap = Arc::clone(&max_overlap);
            let max_total = Arc::clone(&max_total);
            let total = Arc::clone(&total);
            async move {
                {
                    let mut guard = in_flight.lock().unwrap();
                    let slot = guard.entry(key.name.clone()).or_insert(0);
                    *slot += 1;
                    max_overlap.fetch_max(*slot, Ordering::SeqCst);
                    let running: u32 = guard.values().sum();
                    max_total.fetch_max(running, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(30)).await;
                {
                    let mut guard = in_flight.lock().unwrap();
                    *guard.get_mut(&key.name).unwrap() -= 1;
                }
                total.fetch_add(1, Ordering::SeqCst);
                ReconcileStatus::AllOk
            }
        })
    };

    for round in 0..3 {
        for name in ["a", "b", "c", "d"] {
            worker.enqueue(key(name));
        }
        tokio::time::sleep(Duration::from_millis(20 * (round + 1))).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(max_overlap.load(Ordering::SeqCst), 1, "a key must never run concurrently with itself");
    assert!(max_total.load(Ordering::SeqCst) > 1, "distinct keys should run concurrently");
    assert!(total.load(Ordering::SeqCst) >= 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn errors_back_off_and_retry() {
    let calls = Arc::new(AtomicU32::new(0));
    let (_stop_tx, stop_rx) = watch::channel(());
    let _worker = {
        let calls = Arc::clone(&calls);
        let w = ReconcileWorker::spawn("backoff", fast_opts(), stop_rx, move |_key| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    ReconcileStatus::Error
                } else {
                    ReconcileStatus::AllOk
                }
            }
        });
        w.enqueue(key("x"));
        w
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    let n = calls.load(Ordering::SeqCst);
    assert!(n >= 3, "two failures should be retried until success, got {} calls", n);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn needs_recheck_reenqueues_after_delay() {
    let calls = Arc::new(AtomicU32::new(0));
    let (_stop_tx, stop_rx) = watch::channel(());
    let worker = {
        let calls = Arc::clone(&calls);
        ReconcileWorker::spawn("recheck", fast_opts(), stop_rx, move |_key| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ReconcileStatus::NeedsRecheck
            }
        })
    };
    worker.enqueue(key("x"));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let n = calls.load(Ordering::SeqCst);
    assert!(n >= 2, "NeedsRecheck should re-run the key, got {} calls", n);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enqueue_after_delays_the_first_run() {
    let calls = Arc::new(AtomicU32::new(0));
    let (_stop_tx, stop_rx) = watch::channel(());
    let worker = {
        let calls = Arc::clone(&calls);
        ReconcileWorker::spawn("delayed", fast_opts(), stop_rx, move |_key| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ReconcileStatus::AllOk
            }
        })
    };
    worker.enqueue_after(key("x"), Duration::from_millis(150));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0, "key ran before its delay elapsed");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(calls.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_rejects_new_work() {
    let calls = Arc::new(AtomicU32::new(0));
    let (stop_tx, stop_rx) = watch::channel(());
    let worker = {
        let calls = Arc::clone(&calls);
        ReconcileWorker::spawn("stop", fast_opts(), stop_rx, move |_key| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ReconcileStatus::AllOk
            }
        })
    };
    drop(stop_tx);
    tokio::time::sleep(Duration::from_millis(50)).await;
    worker.enqueue(key("x"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0, "stopped worker must not run new keys");
}
