//! Federated-object status: condition + per-cluster entries.
//!
//! The sync controller never writes status inline; it publishes immutable
//! snapshots onto a channel consumed by a single writer task, which performs
//! idempotent status-subresource updates.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use flotilla_api::{
    GenericClusterStatus, GenericCondition, GenericFederatedStatus, PropagationStatus,
    PROPAGATION_CONDITION,
};
use flotilla_client::ResourceClient;
use flotilla_core::QualifiedName;

/// Immutable result of one reconcile pass, handed to the status writer.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub key: QualifiedName,
    /// `metadata.generation` at reconcile start.
    pub generation: i64,
    pub outcomes: Vec<(String, PropagationStatus)>,
}

fn condition_reason(outcomes: &[(String, PropagationStatus)]) -> Option<String> {
    let failed = outcomes
        .iter()
        .any(|(_, s)| matches!(s, PropagationStatus::Failed | PropagationStatus::TimedOut));
    if failed {
        Some("PropagationFailed".to_string())
    } else {
        Some("PropagationPending".to_string())
    }
}

/// Roll up per-cluster outcomes into the status to write. `remoteStatus`
/// collected by the status controller is carried over for clusters that are
/// still listed.
pub fn build_status(
    prev: Option<&GenericFederatedStatus>,
    snap: &StatusSnapshot,
    now: DateTime<Utc>,
) -> GenericFederatedStatus {
    let mut outcomes = snap.outcomes.clone();
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));

    let clusters: Vec<GenericClusterStatus> = outcomes
        .iter()
        .map(|(name, status)| GenericClusterStatus {
            name: name.clone(),
            status: *status,
            remote_status: prev
                .and_then(|p| p.clusters.iter().find(|c| &c.name == name))
                .and_then(|c| c.remote_status.clone()),
        })
        .collect();

    // True iff every selected cluster is Ok and none is waiting; an empty
    // placement has nothing left to propagate.
    let propagated = outcomes.iter().all(|(_, s)| *s == PropagationStatus::Ok);
    let status_str = if propagated { "True" } else { "False" };
    let prev_condition =
        prev.and_then(|p| p.conditions.iter().find(|c| c.type_ == PROPAGATION_CONDITION));
    let last_transition_time = match prev_condition {
        Some(c) if c.status == status_str => c.last_transition_time,
        _ => Some(now),
    };

    GenericFederatedStatus {
        observed_generation: snap.generation,
        conditions: vec![GenericCondition {
            type_: PROPAGATION_CONDITION.to_string(),
            status: status_str.to_string(),
            reason: if propagated { None } else { condition_reason(&outcomes) },
            message: None,
            last_transition_time,
        }],
        clusters,
    }
}

/// Deep equality modulo condition timestamps; used to skip no-op writes.
pub fn equal_ignoring_timestamps(a: &GenericFederatedStatus, b: &GenericFederatedStatus) -> bool {
    let strip = |s: &GenericFederatedStatus| {
        let mut s = s.clone();
        for c in &mut s.conditions {
            c.last_transition_time = None;
        }
        s
    };
    strip(a) == strip(b)
}

pub fn parse_status(obj: &kube::core::DynamicObject) -> Option<GenericFederatedStatus> {
    obj.data.get("status").and_then(|v| serde_json::from_value(v.clone()).ok())
}

async fn write_status(fed_client: &ResourceClient, snap: &StatusSnapshot) {
    for attempt in 0..2 {
        let current = match fed_client.get(&snap.key).await {
            Ok(Some(obj)) => obj,
            Ok(None) => return,
            Err(err) => {
                warn!(key = %snap.key, error = %err, "fetching federated object for status write failed");
                return;
            }
        };
        let prev = parse_status(&current);
        let next = build_status(prev.as_ref(), snap, Utc::now());
        if prev.as_ref().map(|p| equal_ignoring_timestamps(p, &next)).unwrap_or(false) {
            debug!(key = %snap.key, "status unchanged; skipping write");
            return;
        }

        let mut updated = current;
        match serde_json::to_value(&next) {
            Ok(v) => {
                if let Some(map) = updated.data.as_object_mut() {
                    map.insert("status".to_string(), v);
                }
            }
            Err(err) => {
                warn!(key = %snap.key, error = %err, "serializing status failed");
                return;
            }
        }
        match fed_client.update_status(&updated).await {
            Ok(_) => return,
            Err(err) if err.is_conflict() && attempt == 0 => continue,
            Err(err) if err.is_not_found() => return,
            Err(err) => {
                warn!(key = %snap.key, error = %err, "status write failed");
                return;
            }
        }
    }
}

/// Consume snapshots until the channel closes or stop fires.
pub fn spawn_status_writer(
    fed_client: ResourceClient,
    mut rx: mpsc::Receiver<StatusSnapshot>,
    mut stop: watch::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                snap = rx.recv() => {
                    match snap {
                        Some(snap) => write_status(&fed_client, &snap).await,
                        None => break,
                    }
                }
                _ = stop.changed() => break,
            }
        }
        debug!("status writer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(outcomes: &[(&str, PropagationStatus)]) -> StatusSnapshot {
        StatusSnapshot {
            key: QualifiedName::new(Some("ns"), "f"),
            generation: 3,
            outcomes: outcomes.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
        }
    }

    #[test]
    fn all_ok_yields_true_condition() {
        let now = Utc::now();
        let status = build_status(
            None,
            &snap(&[("c1", PropagationStatus::Ok), ("c2", PropagationStatus::Ok)]),
            now,
        );
        assert_eq!(status.observed_generation, 3);
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, "True");
        assert_eq!(status.conditions[0].reason, None);
        assert_eq!(status.clusters.len(), 2);
    }

    #[test]
    fn waiting_or_failed_clusters_make_it_false() {
        let now = Utc::now();
        let status = build_status(
            None,
            &snap(&[("c1", PropagationStatus::Ok), ("c2", PropagationStatus::WaitingForRemoval)]),
            now,
        );
        assert_eq!(status.conditions[0].status, "False");
        assert_eq!(status.conditions[0].reason.as_deref(), Some("PropagationPending"));

        let status =
            build_status(None, &snap(&[("c1", PropagationStatus::Failed)]), now);
        assert_eq!(status.conditions[0].reason.as_deref(), Some("PropagationFailed"));
    }

    #[test]
    fn transition_time_is_preserved_when_status_is_stable() {
        let t0 = Utc::now() - chrono::Duration::seconds(300);
        let first = build_status(
            None,
            &snap(&[("c1", PropagationStatus::Ok)]),
            t0,
        );
        assert_eq!(first.conditions[0].last_transition_time, Some(t0));

        let second = build_status(Some(&first), &snap(&[("c1", PropagationStatus::Ok)]), Utc::now());
        assert_eq!(second.conditions[0].last_transition_time, Some(t0));

        let flipped = build_status(
            Some(&first),
            &snap(&[("c1", PropagationStatus::Failed)]),
            Utc::now(),
        );
        assert_ne!(flipped.conditions[0].last_transition_time, Some(t0));
    }

    #[test]
    fn remote_status_is_carried_over() {
        let mut prev = build_status(None, &snap(&[("c1", PropagationStatus::Ok)]), Utc::now());
        prev.clusters[0].remote_status = Some(serde_json::json!({"readyReplicas": 2}));

        let next = build_status(Some(&prev), &snap(&[("c1", PropagationStatus::Ok)]), Utc::now());
        assert_eq!(next.clusters[0].remote_status, Some(serde_json::json!({"readyReplicas": 2})));

        // Entries for clusters no longer reported drop their remote status.
        let shrunk = build_status(Some(&prev), &snap(&[("c2", PropagationStatus::Ok)]), Utc::now());
        assert_eq!(shrunk.clusters[0].remote_status, None);
    }

    #[test]
    fn idempotence_check_ignores_timestamps() {
        let a = build_status(None, &snap(&[("c1", PropagationStatus::Ok)]), Utc::now());
        let b = build_status(
            None,
            &snap(&[("c1", PropagationStatus::Ok)]),
            Utc::now() + chrono::Duration::seconds(60),
        );
        assert!(equal_ignoring_timestamps(&a, &b));

        let c = build_status(None, &snap(&[("c1", PropagationStatus::Failed)]), Utc::now());
        assert!(!equal_ignoring_timestamps(&a, &c));
    }
}
