use std::sync::Arc;

use async_trait::async_trait;
use gotong_core::{ClusterError, NodeId, ResourceKey, Value};
use gotong_lease::{KeySpace, SharedStore};
use tracing::{debug, info, warn};

use crate::store::SNAPSHOT_FIELD;

/// Takes ownership of a resource whose previous owner went away.
#[async_trait]
pub trait Reclaim: Send + Sync {
    async fn reclaim(&self, key: &ResourceKey, snapshot: Value) -> Result<Value, ClusterError>;
}

/// Outcome of one scavenge pass over a dead peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScavengeReport {
    pub reclaimed: usize,
    /// Ids popped without a snapshot, usually because it expired.
    pub skipped: usize,
    pub failed: usize,
}

/// Walks the ownership records a dead peer published and reclaims them.
///
/// Ids are popped from the dead peer's ownership sets, so when several
/// nodes scavenge the same peer each id is reclaimed by only one of them.
pub struct Scavenger {
    shared: Arc<dyn SharedStore>,
    keys: KeySpace,
    resource_types: Vec<String>,
}

impl Scavenger {
    pub fn new(shared: Arc<dyn SharedStore>, keys: KeySpace, resource_types: Vec<String>) -> Self {
        Self {
            shared,
            keys,
            resource_types,
        }
    }

    pub async fn scavenge(&self, dead: &NodeId, reclaimer: &dyn Reclaim) -> ScavengeReport {
        let mut report = ScavengeReport::default();
        for resource_type in &self.resource_types {
            self.scavenge_type(dead, resource_type, reclaimer, &mut report)
                .await;
        }
        if report != ScavengeReport::default() {
            info!(
                peer = %dead,
                reclaimed = report.reclaimed,
                skipped = report.skipped,
                failed = report.failed,
                "scavenged resources of dead peer"
            );
        }
        report
    }

    async fn scavenge_type(
        &self,
        dead: &NodeId,
        resource_type: &str,
        reclaimer: &dyn Reclaim,
        report: &mut ScavengeReport,
    ) {
        let set = self.keys.ownership_set(dead, resource_type);
        loop {
            let resource_id = match self.shared.set_pop(&set).await {
                Ok(Some(resource_id)) => resource_id,
                Ok(None) => break,
                Err(err) => {
                    warn!(peer = %dead, resource_type, %err, "failed to pop ownership set");
                    report.failed += 1;
                    break;
                }
            };

            match self.reclaim_one(dead, resource_type, &resource_id, reclaimer).await {
                Ok(true) => report.reclaimed += 1,
                Ok(false) => {
                    debug!(peer = %dead, resource_type, %resource_id, "no snapshot, skipping");
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(
                        peer = %dead,
                        resource_type,
                        %resource_id,
                        %err,
                        "failed to reclaim resource"
                    );
                    report.failed += 1;
                }
            }
        }
    }

    /// `Ok(false)` when the dead peer left no snapshot for the id.
    async fn reclaim_one(
        &self,
        dead: &NodeId,
        resource_type: &str,
        resource_id: &str,
        reclaimer: &dyn Reclaim,
    ) -> Result<bool, ClusterError> {
        let key = ResourceKey::new(resource_type, resource_id)?;
        let hash = self.keys.snapshot(dead, resource_type, resource_id);
        let Some(raw) = self.shared.hash_read(&hash).await?.remove(SNAPSHOT_FIELD) else {
            return Ok(false);
        };
        let snapshot: Value = serde_json::from_str(&raw)
            .map_err(|err| ClusterError::internal(format!("corrupt snapshot for {key}: {err}")))?;

        reclaimer.reclaim(&key, snapshot).await?;
        self.shared.delete(&hash).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gotong_lease::MemoryStore;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Reclaim for Recorder {
        async fn reclaim(&self, key: &ResourceKey, snapshot: Value) -> Result<Value, ClusterError> {
            if key.resource_id() == "broken" {
                return Err(ClusterError::internal("cannot restore"));
            }
            self.seen
                .lock()
                .unwrap()
                .push((key.to_string(), snapshot.clone()));
            Ok(snapshot)
        }
    }

    #[tokio::test]
    async fn test_scavenge_takes_every_record_once() {
        let shared = MemoryStore::new();
        let keys = KeySpace::new("test-cluster");
        let dead = NodeId::from("127.0.0.1:8000");
        let set = keys.ownership_set(&dead, "Ticker");
        for id in ["a", "b", "gone", "broken"] {
            shared.set_add(&set, id).await.unwrap();
        }
        for id in ["a", "b", "broken"] {
            let snapshot = json!({ "increment": 2, "ticks": id.len() });
            shared
                .hash_write(
                    &keys.snapshot(&dead, "Ticker", id),
                    &[(SNAPSHOT_FIELD.to_string(), snapshot.to_string())],
                )
                .await
                .unwrap();
        }

        let scavenger =
            Scavenger::new(Arc::new(shared.clone()), keys.clone(), vec!["Ticker".into()]);
        let recorder = Recorder::default();
        let report = scavenger.scavenge(&dead, &recorder).await;

        assert_eq!(
            report,
            ScavengeReport {
                reclaimed: 2,
                skipped: 1,
                failed: 1
            }
        );
        let mut seen = recorder.seen.lock().unwrap().clone();
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(seen[0], ("Ticker~a".to_string(), json!({ "increment": 2, "ticks": 1 })));
        assert!(shared.set_members(&set).await.unwrap().is_empty());
        assert!(shared.hash_read(&keys.snapshot(&dead, "Ticker", "a")).await.unwrap().is_empty());

        // A second pass finds nothing left to take.
        let again = scavenger.scavenge(&dead, &recorder).await;
        assert_eq!(again, ScavengeReport::default());
    }
}
