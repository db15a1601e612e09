use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use gotong_core::NodeId;
use gotong_logistics::{LinkOptions, LinkState, PeerLink};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// What every server node periodically broadcasts on the announce channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub cluster: String,
    pub host: String,
    pub port: u16,
}

impl Announcement {
    pub fn node_id(&self) -> NodeId {
        NodeId::from_host_port(&self.host, self.port)
    }
}

/// A peer changed connectivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessEvent {
    pub peer: NodeId,
    pub state: LinkState,
}

struct TrackedPeer {
    link: Arc<PeerLink>,
    watcher: JoinHandle<()>,
}

/// Links to every server discovered in the cluster, keyed by node id.
///
/// Peers stay tracked while down so that a reconnect shows up as a state
/// transition of a known peer rather than as a new one. Transitions are
/// forwarded as [`LivenessEvent`]s to the receiver returned by
/// [`PeerRegistry::new`].
pub struct PeerRegistry {
    cluster: String,
    own_id: NodeId,
    options: LinkOptions,
    peers: Mutex<HashMap<NodeId, TrackedPeer>>,
    events: mpsc::UnboundedSender<LivenessEvent>,
    closed: AtomicBool,
}

impl PeerRegistry {
    pub fn new(
        cluster: impl Into<String>,
        own_id: NodeId,
        options: LinkOptions,
    ) -> (Self, mpsc::UnboundedReceiver<LivenessEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let registry = Self {
            cluster: cluster.into(),
            own_id,
            options,
            peers: Mutex::new(HashMap::new()),
            events,
            closed: AtomicBool::new(false),
        };
        (registry, receiver)
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<NodeId, TrackedPeer>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tracks the sender of an announcement.
    ///
    /// Malformed payloads, other clusters, this node itself and peers
    /// already tracked are ignored. Returns the id of a newly tracked peer.
    pub fn handle_announcement(&self, payload: &str) -> Option<NodeId> {
        let announcement: Announcement = serde_json::from_str(payload).ok()?;
        if announcement.cluster != self.cluster || announcement.host.is_empty() {
            return None;
        }
        let peer = announcement.node_id();
        self.track(peer.clone()).then_some(peer)
    }

    /// Starts a link to `peer` unless it is this node or already tracked.
    /// Must be called within a Tokio runtime.
    pub fn track(&self, peer: NodeId) -> bool {
        if peer == self.own_id || self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut peers = self.peers();
        if peers.contains_key(&peer) {
            return false;
        }

        debug!(cluster = %self.cluster, %peer, "discovered peer");
        let link = Arc::new(PeerLink::connect(peer.clone(), self.options.clone()));
        let watcher = tokio::spawn(forward_liveness(
            peer.clone(),
            link.subscribe(),
            self.events.clone(),
        ));
        peers.insert(peer, TrackedPeer { link, watcher });
        true
    }

    pub fn get(&self, peer: &NodeId) -> Option<Arc<PeerLink>> {
        self.peers().get(peer).map(|tracked| Arc::clone(&tracked.link))
    }

    pub fn state(&self, peer: &NodeId) -> Option<LinkState> {
        self.peers().get(peer).map(|tracked| tracked.link.state())
    }

    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Links currently connected.
    pub fn up_links(&self) -> Vec<Arc<PeerLink>> {
        self.peers()
            .values()
            .filter(|tracked| tracked.link.is_up())
            .map(|tracked| Arc::clone(&tracked.link))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers().is_empty()
    }

    /// Stops watching every peer, then closes every link. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let tracked: Vec<TrackedPeer> = self.peers().drain().map(|(_, tracked)| tracked).collect();

        // Watchers go first so that teardown does not report peers as down.
        let links: Vec<Arc<PeerLink>> = tracked
            .into_iter()
            .map(|tracked| {
                tracked.watcher.abort();
                tracked.link
            })
            .collect();
        join_all(links.iter().map(|link| link.close())).await;
    }
}

async fn forward_liveness(
    peer: NodeId,
    mut state: watch::Receiver<LinkState>,
    events: mpsc::UnboundedSender<LivenessEvent>,
) {
    let mut last = *state.borrow_and_update();
    while state.changed().await.is_ok() {
        let next = *state.borrow_and_update();
        if next == last {
            continue;
        }
        last = next;
        let event = LivenessEvent {
            peer: peer.clone(),
            state: next,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry(own_port: u16) -> PeerRegistry {
        let own = NodeId::from_host_port("127.0.0.1", own_port);
        PeerRegistry::new("test-cluster", own, LinkOptions::default()).0
    }

    #[tokio::test]
    async fn test_announcements_are_filtered() {
        let peers = registry(1);

        assert_eq!(peers.handle_announcement("not json"), None);
        let other = json!({ "cluster": "elsewhere", "host": "127.0.0.1", "port": 2 });
        assert_eq!(peers.handle_announcement(&other.to_string()), None);
        let own = json!({ "cluster": "test-cluster", "host": "127.0.0.1", "port": 1 });
        assert_eq!(peers.handle_announcement(&own.to_string()), None);

        let fresh = json!({ "cluster": "test-cluster", "host": "127.0.0.1", "port": 2 });
        assert_eq!(
            peers.handle_announcement(&fresh.to_string()),
            Some(NodeId::from("127.0.0.1:2"))
        );
        assert_eq!(peers.handle_announcement(&fresh.to_string()), None);
        assert_eq!(peers.len(), 1);

        peers.close().await;
        assert!(peers.is_empty());
        assert!(!peers.track(NodeId::from("127.0.0.1:3")));
    }

    #[tokio::test]
    async fn test_unreachable_peer_stays_tracked_and_down() {
        let peers = registry(1);
        assert!(peers.track(NodeId::from("127.0.0.1:9")));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(peers.state(&NodeId::from("127.0.0.1:9")), Some(LinkState::Down));
        assert!(peers.up_links().is_empty());
        assert_eq!(peers.ids(), vec![NodeId::from("127.0.0.1:9")]);
        peers.close().await;
    }
}
