use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use gotong_core::{ClusterError, NodeId, ResourceKey, Value};
use gotong_lease::{DistributedCoordinator, KeySpace, LockOptions, SharedStore, Subscription};
use gotong_logistics::{LinkState, MethodTable, RpcListener, RpcServer};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::GotongError;
use crate::config::NodeConfig;
use crate::peers::{Announcement, LivenessEvent, PeerRegistry};
use crate::registry::{ResourceRegistry, StoreContext};
use crate::scavenger::{Reclaim, ScavengeReport, Scavenger};
use crate::store::ResourceHolder;

/// Remote method answering from the local store only.
pub const HAS_RESOURCE: &str = "hasResource";
/// Remote method invoking a live local instance.
pub const INVOKE: &str = "invoke";

/// Parameters of both remote methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceCall {
    resource_id: String,
    resource_type: String,
    #[serde(default)]
    args: Value,
}

impl ResourceCall {
    fn new(key: &ResourceKey, args: Value) -> Self {
        Self {
            resource_id: key.resource_id().to_string(),
            resource_type: key.resource_type().to_string(),
            args,
        }
    }

    fn into_params(self) -> Result<Value, ClusterError> {
        serde_json::to_value(self).map_err(|err| ClusterError::internal(err.to_string()))
    }

    fn from_params(params: Value) -> Result<Self, ClusterError> {
        serde_json::from_value(params)
            .map_err(|err| ClusterError::InvalidArgument(format!("malformed resource call: {err}")))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One member of a cluster: coordinates where each resource lives.
///
/// A node answers acquisitions from its local stores, otherwise takes the
/// cluster-wide lock for the resource, asks every connected peer and only
/// creates the resource locally when no peer holds it. Server nodes host
/// resources and serve peer calls; peer nodes discover servers and query
/// them. When a peer goes down, a hosting node scavenges the resources that
/// peer had published.
pub struct ClusterNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    id: NodeId,
    keys: KeySpace,
    shared: Arc<dyn SharedStore>,
    resources: ResourceRegistry,
    stores: Mutex<HashMap<String, Arc<dyn ResourceHolder>>>,
    coordinator: DistributedCoordinator,
    peers: PeerRegistry,
    server: Option<RpcServer>,
    scavenger: Scavenger,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ClusterNode {
    /// Binds the server (if configured), starts announcing it and starts
    /// discovering peers (if configured).
    pub async fn start(config: NodeConfig) -> Result<Self, GotongError> {
        let listener = match &config.server {
            Some(server) => Some(RpcListener::bind(&server.host, server.port).await?),
            None => None,
        };
        let announcement = match (&config.server, &listener) {
            (Some(server), Some(listener)) => Some(Announcement {
                cluster: config.cluster.clone(),
                host: server.host.clone(),
                port: listener.local_addr()?.port(),
            }),
            _ => None,
        };
        let id = match &listener {
            Some(listener) => listener.id().clone(),
            None => NodeId::new(format!("peer-{:016x}", rand::random::<u64>())),
        };

        let keys = config.keys();
        let shared = config.store.open().await?;
        let coordinator = DistributedCoordinator::new(
            Arc::clone(&shared),
            keys.clone(),
            id.as_str(),
            LockOptions::new(config.pubsub_channel.clone()).with_timeout(config.lock_timeout),
        );
        let (peers, liveness) =
            PeerRegistry::new(config.cluster.clone(), id.clone(), config.link_options());
        let scavenger = Scavenger::new(
            Arc::clone(&shared),
            keys.clone(),
            config.resources.names().map(str::to_string).collect(),
        );
        let announcements = match config.peer {
            Some(_) => Some(shared.subscribe(&keys.announce_channel()).await?),
            None => None,
        };

        let inner = Arc::new_cyclic(|node: &Weak<NodeInner>| NodeInner {
            server: listener.map(|listener| listener.serve(remote_methods(node.clone()))),
            id,
            keys,
            shared,
            resources: config.resources,
            stores: Mutex::new(HashMap::new()),
            coordinator,
            peers,
            scavenger,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let mut tasks = Vec::new();
        if let Some(announcement) = announcement {
            let payload = serde_json::to_string(&announcement)
                .map_err(|err| ClusterError::internal(err.to_string()))?;
            tasks.push(tokio::spawn(announce(
                Arc::clone(&inner.shared),
                inner.keys.announce_channel(),
                payload,
                config.announce_interval,
            )));
        }
        if let Some(announcements) = announcements {
            tasks.push(tokio::spawn(discover(Arc::downgrade(&inner), announcements)));
        }
        tasks.push(tokio::spawn(watch_peers(Arc::downgrade(&inner), liveness)));
        *lock(&inner.tasks) = tasks;

        if inner.server.is_some() && inner.resources.is_empty() {
            warn!(node_id = %inner.id, "hosting node has no registered resource types");
        }
        info!(
            cluster = %inner.keys.cluster(),
            node_id = %inner.id,
            server = inner.server.is_some(),
            peer = config.peer.is_some(),
            resource_types = inner.resources.len(),
            "node started"
        );
        Ok(Self { inner })
    }

    /// `host:port` of this node's server, or a random `peer-` id.
    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    pub fn cluster(&self) -> &str {
        self.inner.keys.cluster()
    }

    /// Whether this node runs a server and can hold resources.
    pub fn is_hosting(&self) -> bool {
        self.inner.server.is_some()
    }

    /// Returns the resource's snapshot, creating it on this node when
    /// neither this node nor any peer holds it.
    ///
    /// Concurrent acquisitions of one resource, here or on other nodes,
    /// share a single creation attempt.
    pub async fn acquire_resource(
        &self,
        resource_id: &str,
        resource_type: &str,
        create_args: Value,
        get_args: Value,
    ) -> Result<Value, ClusterError> {
        let key = ResourceKey::new(resource_type, resource_id)?;
        self.inner.acquire(key, create_args, get_args).await
    }

    /// Answers from the local store only; `NotFound` otherwise.
    pub async fn has_resource(
        &self,
        resource_id: &str,
        resource_type: &str,
        args: Value,
    ) -> Result<Value, ClusterError> {
        self.inner.has_resource(resource_id, resource_type, args).await
    }

    /// Creates (or updates) the resource on this node without coordination.
    pub async fn create_resource(
        &self,
        resource_id: &str,
        resource_type: &str,
        args: Value,
    ) -> Result<(), ClusterError> {
        self.inner.create_resource(resource_id, resource_type, args).await
    }

    /// Invokes the live local instance. Never asks peers.
    pub async fn invoke(
        &self,
        resource_id: &str,
        resource_type: &str,
        args: Value,
    ) -> Result<Value, ClusterError> {
        self.inner.invoke(resource_id, resource_type, args).await
    }

    /// Invokes the resource on `owner`, locally when that is this node.
    pub async fn call_resource(
        &self,
        owner: &NodeId,
        resource_id: &str,
        resource_type: &str,
        args: Value,
    ) -> Result<Value, ClusterError> {
        if *owner == self.inner.id {
            return self.invoke(resource_id, resource_type, args).await;
        }
        self.redirect_request(owner, resource_id, resource_type, args)
            .await
    }

    /// Invokes the resource on `peer`.
    ///
    /// Fails with `Uninitialized` when the peer is unknown or goes down
    /// before answering. Never retried, since invocations may not be
    /// idempotent.
    pub async fn redirect_request(
        &self,
        peer: &NodeId,
        resource_id: &str,
        resource_type: &str,
        args: Value,
    ) -> Result<Value, ClusterError> {
        let key = ResourceKey::new(resource_type, resource_id)?;
        self.inner.redirect_request(peer, &key, args).await
    }

    /// Asks every connected peer; the first one holding the resource wins.
    pub async fn ask_peers(
        &self,
        resource_id: &str,
        resource_type: &str,
        args: Value,
    ) -> Result<Value, ClusterError> {
        let key = ResourceKey::new(resource_type, resource_id)?;
        self.inner.ask_peers(&key, args).await
    }

    /// Reclaims what `dead` published, as done when a peer goes down.
    pub async fn scavenge(&self, dead: &NodeId) -> ScavengeReport {
        self.inner.scavenge(dead).await
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.inner.peers.ids()
    }

    pub fn peer_state(&self, peer: &NodeId) -> Option<LinkState> {
        self.inner.peers.state(peer)
    }

    /// Inbound peer connections, or `None` for peer-only nodes.
    pub fn server_client_count(&self) -> Option<usize> {
        self.inner.server.as_ref().map(RpcServer::client_count)
    }

    /// Stops announcing, closes every store, peer link and the server, then
    /// disconnects from the shared store.
    ///
    /// Every step runs even when an earlier one fails; the first error is
    /// returned. Later calls return `Ok(())` immediately.
    pub async fn close(&self) -> Result<(), GotongError> {
        let node = &self.inner;
        if node.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        node.abort_tasks();

        let stores: Vec<Arc<dyn ResourceHolder>> =
            lock(&node.stores).drain().map(|(_, store)| store).collect();
        let close_stores = async {
            join_all(stores.iter().map(|store| store.close()))
                .await
                .into_iter()
                .find_map(Result::err)
        };
        let close_server = async {
            if let Some(server) = &node.server {
                server.close().await;
            }
        };
        let (store_error, (), ()) = tokio::join!(close_stores, node.peers.close(), close_server);
        let shared = node.shared.close().await;
        info!(node_id = %node.id, "node closed");

        match store_error {
            Some(err) => Err(err.into()),
            None => Ok(shared?),
        }
    }
}

impl NodeInner {
    fn store(&self, resource_type: &str) -> Option<Arc<dyn ResourceHolder>> {
        lock(&self.stores).get(resource_type).cloned()
    }

    /// Returns the store for `resource_type`, building it on first use.
    fn store_or_build(&self, resource_type: &str) -> Result<Arc<dyn ResourceHolder>, ClusterError> {
        if self.server.is_none() {
            return Err(ClusterError::uninitialized(format!(
                "peer node {} does not host resources",
                self.id
            )));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClusterError::uninitialized(format!("node {} is closed", self.id)));
        }
        let definition = self
            .resources
            .get(resource_type)
            .ok_or_else(|| ClusterError::ResourceTypeUnregistered(resource_type.to_string()))?;

        let mut stores = lock(&self.stores);
        let store = stores.entry(resource_type.to_string()).or_insert_with(|| {
            debug!(
                node_id = %self.id,
                resource_type,
                ttl = ?definition.options().time_to_live,
                "building resource store"
            );
            definition.build_store(
                resource_type,
                StoreContext {
                    node: self.id.clone(),
                    keys: self.keys.clone(),
                    shared: Arc::clone(&self.shared),
                },
            )
        });
        Ok(Arc::clone(store))
    }

    async fn has_resource(
        &self,
        resource_id: &str,
        resource_type: &str,
        args: Value,
    ) -> Result<Value, ClusterError> {
        match self.store(resource_type) {
            Some(store) => store.get(resource_id, args).await,
            None => {
                debug!(node_id = %self.id, resource_type, "resource type not found on node");
                Err(ClusterError::not_found(format!(
                    "resource {resource_type} not found on node {}",
                    self.id
                )))
            }
        }
    }

    async fn create_resource(
        &self,
        resource_id: &str,
        resource_type: &str,
        args: Value,
    ) -> Result<(), ClusterError> {
        self.store_or_build(resource_type)?
            .create(resource_id, args)
            .await
    }

    async fn invoke(
        &self,
        resource_id: &str,
        resource_type: &str,
        args: Value,
    ) -> Result<Value, ClusterError> {
        debug!(node_id = %self.id, resource_type, resource_id, "invoke called");
        let store = self.store(resource_type).ok_or_else(|| {
            ClusterError::uninitialized(format!("resource {resource_type} not initialized"))
        })?;
        store.invoke(resource_id, args).await
    }

    async fn acquire(
        self: &Arc<Self>,
        key: ResourceKey,
        create_args: Value,
        get_args: Value,
    ) -> Result<Value, ClusterError> {
        match self
            .has_resource(key.resource_id(), key.resource_type(), get_args.clone())
            .await
        {
            Err(err) if err.is_not_found() => {}
            local => return local,
        }

        let node = Arc::clone(self);
        let lock_key = key.to_string();
        self.coordinator
            .run_exclusive(&lock_key, move || async move {
                let outcome = node.acquire_work(&key, create_args, get_args).await;
                if let Err(err) = &outcome {
                    warn!(node_id = %node.id, %key, %err, "failed to complete work");
                }
                outcome
            })
            .await
    }

    /// Runs under the cluster-wide lock for `key`.
    async fn acquire_work(
        &self,
        key: &ResourceKey,
        create_args: Value,
        get_args: Value,
    ) -> Result<Value, ClusterError> {
        match self.ask_peers(key, get_args.clone()).await {
            Err(err) if err.is_not_found() => {}
            found => return found,
        }

        debug!(node_id = %self.id, %key, "creating resource locally");
        self.create_resource(key.resource_id(), key.resource_type(), create_args)
            .await?;
        self.has_resource(key.resource_id(), key.resource_type(), get_args)
            .await
    }

    async fn ask_peers(&self, key: &ResourceKey, args: Value) -> Result<Value, ClusterError> {
        let links = self.peers.up_links();
        debug!(node_id = %self.id, %key, peers = links.len(), "querying peers");
        let not_found = || ClusterError::not_found(format!("shared resource {key} not found"));
        if links.is_empty() {
            return Err(not_found());
        }

        let params = ResourceCall::new(key, args).into_params()?;
        let mut replies: FuturesUnordered<_> = links
            .into_iter()
            .map(|link| {
                let params = params.clone();
                async move {
                    let reply = match link.request().await {
                        Ok(remote) => remote.invoke(HAS_RESOURCE, params).await,
                        Err(err) => Err(err),
                    };
                    (link.id().clone(), reply)
                }
            })
            .collect();

        // Dropping the rest once one peer answers abandons their replies.
        while let Some((peer, reply)) = replies.next().await {
            match reply {
                Ok(value) => return Ok(value),
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    error!(
                        node_id = %self.id,
                        %peer,
                        %key,
                        kind = err.kind(),
                        %err,
                        "unexpected error in shared resources"
                    );
                }
            }
        }
        Err(not_found())
    }

    async fn redirect_request(
        &self,
        peer: &NodeId,
        key: &ResourceKey,
        args: Value,
    ) -> Result<Value, ClusterError> {
        let link = self
            .peers
            .get(peer)
            .ok_or_else(|| ClusterError::uninitialized(format!("peer {peer} is not known")))?;
        let mut liveness = link.subscribe();
        let remote = link.request().await?;
        let params = ResourceCall::new(key, args).into_params()?;

        // Dropping the losing branch also drops its liveness subscription.
        tokio::select! {
            reply = remote.invoke(INVOKE, params) => reply,
            _ = liveness.wait_for(|state| *state == LinkState::Down) => {
                warn!(node_id = %self.id, %peer, %key, "peer went down during redirected request");
                Err(ClusterError::uninitialized(format!("peer {peer} went down before replying")))
            }
        }
    }

    async fn scavenge(self: &Arc<Self>, dead: &NodeId) -> ScavengeReport {
        self.scavenger.scavenge(dead, self).await
    }

    fn abort_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl Reclaim for Arc<NodeInner> {
    /// Restores the resource from `snapshot` under its cluster-wide lock,
    /// unless this node or a live peer already holds it.
    async fn reclaim(&self, key: &ResourceKey, snapshot: Value) -> Result<Value, ClusterError> {
        match self
            .has_resource(key.resource_id(), key.resource_type(), Value::Null)
            .await
        {
            Err(err) if err.is_not_found() => {}
            local => return local,
        }

        let node = Arc::clone(self);
        let key = key.clone();
        let lock_key = key.to_string();
        self.coordinator
            .run_exclusive(&lock_key, move || async move {
                match node.ask_peers(&key, Value::Null).await {
                    Err(err) if err.is_not_found() => {}
                    found => return found,
                }
                let store = node.store_or_build(key.resource_type())?;
                store
                    .restore(key.resource_id(), snapshot, Value::Null)
                    .await?;
                debug!(node_id = %node.id, %key, "reclaimed resource");
                store.get(key.resource_id(), Value::Null).await
            })
            .await
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

fn remote_methods(node: Weak<NodeInner>) -> MethodTable {
    let mut methods = MethodTable::new();
    let has = node.clone();
    methods
        .register(HAS_RESOURCE, move |params| {
            let node = has.clone();
            async move {
                let call = ResourceCall::from_params(params)?;
                upgrade(&node)?
                    .has_resource(&call.resource_id, &call.resource_type, call.args)
                    .await
            }
        })
        .register(INVOKE, move |params| {
            let node = node.clone();
            async move {
                let call = ResourceCall::from_params(params)?;
                upgrade(&node)?
                    .invoke(&call.resource_id, &call.resource_type, call.args)
                    .await
            }
        });
    methods
}

fn upgrade(node: &Weak<NodeInner>) -> Result<Arc<NodeInner>, ClusterError> {
    node.upgrade()
        .ok_or_else(|| ClusterError::uninitialized("node is shutting down"))
}

async fn announce(
    shared: Arc<dyn SharedStore>,
    channel: String,
    payload: String,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        if let Err(err) = shared.publish(&channel, &payload).await {
            warn!(%channel, %err, "failed to announce server");
        }
    }
}

async fn discover(node: Weak<NodeInner>, mut announcements: Subscription) {
    while let Some(payload) = announcements.next().await {
        let Some(node) = node.upgrade() else {
            break;
        };
        node.peers.handle_announcement(&payload);
    }
}

async fn watch_peers(node: Weak<NodeInner>, mut events: mpsc::UnboundedReceiver<LivenessEvent>) {
    while let Some(LivenessEvent { peer, state }) = events.recv().await {
        let Some(node) = node.upgrade() else {
            break;
        };
        match state {
            LinkState::Up => debug!(node_id = %node.id, %peer, "peer up"),
            LinkState::Down if node.server.is_some() => {
                tokio::spawn(async move {
                    node.scavenge(&peer).await;
                });
            }
            LinkState::Down => {}
        }
    }
}
