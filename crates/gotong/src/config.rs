use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use gotong_core::{ClusterError, check_key_part};
use gotong_lease::{KeySpace, RedisStore, SharedStore, StoreError};
use gotong_logistics::LinkOptions;

use crate::registry::ResourceRegistry;

/// Bounds of one resource type's local cache.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub max_capacity: u64,
    /// Lifetime of a cached instance, also the lifetime of its published
    /// ownership record.
    pub time_to_live: Duration,
    /// How often expired instances are swept and disposed.
    pub housekeeping_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_capacity: 1024,
            time_to_live: Duration::from_secs(60),
            housekeeping_interval: Duration::from_millis(250),
        }
    }
}

impl CacheOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.time_to_live = ttl;
        self
    }

    pub fn with_capacity(mut self, max_capacity: u64) -> Self {
        self.max_capacity = max_capacity;
        self
    }
}

/// Where the node's RPC server listens. Port 0 picks an ephemeral port.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Timing of the links this node opens to discovered peers.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ping: Duration,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        let link = LinkOptions::default();
        Self {
            ping: link.ping,
            timeout: link.timeout,
            connect_timeout: link.connect_timeout,
            call_timeout: link.call_timeout,
        }
    }
}

impl From<&PeerConfig> for LinkOptions {
    fn from(config: &PeerConfig) -> Self {
        LinkOptions {
            ping: config.ping,
            timeout: config.timeout,
            connect_timeout: config.connect_timeout,
            call_timeout: config.call_timeout,
        }
    }
}

/// The shared store a node coordinates through.
#[derive(Clone)]
pub enum StoreSource {
    /// An already connected store, e.g. a `MemoryStore` shared in-process.
    Shared(Arc<dyn SharedStore>),
    /// A Redis server URL, connected when the node starts.
    Redis(String),
}

impl StoreSource {
    pub async fn open(&self) -> Result<Arc<dyn SharedStore>, StoreError> {
        match self {
            StoreSource::Shared(store) => Ok(Arc::clone(store)),
            StoreSource::Redis(url) => Ok(Arc::new(RedisStore::connect(url).await?)),
        }
    }
}

impl fmt::Debug for StoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreSource::Shared(_) => f.write_str("Shared"),
            StoreSource::Redis(url) => f.debug_tuple("Redis").field(url).finish(),
        }
    }
}

/// Everything a [`crate::ClusterNode`] needs to start.
pub struct NodeConfig {
    pub cluster: String,
    /// Channel lock holders broadcast their outcomes on.
    pub pubsub_channel: String,
    pub store: StoreSource,
    pub server: Option<ServerConfig>,
    pub peer: Option<PeerConfig>,
    pub resources: ResourceRegistry,
    pub lock_timeout: Duration,
    pub announce_interval: Duration,
}

impl NodeConfig {
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    pub fn keys(&self) -> KeySpace {
        KeySpace::new(self.cluster.clone())
    }

    /// Link timings used for peers; hosting-only nodes use the defaults.
    pub fn link_options(&self) -> LinkOptions {
        self.peer.as_ref().map(LinkOptions::from).unwrap_or_default()
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("cluster", &self.cluster)
            .field("pubsub_channel", &self.pubsub_channel)
            .field("store", &self.store)
            .field("server", &self.server)
            .field("peer", &self.peer)
            .field("resources", &self.resources.names().collect::<Vec<_>>())
            .field("lock_timeout", &self.lock_timeout)
            .field("announce_interval", &self.announce_interval)
            .finish()
    }
}

/// Builder for `NodeConfig`.
#[derive(Default)]
pub struct NodeConfigBuilder {
    cluster: Option<String>,
    pubsub_channel: Option<String>,
    store: Option<StoreSource>,
    server: Option<ServerConfig>,
    peer: Option<PeerConfig>,
    resources: Option<ResourceRegistry>,
    lock_timeout: Option<Duration>,
    announce_interval: Option<Duration>,
}

impl NodeConfigBuilder {
    /// Sets the cluster name (required).
    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    pub fn pubsub_channel(mut self, channel: impl Into<String>) -> Self {
        self.pubsub_channel = Some(channel.into());
        self
    }

    /// Coordinates through an already connected store. This or
    /// [`redis`](Self::redis) is required.
    pub fn store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(StoreSource::Shared(store));
        self
    }

    /// Coordinates through the Redis server at `url`.
    pub fn redis(mut self, url: impl Into<String>) -> Self {
        self.store = Some(StoreSource::Redis(url.into()));
        self
    }

    pub fn server(mut self, server: ServerConfig) -> Self {
        self.server = Some(server);
        self
    }

    pub fn peer(mut self, peer: PeerConfig) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn resources(mut self, resources: ResourceRegistry) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Sets the distributed lock timeout (default: 10s).
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Sets the server announcement period (default: 250ms).
    pub fn announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<NodeConfig, ClusterError> {
        let cluster = self
            .cluster
            .ok_or_else(|| ClusterError::InvalidArgument("cluster name is required".into()))?;
        check_key_part("cluster name", &cluster)?;
        let store = self
            .store
            .ok_or_else(|| ClusterError::InvalidArgument("a shared store is required".into()))?;
        if matches!(&store, StoreSource::Redis(url) if url.trim().is_empty()) {
            return Err(ClusterError::InvalidArgument("redis url is empty".into()));
        }
        if self.server.is_none() && self.peer.is_none() {
            return Err(ClusterError::InvalidArgument(
                "a node needs a server config, a peer config, or both".into(),
            ));
        }

        let pubsub_channel = self
            .pubsub_channel
            .unwrap_or_else(|| KeySpace::new(cluster.clone()).default_lock_channel());
        Ok(NodeConfig {
            cluster,
            pubsub_channel,
            store,
            server: self.server,
            peer: self.peer,
            resources: self.resources.unwrap_or_default(),
            lock_timeout: self.lock_timeout.unwrap_or(Duration::from_secs(10)),
            announce_interval: self
                .announce_interval
                .unwrap_or(Duration::from_millis(250)),
        })
    }
}
