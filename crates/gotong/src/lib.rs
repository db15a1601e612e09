//! Gotong: shared ownership of typed, stateful resources across a cluster.
//!
//! Every [`ClusterNode`] in a named cluster can acquire a resource by type
//! and id. At most one node materializes a resource at a time; the others
//! find it through their peers and can invoke it remotely. When the owning
//! node disappears, the survivors reclaim its resources from the snapshots
//! it published to the shared store.
//!
//! The workspace crates are re-exported here:
//!
//! - [`core`]: resource keys, node ids, the [`Resource`] trait, error kinds
//! - [`lease`]: the shared store port and the distributed coordinator
//! - [`logistics`]: framed TCP RPC and self-healing peer links

pub use gotong_core as core;
pub use gotong_lease as lease;
pub use gotong_logistics as logistics;

pub mod config;
pub mod error;
pub mod node;
pub mod peers;
pub mod registry;
pub mod scavenger;
pub mod store;
pub mod telemetry;

pub use config::{
    CacheOptions, NodeConfig, NodeConfigBuilder, PeerConfig, ServerConfig, StoreSource,
};
pub use error::GotongError;
pub use node::ClusterNode;
pub use registry::{ResourceDefinition, ResourceRegistry, StoreContext};
pub use scavenger::{Reclaim, ScavengeReport, Scavenger};
pub use store::{ResourceHolder, ResourceStore};

pub use gotong_core::{ClusterError, NodeId, Resource, ResourceKey, Value};
pub use gotong_lease::{MemoryStore, RedisStore, SharedStore};
pub use gotong_logistics::LinkState;

/// Commonly used items for defining resources and running nodes.
pub mod prelude {
    pub use crate::{
        CacheOptions, ClusterError, ClusterNode, NodeConfig, NodeId, PeerConfig, Resource,
        ResourceDefinition, ResourceRegistry, ServerConfig, Value,
    };
    pub use async_trait::async_trait;
}
