mod error;
mod key;
mod traits;

pub use error::ClusterError;
pub use key::{NodeId, ResourceKey, SEPARATOR, check_key_part, join_key};
pub use traits::Resource;

/// Values exchanged with resources: arguments, snapshots and results.
pub use serde_json::Value;
