use gotong_core::{NodeId, join_key};

/// Names every key and channel a cluster uses in the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    cluster: String,
}

impl KeySpace {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Channel carrying `{cluster, host, port}` server announcements.
    pub fn announce_channel(&self) -> String {
        join_key(&[&self.cluster, "announce"])
    }

    pub fn resource_namespace(&self) -> String {
        join_key(&[&self.cluster, "resource"])
    }

    /// Set of resource ids `node` published for `resource_type`.
    pub fn ownership_set(&self, node: &NodeId, resource_type: &str) -> String {
        join_key(&[&self.resource_namespace(), node.as_str(), resource_type])
    }

    /// Hash holding the snapshot of one owned resource.
    pub fn snapshot(&self, node: &NodeId, resource_type: &str, resource_id: &str) -> String {
        join_key(&[&self.ownership_set(node, resource_type), resource_id])
    }

    pub fn lock(&self, key: &str) -> String {
        join_key(&[&self.cluster, "lock", key])
    }

    /// Channel lock holders broadcast their outcomes on, unless configured.
    pub fn default_lock_channel(&self) -> String {
        join_key(&[&self.cluster, "locks"])
    }
}
