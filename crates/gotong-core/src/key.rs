use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ClusterError;

/// Reserved separator between the parts of every composed key.
pub const SEPARATOR: char = '~';

/// Joins key parts with [`SEPARATOR`].
pub fn join_key(parts: &[&str]) -> String {
    let mut key = String::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(SEPARATOR);
        }
        key.push_str(part);
    }
    key
}

/// Network identity of a node: `host:port` of its RPC server.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_host_port(host: &str, port: u16) -> Self {
        Self(format!("{host}:{port}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifies one resource cluster-wide: `resourceType~resourceId`.
///
/// Used as the distributed-lock key and as the shared-storage index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    resource_type: String,
    resource_id: String,
}

impl ResourceKey {
    /// Builds a key, rejecting parts that are empty or contain [`SEPARATOR`].
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Result<Self, ClusterError> {
        let resource_type = resource_type.into();
        let resource_id = resource_id.into();
        check_key_part("resource type", &resource_type)?;
        check_key_part("resource id", &resource_id)?;
        Ok(Self {
            resource_type,
            resource_id,
        })
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.resource_type, SEPARATOR, self.resource_id)
    }
}

/// Rejects key parts that are empty or contain [`SEPARATOR`].
pub fn check_key_part(label: &str, part: &str) -> Result<(), ClusterError> {
    if part.is_empty() {
        return Err(ClusterError::InvalidArgument(format!("{label} must not be empty")));
    }
    if part.contains(SEPARATOR) {
        return Err(ClusterError::InvalidArgument(format!(
            "{label} `{part}` contains reserved separator `{SEPARATOR}`"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let key = ResourceKey::new("Counter", "a").unwrap();
        assert_eq!(key.to_string(), "Counter~a");
        assert_eq!(join_key(&["ark", "resource", "127.0.0.1:8000"]), "ark~resource~127.0.0.1:8000");
    }

    #[test]
    fn test_separator_is_reserved() {
        let err = ResourceKey::new("Counter", "a~b").unwrap_err();
        assert!(matches!(err, ClusterError::InvalidArgument(_)));
        assert!(ResourceKey::new("", "a").is_err());
    }

    #[test]
    fn test_node_id_from_host_port() {
        let id = NodeId::from_host_port("localhost", 8000);
        assert_eq!(id.as_str(), "localhost:8000");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"localhost:8000\"");
    }
}
