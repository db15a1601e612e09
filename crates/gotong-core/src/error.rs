use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds surfaced by cluster operations.
///
/// The type is `Clone` and serializable because a single worker outcome is
/// handed to every coalesced caller, broadcast to lock waiters on other
/// processes and returned over peer RPC without being rewritten.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum ClusterError {
    /// The key is absent locally or on the queried peers. Recoverable: it
    /// triggers the fallback path during acquisition.
    #[error("not found: {0}")]
    NotFound(String),

    /// The target peer or resource type is not available on this node.
    #[error("uninitialized: {0}")]
    Uninitialized(String),

    /// The cluster-wide mutex for `key` was not obtained in time.
    #[error("lock for `{key}` was not acquired in time")]
    LockTimeout { key: String },

    /// No resource definition exists for the requested type.
    #[error("resource type `{0}` is not registered")]
    ResourceTypeUnregistered(String),

    /// A resource variant does not implement a required capability.
    #[error("internal error: {0}")]
    Internal(String),

    /// Malformed input, such as a key part containing the reserved separator.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The shared key/value store rejected or failed an operation.
    #[error("shared store error: {0}")]
    Store(String),

    /// The peer transport failed: I/O, framing or request timeout.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClusterError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn uninitialized(what: impl Into<String>) -> Self {
        Self::Uninitialized(what.into())
    }

    pub fn internal(what: impl Into<String>) -> Self {
        Self::Internal(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Stable short name of the error kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Uninitialized(_) => "uninitialized",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::ResourceTypeUnregistered(_) => "resource_type_unregistered",
            Self::Internal(_) => "internal",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Store(_) => "store",
            Self::Transport(_) => "transport",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_survives_the_wire() {
        let err = ClusterError::LockTimeout {
            key: "Counter~a".to_string(),
        };
        let encoded = serde_json::to_string(&err).unwrap();
        let decoded: ClusterError = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, err);
        assert_eq!(decoded.kind(), "lock_timeout");
    }

    #[test]
    fn test_not_found_is_recoverable() {
        assert!(ClusterError::not_found("a").is_not_found());
        assert!(!ClusterError::uninitialized("a").is_not_found());
    }
}
