use async_trait::async_trait;
use serde_json::Value;

use crate::ClusterError;

/// A named, typed, stateful unit of work hosted by exactly one node at a time.
///
/// One implementation exists per resource type. The node's resource store
/// owns every live `Instance`; the implementation only describes how
/// instances are built, queried, exported and torn down.
///
/// Instances are cloned out of the store for each operation, so `Instance`
/// is normally a cheap handle (an `Arc`) to shared state. Operations on the
/// same instance may run concurrently and must be safe under that.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    type Instance: Clone + Send + Sync + 'static;

    /// Builds the instance for `id`.
    ///
    /// `existing` is the currently cached instance, if any. Implementations
    /// decide between updating it and building a fresh one; a fresh instance
    /// replaces the cached one without running [`Resource::dispose`] on it.
    async fn create(
        &self,
        id: &str,
        args: Value,
        existing: Option<Self::Instance>,
    ) -> Result<Self::Instance, ClusterError>;

    /// Returns a transport-light snapshot value. Never a live handle.
    async fn get(
        &self,
        id: &str,
        instance: &Self::Instance,
        args: Value,
    ) -> Result<Value, ClusterError>;

    /// Executes an operation against the live instance.
    async fn invoke(
        &self,
        id: &str,
        _instance: &Self::Instance,
        _args: Value,
    ) -> Result<Value, ClusterError> {
        Err(ClusterError::internal(format!("{id}: invoke must be defined")))
    }

    /// Exports the instance so another node can rebuild it.
    fn serialize(&self, id: &str, _instance: &Self::Instance) -> Result<Value, ClusterError> {
        Err(ClusterError::internal(format!(
            "{id}: serialize must be defined for the resource to be exported"
        )))
    }

    /// Rebuilds an instance from a snapshot produced by [`Resource::serialize`].
    async fn deserialize(
        &self,
        id: &str,
        _snapshot: Value,
        _args: Value,
    ) -> Result<Self::Instance, ClusterError> {
        Err(ClusterError::internal(format!("{id}: restore is not supported")))
    }

    /// Releases timers and handles held by an instance leaving the store.
    fn dispose(&self, _id: &str, _instance: Self::Instance) {}

    /// Type-wide cleanup when the owning node shuts down.
    async fn close(&self) -> Result<(), ClusterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Resource for Echo {
        type Instance = Value;

        async fn create(
            &self,
            _id: &str,
            args: Value,
            _existing: Option<Value>,
        ) -> Result<Value, ClusterError> {
            Ok(args)
        }

        async fn get(
            &self,
            _id: &str,
            instance: &Value,
            _args: Value,
        ) -> Result<Value, ClusterError> {
            Ok(instance.clone())
        }
    }

    #[tokio::test]
    async fn test_missing_capabilities_are_internal_errors() {
        let echo = Echo;
        let instance = echo.create("a", Value::from(1), None).await.unwrap();
        assert_eq!(echo.get("a", &instance, Value::Null).await.unwrap(), Value::from(1));

        let err = echo.invoke("a", &instance, Value::Null).await.unwrap_err();
        assert!(matches!(err, ClusterError::Internal(_)));
        assert!(matches!(echo.serialize("a", &instance), Err(ClusterError::Internal(_))));
        assert!(echo.deserialize("a", Value::Null, Value::Null).await.is_err());
    }
}
