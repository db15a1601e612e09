use std::collections::HashMap;
use std::sync::Arc;

use gotong_core::{ClusterError, NodeId, Resource, check_key_part};
use gotong_lease::{KeySpace, SharedStore};

use crate::config::CacheOptions;
use crate::store::{ResourceHolder, ResourceStore};

/// What a resource store needs to publish ownership records.
#[derive(Clone)]
pub struct StoreContext {
    pub node: NodeId,
    pub keys: KeySpace,
    pub shared: Arc<dyn SharedStore>,
}

type StoreFactory = Arc<dyn Fn(&str, StoreContext) -> Arc<dyn ResourceHolder> + Send + Sync>;

/// One concrete [`Resource`] variant and the bounds of its cache.
#[derive(Clone)]
pub struct ResourceDefinition {
    options: CacheOptions,
    factory: StoreFactory,
}

impl ResourceDefinition {
    pub fn new<R: Resource>(resource: R, options: CacheOptions) -> Self {
        let resource = Arc::new(resource);
        let store_options = options.clone();
        let factory: StoreFactory = Arc::new(
            move |name: &str, context: StoreContext| -> Arc<dyn ResourceHolder> {
                let resource = Arc::clone(&resource);
                Arc::new(ResourceStore::new(name, resource, store_options.clone(), context))
            },
        );
        Self { options, factory }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Builds the store for this type. Must be called within a Tokio runtime.
    pub fn build_store(&self, name: &str, context: StoreContext) -> Arc<dyn ResourceHolder> {
        (self.factory)(name, context)
    }
}

/// Resource variants available on a node, fixed once the node starts.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    definitions: HashMap<String, ResourceDefinition>,
}

impl ResourceRegistry {
    pub fn builder() -> ResourceRegistryBuilder {
        ResourceRegistryBuilder::default()
    }

    pub fn get(&self, resource_type: &str) -> Option<&ResourceDefinition> {
        self.definitions.get(resource_type)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[derive(Default)]
pub struct ResourceRegistryBuilder {
    entries: Vec<(String, ResourceDefinition)>,
}

impl ResourceRegistryBuilder {
    pub fn register(
        mut self,
        resource_type: impl Into<String>,
        definition: ResourceDefinition,
    ) -> Self {
        self.entries.push((resource_type.into(), definition));
        self
    }

    /// Rejects reserved characters in type names and duplicate registrations.
    pub fn build(self) -> Result<ResourceRegistry, ClusterError> {
        let mut definitions = HashMap::with_capacity(self.entries.len());
        for (name, definition) in self.entries {
            check_key_part("resource type", &name)?;
            if definitions.insert(name.clone(), definition).is_some() {
                return Err(ClusterError::InvalidArgument(format!(
                    "resource type `{name}` registered twice"
                )));
            }
        }
        Ok(ResourceRegistry { definitions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gotong_core::Value;

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

    #[test]
    fn test_registry_lookup() {
        let registry = ResourceRegistry::builder()
            .register("Echo", ResourceDefinition::new(Echo, CacheOptions::default()))
            .build()
            .unwrap();
        assert!(registry.get("Echo").is_some());
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
        assert!(registry.get("Ticker").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["Echo"]);
    }

    #[test]
    fn test_registry_rejects_bad_names() {
        let duplicate = ResourceRegistry::builder()
            .register("Echo", ResourceDefinition::new(Echo, CacheOptions::default()))
            .register("Echo", ResourceDefinition::new(Echo, CacheOptions::default()))
            .build();
        assert!(matches!(duplicate, Err(ClusterError::InvalidArgument(_))));

        let reserved = ResourceRegistry::builder()
            .register("E~cho", ResourceDefinition::new(Echo, CacheOptions::default()))
            .build();
        assert!(reserved.is_err());
    }
}
