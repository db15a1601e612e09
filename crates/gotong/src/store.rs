use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gotong_core::{ClusterError, Resource, Value};
use moka::notification::RemovalCause;
use moka::sync::Cache;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CacheOptions;
use crate::registry::StoreContext;

/// Hash field holding a published snapshot.
pub const SNAPSHOT_FIELD: &str = "snapshot";

/// Type-erased view of one [`ResourceStore`], as held by the node.
#[async_trait]
pub trait ResourceHolder: Send + Sync {
    fn resource_type(&self) -> &str;

    /// Builds (or updates) the instance for `id` and caches it.
    async fn create(&self, id: &str, args: Value) -> Result<(), ClusterError>;

    /// Rebuilds the instance for `id` from a published snapshot and caches it.
    async fn restore(&self, id: &str, snapshot: Value, args: Value) -> Result<(), ClusterError>;

    async fn get(&self, id: &str, args: Value) -> Result<Value, ClusterError>;

    async fn invoke(&self, id: &str, args: Value) -> Result<Value, ClusterError>;

    fn contains(&self, id: &str) -> bool;

    /// Number of cached instances. Exact only after pending tasks ran.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies pending evictions now instead of at the next sweep.
    fn run_pending_tasks(&self);

    /// Disposes every cached instance and closes the resource type.
    async fn close(&self) -> Result<(), ClusterError>;
}

/// Bounded, expiring cache of the live instances of one resource type.
///
/// Caching an instance publishes its ownership record: the id joins this
/// node's ownership set for the type, and its snapshot is written next to
/// it, both expiring with the cache TTL. Evicted instances are disposed;
/// their records are left to expire.
pub struct ResourceStore<R: Resource> {
    resource_type: String,
    resource: Arc<R>,
    cache: Cache<String, R::Instance>,
    options: CacheOptions,
    context: StoreContext,
    housekeeper: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Resource> ResourceStore<R> {
    /// Must be called within a Tokio runtime.
    pub fn new(
        resource_type: impl Into<String>,
        resource: Arc<R>,
        options: CacheOptions,
        context: StoreContext,
    ) -> Self {
        let resource_type = resource_type.into();
        let listener = {
            let resource = Arc::clone(&resource);
            let resource_type = resource_type.clone();
            move |id: Arc<String>, instance: R::Instance, cause: RemovalCause| {
                // Replacement hands the slot to the update of the same resource.
                if matches!(cause, RemovalCause::Replaced) {
                    return;
                }
                debug!(%resource_type, resource_id = %id, ?cause, "disposing resource");
                resource.dispose(&id, instance);
            }
        };
        let cache = Cache::builder()
            .max_capacity(options.max_capacity)
            .time_to_live(options.time_to_live)
            .eviction_listener(listener)
            .build();
        let housekeeper = tokio::spawn(housekeep(cache.clone(), options.housekeeping_interval));

        Self {
            resource_type,
            resource,
            cache,
            options,
            context,
            housekeeper: Mutex::new(Some(housekeeper)),
        }
    }

    fn instance(&self, id: &str) -> Result<R::Instance, ClusterError> {
        self.cache.get(id).ok_or_else(|| {
            ClusterError::not_found(format!("{}~{id} is not cached", self.resource_type))
        })
    }

    async fn admit(&self, id: &str, instance: R::Instance) {
        self.cache.insert(id.to_string(), instance.clone());
        // The instance is live either way; a missing record only delays discovery.
        if let Err(err) = self.publish(id, &instance).await {
            warn!(
                resource_type = %self.resource_type,
                resource_id = id,
                %err,
                "failed to publish ownership record"
            );
        }
    }

    async fn publish(&self, id: &str, instance: &R::Instance) -> Result<(), ClusterError> {
        let StoreContext { node, keys, shared } = &self.context;
        let ttl = self.options.time_to_live;
        let set = keys.ownership_set(node, &self.resource_type);
        shared.set_add(&set, id).await?;

        match self.resource.serialize(id, instance) {
            Ok(snapshot) => {
                let hash = keys.snapshot(node, &self.resource_type, id);
                shared
                    .hash_write(&hash, &[(SNAPSHOT_FIELD.to_string(), snapshot.to_string())])
                    .await?;
                shared.expire(&hash, ttl).await?;
            }
            Err(err) => debug!(
                resource_type = %self.resource_type,
                resource_id = id,
                %err,
                "resource is not exportable, publishing without snapshot"
            ),
        }

        shared.expire(&set, ttl).await?;
        Ok(())
    }
}

#[async_trait]
impl<R: Resource> ResourceHolder for ResourceStore<R> {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    async fn create(&self, id: &str, args: Value) -> Result<(), ClusterError> {
        let existing = self.cache.get(id);
        let instance = self.resource.create(id, args, existing).await?;
        self.admit(id, instance).await;
        debug!(resource_type = %self.resource_type, resource_id = id, "resource cached");
        Ok(())
    }

    async fn restore(&self, id: &str, snapshot: Value, args: Value) -> Result<(), ClusterError> {
        let instance = self.resource.deserialize(id, snapshot, args).await?;
        self.admit(id, instance).await;
        debug!(resource_type = %self.resource_type, resource_id = id, "resource restored");
        Ok(())
    }

    async fn get(&self, id: &str, args: Value) -> Result<Value, ClusterError> {
        let instance = self.instance(id)?;
        self.resource.get(id, &instance, args).await
    }

    async fn invoke(&self, id: &str, args: Value) -> Result<Value, ClusterError> {
        let instance = self.instance(id)?;
        self.resource.invoke(id, &instance, args).await
    }

    fn contains(&self, id: &str) -> bool {
        self.cache.contains_key(id)
    }

    fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }

    async fn close(&self) -> Result<(), ClusterError> {
        let housekeeper = self
            .housekeeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(housekeeper) = housekeeper {
            housekeeper.abort();
        }

        let ids: Vec<Arc<String>> = self.cache.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.cache.invalidate(id.as_str());
        }
        self.cache.run_pending_tasks();
        self.resource.close().await
    }
}

impl<R: Resource> Drop for ResourceStore<R> {
    fn drop(&mut self) {
        if let Some(housekeeper) = self
            .housekeeper
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            housekeeper.abort();
        }
    }
}

async fn housekeep<V>(cache: Cache<String, V>, every: Duration)
where
    V: Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        cache.run_pending_tasks();
    }
}
