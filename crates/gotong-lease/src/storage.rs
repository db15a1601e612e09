use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use gotong_core::ClusterError;
use thiserror::Error;

/// Stream of payloads published on one channel.
pub type Subscription = BoxStream<'static, String>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The key exists but holds a different kind of value.
    #[error("key `{0}` holds a value of another type")]
    WrongType(String),

    /// The backend connection or command failed.
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for ClusterError {
    fn from(err: StoreError) -> Self {
        ClusterError::Store(err.to_string())
    }
}

/// The shared key/value store and broadcast channel every node talks to.
///
/// Each operation is atomic on its own; callers never rely on several
/// operations being applied together.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Adds `member` to the set at `key`.
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Removes and returns a random member of the set at `key`.
    async fn set_pop(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Writes `fields` into the hash at `key`, keeping other fields.
    async fn hash_write(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    /// Reads every field of the hash at `key`; empty when absent.
    async fn hash_read(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Sets a time-to-live on `key`. Returns `false` when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Stores `value` at `key` with `ttl` only if the key is absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Deletes `key` only while it still holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Broadcasts `payload`; returns how many subscribers received it.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;

    /// Disconnects this node's handle from the store.
    async fn close(&self) -> Result<(), StoreError>;
}
