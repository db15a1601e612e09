use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use tracing::{debug, warn};

use crate::storage::{SharedStore, StoreError, Subscription};

/// Deletes KEYS[1] only while it holds ARGV[1].
const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// [`SharedStore`] backed by a Redis server.
///
/// Commands share one multiplexed connection; every subscription opens its
/// own pub/sub connection and closes it when the stream is dropped. Nodes
/// in separate processes pointing at the same server form one cluster.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: MultiplexedConnection,
    delete_if_equals: Script,
}

impl RedisStore {
    /// Connects to `url`, e.g. `redis://127.0.0.1:6379/0`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        debug!(%url, "connected to redis");
        Ok(Self {
            client,
            connection,
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
        })
    }

    fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

fn millis(ttl: Duration) -> u64 {
    // PX rejects zero.
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let _: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut self.connection())
            .await?;
        Ok(())
    }

    async fn set_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let member: Option<String> = redis::cmd("SPOP")
            .arg(key)
            .query_async(&mut self.connection())
            .await?;
        Ok(member)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.connection())
            .await?;
        Ok(members)
    }

    async fn hash_write(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut command = redis::cmd("HSET");
        command.arg(key);
        for (field, value) in fields {
            command.arg(field).arg(value);
        }
        let _: i64 = command.query_async(&mut self.connection()).await?;
        Ok(())
    }

    async fn hash_read(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let hash: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.connection())
            .await?;
        Ok(hash)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut self.connection())
            .await?;
        Ok(applied == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.connection())
            .await?;
        Ok(removed > 0)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut self.connection())
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let removed: i64 = self
            .delete_if_equals
            .key(key)
            .arg(value)
            .invoke_async(&mut self.connection())
            .await?;
        Ok(removed > 0)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut self.connection())
            .await?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        // Returns once the server confirmed the subscription.
        pubsub.subscribe(channel).await?;
        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |message| {
            let payload = match message.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(err) => {
                    warn!(%channel, %err, "dropping undecodable message");
                    None
                }
            };
            futures::future::ready(payload)
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), StoreError> {
        // The multiplexed connection closes once the last handle is dropped.
        Ok(())
    }
}
