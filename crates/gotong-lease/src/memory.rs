use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::warn;

use crate::storage::{SharedStore, StoreError, Subscription};

const CHANNEL_CAPACITY: usize = 1024;
/// Minimum spacing between sweeps of expired keys.
const PURGE_INTERVAL: Duration = Duration::from_secs(1);

enum Data {
    Text(String),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(data: Data) -> Self {
        Self {
            data,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    next_purge: Mutex<Option<Instant>>,
}

/// Process-local [`SharedStore`].
///
/// Cloned handles share the same keyspace and channels, so several nodes
/// running in one process form a cluster by sharing one `MemoryStore`.
/// Expired keys are dropped on access, and every key is swept at most once
/// per second on the way into any operation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let mut next_purge = self
            .inner
            .next_purge
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if next_purge.is_none_or(|at| at <= now) {
            entries.retain(|_, entry| entry.is_live(now));
            *next_purge = Some(now + PURGE_INTERVAL);
        }
        entries
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self
            .inner
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// Returns the live entry at `key`, dropping it first if it has expired.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn pick(len: usize) -> usize {
    rand::rng().random_range(0..len)
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut entries = self.entries();
        match live(&mut entries, key) {
            Some(Entry {
                data: Data::Set(set),
                ..
            }) => {
                set.insert(member.to_string());
                Ok(())
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => {
                let set = HashSet::from([member.to_string()]);
                entries.insert(key.to_string(), Entry::new(Data::Set(set)));
                Ok(())
            }
        }
    }

    async fn set_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries();
        let (member, now_empty) = match live(&mut entries, key) {
            Some(Entry {
                data: Data::Set(set),
                ..
            }) => {
                let member = set.iter().nth(pick(set.len().max(1))).cloned();
                if let Some(member) = &member {
                    set.remove(member);
                }
                (member, set.is_empty())
            }
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
            None => return Ok(None),
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(member)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries();
        match live(&mut entries, key) {
            Some(Entry {
                data: Data::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn hash_write(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        let mut entries = self.entries();
        match live(&mut entries, key) {
            Some(Entry {
                data: Data::Hash(hash),
                ..
            }) => {
                hash.extend(fields.iter().cloned());
                Ok(())
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => {
                let hash = fields.iter().cloned().collect();
                entries.insert(key.to_string(), Entry::new(Data::Hash(hash)));
                Ok(())
            }
        }
    }

    async fn hash_read(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut entries = self.entries();
        match live(&mut entries, key) {
            Some(Entry {
                data: Data::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(HashMap::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut entries = self.entries();
        match live(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries();
        let existed = live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries();
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        let entry = Entry {
            data: Data::Text(value.to_string()),
            expires_at: Some(Instant::now() + ttl),
        };
        entries.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries();
        if live(&mut entries, key).is_none() {
            return Ok(false);
        }
        match entries.entry(key.to_string()) {
            MapEntry::Occupied(occupied) => {
                let held = match &occupied.get().data {
                    Data::Text(current) => current == value,
                    _ => return Err(StoreError::WrongType(key.to_string())),
                };
                if held {
                    occupied.remove();
                }
                Ok(held)
            }
            MapEntry::Vacant(_) => Ok(false),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        // No subscribers is not an error; the payload is simply dropped.
        Ok(self.sender(channel).send(payload.to_string()).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let receiver = self.sender(channel).subscribe();
        let channel = channel.to_string();
        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let channel = channel.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%channel, skipped, "subscriber lagged behind publisher");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), StoreError> {
        // Other nodes keep using the shared keyspace.
        Ok(())
    }
}
