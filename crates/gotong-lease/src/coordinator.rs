use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use gotong_core::{ClusterError, Value};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::keyspace::KeySpace;
use crate::storage::{SharedStore, Subscription};

/// What every caller waiting on a key receives.
pub type Outcome = Result<Value, ClusterError>;

/// Lock acquisition settings shared by every key.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// How long a grant lives and how long waiters wait for a settlement.
    pub timeout: Duration,
    /// Broadcast channel holders publish their outcomes on.
    pub channel: String,
}

impl LockOptions {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            timeout: Duration::from_secs(10),
            channel: channel.into(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One attempt by this process to hold the lock for `key`.
#[derive(Debug, Clone)]
pub struct LockTicket {
    pub key: String,
    /// Token written into the lock key; only its writer may release it.
    pub holder: String,
    pub deadline: Instant,
}

impl LockTicket {
    fn issue(key: &str, holder_id: &str, timeout: Duration) -> Self {
        Self {
            key: key.to_string(),
            holder: format!("{holder_id}:{:032x}", rand::random::<u128>()),
            deadline: Instant::now() + timeout,
        }
    }
}

/// Message a lock holder broadcasts once its worker finished.
#[derive(Debug, Serialize, Deserialize)]
struct Settlement {
    key: String,
    outcome: Outcome,
}

type Waiters = Vec<oneshot::Sender<Outcome>>;

/// Runs at most one worker per key across every process sharing the store.
///
/// Callers on this process that ask for a key already in flight are
/// coalesced onto the running attempt. The attempt tries the cluster-wide
/// lock once: if it is granted the worker runs and its outcome is broadcast,
/// otherwise the attempt waits for the outcome broadcast by the holder.
#[derive(Clone)]
pub struct DistributedCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    options: LockOptions,
    holder_id: String,
    inflight: Mutex<HashMap<String, Waiters>>,
}

impl DistributedCoordinator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: KeySpace,
        holder_id: impl Into<String>,
        options: LockOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                keys,
                options,
                holder_id: holder_id.into(),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Runs `worker` under the cluster-wide lock for `key`.
    ///
    /// `worker` runs at most once per batch of coalesced callers and is
    /// dropped unused when another attempt for `key` is already in flight.
    /// Errors are not retried. When nobody settles the key within the lock
    /// timeout every waiter fails with [`ClusterError::LockTimeout`]; a late
    /// worker still releases its grant.
    pub async fn run_exclusive<F, Fut>(&self, key: &str, worker: F) -> Outcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let leads = {
            let mut inflight = self.inner.inflight();
            match inflight.get_mut(key) {
                Some(waiters) => {
                    waiters.push(sender);
                    false
                }
                None => {
                    inflight.insert(key.to_string(), vec![sender]);
                    true
                }
            }
        };

        if leads {
            // Spawned so that an abandoned caller does not cancel the worker.
            let inner = Arc::clone(&self.inner);
            let key = key.to_string();
            tokio::spawn(async move {
                let outcome = inner.contend(&key, worker).await;
                inner.settle(&key, outcome);
            });
        } else {
            debug!(key, "coalesced onto in-flight attempt");
        }

        receiver
            .await
            .unwrap_or_else(|_| Err(ClusterError::internal("lock attempt dropped its waiters")))
    }
}

impl Inner {
    fn inflight(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiters>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settle(&self, key: &str, outcome: Outcome) {
        let waiters = self.inflight().remove(key).unwrap_or_default();
        debug!(key, waiters = waiters.len(), ok = outcome.is_ok(), "settling key");
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn contend<F, Fut>(self: &Arc<Self>, key: &str, worker: F) -> Outcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let lock_key = self.keys.lock(key);
        let ticket = LockTicket::issue(key, &self.holder_id, self.options.timeout);

        // Subscribe first: the holder may settle right after refusing us.
        let settlements = self.store.subscribe(&self.options.channel).await?;
        let granted = self
            .store
            .set_if_absent(&lock_key, &ticket.holder, self.options.timeout)
            .await?;
        if !granted {
            debug!(key, "lock held elsewhere, awaiting settlement");
            return self.await_settlement(key, settlements, ticket.deadline).await;
        }
        drop(settlements);

        debug!(key, holder = %ticket.holder, "lock granted");
        let mut work = tokio::spawn(worker());
        match tokio::time::timeout_at(ticket.deadline, &mut work).await {
            Ok(joined) => {
                let outcome = flatten(joined);
                self.release(&ticket, &lock_key, &outcome).await;
                outcome
            }
            Err(_) => {
                warn!(key, "worker outlived the lock timeout");
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = flatten(work.await);
                    inner.release(&ticket, &lock_key, &outcome).await;
                });
                Err(ClusterError::LockTimeout {
                    key: key.to_string(),
                })
            }
        }
    }

    async fn await_settlement(
        &self,
        key: &str,
        mut settlements: Subscription,
        deadline: Instant,
    ) -> Outcome {
        let wait = async {
            while let Some(payload) = settlements.next().await {
                match serde_json::from_str::<Settlement>(&payload) {
                    Ok(settlement) if settlement.key == key => return Some(settlement.outcome),
                    Ok(_) => {}
                    Err(err) => debug!(%err, "ignoring malformed settlement"),
                }
            }
            None
        };

        match tokio::time::timeout_at(deadline, wait).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => Err(ClusterError::Store(format!(
                "settlement channel `{}` closed",
                self.options.channel
            ))),
            Err(_) => Err(ClusterError::LockTimeout {
                key: key.to_string(),
            }),
        }
    }

    /// Gives the grant back, then broadcasts the outcome.
    ///
    /// A contender refused while the grant was held subscribed before
    /// trying, so it sees the broadcast that follows the release.
    async fn release(&self, ticket: &LockTicket, lock_key: &str, outcome: &Outcome) {
        match self.store.delete_if_equals(lock_key, &ticket.holder).await {
            Ok(true) => {}
            Ok(false) => debug!(key = %ticket.key, "grant expired before release"),
            Err(err) => warn!(key = %ticket.key, %err, "failed to release lock"),
        }

        let settlement = Settlement {
            key: ticket.key.clone(),
            outcome: outcome.clone(),
        };
        match serde_json::to_string(&settlement) {
            Ok(payload) => {
                if let Err(err) = self.store.publish(&self.options.channel, &payload).await {
                    warn!(key = %ticket.key, %err, "failed to broadcast settlement");
                }
            }
            Err(err) => warn!(key = %ticket.key, %err, "failed to encode settlement"),
        }
    }
}

fn flatten(joined: Result<Outcome, JoinError>) -> Outcome {
    joined.unwrap_or_else(|err| Err(ClusterError::internal(format!("worker failed: {err}"))))
}
