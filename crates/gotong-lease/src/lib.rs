//! Cluster-wide mutual exclusion over a shared key/value store.
//!
//! [`DistributedCoordinator::run_exclusive`] guarantees that, for one key,
//! a single worker runs across every process sharing the store, and that
//! every caller waiting on that key (locally coalesced or on another
//! process) observes the worker's outcome.

mod coordinator;
mod keyspace;
mod memory;
mod redis_store;
mod storage;

pub use coordinator::{DistributedCoordinator, LockOptions, LockTicket, Outcome};
pub use keyspace::KeySpace;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use storage::{SharedStore, StoreError, Subscription};
