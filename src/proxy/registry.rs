//! Shard registry
//!
//! Tracks live shards and collects the exit records of finished ones.
//!
//! Only the most recent exit records are kept, so a proxy running for days
//! does not accumulate one record per connection it ever served.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use super::{ShardExit, ShardExitReason, ShardId, ShardInfo, ShardState};

/// Exit records kept until `run` collects them
pub const MAX_EXIT_RECORDS: usize = 1024;

/// Live shards and exit records
#[derive(Debug)]
pub struct ShardRegistry {
    live: Mutex<HashMap<ShardId, ShardInfo>>,
    exits: Mutex<VecDeque<ShardExit>>,
    exit_capacity: usize,
}

impl Default for ShardRegistry {
    fn default() -> Self {
        Self::with_exit_capacity(MAX_EXIT_RECORDS)
    }
}

impl ShardRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry keeping at most `capacity` exit records
    pub fn with_exit_capacity(capacity: usize) -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            exits: Mutex::new(VecDeque::new()),
            exit_capacity: capacity.max(1),
        }
    }

    /// Add a newly spawned shard
    pub fn register(&self, info: ShardInfo) {
        debug!("Registered shard {} {} -> {}", info.id, info.local, info.remote);
        lock(&self.live).insert(info.id, info);
    }

    /// Record a state change; unknown ids are ignored
    pub fn set_state(&self, id: ShardId, state: ShardState) {
        if let Some(info) = lock(&self.live).get_mut(&id) {
            info.state = state;
        }
    }

    /// Remove a shard and keep its exit record
    ///
    /// Once the record limit is reached the oldest record is dropped.
    pub fn deregister(&self, id: ShardId, reason: ShardExitReason) -> Option<ShardInfo> {
        let info = lock(&self.live).remove(&id)?;

        let mut exits = lock(&self.exits);
        if exits.len() >= self.exit_capacity {
            if let Some(dropped) = exits.pop_front() {
                debug!("Dropped exit record of shard {}", dropped.id);
                metrics::counter!("shard_proxy.exits.dropped").increment(1);
            }
        }
        exits.push_back(ShardExit {
            id,
            local: info.local.clone(),
            remote: info.remote.clone(),
            reason,
        });

        Some(ShardInfo { state: ShardState::Closed, ..info })
    }

    /// Entry of a live shard
    pub fn get(&self, id: ShardId) -> Option<ShardInfo> {
        lock(&self.live).get(&id).cloned()
    }

    /// Snapshot of every live shard, ordered by id
    pub fn snapshot(&self) -> Vec<ShardInfo> {
        let mut shards: Vec<ShardInfo> = lock(&self.live).values().cloned().collect();
        shards.sort_by_key(|info| info.id);
        shards
    }

    /// Number of live shards
    pub fn len(&self) -> usize {
        lock(&self.live).len()
    }

    /// Whether no shard is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the exit records collected so far, ordered by id
    pub fn take_exits(&self) -> Vec<ShardExit> {
        let mut exits: Vec<ShardExit> = std::mem::take(&mut *lock(&self.exits)).into();
        exits.sort_by_key(|exit| exit.id);
        exits
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::AddressSpec;

    fn info(id: u64) -> ShardInfo {
        ShardInfo {
            id: ShardId(id),
            local: AddressSpec::new("127.0.0.1", 40000 + id as u16),
            remote: AddressSpec::new("10.0.0.1", 12000),
            state: ShardState::Listening,
        }
    }

    #[test]
    fn test_register_update_and_deregister() {
        let registry = ShardRegistry::new();
        registry.register(info(2));
        registry.register(info(1));
        registry.set_state(ShardId(2), ShardState::Relaying);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, ShardId(1));
        assert_eq!(snapshot[1].state, ShardState::Relaying);

        let closed = registry.deregister(ShardId(2), ShardExitReason::PeerClosed).unwrap();
        assert_eq!(closed.state, ShardState::Closed);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(ShardId(2)).is_none());

        let exits = registry.take_exits();
        assert_eq!(exits.len(), 1);
        assert!(matches!(exits[0].reason, ShardExitReason::PeerClosed));
        assert!(registry.take_exits().is_empty());
    }

    #[test]
    fn test_exit_records_are_capped() {
        let registry = ShardRegistry::with_exit_capacity(3);
        for id in 1..=5 {
            registry.register(info(id));
            registry.deregister(ShardId(id), ShardExitReason::PeerClosed);
        }

        let ids: Vec<ShardId> = registry.take_exits().into_iter().map(|exit| exit.id).collect();
        assert_eq!(ids, vec![ShardId(3), ShardId(4), ShardId(5)]);
    }

    #[test]
    fn test_deregister_unknown_shard() {
        let registry = ShardRegistry::new();
        assert!(registry.deregister(ShardId(9), ShardExitReason::Cancelled).is_none());
        assert!(registry.take_exits().is_empty());
    }
}
