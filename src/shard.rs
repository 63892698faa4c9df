// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Generic sharded, size-bounded associative container.
//!
//! A shard's mutex guards only its table and LRU bookkeeping; the value
//! behind each entry has its own lock, acquired after the shard mutex is
//! released, so that readers of two different entries in the same shard
//! never block each other. `parking_lot`'s arc-based guards
//! (`RwLock::read_arc`/`write_arc`) let a lookup hand back a lock on an
//! entry that outlives the shard lock without unsafe code.

use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};

use crate::lru::{LruList, NodeIndex};

/// A handle to a locked cache entry. Dropping it releases the per-entry
/// lock; it never holds the shard mutex.
pub enum EntryHandle<D> {
    Read(ArcRwLockReadGuard<RawRwLock, D>),
    Write(ArcRwLockWriteGuard<RawRwLock, D>),
}

impl<D> EntryHandle<D> {
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write(_))
    }
}

impl<D> std::ops::Deref for EntryHandle<D> {
    type Target = D;

    fn deref(&self) -> &D {
        match self {
            Self::Read(g) => g,
            Self::Write(g) => g,
        }
    }
}

impl<D> std::ops::DerefMut for EntryHandle<D> {
    /// # Panics
    ///
    /// Panics if this handle was obtained with `want_write = false`.
    fn deref_mut(&mut self) -> &mut D {
        match self {
            Self::Read(_) => panic!("attempted to mutate through a read-locked entry handle"),
            Self::Write(g) => g,
        }
    }
}

struct Slot<K, D> {
    key: K,
    data: Arc<RwLock<D>>,
    size: usize,
}

struct ShardState<K, D> {
    table: HashMap<K, NodeIndex>,
    slots: Vec<Option<Slot<K, D>>>,
    lru: LruList,
    bytes: usize,
}

impl<K, D> ShardState<K, D>
where
    K: Eq + Hash + Clone,
{
    fn new(capacity_entries: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity_entries);
        slots.resize_with(capacity_entries, || None);
        Self {
            table: HashMap::with_capacity(capacity_entries),
            slots,
            lru: LruList::new(capacity_entries),
            bytes: 0,
        }
    }

    /// Evicts entries from the LRU tail until `bytes` is within `budget`,
    /// skipping (and leaving in place) any victim whose entry lock is
    /// currently held. Gives up once every entry has been tried once, to
    /// avoid spinning under heavy contention.
    fn evict_until_within_budget(&mut self, budget: usize) {
        let mut attempts = self.lru.len();
        let mut cursor = self.lru.tail();
        while self.bytes > budget && attempts > 0 {
            let Some(idx) = cursor else { break };
            attempts -= 1;
            let next_cursor = self.lru.older_than(idx);
            let evictable = self.slots[idx as usize]
                .as_ref()
                .is_some_and(|slot| slot.data.try_write_arc().is_some());
            if evictable {
                if let Some(slot) = self.slots[idx as usize].take() {
                    self.bytes = self.bytes.saturating_sub(slot.size);
                    self.table.remove(&slot.key);
                }
                self.lru.remove(idx);
                cursor = self.lru.tail();
            } else {
                cursor = next_cursor;
            }
        }
    }
}

/// A sharded, size-bounded associative container with per-entry locking.
pub struct ShardedMap<K, D, S = foldhash::fast::RandomState> {
    shards: Box<[Mutex<ShardState<K, D>>]>,
    shard_mask: u64,
    shard_budget: usize,
    hasher: S,
}

impl<K, D, S> ShardedMap<K, D, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Default,
{
    /// Creates a map with `num_shards` shards (rounded up to a power of
    /// two), each able to hold up to `capacity_per_shard` entries and
    /// `total_budget_bytes / num_shards` tracked bytes.
    #[must_use]
    pub fn new(num_shards: usize, capacity_per_shard: usize, total_budget_bytes: usize) -> Self {
        let num_shards = num_shards.max(1).next_power_of_two();
        let shards = (0..num_shards)
            .map(|_| Mutex::new(ShardState::new(capacity_per_shard)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            shard_mask: (num_shards - 1) as u64,
            shard_budget: total_budget_bytes / num_shards,
            hasher: S::default(),
        }
    }

    #[must_use]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    #[must_use]
    pub fn hash_key(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    fn shard_for(&self, hash: u64) -> &Mutex<ShardState<K, D>> {
        // Shift away the low bits before masking so that shard selection
        // is decorrelated from the table's own intra-shard chaining.
        const SHARD_SELECTOR_SHIFT: u32 = 16;
        let idx = (hash >> SHARD_SELECTOR_SHIFT) & self.shard_mask;
        &self.shards[idx as usize]
    }

    /// Looks up `key`, promoting it to the LRU front on hit. Returns a
    /// locked handle that must be dropped to release the entry lock; the
    /// shard mutex is never held while the caller holds the returned
    /// handle.
    #[must_use]
    pub fn lookup(&self, hash: u64, key: &K, want_write: bool) -> Option<EntryHandle<D>> {
        let data = {
            let mut shard = self.shard_for(hash).lock();
            let idx = *shard.table.get(key)?;
            shard.lru.promote(idx);
            shard.slots[idx as usize].as_ref().map(|slot| Arc::clone(&slot.data))?
        };
        Some(if want_write {
            EntryHandle::Write(RwLock::write_arc(&data))
        } else {
            EntryHandle::Read(RwLock::read_arc(&data))
        })
    }

    /// Inserts `data` for `key`, evicting from the LRU tail as needed to
    /// stay within the shard's byte budget. `size` is the caller-computed
    /// cost of this entry.
    pub fn insert(&self, hash: u64, key: K, data: D, size: usize) {
        let mut shard = self.shard_for(hash).lock();

        if let Some(&idx) = shard.table.get(&key) {
            let old_size = shard.slots[idx as usize].as_ref().map_or(0, |s| s.size);
            shard.bytes = shard.bytes.saturating_sub(old_size) + size;
            shard.slots[idx as usize] = Some(Slot {
                key,
                data: Arc::new(RwLock::new(data)),
                size,
            });
            shard.lru.promote(idx);
            let budget = self.shard_budget;
            shard.evict_until_within_budget(budget);
            return;
        }

        if shard.lru.is_full() {
            let budget = self.shard_budget.saturating_sub(1);
            shard.evict_until_within_budget(budget);
        }

        let Some(idx) = shard.lru.push_front() else {
            // Every victim's lock was contended; drop the insert rather
            // than overrun the slab.
            return;
        };
        shard.slots[idx as usize] = Some(Slot {
            key: key.clone(),
            data: Arc::new(RwLock::new(data)),
            size,
        });
        shard.table.insert(key, idx);
        shard.bytes += size;
        let budget = self.shard_budget;
        shard.evict_until_within_budget(budget);
    }

    /// Total bytes tracked across all shards.
    #[must_use]
    pub fn mem_usage(&self) -> usize {
        self.shards.iter().map(|s| s.lock().bytes).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().lru.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, D, S> std::fmt::Debug for ShardedMap<K, D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedMap")
            .field("num_shards", &self.shards.len())
            .field("shard_budget", &self.shard_budget)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> ShardedMap<u32, u32> {
        ShardedMap::new(4, 8, 1_000_000)
    }

    #[test]
    fn insert_then_lookup_roundtrips() {
        let m = map();
        let h = m.hash_key(&42);
        m.insert(h, 42, 100, 16);
        let entry = m.lookup(h, &42, false).expect("present");
        assert_eq!(*entry, 100);
    }

    #[test]
    fn missing_key_is_none() {
        let m = map();
        let h = m.hash_key(&7);
        assert!(m.lookup(h, &7, false).is_none());
    }

    #[test]
    fn write_handle_allows_mutation() {
        let m = map();
        let h = m.hash_key(&1);
        m.insert(h, 1, 10, 8);
        {
            let mut entry = m.lookup(h, &1, true).expect("entry present");
            *entry = 99;
        }
        let entry = m.lookup(h, &1, false).expect("entry present");
        assert_eq!(*entry, 99);
    }

    #[test]
    fn eviction_respects_byte_budget() {
        // One shard, budget for roughly two entries of size 64.
        let m: ShardedMap<u32, [u8; 32]> = ShardedMap::new(1, 16, 130);
        for i in 0..8u32 {
            let h = m.hash_key(&i);
            m.insert(h, i, [0u8; 32], 64);
        }
        assert!(m.mem_usage() <= 130);
        let h7 = m.hash_key(&7);
        assert!(m.lookup(h7, &7, false).is_some());
    }

    #[test]
    fn capacity_bounds_entry_count_independent_of_bytes() {
        let m: ShardedMap<u32, u8> = ShardedMap::new(1, 3, 1_000_000);
        for i in 0..10u32 {
            let h = m.hash_key(&i);
            m.insert(h, i, 0, 1);
        }
        assert!(m.len() <= 3);
    }
}
