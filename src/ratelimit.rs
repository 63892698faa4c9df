// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sliding-window query-rate counter, shared by the per-domain limiter and
//! the per-client-IP limiter. Both key types plug into the same
//! [`RateLimiter`]; only the resolved limit and the log label differ.

use std::hash::Hash;
use std::net::IpAddr;

use crate::constants::RATE_WINDOW;
use crate::key::{RateKey, ZoneName};
use crate::shard::ShardedMap;

/// A sparse sliding-window counter: slot `i` holds the query count for
/// second `timestamp[i]`. A miss reuses whichever slot holds the oldest
/// timestamp.
#[derive(Clone, Copy, Debug)]
pub struct RateData {
    qps: [i32; RATE_WINDOW],
    timestamp: [i64; RATE_WINDOW],
}

const NO_TIMESTAMP: i64 = -1;

impl RateData {
    #[must_use]
    pub fn new() -> Self {
        Self {
            qps: [0; RATE_WINDOW],
            timestamp: [NO_TIMESTAMP; RATE_WINDOW],
        }
    }

    /// Count for the current second (`backoff = false`) or the peak count
    /// over the trailing [`RATE_WINDOW`]-second window (`backoff = true`).
    #[must_use]
    pub fn rate_max(&self, now: i64, backoff: bool) -> i32 {
        if backoff {
            self.timestamp
                .iter()
                .zip(self.qps.iter())
                .filter(|(&ts, _)| ts != NO_TIMESTAMP && now - ts <= RATE_WINDOW as i64 && ts <= now)
                .map(|(_, &qps)| qps)
                .max()
                .unwrap_or(0)
        } else {
            self.rate_get_second(now).copied().unwrap_or(0)
        }
    }

    /// Mutable reference to the slot for `now`, allocating (reusing the
    /// slot with the smallest timestamp, zeroed) if none matches.
    pub fn rate_give_second(&mut self, now: i64) -> &mut i32 {
        if let Some(idx) = self.timestamp.iter().position(|&ts| ts == now) {
            return &mut self.qps[idx];
        }
        let (idx, _) = self
            .timestamp
            .iter()
            .enumerate()
            .min_by_key(|&(_, &ts)| ts)
            .expect("RATE_WINDOW is non-zero");
        self.timestamp[idx] = now;
        self.qps[idx] = 0;
        &mut self.qps[idx]
    }

    /// As [`Self::rate_give_second`] but does not allocate a slot.
    pub fn rate_get_second(&self, now: i64) -> Option<&i32> {
        self.timestamp.iter().position(|&ts| ts == now).map(|idx| &self.qps[idx])
    }

    fn rate_get_second_mut(&mut self, now: i64) -> Option<&mut i32> {
        self.timestamp.iter().position(|&ts| ts == now).map(move |idx| &mut self.qps[idx])
    }
}

impl Default for RateData {
    fn default() -> Self {
        Self::new()
    }
}

/// A key type usable with [`RateLimiter`]: needs only a byte cost for the
/// sharded map's size accounting.
pub trait RateLimiterKey: Eq + Hash + Clone {
    fn byte_cost(&self) -> usize;
}

impl RateLimiterKey for ZoneName {
    fn byte_cost(&self) -> usize {
        self.as_wire().len()
    }
}

impl RateLimiterKey for IpAddr {
    fn byte_cost(&self) -> usize {
        match self {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        }
    }
}

fn entry_size<K: RateLimiterKey>(key: &K) -> usize {
    std::mem::size_of::<K>() + key.byte_cost() + std::mem::size_of::<RateData>() + crate::constants::PER_LOCK_OVERHEAD_BYTES
}

/// A sliding-window rate limiter generic over its key type.
pub struct RateLimiter<K> {
    map: ShardedMap<K, RateData>,
    kind: &'static str,
}

impl<K> std::fmt::Debug for RateLimiter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl<K: RateLimiterKey> RateLimiter<K> {
    #[must_use]
    pub fn new(num_shards: usize, capacity_per_shard: usize, budget_bytes: usize, kind: &'static str) -> Self {
        Self {
            map: ShardedMap::new(num_shards, capacity_per_shard, budget_bytes),
            kind,
        }
    }

    #[must_use]
    pub fn mem_usage(&self) -> usize {
        self.map.mem_usage()
    }

    /// Increments the current-second count for `key` and reports whether
    /// the query should be allowed. A `limit <= 0` means rate limiting is
    /// disabled for this key and every call is allowed without touching
    /// the store.
    pub fn inc(&self, key: K, limit: i32, now: i64, backoff: bool) -> bool {
        if limit <= 0 {
            return true;
        }
        let hash = self.map.hash_key(&key);
        if self.map.lookup(hash, &key, false).is_none() {
            let size = entry_size(&key);
            self.map.insert(hash, key.clone(), RateData::new(), size);
        }
        let Some(mut w) = self.map.lookup(hash, &key, true) else {
            return true;
        };
        let pre = w.rate_max(now, backoff);
        *w.rate_give_second(now) += 1;
        let post = w.rate_max(now, backoff);
        if pre <= limit && limit < post {
            tracing::info!(kind = self.kind, limit, pre, post, "rate limit exceeded");
        }
        post <= limit
    }

    /// Decrements the current-second count for `key`, clamped at zero. A
    /// no-op if the current second has no slot (nothing to refund).
    pub fn dec(&self, key: &K, now: i64) {
        let hash = self.map.hash_key(key);
        if let Some(mut w) = self.map.lookup(hash, key, true) {
            if let Some(slot) = w.rate_get_second_mut(now) {
                *slot = (*slot - 1).max(0);
            }
        }
    }

    /// Non-mutating check: would `key` currently be over `limit`? Used by
    /// callers that need to test admission without counting a query.
    #[must_use]
    pub fn exceeded(&self, key: &K, limit: i32, now: i64, backoff: bool) -> bool {
        if limit <= 0 {
            return false;
        }
        let hash = self.map.hash_key(key);
        match self.map.lookup(hash, key, false) {
            Some(r) => r.rate_max(now, backoff) > limit,
            None => false,
        }
    }
}

/// Rate limiter keyed by destination domain name.
pub type DomainRateLimiter = RateLimiter<RateKey>;

/// Rate limiter keyed by client IP address (port ignored).
pub type IpRateLimiter = RateLimiter<IpAddr>;
