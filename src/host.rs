// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-(address, zone) server state: EDNS capability, lameness, the RTT
//! record, DNS cookies and per-query-type timeout counters.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::constants::{
    INITIAL_TIMEOUT, PER_LOCK_OVERHEAD_BYTES, PROBE_MAXRTO, RTT_MAX_TIMEOUT, TIMEOUT_COUNT_MAX, USEFUL_SERVER_TOP_TIMEOUT,
};
use crate::cookie::{Cookie, CookieUpdate};
use crate::key::{HostKey, ZoneName};
use crate::probe::{family_probing_allowed, probe_clamped_rtt, probe_delay_seconds, should_arm_probe_delay};
use crate::rtt::RttEstimate;
use crate::shard::ShardedMap;

/// Which query family a timeout or lameness observation applies to.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum QType {
    A,
    Aaaa,
    Other,
}

/// Per-(address, zone) server state.
#[derive(Clone, Debug)]
pub struct HostData {
    pub ttl_deadline: i64,
    pub rtt: RttEstimate,
    pub edns_version: i32,
    pub edns_lame_known: bool,
    pub probedelay: i64,
    pub cookie: Cookie,
    pub dnssec_lame: bool,
    pub recursion_lame: bool,
    pub lame_for_a: bool,
    pub lame_for_other: bool,
    pub timeout_a: u8,
    pub timeout_aaaa: u8,
    pub timeout_other: u8,
}

impl HostData {
    fn new(ttl_deadline: i64, rng: &Mutex<fastrand::Rng>) -> Self {
        Self {
            ttl_deadline,
            rtt: RttEstimate::init(INITIAL_TIMEOUT),
            edns_version: 0,
            edns_lame_known: false,
            probedelay: 0,
            cookie: Cookie::new(rng),
            dnssec_lame: false,
            recursion_lame: false,
            lame_for_a: false,
            lame_for_other: false,
            timeout_a: 0,
            timeout_aaaa: 0,
            timeout_other: 0,
        }
    }

    /// Rebuilds an entry for TTL re-initialisation. When `preserve_penalty`
    /// is set (the old `rtt.rto` was at or above the "unusable" ceiling),
    /// the RTO, probe delay and timeout counters survive the reinit so a
    /// long-broken server stays throttled rather than getting a clean
    /// slate.
    fn reinit(old: &Self, preserve_penalty: bool, new_ttl_deadline: i64, rng: &Mutex<fastrand::Rng>) -> Self {
        let mut fresh = Self::new(new_ttl_deadline, rng);
        fresh.cookie = old.cookie.reinit_preserving_client_bytes();
        if preserve_penalty {
            fresh.rtt.set_rto(USEFUL_SERVER_TOP_TIMEOUT);
            fresh.probedelay = old.probedelay;
            fresh.timeout_a = old.timeout_a;
            fresh.timeout_aaaa = old.timeout_aaaa;
            fresh.timeout_other = old.timeout_other;
        }
        fresh
    }

    fn timeout_counter(&self, qtype: QType) -> u8 {
        match qtype {
            QType::A => self.timeout_a,
            QType::Aaaa => self.timeout_aaaa,
            QType::Other => self.timeout_other,
        }
    }

    fn bump_timeout_counter(&mut self, qtype: QType) {
        let counter = match qtype {
            QType::A => &mut self.timeout_a,
            QType::Aaaa => &mut self.timeout_aaaa,
            QType::Other => &mut self.timeout_other,
        };
        *counter = counter.saturating_add(1).min(TIMEOUT_COUNT_MAX);
    }

    fn clear_timeout_counter(&mut self, qtype: QType) {
        match qtype {
            QType::A => self.timeout_a = 0,
            QType::Aaaa => self.timeout_aaaa = 0,
            QType::Other => self.timeout_other = 0,
        }
    }
}

/// `host_lookup`'s return value.
#[derive(Clone, Copy, Debug)]
pub struct HostLookup {
    pub edns_version: i32,
    pub edns_lame_known: bool,
    pub timeout_ms: i32,
}

/// `get_lame_rtt`'s return value; `None` means no usable information (the
/// server has never been queried, or its entry expired with no penalty
/// worth preserving).
#[derive(Clone, Copy, Debug)]
pub struct LameRtt {
    pub lame: bool,
    pub dnssec_lame: bool,
    pub rec_lame: bool,
    pub rtt_ms: i32,
}

/// Read-only diagnostic view of a host entry, used by status reporting
/// rather than the hot query path.
#[derive(Clone, Copy, Debug)]
pub struct HostSnapshot {
    pub ttl_remaining: i64,
    pub srtt: i32,
    pub rto: i32,
    pub probedelay: i64,
    pub timeout_a: u8,
    pub timeout_aaaa: u8,
    pub timeout_other: u8,
}

fn host_entry_size(key: &HostKey) -> usize {
    std::mem::size_of::<HostKey>() + key.zone.as_wire().len() + std::mem::size_of::<HostData>() + PER_LOCK_OVERHEAD_BYTES
}

/// The sharded per-server state store.
pub struct HostStore {
    map: ShardedMap<HostKey, HostData>,
    host_ttl: i64,
    keep_probing: bool,
    rng: Arc<Mutex<fastrand::Rng>>,
}

impl std::fmt::Debug for HostStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStore")
            .field("host_ttl", &self.host_ttl)
            .field("keep_probing", &self.keep_probing)
            .finish_non_exhaustive()
    }
}

impl HostStore {
    #[must_use]
    pub fn new(num_shards: usize, capacity_per_shard: usize, budget_bytes: usize, host_ttl: i64, keep_probing: bool) -> Self {
        Self {
            map: ShardedMap::new(num_shards, capacity_per_shard, budget_bytes),
            host_ttl,
            keep_probing,
            rng: Arc::new(Mutex::new(fastrand::Rng::new())),
        }
    }

    #[must_use]
    pub fn mem_usage(&self) -> usize {
        self.map.mem_usage()
    }

    pub fn set_host_ttl(&mut self, host_ttl: i64) {
        self.host_ttl = host_ttl;
    }

    pub fn set_keep_probing(&mut self, keep_probing: bool) {
        self.keep_probing = keep_probing;
    }

    /// Ensures an entry exists and is not TTL-expired, creating or
    /// reinitialising it as needed. Returns `true` if this call created or
    /// reinitialised the entry (meaning it carries no history yet this
    /// call shouldn't assume a fresh read reflects prior state).
    fn ensure_fresh(&self, hash: u64, key: &HostKey, now: i64) -> bool {
        if let Some(entry) = self.map.lookup(hash, key, false) {
            if entry.ttl_deadline >= now {
                return false;
            }
            drop(entry);
            if let Some(mut w) = self.map.lookup(hash, key, true) {
                if w.ttl_deadline >= now {
                    return false;
                }
                let preserve_penalty = w.rtt.unclamped() >= USEFUL_SERVER_TOP_TIMEOUT;
                let new_ttl = now + self.host_ttl;
                let fresh = HostData::reinit(&w, preserve_penalty, new_ttl, &self.rng);
                *w = fresh;
                return true;
            }
        }
        let size = host_entry_size(key);
        self.map.insert(hash, key.clone(), HostData::new(now + self.host_ttl, &self.rng), size);
        true
    }

    /// Returns current EDNS/timeout state on a hit, re-initialises on TTL
    /// expiry, and arms a single-probe admission window on a fresh,
    /// stalled entry.
    #[must_use]
    pub fn host_lookup(&self, addr: SocketAddr, zone: ZoneName, now: i64) -> HostLookup {
        let key = HostKey::new(addr, zone);
        let hash = self.map.hash_key(&key);
        let just_initialised = self.ensure_fresh(hash, &key, now);

        if !just_initialised {
            if let Some(entry) = self.map.lookup(hash, &key, false) {
                let timeout_ms = entry.rtt.rto();
                let needs_probe_delay = timeout_ms >= PROBE_MAXRTO
                    && should_arm_probe_delay(timeout_ms, self.keep_probing, entry.rtt.no_timeout_srtt());
                let result = HostLookup {
                    edns_version: entry.edns_version,
                    edns_lame_known: entry.edns_lame_known,
                    timeout_ms,
                };
                drop(entry);
                if needs_probe_delay {
                    if let Some(mut w) = self.map.lookup(hash, &key, true) {
                        w.probedelay = now + probe_delay_seconds(timeout_ms) + 1;
                    }
                }
                return result;
            }
        }

        let entry = self.map.lookup(hash, &key, false).expect("ensure_fresh just inserted it");
        HostLookup {
            edns_version: entry.edns_version,
            edns_lame_known: entry.edns_lame_known,
            timeout_ms: entry.rtt.rto(),
        }
    }

    /// Monotone lameness update: once set, a bit is cleared only by TTL
    /// re-initialisation.
    pub fn set_lame(&self, addr: SocketAddr, zone: ZoneName, now: i64, dnssec_lame: bool, rec_lame: bool, qtype: QType) {
        let key = HostKey::new(addr, zone);
        let hash = self.map.hash_key(&key);
        self.ensure_fresh(hash, &key, now);
        if let Some(mut w) = self.map.lookup(hash, &key, true) {
            w.dnssec_lame |= dnssec_lame;
            w.recursion_lame |= rec_lame;
            match qtype {
                QType::A => w.lame_for_a = true,
                QType::Aaaa | QType::Other => w.lame_for_other = true,
            }
        }
    }

    /// Folds a measured round trip (`measured_ms >= 0`) or a timeout
    /// sentinel (`measured_ms == -1`) into the RTT record.
    pub fn rtt_update(
        &self,
        addr: SocketAddr,
        zone: ZoneName,
        qtype: QType,
        measured_ms: i32,
        original_rtt_on_entry: i32,
        now: i64,
    ) {
        let key = HostKey::new(addr, zone);
        let hash = self.map.hash_key(&key);
        let just_initialised = self.ensure_fresh(hash, &key, now);
        let Some(mut w) = self.map.lookup(hash, &key, true) else { return };

        if measured_ms < 0 {
            if just_initialised {
                w.rtt.set_rto(original_rtt_on_entry);
            }
            w.rtt.lost(original_rtt_on_entry);
            w.bump_timeout_counter(qtype);
        } else {
            if w.rtt.unclamped() >= USEFUL_SERVER_TOP_TIMEOUT {
                w.rtt.reset(INITIAL_TIMEOUT);
            }
            w.rtt.update(measured_ms);
            w.probedelay = 0;
            w.clear_timeout_counter(qtype);
        }
    }

    /// Called after a TCP fallback succeeds: deprioritise rather than
    /// discard a server that had maxed out its RTO.
    pub fn update_tcp_works(&self, addr: SocketAddr, zone: ZoneName) {
        let key = HostKey::new(addr, zone);
        let hash = self.map.hash_key(&key);
        if let Some(mut w) = self.map.lookup(hash, &key, true) {
            if w.rtt.unclamped() >= RTT_MAX_TIMEOUT {
                w.rtt.set_rto(RTT_MAX_TIMEOUT - 1000);
            }
        }
    }

    /// Monotone EDNS version update: a "no EDNS" observation (`version ==
    /// -1`) is ignored once we have already confirmed EDNS support for this
    /// server, so a single dropped or malformed reply can't make a
    /// known-EDNS server look EDNS-incapable.
    pub fn edns_update(&self, addr: SocketAddr, zone: ZoneName, version: i32, now: i64) {
        let key = HostKey::new(addr, zone);
        let hash = self.map.hash_key(&key);
        self.ensure_fresh(hash, &key, now);
        if let Some(mut w) = self.map.lookup(hash, &key, true) {
            let keep_known_edns = version < 0 && w.edns_version >= 0 && w.edns_lame_known;
            if !keep_known_edns {
                w.edns_version = version;
                w.edns_lame_known = true;
            }
        }
    }

    #[must_use]
    pub fn get_cookie(&self, addr: SocketAddr, zone: ZoneName, now: i64) -> Cookie {
        let key = HostKey::new(addr, zone);
        let hash = self.map.hash_key(&key);
        self.ensure_fresh(hash, &key, now);
        let entry = self.map.lookup(hash, &key, false).expect("ensure_fresh just inserted it");
        entry.cookie.clone()
    }

    pub fn set_server_cookie(
        &self,
        addr: SocketAddr,
        zone: ZoneName,
        now: i64,
        interface: &[u8],
        client: [u8; 8],
        server: &[u8],
    ) -> CookieUpdate {
        let key = HostKey::new(addr, zone);
        let hash = self.map.hash_key(&key);
        self.ensure_fresh(hash, &key, now);
        match self.map.lookup(hash, &key, true) {
            Some(mut w) => w.cookie.set_server_cookie(interface, client, server),
            None => CookieUpdate::Mismatch,
        }
    }

    /// Read-side server-selection oracle. Does not create or reinitialise
    /// an entry; an expired entry is still reported as a probe candidate
    /// if its penalty (`rto >= USEFUL_SERVER_TOP_TIMEOUT`) would survive
    /// reinit, otherwise it reads as a plain miss.
    #[must_use]
    pub fn get_lame_rtt(&self, addr: SocketAddr, zone: ZoneName, qtype: QType, now: i64) -> Option<LameRtt> {
        let key = HostKey::new(addr, zone);
        let hash = self.map.hash_key(&key);
        let entry = self.map.lookup(hash, &key, false)?;

        let expired = entry.ttl_deadline < now;

        if expired {
            if entry.rtt.unclamped() < USEFUL_SERVER_TOP_TIMEOUT {
                return None;
            }
            return Some(LameRtt {
                lame: false,
                dnssec_lame: false,
                rec_lame: false,
                rtt_ms: USEFUL_SERVER_TOP_TIMEOUT - 1000,
            });
        }

        let probing_allowed = family_probing_allowed(entry.timeout_counter(qtype));
        let type_lame = match qtype {
            QType::A => entry.lame_for_a,
            QType::Aaaa | QType::Other => entry.lame_for_other,
        };
        let rtt_ms = if entry.rtt.unclamped() >= USEFUL_SERVER_TOP_TIMEOUT {
            probe_clamped_rtt(probing_allowed)
        } else {
            entry.rtt.rto()
        };
        Some(LameRtt {
            lame: type_lame || entry.dnssec_lame || entry.recursion_lame,
            dnssec_lame: entry.dnssec_lame,
            rec_lame: entry.recursion_lame,
            rtt_ms,
        })
    }

    /// Read-only diagnostic accessor, distinct from the mutating
    /// `host_lookup`; used by status reporting, not the query path.
    #[must_use]
    pub fn snapshot(&self, addr: SocketAddr, zone: ZoneName, now: i64) -> Option<HostSnapshot> {
        let key = HostKey::new(addr, zone);
        let hash = self.map.hash_key(&key);
        let entry = self.map.lookup(hash, &key, false)?;
        Some(HostSnapshot {
            ttl_remaining: entry.ttl_deadline - now,
            srtt: entry.rtt.no_timeout_srtt(),
            rto: entry.rtt.rto(),
            probedelay: entry.probedelay,
            timeout_a: entry.timeout_a,
            timeout_aaaa: entry.timeout_aaaa,
            timeout_other: entry.timeout_other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MIN_TIMEOUT;
    use crate::key::ZoneName;

    fn store() -> HostStore {
        HostStore::new(1, 64, 1_000_000, 60, false)
    }

    fn zone() -> ZoneName {
        ZoneName::from_wire(b"\x07example\x03com\x00")
    }

    fn addr() -> SocketAddr {
        "1.2.3.4:53".parse().expect("valid address")
    }

    #[test]
    fn first_contact_then_reply_lowers_timeout() {
        let s = store();
        let first = s.host_lookup(addr(), zone(), 1000);
        assert_eq!(first.edns_version, 0);
        assert!(!first.edns_lame_known);
        assert_eq!(first.timeout_ms, INITIAL_TIMEOUT);

        s.rtt_update(addr(), zone(), QType::A, 50, first.timeout_ms, 1000);
        let second = s.host_lookup(addr(), zone(), 1000);
        assert!(second.timeout_ms < first.timeout_ms);
    }

    #[test]
    fn timeout_backoff_sequence() {
        let s = store();
        let _ = s.host_lookup(addr(), zone(), 0);
        s.rtt_update(addr(), zone(), QType::A, -1, 376, 0);
        let snap = s.snapshot(addr(), zone(), 0).expect("entry present");
        assert_eq!(snap.rto, 752);
        assert_eq!(snap.timeout_a, 1);

        s.rtt_update(addr(), zone(), QType::A, -1, 752, 0);
        assert_eq!(s.snapshot(addr(), zone(), 0).expect("entry present").rto, 1504);
        s.rtt_update(addr(), zone(), QType::A, -1, 1504, 0);
        assert_eq!(s.snapshot(addr(), zone(), 0).expect("entry present").rto, 3008);
        assert_eq!(s.snapshot(addr(), zone(), 0).expect("entry present").timeout_a, 3);

        s.rtt_update(addr(), zone(), QType::A, -1, 3008, 0);
        assert_eq!(s.snapshot(addr(), zone(), 0).expect("entry present").timeout_a, 3);
    }

    #[test]
    fn ttl_expiry_preserves_penalty() {
        let s = store();
        let _ = s.host_lookup(addr(), zone(), 0);
        {
            let key = HostKey::new(addr(), zone());
            let hash = s.map.hash_key(&key);
            let mut w = s.map.lookup(hash, &key, true).expect("entry present");
            w.rtt.set_rto(USEFUL_SERVER_TOP_TIMEOUT);
            w.timeout_a = 3;
            w.ttl_deadline = 100;
        }
        let looked_up = s.host_lookup(addr(), zone(), 200);
        assert_eq!(looked_up.timeout_ms, USEFUL_SERVER_TOP_TIMEOUT);
        let snap = s.snapshot(addr(), zone(), 200).expect("entry present");
        assert_eq!(snap.timeout_a, 3);
    }

    #[test]
    fn probing_admission_arms_probedelay() {
        let s = HostStore::new(1, 64, 1_000_000, 60, true);
        {
            let key = HostKey::new(addr(), zone());
            let hash = s.map.hash_key(&key);
            s.map.insert(hash, key, HostData::new(100, &s.rng), 64);
        }
        {
            let key = HostKey::new(addr(), zone());
            let hash = s.map.hash_key(&key);
            let mut w = s.map.lookup(hash, &key, true).expect("entry present");
            w.rtt.set_rto(RTT_MAX_TIMEOUT);
        }
        let _ = s.host_lookup(addr(), zone(), 10);
        let snap = s.snapshot(addr(), zone(), 10).expect("entry present");
        assert!(snap.probedelay >= 10 + 121 - 1 && snap.probedelay <= 10 + 121 + 1);
    }

    #[test]
    fn cookie_learn_and_mismatch() {
        let s = store();
        let cookie = s.get_cookie(addr(), zone(), 0);
        assert_eq!(cookie.state, crate::cookie::CookieState::Unknown);
        let client = cookie.client_bytes;

        let outcome = s.set_server_cookie(addr(), zone(), 0, b"eth0", client, &[5u8; 16]);
        assert_eq!(outcome, CookieUpdate::Accepted);

        let mut other = client;
        other[0] ^= 1;
        let outcome2 = s.set_server_cookie(addr(), zone(), 0, b"eth0", other, &[6u8; 16]);
        assert_eq!(outcome2, CookieUpdate::Mismatch);

        let after = s.get_cookie(addr(), zone(), 0);
        assert_eq!(after.state, crate::cookie::CookieState::Learned);
        assert_eq!(after.server_bytes, [5u8; 16]);
    }

    #[test]
    fn edns_version_never_downgrades_once_confirmed() {
        let s = store();
        s.edns_update(addr(), zone(), 1, 0);
        s.edns_update(addr(), zone(), -1, 0);
        let result = s.host_lookup(addr(), zone(), 0);
        assert_eq!(result.edns_version, 1);
    }

    #[test]
    fn edns_no_edns_observation_recorded_before_first_confirmation() {
        let s = store();
        // edns_lame_known is false before any update, so even a "no EDNS"
        // observation is recorded rather than discarded.
        s.edns_update(addr(), zone(), -1, 0);
        let result = s.host_lookup(addr(), zone(), 0);
        assert_eq!(result.edns_version, -1);
        assert!(result.edns_lame_known);
    }

    #[test]
    fn min_timeout_constant_is_a_valid_floor() {
        assert!(MIN_TIMEOUT < INITIAL_TIMEOUT);
    }
}
