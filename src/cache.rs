// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! [`InfraCache`]: the facade tying the host-info store, the two rate
//! limiters and the domain policy tree together behind one configuration.

use std::net::{IpAddr, SocketAddr};

use crate::config::InfraCacheConfig;
use crate::constants::PER_LOCK_OVERHEAD_BYTES;
use crate::cookie::{Cookie, CookieUpdate};
use crate::host::{HostData, HostLookup, HostSnapshot, HostStore, LameRtt, QType};
use crate::key::{HostKey, RateKey, ZoneName};
use crate::policy::DomainLimitTree;
use crate::ratelimit::{DomainRateLimiter, IpRateLimiter, RateData};

const AVERAGE_ZONE_NAME_BYTES: usize = 32;

fn host_budget_bytes(config: &InfraCacheConfig) -> usize {
    let per_entry =
        std::mem::size_of::<HostKey>() + AVERAGE_ZONE_NAME_BYTES + std::mem::size_of::<HostData>() + PER_LOCK_OVERHEAD_BYTES;
    config.infra_cache_numhosts.saturating_mul(per_entry)
}

fn host_capacity_per_shard(config: &InfraCacheConfig) -> usize {
    (config.infra_cache_numhosts / config.infra_cache_slabs.max(1)).max(1)
}

fn domain_rate_capacity_per_shard(config: &InfraCacheConfig) -> usize {
    let per_entry = std::mem::size_of::<RateKey>() + AVERAGE_ZONE_NAME_BYTES + std::mem::size_of::<RateData>() + PER_LOCK_OVERHEAD_BYTES;
    ((config.ratelimit_size / config.ratelimit_slabs.max(1)) / per_entry.max(1)).max(1)
}

fn ip_rate_capacity_per_shard(config: &InfraCacheConfig) -> usize {
    let per_entry = std::mem::size_of::<IpAddr>() + std::mem::size_of::<RateData>() + PER_LOCK_OVERHEAD_BYTES;
    ((config.ip_ratelimit_size / config.ip_ratelimit_slabs.max(1)) / per_entry.max(1)).max(1)
}

fn build_policy_tree(config: &InfraCacheConfig) -> DomainLimitTree {
    let mut tree = DomainLimitTree::new(config.ratelimit);
    for entry in &config.ratelimit_for_domain {
        tree.insert_exact(&entry.name, entry.limit);
    }
    for entry in &config.ratelimit_below_domain {
        tree.insert_below(&entry.name, entry.limit);
    }
    tree
}

/// The infrastructure cache: per-server RTT/capability/cookie state, and
/// per-domain and per-client-IP query-rate limiting.
pub struct InfraCache {
    host: HostStore,
    domain_rate: DomainRateLimiter,
    ip_rate: IpRateLimiter,
    policy: DomainLimitTree,
    config: InfraCacheConfig,
}

impl std::fmt::Debug for InfraCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfraCache").field("config", &self.config).finish_non_exhaustive()
    }
}

impl InfraCache {
    #[must_use]
    pub fn new(config: InfraCacheConfig) -> Self {
        let host = HostStore::new(
            config.infra_cache_slabs,
            host_capacity_per_shard(&config),
            host_budget_bytes(&config),
            config.host_ttl,
            config.infra_keep_probing,
        );
        let domain_rate = DomainRateLimiter::new(
            config.ratelimit_slabs,
            domain_rate_capacity_per_shard(&config),
            config.ratelimit_size,
            "domain",
        );
        let ip_rate = IpRateLimiter::new(
            config.ip_ratelimit_slabs,
            ip_rate_capacity_per_shard(&config),
            config.ip_ratelimit_size,
            "ip",
        );
        let policy = build_policy_tree(&config);
        Self {
            host,
            domain_rate,
            ip_rate,
            policy,
            config,
        }
    }

    /// Replaces the configuration in place. The caller is expected to hold
    /// an external writer lock serialising this against concurrent cache
    /// operations (the policy tree and per-store shard layout are not
    /// internally synchronised against `adjust`). A shard-count or
    /// byte-budget change for a given store rebuilds that store from
    /// scratch, discarding its contents; a change to a scalar limit or
    /// `host_ttl`/`infra_keep_probing` does not.
    pub fn adjust(&mut self, new_config: InfraCacheConfig) {
        if (self.config.infra_cache_slabs, self.config.infra_cache_numhosts)
            != (new_config.infra_cache_slabs, new_config.infra_cache_numhosts)
        {
            tracing::warn!("host store layout changed on adjust; rebuilding, contents lost");
            self.host = HostStore::new(
                new_config.infra_cache_slabs,
                host_capacity_per_shard(&new_config),
                host_budget_bytes(&new_config),
                new_config.host_ttl,
                new_config.infra_keep_probing,
            );
        } else {
            self.host.set_host_ttl(new_config.host_ttl);
            self.host.set_keep_probing(new_config.infra_keep_probing);
        }

        if (self.config.ratelimit_slabs, self.config.ratelimit_size) != (new_config.ratelimit_slabs, new_config.ratelimit_size) {
            tracing::warn!("domain rate-limit map layout changed on adjust; rebuilding, contents lost");
            self.domain_rate = DomainRateLimiter::new(
                new_config.ratelimit_slabs,
                domain_rate_capacity_per_shard(&new_config),
                new_config.ratelimit_size,
                "domain",
            );
        }

        if (self.config.ip_ratelimit_slabs, self.config.ip_ratelimit_size)
            != (new_config.ip_ratelimit_slabs, new_config.ip_ratelimit_size)
        {
            tracing::warn!("client-IP rate-limit map layout changed on adjust; rebuilding, contents lost");
            self.ip_rate = IpRateLimiter::new(
                new_config.ip_ratelimit_slabs,
                ip_rate_capacity_per_shard(&new_config),
                new_config.ip_ratelimit_size,
                "ip",
            );
        }

        self.policy = build_policy_tree(&new_config);
        self.config = new_config;
    }

    /// Total bytes tracked across the host store and both rate limiters.
    #[must_use]
    pub fn mem_usage(&self) -> usize {
        self.host.mem_usage() + self.domain_rate.mem_usage() + self.ip_rate.mem_usage()
    }

    #[must_use]
    pub fn host_lookup(&self, addr: SocketAddr, zone: ZoneName, now: i64) -> HostLookup {
        self.host.host_lookup(addr, zone, now)
    }

    pub fn set_lame(&self, addr: SocketAddr, zone: ZoneName, now: i64, dnssec_lame: bool, rec_lame: bool, qtype: QType) {
        self.host.set_lame(addr, zone, now, dnssec_lame, rec_lame, qtype);
    }

    pub fn rtt_update(
        &self,
        addr: SocketAddr,
        zone: ZoneName,
        qtype: QType,
        measured_ms: i32,
        original_rtt_on_entry: i32,
        now: i64,
    ) {
        self.host.rtt_update(addr, zone, qtype, measured_ms, original_rtt_on_entry, now);
    }

    pub fn update_tcp_works(&self, addr: SocketAddr, zone: ZoneName) {
        self.host.update_tcp_works(addr, zone);
    }

    pub fn edns_update(&self, addr: SocketAddr, zone: ZoneName, version: i32, now: i64) {
        self.host.edns_update(addr, zone, version, now);
    }

    #[must_use]
    pub fn get_cookie(&self, addr: SocketAddr, zone: ZoneName, now: i64) -> Cookie {
        self.host.get_cookie(addr, zone, now)
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
        self.host.set_server_cookie(addr, zone, now, interface, client, server)
    }

    #[must_use]
    pub fn get_lame_rtt(&self, addr: SocketAddr, zone: ZoneName, qtype: QType, now: i64) -> Option<LameRtt> {
        self.host.get_lame_rtt(addr, zone, qtype, now)
    }

    #[must_use]
    pub fn host_snapshot(&self, addr: SocketAddr, zone: ZoneName, now: i64) -> Option<HostSnapshot> {
        self.host.snapshot(addr, zone, now)
    }

    /// Resolves `name`'s configured limit and increments its current-second
    /// counter; returns whether the query should be allowed. `ratelimit ==
    /// 0` in the active configuration is a master off switch: it disables
    /// domain rate limiting entirely, including any configured per-domain
    /// overrides.
    pub fn ratelimit_inc(&self, name: ZoneName, now: i64, backoff: bool) -> bool {
        if self.config.ratelimit == 0 {
            return true;
        }
        let limit = self.policy.find_ratelimit(&name);
        self.domain_rate.inc(name, limit, now, backoff)
    }

    #[must_use]
    pub fn ratelimit_exceeded(&self, name: &ZoneName, now: i64, backoff: bool) -> bool {
        if self.config.ratelimit == 0 {
            return false;
        }
        let limit = self.policy.find_ratelimit(name);
        self.domain_rate.exceeded(name, limit, now, backoff)
    }

    pub fn ratelimit_dec(&self, name: &ZoneName, now: i64) {
        self.domain_rate.dec(name, now);
    }

    pub fn ip_ratelimit_inc(&self, addr: IpAddr, now: i64, backoff: bool) -> bool {
        self.ip_rate.inc(addr, self.config.ip_ratelimit, now, backoff)
    }

    #[must_use]
    pub fn ip_ratelimit_exceeded(&self, addr: &IpAddr, now: i64, backoff: bool) -> bool {
        self.ip_rate.exceeded(addr, self.config.ip_ratelimit, now, backoff)
    }

    pub fn ip_ratelimit_dec(&self, addr: &IpAddr, now: i64) {
        self.ip_rate.dec(addr, now);
    }
}
