// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration surface consumed once at `InfraCache::new` and replaced
//! wholesale by `adjust`.

use thiserror::Error;

use crate::key::ZoneName;

/// A `(name, limit)` policy entry, as configured for either an exact-match
/// or a below-match rule.
#[derive(Clone, Debug)]
pub struct DomainLimit {
    pub name: ZoneName,
    pub limit: i32,
}

/// Validation failure building an [`InfraCacheConfig`].
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be a power of two, got {value}")]
    NotPowerOfTwo { field: &'static str, value: usize },
}

fn require_power_of_two(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 || !value.is_power_of_two() {
        return Err(ConfigError::NotPowerOfTwo { field, value });
    }
    Ok(())
}

/// Every tunable the infrastructure cache consumes, per the external
/// interface table: host map sizing, the default and per-domain rate
/// limits, the client-IP limiter, and `host_ttl`/`infra_keep_probing`.
#[derive(Clone, Debug)]
pub struct InfraCacheConfig {
    pub infra_cache_numhosts: usize,
    pub infra_cache_slabs: usize,
    pub host_ttl: i64,
    pub infra_keep_probing: bool,

    pub ratelimit: i32,
    pub ratelimit_size: usize,
    pub ratelimit_slabs: usize,
    pub ratelimit_for_domain: Vec<DomainLimit>,
    pub ratelimit_below_domain: Vec<DomainLimit>,

    pub ip_ratelimit: i32,
    pub ip_ratelimit_size: usize,
    pub ip_ratelimit_slabs: usize,
}

impl InfraCacheConfig {
    #[must_use]
    pub fn builder() -> InfraCacheConfigBuilder {
        InfraCacheConfigBuilder::default()
    }
}

/// Builder for [`InfraCacheConfig`], validating shard counts are powers
/// of two before producing a usable config.
#[derive(Debug)]
pub struct InfraCacheConfigBuilder {
    infra_cache_numhosts: usize,
    infra_cache_slabs: usize,
    host_ttl: i64,
    infra_keep_probing: bool,

    ratelimit: i32,
    ratelimit_size: usize,
    ratelimit_slabs: usize,
    ratelimit_for_domain: Vec<DomainLimit>,
    ratelimit_below_domain: Vec<DomainLimit>,

    ip_ratelimit: i32,
    ip_ratelimit_size: usize,
    ip_ratelimit_slabs: usize,
}

impl Default for InfraCacheConfigBuilder {
    fn default() -> Self {
        Self {
            infra_cache_numhosts: 10_000,
            infra_cache_slabs: 4,
            host_ttl: 900,
            infra_keep_probing: false,
            ratelimit: 0,
            ratelimit_size: 4 << 20,
            ratelimit_slabs: 4,
            ratelimit_for_domain: Vec::new(),
            ratelimit_below_domain: Vec::new(),
            ip_ratelimit: 0,
            ip_ratelimit_size: 4 << 20,
            ip_ratelimit_slabs: 4,
        }
    }
}

impl InfraCacheConfigBuilder {
    #[must_use]
    pub fn infra_cache_numhosts(mut self, n: usize) -> Self {
        self.infra_cache_numhosts = n;
        self
    }

    #[must_use]
    pub fn infra_cache_slabs(mut self, n: usize) -> Self {
        self.infra_cache_slabs = n;
        self
    }

    #[must_use]
    pub fn host_ttl(mut self, seconds: i64) -> Self {
        self.host_ttl = seconds;
        self
    }

    #[must_use]
    pub fn infra_keep_probing(mut self, keep: bool) -> Self {
        self.infra_keep_probing = keep;
        self
    }

    #[must_use]
    pub fn ratelimit(mut self, qps: i32) -> Self {
        self.ratelimit = qps;
        self
    }

    #[must_use]
    pub fn ratelimit_size(mut self, bytes: usize) -> Self {
        self.ratelimit_size = bytes;
        self
    }

    #[must_use]
    pub fn ratelimit_slabs(mut self, n: usize) -> Self {
        self.ratelimit_slabs = n;
        self
    }

    #[must_use]
    pub fn ratelimit_for_domain(mut self, entries: Vec<DomainLimit>) -> Self {
        self.ratelimit_for_domain = entries;
        self
    }

    #[must_use]
    pub fn ratelimit_below_domain(mut self, entries: Vec<DomainLimit>) -> Self {
        self.ratelimit_below_domain = entries;
        self
    }

    #[must_use]
    pub fn ip_ratelimit(mut self, qps: i32) -> Self {
        self.ip_ratelimit = qps;
        self
    }

    #[must_use]
    pub fn ip_ratelimit_size(mut self, bytes: usize) -> Self {
        self.ip_ratelimit_size = bytes;
        self
    }

    #[must_use]
    pub fn ip_ratelimit_slabs(mut self, n: usize) -> Self {
        self.ip_ratelimit_slabs = n;
        self
    }

    pub fn build(self) -> Result<InfraCacheConfig, ConfigError> {
        require_power_of_two("infra_cache_slabs", self.infra_cache_slabs)?;
        require_power_of_two("ratelimit_slabs", self.ratelimit_slabs)?;
        require_power_of_two("ip_ratelimit_slabs", self.ip_ratelimit_slabs)?;
        Ok(InfraCacheConfig {
            infra_cache_numhosts: self.infra_cache_numhosts,
            infra_cache_slabs: self.infra_cache_slabs,
            host_ttl: self.host_ttl,
            infra_keep_probing: self.infra_keep_probing,
            ratelimit: self.ratelimit,
            ratelimit_size: self.ratelimit_size,
            ratelimit_slabs: self.ratelimit_slabs,
            ratelimit_for_domain: self.ratelimit_for_domain,
            ratelimit_below_domain: self.ratelimit_below_domain,
            ip_ratelimit: self.ip_ratelimit,
            ip_ratelimit_size: self.ip_ratelimit_size,
            ip_ratelimit_slabs: self.ip_ratelimit_slabs,
        })
    }
}
