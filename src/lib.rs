// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! An in-memory infrastructure cache for a recursive DNS resolver.
//!
//! This crate tracks, per upstream server and destination zone, the state a
//! resolver needs to pick a good server and avoid hammering a bad one:
//!
//! 1. **RTT estimation.** A Jacobson/Karels-style smoothed round-trip
//!    estimator (see [`rtt`]) drives the timeout handed back on each lookup,
//!    with exponential backoff on consecutive timeouts and a probe-admission
//!    window for servers that have maxed out.
//! 2. **Capability and lameness tracking.** EDNS version, lameness flags
//!    (DNSSEC, recursion, per-query-type) and RFC 7873 DNS cookie state
//!    (see [`cookie`]) are tracked per server and fold monotonically: once a
//!    server is known lame or known to support a capability, only a TTL
//!    re-initialisation clears that knowledge.
//! 3. **Sharded, size-bounded storage.** Server state lives in
//!    [`shard::ShardedMap`], a generic sharded hash map where each shard's
//!    mutex guards only table/LRU bookkeeping; entry data is reached through
//!    its own per-entry lock so that two readers in the same shard never
//!    block each other.
//! 4. **Rate limiting.** Per-domain and per-client-IP sliding-window query
//!    counters (see [`ratelimit`]), with per-domain limits resolved through
//!    a longest-prefix-match policy tree (see [`policy`]) configured once at
//!    startup.
//!
//! All of it is exposed through one facade, [`InfraCache`], built from an
//! [`InfraCacheConfig`].
//!
//! # Example
//!
//! ```
//! use infra_cache::{InfraCache, InfraCacheConfig, QType, ZoneName};
//!
//! let config = InfraCacheConfig::builder()
//!     .infra_cache_numhosts(1_000)
//!     .build()
//!     .expect("power-of-two shard counts");
//! let cache = InfraCache::new(config);
//!
//! let addr = "192.0.2.1:53".parse().expect("valid address");
//! let zone = ZoneName::from_wire(b"\x07example\x03com\x00");
//!
//! let first = cache.host_lookup(addr, zone.clone(), 0);
//! cache.rtt_update(addr, zone.clone(), QType::A, 42, first.timeout_ms, 0);
//! let second = cache.host_lookup(addr, zone, 0);
//! assert!(second.timeout_ms < first.timeout_ms);
//! ```
//!
//! # Concurrency
//!
//! Every [`InfraCache`] method takes `&self`; the facade is meant to be
//! shared behind an `Arc` across resolver worker threads. [`InfraCache::adjust`]
//! takes `&mut self` and is expected to run under an external writer lock
//! (e.g. during a configuration reload), since it may rebuild individual
//! stores in place.

mod cache;
mod config;
mod constants;
mod cookie;
mod host;
mod key;
mod lru;
mod policy;
mod probe;
mod ratelimit;
mod shard;

pub use cache::InfraCache;
pub use config::{ConfigError, DomainLimit, InfraCacheConfig, InfraCacheConfigBuilder};
pub use cookie::{Cookie, CookieState, CookieUpdate};
pub use host::{HostLookup, HostSnapshot, LameRtt, QType};
pub use key::{HostKey, IpRateKey, RateKey, ZoneName};
