// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end scenario tests, one per numbered scenario in spec.md §8.

use std::net::SocketAddr;

use infra_cache::{CookieUpdate, DomainLimit, InfraCache, InfraCacheConfig, QType, ZoneName};

fn zone(wire: &[u8]) -> ZoneName {
    ZoneName::from_wire(wire)
}

fn example_com() -> ZoneName {
    zone(b"\x07example\x03com\x00")
}

fn addr() -> SocketAddr {
    "1.2.3.4:53".parse().expect("valid address")
}

#[test]
fn scenario_1_first_contact_then_lower_timeout() {
    let cache = InfraCache::new(InfraCacheConfig::builder().build().expect("valid config"));

    let first = cache.host_lookup(addr(), example_com(), 1000);
    assert_eq!(first.edns_version, 0);
    assert!(!first.edns_lame_known);
    assert_eq!(first.timeout_ms, 376);

    cache.rtt_update(addr(), example_com(), QType::A, 50, first.timeout_ms, 1000);
    let second = cache.host_lookup(addr(), example_com(), 1000);
    assert!(second.timeout_ms < first.timeout_ms);
}

#[test]
fn scenario_2_timeout_backoff_sequence() {
    let cache = InfraCache::new(InfraCacheConfig::builder().build().expect("valid config"));
    let first = cache.host_lookup(addr(), example_com(), 0);
    assert_eq!(first.timeout_ms, 376);

    cache.rtt_update(addr(), example_com(), QType::A, -1, 376, 0);
    let snap1 = cache.host_snapshot(addr(), example_com(), 0).expect("entry present");
    assert_eq!(snap1.rto, 752);
    assert_eq!(snap1.timeout_a, 1);

    cache.rtt_update(addr(), example_com(), QType::A, -1, 752, 0);
    let snap2 = cache.host_snapshot(addr(), example_com(), 0).expect("entry present");
    assert_eq!(snap2.rto, 1504);
    assert_eq!(snap2.timeout_a, 2);

    cache.rtt_update(addr(), example_com(), QType::A, -1, 1504, 0);
    let snap3 = cache.host_snapshot(addr(), example_com(), 0).expect("entry present");
    assert_eq!(snap3.rto, 3008);
    assert_eq!(snap3.timeout_a, 3);

    // A fourth timeout saturates the counter but keeps backing off the RTO.
    cache.rtt_update(addr(), example_com(), QType::A, -1, 3008, 0);
    let snap4 = cache.host_snapshot(addr(), example_com(), 0).expect("entry present");
    assert_eq!(snap4.timeout_a, 3);
}

#[test]
fn scenario_3_probing_admission_arms_probedelay() {
    let config = InfraCacheConfig::builder().infra_keep_probing(true).build().expect("valid config");
    let cache = InfraCache::new(config);

    // Drive the server into a maxed-out RTO via repeated timeouts until rto
    // reaches the useful-server ceiling.
    let first = cache.host_lookup(addr(), example_com(), 0);
    let mut original = first.timeout_ms;
    loop {
        cache.rtt_update(addr(), example_com(), QType::A, -1, original, 0);
        let snap = cache.host_snapshot(addr(), example_com(), 0).expect("entry present");
        if snap.rto >= 120_000 {
            break;
        }
        original = snap.rto;
    }

    let looked_up = cache.host_lookup(addr(), example_com(), 10);
    assert!(looked_up.timeout_ms >= 12_000);
    let snap = cache.host_snapshot(addr(), example_com(), 10).expect("entry present");
    assert!(snap.probedelay >= 10 + 120, "probedelay={}", snap.probedelay);

    // A second lookup at the same instant observes the same armed state.
    let second = cache.host_lookup(addr(), example_com(), 10);
    assert_eq!(second.timeout_ms, looked_up.timeout_ms);
}

#[test]
fn scenario_4_rate_limit_threshold_blocks_sixth_call() {
    let config = InfraCacheConfig::builder()
        .ratelimit(100)
        .ratelimit_for_domain(vec![DomainLimit { name: example_com(), limit: 5 }])
        .build()
        .expect("valid config");
    let cache = InfraCache::new(config);

    let mut allowed = Vec::new();
    for _ in 0..6 {
        allowed.push(cache.ratelimit_inc(example_com(), 2000, false));
    }
    assert_eq!(allowed, vec![true, true, true, true, true, false]);
}

#[test]
fn scenario_5_cookie_learn_and_mismatch() {
    let cache = InfraCache::new(InfraCacheConfig::builder().build().expect("valid config"));

    let cookie = cache.get_cookie(addr(), example_com(), 0);
    assert_eq!(cookie.state, infra_cache::CookieState::Unknown);
    let client = cookie.client_bytes;

    let outcome = cache.set_server_cookie(addr(), example_com(), 0, b"eth0", client, &[9u8; 16]);
    assert_eq!(outcome, CookieUpdate::Accepted);
    let learned = cache.get_cookie(addr(), example_com(), 0);
    assert_eq!(learned.state, infra_cache::CookieState::Learned);
    assert_eq!(learned.server_bytes, [9u8; 16]);

    let mut other_client = client;
    other_client[0] ^= 0xFF;
    let mismatch = cache.set_server_cookie(addr(), example_com(), 0, b"eth0", other_client, &[1u8; 16]);
    assert_eq!(mismatch, CookieUpdate::Mismatch);
    let unchanged = cache.get_cookie(addr(), example_com(), 0);
    assert_eq!(unchanged.state, infra_cache::CookieState::Learned);
    assert_eq!(unchanged.server_bytes, [9u8; 16]);
}

#[test]
fn scenario_6_ttl_expiry_preserves_penalty() {
    let config = InfraCacheConfig::builder().host_ttl(100).build().expect("valid config");
    let cache = InfraCache::new(config);

    let first = cache.host_lookup(addr(), example_com(), 0);
    let mut original = first.timeout_ms;
    loop {
        cache.rtt_update(addr(), example_com(), QType::A, -1, original, 0);
        let snap = cache.host_snapshot(addr(), example_com(), 0).expect("entry present");
        if snap.rto >= 120_000 {
            break;
        }
        original = snap.rto;
    }
    let before = cache.host_snapshot(addr(), example_com(), 0).expect("entry present");
    assert_eq!(before.timeout_a, 3);

    // TTL expires 100 seconds after creation; look up well past it.
    let looked_up = cache.host_lookup(addr(), example_com(), 200);
    assert_eq!(looked_up.timeout_ms, 120_000);
    let after = cache.host_snapshot(addr(), example_com(), 200).expect("entry present");
    assert_eq!(after.timeout_a, 3);
}

#[test]
fn ip_ratelimit_is_independent_of_domain_ratelimit() {
    let config = InfraCacheConfig::builder().ip_ratelimit(2).build().expect("valid config");
    let cache = InfraCache::new(config);
    let client: std::net::IpAddr = "203.0.113.5".parse().expect("valid address");

    assert!(cache.ip_ratelimit_inc(client, 0, false));
    assert!(cache.ip_ratelimit_inc(client, 0, false));
    assert!(!cache.ip_ratelimit_inc(client, 0, false));

    // The domain limiter is untouched by client-IP accounting.
    assert!(cache.ratelimit_inc(example_com(), 0, false));
}
