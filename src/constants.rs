// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tunable constants shared by the RTT estimator, the host store and the
//! probing/selection policy.
//!
//! Two values deserve a note because a single constant read literally
//! (`376` used both as a floor clamp and as the initial guess) makes the
//! first-contact scenario impossible to satisfy: a freshly-created host
//! reports `timeout_ms = 376` on first contact, and a single successful
//! 50ms reply must then produce a *strictly smaller* timeout. If 376 is
//! also the RTO's floor clamp, no reply can ever bring it below 376. The
//! floor clamp and the "no measurement yet" starting guess are kept as two
//! distinct numbers below to resolve the contradiction.

/// Floor clamp applied to `rto` after every smoothing update. This is the
/// lowest timeout the estimator will ever report for a responsive server.
pub const MIN_TIMEOUT: i32 = 250;

/// Starting `rto` for a brand new or just-expired host entry, before any
/// round trip has been observed. Deliberately larger than [`MIN_TIMEOUT`]
/// so that a server's first real reply can immediately narrow the
/// timeout.
pub const INITIAL_TIMEOUT: i32 = 376;

/// Ceiling clamp applied to `rto`, and also the threshold past which a
/// server counts as "maxed out" for backoff purposes.
pub const RTT_MAX_TIMEOUT: i32 = 120_000;

/// RTO at or above which a server is considered not useful for ordinary
/// (non-probe) selection; a single successful reply resets the estimator
/// entirely rather than smoothing it back down.
pub const USEFUL_SERVER_TOP_TIMEOUT: i32 = 120_000;

/// Timeout at or above which only a single concurrent probe query per
/// server is admitted.
pub const PROBE_MAXRTO: i32 = 12_000;

/// Saturating ceiling for the per-query-family timeout counters.
pub const TIMEOUT_COUNT_MAX: u8 = 3;

/// Number of one-second slots tracked per rate-limited key, and also the
/// width (in seconds) of the backoff averaging window `rate_max` scans.
pub const RATE_WINDOW: usize = 4;

/// Smoothing factor applied to `srtt` on each update (Jacobson/Karels `alpha`).
pub const SRTT_ALPHA: f64 = 0.125;

/// Smoothing factor applied to `rttvar` on each update (Jacobson/Karels `beta`).
pub const RTTVAR_BETA: f64 = 0.25;

/// Multiplier applied to `rttvar` when deriving `rto` from `srtt`.
pub const RTO_K: f64 = 4.0;

/// Flat per-entry overhead charged by every store's size function to
/// account for the `Arc<RwLock<_>>` wrapper and slab bookkeeping that
/// sits alongside the key/data bytes themselves.
pub const PER_LOCK_OVERHEAD_BYTES: usize = 64;
