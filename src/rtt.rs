// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Jacobson/Karels RTT smoothing and timeout classification.
//!
//! The first sample bootstraps `srtt`/`rttvar` directly from the
//! measurement (RFC 6298 §2.2) rather than smoothing against the `init`
//! guess; every later sample uses the standard exponentially weighted
//! update. Without that split a server's very first reply can leave the
//! advertised timeout *larger* than the initial guess, which defeats the
//! purpose of measuring at all.

use crate::constants::{MIN_TIMEOUT, RTO_K, RTTVAR_BETA, RTT_MAX_TIMEOUT, SRTT_ALPHA};

/// A single upstream server's smoothed round-trip-time record.
#[derive(Clone, Copy, Debug)]
pub struct RttEstimate {
    primed: bool,
    srtt: f64,
    rttvar: f64,
    rto: i32,
}

impl RttEstimate {
    /// Initialises a fresh record with no measurements yet.
    #[must_use]
    pub fn init(initial_ms: i32) -> Self {
        Self {
            primed: false,
            srtt: 0.0,
            rttvar: f64::from(initial_ms) / 2.0,
            rto: initial_ms,
        }
    }

    /// Reinitialises in place, as if newly created.
    pub fn reset(&mut self, initial_ms: i32) {
        *self = Self::init(initial_ms);
    }

    /// Folds in a successful measurement of `measured_ms`.
    pub fn update(&mut self, measured_ms: i32) {
        let m = f64::from(measured_ms);
        if self.primed {
            self.srtt = (1.0 - SRTT_ALPHA) * self.srtt + SRTT_ALPHA * m;
            self.rttvar = (1.0 - RTTVAR_BETA) * self.rttvar + RTTVAR_BETA * (self.srtt - m).abs();
        } else {
            self.srtt = m;
            self.rttvar = m / 2.0;
            self.primed = true;
        }
        let candidate = self.srtt + RTO_K * self.rttvar;
        self.rto = clamp_rto(candidate);
    }

    /// Applies exponential backoff after a timeout, starting from the
    /// `rto` the caller observed when the query was sent (which may not
    /// be this record's *current* `rto`, if it has since been touched by
    /// another reply).
    pub fn lost(&mut self, original_rto: i32) {
        self.rto = original_rto.saturating_mul(2).min(RTT_MAX_TIMEOUT);
    }

    /// The timeout to advertise for a query about to be sent, given how
    /// many retries it has already used. Each retry doubles the budget,
    /// capped the same way `lost` caps backoff.
    #[must_use]
    pub fn timeout(&self, retry_count: u8) -> i32 {
        let scale = 1i64 << u32::from(retry_count.min(8));
        i64::from(self.rto).saturating_mul(scale).min(i64::from(RTT_MAX_TIMEOUT)) as i32
    }

    /// `srtt` without the probing-admission clamps, used by the
    /// `no_timeout_srtt * 4 <= timeout_ms` admission test.
    #[must_use]
    pub fn no_timeout_srtt(&self) -> i32 {
        self.srtt as i32
    }

    /// `rto` as stored, without any clamp the host store layers on top.
    #[must_use]
    pub fn unclamped(&self) -> i32 {
        self.rto
    }

    #[must_use]
    pub fn rto(&self) -> i32 {
        self.rto
    }

    pub fn set_rto(&mut self, rto: i32) {
        self.rto = rto;
    }
}

fn clamp_rto(candidate: f64) -> i32 {
    let rounded = candidate.round() as i32;
    rounded.clamp(MIN_TIMEOUT, RTT_MAX_TIMEOUT)
}
