// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Probing/selection admission rules shared by `host_lookup` (which arms
//! the probe window) and `get_lame_rtt` (which reports the clamped RTT a
//! stalled server should be selected with).

use crate::constants::{TIMEOUT_COUNT_MAX, USEFUL_SERVER_TOP_TIMEOUT};

/// Seconds to wait before this server may be probed again, given the
/// timeout (in ms) it is currently advertising. Rounds up to whole
/// seconds and adds one, so a probe is never sent before its predecessor
/// could plausibly have timed out.
#[must_use]
pub fn probe_delay_seconds(timeout_ms: i32) -> i64 {
    i64::from(timeout_ms + 999) / 1000
}

/// Whether a fresh `host_lookup` hit on a stalled server (`timeout_ms >=
/// PROBE_MAXRTO`) should arm a probe-delay window: either probing is
/// configured to continue indefinitely, or the underlying `srtt` is still
/// small enough relative to the advertised timeout to suggest the server
/// is merely slow, not actually down.
#[must_use]
pub fn should_arm_probe_delay(timeout_ms: i32, keep_probing: bool, no_timeout_srtt: i32) -> bool {
    keep_probing || no_timeout_srtt.saturating_mul(4) <= timeout_ms
}

/// Whether the per-family timeout counter still permits a probe for that
/// family (as opposed to a server so reliably broken for this query type
/// that even a single concurrent probe is not worth admitting).
#[must_use]
pub fn family_probing_allowed(family_timeout_count: u8) -> bool {
    family_timeout_count < TIMEOUT_COUNT_MAX
}

/// The RTT a probing server should be reported with: clamped just under
/// the "unusable" ceiling while a probe is admissible, or pinned at the
/// ceiling (fully excluded from ordinary selection) once it is not.
#[must_use]
pub fn probe_clamped_rtt(probing_allowed: bool) -> i32 {
    if probing_allowed {
        USEFUL_SERVER_TOP_TIMEOUT - 1000
    } else {
        USEFUL_SERVER_TOP_TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_delay_rounds_up_and_adds_nothing_extra_here() {
        assert_eq!(probe_delay_seconds(120_000), 120);
        assert_eq!(probe_delay_seconds(1), 1);
        assert_eq!(probe_delay_seconds(0), 0);
    }

    #[test]
    fn keep_probing_always_arms() {
        assert!(should_arm_probe_delay(50_000, true, 1_000_000));
    }

    #[test]
    fn srtt_gate_arms_only_when_small_relative_to_timeout() {
        assert!(should_arm_probe_delay(40_000, false, 1_000));
        assert!(!should_arm_probe_delay(400, false, 1_000));
    }

    #[test]
    fn family_probing_blocked_once_saturated() {
        assert!(family_probing_allowed(2));
        assert!(!family_probing_allowed(3));
    }
}
