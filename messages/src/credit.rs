// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Bandwidth-credit quantization.
//!
//! The firmware enforces bandwidth limits by topping up an integer credit
//! counter on every update tick, so it cannot realize arbitrary kilobit
//! rates. These helpers convert between the two domains with the firmware's
//! own flooring arithmetic; [`normalize`] reports the rate that will
//! actually be enforced for a requested one.
//!
//! `updates_per_sec` is reported by the firmware itself. Until it is known
//! it reads as zero, and every conversion here returns zero for it: callers
//! must treat that as "rate not yet known", never as "unlimited".

// One credit corresponds to 2 bytes of transmit allowance, so a kbps rate
// converts at 1000 / (8 * 2) = 62.5, folded with the tick rate as x * 500.
const KBPS_NUMERATOR: u64 = 500;

/// Convert a rate in kbps into per-tick credits.
pub fn to_credit(kbps: u32, updates_per_sec: u32) -> u32 {
    if updates_per_sec == 0 {
        return 0;
    }
    saturate(u64::from(kbps) * KBPS_NUMERATOR / u64::from(updates_per_sec))
}

/// Convert per-tick credits back into the rate they enforce, in kbps.
pub fn to_kbps(credit: u32, updates_per_sec: u32) -> u32 {
    saturate(u64::from(credit) * u64::from(updates_per_sec) / KBPS_NUMERATOR)
}

/// Round a requested rate to the one the firmware will actually enforce.
///
/// Idempotent once applied: the double floor through the same multiplier
/// maps every representable rate to itself.
pub fn normalize(kbps: u32, updates_per_sec: u32) -> u32 {
    to_kbps(to_credit(kbps, updates_per_sec), updates_per_sec)
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::normalize;
    use super::to_credit;
    use super::to_kbps;

    #[test]
    fn test_known_values() {
        // 1 Gbps at 50k ticks/sec: 1_000_000 * 500 / 50_000 = 10_000 credits,
        // which converts back exactly.
        assert_eq!(to_credit(1_000_000, 50_000), 10_000);
        assert_eq!(to_kbps(10_000, 50_000), 1_000_000);
        assert_eq!(normalize(1_000_000, 50_000), 1_000_000);

        // 999 kbps at 50k ticks/sec floors to 9 credits = 900 kbps enforced.
        assert_eq!(to_credit(999, 50_000), 9);
        assert_eq!(normalize(999, 50_000), 900);
    }

    #[test]
    fn test_zero_rate_means_unknown() {
        for kbps in [0, 1, 999, 1_000_000, u32::MAX] {
            assert_eq!(normalize(kbps, 0), 0);
        }
    }

    // Firmware builds tick the credit updater at a multiple of 500 Hz, which
    // keeps the credit domain exact under the x500 conversion.
    #[test]
    fn test_normalize_is_idempotent() {
        for updates_per_sec in [500, 2_000, 8_000, 50_000, 1_000_000] {
            for kbps in (0..=10_000_000u32).step_by(99_991) {
                let once = normalize(kbps, updates_per_sec);
                assert_eq!(
                    normalize(once, updates_per_sec),
                    once,
                    "kbps={kbps} updates_per_sec={updates_per_sec}",
                );
                assert!(once <= kbps);
            }
        }
    }
}
