// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use std::any::Any;

use crate::Rational;

/// Converts `timestamp` from the `from` time base to the `to` time base, rounding to the nearest
/// tick (halfway cases away from zero).
///
/// Results that do not fit in an `i64` are saturated. Time bases rejected by
/// [`is_valid_time_base`] leave `timestamp` untouched.
pub fn rescale_timestamp(timestamp: i64, from: Rational, to: Rational) -> i64 {
    if !is_valid_time_base(from) || !is_valid_time_base(to) {
        return timestamp;
    }

    // Both products fit: each term is below 2^63.
    let mut num = from.num as i128 * to.den as i128;
    let mut den = from.den as i128 * to.num as i128;
    let divisor = gcd(num, den);
    num /= divisor;
    den /= divisor;

    let exact = (timestamp as i128).checked_mul(num).and_then(|scaled| {
        let half = den / 2;
        let rounded = if scaled >= 0 {
            scaled.checked_add(half)
        } else {
            scaled.checked_sub(half)
        };
        rounded.map(|r| r / den)
    });

    match exact {
        Some(rescaled) => rescaled.clamp(i64::MIN as i128, i64::MAX as i128) as i64,
        // Only reachable with extreme time bases, where the result is approximate anyway. Float
        // to int casts saturate.
        None => (timestamp as f64 * (num as f64 / den as f64)).round() as i64,
    }
}

fn gcd(mut a: i128, mut b: i128) -> i128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Returns whether `time_base` can be used with [`rescale_timestamp`].
pub fn is_valid_time_base(time_base: Rational) -> bool {
    time_base.num > 0 && time_base.den > 0
}

/// Extracts a printable message out of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        String::from("unknown panic payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Rational = Rational::new(1, 1000);
    const MPEG_TS: Rational = Rational::new(1, 90000);
    const NATIVE: Rational = Rational::new(1, 10_000_000);

    #[test]
    fn rescale_exact() {
        assert_eq!(rescale_timestamp(1, MS, NATIVE), 10_000);
        assert_eq!(rescale_timestamp(0, MPEG_TS, NATIVE), 0);
        assert_eq!(rescale_timestamp(90000, MPEG_TS, NATIVE), 10_000_000);
    }

    #[test]
    fn rescale_rounds_to_nearest() {
        // 3003 / 90000 s = 333666.67 native ticks.
        assert_eq!(rescale_timestamp(3003, MPEG_TS, NATIVE), 333_667);
        // 1 native tick is 0.0001 ms.
        assert_eq!(rescale_timestamp(4999, NATIVE, MS), 0);
        assert_eq!(rescale_timestamp(5000, NATIVE, MS), 1);
        assert_eq!(rescale_timestamp(-5000, NATIVE, MS), -1);
    }

    #[test]
    fn rescale_saturates() {
        assert_eq!(rescale_timestamp(i64::MAX, MS, NATIVE), i64::MAX);
        assert_eq!(rescale_timestamp(i64::MIN, MS, NATIVE), i64::MIN);
    }

    #[test]
    fn rescale_huge_time_bases() {
        let huge = Rational::new(1 << 50, 1);
        assert_eq!(rescale_timestamp(i64::MAX, huge, NATIVE), i64::MAX);
        assert_eq!(rescale_timestamp(i64::MIN, huge, NATIVE), i64::MIN);
        assert_eq!(rescale_timestamp(-3, huge, NATIVE), i64::MIN);
        assert_eq!(rescale_timestamp(0, huge, NATIVE), 0);

        // Common factors cancel out before multiplying.
        let two_thirds = Rational::new(1 << 62, 3 << 61);
        assert_eq!(rescale_timestamp(5, two_thirds, NATIVE), 33_333_333);
        let one_second = Rational::new(i64::MAX, i64::MAX);
        assert_eq!(rescale_timestamp(i64::MAX / 1000, one_second, MS), i64::MAX / 1000 * 1000);
    }

    #[test]
    fn rescale_invalid_time_base_is_identity() {
        assert_eq!(rescale_timestamp(42, Rational::new(1, 0), NATIVE), 42);
    }

    #[test]
    fn time_base_validation() {
        assert!(is_valid_time_base(MPEG_TS));
        assert!(!is_valid_time_base(Rational::new(0, 1)));
        assert!(!is_valid_time_base(Rational::new(1, -25)));
    }

    #[test]
    fn panic_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 1");
    }
}
