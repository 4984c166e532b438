// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Monotonic, suspend-excluding time source.
//!
//! Instants are expressed as a [`Duration`] since an unspecified origin
//! (boot, in practice), read from `CLOCK_MONOTONIC`.  All rate and ETA
//! arithmetic in the engine is plain `Duration` arithmetic on these values,
//! with subtraction saturating at zero.

use nix::time::{clock_gettime, ClockId};
use std::time::Duration;

/// Exit status used when the monotonic clock cannot be read.  The whole
/// program is useless without a working clock, so a failed read terminates
/// the process immediately.
pub const CLOCK_FAILURE_EXIT: i32 = 16;

/// Read the monotonic clock.
///
/// A read failure is fatal: an error is printed to standard error and the
/// process exits with status 16.
pub fn read() -> Duration {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32),
        Err(e) => {
            eprintln!("pipemon: clock_gettime: {e}");
            std::process::exit(CLOCK_FAILURE_EXIT);
        }
    }
}

/// Read the monotonic clock as whole nanoseconds, using only
/// async-signal-safe calls.  Returns 0 on failure instead of exiting, so it
/// can be used from a signal handler.
pub fn read_ns_sigsafe() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: ts is a valid out-pointer; clock_gettime is async-signal-safe.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64).saturating_mul(1_000_000_000) + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_is_monotonic() {
        let a = read();
        let b = read();
        assert!(b >= a);
    }

    #[test]
    fn test_sigsafe_read_agrees_with_read() {
        let a = read();
        let ns = read_ns_sigsafe();
        assert!(ns > 0);
        let b = Duration::from_nanos(ns);
        assert!(b >= a);
        assert!(b - a < Duration::from_secs(1));
    }

    #[test]
    fn test_duration_arithmetic_round_trip() {
        // (t1 + d) - t1 == d for non-negative d.
        let t1 = read();
        let d = Duration::from_millis(1234);
        assert_eq!((t1 + d) - t1, d);
    }

    #[test]
    fn test_subtract_saturates_at_zero() {
        let t1 = Duration::from_secs(1);
        let t2 = Duration::from_secs(2);
        assert_eq!(t1.saturating_sub(t2), Duration::ZERO);
    }

    #[test]
    fn test_compare_is_antisymmetric() {
        let t1 = Duration::from_millis(100);
        let t2 = Duration::from_millis(200);
        assert_eq!(t1.cmp(&t2), t2.cmp(&t1).reverse());
    }
}
