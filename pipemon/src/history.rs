// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ring buffer of transfer progress samples, used to smooth the average
//! rate (and therefore the ETA) over a configurable window.

/// One progress observation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    /// Seconds since the start of the transfer.
    pub elapsed_sec: f64,
    /// Cumulative bytes (or lines) transferred by that time.
    pub total: u64,
}

/// Fixed-length ring of [`Sample`]s.
///
/// An averaging window of `W` seconds maps to a ring length and a sample
/// interval: windows of 20 seconds or more keep one sample every 5 seconds
/// (`W/5 + 1` entries), shorter windows one per second (`W + 1` entries).
#[derive(Debug, Clone)]
pub struct RateHistory {
    entries: Vec<Sample>,
    interval: f64,
    first: usize,
    last: usize,
    /// Smoothed average rate over the window, updated by [`update`].
    ///
    /// [`update`]: RateHistory::update
    pub current_avg_rate: f64,
}

impl RateHistory {
    /// Build a ring for the given averaging window in seconds (clamped to a
    /// minimum of one second).
    pub fn new(window_sec: u32) -> Self {
        let window_sec = window_sec.max(1);
        let (len, interval) = if window_sec >= 20 {
            ((window_sec / 5 + 1) as usize, 5.0)
        } else {
            ((window_sec + 1) as usize, 1.0)
        };
        RateHistory {
            entries: vec![Sample::default(); len],
            interval,
            first: 0,
            last: 0,
            current_avg_rate: 0.0,
        }
    }

    /// Record a new observation if at least one sample interval has passed
    /// since the previous one, and refresh the smoothed average rate.
    ///
    /// With only one sample in the ring the supplied instantaneous rate is
    /// used as the average.
    pub fn update(&mut self, total: u64, elapsed_sec: f64, instantaneous_rate: f64) {
        let last_elapsed = self.entries[self.last].elapsed_sec;

        // Nothing to do if this is not the first call but the sample
        // interval has not passed yet.
        if last_elapsed > 0.0 && elapsed_sec < last_elapsed + self.interval {
            return;
        }

        if last_elapsed > 0.0 {
            let len = self.entries.len();
            self.last = (self.last + 1) % len;
            if self.last == self.first {
                self.first = (self.first + 1) % len;
            }
        }

        self.entries[self.last] = Sample {
            elapsed_sec,
            total,
        };

        if self.first == self.last {
            self.current_avg_rate = instantaneous_rate;
        } else {
            let newest = self.entries[self.last];
            let oldest = self.entries[self.first];
            let bytes = newest.total.saturating_sub(oldest.total);
            let sec = newest.elapsed_sec - oldest.elapsed_sec;
            self.current_avg_rate = bytes as f64 / sec;
        }
    }

    /// The samples currently held, oldest first.
    pub fn samples(&self) -> Vec<Sample> {
        let mut out = Vec::new();
        let mut idx = self.first;
        loop {
            out.push(self.entries[idx]);
            if idx == self.last {
                break;
            }
            idx = (idx + 1) % self.entries.len();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_to_ring_sizing() {
        assert_eq!(RateHistory::new(30).entries.len(), 7);
        assert_eq!(RateHistory::new(20).entries.len(), 5);
        assert_eq!(RateHistory::new(19).entries.len(), 20);
        assert_eq!(RateHistory::new(5).entries.len(), 6);
        assert_eq!(RateHistory::new(0).entries.len(), 2);
    }

    #[test]
    fn test_first_sample_uses_instantaneous_rate() {
        let mut h = RateHistory::new(10);
        h.update(100, 1.0, 123.0);
        assert_eq!(h.current_avg_rate, 123.0);
    }

    #[test]
    fn test_average_over_window() {
        let mut h = RateHistory::new(10);
        h.update(0, 1.0, 0.0);
        h.update(1000, 2.0, 1000.0);
        h.update(3000, 3.0, 2000.0);
        // (3000 - 0) / (3.0 - 1.0)
        assert_eq!(h.current_avg_rate, 1500.0);
    }

    #[test]
    fn test_sub_interval_updates_are_skipped() {
        let mut h = RateHistory::new(10);
        h.update(0, 1.0, 0.0);
        h.update(500, 1.5, 1000.0);
        // Still only the first sample; average untouched by the skipped one.
        assert_eq!(h.samples().len(), 1);
        assert_eq!(h.current_avg_rate, 0.0);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut h = RateHistory::new(2); // 3 entries
        for t in 1..=5 {
            h.update((t * 100) as u64, t as f64, 100.0);
        }
        let samples = h.samples();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].elapsed_sec, 3.0);
        assert_eq!(samples[2].elapsed_sec, 5.0);
    }

    #[test]
    fn test_samples_monotonic_in_both_fields() {
        let mut h = RateHistory::new(5);
        for t in 1..=10u64 {
            h.update(t * 37, t as f64, 37.0);
        }
        let samples = h.samples();
        for pair in samples.windows(2) {
            assert!(pair[1].elapsed_sec >= pair[0].elapsed_sec);
            assert!(pair[1].total >= pair[0].total);
        }
    }
}
