//! Wrap-safe arithmetic on the 33-bit MPEG timestamp ring.
//!
//! PTS, DTS and PCR base values are 33-bit counters of a 90kHz clock. They wrap
//! roughly every 26.5 hours, so every comparison between two timestamps has to
//! be made on the ring rather than on plain integers.

use std::time::Duration;

use super::types::PTS_HZ;

/// A 90kHz timestamp on the 33-bit ring.
pub type Timestamp = u64;

/// Largest representable timestamp value.
pub const MAX_DTS: Timestamp = 0x1_FFFF_FFFF;

/// Folds an arbitrary value back onto the ring.
#[inline]
pub fn pcr_limit(v: u64) -> Timestamp {
    v & MAX_DTS
}

/// Adds two ring values.
#[inline]
pub fn ring_add(v: Timestamp, delta: u64) -> Timestamp {
    pcr_limit(v.wrapping_add(delta))
}

/// Subtracts `delta` from `v`, wrapping below zero.
#[inline]
pub fn ring_sub(v: Timestamp, delta: u64) -> Timestamp {
    pcr_limit(v.wrapping_sub(delta))
}

/// Returns true if `v` lies in `[start, end)` walking forward around the ring.
///
/// An interval whose `end` is numerically below `start` is one that crosses
/// [`MAX_DTS`].
///
/// ```
/// use vdkmux::format::ts::clock::{in_time_period, MAX_DTS};
///
/// assert!(in_time_period(5, MAX_DTS - 2, 10));
/// assert!(!in_time_period(10, MAX_DTS - 2, 10));
/// ```
pub fn in_time_period(v: Timestamp, start: Timestamp, end: Timestamp) -> bool {
    if end < start {
        v >= start || v < end
    } else {
        v >= start && v < end
    }
}

/// Returns true if `v` precedes `r` on the ring.
///
/// The shorter of the two arcs between the values decides the order, so a
/// value just past the wrap is "after" a value just before it.
pub fn time_is_before(v: Timestamp, r: Timestamp) -> bool {
    (v < r && (r - v) < (MAX_DTS - r + v)) || (v > r && (v - r) > (MAX_DTS - v + r))
}

/// Wrap-aware running minimum used to seed the program clock.
///
/// `prewrapped` records that the minimum sits just before the wrap while some
/// later sample already wrapped around to small values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingMinimum {
    /// Current minimum, unset until the first sample.
    pub value: Option<Timestamp>,
    /// The minimum lies before the wrap point relative to other samples.
    pub prewrapped: bool,
}

impl RingMinimum {
    /// Feeds one sample. Returns true when the minimum changed.
    pub fn update(&mut self, sample: Timestamp) -> bool {
        let Some(current) = self.value else {
            self.value = Some(sample);
            self.prewrapped = false;
            return true;
        };

        if time_is_before(sample, current) {
            // Wrap crossed between the sample and the old minimum.
            self.prewrapped = self.prewrapped || sample > current;
            self.value = Some(sample);
            return true;
        }
        if sample < current {
            self.prewrapped = true;
        }
        false
    }

    /// Forgets every sample.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Converts a wall-clock duration to 90kHz ticks.
pub fn duration_to_ticks(d: Duration) -> u64 {
    (d.as_nanos() * PTS_HZ as u128 / 1_000_000_000) as u64
}

/// Converts 90kHz ticks to a wall-clock duration.
pub fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_nanos(ticks.saturating_mul(1_000_000_000) / PTS_HZ)
}

/// Converts milliseconds to 90kHz ticks.
#[inline]
pub fn ms_to_ticks(ms: u64) -> u64 {
    ms * (PTS_HZ / 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_in_time_period_plain_and_wrapped() {
        assert!(in_time_period(0, 0, 10));
        assert!(in_time_period(9, 0, 10));
        assert!(!in_time_period(10, 0, 10));
        assert!(in_time_period(5, MAX_DTS - 2, 10));
        assert!(in_time_period(MAX_DTS, MAX_DTS - 2, 10));
        assert!(!in_time_period(MAX_DTS - 3, MAX_DTS - 2, 10));
        assert!(!in_time_period(11, MAX_DTS - 2, 10));
    }

    #[test]
    fn test_time_is_before_across_wrap() {
        assert!(time_is_before(1, 2));
        assert!(!time_is_before(2, 1));
        assert!(!time_is_before(7, 7));
        assert!(time_is_before(MAX_DTS - 10, 5));
        assert!(!time_is_before(5, MAX_DTS - 10));
    }

    #[test]
    fn test_ring_add_sub() {
        assert_eq!(ring_add(MAX_DTS, 1), 0);
        assert_eq!(ring_sub(0, 4500), MAX_DTS + 1 - 4500);
        assert_eq!(ring_sub(ring_add(123, 9000), 9000), 123);
    }

    #[test]
    fn test_ring_minimum_tracks_wrap() {
        let mut min = RingMinimum::default();
        assert!(min.update(MAX_DTS - 100));
        // Sample after the wrap is later, not earlier.
        assert!(!min.update(50));
        assert_eq!(min.value, Some(MAX_DTS - 100));
        assert!(min.prewrapped);

        assert!(min.update(MAX_DTS - 200));
        assert_eq!(min.value, Some(MAX_DTS - 200));
    }

    #[test]
    fn test_tick_conversions() {
        assert_eq!(duration_to_ticks(Duration::from_secs(1)), 90_000);
        assert_eq!(ticks_to_duration(4500), Duration::from_millis(50));
        assert_eq!(ms_to_ticks(100), 9000);
    }

    // Shifting both interval and value by the same offset must not change the answer.
    #[quickcheck]
    fn prop_in_time_period_shift_invariant(v: u32, s: u32, len: u32, shift: u64) -> bool {
        let (v, s) = (v as u64, s as u64);
        let e = ring_add(s, len as u64);
        let shift = pcr_limit(shift);
        in_time_period(v, s, e)
            == in_time_period(ring_add(v, shift), ring_add(s, shift), ring_add(e, shift))
    }

    #[quickcheck]
    fn prop_time_is_before_shift_invariant(v: u32, delta: u32, shift: u64) -> bool {
        let v = v as u64;
        let r = ring_add(v, (delta >> 1) as u64 + 1);
        let shift = pcr_limit(shift);
        time_is_before(v, r) == time_is_before(ring_add(v, shift), ring_add(r, shift))
    }

    #[quickcheck]
    fn prop_time_is_before_is_asymmetric(a: u64, b: u64) -> bool {
        let (a, b) = (pcr_limit(a), pcr_limit(b));
        !(time_is_before(a, b) && time_is_before(b, a))
    }
}
