//! Shared helpers: millisecond clocks, sequence distance, randomized intervals.

use std::time::{SystemTime, UNIX_EPOCH};

/// Absolute distance between two u32 sequence numbers.
///
/// Plain magnitude comparison, not modulo-2^32: a wrapped counter is
/// indistinguishable from a very large loss burst and is treated as one.
pub fn seq_distance(a: u32, b: u32) -> u32 {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Draws an exponentially distributed delay with the given mean, in
/// milliseconds. Used to desynchronize probe bursts across beacons.
pub fn exp_interval_ms(mean_ms: f64) -> u64 {
    let u: f64 = rand::random();
    (-mean_ms * (1.0 - u).ln()).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_distance_basic() {
        assert_eq!(seq_distance(10, 3), 7);
        assert_eq!(seq_distance(3, 10), 7);
        assert_eq!(seq_distance(5, 5), 0);
    }

    #[test]
    fn test_seq_distance_is_not_circular() {
        // A wrap from u32::MAX to 0 looks like a huge gap, by design.
        assert_eq!(seq_distance(0, u32::MAX), u32::MAX);
    }

    #[test]
    fn test_exp_interval_positive() {
        for _ in 0..100 {
            assert!(exp_interval_ms(5000.0) >= 1);
        }
    }
}
