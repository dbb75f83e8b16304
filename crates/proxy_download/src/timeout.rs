//! Dynamic per-file timeout policy.
//!
//! A pure function of the expected file size: small or unknown sizes get
//! the configured default, large files get enough time at a conservative
//! minimum transfer speed, clamped to a sane range.

use std::time::Duration;

/// Floor on the computed timeout, regardless of size.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Ceiling on the computed timeout, regardless of size.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Minimum assumed transfer speed used to size the timeout.
pub const MIN_SPEED_BYTES_PER_SEC: u64 = 100 * 1024;

/// Computes the timeout for a file of `expected_size` bytes. A non-positive
/// `expected_size` (upstream didn't report a content-length) falls back to
/// `default`. Otherwise the result is `expected_size / MIN_SPEED_BYTES_PER_SEC`
/// seconds, clamped to `[MIN_TIMEOUT, MAX_TIMEOUT]`.
///
/// Monotonic non-decreasing in `expected_size` for positive inputs.
pub fn timeout_for_size(expected_size: i64, default: Duration) -> Duration {
    if expected_size <= 0 {
        return default;
    }

    let size = expected_size as u64;
    let seconds = size.saturating_div(MIN_SPEED_BYTES_PER_SEC);
    let computed = Duration::from_secs(seconds);

    computed.clamp(MIN_TIMEOUT, MAX_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_timeout() -> Duration {
        Duration::from_secs(300)
    }

    #[test]
    fn zero_size_uses_default() {
        assert_eq!(timeout_for_size(0, default_timeout()), default_timeout());
    }

    #[test]
    fn negative_size_uses_default() {
        assert_eq!(timeout_for_size(-1, default_timeout()), default_timeout());
    }

    #[test]
    fn small_file_hits_the_floor() {
        assert_eq!(timeout_for_size(1024, default_timeout()), MIN_TIMEOUT);
    }

    #[test]
    fn large_file_scales_with_size() {
        let size = 317 * 1024 * 1024;
        let timeout = timeout_for_size(size, default_timeout());
        assert!(timeout > MIN_TIMEOUT && timeout < MAX_TIMEOUT);
        assert_eq!(timeout, Duration::from_secs(3246));
    }

    #[test]
    fn huge_file_clamps_to_ceiling() {
        let size = 10i64 * 1024 * 1024 * 1024;
        assert_eq!(timeout_for_size(size, default_timeout()), MAX_TIMEOUT);
    }

    #[test]
    fn monotonic_non_decreasing_for_positive_sizes() {
        let mut previous = Duration::ZERO;
        for size in [1, 1024, 1024 * 1024, 100 * 1024 * 1024, 5 * 1024 * 1024 * 1024] {
            let t = timeout_for_size(size, default_timeout());
            assert!(t >= previous);
            previous = t;
        }
    }
}
