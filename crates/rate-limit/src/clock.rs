//! Wall-clock helpers.
//!
//! Window and cooldown timestamps are unix milliseconds so they survive a
//! restart through the snapshot files.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Render a remaining duration as `XhYmZs`, `YmZs` or `Zs`.
///
/// Partial seconds round up so a live cooldown never reads as `0s`.
pub fn format_remaining(remaining: Duration) -> String {
    let total = remaining.as_millis().div_ceil(1000) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_each_magnitude() {
        assert_eq!(format_remaining(Duration::from_secs(300)), "5m0s");
        assert_eq!(format_remaining(Duration::from_secs(86_400)), "24h0m0s");
        assert_eq!(format_remaining(Duration::from_secs(3_725)), "1h2m5s");
        assert_eq!(format_remaining(Duration::from_secs(42)), "42s");
    }

    #[test]
    fn rounds_partial_seconds_up() {
        assert_eq!(format_remaining(Duration::from_millis(299_001)), "5m0s");
        assert_eq!(format_remaining(Duration::from_millis(1)), "1s");
        assert_eq!(format_remaining(Duration::ZERO), "0s");
    }
}
