//! Liveness arithmetic: staleness thresholds and reconnect backoff.
//!
//! The periodic tick itself lives on the manager's loop; these functions
//! decide what a tick means. A peer is stale once nothing has been heard for
//! three periods. Reconnect attempt `k` (1-based) waits `T * 2^(k-1)` capped
//! at one minute.

use std::time::{Duration, Instant};

pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Multiple of the tick period after which a silent peer is declared lost.
pub const LOSS_MULTIPLIER: u32 = 3;

pub fn heartbeat_timeout(period: Duration) -> Duration {
    period.saturating_mul(LOSS_MULTIPLIER)
}

pub fn is_stale(last_rx: Instant, now: Instant, period: Duration) -> bool {
    now.saturating_duration_since(last_rx) > heartbeat_timeout(period)
}

/// Delay before reconnect attempt `attempt` (1-based). A zero base period
/// (heartbeats disabled) falls back to one second so reconnects still pace
/// themselves.
pub fn backoff_delay(period: Duration, attempt: u32) -> Duration {
    let base = if period.is_zero() {
        Duration::from_secs(1)
    } else {
        period
    };
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exponent);
    delay.min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_sixty_seconds() {
        let period = Duration::from_secs(5);
        assert_eq!(backoff_delay(period, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(period, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(period, 3), Duration::from_secs(20));
        assert_eq!(backoff_delay(period, 4), Duration::from_secs(40));
        assert_eq!(backoff_delay(period, 5), Duration::from_secs(60));
        assert_eq!(backoff_delay(period, 12), Duration::from_secs(60));
    }

    #[test]
    fn zero_period_backoff_uses_one_second_base() {
        assert_eq!(backoff_delay(Duration::ZERO, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(Duration::ZERO, 3), Duration::from_secs(4));
    }

    #[test]
    fn staleness_is_three_periods() {
        let period = Duration::from_millis(1_000);
        let start = Instant::now();
        assert!(!is_stale(start, start + Duration::from_millis(2_999), period));
        assert!(is_stale(start, start + Duration::from_millis(3_001), period));
    }
}
