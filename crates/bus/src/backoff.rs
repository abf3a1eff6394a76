//! Reconnect policy with jittered exponential back-off.

use std::time::Duration;

/// Controls how the bus client reconnects after losing the broker.
///
/// Full jitter: the actual delay is a deterministic pseudo-random
/// fraction of the exponential cap, so a fleet restarting together does
/// not hammer the broker in lockstep.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    /// Cap for the first attempt's delay window.
    pub initial_delay: Duration,
    /// Maximum delay window between attempts.
    pub max_delay: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectBackoff {
    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_delay: Duration::from_millis(initial_ms.max(1)),
            max_delay: Duration::from_millis(max_ms.max(1)),
        }
    }

    /// Compute the delay for the given attempt number (0-indexed).
    ///
    /// The window doubles per attempt up to `max_delay`; the delay is
    /// drawn from `[0, window]` (full jitter).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let window_ms = (base_ms * 2f64.powi(attempt.min(16) as i32))
            .min(self.max_delay.as_millis() as f64);

        let jittered = window_ms * pseudo_random_fraction(attempt);
        Duration::from_millis(jittered as u64)
    }
}

/// Cheap deterministic "random" fraction [0, 1) based on attempt number.
/// Not cryptographically secure — just enough to spread reconnect storms.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_add(1).wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let p = ReconnectBackoff::default();
        assert_eq!(p.initial_delay, Duration::from_secs(1));
        assert_eq!(p.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn delay_window_never_exceeds_max() {
        let p = ReconnectBackoff::default();
        for attempt in 0..32 {
            assert!(p.delay_for_attempt(attempt) <= Duration::from_secs(60));
        }
    }

    #[test]
    fn early_attempts_stay_inside_the_initial_window() {
        let p = ReconnectBackoff::default();
        assert!(p.delay_for_attempt(0) <= Duration::from_secs(1));
        assert!(p.delay_for_attempt(1) <= Duration::from_secs(2));
    }

    #[test]
    fn late_attempts_stay_inside_the_cap_window() {
        let p = ReconnectBackoff::from_millis(1_000, 60_000);
        let d = p.delay_for_attempt(10);
        assert!(d <= Duration::from_secs(60));
    }

    #[test]
    fn jitter_spreads_consecutive_attempts() {
        let p = ReconnectBackoff::from_millis(60_000, 60_000);
        // Same window each attempt; full jitter must not collapse to a
        // single point.
        let delays: Vec<Duration> = (0..4).map(|a| p.delay_for_attempt(a)).collect();
        assert!(delays.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let p = ReconnectBackoff::default();
        let _ = p.delay_for_attempt(u32::MAX);
    }
}
