//! Flood guard.
//!
//! A cheap per-packet heuristic: count consecutive packets that arrive
//! closer together than `interval`, reset the count on any slower packet,
//! and flag the connection once the count reaches `kick_count`.

use std::time::{Duration, Instant};

/// Thresholds shared by every connection.
#[derive(Debug, Clone, Copy)]
pub struct FloodGuard {
    interval: Duration,
    kick_count: u32,
}

/// Per-connection tracking state.
#[derive(Debug, Default, Clone)]
pub struct FloodTracker {
    last_packet: Option<Instant>,
    fast_packets: u32,
}

impl FloodTracker {
    pub fn fast_packets(&self) -> u32 {
        self.fast_packets
    }
}

impl FloodGuard {
    pub fn new(interval: Duration, kick_count: u32) -> Self {
        Self {
            interval,
            kick_count,
        }
    }

    /// Record a completed packet at `now`. Returns true when the
    /// connection should be torn down.
    pub fn check(&self, tracker: &mut FloodTracker, now: Instant) -> bool {
        let fast = tracker
            .last_packet
            .map(|last| now.saturating_duration_since(last) < self.interval)
            .unwrap_or(false);

        if fast {
            tracker.fast_packets += 1;
        } else {
            tracker.fast_packets = 0;
        }
        tracker.last_packet = Some(now);

        tracker.fast_packets >= self.kick_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_flags_on_triggering_packet() {
        let guard = FloodGuard::new(ms(100), 3);
        let mut tracker = FloodTracker::default();
        let start = Instant::now();

        // the first packet has nothing to compare against
        assert!(!guard.check(&mut tracker, start));
        assert!(!guard.check(&mut tracker, start + ms(10)));
        assert!(!guard.check(&mut tracker, start + ms(20)));
        assert_eq!(tracker.fast_packets(), 2);
        assert!(guard.check(&mut tracker, start + ms(30)));
    }

    #[test]
    fn test_slow_packet_resets() {
        let guard = FloodGuard::new(ms(100), 3);
        let mut tracker = FloodTracker::default();
        let start = Instant::now();

        guard.check(&mut tracker, start);
        guard.check(&mut tracker, start + ms(10));
        guard.check(&mut tracker, start + ms(20));
        assert_eq!(tracker.fast_packets(), 2);

        assert!(!guard.check(&mut tracker, start + ms(500)));
        assert_eq!(tracker.fast_packets(), 0);
        assert!(!guard.check(&mut tracker, start + ms(510)));
    }

    #[test]
    fn test_exact_interval_is_not_fast() {
        let guard = FloodGuard::new(ms(100), 1);
        let mut tracker = FloodTracker::default();
        let start = Instant::now();

        guard.check(&mut tracker, start);
        assert!(!guard.check(&mut tracker, start + ms(100)));
        assert!(guard.check(&mut tracker, start + ms(199)));
    }
}
