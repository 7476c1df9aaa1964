//! Heartbeat timer queue.
//!
//! Entries are kept ordered by deadline. A connection may own several
//! entries at once (re-arming does not look for older ones), so teardown
//! purges by slot index rather than by exact entry.
//!
//! The earliest deadline is mirrored in an atomic so the monitor thread
//! can skip taking the lock while nothing can have expired yet.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::runtime::connection::ConnRef;

/// Sentinel for "no entries".
const NO_DEADLINE: u64 = u64::MAX;

struct Entries {
    /// Keyed by deadline plus an insertion sequence so equal deadlines
    /// coexist and keep their insertion order.
    map: BTreeMap<(Instant, u64), ConnRef>,
    next_seq: u64,
}

pub struct TimerQueue {
    entries: Mutex<Entries>,
    interval: Duration,
    /// Expired entries are handed out once and dropped instead of re-armed.
    kick: bool,
    len: AtomicUsize,
    /// Earliest deadline as nanoseconds past `base`.
    earliest: AtomicU64,
    base: Instant,
}

impl TimerQueue {
    pub fn new(interval: Duration, kick: bool) -> Self {
        Self {
            entries: Mutex::new(Entries {
                map: BTreeMap::new(),
                next_seq: 0,
            }),
            interval,
            kick,
            len: AtomicUsize::new(0),
            earliest: AtomicU64::new(NO_DEADLINE),
            base: Instant::now(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arm a timer for `conn` at `now + interval`.
    pub fn add(&self, conn: ConnRef, now: Instant) {
        let mut entries = self.entries.lock();
        Self::insert(&mut entries, now + self.interval, conn);
        self.publish(&entries);
    }

    fn insert(entries: &mut Entries, deadline: Instant, conn: ConnRef) {
        let seq = entries.next_seq;
        entries.next_seq = entries.next_seq.wrapping_add(1);
        entries.map.insert((deadline, seq), conn);
    }

    /// Cheap unlocked check whether anything can be due at `now`.
    pub fn may_have_expired(&self, now: Instant) -> bool {
        let earliest = self.earliest.load(Ordering::Acquire);
        earliest != NO_DEADLINE && earliest <= self.offset(now)
    }

    /// Remove every entry whose deadline is at or before `now`.
    ///
    /// In rolling mode each returned entry is re-armed for
    /// `now + interval`; in kick mode it is gone for good.
    pub fn pop_expired(&self, now: Instant) -> Vec<ConnRef> {
        let mut entries = self.entries.lock();
        let mut expired = Vec::new();

        while let Some(entry) = entries.map.first_entry() {
            if entry.key().0 > now {
                break;
            }
            expired.push(entry.remove());
        }

        if !self.kick {
            for &conn in &expired {
                Self::insert(&mut entries, now + self.interval, conn);
            }
        }

        self.publish(&entries);
        expired
    }

    /// Purge every entry belonging to slot `index`, whatever its epoch.
    pub fn remove_all_for(&self, index: usize) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.map.len();
        entries.map.retain(|_, conn| conn.index() != index);
        let removed = before - entries.map.len();
        self.publish(&entries);
        removed
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.map.clear();
        self.publish(&entries);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, entries: &Entries) {
        self.len.store(entries.map.len(), Ordering::Release);
        let earliest = entries
            .map
            .keys()
            .next()
            .map(|&(deadline, _)| self.offset(deadline))
            .unwrap_or(NO_DEADLINE);
        self.earliest.store(earliest, Ordering::Release);
    }

    fn offset(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.base)
            .as_nanos()
            .min((NO_DEADLINE - 1) as u128) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(20);

    #[test]
    fn test_nothing_expires_early() {
        let timers = TimerQueue::new(INTERVAL, false);
        let now = Instant::now();
        timers.add(ConnRef::new(0, 1), now);

        assert!(!timers.may_have_expired(now + INTERVAL / 2));
        assert!(timers.pop_expired(now + INTERVAL / 2).is_empty());
        assert_eq!(timers.len(), 1);

        assert!(timers.may_have_expired(now + INTERVAL));
    }

    #[test]
    fn test_pop_in_deadline_order() {
        let timers = TimerQueue::new(INTERVAL, true);
        let now = Instant::now();
        timers.add(ConnRef::new(2, 1), now + Duration::from_secs(2));
        timers.add(ConnRef::new(0, 1), now);
        timers.add(ConnRef::new(1, 1), now + Duration::from_secs(1));

        let expired = timers.pop_expired(now + INTERVAL + Duration::from_secs(5));
        let order: Vec<usize> = expired.iter().map(|r| r.index()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(timers.is_empty());
        assert!(!timers.may_have_expired(now + INTERVAL * 10));
    }

    #[test]
    fn test_rolling_mode_rearms() {
        let timers = TimerQueue::new(INTERVAL, false);
        let start = Instant::now();
        let conn = ConnRef::new(5, 3);
        timers.add(conn, start);

        let first = start + INTERVAL;
        assert_eq!(timers.pop_expired(first), vec![conn]);
        assert_eq!(timers.len(), 1);

        // one window later it fires again, exactly once
        assert!(timers.pop_expired(first + INTERVAL / 2).is_empty());
        assert_eq!(timers.pop_expired(first + INTERVAL), vec![conn]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_kick_mode_finalizes() {
        let timers = TimerQueue::new(INTERVAL, true);
        let start = Instant::now();
        timers.add(ConnRef::new(1, 1), start);

        assert_eq!(timers.pop_expired(start + INTERVAL).len(), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_remove_all_for_purges_duplicates() {
        let timers = TimerQueue::new(INTERVAL, false);
        let now = Instant::now();
        timers.add(ConnRef::new(7, 1), now);
        timers.add(ConnRef::new(7, 1), now);
        timers.add(ConnRef::new(7, 2), now + Duration::from_secs(1));
        timers.add(ConnRef::new(8, 1), now);

        assert_eq!(timers.remove_all_for(7), 3);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.remove_all_for(7), 0);

        timers.clear();
        assert!(timers.is_empty());
    }
}
