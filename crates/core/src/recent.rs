//! Short-lived memory of `(source, sequence)` keys.
//!
//! Relays use it to forward a flooded packet once, the node dispatcher to
//! answer a repeated command from its stored ACK, and the gateway to drop
//! a reading that arrived over two paths. Entries expire after a window so
//! a wrapped sequence number from the same source is accepted again.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

/// `(source, sequence)`
pub type PacketKey = (u8, u8);

/// How long a delivered packet counts as a repeat. Longer than a full
/// gateway retry cycle, far shorter than it takes a source to wrap its
/// sequence counter.
pub const REPEAT_WINDOW: Duration = Duration::from_secs(30);

pub struct RecentCache<V> {
    entries: LruCache<PacketKey, (Instant, V)>,
    window: Duration,
}

impl<V> RecentCache<V> {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Value recorded for `key` within the window.
    pub fn get(&mut self, key: PacketKey, now: Instant) -> Option<&V> {
        let fresh = matches!(
            self.entries.peek(&key),
            Some((at, _)) if now.saturating_duration_since(*at) <= self.window
        );
        if !fresh {
            return None;
        }
        self.entries.get(&key).map(|(_, value)| value)
    }

    pub fn insert(&mut self, key: PacketKey, value: V, now: Instant) {
        self.entries.put(key, (now, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RecentCache<()> {
    /// True if the key was recorded within the window; otherwise records it.
    pub fn check_and_record(&mut self, key: PacketKey, now: Instant) -> bool {
        if self.get(key, now).is_some() {
            return true;
        }
        self.insert(key, (), now);
        false
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_inside_window_only() {
        let mut seen = RecentCache::new(8, Duration::from_secs(4));
        let t0 = Instant::now();
        assert!(!seen.check_and_record((7, 1), t0));
        assert!(seen.check_and_record((7, 1), t0 + Duration::from_secs(4)));
        assert!(!seen.check_and_record((7, 1), t0 + Duration::from_secs(5)));
        // Re-recorded at t0 + 5 s.
        assert!(seen.check_and_record((7, 1), t0 + Duration::from_secs(6)));
    }

    #[test]
    fn stored_value_comes_back() {
        let mut answered = RecentCache::new(8, REPEAT_WINDOW);
        let t0 = Instant::now();
        answered.insert((0, 12), "ACK,12,OK", t0);
        assert_eq!(answered.get((0, 12), t0 + Duration::from_secs(10)), Some(&"ACK,12,OK"));
        assert_eq!(answered.get((0, 13), t0), None);
        assert_eq!(answered.get((0, 12), t0 + REPEAT_WINDOW + Duration::from_secs(1)), None);
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let mut seen = RecentCache::new(2, REPEAT_WINDOW);
        let now = Instant::now();
        seen.check_and_record((1, 1), now);
        seen.check_and_record((1, 2), now);
        seen.check_and_record((1, 3), now);
        assert_eq!(seen.len(), 2);
        assert!(!seen.check_and_record((1, 1), now));
    }

    #[test]
    fn zero_capacity_still_holds_one() {
        let mut seen = RecentCache::new(0, REPEAT_WINDOW);
        assert!(seen.is_empty());
        seen.check_and_record((3, 3), Instant::now());
        assert_eq!(seen.len(), 1);
    }
}
