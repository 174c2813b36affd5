//! Delivery tracking for commands that expect an ACK.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct AckSettings {
    /// Wait before re-sending the same frame. Keep it longer than
    /// [`crate::mesh::RELAY_DEDUP_WINDOW`] or relays drop the retry as a duplicate.
    pub timeout: Duration,
    /// Transmissions including the first one.
    pub max_attempts: u32,
}

impl Default for AckSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    /// Re-send this frame; it has not been acknowledged in time.
    Retry {
        destination: u8,
        sequence: u8,
        frame: Vec<u8>,
    },
    GaveUp {
        destination: u8,
        sequence: u8,
    },
}

#[derive(Debug)]
struct Pending {
    frame: Vec<u8>,
    attempts: u32,
    sent_at: Instant,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    pending: HashMap<(u8, u8), Pending>,
    settings: AckSettings,
}

impl AckTracker {
    pub fn new(settings: AckSettings) -> Self {
        Self {
            pending: HashMap::new(),
            settings,
        }
    }

    /// Record a first transmission.
    pub fn track(&mut self, destination: u8, sequence: u8, frame: Vec<u8>, now: Instant) {
        let replaced = self.pending.insert(
            (destination, sequence),
            Pending {
                frame,
                attempts: 1,
                sent_at: now,
            },
        );
        if replaced.is_some() {
            debug!(node = destination, seq = sequence, "sequence reused before ack");
        }
    }

    /// `true` if the ACK matched something we were waiting for.
    pub fn acknowledge(&mut self, from: u8, sequence: u8) -> bool {
        self.pending.remove(&(from, sequence)).is_some()
    }

    pub fn poll(&mut self, now: Instant) -> Vec<AckEvent> {
        let mut events = Vec::new();
        let timeout = self.settings.timeout;
        let max_attempts = self.settings.max_attempts;

        self.pending.retain(|&(destination, sequence), p| {
            if now.saturating_duration_since(p.sent_at) < timeout {
                return true;
            }
            if p.attempts >= max_attempts {
                warn!(node = destination, seq = sequence, attempts = p.attempts, "no ack, giving up");
                events.push(AckEvent::GaveUp {
                    destination,
                    sequence,
                });
                return false;
            }
            p.attempts += 1;
            p.sent_at = now;
            debug!(node = destination, seq = sequence, attempt = p.attempts, "no ack, retrying");
            events.push(AckEvent::Retry {
                destination,
                sequence,
                frame: p.frame.clone(),
            });
            true
        });

        events.sort_by_key(|e| match e {
            AckEvent::Retry {
                destination,
                sequence,
                ..
            }
            | AckEvent::GaveUp {
                destination,
                sequence,
            } => (*destination, *sequence),
        });
        events
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn ack_clears_pending() {
        let mut t = AckTracker::default();
        let now = Instant::now();
        t.track(3, 10, b"frame".to_vec(), now);
        assert!(!t.acknowledge(3, 11));
        assert!(!t.acknowledge(4, 10));
        assert!(t.acknowledge(3, 10));
        assert_eq!(t.pending_count(), 0);
        assert!(t.poll(now + secs(60)).is_empty());
    }

    #[test]
    fn retries_then_gives_up() {
        let mut t = AckTracker::default();
        let t0 = Instant::now();
        t.track(3, 10, b"frame".to_vec(), t0);

        assert!(t.poll(t0 + secs(4)).is_empty());
        assert_eq!(
            t.poll(t0 + secs(5)),
            vec![AckEvent::Retry {
                destination: 3,
                sequence: 10,
                frame: b"frame".to_vec()
            }]
        );
        // Timer restarts from the retry.
        assert!(t.poll(t0 + secs(9)).is_empty());
        assert!(matches!(
            t.poll(t0 + secs(10)).as_slice(),
            [AckEvent::Retry { .. }]
        ));
        assert_eq!(
            t.poll(t0 + secs(15)),
            vec![AckEvent::GaveUp {
                destination: 3,
                sequence: 10
            }]
        );
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn events_are_ordered() {
        let mut t = AckTracker::default();
        let t0 = Instant::now();
        t.track(7, 1, vec![1], t0);
        t.track(2, 9, vec![2], t0);
        let events = t.poll(t0 + secs(5));
        assert!(matches!(
            events.as_slice(),
            [
                AckEvent::Retry { destination: 2, .. },
                AckEvent::Retry { destination: 7, .. }
            ]
        ));
    }

    #[test]
    fn retry_outlives_relay_memory() {
        use crate::mesh::{MeshSettings, RELAY_DEDUP_WINDOW};
        assert!(AckSettings::default().timeout > RELAY_DEDUP_WINDOW);
        assert_eq!(MeshSettings::default().dedup_window, RELAY_DEDUP_WINDOW);
    }
}
