//! Last-known state of every node heard on the mesh.
//!
//! Staleness is informational only: it feeds status reports and never
//! changes actuation.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::irrigation::IrrigationState;
use crate::message::Heartbeat;
use crate::radio::LinkQuality;

/// Three missed heartbeats at the default 60 s interval.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node_id: u8,
    pub last_seen: Instant,
    pub link: LinkQuality,
    pub packets: u64,
    pub heartbeat: Option<Heartbeat>,
}

/// Serialisable view of an entry at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: u8,
    pub age_secs: u64,
    pub stale: bool,
    pub rssi: i32,
    pub snr: f32,
    pub packets: u64,
    pub uptime_secs: Option<u64>,
    pub state: Option<IrrigationState>,
    pub remaining_secs: Option<u64>,
}

pub struct NodeRegistry {
    nodes: BTreeMap<u8, NodeEntry>,
    stale_after: Duration,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl NodeRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            nodes: BTreeMap::new(),
            stale_after,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Any packet from `node_id` counts as a sign of life.
    pub fn observe(&mut self, node_id: u8, link: LinkQuality, now: Instant) {
        let entry = self.nodes.entry(node_id).or_insert_with(|| {
            info!(node = node_id, rssi = link.rssi, "new node heard");
            NodeEntry {
                node_id,
                last_seen: now,
                link,
                packets: 0,
                heartbeat: None,
            }
        });
        entry.last_seen = now;
        entry.link = link;
        entry.packets += 1;
    }

    pub fn record_heartbeat(&mut self, node_id: u8, beat: Heartbeat, now: Instant) {
        match self.nodes.get_mut(&node_id) {
            Some(entry) => {
                entry.last_seen = now;
                entry.heartbeat = Some(beat);
            }
            None => {
                self.nodes.insert(
                    node_id,
                    NodeEntry {
                        node_id,
                        last_seen: now,
                        link: LinkQuality::default(),
                        packets: 0,
                        heartbeat: Some(beat),
                    },
                );
            }
        }
        debug!(node = node_id, state = %beat.state, uptime = beat.uptime_secs, "heartbeat");
    }

    /// `None` for a node never heard.
    pub fn is_stale(&self, node_id: u8, now: Instant) -> Option<bool> {
        self.nodes
            .get(&node_id)
            .map(|e| now.saturating_duration_since(e.last_seen) > self.stale_after)
    }

    pub fn stale_nodes(&self, now: Instant) -> Vec<u8> {
        self.nodes
            .values()
            .filter(|e| now.saturating_duration_since(e.last_seen) > self.stale_after)
            .map(|e| e.node_id)
            .collect()
    }

    /// Forget nodes silent for twice the stale window. Returns how many.
    pub fn prune(&mut self, now: Instant) -> usize {
        let limit = self.stale_after * 2;
        let before = self.nodes.len();
        self.nodes.retain(|id, e| {
            let keep = now.saturating_duration_since(e.last_seen) <= limit;
            if !keep {
                info!(node = *id, "forgetting silent node");
            }
            keep
        });
        before - self.nodes.len()
    }

    pub fn get(&self, node_id: u8) -> Option<&NodeEntry> {
        self.nodes.get(&node_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn snapshot(&self, now: Instant) -> Vec<NodeStatus> {
        self.nodes
            .values()
            .map(|e| {
                let age = now.saturating_duration_since(e.last_seen);
                NodeStatus {
                    node_id: e.node_id,
                    age_secs: age.as_secs(),
                    stale: age > self.stale_after,
                    rssi: e.link.rssi,
                    snr: e.link.snr,
                    packets: e.packets,
                    uptime_secs: e.heartbeat.map(|h| h.uptime_secs),
                    state: e.heartbeat.map(|h| h.state),
                    remaining_secs: e.heartbeat.map(|h| h.remaining_secs),
                }
            })
            .collect()
    }
}
