//! Flood-mesh forwarding decisions.
//!
//! Every node relays packets that are neither for it nor originated by
//! it, once per `(source, sequence)` within the dedup window, until the
//! hop budget is spent.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::packet::{Packet, BROADCAST, MAX_HOPS};
use crate::recent::RecentCache;

/// How long a relay remembers a packet it forwarded. A flood settles well
/// inside this; it must stay shorter than the gateway's ACK timeout so a
/// retried command (same source and sequence) is relayed again.
pub const RELAY_DEDUP_WINDOW: Duration = Duration::from_secs(4);

#[derive(Debug, Clone)]
pub struct MeshSettings {
    pub max_hops: u8,
    pub dedup_capacity: usize,
    pub dedup_window: Duration,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            max_hops: MAX_HOPS,
            dedup_capacity: 128,
            dedup_window: RELAY_DEDUP_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Deliver,
    Forward,
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    HopLimit,
    SelfOrigin,
    Duplicate,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshStats {
    pub delivered: u64,
    pub forwarded: u64,
    pub dropped_hop_limit: u64,
    pub dropped_self_origin: u64,
    pub dropped_duplicate: u64,
}

impl MeshStats {
    fn count(&mut self, route: Route) {
        match route {
            Route::Deliver => self.delivered += 1,
            Route::Forward => self.forwarded += 1,
            Route::Drop(DropReason::HopLimit) => self.dropped_hop_limit += 1,
            Route::Drop(DropReason::SelfOrigin) => self.dropped_self_origin += 1,
            Route::Drop(DropReason::Duplicate) => self.dropped_duplicate += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct MeshEngine {
    self_id: u8,
    settings: MeshSettings,
    recent: RecentCache<()>,
    stats: MeshStats,
}

impl MeshEngine {
    pub fn new(self_id: u8, settings: MeshSettings) -> Self {
        let recent = RecentCache::new(settings.dedup_capacity, settings.dedup_window);
        Self {
            self_id,
            settings,
            recent,
            stats: MeshStats::default(),
        }
    }

    pub fn self_id(&self) -> u8 {
        self.self_id
    }

    pub fn stats(&self) -> &MeshStats {
        &self.stats
    }

    /// Number of `(source, sequence)` keys currently remembered.
    pub fn remembered(&self) -> usize {
        self.recent.len()
    }

    /// Decide what to do with a received packet. Rules apply in order: hop
    /// limit, addressed to us, our own echo, duplicate, forward.
    pub fn classify(&mut self, packet: &Packet, now: Instant) -> Route {
        let route = self.route_for(packet, now);
        self.stats.count(route);
        debug!(
            node = self.self_id,
            packet = %packet,
            route = ?route,
            "classified"
        );
        route
    }

    fn route_for(&mut self, packet: &Packet, now: Instant) -> Route {
        if packet.hop_count > self.settings.max_hops {
            return Route::Drop(DropReason::HopLimit);
        }
        if packet.destination == self.self_id || packet.destination == BROADCAST {
            return Route::Deliver;
        }
        if packet.source == self.self_id {
            return Route::Drop(DropReason::SelfOrigin);
        }
        if self
            .recent
            .check_and_record((packet.source, packet.sequence), now)
        {
            return Route::Drop(DropReason::Duplicate);
        }
        Route::Forward
    }

    /// Copy to rebroadcast: one more hop, wrapped as a Mesh packet.
    pub fn forward_copy(&self, packet: &Packet) -> Result<Packet> {
        let relayed = packet
            .clone()
            .with_hops(packet.hop_count.saturating_add(1));
        relayed.wrap_mesh()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
