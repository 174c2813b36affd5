use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use irrigation_core::mesh::MeshStats;
use irrigation_core::registry::NodeStatus;
use irrigation_core::service::RadioStats;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub network: NetworkView,
    pub events: VecDeque<SystemEvent>,
}

/// Copy of the radio service's view, refreshed by the gateway loop.
#[derive(Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkView {
    pub nodes: Vec<NodeStatus>,
    pub radio: RadioStats,
    pub mesh: MeshStats,
    pub pending_acks: usize,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Command,
    Ack,
    Node,
    Alert,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    #[serde(flatten)]
    pub network: NetworkView,
    /// Newest first.
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            network: NetworkView::default(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn record(&mut self, kind: EventKind, detail: impl Into<String>) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail: detail.into(),
        });
    }

    pub fn record_error(&mut self, detail: impl Into<String>) {
        self.record(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: impl Into<String>) {
        self.record(EventKind::System, detail);
    }

    pub fn set_mqtt_connected(&mut self, connected: bool) {
        if self.mqtt_connected != connected {
            self.mqtt_connected = connected;
            self.record_system(if connected {
                "mqtt connected"
            } else {
                "mqtt disconnected"
            });
        }
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            network: self.network.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_keeps_newest() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record(EventKind::Reading, format!("r{i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        let status = st.to_status();
        assert_eq!(status.events[0].detail, format!("r{}", MAX_EVENTS + 24));
        assert_eq!(status.events[MAX_EVENTS - 1].detail, "r25");
    }

    #[test]
    fn mqtt_flag_records_only_changes() {
        let mut st = SystemState::new();
        st.set_mqtt_connected(false);
        assert!(st.events.is_empty());
        st.set_mqtt_connected(true);
        st.set_mqtt_connected(true);
        assert!(st.mqtt_connected);
        assert_eq!(st.events.len(), 1);
        assert_eq!(st.events[0].detail, "mqtt connected");
    }

    #[test]
    fn status_json_shape() {
        let mut st = SystemState::new();
        st.network.pending_acks = 2;
        st.record_error("bad command json");
        let json = serde_json::to_value(st.to_status()).unwrap();

        assert_eq!(json["mqttConnected"], false);
        assert_eq!(json["pendingAcks"], 2);
        assert!(json["nodes"].as_array().unwrap().is_empty());
        assert_eq!(json["radio"]["framesSent"], 0);
        assert_eq!(json["events"][0]["kind"], "error");
        // RFC 3339 timestamps, e.g. 2024-05-01T10:00:00.123Z
        assert!(json["events"][0]["ts"].as_str().unwrap().contains('T'));
    }
}
