//! Gateway side of the radio link. Turns packets from the mesh into MQTT
//! messages, sends commands from MQTT to nodes and keeps retrying them
//! until the node ACKs or the retry budget runs out.
//!
//! A reading can reach the gateway twice when a node repeats a send or two
//! relays both forward it; only the first copy is published.

use std::collections::{BTreeSet, HashMap};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use irrigation_core::ack::{AckEvent, AckSettings, AckTracker};
use irrigation_core::message::{self, Ack, Command, CommandType, Heartbeat};
use irrigation_core::packet::{PacketType, BROADCAST};
use irrigation_core::radio::Transport;
use irrigation_core::recent::{RecentCache, REPEAT_WINDOW};
use irrigation_core::service::{Delivery, RadioService};
use irrigation_core::telemetry::TelemetrySink;

use crate::mqtt::{MqttSink, Publisher, StatusMsg};
use crate::state::{EventKind, NetworkView};

const SEEN_CAPACITY: usize = 64;

/// Something worth showing in the web UI's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub detail: String,
}

pub struct Gateway<T: Transport, P: Publisher> {
    svc: RadioService<T>,
    acks: AckTracker,
    sink: MqttSink<P>,
    inbox: Vec<Delivery>,
    /// Deliveries handled recently, by `(source, sequence)`.
    seen: RecentCache<()>,
    /// What each tracked command was, for status messages.
    inflight: HashMap<(u8, u8), CommandType>,
    /// Nodes already reported stale; cleared when they are heard again.
    reported_stale: BTreeSet<u8>,
    events: Vec<Event>,
}

impl<T: Transport, P: Publisher> Gateway<T, P> {
    pub fn new(svc: RadioService<T>, acks: AckSettings, sink: MqttSink<P>) -> Self {
        Self {
            svc,
            acks: AckTracker::new(acks),
            sink,
            inbox: Vec::new(),
            seen: RecentCache::new(SEEN_CAPACITY, REPEAT_WINDOW),
            inflight: HashMap::new(),
            reported_stale: BTreeSet::new(),
            events: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn sink(&self) -> &MqttSink<P> {
        &self.sink
    }

    pub fn service(&self) -> &RadioService<T> {
        &self.svc
    }

    pub fn pending_acks(&self) -> usize {
        self.acks.pending_count()
    }

    /// Events since the last call, oldest first.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn network(&self, now: Instant) -> NetworkView {
        NetworkView {
            nodes: self.svc.registry().snapshot(now),
            radio: self.svc.stats().clone(),
            mesh: self.svc.mesh_stats().clone(),
            pending_acks: self.acks.pending_count(),
        }
    }

    fn event(&mut self, kind: EventKind, detail: String) {
        self.events.push(Event { kind, detail });
    }

    // -- Inbound ------------------------------------------------------------

    /// Drain the radio and handle whatever was addressed to the gateway.
    pub fn poll(&mut self, now: Instant) -> usize {
        self.svc.poll(now, &mut self.inbox);
        let deliveries = std::mem::take(&mut self.inbox);
        let handled = deliveries.len();
        for delivery in deliveries {
            self.handle(delivery, now);
        }
        handled
    }

    fn handle(&mut self, delivery: Delivery, now: Instant) {
        let Delivery { packet, link } = delivery;
        let node = packet.source;
        self.sink.note_link(node, link);
        self.reported_stale.remove(&node);
        if self.seen.check_and_record((node, packet.sequence), now) {
            debug!(node, seq = packet.sequence, "repeat delivery dropped");
            return;
        }

        match packet.kind {
            PacketType::Data => match message::parse_reading(packet.payload()) {
                Ok(reading) => {
                    self.sink.publish(node, &reading);
                    self.event(
                        EventKind::Reading,
                        format!("node {node}: soil {:.1}%", reading.soil_moisture),
                    );
                }
                Err(e) => warn!(node, error = %e, "bad reading"),
            },
            PacketType::Heartbeat => match Heartbeat::parse(packet.payload()) {
                Ok(beat) => {
                    self.svc.registry_mut().record_heartbeat(node, beat, now);
                    self.sink.status(&StatusMsg::heartbeat(node, &beat, link));
                }
                Err(e) => warn!(node, error = %e, "bad heartbeat"),
            },
            PacketType::Ack => match Ack::parse(packet.payload()) {
                Ok(ack) => {
                    if self.acks.acknowledge(node, ack.sequence) {
                        info!(node, seq = ack.sequence, ok = ack.is_ok(), "command acknowledged");
                        let kind = self.inflight.remove(&(node, ack.sequence));
                        self.sink.status(&StatusMsg::ack(node, &ack).for_command(kind));
                        self.event(EventKind::Ack, format!("node {node}: {}", ack.to_payload()));
                    } else {
                        debug!(node, seq = ack.sequence, "ack for nothing pending");
                    }
                }
                Err(e) => warn!(node, error = %e, "bad ack"),
            },
            PacketType::Broadcast => match message::parse_alert(packet.payload()) {
                Ok(alert) => {
                    self.sink.alert(&alert);
                    self.event(EventKind::Alert, alert.to_string());
                }
                Err(e) => debug!(node, error = %e, "unparsed broadcast"),
            },
            PacketType::Command | PacketType::Mesh => {
                debug!(packet = %packet, "ignored on gateway");
            }
        }
    }

    // -- Outbound -----------------------------------------------------------

    /// Send a command to one node (or all of them) and start waiting for
    /// its ACK. Broadcast commands are never acknowledged, so they are sent
    /// once and not tracked.
    pub fn send_command(&mut self, node: u8, command: &Command, now: Instant) -> irrigation_core::Result<u8> {
        let packet = self
            .svc
            .originate(PacketType::Command, node, command.to_payload())?;
        let frame = self.svc.codec().encode(&packet);
        if !self.svc.send_frame(&frame) {
            warn!(node, seq = packet.sequence, "command send failed, will retry");
        }
        if node != BROADCAST {
            self.acks.track(node, packet.sequence, frame, now);
            self.inflight
                .insert((node, packet.sequence), command.command_type());
        }
        info!(node, seq = packet.sequence, command = %command, "command sent");
        self.event(EventKind::Command, format!("node {node}: {command}"));
        Ok(packet.sequence)
    }

    /// Re-send unacknowledged commands; report the ones that ran out of
    /// attempts.
    pub fn retry_commands(&mut self, now: Instant) {
        for event in self.acks.poll(now) {
            match event {
                AckEvent::Retry { frame, .. } => {
                    self.svc.send_frame(&frame);
                }
                AckEvent::GaveUp {
                    destination,
                    sequence,
                } => {
                    let kind = self.inflight.remove(&(destination, sequence));
                    self.sink
                        .status(&StatusMsg::commfail(destination, sequence).for_command(kind));
                    self.event(
                        EventKind::Error,
                        format!("node {destination}: command {sequence} not acknowledged"),
                    );
                }
            }
        }
    }

    /// Report nodes that went quiet (once each) and forget long-silent ones.
    pub fn check_nodes(&mut self, now: Instant) {
        let stale = self.svc.registry().stale_nodes(now);
        for &node in &stale {
            if self.reported_stale.contains(&node) {
                continue;
            }
            let age = self
                .svc
                .registry()
                .get(node)
                .map_or(0, |e| now.saturating_duration_since(e.last_seen).as_secs());
            warn!(node, age_s = age, "node stale");
            self.sink.status(&StatusMsg::stale(node, age));
            self.event(EventKind::Node, format!("node {node}: silent for {age}s"));
        }
        self.reported_stale = stale.into_iter().collect();

        let forgotten = self.svc.registry_mut().prune(now);
        if forgotten > 0 {
            self.reported_stale
                .retain(|&node| self.svc.registry().get(node).is_some());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use irrigation_core::codec::{Codec, WireFormat};
    use irrigation_core::irrigation::IrrigationState;
    use irrigation_core::mesh::{MeshEngine, MeshSettings};
    use irrigation_core::message::PumpAction;
    use irrigation_core::packet::{Packet, GATEWAY};
    use irrigation_core::radio::{LinkQuality, Medium, MemoryRadio};
    use irrigation_core::registry::NodeRegistry;
    use irrigation_core::sensor::SensorReading;
    use irrigation_core::telemetry::Alert;
    use serde_json::Value;
    use std::time::Duration;

    use crate::mqtt::{TOPIC_DATA, TOPIC_STATUS};

    const NODE: u8 = 6;

    type Out = Vec<(&'static str, Vec<u8>)>;

    fn service(medium: &Medium, id: u8) -> RadioService<MemoryRadio> {
        RadioService::new(
            medium.attach(id),
            Codec::new(WireFormat::Text),
            MeshEngine::new(id, MeshSettings::default()),
            NodeRegistry::default(),
        )
    }

    /// Gateway plus one field node it can hear directly.
    fn rig() -> (Gateway<MemoryRadio, Out>, RadioService<MemoryRadio>) {
        let medium = Medium::new();
        medium.link(GATEWAY, NODE, LinkQuality { rssi: -91, snr: 3.5 });
        let gw = Gateway::new(service(&medium, GATEWAY), AckSettings::default(), MqttSink::new(Vec::new()));
        (gw, service(&medium, NODE))
    }

    fn published(gw: &Gateway<MemoryRadio, Out>) -> Vec<(&'static str, Value)> {
        gw.sink()
            .out()
            .iter()
            .map(|(topic, payload)| (*topic, serde_json::from_slice(payload).unwrap()))
            .collect()
    }

    fn node_sends(node: &mut RadioService<MemoryRadio>, kind: PacketType, payload: String) {
        let packet = node.originate(kind, GATEWAY, payload).unwrap();
        assert!(node.send(&packet));
    }

    fn node_inbox(node: &mut RadioService<MemoryRadio>) -> Vec<Delivery> {
        let mut inbox = Vec::new();
        node.poll(Instant::now(), &mut inbox);
        inbox
    }

    // -- Inbound ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn reading_goes_to_data_topic() {
        let (mut gw, mut node) = rig();
        let reading = SensorReading {
            soil_moisture: 18.5,
            battery: 3.75,
            timestamp: 1_700_000_500,
            ..SensorReading::default()
        };
        node_sends(&mut node, PacketType::Data, message::encode_reading(&reading));

        assert_eq!(gw.poll(Instant::now()), 1);
        let out = published(&gw);
        assert_eq!(out.len(), 1);
        let (topic, json) = &out[0];
        assert_eq!(*topic, TOPIC_DATA);
        assert_eq!(json["nodeId"], NODE);
        assert_eq!(json["soilMoisture"], 18.5);
        assert_eq!(json["rssi"], -91);
        assert_eq!(gw.take_events()[0].kind, EventKind::Reading);
        assert!(gw.take_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_updates_registry_and_status() {
        let (mut gw, mut node) = rig();
        let beat = Heartbeat {
            uptime_secs: 42,
            state: IrrigationState::Paused,
            remaining_secs: 90,
        };
        node_sends(&mut node, PacketType::Heartbeat, beat.to_payload());
        gw.poll(Instant::now());

        let entry = gw.service().registry().get(NODE).unwrap();
        assert_eq!(entry.heartbeat, Some(beat));
        let (topic, json) = &published(&gw)[0];
        assert_eq!(*topic, TOPIC_STATUS);
        assert_eq!(json["event"], "heartbeat");
        assert_eq!(json["state"], "paused");
    }

    #[tokio::test(start_paused = true)]
    async fn alert_broadcast_is_forwarded() {
        let (mut gw, mut node) = rig();
        let alert = Alert::Fault {
            node_id: NODE,
            reason: "pump relay stuck".into(),
        };
        let packet = node
            .originate(PacketType::Broadcast, BROADCAST, message::encode_alert(&alert))
            .unwrap();
        assert!(node.send(&packet));
        gw.poll(Instant::now());

        let (_, json) = &published(&gw)[0];
        assert_eq!(json["event"], "alert");
        assert_eq!(json["detail"], "node 6: fault: pump relay stuck");
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_reading_is_published_once() {
        let (mut gw, mut node) = rig();
        let packet = node
            .originate(PacketType::Data, GATEWAY, message::encode_reading(&SensorReading::default()))
            .unwrap();
        assert!(node.send(&packet));
        assert!(node.send(&packet));
        assert_eq!(gw.poll(Instant::now()), 2);
        assert_eq!(published(&gw).len(), 1);
        assert_eq!(gw.take_events().len(), 1);

        // The same sequence much later is a new reading (counter wrapped).
        tokio::time::advance(REPEAT_WINDOW + Duration::from_secs(1)).await;
        assert!(node.send(&packet));
        gw.poll(Instant::now());
        assert_eq!(published(&gw).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_is_dropped_quietly() {
        let (mut gw, mut node) = rig();
        node_sends(&mut node, PacketType::Data, "DATA,not,a,reading".into());
        node_sends(&mut node, PacketType::Heartbeat, "HB,x".into());
        assert_eq!(gw.poll(Instant::now()), 2);
        assert!(published(&gw).is_empty());
    }

    // -- Commands -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn command_is_acked_once() {
        let (mut gw, mut node) = rig();
        let cmd = Command::Pump(PumpAction::Start(Some(120)));
        let seq = gw.send_command(NODE, &cmd, Instant::now()).unwrap();
        assert_eq!(gw.pending_acks(), 1);

        let inbox = node_inbox(&mut node);
        assert_eq!(inbox.len(), 1);
        assert_eq!(Command::parse(inbox[0].packet.payload()).unwrap(), cmd);

        node_sends(&mut node, PacketType::Ack, Ack::ok(seq).to_payload());
        // A duplicate ACK from a retry crossing in flight is harmless.
        node_sends(&mut node, PacketType::Ack, Ack::ok(seq).to_payload());
        gw.poll(Instant::now());

        assert_eq!(gw.pending_acks(), 0);
        let out = published(&gw);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1["event"], "ack");
        assert_eq!(out[0].1["ok"], true);
        assert_eq!(out[0].1["commandType"], "PUMP");
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_command_is_retried_then_reported() {
        let (mut gw, mut node) = rig();
        let t0 = Instant::now();
        let seq = gw.send_command(NODE, &Command::Reset, t0).unwrap();
        assert_eq!(node_inbox(&mut node).len(), 1);

        gw.retry_commands(t0 + Duration::from_secs(5));
        gw.retry_commands(t0 + Duration::from_secs(10));
        // Same frame, same sequence number each time.
        let retries = node_inbox(&mut node);
        assert_eq!(retries.len(), 2);
        assert!(retries.iter().all(|d| d.packet.sequence == seq));

        gw.retry_commands(t0 + Duration::from_secs(15));
        assert_eq!(gw.pending_acks(), 0);
        let (_, json) = &published(&gw)[0];
        assert_eq!(json["event"], "commfail");
        assert_eq!(json["sequence"], seq);
        assert_eq!(json["commandType"], "RESET");
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_command_is_not_tracked() {
        let (mut gw, mut node) = rig();
        gw.send_command(BROADCAST, &Command::Pump(PumpAction::Stop), Instant::now())
            .unwrap();
        assert_eq!(gw.pending_acks(), 0);
        let inbox = node_inbox(&mut node);
        assert!(inbox[0].packet.is_broadcast());
    }

    // -- Staleness ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn stale_node_reported_once_and_pruned() {
        let (mut gw, mut node) = rig();
        let t0 = Instant::now();
        node_sends(&mut node, PacketType::Data, message::encode_reading(&SensorReading::default()));
        gw.poll(t0);
        let before = published(&gw).len();

        gw.check_nodes(t0 + Duration::from_secs(120));
        assert_eq!(published(&gw).len(), before);

        gw.check_nodes(t0 + Duration::from_secs(181));
        gw.check_nodes(t0 + Duration::from_secs(200));
        let stale: Vec<_> = published(&gw)
            .into_iter()
            .filter(|(_, j)| j["event"] == "stale")
            .collect();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].1["ageSecs"], 181);

        gw.check_nodes(t0 + Duration::from_secs(361));
        assert!(gw.service().registry().get(NODE).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn network_view_reflects_registry() {
        let (mut gw, mut node) = rig();
        node_sends(&mut node, PacketType::Data, message::encode_reading(&SensorReading::default()));
        gw.poll(Instant::now());
        gw.send_command(NODE, &Command::ReadSensors, Instant::now()).unwrap();

        let view = gw.network(Instant::now());
        assert_eq!(view.nodes.len(), 1);
        assert_eq!(view.nodes[0].node_id, NODE);
        assert_eq!(view.pending_acks, 1);
        assert_eq!(view.radio.frames_received, 1);
    }

    #[test]
    fn commands_from_gateway_are_ignored_inbound() {
        // A node never sends commands; one arriving at the gateway is dropped.
        let medium = Medium::new();
        let mut gw: Gateway<MemoryRadio, Out> =
            Gateway::new(service(&medium, GATEWAY), AckSettings::default(), MqttSink::new(Vec::new()));
        let packet = Packet::new(PacketType::Command, 9, GATEWAY, 1, b"CMD,RESET".to_vec()).unwrap();
        gw.handle(
            Delivery {
                packet,
                link: LinkQuality::default(),
            },
            Instant::now(),
        );
        assert!(published(&gw).is_empty());
        assert!(gw.take_events().is_empty());
    }
}
