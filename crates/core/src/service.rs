//! Radio service: codec + transport + mesh engine + node registry.
//!
//! One task owns a `RadioService`. It polls the transport, relays what the
//! mesh engine says to relay, and hands packets addressed to this node to a
//! [`MessageSink`]. Outbound traffic is numbered here so every packet from
//! this node carries a fresh sequence number.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::mesh::{MeshEngine, MeshStats, Route};
use crate::packet::{Packet, PacketType, SequenceCounter};
use crate::radio::{self, LinkQuality, Received, Transport};
use crate::registry::NodeRegistry;

/// Upper bound on frames handled per `poll`, so a chatty neighbour cannot
/// starve the rest of the loop.
const MAX_FRAMES_PER_POLL: usize = 32;

/// A packet addressed to this node, already unwrapped from any mesh
/// envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub packet: Packet,
    pub link: LinkQuality,
}

pub trait MessageSink {
    fn deliver(&mut self, packet: Packet, link: LinkQuality);
}

impl MessageSink for Vec<Delivery> {
    fn deliver(&mut self, packet: Packet, link: LinkQuality) {
        self.push(Delivery { packet, link });
    }
}

impl MessageSink for mpsc::Sender<Delivery> {
    fn deliver(&mut self, packet: Packet, link: LinkQuality) {
        if let Err(e) = self.try_send(Delivery { packet, link }) {
            warn!(error = %e, "delivery queue full, packet dropped");
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RadioStats {
    pub frames_sent: u64,
    pub send_failures: u64,
    pub frames_received: u64,
    pub frames_rejected: u64,
    pub own_echoes: u64,
    pub last_rssi: Option<i32>,
    pub last_snr: Option<f32>,
}

pub struct RadioService<T: Transport> {
    radio: T,
    codec: Codec,
    engine: MeshEngine,
    registry: NodeRegistry,
    sequence: SequenceCounter,
    stats: RadioStats,
}

impl<T: Transport> RadioService<T> {
    pub fn new(radio: T, codec: Codec, engine: MeshEngine, registry: NodeRegistry) -> Self {
        Self {
            radio,
            codec,
            engine,
            registry,
            sequence: SequenceCounter::default(),
            stats: RadioStats::default(),
        }
    }

    pub fn node_id(&self) -> u8 {
        self.engine.self_id()
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut NodeRegistry {
        &mut self.registry
    }

    pub fn stats(&self) -> &RadioStats {
        &self.stats
    }

    pub fn mesh_stats(&self) -> &MeshStats {
        self.engine.stats()
    }

    // -- Inbound ------------------------------------------------------------

    /// Drain waiting frames. Returns how many were taken off the radio.
    pub fn poll(&mut self, now: Instant, sink: &mut impl MessageSink) -> usize {
        let mut taken = 0;
        while taken < MAX_FRAMES_PER_POLL {
            let Some(received) = self.radio.receive() else {
                break;
            };
            taken += 1;
            self.handle_frame(received, now, sink);
        }
        taken
    }

    fn handle_frame(&mut self, received: Received, now: Instant, sink: &mut impl MessageSink) {
        let Received { frame, link } = received;
        self.stats.frames_received += 1;
        self.stats.last_rssi = Some(link.rssi);
        self.stats.last_snr = Some(link.snr);

        let packet = match self.codec.decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.frames_rejected += 1;
                debug!(code = e.error_code(), error = %e, len = frame.len(), "dropping frame");
                return;
            }
        };

        if packet.source != self.node_id() {
            self.registry.observe(packet.source, link, now);
        }

        match self.engine.classify(&packet, now) {
            Route::Deliver if packet.source == self.node_id() => {
                // Our own broadcast heard back from a neighbour.
                self.stats.own_echoes += 1;
                debug!(packet = %packet, "own echo ignored");
            }
            Route::Deliver => match packet.unwrap_mesh() {
                Ok(inner) => sink.deliver(inner, link),
                Err(e) => debug!(error = %e, "undeliverable mesh packet"),
            },
            Route::Forward => match self.engine.forward_copy(&packet) {
                Ok(copy) => {
                    let frame = self.codec.encode(&copy);
                    if !self.transmit_frame(&frame) {
                        warn!(packet = %copy, "relay transmit failed");
                    }
                }
                Err(e) => debug!(error = %e, packet = %packet, "cannot relay"),
            },
            Route::Drop(reason) => {
                debug!(reason = ?reason, packet = %packet, "dropped");
            }
        }
    }

    // -- Outbound -----------------------------------------------------------

    /// Build a packet from this node with the next sequence number.
    pub fn originate(
        &mut self,
        kind: PacketType,
        destination: u8,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Packet> {
        let source = self.node_id();
        Packet::new(kind, source, destination, self.sequence.next(), payload)
    }

    /// Single transmit attempt.
    pub fn send(&mut self, packet: &Packet) -> bool {
        let frame = self.codec.encode(packet);
        self.transmit_frame(&frame)
    }

    /// Re-send an already-encoded frame, such as an unacknowledged command.
    pub fn send_frame(&mut self, frame: &[u8]) -> bool {
        self.transmit_frame(frame)
    }

    /// Bounded retry with doubling backoff.
    pub async fn send_with_retry(&mut self, packet: &Packet, policy: &RetryPolicy) -> Result<()> {
        let frame = self.codec.encode(packet);
        let mut backoff = policy.initial_backoff;
        for attempt in 1..=policy.attempts {
            if self.transmit_frame(&frame) {
                return Ok(());
            }
            warn!(
                attempt,
                max = policy.attempts,
                packet = %packet,
                "radio send failed"
            );
            if attempt < policy.attempts {
                sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(Error::Transport {
            attempts: policy.attempts,
        })
    }

    fn transmit_frame(&mut self, frame: &[u8]) -> bool {
        let ok = radio::transmit(&mut self.radio, frame);
        if ok {
            self.stats.frames_sent += 1;
        } else {
            self.stats.send_failures += 1;
        }
        ok
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireFormat;
    use crate::mesh::MeshSettings;
    use crate::packet::{BROADCAST, GATEWAY};
    use crate::radio::{Medium, MemoryRadio};

    fn service(medium: &Medium, id: u8) -> RadioService<MemoryRadio> {
        RadioService::new(
            medium.attach(id),
            Codec::new(WireFormat::Text),
            MeshEngine::new(id, MeshSettings::default()),
            NodeRegistry::default(),
        )
    }

    fn link() -> LinkQuality {
        LinkQuality {
            rssi: -85,
            snr: 6.5,
        }
    }

    // -- Inbound ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn delivers_packets_addressed_to_us() {
        let medium = Medium::new();
        let mut svc = service(&medium, 4);
        let codec = Codec::new(WireFormat::Text);
        let p = Packet::new(PacketType::Command, GATEWAY, 4, 3, b"CMD,RESET".to_vec()).unwrap();
        medium.inject(4, codec.encode(&p), link());

        let mut inbox: Vec<Delivery> = Vec::new();
        assert_eq!(svc.poll(Instant::now(), &mut inbox), 1);
        assert_eq!(inbox, vec![Delivery { packet: p, link: link() }]);
        assert_eq!(svc.registry().get(GATEWAY).unwrap().packets, 1);
        assert_eq!(svc.stats().last_rssi, Some(-85));
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_frames_are_counted_and_dropped() {
        let medium = Medium::new();
        let mut svc = service(&medium, 4);
        medium.inject(4, b"\x01\x02".to_vec(), link());
        medium.inject(4, b"\x01\x02\x04,1,0,DATA,0000".to_vec(), link());

        let mut inbox: Vec<Delivery> = Vec::new();
        assert_eq!(svc.poll(Instant::now(), &mut inbox), 2);
        assert!(inbox.is_empty());
        assert_eq!(svc.stats().frames_rejected, 2);
        assert!(svc.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn relays_foreign_traffic_once() {
        let medium = Medium::new();
        let mut relay = service(&medium, 4);
        let mut gateway = service(&medium, GATEWAY);
        medium.link(4, GATEWAY, link());
        let codec = Codec::new(WireFormat::Text);

        // Node 9 is out of the gateway's range; its packet reaches node 4 twice.
        let p = Packet::new(PacketType::Data, 9, GATEWAY, 12, b"DATA".to_vec()).unwrap();
        medium.inject(4, codec.encode(&p), link());
        medium.inject(4, codec.encode(&p.clone().with_hops(1)), link());

        let mut ignored: Vec<Delivery> = Vec::new();
        relay.poll(Instant::now(), &mut ignored);
        assert!(ignored.is_empty());
        assert_eq!(relay.mesh_stats().forwarded, 1);
        assert_eq!(relay.mesh_stats().dropped_duplicate, 1);

        let mut inbox: Vec<Delivery> = Vec::new();
        gateway.poll(Instant::now(), &mut inbox);
        assert_eq!(inbox.len(), 1);
        let got = &inbox[0].packet;
        assert_eq!(got.kind, PacketType::Data);
        assert_eq!(got.source, 9);
        assert_eq!(got.hop_count, 1);
        assert_eq!(got.payload(), b"DATA");
    }

    #[tokio::test(start_paused = true)]
    async fn own_echo_is_not_relayed() {
        let medium = Medium::new();
        let mut svc = service(&medium, 4);
        let codec = Codec::new(WireFormat::Text);
        let p = Packet::new(PacketType::Data, 4, GATEWAY, 1, b"DATA".to_vec())
            .unwrap()
            .with_hops(2);
        medium.inject(4, codec.encode(&p), link());

        let mut inbox: Vec<Delivery> = Vec::new();
        svc.poll(Instant::now(), &mut inbox);
        assert_eq!(svc.stats().frames_sent, 0);
        assert_eq!(svc.mesh_stats().dropped_self_origin, 1);
        assert!(svc.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn own_broadcast_echo_is_not_delivered() {
        let medium = Medium::new();
        let mut svc = service(&medium, 4);
        let codec = Codec::new(WireFormat::Text);
        let alert = Packet::new(PacketType::Broadcast, 4, BROADCAST, 7, b"ALERT,COMMFAIL,4,3".to_vec())
            .unwrap()
            .with_hops(1);
        let foreign = Packet::new(PacketType::Broadcast, 9, BROADCAST, 7, b"ALERT,COMMFAIL,9,3".to_vec()).unwrap();
        medium.inject(4, codec.encode(&alert), link());
        medium.inject(4, codec.encode(&foreign), link());

        let mut inbox: Vec<Delivery> = Vec::new();
        assert_eq!(svc.poll(Instant::now(), &mut inbox), 2);
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].packet.source, 9);
        assert_eq!(svc.stats().own_echoes, 1);
    }

    // -- Outbound -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn originate_numbers_packets() {
        let medium = Medium::new();
        let mut svc = service(&medium, 4);
        let a = svc.originate(PacketType::Data, GATEWAY, "DATA").unwrap();
        let b = svc.originate(PacketType::Heartbeat, BROADCAST, "HB").unwrap();
        assert_eq!(a.source, 4);
        assert_eq!(b.sequence, a.sequence.wrapping_add(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_transient_failure() {
        let medium = Medium::new();
        let radio = medium.attach(4);
        let tap = radio.tap();
        let mut svc = RadioService::new(
            radio,
            Codec::new(WireFormat::Binary),
            MeshEngine::new(4, MeshSettings::default()),
            NodeRegistry::default(),
        );
        tap.fail_next_sends(2);
        let p = svc.originate(PacketType::Data, GATEWAY, "DATA").unwrap();

        let started = Instant::now();
        svc.send_with_retry(&p, &RetryPolicy::default()).await.unwrap();
        // 200 ms + 400 ms of backoff.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(600), "{waited:?}");
        assert!(waited < Duration::from_millis(700), "{waited:?}");
        assert_eq!(tap.send_attempts(), 3);
        assert!(tap.is_receiving());
        assert_eq!(svc.stats().send_failures, 2);
        assert_eq!(svc.stats().frames_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_is_bounded() {
        let medium = Medium::new();
        let radio = medium.attach(4);
        let tap = radio.tap();
        let mut svc = RadioService::new(
            radio,
            Codec::new(WireFormat::Text),
            MeshEngine::new(4, MeshSettings::default()),
            NodeRegistry::default(),
        );
        tap.fail_next_sends(10);
        let p = svc.originate(PacketType::Data, GATEWAY, "DATA").unwrap();
        let err = svc
            .send_with_retry(&p, &RetryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err, Error::Transport { attempts: 3 });
        assert_eq!(tap.send_attempts(), 3);
        assert!(tap.is_receiving());
    }
}
