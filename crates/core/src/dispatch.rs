//! Node-side glue between the radio and the irrigation controller.
//!
//! Outbound: sensor readings and heartbeats go to the gateway with a
//! bounded retry; when the budget is spent the telemetry sink gets a
//! `CommFail` alert and the mesh gets one best-effort ALERT broadcast.
//!
//! Inbound: commands are parsed, executed through the [`ControllerHandle`]
//! and answered with an ACK unless they were broadcast. A command seen
//! again with the same source and sequence (a gateway retry after a lost
//! ACK, or a second mesh path) is answered from the stored ACK and not
//! executed twice.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::controller::ControllerHandle;
use crate::error::{Error, Result};
use crate::message::{self, Ack, Command, Heartbeat, PumpAction};
use crate::packet::{Packet, PacketType, BROADCAST};
use crate::radio::{LinkQuality, Transport};
use crate::recent::{RecentCache, REPEAT_WINDOW};
use crate::sensor::SensorReading;
use crate::service::{RadioService, RetryPolicy};
use crate::telemetry::{Alert, TelemetrySink};

/// Commands remembered for repeat detection.
const ANSWERED_CAPACITY: usize = 32;

/// Work the caller must do after a packet was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    None,
    /// `CMD,SENSOR,READ`: take a reading now and send it.
    SendReading,
}

pub struct Dispatcher<S: TelemetrySink> {
    node_id: u8,
    gateway: u8,
    controller: ControllerHandle,
    sink: S,
    retry: RetryPolicy,
    started: Instant,
    answered: RecentCache<Ack>,
}

impl<S: TelemetrySink> Dispatcher<S> {
    pub fn new(node_id: u8, gateway: u8, controller: ControllerHandle, sink: S, retry: RetryPolicy) -> Self {
        Self {
            node_id,
            gateway,
            controller,
            sink,
            retry,
            started: Instant::now(),
            answered: RecentCache::new(ANSWERED_CAPACITY, REPEAT_WINDOW),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn controller(&self) -> &ControllerHandle {
        &self.controller
    }

    // -- Outbound -----------------------------------------------------------

    pub async fn send_reading<T: Transport>(
        &mut self,
        svc: &mut RadioService<T>,
        reading: &SensorReading,
    ) -> Result<()> {
        self.sink.publish(self.node_id, reading);
        let packet = svc.originate(PacketType::Data, self.gateway, message::encode_reading(reading))?;
        self.send_or_alert(svc, &packet).await
    }

    pub async fn send_heartbeat<T: Transport>(&mut self, svc: &mut RadioService<T>) -> Result<()> {
        let snapshot = self.controller.snapshot().await?;
        let beat = Heartbeat {
            uptime_secs: self.started.elapsed().as_secs(),
            state: snapshot.state,
            remaining_secs: snapshot.remaining_secs,
        };
        let packet = svc.originate(PacketType::Heartbeat, self.gateway, beat.to_payload())?;
        self.send_or_alert(svc, &packet).await
    }

    /// Report to the local sink and make one broadcast attempt.
    pub fn raise_alert<T: Transport>(&mut self, svc: &mut RadioService<T>, alert: Alert) {
        warn!(code = alert.code(), "{alert}");
        self.sink.alert(&alert);
        match svc.originate(PacketType::Broadcast, BROADCAST, message::encode_alert(&alert)) {
            Ok(notice) => {
                if !svc.send(&notice) {
                    debug!("alert broadcast not sent");
                }
            }
            Err(e) => debug!(error = %e, "alert does not fit in a frame"),
        }
    }

    async fn send_or_alert<T: Transport>(&mut self, svc: &mut RadioService<T>, packet: &Packet) -> Result<()> {
        match svc.send_with_retry(packet, &self.retry).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let alert = Alert::CommFail {
                    node_id: self.node_id,
                    attempts: self.retry.attempts,
                };
                self.raise_alert(svc, alert);
                Err(e)
            }
        }
    }

    // -- Inbound ------------------------------------------------------------

    pub async fn handle_packet<T: Transport>(
        &mut self,
        svc: &mut RadioService<T>,
        packet: Packet,
        link: LinkQuality,
    ) -> FollowUp {
        match packet.kind {
            PacketType::Command => self.handle_command(svc, &packet).await,
            PacketType::Broadcast => {
                match message::parse_alert(packet.payload()) {
                    Ok(alert) => info!(from = packet.source, "mesh alert: {alert}"),
                    Err(e) => debug!(from = packet.source, error = %e, "unparsed broadcast"),
                }
                FollowUp::None
            }
            PacketType::Ack | PacketType::Data | PacketType::Heartbeat | PacketType::Mesh => {
                debug!(packet = %packet, rssi = link.rssi, "ignored on node");
                FollowUp::None
            }
        }
    }

    async fn handle_command<T: Transport>(&mut self, svc: &mut RadioService<T>, packet: &Packet) -> FollowUp {
        let key = (packet.source, packet.sequence);
        if let Some(ack) = self.answered.get(key, Instant::now()).cloned() {
            debug!(from = packet.source, seq = packet.sequence, "repeated command, answering again");
            if !packet.is_broadcast() {
                self.send_ack(svc, packet.source, &ack);
            }
            return FollowUp::None;
        }

        let outcome = match Command::parse(packet.payload()) {
            Ok(command) => {
                info!(from = packet.source, seq = packet.sequence, command = %command, "command");
                self.execute(command).await
            }
            Err(e) => Err(e),
        };

        let ack = match &outcome {
            Ok(_) => Ack::ok(packet.sequence),
            Err(e) => {
                warn!(from = packet.source, seq = packet.sequence, error = %e, "command rejected");
                Ack::err(packet.sequence, e)
            }
        };

        if let Err(Error::Actuator(reason)) = &outcome {
            let alert = Alert::Fault {
                node_id: self.node_id,
                reason: reason.clone(),
            };
            self.raise_alert(svc, alert);
        }

        if !packet.is_broadcast() {
            self.send_ack(svc, packet.source, &ack);
        }
        self.answered.insert(key, ack, Instant::now());

        outcome.unwrap_or(FollowUp::None)
    }

    fn send_ack<T: Transport>(&mut self, svc: &mut RadioService<T>, to: u8, ack: &Ack) {
        match svc.originate(PacketType::Ack, to, ack.to_payload()) {
            Ok(reply) => {
                if !svc.send(&reply) {
                    warn!(to, seq = ack.sequence, "ack not sent");
                }
            }
            Err(e) => warn!(error = %e, "ack does not fit in a frame"),
        }
    }

    async fn execute(&self, command: Command) -> Result<FollowUp> {
        let ctl = &self.controller;
        match command {
            Command::Valve { index: 0, on: true } => ctl.start_manual(None).await?,
            Command::Valve { index: 0, on: false } => ctl.stop().await?,
            Command::Valve { index, .. } => {
                return Err(Error::Command(format!("no valve {index} on this node")));
            }
            Command::Pump(PumpAction::Start(secs)) => ctl.start_manual(secs).await?,
            Command::Pump(PumpAction::Stop) => ctl.stop().await?,
            Command::Pump(PumpAction::Pause) => ctl.pause().await?,
            Command::Pump(PumpAction::Resume) => ctl.resume().await?,
            Command::Config(config) => {
                ctl.set_config(config).await?;
                return Ok(FollowUp::None);
            }
            Command::ConfigDefaults => {
                ctl.reset_config().await?;
                return Ok(FollowUp::None);
            }
            Command::ReadSensors => return Ok(FollowUp::SendReading),
            Command::Reset => ctl.reset().await?,
        };
        Ok(FollowUp::None)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
