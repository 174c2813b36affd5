//! MQTT side of the gateway: topic names, JSON message shapes and the
//! telemetry sink that publishes node readings upstream.

use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use irrigation_core::irrigation::{IrrigationConfig, IrrigationState};
use irrigation_core::message::{Ack, AckOutcome, Command, CommandType, Heartbeat, PumpAction};
use irrigation_core::radio::LinkQuality;
use irrigation_core::sensor::SensorReading;
use irrigation_core::telemetry::{Alert, TelemetrySink};

pub const TOPIC_DATA: &str = "irrigation/data";
pub const TOPIC_STATUS: &str = "irrigation/status";
pub const TOPIC_COMMANDS: &str = "irrigation/commands";
pub const TOPIC_CONFIG: &str = "irrigation/config";

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMsg {
    pub node_id: u8,
    pub temperature: f32,
    pub humidity: f32,
    pub soil_moisture: f32,
    pub water_level: f32,
    pub light_level: f32,
    pub battery: f32,
    pub timestamp: i64,
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
}

impl DataMsg {
    pub fn new(node_id: u8, r: &SensorReading, link: Option<LinkQuality>) -> Self {
        Self {
            node_id,
            temperature: r.temperature,
            humidity: r.humidity,
            soil_moisture: r.soil_moisture,
            water_level: r.water_level,
            light_level: r.light_level,
            battery: r.battery,
            timestamp: r.timestamp,
            rssi: link.map(|l| l.rssi),
            snr: link.map(|l| l.snr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusEvent {
    Heartbeat,
    Stale,
    Alert,
    Ack,
    Commfail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMsg {
    pub node_id: u8,
    pub event: StatusEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<IrrigationState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_type: Option<CommandType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StatusMsg {
    fn bare(node_id: u8, event: StatusEvent) -> Self {
        Self {
            node_id,
            event,
            state: None,
            uptime_secs: None,
            remaining_secs: None,
            sequence: None,
            command_type: None,
            ok: None,
            rssi: None,
            age_secs: None,
            detail: None,
        }
    }

    pub fn heartbeat(node_id: u8, beat: &Heartbeat, link: LinkQuality) -> Self {
        Self {
            state: Some(beat.state),
            uptime_secs: Some(beat.uptime_secs),
            remaining_secs: Some(beat.remaining_secs),
            rssi: Some(link.rssi),
            ..Self::bare(node_id, StatusEvent::Heartbeat)
        }
    }

    pub fn stale(node_id: u8, age_secs: u64) -> Self {
        Self {
            age_secs: Some(age_secs),
            ..Self::bare(node_id, StatusEvent::Stale)
        }
    }

    pub fn alert(alert: &Alert) -> Self {
        Self {
            detail: Some(alert.to_string()),
            ..Self::bare(alert.node_id(), StatusEvent::Alert)
        }
    }

    pub fn ack(node_id: u8, ack: &Ack) -> Self {
        let detail = match &ack.outcome {
            AckOutcome::Ok => None,
            AckOutcome::Err(reason) => Some(reason.clone()),
        };
        Self {
            sequence: Some(ack.sequence),
            ok: Some(ack.is_ok()),
            detail,
            ..Self::bare(node_id, StatusEvent::Ack)
        }
    }

    pub fn commfail(node_id: u8, sequence: u8) -> Self {
        Self {
            sequence: Some(sequence),
            detail: Some("command not acknowledged".to_string()),
            ..Self::bare(node_id, StatusEvent::Commfail)
        }
    }

    /// Tag an ack or commfail with the kind of command it answers.
    pub fn for_command(self, command_type: Option<CommandType>) -> Self {
        Self {
            command_type,
            ..self
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound messages
// ---------------------------------------------------------------------------

/// `{"nodeId":3,"command":"start","duration":120}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMsg {
    pub node_id: u8,
    pub command: String,
    pub duration: Option<u32>,
    pub valve: Option<u8>,
    pub on: Option<bool>,
}

impl CommandMsg {
    pub fn to_command(&self) -> Result<Command, String> {
        let command = match self.command.trim().to_ascii_lowercase().as_str() {
            "start" => Command::Pump(PumpAction::Start(self.duration)),
            "stop" => Command::Pump(PumpAction::Stop),
            "pause" => Command::Pump(PumpAction::Pause),
            "resume" => Command::Pump(PumpAction::Resume),
            "valve" => Command::Valve {
                index: self.valve.unwrap_or(0),
                on: self.on.ok_or("valve command needs \"on\"")?,
            },
            "read" => Command::ReadSensors,
            "reset" => Command::Reset,
            "defaults" => Command::ConfigDefaults,
            other => return Err(format!("unknown command '{other}'")),
        };
        Ok(command)
    }
}

/// Missing fields take the stock defaults.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMsg {
    pub node_id: u8,
    pub soil_moisture_threshold: Option<f32>,
    pub duration_seconds: Option<i64>,
    pub min_interval_seconds: Option<i64>,
    pub auto_mode: Option<bool>,
}

impl ConfigMsg {
    pub fn to_config(&self) -> IrrigationConfig {
        let d = IrrigationConfig::default();
        IrrigationConfig {
            soil_moisture_threshold: self.soil_moisture_threshold.unwrap_or(d.soil_moisture_threshold),
            duration_secs: self.duration_seconds.unwrap_or(d.duration_secs),
            min_interval_secs: self.min_interval_seconds.unwrap_or(d.min_interval_secs),
            auto_mode: self.auto_mode.unwrap_or(d.auto_mode),
        }
    }
}

/// Decode a message from one of the inbound topics into a command for a
/// node. Config is validated here so a bad document never goes on air.
pub fn parse_inbound(topic: &str, payload: &[u8]) -> Result<(u8, Command), String> {
    match topic {
        TOPIC_COMMANDS => {
            let msg: CommandMsg =
                serde_json::from_slice(payload).map_err(|e| format!("bad command json: {e}"))?;
            Ok((msg.node_id, msg.to_command()?))
        }
        TOPIC_CONFIG => {
            let msg: ConfigMsg =
                serde_json::from_slice(payload).map_err(|e| format!("bad config json: {e}"))?;
            let config = msg.to_config();
            config.validate().map_err(|e| e.to_string())?;
            Ok((msg.node_id, Command::Config(config)))
        }
        other => Err(format!("unhandled topic={other}")),
    }
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Fire-and-forget publish. Implementations log their own failures.
pub trait Publisher: Send {
    fn publish(&mut self, topic: &'static str, payload: Vec<u8>);
}

impl Publisher for AsyncClient {
    fn publish(&mut self, topic: &'static str, payload: Vec<u8>) {
        if let Err(e) = self.try_publish(topic, QoS::AtLeastOnce, false, payload) {
            warn!(topic, error = %e, "mqtt publish dropped");
        }
    }
}

impl Publisher for Vec<(&'static str, Vec<u8>)> {
    fn publish(&mut self, topic: &'static str, payload: Vec<u8>) {
        self.push((topic, payload));
    }
}

/// The gateway's telemetry sink. Readings go to `irrigation/data` with the
/// link quality last seen from the node; alerts and status changes go to
/// `irrigation/status`.
pub struct MqttSink<P: Publisher> {
    out: P,
    links: HashMap<u8, LinkQuality>,
}

impl<P: Publisher> MqttSink<P> {
    pub fn new(out: P) -> Self {
        Self {
            out,
            links: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn out(&self) -> &P {
        &self.out
    }

    pub fn note_link(&mut self, node_id: u8, link: LinkQuality) {
        self.links.insert(node_id, link);
    }

    pub fn status(&mut self, msg: &StatusMsg) {
        self.send_json(TOPIC_STATUS, msg);
    }

    fn send_json<T: Serialize>(&mut self, topic: &'static str, msg: &T) {
        match serde_json::to_vec(msg) {
            Ok(payload) => self.out.publish(topic, payload),
            Err(e) => warn!(topic, error = %e, "could not encode mqtt message"),
        }
    }
}

impl<P: Publisher> TelemetrySink for MqttSink<P> {
    fn publish(&mut self, node_id: u8, reading: &SensorReading) {
        let msg = DataMsg::new(node_id, reading, self.links.get(&node_id).copied());
        self.send_json(TOPIC_DATA, &msg);
    }

    fn alert(&mut self, alert: &Alert) {
        self.status(&StatusMsg::alert(alert));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
