//! Text grammars carried in packet payloads.
//!
//! ```text
//! DATA,<soil>,<temp>,<hum>,<water>,<light>,<battery>,<ts>
//! CMD,VALVE,<index>,<ON|OFF>
//! CMD,PUMP,<START[,secs]|STOP|PAUSE|RESUME>
//! CMD,CONFIG,<threshold>,<duration>,<min_interval>,<0|1>
//! CMD,CONFIG,DEFAULTS
//! CMD,SENSOR,READ
//! CMD,RESET
//! ACK,<seq>,<OK|ERR>[,<reason>]
//! HB,<uptime>,<state>,<remaining>
//! ALERT,COMMFAIL,<node>,<attempts>
//! ALERT,FAULT,<node>,<reason>
//! ```

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::irrigation::{IrrigationConfig, IrrigationState};
use crate::sensor::SensorReading;
use crate::telemetry::Alert;

/// Reasons in ERR acks and FAULT alerts are cut to this many characters.
const MAX_REASON_CHARS: usize = 160;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Command type codes used on the gateway side.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandType {
    Valve = 1,
    Pump = 2,
    Sensor = 3,
    Config = 4,
    Reset = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpAction {
    Start(Option<u32>),
    Stop,
    Pause,
    Resume,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Valve { index: u8, on: bool },
    Pump(PumpAction),
    Config(IrrigationConfig),
    /// Restore and persist the stock config.
    ConfigDefaults,
    ReadSensors,
    Reset,
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Valve { .. } => CommandType::Valve,
            Command::Pump(_) => CommandType::Pump,
            Command::Config(_) | Command::ConfigDefaults => CommandType::Config,
            Command::ReadSensors => CommandType::Sensor,
            Command::Reset => CommandType::Reset,
        }
    }

    pub fn to_payload(&self) -> String {
        match self {
            Command::Valve { index, on } => {
                format!("CMD,VALVE,{index},{}", if *on { "ON" } else { "OFF" })
            }
            Command::Pump(PumpAction::Start(Some(secs))) => format!("CMD,PUMP,START,{secs}"),
            Command::Pump(PumpAction::Start(None)) => "CMD,PUMP,START".into(),
            Command::Pump(PumpAction::Stop) => "CMD,PUMP,STOP".into(),
            Command::Pump(PumpAction::Pause) => "CMD,PUMP,PAUSE".into(),
            Command::Pump(PumpAction::Resume) => "CMD,PUMP,RESUME".into(),
            Command::Config(c) => format!(
                "CMD,CONFIG,{},{},{},{}",
                c.soil_moisture_threshold,
                c.duration_secs,
                c.min_interval_secs,
                u8::from(c.auto_mode)
            ),
            Command::ConfigDefaults => "CMD,CONFIG,DEFAULTS".into(),
            Command::ReadSensors => "CMD,SENSOR,READ".into(),
            Command::Reset => "CMD,RESET".into(),
        }
    }

    /// Any failure is `Error::Command`; the caller answers with an ERR ack.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| Error::Command("payload is not text".into()))?;
        let mut fields = text.trim().split(',');
        if fields.next() != Some("CMD") {
            return Err(Error::Command(format!("not a command: {text:?}")));
        }
        let kind = next_field(&mut fields, "command type")?;

        let command = match kind.to_ascii_uppercase().as_str() {
            "VALVE" => {
                let index = number(next_field(&mut fields, "valve index")?, "valve index")?;
                let on = match next_field(&mut fields, "valve state")?.to_ascii_uppercase().as_str() {
                    "ON" => true,
                    "OFF" => false,
                    other => return Err(Error::Command(format!("valve state {other:?}"))),
                };
                Command::Valve { index, on }
            }
            "PUMP" => {
                let action = next_field(&mut fields, "pump action")?;
                match action.to_ascii_uppercase().as_str() {
                    "START" => {
                        let secs = fields
                            .next()
                            .map(|s| number::<u32>(s, "duration"))
                            .transpose()?;
                        Command::Pump(PumpAction::Start(secs))
                    }
                    "STOP" => Command::Pump(PumpAction::Stop),
                    "PAUSE" => Command::Pump(PumpAction::Pause),
                    "RESUME" => Command::Pump(PumpAction::Resume),
                    other => return Err(Error::Command(format!("unknown pump action {other:?}"))),
                }
            }
            "CONFIG" => match next_field(&mut fields, "threshold")? {
                d if d.eq_ignore_ascii_case("DEFAULTS") => Command::ConfigDefaults,
                threshold => Command::Config(config_fields(threshold, &mut fields)?),
            },
            "SENSOR" => match next_field(&mut fields, "sensor action")?.to_ascii_uppercase().as_str() {
                "READ" => Command::ReadSensors,
                other => return Err(Error::Command(format!("unknown sensor action {other:?}"))),
            },
            "RESET" => Command::Reset,
            other => return Err(Error::Command(format!("unknown command type {other:?}"))),
        };

        if let Some(extra) = fields.next() {
            return Err(Error::Command(format!("unexpected field {extra:?}")));
        }
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_payload())
    }
}

// ---------------------------------------------------------------------------
// Acknowledgements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Ok,
    Err(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Sequence number of the command being answered.
    pub sequence: u8,
    pub outcome: AckOutcome,
}

impl Ack {
    pub fn ok(sequence: u8) -> Self {
        Self {
            sequence,
            outcome: AckOutcome::Ok,
        }
    }

    pub fn err(sequence: u8, reason: impl fmt::Display) -> Self {
        Self {
            sequence,
            outcome: AckOutcome::Err(truncate(&reason.to_string())),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome == AckOutcome::Ok
    }

    pub fn to_payload(&self) -> String {
        match &self.outcome {
            AckOutcome::Ok => format!("ACK,{},OK", self.sequence),
            AckOutcome::Err(reason) => format!("ACK,{},ERR,{reason}", self.sequence),
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = as_text(payload)?;
        let mut fields = text.splitn(4, ',');
        expect_tag(&mut fields, "ACK")?;
        let sequence = number(next_field(&mut fields, "sequence")?, "sequence")
            .map_err(into_malformed)?;
        let outcome = match next_field(&mut fields, "outcome")? {
            "OK" => AckOutcome::Ok,
            "ERR" => AckOutcome::Err(fields.next().unwrap_or_default().to_string()),
            other => return Err(Error::Malformed(format!("ack outcome {other:?}"))),
        };
        Ok(Self { sequence, outcome })
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub uptime_secs: u64,
    pub state: IrrigationState,
    pub remaining_secs: u64,
}

impl Heartbeat {
    pub fn to_payload(&self) -> String {
        format!(
            "HB,{},{},{}",
            self.uptime_secs, self.state, self.remaining_secs
        )
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = as_text(payload)?;
        let mut fields = text.split(',');
        expect_tag(&mut fields, "HB")?;
        let uptime_secs = number(next_field(&mut fields, "uptime")?, "uptime").map_err(into_malformed)?;
        let state_field = next_field(&mut fields, "state")?;
        let state = IrrigationState::parse(state_field)
            .ok_or_else(|| Error::Malformed(format!("heartbeat state {state_field:?}")))?;
        let remaining_secs =
            number(next_field(&mut fields, "remaining")?, "remaining").map_err(into_malformed)?;
        Ok(Self {
            uptime_secs,
            state,
            remaining_secs,
        })
    }
}

// ---------------------------------------------------------------------------
// Sensor data
// ---------------------------------------------------------------------------

pub fn encode_reading(r: &SensorReading) -> String {
    format!(
        "DATA,{:.1},{:.1},{:.1},{:.1},{:.1},{:.1},{}",
        r.soil_moisture, r.temperature, r.humidity, r.water_level, r.light_level, r.battery, r.timestamp
    )
}

pub fn parse_reading(payload: &[u8]) -> Result<SensorReading> {
    let text = as_text(payload)?;
    let mut fields = text.split(',');
    expect_tag(&mut fields, "DATA")?;
    let mut value = |name: &str| -> Result<f32> {
        number(next_field(&mut fields, name)?, name).map_err(into_malformed)
    };
    let soil_moisture = value("soil moisture")?;
    let temperature = value("temperature")?;
    let humidity = value("humidity")?;
    let water_level = value("water level")?;
    let light_level = value("light level")?;
    let battery = value("battery")?;
    let timestamp = number(next_field(&mut fields, "timestamp")?, "timestamp").map_err(into_malformed)?;
    if fields.next().is_some() {
        return Err(Error::Malformed("trailing fields after timestamp".into()));
    }
    Ok(SensorReading {
        soil_moisture,
        temperature,
        humidity,
        water_level,
        light_level,
        battery,
        timestamp,
    })
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

pub fn encode_alert(alert: &Alert) -> String {
    match alert {
        Alert::CommFail { node_id, attempts } => format!("ALERT,COMMFAIL,{node_id},{attempts}"),
        Alert::Fault { node_id, reason } => {
            format!("ALERT,FAULT,{node_id},{}", truncate(reason))
        }
    }
}

pub fn parse_alert(payload: &[u8]) -> Result<Alert> {
    let text = as_text(payload)?;
    let mut fields = text.splitn(4, ',');
    expect_tag(&mut fields, "ALERT")?;
    let code = next_field(&mut fields, "alert code")?;
    let node_id = number(next_field(&mut fields, "node")?, "node").map_err(into_malformed)?;
    match code {
        "COMMFAIL" => {
            let attempts =
                number(next_field(&mut fields, "attempts")?, "attempts").map_err(into_malformed)?;
            Ok(Alert::CommFail { node_id, attempts })
        }
        "FAULT" => Ok(Alert::Fault {
            node_id,
            reason: fields.next().unwrap_or_default().to_string(),
        }),
        other => Err(Error::Malformed(format!("unknown alert code {other:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// `<threshold>,<duration>,<min_interval>,<0|1>` after the command type.
fn config_fields<'a>(
    threshold: &str,
    fields: &mut impl Iterator<Item = &'a str>,
) -> Result<IrrigationConfig> {
    let soil_moisture_threshold = number(threshold, "threshold")?;
    let duration_secs = number(next_field(fields, "duration")?, "duration")?;
    let min_interval_secs = number(next_field(fields, "min interval")?, "min interval")?;
    let auto_mode = match next_field(fields, "auto mode")? {
        "1" => true,
        "0" => false,
        other => return Err(Error::Command(format!("auto mode {other:?}"))),
    };
    Ok(IrrigationConfig {
        soil_moisture_threshold,
        duration_secs,
        min_interval_secs,
        auto_mode,
    })
}

fn as_text(payload: &[u8]) -> Result<&str> {
    std::str::from_utf8(payload).map_err(|_| Error::Malformed("payload is not text".into()))
}

fn expect_tag<'a>(fields: &mut impl Iterator<Item = &'a str>, tag: &str) -> Result<()> {
    match fields.next() {
        Some(t) if t == tag => Ok(()),
        other => Err(Error::Malformed(format!(
            "expected {tag} message, got {:?}",
            other.unwrap_or_default()
        ))),
    }
}

fn next_field<'a>(fields: &mut impl Iterator<Item = &'a str>, name: &str) -> Result<&'a str> {
    match fields.next() {
        Some(f) if !f.is_empty() => Ok(f),
        _ => Err(Error::Command(format!("missing {name}"))),
    }
}

fn number<T: FromStr>(field: &str, name: &str) -> Result<T> {
    field
        .trim()
        .parse()
        .map_err(|_| Error::Command(format!("{name} {field:?} is not a number")))
}

fn into_malformed(e: Error) -> Error {
    match e {
        Error::Command(msg) => Error::Malformed(msg),
        other => other,
    }
}

fn truncate(reason: &str) -> String {
    reason.chars().take(MAX_REASON_CHARS).collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MAX_PAYLOAD;

    // -- Commands -----------------------------------------------------------

    #[test]
    fn parses_every_command() {
        let cases: &[(&str, Command)] = &[
            ("CMD,VALVE,0,ON", Command::Valve { index: 0, on: true }),
            ("CMD,VALVE,2,off", Command::Valve { index: 2, on: false }),
            ("CMD,PUMP,START", Command::Pump(PumpAction::Start(None))),
            ("CMD,PUMP,START,90", Command::Pump(PumpAction::Start(Some(90)))),
            ("CMD,PUMP,STOP", Command::Pump(PumpAction::Stop)),
            ("CMD,PUMP,PAUSE", Command::Pump(PumpAction::Pause)),
            ("CMD,PUMP,RESUME", Command::Pump(PumpAction::Resume)),
            ("CMD,SENSOR,READ", Command::ReadSensors),
            ("CMD,RESET", Command::Reset),
            ("CMD,CONFIG,DEFAULTS", Command::ConfigDefaults),
            ("CMD,CONFIG,defaults", Command::ConfigDefaults),
            (
                "CMD,CONFIG,35.5,300,1800,0",
                Command::Config(IrrigationConfig {
                    soil_moisture_threshold: 35.5,
                    duration_secs: 300,
                    min_interval_secs: 1800,
                    auto_mode: false,
                }),
            ),
        ];
        for (text, expected) in cases {
            assert_eq!(&Command::parse(text.as_bytes()).unwrap(), expected, "{text}");
        }
    }

    #[test]
    fn payload_text_parses_back() {
        let commands = [
            Command::Valve { index: 0, on: true },
            Command::Pump(PumpAction::Start(Some(120))),
            Command::Config(IrrigationConfig::default()),
            Command::ConfigDefaults,
            Command::Reset,
        ];
        for c in commands {
            assert_eq!(Command::parse(c.to_payload().as_bytes()).unwrap(), c);
        }
    }

    #[test]
    fn bad_commands_are_command_errors() {
        for text in [
            "",
            "CMD",
            "HELLO,VALVE,0,ON",
            "CMD,WATER",
            "CMD,VALVE,0",
            "CMD,VALVE,x,ON",
            "CMD,VALVE,0,MAYBE",
            "CMD,PUMP",
            "CMD,PUMP,FAST",
            "CMD,PUMP,START,-5",
            "CMD,CONFIG,30,600",
            "CMD,CONFIG,30,600,3600,yes",
            "CMD,CONFIG,DEFAULTS,NOW",
            "CMD,SENSOR,WRITE",
            "CMD,RESET,NOW",
        ] {
            assert!(
                matches!(Command::parse(text.as_bytes()), Err(Error::Command(_))),
                "{text}"
            );
        }
        assert!(matches!(
            Command::parse(&[0xFF, 0xFE]),
            Err(Error::Command(_))
        ));
    }

    #[test]
    fn command_type_codes() {
        assert_eq!(Command::Reset.command_type() as u8, 5);
        assert_eq!(Command::ReadSensors.command_type() as u8, 3);
        assert_eq!(Command::ConfigDefaults.command_type(), CommandType::Config);
        assert_eq!(
            Command::Valve { index: 0, on: true }.command_type() as u8,
            1
        );
    }

    // -- Acks ---------------------------------------------------------------

    #[test]
    fn ack_payloads() {
        assert_eq!(Ack::ok(7).to_payload(), "ACK,7,OK");
        let err = Ack::err(9, "cannot pause while IDLE, try later");
        assert_eq!(err.to_payload(), "ACK,9,ERR,cannot pause while IDLE, try later");
        assert_eq!(Ack::parse(err.to_payload().as_bytes()).unwrap(), err);
        assert!(Ack::parse(b"ACK,7,OK").unwrap().is_ok());
        assert!(matches!(Ack::parse(b"ACK,x,OK"), Err(Error::Malformed(_))));
        assert!(matches!(Ack::parse(b"ACK,1,MAYBE"), Err(Error::Malformed(_))));
    }

    #[test]
    fn long_reasons_fit_in_one_frame() {
        let ack = Ack::err(1, "x".repeat(1000));
        assert!(ack.to_payload().len() <= MAX_PAYLOAD);
    }

    // -- Heartbeat ----------------------------------------------------------

    #[test]
    fn heartbeat_payload() {
        let hb = Heartbeat {
            uptime_secs: 3600,
            state: IrrigationState::Watering,
            remaining_secs: 42,
        };
        assert_eq!(hb.to_payload(), "HB,3600,WATERING,42");
        assert_eq!(Heartbeat::parse(hb.to_payload().as_bytes()).unwrap(), hb);
        assert!(Heartbeat::parse(b"HB,1,SLEEPING,0").is_err());
        assert!(Heartbeat::parse(b"DATA,1,IDLE,0").is_err());
    }

    // -- Readings -----------------------------------------------------------

    #[test]
    fn reading_payload_uses_one_decimal() {
        let r = SensorReading {
            soil_moisture: 27.34,
            temperature: 21.5,
            humidity: 60.0,
            water_level: 80.0,
            light_level: 12.5,
            battery: 3.5,
            timestamp: 1_700_000_000,
        };
        let text = encode_reading(&r);
        assert!(text.starts_with("DATA,27.3,21.5,60.0,80.0,12.5,3.5,1700000000"), "{text}");
        let back = parse_reading(text.as_bytes()).unwrap();
        assert_eq!(back.temperature, 21.5);
        assert_eq!(back.timestamp, 1_700_000_000);
    }

    #[test]
    fn bad_readings_are_malformed() {
        assert!(matches!(parse_reading(b"DATA,1,2,3"), Err(Error::Malformed(_))));
        assert!(matches!(
            parse_reading(b"DATA,1,2,3,4,5,6,7,8"),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(
            parse_reading(b"DATA,a,2,3,4,5,6,7"),
            Err(Error::Malformed(_))
        ));
    }

    // -- Alerts -------------------------------------------------------------

    #[test]
    fn alert_payloads() {
        let comm = Alert::CommFail {
            node_id: 4,
            attempts: 3,
        };
        assert_eq!(encode_alert(&comm), "ALERT,COMMFAIL,4,3");
        assert_eq!(parse_alert(encode_alert(&comm).as_bytes()).unwrap(), comm);

        let fault = Alert::Fault {
            node_id: 2,
            reason: "relay stuck, pump off".into(),
        };
        assert_eq!(parse_alert(encode_alert(&fault).as_bytes()).unwrap(), fault);
        assert!(parse_alert(b"ALERT,FLOOD,2").is_err());
    }
}
