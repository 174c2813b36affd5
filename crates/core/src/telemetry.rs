//! Telemetry sink collaborator and operator alerts.

use serde::Serialize;
use std::fmt;

use crate::sensor::SensorReading;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "camelCase")]
pub enum Alert {
    /// A node gave up sending after its retry budget.
    #[serde(rename = "COMMFAIL", rename_all = "camelCase")]
    CommFail { node_id: u8, attempts: u32 },
    /// The pump/valve driver faulted and the controller is in Error.
    #[serde(rename = "FAULT", rename_all = "camelCase")]
    Fault { node_id: u8, reason: String },
}

impl Alert {
    pub fn code(&self) -> &'static str {
        match self {
            Alert::CommFail { .. } => "COMMFAIL",
            Alert::Fault { .. } => "FAULT",
        }
    }

    pub fn node_id(&self) -> u8 {
        match self {
            Alert::CommFail { node_id, .. } | Alert::Fault { node_id, .. } => *node_id,
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::CommFail { node_id, attempts } => {
                write!(f, "node {node_id}: send failed {attempts} times")
            }
            Alert::Fault { node_id, reason } => write!(f, "node {node_id}: fault: {reason}"),
        }
    }
}

/// Where readings and alerts go. Fire-and-forget: failures stay inside the
/// sink.
pub trait TelemetrySink: Send {
    fn publish(&mut self, node_id: u8, reading: &SensorReading);
    fn alert(&mut self, alert: &Alert);
}

/// Sink that keeps everything in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub readings: Vec<(u8, SensorReading)>,
    pub alerts: Vec<Alert>,
}

impl TelemetrySink for RecordingSink {
    fn publish(&mut self, node_id: u8, reading: &SensorReading) {
        self.readings.push((node_id, *reading));
    }

    fn alert(&mut self, alert: &Alert) {
        self.alerts.push(alert.clone());
    }
}
