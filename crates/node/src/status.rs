//! Local status panel: the node's telemetry sink. Readings and alerts go to
//! the log, and the latest of each is kept for the status line printed on
//! every heartbeat.

use std::collections::VecDeque;

use irrigation_core::sensor::SensorReading;
use irrigation_core::telemetry::{Alert, TelemetrySink};
use tracing::{info, warn};

const MAX_ALERTS: usize = 8;

#[derive(Debug, Default)]
pub struct StatusPanel {
    last: Option<SensorReading>,
    alerts: VecDeque<Alert>,
    readings: u64,
}

impl StatusPanel {
    pub fn last_reading(&self) -> Option<&SensorReading> {
        self.last.as_ref()
    }

    pub fn recent_alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter()
    }

    pub fn summary(&self) -> String {
        let mut line = match self.last_reading() {
            Some(r) => format!(
                "soil {:.1}% temp {:.1}C hum {:.0}% tank {:.0}% bat {:.2}V",
                r.soil_moisture, r.temperature, r.humidity, r.water_level, r.battery
            ),
            None => "no reading yet".to_string(),
        };
        line.push_str(&format!(" | {} sent", self.readings));
        if let Some(alert) = self.recent_alerts().last() {
            line.push_str(&format!(" | last alert: {alert}"));
        }
        line
    }
}

impl TelemetrySink for StatusPanel {
    fn publish(&mut self, node_id: u8, reading: &SensorReading) {
        info!(
            node = node_id,
            soil = reading.soil_moisture,
            temp = reading.temperature,
            hum = reading.humidity,
            tank = reading.water_level,
            bat = reading.battery,
            "reading"
        );
        self.last = Some(*reading);
        self.readings += 1;
    }

    fn alert(&mut self, alert: &Alert) {
        warn!(code = alert.code(), node = alert.node_id(), "{alert}");
        if self.alerts.len() == MAX_ALERTS {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert.clone());
    }
}
