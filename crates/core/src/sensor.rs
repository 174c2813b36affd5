//! Sensor readings and the sensing collaborator.

use serde::{Deserialize, Serialize};

/// One snapshot of every field sensor. Moisture, humidity, water and light
/// levels are percentages, temperature is °C, battery is volts and
/// `timestamp` is unix seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub soil_moisture: f32,
    pub temperature: f32,
    pub humidity: f32,
    pub water_level: f32,
    pub light_level: f32,
    pub battery: f32,
    pub timestamp: i64,
}

pub trait Sensor: Send {
    fn read_all(&mut self) -> SensorReading;
}

/// Replays a fixed list of readings, repeating the last one.
#[derive(Debug, Clone)]
pub struct ScriptedSensor {
    readings: Vec<SensorReading>,
    next: usize,
}

impl ScriptedSensor {
    pub fn new(readings: Vec<SensorReading>) -> Self {
        Self { readings, next: 0 }
    }
}

impl Sensor for ScriptedSensor {
    fn read_all(&mut self) -> SensorReading {
        let Some(last) = self.readings.len().checked_sub(1) else {
            return SensorReading::default();
        };
        let reading = self.readings[self.next.min(last)];
        self.next += 1;
        reading
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_sensor_repeats_last_reading() {
        let dry = SensorReading {
            soil_moisture: 20.0,
            ..SensorReading::default()
        };
        let wet = SensorReading {
            soil_moisture: 60.0,
            ..SensorReading::default()
        };
        let mut s = ScriptedSensor::new(vec![dry, wet]);
        assert_eq!(s.read_all(), dry);
        assert_eq!(s.read_all(), wet);
        assert_eq!(s.read_all(), wet);
    }

    #[test]
    fn empty_script_reads_default() {
        let mut s = ScriptedSensor::new(Vec::new());
        assert_eq!(s.read_all(), SensorReading::default());
    }
}
