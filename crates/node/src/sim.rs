//! Stateful field simulator for running a node without sensors attached.
//!
//! Soil moisture follows a mean-reverting random walk that slowly dries out
//! and climbs while the pump runs. Temperature, humidity and light follow a
//! day/night cycle. The tank drains while watering and refills slowly, the
//! battery sags a little with every sample, and the moisture probe
//! occasionally spikes the way cheap capacitive probes do.

use std::f64::consts::PI;
use std::fmt;
use std::sync::atomic::Ordering;

use irrigation_core::sensor::{Sensor, SensorReading};
use time::OffsetDateTime;

use crate::actuator::WateringFlag;

/// Moisture gained per sample while the pump runs (%).
const WET_RATE: f64 = 3.0;
const TANK_DRAW: f64 = 0.5;
const TANK_REFILL: f64 = 0.05;
const BATTERY_FULL: f64 = 4.1;
const BATTERY_FLOOR: f64 = 3.3;
const BATTERY_DRAIN: f64 = 0.0005;

// ---------------------------------------------------------------------------
// Noise
// ---------------------------------------------------------------------------

/// Irwin-Hall approximation of N(0,1): twelve uniforms minus six.
fn std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * std_normal()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Simulation profile, selected with `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mid-range start drifting toward dry. Crosses the default threshold
    /// after a while, so auto mode kicks in.
    Drying,
    /// Hovers around 50 %. Never triggers watering.
    Stable,
    /// Noisy with frequent spikes.
    Flaky,
    /// Starts near saturation and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }

    fn profile(self) -> Profile {
        match self {
            Self::Drying => Profile {
                start: 45.0,
                drift: 0.4,
                walk_sigma: 0.8,
                mean_reversion: 0.01,
                noise_sigma: 0.5,
                spike_prob: 0.03,
                spike_sigma: 10.0,
            },
            Self::Stable => Profile {
                start: 50.0,
                drift: 0.05,
                walk_sigma: 0.3,
                mean_reversion: 0.05,
                noise_sigma: 0.2,
                spike_prob: 0.005,
                spike_sigma: 5.0,
            },
            Self::Flaky => Profile {
                start: 45.0,
                drift: 0.3,
                walk_sigma: 1.5,
                mean_reversion: 0.02,
                noise_sigma: 1.5,
                spike_prob: 0.10,
                spike_sigma: 15.0,
            },
            Self::Wet => Profile {
                start: 75.0,
                drift: 0.1,
                walk_sigma: 0.4,
                mean_reversion: 0.02,
                noise_sigma: 0.3,
                spike_prob: 0.02,
                spike_sigma: 8.0,
            },
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Drying => "drying",
            Self::Stable => "stable",
            Self::Flaky => "flaky",
            Self::Wet => "wet",
        };
        f.write_str(name)
    }
}

/// Moisture dynamics, all in percentage points per sample.
#[derive(Debug, Clone, Copy)]
struct Profile {
    start: f64,
    drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    spike_prob: f32,
    spike_sigma: f64,
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct FieldSim {
    scenario: Scenario,
    profile: Profile,
    /// "True" soil moisture before probe noise.
    moisture: f64,
    water_level: f64,
    battery: f64,
    day_length_s: f64,
    watering: WateringFlag,
}

impl FieldSim {
    /// `day_length_s` is the length of one simulated day; 86400 for real
    /// time, something like 600 for quick local runs.
    pub fn new(scenario: Scenario, day_length_s: f64, watering: WateringFlag) -> Self {
        let profile = scenario.profile();
        Self {
            scenario,
            profile,
            moisture: profile.start,
            water_level: 80.0,
            battery: BATTERY_FULL,
            day_length_s: day_length_s.max(1.0),
            watering,
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    /// Advance one sample, stamping the reading with `ts` (unix seconds).
    pub fn sample_at(&mut self, ts: i64) -> SensorReading {
        let p = self.profile;
        let watering = self.watering.load(Ordering::Relaxed);

        let pull = p.mean_reversion * (p.start - self.moisture);
        let wet = if watering { WET_RATE } else { 0.0 };
        self.moisture =
            (self.moisture - p.drift + pull + gaussian(0.0, p.walk_sigma) + wet).clamp(0.0, 100.0);

        let spike = if fastrand::f32() < p.spike_prob {
            gaussian(0.0, p.spike_sigma)
        } else {
            0.0
        };
        let soil = self.moisture + gaussian(0.0, p.noise_sigma) + spike;

        self.water_level = if watering {
            self.water_level - TANK_DRAW
        } else {
            self.water_level + TANK_REFILL
        }
        .clamp(0.0, 100.0);
        self.battery = (self.battery - BATTERY_DRAIN).max(BATTERY_FLOOR);

        // +1 at mid-afternoon, -1 in the middle of the night.
        let sun = (2.0 * PI * ts as f64 / self.day_length_s).sin();

        SensorReading {
            soil_moisture: soil.clamp(0.0, 100.0) as f32,
            temperature: (18.0 + 8.0 * sun + gaussian(0.0, 0.3)) as f32,
            humidity: (65.0 - 15.0 * sun + gaussian(0.0, 1.0)).clamp(0.0, 100.0) as f32,
            water_level: self.water_level as f32,
            light_level: (100.0 * sun).clamp(0.0, 100.0) as f32,
            battery: self.battery as f32,
            timestamp: ts,
        }
    }
}

impl Sensor for FieldSim {
    fn read_all(&mut self) -> SensorReading {
        self.sample_at(OffsetDateTime::now_utc().unix_timestamp())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
