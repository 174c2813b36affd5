//! Irrigation state machine for one pump + valve pair.
//!
//! ```text
//!            check_conditions (dry) / start_manual
//!   Idle ───────────────────────────────────────────▶ Watering
//!    ▲  ◀── stop / tick (deadline) / moisture recovered ──┘ │ ▲
//!    │                                              pause │ │ resume
//!    │  ◀──────────────────── stop ───────────────── Paused ◀┘ │
//!    │                                                         │
//!    └── reset ── Error ◀── fault / actuator failure (any state)
//! ```
//!
//! Time is passed in explicitly as a monotonic [`Instant`], so the machine
//! itself never sleeps or reads the clock. The owning task drives
//! [`IrrigationController::tick`] at [`IrrigationController::deadline`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::sensor::SensorReading;

/// Watering stops automatically once moisture rises this far above the
/// threshold.
pub const HYSTERESIS_PCT: f32 = 10.0;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrrigationConfig {
    /// Start watering below this soil moisture (%).
    pub soil_moisture_threshold: f32,
    /// Length of one watering cycle, and the safety cutoff.
    pub duration_secs: i64,
    /// Minimum rest between the end of one cycle and an automatic start.
    pub min_interval_secs: i64,
    pub auto_mode: bool,
}

impl Default for IrrigationConfig {
    fn default() -> Self {
        Self {
            soil_moisture_threshold: 30.0,
            duration_secs: 600,
            min_interval_secs: 3600,
            auto_mode: true,
        }
    }
}

impl IrrigationConfig {
    /// Report every out-of-range field at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let t = self.soil_moisture_threshold;
        if !t.is_finite() || !(0.0..=100.0).contains(&t) {
            errors.push(format!("soil_moisture_threshold must be within 0..=100, got {t}"));
        }
        if self.duration_secs <= 0 {
            errors.push(format!(
                "duration_secs must be > 0, got {}",
                self.duration_secs
            ));
        }
        if self.min_interval_secs < 0 {
            errors.push(format!(
                "min_interval_secs must be >= 0, got {}",
                self.min_interval_secs
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "{} error{}: {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("; ")
            )))
        }
    }

    fn duration(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.duration_secs).unwrap_or(0))
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.min_interval_secs).unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IrrigationState {
    Idle,
    Watering,
    Paused,
    Error,
}

impl IrrigationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Watering => "WATERING",
            Self::Paused => "PAUSED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IDLE" => Some(Self::Idle),
            "WATERING" => Some(Self::Watering),
            "PAUSED" => Some(Self::Paused),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for IrrigationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    Command,
    SafetyTimer,
    MoistureRecovered,
    /// Resumed with nothing left to water.
    Completed,
}

/// What an operation did. `None` means the request was accepted but had
/// nothing to do in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Started { duration_secs: u64 },
    Stopped(StopCause),
    Paused { remaining_secs: u64 },
    Resumed { remaining_secs: u64 },
    Faulted,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: IrrigationState,
    pub remaining_secs: u64,
    pub cycle_count: u64,
    pub total_watering_secs: u64,
    pub fault: Option<String>,
    pub config: IrrigationConfig,
}

// ---------------------------------------------------------------------------
// Actuator collaborator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ActuatorFault(pub String);

pub trait Actuator: Send {
    fn set_pump(&mut self, on: bool) -> std::result::Result<(), ActuatorFault>;
    fn set_valve(&mut self, on: bool) -> std::result::Result<(), ActuatorFault>;
    /// Status indicator (LED, display); failures here never fault the
    /// controller.
    fn indicate(&mut self, state: IrrigationState) -> std::result::Result<(), ActuatorFault>;
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct IrrigationController<A: Actuator> {
    config: IrrigationConfig,
    actuator: A,
    state: IrrigationState,
    start_time: Option<Instant>,
    /// Start of the current powered segment; pauses are not watering time.
    run_since: Option<Instant>,
    /// Safety cutoff. Armed whenever the pump is on.
    deadline: Option<Instant>,
    last_stop: Option<Instant>,
    /// Preserved across a pause.
    remaining_secs: u64,
    cycle_count: u64,
    total_watering: Duration,
    fault: Option<String>,
}

impl<A: Actuator> IrrigationController<A> {
    /// Starts Idle with the outputs driven OFF. If that fails the
    /// controller starts in Error.
    pub fn new(config: IrrigationConfig, actuator: A) -> Self {
        let mut ctl = Self {
            config,
            actuator,
            state: IrrigationState::Idle,
            start_time: None,
            run_since: None,
            deadline: None,
            last_stop: None,
            remaining_secs: 0,
            cycle_count: 0,
            total_watering: Duration::ZERO,
            fault: None,
        };
        if let Err(fault) = ctl.switch_outputs(false) {
            ctl.enter_fault(format!("outputs could not be driven off: {fault}"), None);
        } else {
            ctl.indicate();
        }
        ctl
    }

    // -- Queries ------------------------------------------------------------

    pub fn state(&self) -> IrrigationState {
        self.state
    }

    pub fn config(&self) -> &IrrigationConfig {
        &self.config
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    pub fn last_stop(&self) -> Option<Instant> {
        self.last_stop
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn remaining_secs(&self, now: Instant) -> u64 {
        match self.state {
            IrrigationState::Watering => self
                .deadline
                .map(|d| ceil_secs(d.saturating_duration_since(now)))
                .unwrap_or(0),
            IrrigationState::Paused => self.remaining_secs,
            IrrigationState::Idle | IrrigationState::Error => 0,
        }
    }

    pub fn snapshot(&self, now: Instant) -> StatusSnapshot {
        let mut total = self.total_watering;
        if let Some(since) = self.run_since {
            total += now.saturating_duration_since(since);
        }
        StatusSnapshot {
            state: self.state,
            remaining_secs: self.remaining_secs(now),
            cycle_count: self.cycle_count,
            total_watering_secs: total.as_secs(),
            fault: self.fault.clone(),
            config: self.config.clone(),
        }
    }

    // -- Operations ---------------------------------------------------------

    /// Automatic start/stop from a fresh reading. Does nothing unless auto
    /// mode is on.
    pub fn check_conditions(&mut self, reading: &SensorReading, now: Instant) -> Result<Transition> {
        if !self.config.auto_mode {
            return Ok(Transition::None);
        }
        let moisture = reading.soil_moisture;
        let threshold = self.config.soil_moisture_threshold;

        match self.state {
            IrrigationState::Idle => {
                if moisture >= threshold {
                    return Ok(Transition::None);
                }
                if let Some(last) = self.last_stop {
                    let rested = now.saturating_duration_since(last);
                    if rested < self.config.min_interval() {
                        debug!(
                            moisture,
                            rested_secs = rested.as_secs(),
                            min_interval_secs = self.config.min_interval_secs,
                            "dry but within minimum interval"
                        );
                        return Ok(Transition::None);
                    }
                }
                info!(moisture, threshold, "soil dry, starting irrigation");
                self.begin_cycle(self.config.duration(), now)
            }
            IrrigationState::Watering => {
                if moisture > threshold + HYSTERESIS_PCT {
                    info!(moisture, threshold, "soil recovered, stopping irrigation");
                    self.finish_cycle(StopCause::MoistureRecovered, now)
                } else {
                    Ok(Transition::None)
                }
            }
            IrrigationState::Paused | IrrigationState::Error => Ok(Transition::None),
        }
    }

    /// Manual start with an optional override duration. Already watering is
    /// a no-op; a paused cycle is closed and a fresh one started.
    pub fn start_manual(&mut self, duration_secs: Option<u32>, now: Instant) -> Result<Transition> {
        match self.state {
            IrrigationState::Error => Err(Error::Command(
                "controller is in error state, reset required".into(),
            )),
            IrrigationState::Watering => {
                debug!("start ignored, already watering");
                Ok(Transition::None)
            }
            IrrigationState::Idle | IrrigationState::Paused => {
                if self.state == IrrigationState::Paused {
                    self.finish_cycle(StopCause::Command, now)?;
                }
                let run_for = match duration_secs {
                    Some(secs) if secs > 0 => Duration::from_secs(u64::from(secs)),
                    _ => self.config.duration(),
                };
                info!(duration_secs = run_for.as_secs(), "manual irrigation start");
                self.begin_cycle(run_for, now)
            }
        }
    }

    /// Idempotent: stopping while idle does nothing.
    pub fn stop(&mut self, now: Instant) -> Result<Transition> {
        self.finish_cycle(StopCause::Command, now)
    }

    pub fn pause(&mut self, now: Instant) -> Result<Transition> {
        if self.state != IrrigationState::Watering {
            return Err(Error::Command(format!(
                "cannot pause while {}",
                self.state
            )));
        }
        let remaining = self.remaining_secs(now);
        if let Err(fault) = self.de_energise(now) {
            return Err(self.enter_fault(fault.to_string(), Some(now)));
        }
        self.remaining_secs = remaining;
        self.set_state(IrrigationState::Paused);
        info!(remaining_secs = remaining, "irrigation paused");
        Ok(Transition::Paused {
            remaining_secs: remaining,
        })
    }

    pub fn resume(&mut self, now: Instant) -> Result<Transition> {
        if self.state != IrrigationState::Paused {
            return Err(Error::Command(format!(
                "cannot resume while {}",
                self.state
            )));
        }
        let remaining = self.remaining_secs;
        if remaining == 0 {
            return self.finish_cycle(StopCause::Completed, now);
        }
        self.energise(Duration::from_secs(remaining), now)?;
        info!(remaining_secs = remaining, "irrigation resumed");
        Ok(Transition::Resumed {
            remaining_secs: remaining,
        })
    }

    /// Safety timer. Stops a cycle whose deadline has passed.
    pub fn tick(&mut self, now: Instant) -> Result<Transition> {
        match (self.state, self.deadline) {
            (IrrigationState::Watering, Some(deadline)) if now >= deadline => {
                warn!("safety timer expired, stopping irrigation");
                self.finish_cycle(StopCause::SafetyTimer, now)
            }
            _ => Ok(Transition::None),
        }
    }

    pub fn fault(&mut self, reason: impl Into<String>, now: Instant) -> Transition {
        self.enter_fault(reason.into(), Some(now));
        Transition::Faulted
    }

    pub fn reset(&mut self, _now: Instant) -> Result<Transition> {
        if self.state != IrrigationState::Error {
            return Ok(Transition::None);
        }
        if let Err(fault) = self.switch_outputs(false) {
            error!(error = %fault, "reset failed, outputs still faulted");
            self.fault = Some(fault.to_string());
            return Err(Error::Actuator(fault.0));
        }
        self.fault = None;
        self.start_time = None;
        self.remaining_secs = 0;
        self.set_state(IrrigationState::Idle);
        info!("controller reset");
        Ok(Transition::Reset)
    }

    /// Takes effect from the next cycle; a running cycle keeps its deadline.
    pub fn set_config(&mut self, config: IrrigationConfig) -> Result<()> {
        config.validate()?;
        info!(
            threshold = config.soil_moisture_threshold,
            duration_secs = config.duration_secs,
            min_interval_secs = config.min_interval_secs,
            auto = config.auto_mode,
            "irrigation config updated"
        );
        self.config = config;
        Ok(())
    }

    // -- Internals ----------------------------------------------------------

    fn begin_cycle(&mut self, run_for: Duration, now: Instant) -> Result<Transition> {
        self.energise(run_for, now)?;
        self.start_time = Some(now);
        Ok(Transition::Started {
            duration_secs: run_for.as_secs(),
        })
    }

    /// The only path that turns the pump on. Arms the deadline first.
    fn energise(&mut self, run_for: Duration, now: Instant) -> Result<()> {
        if run_for.is_zero() {
            let err = Error::SafetyViolation("refusing to run with a zero safety timeout".into());
            error!(error = %err, "irrigation not started");
            return Err(err);
        }
        let Some(deadline) = now.checked_add(run_for) else {
            return Err(Error::SafetyViolation(format!(
                "safety timeout of {}s cannot be armed",
                run_for.as_secs()
            )));
        };
        self.deadline = Some(deadline);
        if let Err(fault) = self.switch_outputs(true) {
            return Err(self.enter_fault(fault.to_string(), Some(now)));
        }
        self.run_since = Some(now);
        self.remaining_secs = run_for.as_secs();
        self.set_state(IrrigationState::Watering);
        Ok(())
    }

    fn de_energise(&mut self, now: Instant) -> std::result::Result<(), ActuatorFault> {
        self.deadline = None;
        if let Some(since) = self.run_since.take() {
            self.total_watering += now.saturating_duration_since(since);
        }
        self.switch_outputs(false)
    }

    fn finish_cycle(&mut self, cause: StopCause, now: Instant) -> Result<Transition> {
        let was_running = match self.state {
            IrrigationState::Watering => true,
            IrrigationState::Paused => false,
            IrrigationState::Idle | IrrigationState::Error => return Ok(Transition::None),
        };
        let switched = if was_running {
            self.de_energise(now)
        } else {
            Ok(())
        };

        self.last_stop = Some(now);
        self.start_time = None;
        self.remaining_secs = 0;
        self.cycle_count += 1;

        if let Err(fault) = switched {
            return Err(self.enter_fault(fault.to_string(), Some(now)));
        }
        self.set_state(IrrigationState::Idle);
        info!(
            cause = ?cause,
            cycles = self.cycle_count,
            total_watering_secs = self.total_watering.as_secs(),
            "irrigation stopped"
        );
        Ok(Transition::Stopped(cause))
    }

    /// Valve opens before the pump starts, pump stops before the valve
    /// closes, so the pump never runs against a closed valve.
    fn switch_outputs(&mut self, on: bool) -> std::result::Result<(), ActuatorFault> {
        if on {
            self.actuator.set_valve(true)?;
            self.actuator.set_pump(true)
        } else {
            let pump = self.actuator.set_pump(false);
            let valve = self.actuator.set_valve(false);
            pump.and(valve)
        }
    }

    fn enter_fault(&mut self, reason: String, now: Option<Instant>) -> Error {
        self.deadline = None;
        if let (Some(since), Some(now)) = (self.run_since.take(), now) {
            self.total_watering += now.saturating_duration_since(since);
        }
        if let Err(e) = self.switch_outputs(false) {
            error!(error = %e, "could not drive outputs off while faulting");
        }
        error!(reason = %reason, "irrigation controller fault");
        self.fault = Some(reason.clone());
        self.set_state(IrrigationState::Error);
        Error::Actuator(reason)
    }

    fn set_state(&mut self, state: IrrigationState) {
        self.state = state;
        self.indicate();
    }

    fn indicate(&mut self) {
        if let Err(e) = self.actuator.indicate(self.state) {
            warn!(error = %e, "status indicator update failed");
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

// ---------------------------------------------------------------------------
// Recording actuator
// ---------------------------------------------------------------------------

/// In-memory actuator: remembers output levels and every indication, and
/// can be told to fail.
#[derive(Debug, Default, Clone)]
pub struct RecordingActuator {
    pub pump: bool,
    pub valve: bool,
    pub indications: Vec<IrrigationState>,
    pub fail_pump: bool,
    pub switch_count: u32,
}

impl Actuator for RecordingActuator {
    fn set_pump(&mut self, on: bool) -> std::result::Result<(), ActuatorFault> {
        if self.fail_pump {
            return Err(ActuatorFault("pump relay not responding".into()));
        }
        self.switch_count += 1;
        self.pump = on;
        Ok(())
    }

    fn set_valve(&mut self, on: bool) -> std::result::Result<(), ActuatorFault> {
        self.switch_count += 1;
        self.valve = on;
        Ok(())
    }

    fn indicate(&mut self, state: IrrigationState) -> std::result::Result<(), ActuatorFault> {
        self.indications.push(state);
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
