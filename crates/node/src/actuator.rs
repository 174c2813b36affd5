//! Pump and valve relays. The `gpio` feature drives real relays through
//! rppal; without it a mock board keeps the state in memory and logs every
//! change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use irrigation_core::irrigation::{Actuator, ActuatorFault, IrrigationState};
#[cfg(not(feature = "gpio"))]
use tracing::debug;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Raised while the pump runs. The field simulator watches it.
pub type WateringFlag = Arc<AtomicBool>;

/// BCM pin numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPins {
    pub pump: u8,
    pub valve: u8,
    pub indicator: u8,
}

impl Default for RelayPins {
    fn default() -> Self {
        Self {
            pump: 17,
            valve: 16,
            indicator: 25,
        }
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Real relay board (Raspberry Pi)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pump: OutputPin,
    valve: OutputPin,
    indicator: OutputPin,
    active_low: bool,
    watering: WateringFlag,
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(pins: RelayPins, active_low: bool) -> anyhow::Result<Self> {
        let gpio = Gpio::new()?;
        let mut board = Self {
            pump: gpio.get(pins.pump)?.into_output(),
            valve: gpio.get(pins.valve)?.into_output(),
            indicator: gpio.get(pins.indicator)?.into_output(),
            active_low,
            watering: WateringFlag::default(),
        };
        // Fail-safe: everything off before the controller takes over.
        drive(&mut board.pump, false, active_low);
        drive(&mut board.valve, false, active_low);
        board.indicator.set_low();
        info!(pump = pins.pump, valve = pins.valve, active_low, "relay board ready");
        Ok(board)
    }

    pub fn watering_flag(&self) -> WateringFlag {
        Arc::clone(&self.watering)
    }
}

/// Active-low boards switch the relay on with a LOW level.
#[cfg(feature = "gpio")]
fn drive(pin: &mut OutputPin, on: bool, active_low: bool) {
    if on != active_low {
        pin.set_high();
    } else {
        pin.set_low();
    }
}

#[cfg(feature = "gpio")]
impl Actuator for RelayBoard {
    fn set_pump(&mut self, on: bool) -> Result<(), ActuatorFault> {
        drive(&mut self.pump, on, self.active_low);
        self.watering.store(on, Ordering::Relaxed);
        info!("pump {}", on_off(on));
        Ok(())
    }

    fn set_valve(&mut self, on: bool) -> Result<(), ActuatorFault> {
        drive(&mut self.valve, on, self.active_low);
        info!("valve {}", on_off(on));
        Ok(())
    }

    fn indicate(&mut self, state: IrrigationState) -> Result<(), ActuatorFault> {
        // Status LED is wired directly, never through the relay board.
        if state == IrrigationState::Watering {
            self.indicator.set_high();
        } else {
            self.indicator.set_low();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development, no hardware)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    pub(crate) pump: bool,
    pub(crate) valve: bool,
    pub(crate) indicator: IrrigationState,
    watering: WateringFlag,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(pins: RelayPins, active_low: bool) -> anyhow::Result<Self> {
        info!(
            pump = pins.pump,
            valve = pins.valve,
            active_low,
            "[mock-gpio] relay board initialised (no hardware)"
        );
        Ok(Self {
            pump: false,
            valve: false,
            indicator: IrrigationState::Idle,
            watering: WateringFlag::default(),
        })
    }

    pub fn watering_flag(&self) -> WateringFlag {
        Arc::clone(&self.watering)
    }
}

#[cfg(not(feature = "gpio"))]
impl Actuator for RelayBoard {
    fn set_pump(&mut self, on: bool) -> Result<(), ActuatorFault> {
        self.pump = on;
        self.watering.store(on, Ordering::Relaxed);
        info!(valve = on_off(self.valve), "[mock-gpio] pump {}", on_off(on));
        Ok(())
    }

    fn set_valve(&mut self, on: bool) -> Result<(), ActuatorFault> {
        self.valve = on;
        info!(pump = on_off(self.pump), "[mock-gpio] valve {}", on_off(on));
        Ok(())
    }

    fn indicate(&mut self, state: IrrigationState) -> Result<(), ActuatorFault> {
        if self.indicator != state {
            debug!(from = %self.indicator, to = %state, "[mock-gpio] indicator");
        }
        self.indicator = state;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    fn board() -> RelayBoard {
        RelayBoard::new(RelayPins::default(), true).unwrap()
    }

    #[test]
    fn starts_all_off() {
        let b = board();
        assert!(!b.pump);
        assert!(!b.valve);
        assert!(!b.watering_flag().load(Ordering::Relaxed));
    }

    #[test]
    fn pump_drives_watering_flag() {
        let mut b = board();
        let flag = b.watering_flag();
        b.set_pump(true).unwrap();
        assert!(b.pump);
        assert!(flag.load(Ordering::Relaxed));
        b.set_pump(false).unwrap();
        assert!(!flag.load(Ordering::Relaxed));
    }

    #[test]
    fn valve_is_independent_of_pump() {
        let mut b = board();
        b.set_valve(true).unwrap();
        assert!(b.valve);
        assert!(!b.pump);
    }

    #[test]
    fn indicator_tracks_state() {
        let mut b = board();
        b.indicate(IrrigationState::Watering).unwrap();
        assert_eq!(b.indicator, IrrigationState::Watering);
    }

    #[test]
    fn controller_drives_the_board() {
        use irrigation_core::irrigation::{IrrigationConfig, IrrigationController};
        use tokio::time::Instant;

        let mut ctl = IrrigationController::new(IrrigationConfig::default(), board());
        ctl.start_manual(Some(30), Instant::now()).unwrap();
        assert!(ctl.actuator().pump);
        assert!(ctl.actuator().valve);
        ctl.stop(Instant::now()).unwrap();
        assert!(!ctl.actuator().pump);
        assert!(!ctl.actuator().valve);
    }

    #[test]
    fn default_pins() {
        let pins = RelayPins::default();
        assert_eq!((pins.pump, pins.valve, pins.indicator), (17, 16, 25));
    }
}
