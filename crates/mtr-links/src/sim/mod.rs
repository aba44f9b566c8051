//! ---
//! mtr_section: "04-hardware-links"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "In-memory link simulators for tests and simulation mode."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! In-memory stand-ins for every link capability.
//!
//! Each simulator is a cheap `Clone` handle over shared state so a test can keep
//! one copy for inspection and fault injection while the hub owns another.

mod gpio;
mod i2c;
mod motor;
mod serial;

use std::sync::Arc;

pub use gpio::{SimGpioChip, SimInputPin, SimOutputPin};
pub use i2c::{I2cOp, SimI2cBus};
pub use motor::SimMotor;
pub use serial::SimSerialPort;

use crate::LinkSet;

/// A full set of simulators plus the handles needed to drive them.
#[derive(Clone)]
pub struct SimulatedLinks {
    /// Motor simulator.
    pub motor: SimMotor,
    /// RF serial simulator, echoing every frame back.
    pub rf: SimSerialPort,
    /// EEPROM bus simulator with devices at 0x50 and 0x51.
    pub i2c: SimI2cBus,
    /// GPIO simulator.
    pub gpio: Arc<SimGpioChip>,
}

impl SimulatedLinks {
    /// Simulators in their healthy default state.
    pub fn new() -> Self {
        Self {
            motor: SimMotor::new(),
            rf: SimSerialPort::echoing(),
            i2c: SimI2cBus::with_devices(&[0x50, 0x51]),
            gpio: Arc::new(SimGpioChip::new()),
        }
    }

    /// Build a [`LinkSet`] sharing state with these handles.
    pub fn link_set(&self) -> LinkSet {
        LinkSet {
            motor: Some(Box::new(self.motor.clone())),
            rf: Some(Box::new(self.rf.clone())),
            i2c: Some(Box::new(self.i2c.clone())),
            gpio: Some(self.gpio.clone()),
        }
    }
}

impl Default for SimulatedLinks {
    fn default() -> Self {
        Self::new()
    }
}
