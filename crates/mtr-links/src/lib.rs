//! ---
//! mtr_section: "04-hardware-links"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Hardware link capabilities consumed by the hub."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! Capability traits describing every physical link the hub talks to.
//!
//! The hub never speaks a wire protocol below these traits. Production
//! deployments register their own implementations through [`LinkSet`];
//! the [`sim`] module provides in-memory stand-ins used by the test suites
//! and by the daemon in simulation mode.
#![warn(missing_docs)]

pub mod error;
pub mod gpio;
pub mod i2c;
pub mod motor;
pub mod serial;
pub mod sim;

use std::sync::Arc;

pub use error::{I2cError, LinkError};
pub use gpio::{EdgeCallback, GpioChip, InputPin, Level, OutputPin};
pub use i2c::I2cBus;
pub use motor::{MotorDriver, MotorReadings, SerialParams};
pub use serial::SerialPort;

/// The set of links handed to the hub at startup. `None` marks a capability
/// that is absent on this host; the owning component then degrades to
/// reporting it as unavailable.
#[derive(Default)]
pub struct LinkSet {
    /// Positioning motor driver.
    pub motor: Option<Box<dyn MotorDriver>>,
    /// RF module serial port, already opened.
    pub rf: Option<Box<dyn SerialPort>>,
    /// I2C bus carrying the tip EEPROM.
    pub i2c: Option<Box<dyn I2cBus>>,
    /// GPIO controller for sensors, LEDs and the RF fire line.
    pub gpio: Option<Arc<dyn GpioChip>>,
}

impl LinkSet {
    /// A link set where every capability is missing.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Names of the capabilities present, for startup logging.
    pub fn present(&self) -> Vec<&'static str> {
        let mut present = Vec::new();
        if self.motor.is_some() {
            present.push("motor");
        }
        if self.rf.is_some() {
            present.push("rf");
        }
        if self.i2c.is_some() {
            present.push("i2c");
        }
        if self.gpio.is_some() {
            present.push("gpio");
        }
        present
    }
}

impl std::fmt::Debug for LinkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSet")
            .field("present", &self.present())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_set_reports_nothing_present() {
        assert!(LinkSet::unavailable().present().is_empty());
    }

    #[test]
    fn simulated_set_reports_every_link() {
        let links = sim::SimulatedLinks::new().link_set();
        assert_eq!(links.present(), vec!["motor", "rf", "i2c", "gpio"]);
    }
}
