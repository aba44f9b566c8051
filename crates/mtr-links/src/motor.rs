//! ---
//! mtr_section: "04-hardware-links"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Hardware link capabilities consumed by the hub."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::LinkError;

/// Serial settings used to open the motor link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParams {
    /// Device path, or `auto` to let the driver search for the port.
    pub port: String,
    /// Line speed in baud.
    pub baudrate: u32,
    /// Parity name understood by the driver (`none`, `even`, `odd`).
    pub parity: String,
    /// Data bits per character.
    pub databits: u8,
    /// Stop bits per character.
    pub stopbits: u8,
}

impl SerialParams {
    /// The parameters the hub uses for automatic (re)connection.
    pub fn auto() -> Self {
        Self {
            port: "auto".to_owned(),
            baudrate: 19_200,
            parity: "none".to_owned(),
            databits: 8,
            stopbits: 1,
        }
    }
}

/// Latest values published by the motor's own polling loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorReadings {
    /// Current position.
    pub position: f64,
    /// Measured force.
    pub force: f64,
    /// Auxiliary sensor value.
    pub sensor: f64,
    /// Last commanded set-point.
    pub set_pos: f64,
}

/// Capability exposed by the motor controller.
///
/// Implementations run their own polling thread; every call here is expected
/// to return within the device's bounded timing.
pub trait MotorDriver: Send {
    /// Open the link. The returned text is forwarded to the client verbatim.
    fn connect(&mut self, params: &SerialParams) -> Result<String, LinkError>;

    /// Close the link.
    fn disconnect(&mut self) -> Result<String, LinkError>;

    /// Command a move to `position` using the driver-specific `mode`.
    fn move_to(&mut self, position: i64, mode: &str) -> Result<String, LinkError>;

    /// Whether the driver currently holds a live link.
    fn is_connected(&self) -> bool;

    /// Most recent readings from the polling loop.
    fn readings(&self) -> MotorReadings;
}
