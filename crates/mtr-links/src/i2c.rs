//! ---
//! mtr_section: "04-hardware-links"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Hardware link capabilities consumed by the hub."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use crate::I2cError;

/// Register-oriented access to an I2C bus.
///
/// `address` is the 7-bit device address and `offset` the register within it.
/// Exclusive access is expressed through `&mut self`; the owner is expected to
/// keep the bus behind a single lock.
pub trait I2cBus: Send {
    /// Read one byte.
    fn read_byte(&mut self, address: u8, offset: u8) -> Result<u8, I2cError>;

    /// Read `len` consecutive bytes starting at `offset`.
    fn read_block(&mut self, address: u8, offset: u8, len: usize) -> Result<Vec<u8>, I2cError>;

    /// Write one byte.
    fn write_byte(&mut self, address: u8, offset: u8, value: u8) -> Result<(), I2cError>;

    /// Write consecutive bytes starting at `offset`.
    fn write_block(&mut self, address: u8, offset: u8, data: &[u8]) -> Result<(), I2cError>;
}
