//! ---
//! mtr_section: "04-hardware-links"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Hardware link capabilities consumed by the hub."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use crate::LinkError;

/// An opened byte-stream serial port.
pub trait SerialPort: Send {
    /// Write the whole buffer.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Return whatever bytes are buffered without waiting for more.
    fn read_available(&mut self) -> Result<Vec<u8>, LinkError>;

    /// Close the port. Further writes fail.
    fn close(&mut self);
}
