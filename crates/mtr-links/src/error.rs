//! ---
//! mtr_section: "04-hardware-links"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Hardware link capabilities consumed by the hub."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use mtr_common::{Classify, ErrorKind};
use thiserror::Error;

/// Failures reported by motor, serial and GPIO capabilities.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// The capability is not present on this host.
    #[error("{0} unavailable")]
    Unavailable(&'static str),
    /// Opening or handshaking the link failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// A single operation on an open link failed.
    #[error("transaction failed: {0}")]
    Transaction(String),
}

impl Classify for LinkError {
    fn kind(&self) -> ErrorKind {
        match self {
            LinkError::Unavailable(_) => ErrorKind::LinkUnavailable,
            LinkError::Connect(_) => ErrorKind::ConnectFailure,
            LinkError::Transaction(_) => ErrorKind::TransactionFailure,
        }
    }
}

/// Failures of a single I2C transaction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum I2cError {
    /// The addressed device did not acknowledge.
    #[error("no acknowledge from device 0x{address:02X} at offset 0x{offset:02X}")]
    Nack {
        /// 7-bit device address.
        address: u8,
        /// Register offset being accessed.
        offset: u8,
    },
    /// Arbitration loss, bus fault, or driver error.
    #[error("bus error: {0}")]
    Bus(String),
    /// The device returned fewer bytes than requested.
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead {
        /// Bytes requested.
        expected: usize,
        /// Bytes delivered.
        got: usize,
    },
}

impl I2cError {
    /// Stable label used in client responses and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            I2cError::Nack { .. } => "nack",
            I2cError::Bus(_) => "bus",
            I2cError::ShortRead { .. } => "short_read",
        }
    }
}

impl Classify for I2cError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::TransactionFailure
    }
}
