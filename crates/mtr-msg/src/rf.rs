//! ---
//! mtr_section: "02-messaging-data-model"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "RF codec and client message schema."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! Framing for the RF generator's serial protocol.
//!
//! ```text
//! [0x02][length][0x01][command][data ..][checksum][0x03]
//! ```
//!
//! `length` counts the six fixed bytes plus the payload and `checksum` is the
//! XOR of every byte from the start marker through the last payload byte.

use std::fmt;

use mtr_common::{Classify, ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Start-of-frame marker.
pub const START: u8 = 0x02;
/// End-of-frame marker.
pub const END: u8 = 0x03;
/// Device identifier carried by every frame.
pub const DEVICE_ID: u8 = 0x01;
/// Bytes in a frame besides the payload.
pub const OVERHEAD: usize = 6;

/// Status query.
pub const CMD_STATUS: u8 = 0x41;
/// Firmware version query.
pub const CMD_FIRMWARE: u8 = 0x42;
/// Output configuration.
pub const CMD_OUTPUT_SETUP: u8 = 0x43;
/// Single energy shot.
pub const CMD_SHOT: u8 = 0x44;

const SETUP_PAYLOAD: [u8; 3] = [0x01, 0x00, 0x01];
const SHOT_PAYLOAD_LEN: usize = 9;
const MAX_PAYLOAD: usize = u8::MAX as usize - OVERHEAD;

/// Structural problems found while building or decoding a frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the smallest valid frame.
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    /// First byte is not [`START`].
    #[error("bad start marker 0x{0:02X}")]
    BadStart(u8),
    /// Last byte is not [`END`].
    #[error("bad end marker 0x{0:02X}")]
    BadEnd(u8),
    /// Length byte disagrees with the bytes received.
    #[error("length byte says {declared}, frame has {actual} bytes")]
    LengthMismatch {
        /// Value of the length byte.
        declared: u8,
        /// Bytes actually present.
        actual: usize,
    },
    /// Device id byte is not [`DEVICE_ID`].
    #[error("unexpected device id 0x{0:02X}")]
    BadId(u8),
    /// XOR checksum mismatch.
    #[error("checksum mismatch: expected 0x{expected:02X}, found 0x{found:02X}")]
    Checksum {
        /// Checksum computed over the frame.
        expected: u8,
        /// Checksum byte received.
        found: u8,
    },
    /// Payload cannot be described by a one-byte length.
    #[error("payload of {0} bytes does not fit a frame")]
    PayloadTooLong(usize),
}

impl Classify for FrameError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::ProtocolError
    }
}

/// Shot parameters that cannot be encoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShotError {
    /// Level does not fit 16 bits.
    #[error("level {0} out of range")]
    LevelOutOfRange(u32),
    /// `on_time_ms * 10` does not fit 16 bits.
    #[error("on-time {0} ms out of range")]
    OnTimeOutOfRange(u32),
}

impl Classify for ShotError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::ProtocolError
    }
}

/// Which fixed query frame to send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RfQuery {
    /// Generator status.
    #[default]
    Status,
    /// Firmware version.
    Firmware,
}

impl RfQuery {
    /// Resolve a client selector. Anything unrecognised asks for status.
    pub fn from_selector(selector: &str) -> Self {
        match selector {
            "firmware" => RfQuery::Firmware,
            _ => RfQuery::Status,
        }
    }

    /// Selector name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RfQuery::Status => "status",
            RfQuery::Firmware => "firmware",
        }
    }
}

impl From<String> for RfQuery {
    fn from(value: String) -> Self {
        RfQuery::from_selector(&value)
    }
}

impl From<RfQuery> for String {
    fn from(value: RfQuery) -> Self {
        value.as_str().to_owned()
    }
}

/// Inputs of a shot command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotParams {
    /// Fire on the 1 MHz channel. Takes precedence over 2 MHz.
    pub use_1mhz: bool,
    /// Fire on the 2 MHz channel.
    pub use_2mhz: bool,
    /// Output level in percent.
    pub level: u32,
    /// Output duration in milliseconds.
    pub on_time_ms: u32,
}

impl ShotParams {
    /// A 1 MHz shot, the only mode the UI exposes.
    pub fn one_mhz(level: u32, on_time_ms: u32) -> Self {
        Self {
            use_1mhz: true,
            use_2mhz: false,
            level,
            on_time_ms,
        }
    }

    fn payload(&self) -> Result<[u8; SHOT_PAYLOAD_LEN], ShotError> {
        let mut payload = [0u8; SHOT_PAYLOAD_LEN];
        if !self.use_1mhz && !self.use_2mhz {
            return Ok(payload);
        }
        let level = u16::try_from(self.level).map_err(|_| ShotError::LevelOutOfRange(self.level))?;
        let time = self
            .on_time_ms
            .checked_mul(10)
            .and_then(|t| u16::try_from(t).ok())
            .ok_or(ShotError::OnTimeOutOfRange(self.on_time_ms))?;
        let (slot, flag) = if self.use_1mhz { (0, 0x00) } else { (4, 0x01) };
        payload[slot..slot + 2].copy_from_slice(&level.to_be_bytes());
        payload[slot + 2..slot + 4].copy_from_slice(&time.to_be_bytes());
        payload[8] = flag;
        Ok(payload)
    }
}

/// XOR of start, length, id, command and payload.
pub fn checksum(length: u8, command: u8, data: &[u8]) -> u8 {
    data.iter()
        .fold(START ^ length ^ DEVICE_ID ^ command, |acc, byte| acc ^ byte)
}

/// An encoded frame. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct RfFrame {
    bytes: Vec<u8>,
}

impl RfFrame {
    /// Frame `command` around `data`. An empty payload is sent as one zero byte.
    pub fn output(command: u8, data: &[u8]) -> Result<Self, FrameError> {
        let data: &[u8] = if data.is_empty() { &[0x00] } else { data };
        if data.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong(data.len()));
        }
        let length = (OVERHEAD + data.len()) as u8;
        let mut bytes = Vec::with_capacity(length as usize);
        bytes.extend_from_slice(&[START, length, DEVICE_ID, command]);
        bytes.extend_from_slice(data);
        bytes.push(checksum(length, command, data));
        bytes.push(END);
        Ok(Self { bytes })
    }

    fn fixed(command: u8, data: &[u8]) -> Self {
        // Payloads here are constants well below the length limit.
        let length = (OVERHEAD + data.len()) as u8;
        let mut bytes = vec![START, length, DEVICE_ID, command];
        bytes.extend_from_slice(data);
        bytes.push(checksum(length, command, data));
        bytes.push(END);
        Self { bytes }
    }

    /// `02 07 01 41 00 45 03`
    pub fn status() -> Self {
        Self::fixed(CMD_STATUS, &[0x00])
    }

    /// `02 07 01 42 00 46 03`
    pub fn firmware() -> Self {
        Self::fixed(CMD_FIRMWARE, &[0x00])
    }

    /// The query frame for `query`.
    pub fn query(query: RfQuery) -> Self {
        match query {
            RfQuery::Status => Self::status(),
            RfQuery::Firmware => Self::firmware(),
        }
    }

    /// Output configuration sent once after the port opens.
    pub fn output_setup() -> Self {
        Self::fixed(CMD_OUTPUT_SETUP, &SETUP_PAYLOAD)
    }

    /// Shot command with a nine byte payload.
    pub fn shot(params: &ShotParams) -> Result<Self, ShotError> {
        Ok(Self::fixed(CMD_SHOT, &params.payload()?))
    }

    /// Validate raw bytes received from the module.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < OVERHEAD + 1 {
            return Err(FrameError::TooShort(bytes.len()));
        }
        if bytes[0] != START {
            return Err(FrameError::BadStart(bytes[0]));
        }
        let last = bytes[bytes.len() - 1];
        if last != END {
            return Err(FrameError::BadEnd(last));
        }
        let declared = bytes[1];
        if declared as usize != bytes.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        if bytes[2] != DEVICE_ID {
            return Err(FrameError::BadId(bytes[2]));
        }
        let data = &bytes[4..bytes.len() - 2];
        let expected = checksum(declared, bytes[3], data);
        let found = bytes[bytes.len() - 2];
        if expected != found {
            return Err(FrameError::Checksum { expected, found });
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Command byte.
    pub fn command(&self) -> u8 {
        self.bytes[3]
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.bytes[4..self.bytes.len() - 2]
    }

    /// Length byte.
    pub fn length(&self) -> u8 {
        self.bytes[1]
    }

    /// Checksum byte.
    pub fn checksum(&self) -> u8 {
        self.bytes[self.bytes.len() - 2]
    }

    /// Encoded frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Upper-case hex of the encoded frame.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.bytes)
    }
}

impl fmt::Debug for RfFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RfFrame").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for RfFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
