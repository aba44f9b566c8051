//! ---
//! mtr_section: "02-messaging-data-model"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "RF codec and client message schema."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! Client command envelopes: one JSON object per message, routed by `cmd`.

use mtr_common::{Classify, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::rf::RfQuery;

/// Every `cmd` value the hub understands.
pub const KNOWN_COMMANDS: &[&str] = &[
    "connect",
    "disconnect",
    "move",
    "eeprom_read",
    "eeprom_write",
    "shot_increment",
    "rf_shot",
    "rf_dtr_high",
    "rf_query",
    "get_gpio17_status",
];

/// Highest intensity accepted by `rf_shot`, in percent.
pub const MAX_INTENSITY: u32 = 100;

/// Why an inbound message could not be turned into a [`Command`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not valid JSON.
    #[error("malformed JSON: {0}")]
    Malformed(String),
    /// Valid JSON without a string `cmd` field.
    #[error("missing cmd field")]
    MissingCmd,
    /// `cmd` names no known command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// Known command with unusable parameters.
    #[error("invalid parameters for {cmd}: {reason}")]
    InvalidParams {
        /// Command name.
        cmd: String,
        /// Decoder message.
        reason: String,
    },
}

impl Classify for ProtocolError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::ProtocolError
    }
}

fn default_port() -> String {
    "auto".to_owned()
}
fn default_baudrate() -> u32 {
    19_200
}
fn default_parity() -> String {
    "none".to_owned()
}
fn default_databits() -> u8 {
    8
}
fn default_stopbits() -> u8 {
    1
}
fn default_mode() -> String {
    "position".to_owned()
}
fn default_mtr_version() -> String {
    "2.0".to_owned()
}
fn default_intensity() -> u32 {
    50
}
fn default_rf_time() -> u32 {
    60
}

/// Serial settings supplied with `connect`. Omitted fields fall back to the
/// automatic connection defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Device path or `auto`.
    #[serde(default = "default_port")]
    pub port: String,
    /// Line speed.
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Parity name.
    #[serde(default = "default_parity")]
    pub parity: String,
    /// Data bits.
    #[serde(default = "default_databits")]
    pub databits: u8,
    /// Stop bits.
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
}

/// Chooses an EEPROM layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSelector {
    /// Device family, `2.0` or `4.0`.
    #[serde(rename = "mtrVersion", default = "default_mtr_version")]
    pub mtr_version: String,
    /// Distribution region for family 2.0.
    #[serde(default)]
    pub country: Option<String>,
}

/// Fields written by `eeprom_write`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EepromWriteRequest {
    /// Layout to write.
    #[serde(flatten)]
    pub layout: LayoutSelector,
    /// Tip type code.
    pub tip_type: u8,
    /// Shots fired so far.
    #[serde(default)]
    pub shot_count: u16,
    /// Manufacture year.
    pub year: u16,
    /// Manufacture month.
    pub month: u8,
    /// Manufacture day.
    pub day: u8,
    /// Manufacturer code.
    pub maker_code: u8,
}

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Open the motor link.
    Connect(ConnectParams),
    /// Close the motor link.
    Disconnect,
    /// Move the motor.
    Move {
        /// Target position.
        position: i64,
        /// Driver-specific move mode.
        #[serde(default = "default_mode")]
        mode: String,
    },
    /// Read the tip record.
    EepromRead(LayoutSelector),
    /// Write the tip record and read it back.
    EepromWrite(EepromWriteRequest),
    /// Add one to the stored shot count.
    ShotIncrement {
        /// Device family; the configured default when omitted.
        #[serde(rename = "mtrVersion", default)]
        mtr_version: Option<String>,
        /// Region; the configured default when omitted.
        #[serde(default)]
        country: Option<String>,
    },
    /// Fire one 1 MHz shot.
    RfShot {
        /// Level in percent.
        #[serde(default = "default_intensity")]
        intensity: u32,
        /// On-time in milliseconds.
        #[serde(default = "default_rf_time")]
        rf_time: u32,
    },
    /// Hold the RF fire line high.
    RfDtrHigh {
        /// Hold duration in milliseconds.
        #[serde(default = "default_rf_time")]
        rf_time: u32,
    },
    /// Send a status or firmware query.
    RfQuery {
        /// Which query.
        #[serde(default)]
        query: RfQuery,
    },
    /// Report the needle-tip line.
    #[serde(rename = "get_gpio17_status")]
    GetGpio17Status,
}

impl Command {
    /// Decode one inbound text message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        Self::from_value(value)
    }

    /// Decode an already parsed envelope.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let name = value
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingCmd)?
            .to_owned();
        if !KNOWN_COMMANDS.contains(&name.as_str()) {
            return Err(ProtocolError::UnknownCommand(name));
        }
        let command: Command =
            serde_json::from_value(value).map_err(|err| ProtocolError::InvalidParams {
                cmd: name.clone(),
                reason: err.to_string(),
            })?;
        command.check().map_err(|reason| ProtocolError::InvalidParams {
            cmd: name,
            reason,
        })?;
        Ok(command)
    }

    fn check(&self) -> Result<(), String> {
        match self {
            Command::RfShot { intensity, .. } if *intensity > MAX_INTENSITY => Err(format!(
                "intensity {intensity} exceeds {MAX_INTENSITY}"
            )),
            _ => Ok(()),
        }
    }

    /// The `cmd` name, for logging and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect(_) => "connect",
            Command::Disconnect => "disconnect",
            Command::Move { .. } => "move",
            Command::EepromRead(_) => "eeprom_read",
            Command::EepromWrite(_) => "eeprom_write",
            Command::ShotIncrement { .. } => "shot_increment",
            Command::RfShot { .. } => "rf_shot",
            Command::RfDtrHigh { .. } => "rf_dtr_high",
            Command::RfQuery { .. } => "rf_query",
            Command::GetGpio17Status => "get_gpio17_status",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_fills_missing_fields_with_auto_defaults() {
        let command = Command::decode(r#"{"cmd":"connect","port":"/dev/ttyUSB0"}"#).unwrap();
        assert_eq!(
            command,
            Command::Connect(ConnectParams {
                port: "/dev/ttyUSB0".into(),
                baudrate: 19_200,
                parity: "none".into(),
                databits: 8,
                stopbits: 1,
            })
        );
    }

    #[test]
    fn move_defaults_to_position_mode() {
        let command = Command::decode(r#"{"cmd":"move","position":1200}"#).unwrap();
        assert_eq!(
            command,
            Command::Move {
                position: 1200,
                mode: "position".into()
            }
        );
    }

    #[test]
    fn eeprom_write_uses_camel_case_fields() {
        let command = Command::decode(
            r#"{"cmd":"eeprom_write","mtrVersion":"4.0","tipType":3,"year":2024,"month":5,"day":17,"makerCode":9}"#,
        )
        .unwrap();
        let Command::EepromWrite(request) = command else {
            panic!("wrong variant");
        };
        assert_eq!(request.layout.mtr_version, "4.0");
        assert_eq!(request.layout.country, None);
        assert_eq!(request.shot_count, 0);
        assert_eq!(request.maker_code, 9);
    }

    #[test]
    fn eeprom_read_defaults_to_family_two() {
        let command = Command::decode(r#"{"cmd":"eeprom_read","country":"CUTERA"}"#).unwrap();
        assert_eq!(
            command,
            Command::EepromRead(LayoutSelector {
                mtr_version: "2.0".into(),
                country: Some("CUTERA".into()),
            })
        );
    }

    #[test]
    fn rf_commands_apply_defaults() {
        assert_eq!(
            Command::decode(r#"{"cmd":"rf_shot"}"#).unwrap(),
            Command::RfShot {
                intensity: 50,
                rf_time: 60
            }
        );
        assert_eq!(
            Command::decode(r#"{"cmd":"rf_dtr_high"}"#).unwrap(),
            Command::RfDtrHigh { rf_time: 60 }
        );
        assert_eq!(
            Command::decode(r#"{"cmd":"rf_query","query":"bogus"}"#).unwrap(),
            Command::RfQuery {
                query: RfQuery::Status
            }
        );
    }

    #[test]
    fn intensity_above_hundred_is_rejected() {
        let err = Command::decode(r#"{"cmd":"rf_shot","intensity":101}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidParams { ref cmd, .. } if cmd == "rf_shot"));
    }

    #[test]
    fn unknown_and_missing_commands_are_distinguished() {
        assert_eq!(
            Command::decode(r#"{"cmd":"bogus"}"#),
            Err(ProtocolError::UnknownCommand("bogus".into()))
        );
        assert_eq!(Command::decode(r#"{"x":1}"#), Err(ProtocolError::MissingCmd));
        assert!(matches!(
            Command::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn missing_required_field_is_invalid_params() {
        let err = Command::decode(r#"{"cmd":"move"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidParams { .. }));
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn every_known_name_round_trips_through_name() {
        let gpio = Command::decode(r#"{"cmd":"get_gpio17_status"}"#).unwrap();
        assert_eq!(gpio.name(), "get_gpio17_status");
        assert!(KNOWN_COMMANDS.contains(&gpio.name()));
    }
}
