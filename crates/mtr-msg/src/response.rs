//! ---
//! mtr_section: "02-messaging-data-model"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "RF codec and client message schema."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! Messages sent from the hub to clients. Command replies carry a `result`,
//! the periodic snapshot carries `data`, hardware notices carry their fields
//! at the top level.

use indexmap::IndexMap;
use mtr_common::{Classify, ErrorKind};
use serde::Serialize;

/// Structured success or failure of a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    /// Whether the command took effect.
    pub success: bool,
    /// Human-readable detail on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Human-readable detail on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    /// Hex of the frame written to the RF module.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    /// Hex of the bytes the RF module answered with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Why the module's answer failed frame validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_error: Option<String>,
}

impl Outcome {
    /// Success with a message.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
            kind: None,
            frame: None,
            response: None,
            response_error: None,
        }
    }

    /// Failure of the given class.
    pub fn failed(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
            kind: Some(kind),
            frame: None,
            response: None,
            response_error: None,
        }
    }

    /// Failure built from a classified error.
    pub fn from_error<E: Classify + std::fmt::Display>(err: &E) -> Self {
        Self::failed(err.kind(), err.to_string())
    }

    /// Attach the written frame.
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.frame = Some(frame.into());
        self
    }

    /// Attach the module's answer.
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    /// Flag the module's answer as malformed.
    pub fn with_response_error(mut self, error: impl Into<String>) -> Self {
        self.response_error = Some(error.into());
        self
    }
}

/// Decoded tip record as presented to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EepromReport {
    /// Tip type code.
    pub tip_type: u8,
    /// Shots fired so far.
    pub shot_count: u16,
    /// Manufacture year.
    pub year: u16,
    /// Manufacture month.
    pub month: u8,
    /// Manufacture day.
    pub day: u8,
    /// Manufacturer code.
    pub maker_code: u8,
    /// Device family of the layout used.
    pub mtr_version: String,
    /// Region of the layout used, `ALL` for family 4.0.
    pub country: String,
}

/// Result of an EEPROM command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EepromResult {
    /// Whether the transaction succeeded.
    pub success: bool,
    /// Record fields, present after a successful read.
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub record: Option<EepromReport>,
    /// Human-readable detail on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Human-readable detail on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    /// Bus error label (`nack`, `bus`, `short_read`) when the bus failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i2c: Option<&'static str>,
    /// Read-back after a write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<EepromResult>>,
}

impl EepromResult {
    /// Successful read.
    pub fn read(record: EepromReport) -> Self {
        Self {
            success: true,
            record: Some(record),
            message: None,
            error: None,
            kind: None,
            i2c: None,
            data: None,
        }
    }

    /// Successful write whose read-back is `data`.
    pub fn written(message: impl Into<String>, data: Option<EepromResult>) -> Self {
        Self {
            success: true,
            record: None,
            message: Some(message.into()),
            error: None,
            kind: None,
            i2c: None,
            data: data.map(Box::new),
        }
    }

    /// Failed transaction.
    pub fn failed(kind: ErrorKind, error: impl Into<String>, i2c: Option<&'static str>) -> Self {
        Self {
            success: false,
            record: None,
            message: None,
            error: Some(error.into()),
            kind: Some(kind),
            i2c,
            data: None,
        }
    }
}

/// Motor readings included in the snapshot while the link is up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotorSnapshot {
    /// Current position.
    pub position: f64,
    /// Measured force.
    pub force: f64,
    /// Auxiliary sensor.
    pub sensor: f64,
    /// Last set-point.
    #[serde(rename = "setPos")]
    pub set_pos: f64,
}

/// Body of the periodic `status` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusData {
    /// Motor link is up.
    pub motor_connected: bool,
    /// Supervisor state name.
    pub motor_link: String,
    /// RF port opened at start.
    pub rf_connected: bool,
    /// Needle tip present.
    pub needle_tip_connected: bool,
    /// Foot switch held down.
    pub foot_switch_pressed: bool,
    /// `gpio<N>` to `HIGH`, `LOW` or `UNKNOWN`.
    #[serde(flatten)]
    pub pins: IndexMap<String, String>,
    /// Readings, omitted while disconnected.
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub motor: Option<MotorSnapshot>,
}

/// Every message the hub sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `connect`, `disconnect` and `move`.
    Serial {
        /// Outcome.
        result: Outcome,
    },
    /// Reply to `eeprom_read`.
    EepromRead {
        /// Outcome.
        result: EepromResult,
    },
    /// Reply to `eeprom_write`.
    EepromWrite {
        /// Outcome.
        result: EepromResult,
    },
    /// Reply to `shot_increment`.
    ShotIncrement {
        /// Outcome.
        result: EepromResult,
    },
    /// Reply to `rf_shot`.
    RfShot {
        /// Outcome.
        result: Outcome,
    },
    /// Reply to `rf_dtr_high`.
    RfDtrHigh {
        /// Outcome.
        result: Outcome,
    },
    /// Reply to `rf_query`.
    RfQuery {
        /// Outcome.
        result: Outcome,
    },
    /// Needle-tip line level, on request and on every edge.
    #[serde(rename = "gpio17_status")]
    Gpio17Status {
        /// `HIGH`, `LOW` or `UNKNOWN`.
        gpio17: String,
        /// Derived tip presence.
        needle_tip_connected: bool,
    },
    /// Foot switch edge.
    FootSwitch {
        /// Switch held down.
        pressed: bool,
    },
    /// Periodic snapshot.
    Status {
        /// Snapshot body.
        data: StatusData,
    },
    /// Undecodable or unknown command.
    Error {
        /// Description.
        result: String,
        /// Failure class.
        kind: ErrorKind,
    },
}

impl ServerMessage {
    /// Error reply for a classified failure.
    pub fn error<E: Classify + std::fmt::Display>(err: &E) -> Self {
        ServerMessage::Error {
            result: err.to_string(),
            kind: err.kind(),
        }
    }

    /// Value of the `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Serial { .. } => "serial",
            ServerMessage::EepromRead { .. } => "eeprom_read",
            ServerMessage::EepromWrite { .. } => "eeprom_write",
            ServerMessage::ShotIncrement { .. } => "shot_increment",
            ServerMessage::RfShot { .. } => "rf_shot",
            ServerMessage::RfDtrHigh { .. } => "rf_dtr_high",
            ServerMessage::RfQuery { .. } => "rf_query",
            ServerMessage::Gpio17Status { .. } => "gpio17_status",
            ServerMessage::FootSwitch { .. } => "foot_switch",
            ServerMessage::Status { .. } => "status",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            format!(
                r#"{{"type":"error","result":"encode failed: {}","kind":"protocol_error"}}"#,
                err.to_string().replace('"', "'")
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ProtocolError;
    use serde_json::{json, Value};

    fn encode(message: &ServerMessage) -> Value {
        serde_json::from_str(&message.to_json()).unwrap()
    }

    #[test]
    fn error_reply_has_type_result_and_kind() {
        let message = ServerMessage::error(&ProtocolError::UnknownCommand("bogus".into()));
        assert_eq!(
            encode(&message),
            json!({"type": "error", "result": "unknown command: bogus", "kind": "protocol_error"})
        );
    }

    #[test]
    fn status_flattens_pins_and_hides_motor_when_down() {
        let mut pins = IndexMap::new();
        pins.insert("gpio17".to_owned(), "HIGH".to_owned());
        pins.insert("gpio18".to_owned(), "UNKNOWN".to_owned());
        let mut data = StatusData {
            motor_connected: false,
            motor_link: "reconnect_exhausted".into(),
            rf_connected: true,
            needle_tip_connected: true,
            foot_switch_pressed: false,
            pins,
            motor: None,
        };
        let value = encode(&ServerMessage::Status { data: data.clone() });
        assert_eq!(value["type"], "status");
        assert_eq!(value["data"]["gpio17"], "HIGH");
        assert_eq!(value["data"]["gpio18"], "UNKNOWN");
        assert!(value["data"].get("position").is_none());

        data.motor_connected = true;
        data.motor = Some(MotorSnapshot {
            position: 12.0,
            force: 0.5,
            sensor: 1.0,
            set_pos: 12.0,
        });
        let value = encode(&ServerMessage::Status { data });
        assert_eq!(value["data"]["setPos"], 12.0);
        assert_eq!(value["data"]["motor_connected"], true);
    }

    #[test]
    fn eeprom_read_flattens_record_in_camel_case() {
        let result = EepromResult::read(EepromReport {
            tip_type: 1,
            shot_count: 300,
            year: 2024,
            month: 2,
            day: 29,
            maker_code: 7,
            mtr_version: "2.0".into(),
            country: "CLASSYS".into(),
        });
        let value = encode(&ServerMessage::EepromRead { result });
        assert_eq!(value["result"]["success"], true);
        assert_eq!(value["result"]["shotCount"], 300);
        assert_eq!(value["result"]["makerCode"], 7);
        assert!(value["result"].get("error").is_none());
    }

    #[test]
    fn failed_outcome_carries_kind() {
        let value = encode(&ServerMessage::RfShot {
            result: Outcome::failed(ErrorKind::LinkUnavailable, "rf unavailable"),
        });
        assert_eq!(
            value,
            json!({"type": "rf_shot", "result": {"success": false, "error": "rf unavailable", "kind": "link_unavailable"}})
        );
    }

    #[test]
    fn gpio_notice_uses_fixed_type_name() {
        let message = ServerMessage::Gpio17Status {
            gpio17: "LOW".into(),
            needle_tip_connected: false,
        };
        assert_eq!(message.type_name(), "gpio17_status");
        assert_eq!(encode(&message)["type"], "gpio17_status");
    }
}
