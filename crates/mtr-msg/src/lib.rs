//! ---
//! mtr_section: "02-messaging-data-model"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "RF codec and client message schema."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Wire formats spoken by the hub: binary RF frames towards the RF module and
//! JSON envelopes towards UI clients.

pub mod command;
pub mod response;
pub mod rf;

pub use command::{Command, ConnectParams, EepromWriteRequest, LayoutSelector, ProtocolError};
pub use response::{
    EepromReport, EepromResult, MotorSnapshot, Outcome, ServerMessage, StatusData,
};
pub use rf::{FrameError, RfFrame, RfQuery, ShotError, ShotParams};
