//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Device coordination hub and its components."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! Device coordination hub.
//!
//! Owns every hardware link through its component ([`MotorSupervisor`],
//! [`EepromStore`], [`RfLink`], [`GpioBridge`]), answers client commands
//! through the [`Dispatcher`] and pushes periodic state through the
//! [`StatusBroadcaster`]. [`MtrHub`] wires them together.

pub mod broadcast;
pub mod dispatch;
pub mod eeprom;
pub mod gpio;
pub mod hub;
pub mod motor;
pub mod rf;
pub mod ticker;

pub use broadcast::{StatusBroadcaster, TickReport};
pub use dispatch::Dispatcher;
pub use eeprom::{EepromLayout, EepromRecord, EepromStore, StoreError};
pub use gpio::{Edge, GpioBridge, GpioEvent, HoldOutcome, TimedHold};
pub use hub::{HubError, HubHandle, MtrHub};
pub use motor::{MotorLinkStatus, MotorSupervisor};
pub use rf::{RfError, RfExchange, RfLink};
pub use ticker::RateLimiter;
