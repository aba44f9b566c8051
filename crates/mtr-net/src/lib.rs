//! ---
//! mtr_section: "05-networking-external-interfaces"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Client WebSocket surface and session fan-out."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod session;
pub mod websocket;

pub use session::{BroadcastReport, SessionId, SessionRegistry};
pub use websocket::{CommandHandler, WebSocketServerBuilder, WebSocketServerHandle};
