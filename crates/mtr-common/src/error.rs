//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Shared primitives and utilities for the hub runtime."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure classes reported to clients alongside every unsuccessful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The capability backing a link was absent at startup.
    LinkUnavailable,
    /// Opening or handshaking a link failed.
    ConnectFailure,
    /// A single bus or serial operation failed.
    TransactionFailure,
    /// Every attempt of a bounded retry loop failed.
    RetryExhausted,
    /// The client sent a malformed or unknown command.
    ProtocolError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::LinkUnavailable => "link_unavailable",
            ErrorKind::ConnectFailure => "connect_failure",
            ErrorKind::TransactionFailure => "transaction_failure",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::ProtocolError => "protocol_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every error that can cross a component boundary.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}
