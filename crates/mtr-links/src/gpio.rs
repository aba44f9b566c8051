//! ---
//! mtr_section: "04-hardware-links"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Hardware link capabilities consumed by the hub."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::LinkError;

/// Logic level of a GPIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    /// Line reads 0.
    Low,
    /// Line reads 1.
    High,
}

impl Level {
    /// Upper-case label used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Low => "LOW",
            Level::High => "HIGH",
        }
    }

    /// `true` for [`Level::High`].
    pub fn is_high(&self) -> bool {
        matches!(self, Level::High)
    }
}

impl From<bool> for Level {
    fn from(value: bool) -> Self {
        if value {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked with the new level after every edge.
///
/// Runs on a context the hub does not control, possibly concurrently with the
/// status loop.
pub type EdgeCallback = Box<dyn Fn(Level) + Send + Sync + 'static>;

/// Interrupt-capable digital input.
pub trait InputPin: Send + Sync {
    /// Current level of the line.
    fn level(&self) -> Result<Level, LinkError>;

    /// Register a callback fired on both rising and falling edges.
    fn on_edge(&self, callback: EdgeCallback) -> Result<(), LinkError>;
}

/// Digital output line.
pub trait OutputPin: Send + Sync {
    /// Drive the line high (`true`) or low (`false`).
    fn set(&self, on: bool) -> Result<(), LinkError>;

    /// Last driven state.
    fn is_on(&self) -> bool;
}

/// Hands out pins by BCM number.
pub trait GpioChip: Send + Sync {
    /// Claim `pin` as an input.
    fn input(&self, pin: u8) -> Result<Arc<dyn InputPin>, LinkError>;

    /// Claim `pin` as an output, initially low.
    fn output(&self, pin: u8) -> Result<Arc<dyn OutputPin>, LinkError>;
}
