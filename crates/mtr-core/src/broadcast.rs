//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Device coordination hub and its components."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! Fixed-period status loop.

use std::sync::Arc;
use std::time::Duration;

use mtr_msg::{ServerMessage, StatusData};
use mtr_net::SessionRegistry;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::gpio::GpioBridge;
use crate::motor::MotorSupervisor;
use crate::rf::RfLink;
use crate::ticker::RateLimiter;

/// What one tick pushed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub notices: usize,
    pub recipients: usize,
    pub dropped_sessions: usize,
}

/// Merges motor, RF and GPIO state into the periodic `status` message.
///
/// Each tick drains pending GPIO edges first, so their notices always reach
/// the sessions ahead of the snapshot that reflects them.
#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    registry: Arc<SessionRegistry>,
    motor: Arc<MotorSupervisor>,
    rf: Arc<RfLink>,
    gpio: Arc<GpioBridge>,
}

impl StatusBroadcaster {
    pub fn new(
        registry: Arc<SessionRegistry>,
        motor: Arc<MotorSupervisor>,
        rf: Arc<RfLink>,
        gpio: Arc<GpioBridge>,
    ) -> Self {
        Self {
            registry,
            motor,
            rf,
            gpio,
        }
    }

    /// Current state, as sent in the `status` message.
    pub fn snapshot(&self) -> StatusData {
        StatusData {
            motor_connected: self.motor.is_connected(),
            motor_link: self.motor.status().as_str().to_owned(),
            rf_connected: self.rf.is_connected(),
            needle_tip_connected: self.gpio.needle_tip_connected(),
            foot_switch_pressed: self.gpio.foot_switch_pressed(),
            pins: self.gpio.pin_levels(),
            motor: self.motor.snapshot(),
        }
    }

    pub fn tick_once(&self) -> TickReport {
        let mut report = TickReport::default();
        for notice in self.gpio.drain() {
            let sent = self.registry.broadcast(&notice.to_json());
            report.notices += 1;
            report.dropped_sessions += sent.dropped;
        }

        self.motor.poll();
        let status = ServerMessage::Status {
            data: self.snapshot(),
        };
        let sent = self.registry.broadcast(&status.to_json());
        report.recipients = sent.delivered;
        report.dropped_sessions += sent.dropped;
        trace!(
            notices = report.notices,
            recipients = report.recipients,
            "status tick"
        );
        report
    }

    /// Tick every `period` until `shutdown` fires.
    pub async fn run(self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut limiter = RateLimiter::new(period);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("status loop shutdown");
                    break;
                }
                late = limiter.tick() => {
                    if late > limiter.period() {
                        debug!(late_ms = late.as_millis() as u64, "status tick late");
                    }
                    self.tick_once();
                }
            }
        }
    }
}
