//! ---
//! mtr_section: "04-hardware-links"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "In-memory link simulators for tests and simulation mode."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{LinkError, MotorDriver, MotorReadings, SerialParams};

#[derive(Debug)]
struct SimMotorState {
    connected: bool,
    reachable: bool,
    readings: MotorReadings,
    connect_attempts: usize,
    disconnect_calls: usize,
    moves: Vec<(i64, String)>,
}

/// Motor that connects whenever it is "reachable" and jumps straight to each
/// commanded position.
#[derive(Debug, Clone)]
pub struct SimMotor {
    state: Arc<Mutex<SimMotorState>>,
}

impl SimMotor {
    /// A reachable, disconnected motor at position zero.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimMotorState {
                connected: false,
                reachable: true,
                readings: MotorReadings::default(),
                connect_attempts: 0,
                disconnect_calls: 0,
                moves: Vec::new(),
            })),
        }
    }

    /// Control whether future `connect` calls succeed.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Simulate a cable pull: the link drops without a `disconnect` call.
    pub fn drop_link(&self) {
        self.state.lock().connected = false;
    }

    /// Overwrite the readings reported by the polling loop.
    pub fn set_readings(&self, readings: MotorReadings) {
        self.state.lock().readings = readings;
    }

    /// Number of `connect` calls so far.
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Number of `disconnect` calls so far.
    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }

    /// Every accepted move, oldest first.
    pub fn moves(&self) -> Vec<(i64, String)> {
        self.state.lock().moves.clone()
    }
}

impl Default for SimMotor {
    fn default() -> Self {
        Self::new()
    }
}

impl MotorDriver for SimMotor {
    fn connect(&mut self, params: &SerialParams) -> Result<String, LinkError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if !state.reachable {
            state.connected = false;
            return Err(LinkError::Connect(format!(
                "no motor controller answered on {}",
                params.port
            )));
        }
        state.connected = true;
        Ok(format!(
            "connected to {} at {} baud",
            params.port, params.baudrate
        ))
    }

    fn disconnect(&mut self) -> Result<String, LinkError> {
        let mut state = self.state.lock();
        state.disconnect_calls += 1;
        state.connected = false;
        Ok("disconnected".to_owned())
    }

    fn move_to(&mut self, position: i64, mode: &str) -> Result<String, LinkError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(LinkError::Transaction("motor not connected".to_owned()));
        }
        state.moves.push((position, mode.to_owned()));
        state.readings.set_pos = position as f64;
        state.readings.position = position as f64;
        Ok(format!("moving to {} ({})", position, mode))
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn readings(&self) -> MotorReadings {
        self.state.lock().readings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_motor_counts_attempts() {
        let mut motor = SimMotor::new();
        motor.set_reachable(false);
        assert!(motor.connect(&SerialParams::auto()).is_err());
        assert!(motor.connect(&SerialParams::auto()).is_err());
        assert_eq!(motor.connect_attempts(), 2);
        assert!(!motor.is_connected());
    }

    #[test]
    fn move_requires_connection() {
        let mut motor = SimMotor::new();
        assert!(motor.move_to(10, "position").is_err());
        motor.connect(&SerialParams::auto()).unwrap();
        motor.move_to(10, "position").unwrap();
        assert_eq!(motor.readings().position, 10.0);
        assert_eq!(motor.moves(), vec![(10, "position".to_owned())]);
    }
}
