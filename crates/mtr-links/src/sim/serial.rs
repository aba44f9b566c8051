//! ---
//! mtr_section: "04-hardware-links"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "In-memory link simulators for tests and simulation mode."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{LinkError, SerialPort};

#[derive(Debug, Default)]
struct SimSerialState {
    open: bool,
    echo: bool,
    written: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    fail_writes: bool,
}

/// Serial port that records writes and serves queued replies.
#[derive(Debug, Clone)]
pub struct SimSerialPort {
    state: Arc<Mutex<SimSerialState>>,
}

impl SimSerialPort {
    /// An open port that answers nothing unless replies are queued.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimSerialState {
                open: true,
                ..SimSerialState::default()
            })),
        }
    }

    /// An open port that answers each write with the same bytes.
    pub fn echoing() -> Self {
        let port = Self::new();
        port.state.lock().echo = true;
        port
    }

    /// Queue bytes returned by the next `read_available`.
    pub fn push_reply(&self, bytes: &[u8]) {
        self.state.lock().replies.push_back(bytes.to_vec());
    }

    /// Make every write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Every successful write, oldest first.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    /// Whether `close` has not been called.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

impl Default for SimSerialPort {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialPort for SimSerialPort {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(LinkError::Transaction("port closed".to_owned()));
        }
        if state.fail_writes {
            return Err(LinkError::Transaction("write failed".to_owned()));
        }
        state.written.push(bytes.to_vec());
        if state.echo {
            state.replies.push_back(bytes.to_vec());
        }
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, LinkError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(LinkError::Transaction("port closed".to_owned()));
        }
        Ok(state.replies.drain(..).flatten().collect())
    }

    fn close(&mut self) {
        self.state.lock().open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoing_port_returns_written_frame() {
        let mut port = SimSerialPort::echoing();
        port.write_all(&[0x02, 0x07]).unwrap();
        assert_eq!(port.read_available().unwrap(), vec![0x02, 0x07]);
        assert!(port.read_available().unwrap().is_empty());
    }

    #[test]
    fn closed_port_rejects_writes() {
        let mut port = SimSerialPort::new();
        port.close();
        assert!(port.write_all(&[1]).is_err());
        assert!(!port.is_open());
    }
}
