//! ---
//! mtr_section: "04-hardware-links"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "In-memory link simulators for tests and simulation mode."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{I2cBus, I2cError};

const DEVICE_SIZE: usize = 256;
const ERASED: u8 = 0xFF;

/// One bus transaction as seen by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum I2cOp {
    /// A byte or block read.
    Read {
        /// Device address.
        address: u8,
        /// Start offset.
        offset: u8,
        /// Bytes requested.
        len: usize,
    },
    /// A byte or block write.
    Write {
        /// Device address.
        address: u8,
        /// Start offset.
        offset: u8,
        /// Bytes written.
        data: Vec<u8>,
    },
}

impl I2cOp {
    /// `true` for writes.
    pub fn is_write(&self) -> bool {
        matches!(self, I2cOp::Write { .. })
    }
}

#[derive(Debug, Default)]
struct SimI2cState {
    devices: HashMap<u8, Vec<u8>>,
    fail_next: usize,
    fail_reads: bool,
    journal: Vec<I2cOp>,
}

/// Bus with 256-byte EEPROM devices at chosen addresses. Fresh memory reads
/// as `0xFF`, like an erased part.
#[derive(Debug, Clone, Default)]
pub struct SimI2cBus {
    state: Arc<Mutex<SimI2cState>>,
}

impl SimI2cBus {
    /// An empty bus; every address NACKs.
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with erased devices at each of `addresses`.
    pub fn with_devices(addresses: &[u8]) -> Self {
        let bus = Self::new();
        {
            let mut state = bus.state.lock();
            for address in addresses {
                state.devices.insert(*address, vec![ERASED; DEVICE_SIZE]);
            }
        }
        bus
    }

    /// Make the next `count` transactions fail with a bus error.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Make every read fail with a bus error until cleared. Writes still land.
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Copy of every transaction so far, oldest first.
    pub fn journal(&self) -> Vec<I2cOp> {
        self.state.lock().journal.clone()
    }

    /// Forget recorded transactions.
    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    /// Read device memory directly, bypassing the journal.
    pub fn peek(&self, address: u8, offset: u8, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let memory = state.devices.get(&address)?;
        let start = offset as usize;
        memory.get(start..start + len).map(<[u8]>::to_vec)
    }

    /// Write device memory directly, bypassing the journal.
    pub fn poke(&self, address: u8, offset: u8, data: &[u8]) {
        let mut state = self.state.lock();
        if let Some(memory) = state.devices.get_mut(&address) {
            let start = offset as usize;
            let end = (start + data.len()).min(DEVICE_SIZE);
            memory[start..end].copy_from_slice(&data[..end - start]);
        }
    }

    fn transact<T>(
        &self,
        op: I2cOp,
        apply: impl FnOnce(&mut Vec<u8>) -> Result<T, I2cError>,
    ) -> Result<T, I2cError> {
        let mut state = self.state.lock();
        let (address, offset) = match &op {
            I2cOp::Read {
                address, offset, ..
            }
            | I2cOp::Write {
                address, offset, ..
            } => (*address, *offset),
        };
        let is_read = !op.is_write();
        state.journal.push(op);
        if state.fail_reads && is_read {
            return Err(I2cError::Bus("reads disabled".to_owned()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(I2cError::Bus("injected fault".to_owned()));
        }
        let memory = state
            .devices
            .get_mut(&address)
            .ok_or(I2cError::Nack { address, offset })?;
        apply(memory)
    }
}

fn span(offset: u8, len: usize) -> Result<std::ops::Range<usize>, I2cError> {
    let start = offset as usize;
    if start + len > DEVICE_SIZE {
        return Err(I2cError::ShortRead {
            expected: len,
            got: DEVICE_SIZE.saturating_sub(start),
        });
    }
    Ok(start..start + len)
}

impl I2cBus for SimI2cBus {
    fn read_byte(&mut self, address: u8, offset: u8) -> Result<u8, I2cError> {
        self.read_block(address, offset, 1).map(|bytes| bytes[0])
    }

    fn read_block(&mut self, address: u8, offset: u8, len: usize) -> Result<Vec<u8>, I2cError> {
        let op = I2cOp::Read {
            address,
            offset,
            len,
        };
        self.transact(op, |memory| Ok(memory[span(offset, len)?].to_vec()))
    }

    fn write_byte(&mut self, address: u8, offset: u8, value: u8) -> Result<(), I2cError> {
        self.write_block(address, offset, &[value])
    }

    fn write_block(&mut self, address: u8, offset: u8, data: &[u8]) -> Result<(), I2cError> {
        let op = I2cOp::Write {
            address,
            offset,
            data: data.to_vec(),
        };
        self.transact(op, |memory| {
            memory[span(offset, data.len())?].copy_from_slice(data);
            Ok(())
        })
    }
}
