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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::Mutex;
use tracing::warn;

use crate::{EdgeCallback, GpioChip, InputPin, Level, LinkError, OutputPin};

enum Dispatch {
    Edge(Level),
    Flush(mpsc::Sender<()>),
}

/// Input line whose level is driven by the test.
///
/// Edge callbacks run on a dedicated thread, one at a time and in the order
/// the edges were driven, like an interrupt handler thread on real hardware.
pub struct SimInputPin {
    pin: u8,
    level: Mutex<Level>,
    callbacks: Arc<Mutex<Vec<EdgeCallback>>>,
    dispatch: mpsc::Sender<Dispatch>,
}

impl SimInputPin {
    fn new(pin: u8, initial: Level) -> Self {
        let callbacks: Arc<Mutex<Vec<EdgeCallback>>> = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel::<Dispatch>();
        let worker_callbacks = callbacks.clone();
        let spawned = thread::Builder::new()
            .name(format!("sim-gpio{pin}"))
            .spawn(move || {
                for message in rx {
                    match message {
                        Dispatch::Edge(level) => {
                            for callback in worker_callbacks.lock().iter() {
                                callback(level);
                            }
                        }
                        Dispatch::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            });
        if let Err(err) = spawned {
            warn!(pin, error = %err, "edge dispatcher thread failed to start");
        }
        Self {
            pin,
            level: Mutex::new(initial),
            callbacks,
            dispatch: tx,
        }
    }

    /// BCM pin number.
    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Change the line level. Callbacks fire only when the level changes.
    pub fn drive(&self, level: Level) {
        let mut current = self.level.lock();
        if *current == level {
            return;
        }
        *current = level;
        let _ = self.dispatch.send(Dispatch::Edge(level));
    }

    /// Block until every edge driven so far has been delivered.
    pub fn flush(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        if self.dispatch.send(Dispatch::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }
}

impl InputPin for SimInputPin {
    fn level(&self) -> Result<Level, LinkError> {
        Ok(*self.level.lock())
    }

    fn on_edge(&self, callback: EdgeCallback) -> Result<(), LinkError> {
        self.callbacks.lock().push(callback);
        Ok(())
    }
}

/// Output line that remembers every state it was driven to.
#[derive(Debug, Default)]
pub struct SimOutputPin {
    on: AtomicBool,
    history: Mutex<Vec<bool>>,
}

impl SimOutputPin {
    /// Every `set` call so far, oldest first.
    pub fn history(&self) -> Vec<bool> {
        self.history.lock().clone()
    }
}

impl OutputPin for SimOutputPin {
    fn set(&self, on: bool) -> Result<(), LinkError> {
        let mut history = self.history.lock();
        self.on.store(on, Ordering::SeqCst);
        history.push(on);
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

/// Chip that creates pins on first use and hands the same pin back afterwards.
#[derive(Default)]
pub struct SimGpioChip {
    inputs: Mutex<HashMap<u8, Arc<SimInputPin>>>,
    outputs: Mutex<HashMap<u8, Arc<SimOutputPin>>>,
}

impl SimGpioChip {
    /// Chip with no pins claimed yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The simulated input on `pin`, idle low until driven.
    pub fn input_pin(&self, pin: u8) -> Arc<SimInputPin> {
        self.inputs
            .lock()
            .entry(pin)
            .or_insert_with(|| Arc::new(SimInputPin::new(pin, Level::Low)))
            .clone()
    }

    /// The simulated output on `pin`.
    pub fn output_pin(&self, pin: u8) -> Arc<SimOutputPin> {
        self.outputs
            .lock()
            .entry(pin)
            .or_insert_with(|| Arc::new(SimOutputPin::default()))
            .clone()
    }
}

impl GpioChip for SimGpioChip {
    fn input(&self, pin: u8) -> Result<Arc<dyn InputPin>, LinkError> {
        Ok(self.input_pin(pin))
    }

    fn output(&self, pin: u8) -> Result<Arc<dyn OutputPin>, LinkError> {
        let output = self.output_pin(pin);
        output.set(false)?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_are_delivered_in_order_and_only_on_change() {
        let chip = SimGpioChip::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let input = chip.input(17).unwrap();
        input
            .on_edge(Box::new(move |level| sink.lock().push(level)))
            .unwrap();

        let pin = chip.input_pin(17);
        pin.drive(Level::High);
        pin.drive(Level::High);
        pin.drive(Level::Low);
        pin.drive(Level::High);
        pin.flush();

        assert_eq!(*seen.lock(), vec![Level::High, Level::Low, Level::High]);
        assert_eq!(input.level().unwrap(), Level::High);
    }

    #[test]
    fn claimed_output_starts_low() {
        let chip = SimGpioChip::new();
        let out = chip.output(0).unwrap();
        out.set(true).unwrap();
        assert!(out.is_on());
        assert_eq!(chip.output_pin(0).history(), vec![false, true]);
    }
}
