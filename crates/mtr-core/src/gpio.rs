//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Device coordination hub and its components."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! Bridge between GPIO interrupt callbacks and the status loop.
//!
//! Edge callbacks only enqueue a [`GpioEvent`]; they never block and never
//! touch hub state. The status loop drains the queue once per tick, in order,
//! and derives sensor state and LED outputs from it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use mtr_common::{GpioConfig, LedConfig, SensorPinConfig, SensorRole};
use mtr_links::{GpioChip, InputPin, Level, LinkError, OutputPin};
use mtr_metrics::HubMetrics;
use mtr_msg::ServerMessage;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};

const UNKNOWN: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Rising,
    Falling,
}

impl From<Level> for Edge {
    fn from(level: Level) -> Self {
        match level {
            Level::High => Edge::Rising,
            Level::Low => Edge::Falling,
        }
    }
}

/// One observed edge on a sensor input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpioEvent {
    pub pin: u8,
    pub role: SensorRole,
    pub edge: Edge,
    pub level: Level,
    pub timestamp: DateTime<Utc>,
}

struct Sensor {
    role: SensorRole,
    config: SensorPinConfig,
    input: Option<Arc<dyn InputPin>>,
    level: Option<Level>,
}

impl Sensor {
    fn active(&self) -> bool {
        self.active_at(self.level)
    }

    fn active_at(&self, level: Option<Level>) -> bool {
        level.is_some_and(|level| level.is_high() != self.config.active_low)
    }

    fn level_label(&self) -> &'static str {
        self.level.map_or(UNKNOWN, |level| level.as_str())
    }

    fn notice(&self) -> ServerMessage {
        match self.role {
            SensorRole::NeedleTip => ServerMessage::Gpio17Status {
                gpio17: self.level_label().to_owned(),
                needle_tip_connected: self.active(),
            },
            SensorRole::FootSwitch => ServerMessage::FootSwitch {
                pressed: self.active(),
            },
        }
    }
}

struct Led {
    config: LedConfig,
    output: Arc<dyn OutputPin>,
    on: bool,
}

/// Sensor inputs, LED outputs and the RF fire line.
pub struct GpioBridge {
    sensors: Mutex<Vec<Sensor>>,
    leds: Mutex<Vec<Led>>,
    fire: Option<TimedHold>,
    events: Mutex<mpsc::Receiver<GpioEvent>>,
    overflowed: Arc<AtomicBool>,
    metrics: Option<HubMetrics>,
}

impl GpioBridge {
    /// Claim every configured pin and register the edge callbacks.
    ///
    /// Pins that cannot be claimed are logged and reported as `UNKNOWN`; a
    /// missing chip leaves the whole bridge inert.
    pub fn start(
        chip: Option<Arc<dyn GpioChip>>,
        config: &GpioConfig,
        metrics: Option<HubMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let overflowed = Arc::new(AtomicBool::new(false));

        let mut sensors = Vec::new();
        for role in [SensorRole::NeedleTip, SensorRole::FootSwitch] {
            let pin_config = config.sensor(role);
            let input = chip.as_ref().and_then(|chip| {
                claim_input(
                    chip.as_ref(),
                    pin_config.pin,
                    role,
                    &tx,
                    &overflowed,
                    &metrics,
                )
            });
            let level = input.as_ref().and_then(|input| input.level().ok());
            sensors.push(Sensor {
                role,
                config: pin_config,
                input,
                level,
            });
        }

        let mut leds = Vec::new();
        let mut fire = None;
        match &chip {
            Some(chip) => {
                for led in &config.leds {
                    match chip.output(led.pin) {
                        Ok(output) => leds.push(Led {
                            config: *led,
                            output,
                            on: false,
                        }),
                        Err(err) => warn!(pin = led.pin, error = %err, "led pin unavailable"),
                    }
                }
                if let Some(pin) = config.rf_fire_pin {
                    match chip.output(pin) {
                        Ok(output) => fire = Some(TimedHold::new(output)),
                        Err(err) => warn!(pin, error = %err, "rf fire pin unavailable"),
                    }
                }
            }
            None => warn!("no gpio chip available; sensors report UNKNOWN"),
        }

        let bridge = Self {
            sensors: Mutex::new(sensors),
            leds: Mutex::new(leds),
            fire,
            events: Mutex::new(rx),
            overflowed,
            metrics,
        };
        bridge.refresh_leds();
        info!(
            needle_tip = config.needle_tip.pin,
            foot_switch = config.foot_switch.pin,
            leds = config.leds.len(),
            "gpio bridge started"
        );
        bridge
    }

    /// Apply every queued edge in arrival order and return the notices to
    /// broadcast, oldest first.
    ///
    /// After an overflow the sensors are re-read from the pins and a notice
    /// with the current state of each is appended.
    pub fn drain(&self) -> Vec<ServerMessage> {
        let mut notices = Vec::new();
        {
            let mut events = self.events.lock();
            let mut sensors = self.sensors.lock();
            while let Ok(event) = events.try_recv() {
                if let Some(metrics) = &self.metrics {
                    metrics.gpio_event(event.pin);
                }
                debug!(
                    pin = event.pin,
                    edge = ?event.edge,
                    at = %event.timestamp,
                    "gpio edge"
                );
                if let Some(sensor) = sensors.iter_mut().find(|s| s.role == event.role) {
                    sensor.level = Some(event.level);
                    notices.push(sensor.notice());
                }
            }
            if self.overflowed.swap(false, Ordering::SeqCst) {
                warn!("gpio event queue overflowed; resynchronising from pins");
                for sensor in sensors.iter_mut() {
                    if let Some(input) = &sensor.input {
                        sensor.level = input.level().ok();
                    }
                    notices.push(sensor.notice());
                }
            }
        }
        self.refresh_leds();
        notices
    }

    /// Reply to `get_gpio17_status`, read from the line itself.
    pub fn gpio17_status(&self) -> ServerMessage {
        let sensors = self.sensors.lock();
        let Some(sensor) = sensors.iter().find(|s| s.role == SensorRole::NeedleTip) else {
            return ServerMessage::Gpio17Status {
                gpio17: UNKNOWN.to_owned(),
                needle_tip_connected: false,
            };
        };
        let live = sensor.input.as_ref().and_then(|input| input.level().ok());
        let gpio17 = live.map_or(UNKNOWN, |level| level.as_str()).to_owned();
        ServerMessage::Gpio17Status {
            gpio17,
            needle_tip_connected: sensor.active_at(live),
        }
    }

    /// `gpio<N>` to `HIGH`, `LOW` or `UNKNOWN` for every sensor pin.
    pub fn pin_levels(&self) -> IndexMap<String, String> {
        self.sensors
            .lock()
            .iter()
            .map(|sensor| {
                (
                    format!("gpio{}", sensor.config.pin),
                    sensor.level_label().to_owned(),
                )
            })
            .collect()
    }

    pub fn needle_tip_connected(&self) -> bool {
        self.is_active(SensorRole::NeedleTip)
    }

    pub fn foot_switch_pressed(&self) -> bool {
        self.is_active(SensorRole::FootSwitch)
    }

    fn is_active(&self, role: SensorRole) -> bool {
        self.sensors
            .lock()
            .iter()
            .find(|sensor| sensor.role == role)
            .is_some_and(Sensor::active)
    }

    /// Hold the RF fire line high for `duration`.
    pub async fn fire_hold(&self, duration: Duration) -> Result<HoldOutcome, LinkError> {
        match &self.fire {
            Some(fire) => fire.hold(duration).await,
            None => Err(LinkError::Unavailable("rf fire line")),
        }
    }

    /// Turn every LED and the fire line off.
    pub fn drive_outputs_low(&self) {
        for led in self.leds.lock().iter_mut() {
            match led.output.set(false) {
                Ok(()) => led.on = false,
                Err(err) => warn!(pin = led.config.pin, error = %err, "led reset failed"),
            }
        }
        if let Some(fire) = &self.fire {
            fire.release();
        }
    }

    fn refresh_leds(&self) {
        let states: Vec<(SensorRole, bool)> = self
            .sensors
            .lock()
            .iter()
            .map(|sensor| (sensor.role, sensor.active()))
            .collect();
        for led in self.leds.lock().iter_mut() {
            let wanted = states
                .iter()
                .any(|(role, active)| *role == led.config.follows && *active);
            if wanted == led.on {
                continue;
            }
            match led.output.set(wanted) {
                Ok(()) => led.on = wanted,
                Err(err) => warn!(pin = led.config.pin, error = %err, "led update failed"),
            }
        }
    }
}

impl std::fmt::Debug for GpioBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpioBridge")
            .field("pins", &self.pin_levels())
            .field("fire_line", &self.fire.is_some())
            .finish()
    }
}

fn claim_input(
    chip: &dyn GpioChip,
    pin: u8,
    role: SensorRole,
    tx: &mpsc::Sender<GpioEvent>,
    overflowed: &Arc<AtomicBool>,
    metrics: &Option<HubMetrics>,
) -> Option<Arc<dyn InputPin>> {
    let input = match chip.input(pin) {
        Ok(input) => input,
        Err(err) => {
            warn!(pin, ?role, error = %err, "sensor pin unavailable");
            return None;
        }
    };
    let tx = tx.clone();
    let overflowed = overflowed.clone();
    let metrics = metrics.clone();
    let registered = input.on_edge(Box::new(move |level| {
        let event = GpioEvent {
            pin,
            role,
            edge: Edge::from(level),
            level,
            timestamp: Utc::now(),
        };
        if tx.try_send(event).is_err() {
            if !overflowed.swap(true, Ordering::SeqCst) {
                warn!(pin, "gpio event queue full; dropping edges");
            }
            if let Some(metrics) = &metrics {
                metrics.gpio_event_dropped();
            }
        }
    }));
    if let Err(err) = registered {
        warn!(pin, ?role, error = %err, "edge callback registration failed");
    }
    Some(input)
}

/// How a timed hold ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
    /// The full duration elapsed and the line was restored.
    Completed,
    /// A newer hold took the line over before the duration elapsed.
    Preempted,
}

struct HoldSlot {
    generation: u64,
    baseline: bool,
    cancel: Option<oneshot::Sender<()>>,
}

/// Drives an output high for a while, then restores its previous state.
///
/// Only one hold is current. A new hold preempts the running one and inherits
/// its baseline, so the line returns to the state it had before the first hold.
pub struct TimedHold {
    output: Arc<dyn OutputPin>,
    slot: Mutex<HoldSlot>,
}

impl TimedHold {
    pub fn new(output: Arc<dyn OutputPin>) -> Self {
        Self {
            output,
            slot: Mutex::new(HoldSlot {
                generation: 0,
                baseline: false,
                cancel: None,
            }),
        }
    }

    pub async fn hold(&self, duration: Duration) -> Result<HoldOutcome, LinkError> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let generation = {
            let mut slot = self.slot.lock();
            let baseline = match slot.cancel.take() {
                Some(previous) => {
                    let _ = previous.send(());
                    slot.baseline
                }
                None => self.output.is_on(),
            };
            slot.baseline = baseline;
            slot.generation += 1;
            if let Err(err) = self.output.set(true) {
                let _ = self.output.set(baseline);
                return Err(err);
            }
            slot.cancel = Some(cancel_tx);
            slot.generation
        };

        tokio::select! {
            _ = sleep(duration) => {}
            _ = cancel_rx => return Ok(HoldOutcome::Preempted),
        }

        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return Ok(HoldOutcome::Preempted);
        }
        slot.cancel = None;
        self.output.set(slot.baseline)?;
        Ok(HoldOutcome::Completed)
    }

    /// End any running hold and drive the line low.
    pub fn release(&self) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.baseline = false;
        if let Some(cancel) = slot.cancel.take() {
            let _ = cancel.send(());
        }
        if let Err(err) = self.output.set(false) {
            warn!(error = %err, "releasing held line failed");
        }
    }
}
