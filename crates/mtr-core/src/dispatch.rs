//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Device coordination hub and its components."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! Routes decoded client commands to the owning component.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mtr_common::{Classify, EepromConfig};
use mtr_links::{LinkError, SerialParams};
use mtr_metrics::HubMetrics;
use mtr_msg::{
    Command, ConnectParams, EepromResult, EepromWriteRequest, LayoutSelector, Outcome,
    ServerMessage,
};
use mtr_net::{CommandHandler, SessionId};
use tracing::{debug, warn};

use crate::eeprom::{EepromLayout, EepromRecord, EepromStore, StoreError};
use crate::gpio::{GpioBridge, HoldOutcome};
use crate::motor::MotorSupervisor;
use crate::rf::RfLink;

/// One handler per command; every command gets exactly one reply.
pub struct Dispatcher {
    motor: Arc<MotorSupervisor>,
    eeprom: Arc<EepromStore>,
    rf: Arc<RfLink>,
    gpio: Arc<GpioBridge>,
    default_mtr_version: String,
    default_country: String,
    metrics: Option<HubMetrics>,
}

impl Dispatcher {
    pub fn new(
        motor: Arc<MotorSupervisor>,
        eeprom: Arc<EepromStore>,
        rf: Arc<RfLink>,
        gpio: Arc<GpioBridge>,
        eeprom_config: &EepromConfig,
        metrics: Option<HubMetrics>,
    ) -> Self {
        Self {
            motor,
            eeprom,
            rf,
            gpio,
            default_mtr_version: eeprom_config.default_mtr_version.clone(),
            default_country: eeprom_config.default_country.clone(),
            metrics,
        }
    }

    /// Decode `text`, run it, and encode the reply.
    pub async fn handle_text(&self, session: SessionId, text: &str) -> ServerMessage {
        let command = match Command::decode(text) {
            Ok(command) => command,
            Err(err) => {
                warn!(%session, error = %err, "rejected client message");
                if let Some(metrics) = &self.metrics {
                    metrics.command_handled("invalid", false);
                }
                return ServerMessage::error(&err);
            }
        };
        let name = command.name();
        debug!(%session, cmd = name, "command received");
        let reply = self.dispatch(command).await;
        let success = succeeded(&reply);
        if !success {
            warn!(%session, cmd = name, reply = reply.type_name(), "command failed");
        }
        if let Some(metrics) = &self.metrics {
            metrics.command_handled(name, success);
        }
        reply
    }

    pub async fn dispatch(&self, command: Command) -> ServerMessage {
        match command {
            Command::Connect(params) => ServerMessage::Serial {
                result: link_outcome(self.motor.connect(serial_params(params)).await),
            },
            Command::Disconnect => ServerMessage::Serial {
                result: link_outcome(self.motor.disconnect().await),
            },
            Command::Move { position, mode } => ServerMessage::Serial {
                result: link_outcome(self.motor.move_to(position, &mode).await),
            },
            Command::EepromRead(selector) => ServerMessage::EepromRead {
                result: self.eeprom_read(&selector).await,
            },
            Command::EepromWrite(request) => ServerMessage::EepromWrite {
                result: self.eeprom_write(&request).await,
            },
            Command::ShotIncrement {
                mtr_version,
                country,
            } => {
                let selector = LayoutSelector {
                    mtr_version: mtr_version.unwrap_or_else(|| self.default_mtr_version.clone()),
                    country: country.or_else(|| Some(self.default_country.clone())),
                };
                ServerMessage::ShotIncrement {
                    result: self.shot_increment(&selector).await,
                }
            }
            Command::RfShot { intensity, rf_time } => ServerMessage::RfShot {
                result: self.rf.shot(intensity, rf_time).await,
            },
            Command::RfDtrHigh { rf_time } => ServerMessage::RfDtrHigh {
                result: self.rf_dtr_high(rf_time).await,
            },
            Command::RfQuery { query } => ServerMessage::RfQuery {
                result: self.rf.query(query).await,
            },
            Command::GetGpio17Status => self.gpio.gpio17_status(),
        }
    }

    async fn eeprom_read(&self, selector: &LayoutSelector) -> EepromResult {
        let outcome = async {
            let layout = select_layout(selector)?;
            let record = self.eeprom.read(layout).await?;
            Ok::<_, StoreError>(EepromResult::read(record.report(&layout)))
        }
        .await;
        outcome.unwrap_or_else(|err| eeprom_failure(&err))
    }

    async fn eeprom_write(&self, request: &EepromWriteRequest) -> EepromResult {
        let layout = match select_layout(&request.layout) {
            Ok(layout) => layout,
            Err(err) => return eeprom_failure(&err),
        };
        if let Err(err) = self.eeprom.write(layout, EepromRecord::from(request)).await {
            return eeprom_failure(&err);
        }
        // The bytes are committed; a failed read-back only drops `data`.
        let data = match self.eeprom.read(layout).await {
            Ok(record) => Some(EepromResult::read(record.report(&layout))),
            Err(err) => {
                warn!(layout = %layout, error = %err, "eeprom read-back after write failed");
                None
            }
        };
        EepromResult::written(format!("EEPROM written to {layout}"), data)
    }

    async fn shot_increment(&self, selector: &LayoutSelector) -> EepromResult {
        let outcome = async {
            let layout = select_layout(selector)?;
            let record = self.eeprom.increment_shot_count(layout).await?;
            let mut result = EepromResult::read(record.report(&layout));
            result.message = Some(format!("shot count now {}", record.shot_count));
            Ok::<_, StoreError>(result)
        }
        .await;
        outcome.unwrap_or_else(|err| eeprom_failure(&err))
    }

    async fn rf_dtr_high(&self, rf_time: u32) -> Outcome {
        match self
            .gpio
            .fire_hold(Duration::from_millis(u64::from(rf_time)))
            .await
        {
            Ok(HoldOutcome::Completed) => {
                Outcome::ok(format!("RF fire line held high for {rf_time} ms"))
            }
            Ok(HoldOutcome::Preempted) => {
                Outcome::ok(format!("RF fire line hold of {rf_time} ms preempted by a newer hold"))
            }
            Err(err) => Outcome::from_error(&err),
        }
    }
}

#[async_trait]
impl CommandHandler for Dispatcher {
    async fn handle(&self, session: SessionId, text: &str) -> String {
        self.handle_text(session, text).await.to_json()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("default_mtr_version", &self.default_mtr_version)
            .field("default_country", &self.default_country)
            .finish()
    }
}

fn serial_params(params: ConnectParams) -> SerialParams {
    SerialParams {
        port: params.port,
        baudrate: params.baudrate,
        parity: params.parity,
        databits: params.databits,
        stopbits: params.stopbits,
    }
}

fn select_layout(selector: &LayoutSelector) -> Result<EepromLayout, StoreError> {
    EepromLayout::select(&selector.mtr_version, selector.country.as_deref())
}

fn link_outcome(result: Result<String, LinkError>) -> Outcome {
    match result {
        Ok(message) => Outcome::ok(message),
        Err(err) => Outcome::from_error(&err),
    }
}

fn eeprom_failure(err: &StoreError) -> EepromResult {
    EepromResult::failed(err.kind(), err.to_string(), err.i2c_label())
}

fn succeeded(reply: &ServerMessage) -> bool {
    match reply {
        ServerMessage::Serial { result }
        | ServerMessage::RfShot { result }
        | ServerMessage::RfDtrHigh { result }
        | ServerMessage::RfQuery { result } => result.success,
        ServerMessage::EepromRead { result }
        | ServerMessage::EepromWrite { result }
        | ServerMessage::ShotIncrement { result } => result.success,
        ServerMessage::Error { .. } => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtr_common::{ErrorKind, GpioConfig, MotorConfig, RfConfig};
    use mtr_links::sim::SimulatedLinks;
    use serde_json::{json, Value};

    struct Fixture {
        links: SimulatedLinks,
        dispatcher: Dispatcher,
    }

    async fn fixture() -> Fixture {
        let links = SimulatedLinks::new();
        let set = links.link_set();
        let eeprom_config = EepromConfig {
            retry_backoff: Duration::from_millis(1),
            write_cycle: Duration::from_millis(1),
            ..EepromConfig::default()
        };
        let rf_config = RfConfig {
            response_window: Duration::from_millis(1),
            ..RfConfig::default()
        };
        let rf = Arc::new(RfLink::new(set.rf, &rf_config, None));
        rf.open().await;
        let dispatcher = Dispatcher::new(
            Arc::new(MotorSupervisor::new(set.motor, &MotorConfig::default(), None)),
            Arc::new(EepromStore::new(set.i2c, &eeprom_config, None)),
            rf,
            Arc::new(GpioBridge::start(set.gpio, &GpioConfig::default(), None)),
            &eeprom_config,
            None,
        );
        Fixture { links, dispatcher }
    }

    async fn roundtrip(fixture: &Fixture, request: Value) -> Value {
        let reply = fixture
            .dispatcher
            .handle_text(SessionId::from(1), &request.to_string())
            .await;
        serde_json::from_str(&reply.to_json()).unwrap()
    }

    #[tokio::test]
    async fn unknown_command_is_an_error_reply() {
        let fixture = fixture().await;
        let reply = roundtrip(&fixture, json!({"cmd": "bogus"})).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["kind"], "protocol_error");
    }

    #[tokio::test]
    async fn motor_commands_reply_with_serial() {
        let fixture = fixture().await;
        let reply = roundtrip(&fixture, json!({"cmd": "connect"})).await;
        assert_eq!(reply["type"], "serial");
        assert_eq!(reply["result"]["success"], true);

        let reply = roundtrip(&fixture, json!({"cmd": "move", "position": 300})).await;
        assert_eq!(reply["result"]["success"], true);
        assert_eq!(fixture.links.motor.moves(), vec![(300, "position".to_owned())]);

        fixture.links.motor.set_reachable(false);
        roundtrip(&fixture, json!({"cmd": "disconnect"})).await;
        let reply = roundtrip(&fixture, json!({"cmd": "connect", "port": "/dev/ttyUSB3"})).await;
        assert_eq!(reply["result"]["success"], false);
        assert_eq!(reply["result"]["kind"], "connect_failure");
    }

    #[tokio::test]
    async fn eeprom_write_returns_read_back() {
        let fixture = fixture().await;
        let reply = roundtrip(
            &fixture,
            json!({
                "cmd": "eeprom_write",
                "mtrVersion": "4.0",
                "tipType": 3,
                "shotCount": 10,
                "year": 2025,
                "month": 2,
                "day": 14,
                "makerCode": 1
            }),
        )
        .await;
        assert_eq!(reply["type"], "eeprom_write");
        assert_eq!(reply["result"]["success"], true);
        let data = &reply["result"]["data"];
        assert_eq!(data["tipType"], 3);
        assert_eq!(data["shotCount"], 10);
        assert_eq!(data["year"], 2025);
        assert_eq!(data["country"], "ALL");

        let reply = roundtrip(&fixture, json!({"cmd": "eeprom_read", "mtrVersion": "4.0"})).await;
        assert_eq!(reply["result"]["makerCode"], 1);
    }

    #[tokio::test]
    async fn eeprom_write_succeeds_when_read_back_fails() {
        let fixture = fixture().await;
        fixture.links.i2c.set_fail_reads(true);
        let reply = roundtrip(
            &fixture,
            json!({
                "cmd": "eeprom_write",
                "tipType": 7,
                "shotCount": 5,
                "year": 2024,
                "month": 3,
                "day": 4,
                "makerCode": 2
            }),
        )
        .await;
        assert_eq!(reply["result"]["success"], true);
        assert!(reply["result"].get("data").is_none());
        assert!(reply["result"].get("error").is_none());
        assert_eq!(fixture.links.i2c.peek(0x50, 0x10, 3), Some(vec![7, 0, 5]));
    }

    #[tokio::test]
    async fn shot_increment_uses_configured_layout() {
        let fixture = fixture().await;
        roundtrip(
            &fixture,
            json!({
                "cmd": "eeprom_write",
                "tipType": 1,
                "shotCount": 41,
                "year": 2024,
                "month": 1,
                "day": 2,
                "makerCode": 9
            }),
        )
        .await;
        let reply = roundtrip(&fixture, json!({"cmd": "shot_increment"})).await;
        assert_eq!(reply["type"], "shot_increment");
        assert_eq!(reply["result"]["shotCount"], 42);
        assert_eq!(reply["result"]["country"], "CLASSYS");
    }

    #[tokio::test]
    async fn eeprom_failures_carry_kind_and_bus_label() {
        let fixture = fixture().await;
        fixture.links.i2c.fail_next(3);
        let reply = roundtrip(&fixture, json!({"cmd": "eeprom_read"})).await;
        assert_eq!(reply["result"]["success"], false);
        assert_eq!(reply["result"]["kind"], "retry_exhausted");
        assert_eq!(reply["result"]["i2c"], "bus");

        let reply = roundtrip(&fixture, json!({"cmd": "eeprom_read", "mtrVersion": "9.9"})).await;
        assert_eq!(reply["result"]["kind"], ErrorKind::ProtocolError.as_str());
    }

    #[tokio::test]
    async fn rf_commands_report_frames() {
        let fixture = fixture().await;
        let reply = roundtrip(&fixture, json!({"cmd": "rf_shot"})).await;
        assert_eq!(reply["type"], "rf_shot");
        assert_eq!(reply["result"]["frame"], "020F01440032025800000000002003");

        let reply = roundtrip(&fixture, json!({"cmd": "rf_query", "query": "firmware"})).await;
        assert_eq!(reply["result"]["frame"], "02070142004603");
        assert!(reply["result"].get("response_error").is_none());

        let reply = roundtrip(&fixture, json!({"cmd": "rf_shot", "intensity": 101})).await;
        assert_eq!(reply["type"], "error");
    }

    #[tokio::test]
    async fn rf_dtr_high_pulses_the_fire_line() {
        let fixture = fixture().await;
        let reply = roundtrip(&fixture, json!({"cmd": "rf_dtr_high", "rf_time": 5})).await;
        assert_eq!(reply["type"], "rf_dtr_high");
        assert_eq!(reply["result"]["success"], true);
        assert_eq!(
            fixture.links.gpio.output_pin(0).history(),
            vec![false, true, false]
        );
    }

    #[tokio::test]
    async fn gpio17_status_reflects_the_line() {
        let fixture = fixture().await;
        fixture.links.gpio.input_pin(17).drive(mtr_links::Level::High);
        let reply = roundtrip(&fixture, json!({"cmd": "get_gpio17_status"})).await;
        assert_eq!(reply["type"], "gpio17_status");
        assert_eq!(reply["gpio17"], "HIGH");
    }
}
