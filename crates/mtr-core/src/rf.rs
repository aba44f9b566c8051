//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Device coordination hub and its components."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! RF generator link: frame exchange over the serial port.
//!
//! The port is opened once at start. A failed open or setup leaves the link
//! disconnected for the rest of the run; it is never reopened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mtr_common::{Classify, ErrorKind, RfConfig};
use mtr_links::{LinkError, SerialPort};
use mtr_metrics::HubMetrics;
use mtr_msg::{FrameError, Outcome, RfFrame, RfQuery, ShotError, ShotParams};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RfError {
    #[error("rf link not connected")]
    NotConnected,
    #[error("rf write failed: {0}")]
    Link(#[from] LinkError),
    #[error("invalid shot: {0}")]
    Shot(#[from] ShotError),
}

impl Classify for RfError {
    fn kind(&self) -> ErrorKind {
        match self {
            RfError::NotConnected => ErrorKind::LinkUnavailable,
            RfError::Link(err) => err.kind(),
            RfError::Shot(err) => err.kind(),
        }
    }
}

/// A frame written and whatever the module answered within the window.
#[derive(Debug, Clone)]
pub struct RfExchange {
    pub sent: RfFrame,
    pub response: Vec<u8>,
    pub decoded: Option<Result<RfFrame, FrameError>>,
}

impl RfExchange {
    fn outcome(&self, message: String) -> Outcome {
        let mut outcome = Outcome::ok(message).with_frame(self.sent.to_hex());
        if !self.response.is_empty() {
            outcome = outcome.with_response(hex::encode_upper(&self.response));
        }
        match &self.decoded {
            Some(Err(err)) => outcome.with_response_error(err.to_string()),
            _ => outcome,
        }
    }
}

pub struct RfLink {
    port: Option<Mutex<Box<dyn SerialPort>>>,
    connected: AtomicBool,
    response_window: Duration,
    send_setup_frame: bool,
    metrics: Option<HubMetrics>,
}

impl RfLink {
    pub fn new(
        port: Option<Box<dyn SerialPort>>,
        config: &RfConfig,
        metrics: Option<HubMetrics>,
    ) -> Self {
        let port = if config.enabled { port } else { None };
        if port.is_none() {
            warn!(port = %config.port, enabled = config.enabled, "rf port unavailable");
        }
        Self {
            port: port.map(Mutex::new),
            connected: AtomicBool::new(false),
            response_window: config.response_window,
            send_setup_frame: config.send_setup_frame,
            metrics,
        }
    }

    /// Bring the link up, sending the output-setup frame when configured.
    pub async fn open(&self) -> bool {
        if self.port.is_none() {
            return false;
        }
        let ready = if self.send_setup_frame {
            match self.exchange(RfFrame::output_setup()).await {
                Ok(_) => true,
                Err(err) => {
                    warn!(error = %err, "rf output setup failed; link stays down");
                    false
                }
            }
        } else {
            true
        };
        self.connected.store(ready, Ordering::SeqCst);
        if ready {
            info!("rf link open");
        }
        ready
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Write `frame` and collect the answer.
    pub async fn send(&self, frame: RfFrame) -> Result<RfExchange, RfError> {
        if !self.is_connected() {
            return Err(RfError::NotConnected);
        }
        self.exchange(frame).await
    }

    /// Fire one 1 MHz shot.
    pub async fn shot(&self, intensity: u32, rf_time: u32) -> Outcome {
        let frame = match RfFrame::shot(&ShotParams::one_mhz(intensity, rf_time)) {
            Ok(frame) => frame,
            Err(err) => return Outcome::from_error(&RfError::from(err)),
        };
        match self.send(frame).await {
            Ok(exchange) => exchange.outcome(format!("RF shot sent: {intensity}%, {rf_time} ms")),
            Err(err) => Outcome::from_error(&err),
        }
    }

    pub async fn query(&self, query: RfQuery) -> Outcome {
        match self.send(RfFrame::query(query)).await {
            Ok(exchange) => exchange.outcome(format!("RF {} query sent", query.as_str())),
            Err(err) => Outcome::from_error(&err),
        }
    }

    /// Close the port. The link stays down afterwards.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(port) = &self.port {
            port.lock().await.close();
            info!("rf port closed");
        }
    }

    async fn exchange(&self, frame: RfFrame) -> Result<RfExchange, RfError> {
        let port = self.port.as_ref().ok_or(RfError::NotConnected)?;
        let mut port = port.lock().await;
        port.write_all(frame.as_bytes())?;
        if let Some(metrics) = &self.metrics {
            metrics.rf_frame(frame.command());
        }
        debug!(frame = %frame, "rf frame sent");
        sleep(self.response_window).await;
        let response = match port.read_available() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "rf response read failed");
                Vec::new()
            }
        };
        drop(port);

        let decoded = if response.is_empty() {
            None
        } else {
            let decoded = RfFrame::decode(&response);
            match &decoded {
                Ok(reply) => info!(
                    response = %hex::encode_upper(&response),
                    command = reply.command(),
                    "rf response"
                ),
                Err(err) => warn!(
                    response = %hex::encode_upper(&response),
                    error = %err,
                    "rf response failed validation"
                ),
            }
            Some(decoded)
        };
        Ok(RfExchange {
            sent: frame,
            response,
            decoded,
        })
    }
}

impl std::fmt::Debug for RfLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RfLink")
            .field("connected", &self.is_connected())
            .field("response_window", &self.response_window)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtr_links::sim::SimSerialPort;

    fn link(port: &SimSerialPort) -> RfLink {
        RfLink::new(Some(Box::new(port.clone())), &RfConfig::default(), None)
    }

    #[tokio::test(start_paused = true)]
    async fn open_sends_output_setup() {
        let port = SimSerialPort::echoing();
        let rf = link(&port);
        assert!(rf.open().await);
        assert_eq!(port.written(), vec![hex::decode("020901430100014903").unwrap()]);
    }

    #[tokio::test(start_paused = true)]
    async fn shot_reports_frame_and_echo() {
        let port = SimSerialPort::echoing();
        let rf = link(&port);
        rf.open().await;
        let outcome = rf.shot(50, 60).await;
        assert!(outcome.success);
        assert_eq!(outcome.frame.as_deref(), Some("020F01440032025800000000002003"));
        assert_eq!(outcome.response, outcome.frame);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_reply_is_still_returned() {
        let port = SimSerialPort::new();
        let rf = link(&port);
        rf.open().await;
        port.push_reply(&[0x02, 0x07, 0x01]);
        let exchange = rf.send(RfFrame::firmware()).await.unwrap();
        assert_eq!(exchange.response, vec![0x02, 0x07, 0x01]);
        assert!(matches!(exchange.decoded, Some(Err(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn query_reply_flags_malformed_answer() {
        let port = SimSerialPort::new();
        let rf = link(&port);
        rf.open().await;
        port.push_reply(&[0x02, 0x07, 0x01]);
        let outcome = rf.query(RfQuery::Firmware).await;
        assert!(outcome.success);
        assert_eq!(outcome.response.as_deref(), Some("020701"));
        assert!(outcome.response_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn valid_answer_has_no_response_error() {
        let port = SimSerialPort::echoing();
        let rf = link(&port);
        rf.open().await;
        let outcome = rf.query(RfQuery::Status).await;
        assert!(outcome.response.is_some());
        assert_eq!(outcome.response_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_setup_keeps_link_down() {
        let port = SimSerialPort::new();
        port.set_fail_writes(true);
        let rf = link(&port);
        assert!(!rf.open().await);
        port.set_fail_writes(false);
        let outcome = rf.query(RfQuery::Status).await;
        assert!(!outcome.success);
        assert_eq!(outcome.kind, Some(ErrorKind::LinkUnavailable));
        assert!(port.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_shot_is_rejected() {
        let port = SimSerialPort::echoing();
        let rf = link(&port);
        rf.open().await;
        let outcome = rf.shot(50, 10_000).await;
        assert_eq!(outcome.kind, Some(ErrorKind::ProtocolError));
        assert_eq!(port.written().len(), 1);
    }

    #[tokio::test]
    async fn close_marks_link_down() {
        let port = SimSerialPort::echoing();
        let rf = RfLink::new(
            Some(Box::new(port.clone())),
            &RfConfig {
                send_setup_frame: false,
                ..RfConfig::default()
            },
            None,
        );
        assert!(rf.open().await);
        rf.close().await;
        assert!(!rf.is_connected());
        assert!(!port.is_open());
    }
}
