//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Device coordination hub and its components."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! Tip identity record kept in the handpiece EEPROM.
//!
//! Every field lives at a fixed offset from a per-family base address:
//!
//! | offset | field                      |
//! |--------|----------------------------|
//! | +0     | tip type                   |
//! | +1..+2 | shot count, big-endian     |
//! | +9     | year - 2000                |
//! | +10    | month                      |
//! | +11    | day                        |
//! | +12    | manufacturer code          |

use std::fmt;
use std::time::Duration;

use mtr_common::{Classify, EepromConfig, ErrorKind};
use mtr_links::{I2cBus, I2cError};
use mtr_metrics::HubMetrics;
use mtr_msg::{EepromReport, EepromWriteRequest};
use mtr_resilience::{RetryExhausted, RetryPolicy};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

const TIP_TYPE: u8 = 0;
const SHOT_COUNT: u8 = 1;
const YEAR: u8 = 9;
const MONTH: u8 = 10;
const DAY: u8 = 11;
const MAKER: u8 = 12;

const YEAR_BASE: u16 = 2000;
const YEAR_MAX: u16 = YEAR_BASE + u8::MAX as u16;
const YEAR_BUSINESS_MAX: u16 = 2099;

/// Where a device family keeps its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EepromLayout {
    /// 7-bit I2C device address.
    pub address: u8,
    /// Offset of the first field.
    pub base: u8,
    /// Device family.
    pub mtr_version: &'static str,
    /// Distribution region, `ALL` when the family has a single map.
    pub country: &'static str,
}

impl EepromLayout {
    /// MTR 2.0 sold through Classys.
    pub const MTR20_CLASSYS: Self = Self {
        address: 0x50,
        base: 0x10,
        mtr_version: "2.0",
        country: "CLASSYS",
    };

    /// MTR 2.0 sold through Cutera.
    pub const MTR20_CUTERA: Self = Self {
        address: 0x50,
        base: 0x80,
        mtr_version: "2.0",
        country: "CUTERA",
    };

    /// MTR 4.0, every region.
    pub const MTR40: Self = Self {
        address: 0x51,
        base: 0x70,
        mtr_version: "4.0",
        country: "ALL",
    };

    /// Pick the layout for a family and region.
    ///
    /// Family 4.0 ignores the region. For family 2.0 only `CUTERA` selects
    /// the Cutera map; anything else, including no region, reads the Classys
    /// map.
    pub fn select(mtr_version: &str, country: Option<&str>) -> Result<Self, StoreError> {
        match mtr_version {
            "4.0" => Ok(Self::MTR40),
            "2.0" => match country {
                Some("CUTERA") => Ok(Self::MTR20_CUTERA),
                _ => Ok(Self::MTR20_CLASSYS),
            },
            other => Err(StoreError::UnknownLayout(other.to_owned())),
        }
    }

    fn at(&self, field: u8) -> u8 {
        self.base.wrapping_add(field)
    }

    fn label(&self) -> String {
        if self.mtr_version == "4.0" {
            format!("MTR {}", self.mtr_version)
        } else {
            format!("MTR {} {}", self.mtr_version, self.country)
        }
    }
}

impl fmt::Display for EepromLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (0x{:02X}+0x{:02X})",
            self.label(),
            self.address,
            self.base
        )
    }
}

/// Decoded tip record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EepromRecord {
    pub tip_type: u8,
    pub shot_count: u16,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub maker: u8,
}

impl EepromRecord {
    /// Check the date before it is written.
    ///
    /// Years up to 2255 fit the one-byte offset and are accepted; anything
    /// past 2099 is logged since no device should carry such a date.
    pub fn validate(&self) -> Result<(), StoreError> {
        if !(YEAR_BASE..=YEAR_MAX).contains(&self.year) {
            return Err(StoreError::InvalidRecord(format!(
                "year {} outside {}..={}",
                self.year, YEAR_BASE, YEAR_MAX
            )));
        }
        if !(1..=12).contains(&self.month) {
            return Err(StoreError::InvalidRecord(format!(
                "month {} outside 1..=12",
                self.month
            )));
        }
        if !(1..=31).contains(&self.day) {
            return Err(StoreError::InvalidRecord(format!(
                "day {} outside 1..=31",
                self.day
            )));
        }
        if self.year > YEAR_BUSINESS_MAX {
            warn!(year = self.year, "manufacture year beyond 2099");
        }
        Ok(())
    }

    /// Client view of the record read through `layout`.
    pub fn report(&self, layout: &EepromLayout) -> EepromReport {
        EepromReport {
            tip_type: self.tip_type,
            shot_count: self.shot_count,
            year: self.year,
            month: self.month,
            day: self.day,
            maker_code: self.maker,
            mtr_version: layout.mtr_version.to_owned(),
            country: layout.country.to_owned(),
        }
    }
}

impl From<&EepromWriteRequest> for EepromRecord {
    fn from(request: &EepromWriteRequest) -> Self {
        Self {
            tip_type: request.tip_type,
            shot_count: request.shot_count,
            year: request.year,
            month: request.month,
            day: request.day,
            maker: request.maker_code,
        }
    }
}

/// Failures of EEPROM transactions.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("eeprom unavailable")]
    Unavailable,
    #[error("unknown mtrVersion {0:?}")]
    UnknownLayout(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("shot count already at {}", u16::MAX)]
    ShotCountOverflow,
    #[error("eeprom {op} failed: {source}")]
    Exhausted {
        op: &'static str,
        #[source]
        source: RetryExhausted<I2cError>,
    },
    #[error("read-back mismatch: wrote {expected:?}, read {found:?}")]
    ReadBackMismatch {
        expected: EepromRecord,
        found: EepromRecord,
    },
}

impl StoreError {
    /// Label of the I2C failure behind an exhausted retry.
    pub fn i2c_label(&self) -> Option<&'static str> {
        match self {
            StoreError::Exhausted { source, .. } => Some(source.last.label()),
            _ => None,
        }
    }
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Unavailable => ErrorKind::LinkUnavailable,
            StoreError::UnknownLayout(_) | StoreError::InvalidRecord(_) => {
                ErrorKind::ProtocolError
            }
            StoreError::ShotCountOverflow | StoreError::ReadBackMismatch { .. } => {
                ErrorKind::TransactionFailure
            }
            StoreError::Exhausted { source, .. } => source.kind(),
        }
    }
}

/// Serialized, retrying access to the tip record.
///
/// One lock covers the whole bus: a read, a write, or a composite increment
/// runs to completion before the next transaction starts.
pub struct EepromStore {
    bus: Option<Mutex<Box<dyn I2cBus>>>,
    policy: RetryPolicy,
    write_cycle: Duration,
    metrics: Option<HubMetrics>,
}

impl EepromStore {
    pub fn new(
        bus: Option<Box<dyn I2cBus>>,
        config: &EepromConfig,
        metrics: Option<HubMetrics>,
    ) -> Self {
        if bus.is_none() {
            warn!(bus = config.i2c_bus, "no i2c bus available; eeprom commands will fail");
        }
        Self {
            bus: bus.map(Mutex::new),
            policy: RetryPolicy::new(config.attempts, config.retry_backoff)
                .with_jitter(config.retry_jitter),
            write_cycle: config.write_cycle,
            metrics,
        }
    }

    pub fn is_available(&self) -> bool {
        self.bus.is_some()
    }

    /// Read the record at `layout`.
    pub async fn read(&self, layout: EepromLayout) -> Result<EepromRecord, StoreError> {
        let mut bus = self.lock().await?;
        let record = self.read_locked(&mut **bus, layout).await?;
        info!(layout = %layout, shot_count = record.shot_count, "eeprom read");
        Ok(record)
    }

    /// Write `record`. The caller decides whether to read it back.
    pub async fn write(&self, layout: EepromLayout, record: EepromRecord) -> Result<(), StoreError> {
        record.validate()?;
        let mut bus = self.lock().await?;
        self.write_locked(&mut **bus, layout, record).await?;
        info!(layout = %layout, shot_count = record.shot_count, "eeprom written");
        Ok(())
    }

    /// Add one shot to the stored count and confirm it by reading back.
    pub async fn increment_shot_count(
        &self,
        layout: EepromLayout,
    ) -> Result<EepromRecord, StoreError> {
        let mut bus = self.lock().await?;
        let current = self.read_locked(&mut **bus, layout).await?;
        let shot_count = current
            .shot_count
            .checked_add(1)
            .ok_or(StoreError::ShotCountOverflow)
            .inspect_err(|_| self.record_failure("increment"))?;
        let updated = EepromRecord {
            shot_count,
            ..current
        };
        self.write_locked(&mut **bus, layout, updated).await?;
        let confirmed = self.read_locked(&mut **bus, layout).await?;
        if confirmed != updated {
            self.record_failure("increment");
            return Err(StoreError::ReadBackMismatch {
                expected: updated,
                found: confirmed,
            });
        }
        info!(layout = %layout, shot_count, "shot count incremented");
        Ok(confirmed)
    }

    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, Box<dyn I2cBus>>, StoreError> {
        match &self.bus {
            Some(bus) => Ok(bus.lock().await),
            None => Err(StoreError::Unavailable),
        }
    }

    async fn read_locked(
        &self,
        bus: &mut dyn I2cBus,
        layout: EepromLayout,
    ) -> Result<EepromRecord, StoreError> {
        let outcome = self
            .policy
            .run_with("eeprom_read", bus, |bus, _| {
                Box::pin(async move { read_record(bus, layout) })
            })
            .await;
        self.settle("read", outcome)
    }

    async fn write_locked(
        &self,
        bus: &mut dyn I2cBus,
        layout: EepromLayout,
        record: EepromRecord,
    ) -> Result<(), StoreError> {
        let write_cycle = self.write_cycle;
        let outcome = self
            .policy
            .run_with("eeprom_write", bus, |bus, _| {
                Box::pin(write_record(bus, layout, record, write_cycle))
            })
            .await;
        self.settle("write", outcome)
    }

    fn settle<T>(
        &self,
        op: &'static str,
        outcome: Result<mtr_resilience::Succeeded<T>, RetryExhausted<I2cError>>,
    ) -> Result<T, StoreError> {
        match outcome {
            Ok(done) => {
                if let Some(metrics) = &self.metrics {
                    metrics.eeprom_retried(done.retries());
                }
                Ok(done.value)
            }
            Err(source) => {
                if let Some(metrics) = &self.metrics {
                    metrics.eeprom_retried(source.attempts.saturating_sub(1));
                }
                self.record_failure(op);
                Err(StoreError::Exhausted { op, source })
            }
        }
    }

    fn record_failure(&self, op: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.eeprom_failed(op);
        }
    }
}

impl fmt::Debug for EepromStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EepromStore")
            .field("available", &self.is_available())
            .field("policy", &self.policy)
            .finish()
    }
}

fn read_record(bus: &mut dyn I2cBus, layout: EepromLayout) -> Result<EepromRecord, I2cError> {
    let address = layout.address;
    let tip_type = bus.read_byte(address, layout.at(TIP_TYPE))?;
    let shot = bus.read_block(address, layout.at(SHOT_COUNT), 2)?;
    if shot.len() != 2 {
        return Err(I2cError::ShortRead {
            expected: 2,
            got: shot.len(),
        });
    }
    let year_offset = bus.read_byte(address, layout.at(YEAR))?;
    let month = bus.read_byte(address, layout.at(MONTH))?;
    let day = bus.read_byte(address, layout.at(DAY))?;
    let maker = bus.read_byte(address, layout.at(MAKER))?;
    Ok(EepromRecord {
        tip_type,
        shot_count: u16::from_be_bytes([shot[0], shot[1]]),
        year: YEAR_BASE + u16::from(year_offset),
        month,
        day,
        maker,
    })
}

async fn write_record(
    bus: &mut dyn I2cBus,
    layout: EepromLayout,
    record: EepromRecord,
    write_cycle: Duration,
) -> Result<(), I2cError> {
    let [shot_hi, shot_lo] = record.shot_count.to_be_bytes();
    // validate() keeps the year within one byte of the base.
    let year_offset = (record.year - YEAR_BASE) as u8;
    let sequence = [
        (TIP_TYPE, record.tip_type),
        (SHOT_COUNT, shot_hi),
        (SHOT_COUNT + 1, shot_lo),
        (YEAR, year_offset),
        (MONTH, record.month),
        (DAY, record.day),
        (MAKER, record.maker),
    ];
    for (field, value) in sequence {
        bus.write_byte(layout.address, layout.at(field), value)?;
        sleep(write_cycle).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtr_links::sim::{I2cOp, SimI2cBus};

    fn store_with(bus: &SimI2cBus) -> EepromStore {
        let config = EepromConfig {
            retry_backoff: Duration::from_millis(1),
            write_cycle: Duration::from_millis(1),
            ..EepromConfig::default()
        };
        EepromStore::new(Some(Box::new(bus.clone())), &config, None)
    }

    fn sample() -> EepromRecord {
        EepromRecord {
            tip_type: 4,
            shot_count: 1234,
            year: 2024,
            month: 6,
            day: 30,
            maker: 2,
        }
    }

    #[test]
    fn layouts_follow_family_and_region() {
        assert_eq!(EepromLayout::select("2.0", None).unwrap(), EepromLayout::MTR20_CLASSYS);
        assert_eq!(
            EepromLayout::select("2.0", Some("CUTERA")).unwrap(),
            EepromLayout::MTR20_CUTERA
        );
        assert_eq!(
            EepromLayout::select("4.0", Some("CUTERA")).unwrap(),
            EepromLayout::MTR40
        );
        assert!(matches!(
            EepromLayout::select("3.0", None),
            Err(StoreError::UnknownLayout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn round_trip_on_every_layout() {
        let bus = SimI2cBus::with_devices(&[0x50, 0x51]);
        let store = store_with(&bus);
        for layout in [
            EepromLayout::MTR20_CLASSYS,
            EepromLayout::MTR20_CUTERA,
            EepromLayout::MTR40,
        ] {
            for record in [
                sample(),
                EepromRecord {
                    tip_type: 0,
                    shot_count: 0,
                    year: 2000,
                    month: 1,
                    day: 1,
                    maker: 0,
                },
                EepromRecord {
                    tip_type: 255,
                    shot_count: u16::MAX,
                    year: 2255,
                    month: 12,
                    day: 31,
                    maker: 255,
                },
            ] {
                store.write(layout, record).await.unwrap();
                assert_eq!(store.read(layout).await.unwrap(), record);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn write_uses_documented_offsets_in_order() {
        let bus = SimI2cBus::with_devices(&[0x50]);
        let store = store_with(&bus);
        store.write(EepromLayout::MTR20_CUTERA, sample()).await.unwrap();

        let writes: Vec<(u8, Vec<u8>)> = bus
            .journal()
            .into_iter()
            .filter_map(|op| match op {
                I2cOp::Write { offset, data, .. } => Some((offset, data)),
                I2cOp::Read { .. } => None,
            })
            .collect();
        assert_eq!(
            writes,
            vec![
                (0x80, vec![4]),
                (0x81, vec![0x04]),
                (0x82, vec![0xD2]),
                (0x89, vec![24]),
                (0x8A, vec![6]),
                (0x8B, vec![30]),
                (0x8C, vec![2]),
            ]
        );
        assert_eq!(bus.peek(0x50, 0x81, 2), Some(vec![0x04, 0xD2]));
    }

    #[tokio::test(start_paused = true)]
    async fn write_does_not_read_back() {
        let bus = SimI2cBus::with_devices(&[0x50]);
        let store = store_with(&bus);
        bus.set_fail_reads(true);
        store.write(EepromLayout::MTR20_CLASSYS, sample()).await.unwrap();
        assert!(bus.journal().iter().all(I2cOp::is_write));
        assert_eq!(bus.peek(0x50, 0x10, 3), Some(vec![4, 0x04, 0xD2]));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_faults_are_retried() {
        let bus = SimI2cBus::with_devices(&[0x51]);
        let store = store_with(&bus);
        store.write(EepromLayout::MTR40, sample()).await.unwrap();
        bus.fail_next(2);
        assert_eq!(store.read(EepromLayout::MTR40).await.unwrap(), sample());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_i2c_label() {
        let bus = SimI2cBus::with_devices(&[0x50]);
        let store = store_with(&bus);
        let err = store.read(EepromLayout::MTR40).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(err.i2c_label(), Some("nack"));
        let attempts = bus.journal().len();
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_dates_are_rejected_before_touching_the_bus() {
        let bus = SimI2cBus::with_devices(&[0x50]);
        let store = store_with(&bus);
        for record in [
            EepromRecord { year: 1999, ..sample() },
            EepromRecord { year: 2256, ..sample() },
            EepromRecord { month: 0, ..sample() },
            EepromRecord { month: 13, ..sample() },
            EepromRecord { day: 0, ..sample() },
            EepromRecord { day: 32, ..sample() },
        ] {
            let err = store
                .write(EepromLayout::MTR20_CLASSYS, record)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ProtocolError);
        }
        assert!(bus.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn increment_adds_one_and_keeps_other_fields() {
        let bus = SimI2cBus::with_devices(&[0x50]);
        let store = store_with(&bus);
        store.write(EepromLayout::MTR20_CLASSYS, sample()).await.unwrap();
        let updated = store
            .increment_shot_count(EepromLayout::MTR20_CLASSYS)
            .await
            .unwrap();
        assert_eq!(
            updated,
            EepromRecord {
                shot_count: 1235,
                ..sample()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn increment_at_maximum_overflows() {
        let bus = SimI2cBus::with_devices(&[0x50]);
        let store = store_with(&bus);
        store
            .write(
                EepromLayout::MTR20_CLASSYS,
                EepromRecord {
                    shot_count: u16::MAX,
                    ..sample()
                },
            )
            .await
            .unwrap();
        bus.clear_journal();
        let err = store
            .increment_shot_count(EepromLayout::MTR20_CLASSYS)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ShotCountOverflow));
        assert!(bus.journal().iter().all(|op| !op.is_write()));
    }

    #[test]
    fn retry_policy_follows_config() {
        let config = EepromConfig {
            attempts: 5,
            retry_backoff: Duration::from_millis(40),
            retry_jitter: Duration::from_millis(15),
            ..EepromConfig::default()
        };
        let store = EepromStore::new(None, &config, None);
        assert_eq!(store.policy.max_attempts, 5);
        assert_eq!(store.policy.backoff, Duration::from_millis(40));
        assert_eq!(store.policy.jitter, Duration::from_millis(15));
    }

    #[tokio::test]
    async fn missing_bus_is_unavailable() {
        let store = EepromStore::new(None, &EepromConfig::default(), None);
        let err = store.read(EepromLayout::MTR40).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinkUnavailable);
    }
}
