//! Latest-value sensor store. Telemetry lands here; the evaluator and the
//! query surface read from it synchronously.

use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use crate::error::{PlantError, Result};

pub const STATE_UNKNOWN: &str = "unknown";
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// Readings older than this read as unavailable unless configured otherwise.
pub const DEFAULT_STALE_AFTER: Duration = Duration::minutes(30);

pub type SharedSensors = Arc<RwLock<SensorStore>>;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Current value of a sensor as reported by its source.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Unknown,
    Unavailable,
    Raw(String),
}

impl SensorValue {
    /// Map a reported state string onto a value. Empty strings and the
    /// `unknown`/`unavailable` sentinels carry no reading.
    pub fn from_state(state: &str) -> Self {
        let s = state.trim();
        if s.is_empty() || s.eq_ignore_ascii_case(STATE_UNKNOWN) {
            Self::Unknown
        } else if s.eq_ignore_ascii_case(STATE_UNAVAILABLE) {
            Self::Unavailable
        } else {
            Self::Raw(s.to_string())
        }
    }

    pub fn from_number(v: f64) -> Self {
        Self::Raw(v.to_string())
    }

    /// Parse a present value. `Ok(None)` for absent values, an error for a
    /// present value that is not a finite number.
    pub fn as_number(&self, sensor_id: &str) -> Result<Option<f64>> {
        match self {
            Self::Unknown | Self::Unavailable => Ok(None),
            Self::Raw(s) => match s.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Some(v)),
                _ => Err(PlantError::MalformedReading {
                    sensor: sensor_id.to_string(),
                    value: s.clone(),
                }),
            },
        }
    }

    pub fn as_state(&self) -> &str {
        match self {
            Self::Unknown => STATE_UNKNOWN,
            Self::Unavailable => STATE_UNAVAILABLE,
            Self::Raw(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    pub value: SensorValue,
    pub unit: Option<String>,
    pub icon: Option<String>,
    /// Accumulated value of the previous period, for integrating sensors.
    pub last_period: Option<f64>,
    /// When the source measured the value. `None` never goes stale.
    pub updated_at: Option<OffsetDateTime>,
}

impl SensorSnapshot {
    pub fn new(value: SensorValue) -> Self {
        Self {
            value,
            unit: None,
            icon: None,
            last_period: None,
            updated_at: None,
        }
    }

    pub fn is_stale(&self, stale_after: Duration, now: OffsetDateTime) -> bool {
        self.updated_at.is_some_and(|at| now - at > stale_after)
    }
}

// ---------------------------------------------------------------------------
// Reader trait + in-memory store
// ---------------------------------------------------------------------------

/// Synchronous, non-blocking access to the latest sensor values.
pub trait SensorReader {
    /// `None` when the sensor is not known at all.
    fn read(&self, sensor_id: &str) -> Option<SensorSnapshot>;

    fn contains(&self, sensor_id: &str) -> bool {
        self.read(sensor_id).is_some()
    }
}

#[derive(Debug)]
pub struct SensorStore {
    sensors: HashMap<String, SensorSnapshot>,
    /// `None` keeps readings present forever.
    stale_after: Option<Duration>,
}

impl Default for SensorStore {
    fn default() -> Self {
        Self::with_stale_after(Some(DEFAULT_STALE_AFTER))
    }
}

impl SensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stale_after(stale_after: Option<Duration>) -> Self {
        Self {
            sensors: HashMap::new(),
            stale_after,
        }
    }

    /// Read `sensor_id` as of `now`. A stale reading keeps its unit and icon
    /// but carries no value.
    pub fn read_at(&self, sensor_id: &str, now: OffsetDateTime) -> Option<SensorSnapshot> {
        let snapshot = self.sensors.get(sensor_id)?;
        match self.stale_after {
            Some(limit) if snapshot.is_stale(limit, now) => Some(SensorSnapshot {
                value: SensorValue::Unavailable,
                last_period: None,
                ..snapshot.clone()
            }),
            _ => Some(snapshot.clone()),
        }
    }

    pub fn update(&mut self, sensor_id: &str, snapshot: SensorSnapshot) {
        self.sensors.insert(sensor_id.to_string(), snapshot);
    }

    pub fn remove(&mut self, sensor_id: &str) -> Option<SensorSnapshot> {
        self.sensors.remove(sensor_id)
    }
}

impl SensorReader for SensorStore {
    fn read(&self, sensor_id: &str) -> Option<SensorSnapshot> {
        self.read_at(sensor_id, OffsetDateTime::now_utc())
    }

    fn contains(&self, sensor_id: &str) -> bool {
        self.sensors.contains_key(sensor_id)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn measured(state: &str, at: OffsetDateTime) -> SensorSnapshot {
        SensorSnapshot {
            updated_at: Some(at),
            ..SensorSnapshot::new(SensorValue::from_state(state))
        }
    }

    #[test]
    fn from_state_maps_sentinels() {
        assert_eq!(SensorValue::from_state("unknown"), SensorValue::Unknown);
        assert_eq!(SensorValue::from_state("UNAVAILABLE"), SensorValue::Unavailable);
        assert_eq!(SensorValue::from_state("  "), SensorValue::Unknown);
        assert_eq!(SensorValue::from_state(" 21.5 "), SensorValue::Raw("21.5".into()));
    }

    #[test]
    fn as_number_absent_is_none() {
        assert_eq!(SensorValue::Unknown.as_number("s"), Ok(None));
        assert_eq!(SensorValue::Unavailable.as_number("s"), Ok(None));
    }

    #[test]
    fn as_number_parses_present_value() {
        assert_eq!(SensorValue::Raw("42".into()).as_number("s"), Ok(Some(42.0)));
        assert_eq!(SensorValue::Raw("-3.25".into()).as_number("s"), Ok(Some(-3.25)));
    }

    #[test]
    fn as_number_rejects_garbage() {
        let err = SensorValue::Raw("wet".into()).as_number("node-a/m1").unwrap_err();
        assert_eq!(
            err,
            PlantError::MalformedReading {
                sensor: "node-a/m1".into(),
                value: "wet".into(),
            }
        );
    }

    #[test]
    fn as_number_rejects_nan() {
        assert!(SensorValue::Raw("NaN".into()).as_number("s").is_err());
    }

    #[test]
    fn store_reads_latest_value() {
        let mut store = SensorStore::new();
        assert!(store.read("a").is_none());
        store.update("a", SensorSnapshot::new(SensorValue::from_number(1.0)));
        store.update("a", SensorSnapshot::new(SensorValue::from_number(2.0)));
        assert_eq!(store.read("a").unwrap().value, SensorValue::Raw("2".into()));
        assert!(store.contains("a"));
        store.remove("a");
        assert!(!store.contains("a"));
    }

    #[test]
    fn stale_reading_reads_unavailable() {
        let mut store = SensorStore::with_stale_after(Some(Duration::minutes(30)));
        let mut snapshot = measured("15", datetime!(2026-06-01 12:00 UTC));
        snapshot.unit = Some("%".into());
        snapshot.last_period = Some(4.2);
        store.update("a", snapshot);

        let fresh = store.read_at("a", datetime!(2026-06-01 12:30 UTC)).unwrap();
        assert_eq!(fresh.value, SensorValue::Raw("15".into()));

        let stale = store.read_at("a", datetime!(2026-06-01 12:31 UTC)).unwrap();
        assert_eq!(stale.value, SensorValue::Unavailable);
        assert_eq!(stale.last_period, None);
        assert_eq!(stale.unit.as_deref(), Some("%"));
        assert!(store.contains("a"));
    }

    #[test]
    fn unstamped_or_unlimited_readings_never_expire() {
        let mut store = SensorStore::new();
        store.update("derived", SensorSnapshot::new(SensorValue::from_number(1.0)));
        assert_eq!(
            store.read("derived").unwrap().value,
            SensorValue::Raw("1".into())
        );

        let mut store = SensorStore::with_stale_after(None);
        store.update("old", measured("7", datetime!(2000-01-01 00:00 UTC)));
        assert_eq!(store.read("old").unwrap().value, SensorValue::Raw("7".into()));
    }

    #[test]
    fn default_store_expires_old_readings() {
        let mut store = SensorStore::new();
        store.update("old", measured("7", datetime!(2000-01-01 00:00 UTC)));
        assert_eq!(store.read("old").unwrap().value, SensorValue::Unavailable);
    }
}
