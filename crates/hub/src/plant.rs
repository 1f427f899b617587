//! The plant device: configuration for up to six monitored metrics, their last
//! computed statuses, and the aggregate plant state.
//!
//! A device is built in three steps (`add_thresholds`, `add_sensors`,
//! `add_dli`). Once every threshold and the DLI sensor are attached it latches
//! `complete`; until then evaluation and the query surface report "not ready".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{PlantError, Result};
use crate::evaluate::{evaluate, Evaluation, MetricInput};
use crate::sensors::{SensorReader, SensorValue, STATE_UNAVAILABLE};

// ---------------------------------------------------------------------------
// Metric kinds, statuses, limits
// ---------------------------------------------------------------------------

/// Declaration order is evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Moisture,
    Conductivity,
    Temperature,
    Humidity,
    Illuminance,
    Dli,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::Moisture,
        MetricKind::Conductivity,
        MetricKind::Temperature,
        MetricKind::Humidity,
        MetricKind::Illuminance,
        MetricKind::Dli,
    ];

    /// Metrics fed directly by an external sensor. DLI is derived.
    pub const MEASURED: [MetricKind; 5] = [
        MetricKind::Moisture,
        MetricKind::Conductivity,
        MetricKind::Temperature,
        MetricKind::Humidity,
        MetricKind::Illuminance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Moisture => "moisture",
            Self::Conductivity => "conductivity",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Illuminance => "illuminance",
            Self::Dli => "dli",
        }
    }

    pub fn default_limits(self) -> Limits {
        let (min, max) = match self {
            Self::Moisture => (20.0, 60.0),
            Self::Conductivity => (500.0, 3000.0),
            Self::Temperature => (10.0, 40.0),
            Self::Humidity => (20.0, 60.0),
            Self::Illuminance => (0.0, 100_000.0),
            Self::Dli => (2.0, 30.0),
        };
        Limits { min, max }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = PlantError;

    fn from_str(s: &str) -> Result<Self> {
        MetricKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PlantError::UnknownMetric(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricStatus {
    Ok,
    Low,
    High,
    #[default]
    Unknown,
}

impl MetricStatus {
    pub fn is_breach(self) -> bool {
        matches!(self, Self::Low | Self::High)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlantState {
    Ok,
    Problem,
    #[default]
    Unknown,
}

impl PlantState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Problem => "problem",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub min: f64,
    pub max: f64,
}

impl Limits {
    pub fn classify(&self, value: f64) -> MetricStatus {
        if value < self.min {
            MetricStatus::Low
        } else if value > self.max {
            MetricStatus::High
        } else {
            MetricStatus::Ok
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bound {
    Min,
    Max,
}

pub type Statuses = BTreeMap<MetricKind, MetricStatus>;

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Sensor feeding this metric; `None` when detached.
    pub source: Option<String>,
    pub limits: Option<Limits>,
    pub trigger: bool,
    pub status: MetricStatus,
}

impl Default for Metric {
    fn default() -> Self {
        Self {
            source: None,
            limits: None,
            trigger: true,
            status: MetricStatus::Unknown,
        }
    }
}

/// Presentation data. Not consulted by the evaluator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlantIdentity {
    pub plant_id: String,
    pub name: String,
    pub species: Option<String>,
    pub display_species: Option<String>,
    pub picture: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlantDevice {
    identity: PlantIdentity,
    metrics: BTreeMap<MetricKind, Metric>,
    state: PlantState,
    complete: bool,
}

impl PlantDevice {
    pub fn new(identity: PlantIdentity) -> Self {
        Self {
            identity,
            metrics: MetricKind::ALL
                .into_iter()
                .map(|k| (k, Metric::default()))
                .collect(),
            state: PlantState::Unknown,
            complete: false,
        }
    }

    // -- Accessors --------------------------------------------------------

    pub fn plant_id(&self) -> &str {
        &self.identity.plant_id
    }

    pub fn species(&self) -> Option<&str> {
        self.identity.species.as_deref()
    }

    /// Species shown to users; falls back to the stored species.
    pub fn display_species(&self) -> Option<&str> {
        self.identity
            .display_species
            .as_deref()
            .or(self.species())
    }

    pub fn state(&self) -> PlantState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn metric(&self, kind: MetricKind) -> &Metric {
        &self.metrics[&kind]
    }

    fn metric_mut(&mut self, kind: MetricKind) -> &mut Metric {
        self.metrics.entry(kind).or_default()
    }

    pub fn statuses(&self) -> Statuses {
        self.metrics.iter().map(|(k, m)| (*k, m.status)).collect()
    }

    /// Every sensor feeding this plant, including the DLI sensor.
    pub fn sources(&self) -> impl Iterator<Item = (MetricKind, &str)> + '_ {
        self.metrics
            .iter()
            .filter_map(|(k, m)| m.source.as_deref().map(|s| (*k, s)))
    }

    pub fn is_fed_by(&self, sensor_id: &str) -> bool {
        self.sources().any(|(_, s)| s == sensor_id)
    }

    // -- Setup (only while incomplete) ------------------------------------

    pub fn add_thresholds(&mut self, limits: &BTreeMap<MetricKind, Limits>) -> Result<()> {
        self.ensure_incomplete()?;
        for (kind, l) in limits {
            if !l.min.is_finite() || !l.max.is_finite() {
                return Err(PlantError::InvalidThreshold(format!(
                    "{kind} limits must be finite numbers"
                )));
            }
        }
        for (kind, l) in limits {
            self.metric_mut(*kind).limits = Some(*l);
        }
        self.try_complete();
        Ok(())
    }

    pub fn add_sensors(&mut self, sources: &BTreeMap<MetricKind, Option<String>>) -> Result<()> {
        self.ensure_incomplete()?;
        if sources.contains_key(&MetricKind::Dli) {
            return Err(PlantError::InvalidSource(
                "the dli sensor is attached with add_dli".to_string(),
            ));
        }
        for (kind, source) in sources {
            self.metric_mut(*kind).source = normalize_source(source.as_deref());
        }
        Ok(())
    }

    /// Attach the DLI-derived sensor. Completes the device when every
    /// threshold is already in place.
    pub fn add_dli(&mut self, sensor_id: &str) -> Result<()> {
        self.ensure_incomplete()?;
        let Some(sensor_id) = normalize_source(Some(sensor_id)) else {
            return Err(PlantError::InvalidSource("dli sensor id is empty".to_string()));
        };
        self.metric_mut(MetricKind::Dli).source = Some(sensor_id);
        self.try_complete();
        Ok(())
    }

    fn ensure_incomplete(&self) -> Result<()> {
        if self.complete {
            return Err(PlantError::AlreadyComplete(self.plant_id().to_string()));
        }
        Ok(())
    }

    fn try_complete(&mut self) {
        if self.complete {
            return;
        }
        let thresholds = self.metrics.values().all(|m| m.limits.is_some());
        let dli = self.metrics[&MetricKind::Dli].source.is_some();
        if thresholds && dli {
            self.complete = true;
            info!(plant = %self.identity.plant_id, "plant complete");
        }
    }

    // -- Runtime mutation -------------------------------------------------

    pub fn set_threshold(&mut self, kind: MetricKind, bound: Bound, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(PlantError::InvalidThreshold(format!(
                "{kind} {bound:?} must be a finite number"
            )));
        }
        let plant_id = self.identity.plant_id.clone();
        let limits = self
            .metric_mut(kind)
            .limits
            .as_mut()
            .ok_or(PlantError::NotReady(plant_id))?;
        let mut next = *limits;
        match bound {
            Bound::Min => next.min = value,
            Bound::Max => next.max = value,
        }
        if next.min > next.max {
            return Err(PlantError::InvalidThreshold(format!(
                "min_{kind} ({}) exceeds max_{kind} ({})",
                next.min, next.max
            )));
        }
        *limits = next;
        Ok(())
    }

    pub fn set_trigger(&mut self, kind: MetricKind, enabled: bool) {
        self.metric_mut(kind).trigger = enabled;
    }

    pub fn set_picture(&mut self, picture: Option<String>) {
        self.identity.picture = picture;
    }

    pub fn set_species(&mut self, species: Option<String>, display_species: Option<String>) {
        self.identity.species = species;
        self.identity.display_species = display_species;
    }

    /// Point `kind` at another sensor, or detach it with `None`. The new
    /// sensor must already be known to `reader`.
    pub fn rebind_metric_source<R: SensorReader + ?Sized>(
        &mut self,
        kind: MetricKind,
        new_source: Option<&str>,
        reader: &R,
    ) -> Result<()> {
        if kind == MetricKind::Dli {
            return Err(PlantError::InvalidSource(
                "the dli sensor is derived and cannot be replaced".to_string(),
            ));
        }
        let new_source = normalize_source(new_source);
        if let Some(s) = &new_source {
            if !reader.contains(s) {
                return Err(PlantError::UnknownSensor(s.clone()));
            }
        }
        info!(
            plant = %self.identity.plant_id,
            metric = %kind,
            old = ?self.metrics[&kind].source,
            new = ?new_source,
            "replacing sensor"
        );
        self.metric_mut(kind).source = new_source;
        Ok(())
    }

    // -- Evaluation -------------------------------------------------------

    /// Evaluate the plant against the current sensor values and commit the
    /// result. `Ok(None)` while the device is not complete. On error nothing
    /// is committed.
    pub fn update<R: SensorReader + ?Sized>(&mut self, reader: &R) -> Result<Option<Evaluation>> {
        if !self.complete {
            debug!(plant = %self.identity.plant_id, "skipping update, plant not complete");
            return Ok(None);
        }

        let inputs: Vec<MetricInput> = MetricKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let metric = &self.metrics[&kind];
                let limits = metric.limits?;
                let snapshot = metric.source.as_deref().and_then(|s| reader.read(s));
                let (value, last_period) = match snapshot {
                    Some(s) => (s.value, s.last_period),
                    None => (SensorValue::Unavailable, None),
                };
                Some(MetricInput {
                    kind,
                    sensor: metric.source.clone(),
                    value,
                    limits,
                    trigger: metric.trigger,
                    last_period,
                })
            })
            .collect();

        let evaluation = evaluate(&inputs, &self.statuses())?;

        for (kind, status) in &evaluation.statuses {
            self.metric_mut(*kind).status = *status;
        }
        self.state = evaluation.state;

        debug!(
            plant = %self.identity.plant_id,
            state = self.state.as_str(),
            "plant evaluated"
        );
        Ok(Some(evaluation))
    }

    // -- Presentation -----------------------------------------------------

    /// State attributes for subscribers. `None` while not complete.
    pub fn attributes(&self) -> Option<PlantAttributes> {
        if !self.complete {
            return None;
        }
        Some(PlantAttributes {
            species: self.display_species().map(str::to_string),
            statuses: self
                .metrics
                .iter()
                .map(|(k, m)| (format!("{k}_status"), m.status))
                .collect(),
            species_original: self.species().map(str::to_string),
        })
    }

    /// Read-only snapshot of every metric with its current reading and
    /// limits. `None` while not complete.
    pub fn info<R: SensorReader + ?Sized>(&self, reader: &R) -> Option<PlantInfo> {
        if !self.complete {
            return None;
        }
        let info = self
            .metrics
            .iter()
            .filter_map(|(kind, metric)| {
                let limits = metric.limits?;
                let snapshot = metric.source.as_deref().and_then(|s| reader.read(s));
                let current = match (&snapshot, kind) {
                    (Some(s), MetricKind::Dli) => match s.value.as_number("dli") {
                        Ok(Some(v)) => CurrentValue::Number(v),
                        _ => CurrentValue::unavailable(),
                    },
                    (Some(s), _) => match &s.value {
                        SensorValue::Raw(raw) => raw
                            .parse::<f64>()
                            .ok()
                            .filter(|v| v.is_finite())
                            .map(CurrentValue::Number)
                            .unwrap_or_else(|| CurrentValue::Text(raw.clone())),
                        other => CurrentValue::Text(other.as_state().to_string()),
                    },
                    (None, _) => CurrentValue::unavailable(),
                };
                let (icon, unit) = snapshot
                    .map(|s| (s.icon, s.unit))
                    .unwrap_or((None, None));
                Some((
                    *kind,
                    MetricInfo {
                        max: limits.max,
                        min: limits.min,
                        current,
                        icon,
                        unit_of_measurement: unit,
                        sensor: metric.source.clone(),
                    },
                ))
            })
            .collect();
        Some(info)
    }

    pub fn summary(&self) -> PlantSummary {
        PlantSummary {
            plant_id: self.identity.plant_id.clone(),
            name: self.identity.name.clone(),
            species: self.display_species().map(str::to_string),
            picture: self.identity.picture.clone(),
            state: self.state,
            complete: self.complete,
            statuses: self.statuses(),
        }
    }
}

fn normalize_source(source: Option<&str>) -> Option<String> {
    source
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Serialisable views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlantAttributes {
    pub species: Option<String>,
    #[serde(flatten)]
    pub statuses: BTreeMap<String, MetricStatus>,
    pub species_original: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CurrentValue {
    Number(f64),
    Text(String),
}

impl CurrentValue {
    fn unavailable() -> Self {
        Self::Text(STATE_UNAVAILABLE.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricInfo {
    pub max: f64,
    pub min: f64,
    pub current: CurrentValue,
    pub icon: Option<String>,
    pub unit_of_measurement: Option<String>,
    pub sensor: Option<String>,
}

pub type PlantInfo = BTreeMap<MetricKind, MetricInfo>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlantSummary {
    pub plant_id: String,
    pub name: String,
    pub species: Option<String>,
    pub picture: Option<String>,
    pub state: PlantState,
    pub complete: bool,
    pub statuses: Statuses,
}

// ===========================================================================
// Tests
// ===========================================================================
