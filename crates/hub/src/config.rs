//! TOML config file loading, validation, and database seeding for plants.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};

use crate::db::{Db, MetricConfig, PlantConfig};
use crate::plant::{Limits, MetricKind, PlantIdentity};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

/// Readings older than this many minutes stop counting towards plant health.
pub const DEFAULT_STALE_TIMEOUT_MIN: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_stale_timeout_min")]
    pub stale_timeout_min: i64,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
}

fn default_stale_timeout_min() -> i64 {
    DEFAULT_STALE_TIMEOUT_MIN
}

impl Config {
    pub fn stale_after(&self) -> time::Duration {
        time::Duration::minutes(self.stale_timeout_min)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlantEntry {
    pub plant_id: String,
    pub name: String,
    #[serde(default)]
    pub species: Option<String>,
    #[serde(default)]
    pub display_species: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub sensors: SensorsEntry,
    #[serde(default)]
    pub thresholds: ThresholdsEntry,
    #[serde(default)]
    pub triggers: TriggersEntry,
}

/// Qualified sensor ids (`<node_id>/<sensor_id>`). DLI is derived by the hub.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SensorsEntry {
    pub moisture: Option<String>,
    pub temperature: Option<String>,
    pub conductivity: Option<String>,
    pub illuminance: Option<String>,
    pub humidity: Option<String>,
}

/// Missing bounds fall back to [`MetricKind::default_limits`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThresholdsEntry {
    pub min_moisture: Option<f64>,
    pub max_moisture: Option<f64>,
    pub min_temperature: Option<f64>,
    pub max_temperature: Option<f64>,
    pub min_conductivity: Option<f64>,
    pub max_conductivity: Option<f64>,
    pub min_illuminance: Option<f64>,
    pub max_illuminance: Option<f64>,
    pub min_humidity: Option<f64>,
    pub max_humidity: Option<f64>,
    pub min_dli: Option<f64>,
    pub max_dli: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggersEntry {
    pub moisture: Option<bool>,
    pub temperature: Option<bool>,
    pub conductivity: Option<bool>,
    pub illuminance: Option<bool>,
    pub humidity: Option<bool>,
    pub dli: Option<bool>,
}

impl SensorsEntry {
    pub fn get(&self, kind: MetricKind) -> Option<&str> {
        match kind {
            MetricKind::Moisture => self.moisture.as_deref(),
            MetricKind::Temperature => self.temperature.as_deref(),
            MetricKind::Conductivity => self.conductivity.as_deref(),
            MetricKind::Illuminance => self.illuminance.as_deref(),
            MetricKind::Humidity => self.humidity.as_deref(),
            MetricKind::Dli => None,
        }
    }
}

impl ThresholdsEntry {
    pub fn limits(&self, kind: MetricKind) -> Limits {
        let (min, max) = match kind {
            MetricKind::Moisture => (self.min_moisture, self.max_moisture),
            MetricKind::Temperature => (self.min_temperature, self.max_temperature),
            MetricKind::Conductivity => (self.min_conductivity, self.max_conductivity),
            MetricKind::Illuminance => (self.min_illuminance, self.max_illuminance),
            MetricKind::Humidity => (self.min_humidity, self.max_humidity),
            MetricKind::Dli => (self.min_dli, self.max_dli),
        };
        let default = kind.default_limits();
        Limits {
            min: min.unwrap_or(default.min),
            max: max.unwrap_or(default.max),
        }
    }
}

impl TriggersEntry {
    pub fn enabled(&self, kind: MetricKind) -> bool {
        let flag = match kind {
            MetricKind::Moisture => self.moisture,
            MetricKind::Temperature => self.temperature,
            MetricKind::Conductivity => self.conductivity,
            MetricKind::Illuminance => self.illuminance,
            MetricKind::Humidity => self.humidity,
            MetricKind::Dli => self.dli,
        };
        flag.unwrap_or(true)
    }
}

impl PlantEntry {
    pub fn to_plant_config(&self) -> PlantConfig {
        PlantConfig {
            identity: PlantIdentity {
                plant_id: self.plant_id.clone(),
                name: self.name.clone(),
                species: self.species.clone(),
                display_species: self.display_species.clone(),
                picture: self.picture.clone(),
            },
            metrics: MetricKind::ALL
                .into_iter()
                .map(|k| {
                    (
                        k,
                        MetricConfig {
                            sensor_id: self.sensors.get(k).map(str::to_string),
                            limits: self.thresholds.limits(k),
                            trigger: self.triggers.enabled(k),
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.stale_timeout_min <= 0 {
            errors.push(format!(
                "stale_timeout_min must be positive, got {}",
                self.stale_timeout_min
            ));
        }
        self.validate_plants(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = || {
                if p.plant_id.is_empty() {
                    format!("plants[{i}]")
                } else {
                    format!("plant '{}'", p.plant_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if p.plant_id.trim().is_empty() {
                errors.push(format!("{}: plant_id is empty", ctx()));
            } else if p.plant_id.contains('/') {
                errors.push(format!("{}: plant_id must not contain '/'", ctx()));
            } else if !seen_ids.insert(&p.plant_id) {
                errors.push(format!("{}: duplicate plant_id", ctx()));
            }

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Sensors ─────────────────────────────────────────
            for kind in MetricKind::MEASURED {
                if let Some(id) = p.sensors.get(kind) {
                    if id.trim().is_empty() {
                        errors.push(format!("{}: sensors.{kind} is empty", ctx()));
                    }
                }
            }

            // ── Thresholds ──────────────────────────────────────
            for kind in MetricKind::ALL {
                let l = p.thresholds.limits(kind);
                if !l.min.is_finite() || !l.max.is_finite() {
                    errors.push(format!(
                        "{}: {kind} thresholds must be finite, got min {} max {}",
                        ctx(),
                        l.min,
                        l.max
                    ));
                } else if l.min > l.max {
                    errors.push(format!(
                        "{}: min_{kind} ({}) exceeds max_{kind} ({})",
                        ctx(),
                        l.min,
                        l.max
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed every configured plant that is not yet in the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let mut seeded = 0usize;
    for p in &config.plants {
        let inserted = db
            .seed_plant(&p.to_plant_config())
            .await
            .with_context(|| format!("failed to seed plant '{}'", p.plant_id))?;
        if inserted {
            seeded += 1;
        } else {
            tracing::debug!(plant = %p.plant_id, "plant already stored, keeping stored settings");
        }
    }

    tracing::info!(plants = config.plants.len(), seeded, "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
