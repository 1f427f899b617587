//! Stateful plant sensor simulator for local development.
//!
//! Models one plant pot with five channels:
//! - Soil moisture as a random walk with drying drift and mean reversion
//! - Conductivity following the moisture level (fertiliser concentration)
//! - Illuminance, temperature and humidity on a day/night cycle
//! - Per-reading noise and occasional dropouts (`unavailable`)

use std::f64::consts::PI;
use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Everything inside the default thresholds. Rare dropouts.
    Healthy,
    /// Starts mid-range and dries out until moisture reads low.
    Drying,
    /// Healthy values with heavy noise and ~10% dropouts per channel.
    Flaky,
    /// A shaded spot: peak illuminance stays low, so DLI ends up low.
    Shady,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "drying" => Self::Drying,
            "flaky" => Self::Flaky,
            "shady" => Self::Shady,
            _ => Self::Healthy, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Drying => write!(f, "drying"),
            Self::Flaky => write!(f, "flaky"),
            Self::Shady => write!(f, "shady"),
        }
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Moisture,
    Temperature,
    Illuminance,
    Conductivity,
    Humidity,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Moisture,
        Channel::Temperature,
        Channel::Illuminance,
        Channel::Conductivity,
        Channel::Humidity,
    ];

    /// Local sensor id; the hub qualifies it as `<node_id>/<sensor_id>`.
    pub fn sensor_id(self) -> &'static str {
        match self {
            Self::Moisture => "moisture",
            Self::Temperature => "temperature",
            Self::Illuminance => "illuminance",
            Self::Conductivity => "conductivity",
            Self::Humidity => "humidity",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Moisture | Self::Humidity => "%",
            Self::Temperature => "°C",
            Self::Illuminance => "lx",
            Self::Conductivity => "µS/cm",
        }
    }
}

/// One tick worth of readings. `None` means the channel dropped out.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub values: Vec<(Channel, Option<f64>)>,
}

impl Sample {
    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.values
            .iter()
            .find(|(c, _)| *c == channel)
            .and_then(|(_, v)| *v)
    }
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Stateful simulator producing plausible plant sensor readings.
pub struct PlantSim {
    /// Current "true" soil moisture in %. Evolves each tick.
    moisture: f64,

    // Random walk parameters
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,

    /// Conductivity at 50% moisture, µS/cm.
    conductivity_at_half: f64,

    // Diurnal cycle
    peak_lux: f64,
    temp_mean: f64,
    temp_amplitude: f64,
    humidity_mean: f64,
    humidity_amplitude: f64,
    diurnal_period_s: f64,

    // Imperfections
    noise_scale: f64,
    dropout_prob: f32,
}

impl PlantSim {
    /// `diurnal_period_s` controls the day/night cycle length. Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let (start, drift, center, peak_lux, noise_scale, dropout_prob) = match scenario {
            Scenario::Healthy => (45.0, -0.05, 40.0, 20_000.0, 1.0, 0.005_f32),
            Scenario::Drying => (35.0, -0.6, 10.0, 20_000.0, 1.0, 0.01),
            Scenario::Flaky => (45.0, -0.05, 40.0, 20_000.0, 3.0, 0.10),
            Scenario::Shady => (45.0, -0.05, 40.0, 900.0, 1.0, 0.005),
        };

        Self {
            moisture: (start + gaussian(0.0, 2.0)).clamp(0.0, 100.0),
            drift_per_sample: drift,
            walk_sigma: 0.4,
            mean_reversion: 0.02,
            center,
            conductivity_at_half: gaussian(1200.0, 100.0).max(600.0),
            peak_lux,
            temp_mean: 22.0,
            temp_amplitude: 4.0,
            humidity_mean: 45.0,
            humidity_amplitude: 10.0,
            diurnal_period_s,
            noise_scale,
            dropout_prob,
        }
    }

    /// Daylight factor in `[0, 1]` at unix time `t`. Dark for the first and
    /// last quarter of each period, peaking halfway through.
    pub fn daylight(&self, t: f64) -> f64 {
        let phase = 2.0 * PI * t.rem_euclid(self.diurnal_period_s) / self.diurnal_period_s;
        (phase - PI / 2.0).sin().max(0.0)
    }

    /// Produce the next reading of every channel at unix time `t` (seconds).
    ///
    /// The moisture level evolves with each call, so the call frequency
    /// matters.
    pub fn sample(&mut self, t: f64) -> Sample {
        // -- Evolve the moisture level ------------------------------------

        let pull = self.mean_reversion * (self.center - self.moisture);
        let walk = gaussian(0.0, self.walk_sigma);
        self.moisture = (self.moisture + self.drift_per_sample + pull + walk).clamp(0.0, 100.0);

        // -- Build the instantaneous readings -----------------------------

        let light = self.daylight(t);
        let cycle = (2.0 * PI * t.rem_euclid(self.diurnal_period_s) / self.diurnal_period_s
            - PI / 2.0)
            .sin();
        let n = self.noise_scale;

        let moisture = self.moisture + gaussian(0.0, 0.5 * n);
        let conductivity =
            self.conductivity_at_half * (self.moisture / 50.0) + gaussian(0.0, 20.0 * n);
        let illuminance = self.peak_lux * light * (1.0 + gaussian(0.0, 0.05 * n));
        let temperature = self.temp_mean + self.temp_amplitude * cycle + gaussian(0.0, 0.2 * n);
        let humidity =
            self.humidity_mean - self.humidity_amplitude * cycle + gaussian(0.0, 1.0 * n);

        let values = Channel::ALL
            .into_iter()
            .map(|c| {
                let v = match c {
                    Channel::Moisture => moisture.clamp(0.0, 100.0),
                    Channel::Temperature => temperature,
                    Channel::Illuminance => illuminance.max(0.0),
                    Channel::Conductivity => conductivity.max(0.0),
                    Channel::Humidity => humidity.clamp(0.0, 100.0),
                };
                let dropped = fastrand::f32() < self.dropout_prob;
                (c, (!dropped).then_some(v))
            })
            .collect();

        Sample { values }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
