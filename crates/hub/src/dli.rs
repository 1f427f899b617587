//! Daily Light Integral derived from an illuminance sensor.
//!
//! Illuminance (lx) is converted to PPFD (µmol/m²/s), integrated over time and
//! accumulated per UTC day. When a sample arrives on a new day the running
//! total becomes `last_period`, which is what plant evaluation judges.

use time::{Date, Duration, OffsetDateTime, UtcOffset};

use crate::sensors::{SensorSnapshot, SensorValue};

/// Sunlight conversion factor, µmol/m²/s per lx.
pub const LUX_TO_PPFD: f64 = 0.0185;

/// Samples further apart than this are not integrated across.
pub const MAX_SAMPLE_GAP: Duration = Duration::hours(1);

pub const DLI_UNIT: &str = "mol/d⋅m²";
pub const DLI_ICON: &str = "mdi:counter";

#[derive(Debug, Default, Clone)]
pub struct DliAccumulator {
    day: Option<Date>,
    /// mol/m² accumulated so far in `day`.
    total: f64,
    last_period: Option<f64>,
    last_sample: Option<(OffsetDateTime, f64)>,
}

pub fn lux_to_ppfd(lux: f64) -> f64 {
    lux.max(0.0) * LUX_TO_PPFD
}

/// mol/m² delivered by a constant PPFD over `dt`.
fn integral(ppfd: f64, dt: Duration) -> f64 {
    ppfd * dt.as_seconds_f64() / 1_000_000.0
}

impl DliAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one illuminance sample. Samples older than the previous one are
    /// ignored.
    pub fn record(&mut self, lux: f64, at: OffsetDateTime) {
        let at = at.to_offset(UtcOffset::UTC);
        let ppfd = lux_to_ppfd(lux);

        if let Some((prev_at, prev_ppfd)) = self.last_sample {
            if at <= prev_at {
                return;
            }
            if at - prev_at <= MAX_SAMPLE_GAP {
                let midnight = at.date().midnight().assume_utc();
                if prev_at < midnight {
                    // Split at midnight: each part goes to its own day.
                    self.total += integral(prev_ppfd, midnight - prev_at);
                    self.roll_over(at.date());
                    self.total += integral(prev_ppfd, at - midnight);
                } else {
                    self.total += integral(prev_ppfd, at - prev_at);
                }
            }
        }

        if self.day != Some(at.date()) {
            self.roll_over(at.date());
        }

        self.last_sample = Some((at, ppfd));
    }

    fn roll_over(&mut self, today: Date) {
        if let Some(day) = self.day {
            // A skipped day had no light recorded at all.
            let consecutive = day.next_day() == Some(today);
            self.last_period = Some(if consecutive { self.total } else { 0.0 });
            self.total = 0.0;
        }
        self.day = Some(today);
    }

    /// Integral accumulated so far today, `None` before the first sample.
    pub fn today(&self) -> Option<f64> {
        self.day.map(|_| self.total)
    }

    pub fn last_period(&self) -> Option<f64> {
        self.last_period
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        let value = match self.today() {
            Some(total) => SensorValue::from_number((total * 1000.0).round() / 1000.0),
            None => SensorValue::Unknown,
        };
        SensorSnapshot {
            value,
            unit: Some(DLI_UNIT.to_string()),
            icon: Some(DLI_ICON.to_string()),
            last_period: self.last_period(),
            updated_at: self.last_sample.map(|(at, _)| at),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
