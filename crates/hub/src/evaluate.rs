//! Plant health evaluation: one synchronous pass over every metric of a plant,
//! classifying each reading against its limits and deriving the aggregate
//! plant state.
//!
//! ## Per-metric state machine
//!
//! ```text
//! Unknown ──[value present]──▶ Ok | Low | High ──[value present]──▶ Ok | Low | High
//!    │                              │
//!    └──[value absent]──▶ (retained)└──[value absent]──▶ (retained)
//! ```
//!
//! A metric only transitions when its current value is present. Illuminance
//! never goes `Low` and DLI is judged on the previous period's total, so
//! neither raises a problem every night.

use crate::error::Result;
use crate::plant::{Limits, MetricKind, MetricStatus, PlantState, Statuses};
use crate::sensors::SensorValue;

/// Everything the evaluator needs to know about one metric for one pass.
#[derive(Debug, Clone)]
pub struct MetricInput {
    pub kind: MetricKind,
    /// Sensor the value came from, used when reporting a malformed reading.
    pub sensor: Option<String>,
    pub value: SensorValue,
    pub limits: Limits,
    pub trigger: bool,
    /// DLI only: the accumulated value of the last completed period.
    pub last_period: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub state: PlantState,
    pub statuses: Statuses,
}

/// Evaluate `inputs` in the order given, starting from the `prior` statuses.
///
/// Metrics without a usable reading keep their prior status and do not count
/// towards a known plant state. A present value that does not parse aborts
/// the whole pass so no partial result is committed.
pub fn evaluate(inputs: &[MetricInput], prior: &Statuses) -> Result<Evaluation> {
    let mut statuses = prior.clone();
    let mut known_state = false;
    let mut problem = false;

    for input in inputs {
        let Some(status) = classify(input)? else {
            continue;
        };

        known_state = true;
        statuses.insert(input.kind, status);
        if input.trigger && status.is_breach() {
            problem = true;
        }
    }

    let state = if !known_state {
        PlantState::Unknown
    } else if problem {
        PlantState::Problem
    } else {
        PlantState::Ok
    };

    Ok(Evaluation { state, statuses })
}

/// Classify a single metric. `Ok(None)` means the metric has nothing to say
/// this pass.
fn classify(input: &MetricInput) -> Result<Option<MetricStatus>> {
    let sensor = input.sensor.as_deref().unwrap_or(input.kind.as_str());
    let Some(value) = input.value.as_number(sensor)? else {
        return Ok(None);
    };

    let status = match input.kind {
        MetricKind::Illuminance => {
            if value > input.limits.max {
                MetricStatus::High
            } else {
                MetricStatus::Ok
            }
        }
        MetricKind::Dli => match input.last_period {
            Some(last) if last > 0.0 => input.limits.classify(last),
            _ => return Ok(None),
        },
        _ => input.limits.classify(value),
    };

    Ok(Some(status))
}

// ===========================================================================
// Tests
// ===========================================================================
