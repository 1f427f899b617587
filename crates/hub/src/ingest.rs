//! Telemetry ingestion: store incoming readings, keep each plant's DLI sensor
//! up to date, and report which sensors changed.

use std::collections::HashMap;

use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::dli::DliAccumulator;
use crate::monitor::Trigger;
use crate::mqtt::{qualified_sensor_id, ReadingMsg};
use crate::registry::SharedRegistry;
use crate::sensors::{SensorSnapshot, SensorValue, SharedSensors};
use crate::state::SharedState;

/// Id of the DLI sensor derived for `plant_id`.
pub fn dli_sensor_id(plant_id: &str) -> String {
    format!("{plant_id}/dli")
}

pub struct Ingestor {
    sensors: SharedSensors,
    registry: SharedRegistry,
    shared: SharedState,
    /// plant_id -> accumulator
    dli: HashMap<String, DliAccumulator>,
}

impl Ingestor {
    pub fn new(sensors: SharedSensors, registry: SharedRegistry, shared: SharedState) -> Self {
        Self {
            sensors,
            registry,
            shared,
            dli: HashMap::new(),
        }
    }

    /// Apply one telemetry message from `node_id`. Returns a trigger for every
    /// sensor that changed, derived DLI sensors included.
    pub async fn ingest(&mut self, node_id: &str, msg: &ReadingMsg) -> Vec<Trigger> {
        let at = OffsetDateTime::from_unix_timestamp(msg.ts).unwrap_or_else(|_| {
            warn!(node = %node_id, ts = msg.ts, "telemetry timestamp out of range, using now");
            OffsetDateTime::now_utc()
        });

        let mut sensors = self.sensors.write().await;
        let mut changed: Vec<String> = Vec::with_capacity(msg.readings.len());
        // (sensor_id, value) for every numeric reading, in message order
        let mut numeric: Vec<(String, f64)> = Vec::new();

        for r in &msg.readings {
            let sensor_id = qualified_sensor_id(node_id, &r.sensor_id);
            let value = SensorValue::from_state(&r.state);
            if let Ok(Some(v)) = value.as_number(&sensor_id) {
                numeric.push((sensor_id.clone(), v));
            }
            sensors.update(
                &sensor_id,
                SensorSnapshot {
                    unit: r.unit.clone(),
                    icon: r.icon.clone(),
                    updated_at: Some(at),
                    ..SensorSnapshot::new(value)
                },
            );
            changed.push(sensor_id);
        }
        let measured = changed.len();

        let reg = self.registry.read().await;
        self.dli.retain(|plant_id, _| reg.get(plant_id).is_ok());

        for (sensor_id, lux) in numeric {
            for plant_id in reg.plants_lit_by(&sensor_id) {
                let acc = self.dli.entry(plant_id.clone()).or_insert_with(DliAccumulator::new);
                acc.record(lux, at);
                let dli_id = dli_sensor_id(&plant_id);
                debug!(plant = %plant_id, today = ?acc.today(), "dli updated");
                sensors.update(&dli_id, acc.snapshot());
                changed.push(dli_id);
            }
        }
        drop(reg);
        drop(sensors);

        self.shared
            .write()
            .await
            .record_reading(node_id, &changed[..measured]);

        changed.into_iter().map(Trigger::Sensor).collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::Reading;
    use crate::plant::tests::complete_plant;
    use crate::plant::MetricKind;
    use crate::registry::PlantRegistry;
    use crate::sensors::{SensorReader, SensorStore};
    use crate::state::SystemState;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    /// Readings never expire, so fixed timestamps stay readable.
    fn ingestor() -> Ingestor {
        ingestor_with(SensorStore::with_stale_after(None))
    }

    fn ingestor_with(store: SensorStore) -> Ingestor {
        let mut reg = PlantRegistry::new();
        reg.insert(complete_plant("basil"));
        Ingestor::new(
            Arc::new(RwLock::new(store)),
            Arc::new(RwLock::new(reg)),
            Arc::new(RwLock::new(SystemState::new())),
        )
    }

    fn msg(ts: i64, readings: &[(&str, &str)]) -> ReadingMsg {
        ReadingMsg {
            ts,
            readings: readings
                .iter()
                .map(|(id, state)| Reading {
                    sensor_id: id.to_string(),
                    state: state.to_string(),
                    unit: None,
                    icon: None,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn readings_are_stored_under_qualified_ids() {
        let mut ing = ingestor();
        let triggers = ing
            .ingest("basil-node", &msg(1_780_000_000, &[("moisture", "41"), ("humidity", "unavailable")]))
            .await;

        assert_eq!(
            triggers,
            vec![
                Trigger::Sensor("basil-node/moisture".into()),
                Trigger::Sensor("basil-node/humidity".into()),
            ]
        );
        let sensors = ing.sensors.read().await;
        assert_eq!(
            sensors.read("basil-node/moisture").unwrap().value,
            SensorValue::Raw("41".into())
        );
        assert_eq!(
            sensors.read("basil-node/humidity").unwrap().value,
            SensorValue::Unavailable
        );
        assert_eq!(ing.shared.read().await.readings_received, 2);
    }

    #[tokio::test]
    async fn illuminance_feeds_plant_dli() {
        let mut ing = ingestor();
        // 2026-05-28 20:26:40 UTC
        let t0 = 1_780_000_000;
        ing.ingest("basil-node", &msg(t0, &[("illuminance", "20000")])).await;
        let triggers = ing
            .ingest("basil-node", &msg(t0 + 1800, &[("illuminance", "20000")]))
            .await;

        assert!(triggers.contains(&Trigger::Sensor("basil/dli".into())));
        let sensors = ing.sensors.read().await;
        let dli = sensors.read("basil/dli").unwrap();
        let today = dli.value.as_number("basil/dli").unwrap().unwrap();
        assert!((today - 0.666).abs() < 1e-9, "today = {today}");
        assert_eq!(dli.last_period, None);
    }

    #[tokio::test]
    async fn readings_carry_their_timestamp() {
        let mut ing = ingestor_with(SensorStore::new());
        ing.ingest("basil-node", &msg(1, &[("moisture", "15")])).await;

        let sensors = ing.sensors.read().await;
        let stored = sensors
            .read_at("basil-node/moisture", OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        assert_eq!(stored.updated_at, OffsetDateTime::from_unix_timestamp(1).ok());
        assert_eq!(stored.value, SensorValue::Raw("15".into()));
        // Long past the default timeout.
        assert_eq!(
            sensors.read("basil-node/moisture").unwrap().value,
            SensorValue::Unavailable
        );
    }

    #[tokio::test]
    async fn non_numeric_illuminance_does_not_touch_dli() {
        let mut ing = ingestor();
        let triggers = ing
            .ingest("basil-node", &msg(1_780_000_000, &[("illuminance", "unknown")]))
            .await;
        assert_eq!(triggers.len(), 1);
        assert!(!ing.sensors.read().await.contains("basil/dli"));
    }

    #[tokio::test]
    async fn removed_plant_drops_its_accumulator() {
        let mut ing = ingestor();
        ing.ingest("basil-node", &msg(1_780_000_000, &[("illuminance", "500")])).await;
        assert!(ing.dli.contains_key("basil"));

        ing.registry.write().await.remove("basil").unwrap();
        ing.ingest("basil-node", &msg(1_780_000_060, &[("illuminance", "500")])).await;
        assert!(ing.dli.is_empty());
    }

    #[test]
    fn dli_sensor_id_format() {
        assert_eq!(dli_sensor_id("basil"), "basil/dli");
        assert_eq!(MetricKind::Dli.as_str(), "dli");
    }
}
