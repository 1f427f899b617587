//! Evaluation task: turns sensor updates into plant evaluations and pushes the
//! results to the notification sink.
//!
//! Triggers arrive on an mpsc channel. Every wake-up drains whatever else is
//! already queued, so a burst of readings for one plant collapses into a
//! single evaluation. Plants are evaluated one at a time under the registry
//! write lock, which keeps at most one evaluation per plant in flight.
//!
//! A periodic tick re-evaluates every plant so readings that went stale
//! without a new message still take effect.
//!
//! Lock order everywhere in the hub: sensors, then registry, then state.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::evaluate::Evaluation;
use crate::notify::{NotificationSink, PlantUpdate};
use crate::registry::SharedRegistry;
use crate::sensors::SharedSensors;
use crate::state::SharedState;

/// Capacity of the trigger channel.
pub const TRIGGER_QUEUE: usize = 256;

/// Period of the full re-evaluation tick.
pub const REEVALUATE_EVERY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A sensor produced a new value.
    Sensor(String),
    /// A plant's configuration changed.
    Plant(String),
}

/// Everything an evaluation needs. Cheap to clone.
#[derive(Clone)]
pub struct MonitorCtx {
    pub registry: SharedRegistry,
    pub sensors: SharedSensors,
    pub shared: SharedState,
    pub sink: Arc<dyn NotificationSink>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the monitor loop until every trigger sender is dropped. Intended to be
/// `tokio::spawn`-ed from main. Every plant is also re-evaluated each `every`.
pub async fn run(ctx: MonitorCtx, mut rx: mpsc::Receiver<Trigger>, every: Duration) {
    info!(every_s = every.as_secs_f64(), "monitor started");

    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(first) = received else { break };
                let mut batch = vec![first];
                while let Ok(next) = rx.try_recv() {
                    batch.push(next);
                }

                let plants = resolve(&ctx, &batch).await;
                debug!(triggers = batch.len(), plants = plants.len(), "monitor wake-up");

                for plant_id in plants {
                    evaluate_plant(&ctx, &plant_id).await;
                }
            }
            _ = ticker.tick() => {
                debug!("periodic re-evaluation");
                evaluate_all(&ctx).await;
            }
        }
    }

    info!("monitor stopped");
}

/// Map a batch of triggers to the distinct set of affected plants.
async fn resolve(ctx: &MonitorCtx, batch: &[Trigger]) -> BTreeSet<String> {
    let reg = ctx.registry.read().await;
    let mut plants = BTreeSet::new();
    for trigger in batch {
        match trigger {
            Trigger::Sensor(sensor_id) => plants.extend(reg.plants_for_sensor(sensor_id)),
            Trigger::Plant(plant_id) => {
                plants.insert(plant_id.clone());
            }
        }
    }
    plants
}

/// Evaluate every plant in the registry once.
pub async fn evaluate_all(ctx: &MonitorCtx) {
    let ids: Vec<String> = {
        let reg = ctx.registry.read().await;
        reg.iter().map(|p| p.plant_id().to_string()).collect()
    };
    for plant_id in ids {
        evaluate_plant(ctx, &plant_id).await;
    }
}

// ---------------------------------------------------------------------------
// Single plant
// ---------------------------------------------------------------------------

/// Evaluate one plant and publish the result. Errors are logged and recorded;
/// the plant keeps its previously published state.
pub async fn evaluate_plant(ctx: &MonitorCtx, plant_id: &str) -> Option<Evaluation> {
    let sensors = ctx.sensors.read().await;
    let mut reg = ctx.registry.write().await;

    let Ok(plant) = reg.get_mut(plant_id) else {
        debug!(plant = %plant_id, "plant removed before evaluation");
        return None;
    };

    let before = plant.state();
    match plant.update(&*sensors) {
        Ok(Some(evaluation)) => {
            ctx.sink.publish(&PlantUpdate::new(plant_id, &evaluation));
            if before != evaluation.state {
                info!(
                    plant = %plant_id,
                    from = before.as_str(),
                    to = evaluation.state.as_str(),
                    "plant state changed"
                );
                ctx.shared
                    .write()
                    .await
                    .record_plant(plant_id, before, evaluation.state);
            }
            Some(evaluation)
        }
        Ok(None) => {
            debug!(plant = %plant_id, "plant not complete, nothing to evaluate");
            None
        }
        Err(e) => {
            error!(plant = %plant_id, "evaluation failed: {e}");
            ctx.shared
                .write()
                .await
                .record_error(format!("{plant_id}: evaluation failed: {e}"));
            None
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::tests::RecordingSink;
    use crate::plant::tests::complete_plant;
    use crate::plant::{MetricKind, MetricStatus, PlantDevice, PlantState};
    use crate::registry::PlantRegistry;
    use crate::sensors::{SensorSnapshot, SensorStore, SensorValue};
    use crate::state::{EventKind, SystemState};
    use time::OffsetDateTime;
    use tokio::sync::RwLock;

    fn test_ctx(plants: Vec<PlantDevice>) -> (MonitorCtx, Arc<RecordingSink>) {
        let mut reg = PlantRegistry::new();
        for p in plants {
            reg.insert(p);
        }
        let sink = Arc::new(RecordingSink::default());
        let ctx = MonitorCtx {
            registry: Arc::new(RwLock::new(reg)),
            sensors: Arc::new(RwLock::new(SensorStore::new())),
            shared: Arc::new(RwLock::new(SystemState::new())),
            sink: sink.clone(),
        };
        (ctx, sink)
    }

    async fn set(ctx: &MonitorCtx, sensor_id: &str, state: &str) {
        ctx.sensors
            .write()
            .await
            .update(sensor_id, SensorSnapshot::new(SensorValue::from_state(state)));
    }

    async fn set_measured(ctx: &MonitorCtx, sensor_id: &str, state: &str, at: OffsetDateTime) {
        ctx.sensors.write().await.update(
            sensor_id,
            SensorSnapshot {
                updated_at: Some(at),
                ..SensorSnapshot::new(SensorValue::from_state(state))
            },
        );
    }

    #[tokio::test]
    async fn evaluate_plant_publishes_and_records_change() {
        let (ctx, sink) = test_ctx(vec![complete_plant("basil")]);
        set(&ctx, "basil-node/moisture", "15").await;

        let eval = evaluate_plant(&ctx, "basil").await.unwrap();
        assert_eq!(eval.state, PlantState::Problem);

        let updates = sink.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].plant_id, "basil");
        assert_eq!(updates[0].statuses[&MetricKind::Moisture], MetricStatus::Low);

        let st = ctx.shared.read().await;
        assert_eq!(st.events.back().unwrap().kind, EventKind::Plant);
    }

    #[tokio::test]
    async fn repeated_evaluation_publishes_same_state() {
        let (ctx, sink) = test_ctx(vec![complete_plant("basil")]);
        set(&ctx, "basil-node/moisture", "15").await;

        evaluate_plant(&ctx, "basil").await;
        evaluate_plant(&ctx, "basil").await;

        let updates = sink.updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0], updates[1]);
        // Only the first pass changed state.
        assert_eq!(ctx.shared.read().await.events.len(), 1);
    }

    #[tokio::test]
    async fn malformed_reading_publishes_nothing() {
        let (ctx, sink) = test_ctx(vec![complete_plant("basil")]);
        set(&ctx, "basil-node/moisture", "15").await;
        evaluate_plant(&ctx, "basil").await;

        set(&ctx, "basil-node/moisture", "n/a").await;
        assert!(evaluate_plant(&ctx, "basil").await.is_none());

        assert_eq!(sink.updates.lock().unwrap().len(), 1);
        let reg = ctx.registry.read().await;
        assert_eq!(reg.get("basil").unwrap().state(), PlantState::Problem);
        let st = ctx.shared.read().await;
        assert_eq!(st.events.back().unwrap().kind, EventKind::Error);
    }

    #[tokio::test]
    async fn incomplete_plant_publishes_nothing() {
        let (ctx, sink) = test_ctx(vec![PlantDevice::new(
            crate::plant::tests::identity("sprout"),
        )]);
        assert!(evaluate_plant(&ctx, "sprout").await.is_none());
        assert!(evaluate_plant(&ctx, "missing").await.is_none());
        assert!(sink.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_coalesces_triggers_per_plant() {
        let (ctx, sink) = test_ctx(vec![complete_plant("basil"), complete_plant("fern")]);
        set(&ctx, "basil-node/moisture", "30").await;
        set(&ctx, "basil-node/temperature", "21").await;

        let (tx, rx) = mpsc::channel(TRIGGER_QUEUE);
        tx.send(Trigger::Sensor("basil-node/moisture".into())).await.unwrap();
        tx.send(Trigger::Sensor("basil-node/temperature".into())).await.unwrap();
        tx.send(Trigger::Plant("basil".into())).await.unwrap();
        tx.send(Trigger::Sensor("unrelated/sensor".into())).await.unwrap();
        drop(tx);

        run(ctx.clone(), rx, Duration::from_secs(3600)).await;

        let updates = sink.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].plant_id, "basil");
        assert_eq!(updates[0].state, PlantState::Ok);
    }

    #[tokio::test]
    async fn evaluate_all_covers_every_plant() {
        let (ctx, sink) = test_ctx(vec![complete_plant("basil"), complete_plant("fern")]);
        evaluate_all(&ctx).await;

        let updates = sink.updates.lock().unwrap();
        let ids: Vec<&str> = updates.iter().map(|u| u.plant_id.as_str()).collect();
        assert_eq!(ids, vec!["basil", "fern"]);
        assert!(updates.iter().all(|u| u.state == PlantState::Unknown));
    }

    #[tokio::test]
    async fn stale_reading_is_not_judged() {
        let (ctx, sink) = test_ctx(vec![complete_plant("basil")]);
        let long_ago = OffsetDateTime::from_unix_timestamp(1).unwrap();
        set_measured(&ctx, "basil-node/moisture", "15", long_ago).await;

        let eval = evaluate_plant(&ctx, "basil").await.unwrap();
        assert_eq!(eval.state, PlantState::Unknown);
        assert_eq!(eval.statuses[&MetricKind::Moisture], MetricStatus::Unknown);
        assert_eq!(sink.updates.lock().unwrap()[0].state, PlantState::Unknown);
    }

    #[tokio::test]
    async fn tick_reevaluates_plants_whose_node_went_silent() {
        let (ctx, _sink) = test_ctx(vec![complete_plant("basil")]);
        let now = OffsetDateTime::now_utc();
        set_measured(&ctx, "basil-node/moisture", "15", now).await;
        let eval = evaluate_plant(&ctx, "basil").await.unwrap();
        assert_eq!(eval.state, PlantState::Problem);

        // The node stops reporting: its last reading ages out without a trigger.
        set_measured(&ctx, "basil-node/moisture", "15", now - time::Duration::hours(2)).await;

        let (tx, rx) = mpsc::channel(TRIGGER_QUEUE);
        let monitor = tokio::spawn(run(ctx.clone(), rx, Duration::from_millis(20)));

        tokio::time::timeout(Duration::from_secs(5), async {
            while ctx.registry.read().await.get("basil").unwrap().state() != PlantState::Unknown {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("plant did not fall back to unknown");

        drop(tx);
        monitor.await.unwrap();
    }
}
