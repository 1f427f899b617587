//! Push evaluated plant state to subscribers.

use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use tracing::warn;

use crate::evaluate::Evaluation;
use crate::plant::{PlantState, Statuses};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlantUpdate {
    pub plant_id: String,
    pub state: PlantState,
    pub statuses: Statuses,
}

impl PlantUpdate {
    pub fn new(plant_id: &str, evaluation: &Evaluation) -> Self {
        Self {
            plant_id: plant_id.to_string(),
            state: evaluation.state,
            statuses: evaluation.statuses.clone(),
        }
    }
}

/// Fire-and-forget delivery of plant updates.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, update: &PlantUpdate);
}

/// Topic a plant's state is published on: `plant/<plant_id>/state`.
pub fn state_topic(plant_id: &str) -> String {
    format!("plant/{plant_id}/state")
}

/// Publishes retained JSON updates through the broker.
pub struct MqttNotifier {
    client: AsyncClient,
}

impl MqttNotifier {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl NotificationSink for MqttNotifier {
    fn publish(&self, update: &PlantUpdate) {
        let payload = match serde_json::to_vec(update) {
            Ok(p) => p,
            Err(e) => {
                warn!(plant = %update.plant_id, "failed to encode plant update: {e}");
                return;
            }
        };
        let topic = state_topic(&update.plant_id);
        if let Err(e) = self.client.try_publish(&topic, QoS::AtLeastOnce, true, payload) {
            warn!(plant = %update.plant_id, "failed to publish plant update: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
