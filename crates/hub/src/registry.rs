//! All live plant devices, keyed by plant id, plus lookups across them.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{PlantError, Result};
use crate::plant::{MetricKind, PlantDevice};

pub type SharedRegistry = Arc<RwLock<PlantRegistry>>;

#[derive(Debug, Default)]
pub struct PlantRegistry {
    plants: BTreeMap<String, PlantDevice>,
}

impl PlantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a plant. Returns the previous device, if any.
    pub fn insert(&mut self, plant: PlantDevice) -> Option<PlantDevice> {
        self.plants.insert(plant.plant_id().to_string(), plant)
    }

    pub fn remove(&mut self, plant_id: &str) -> Result<PlantDevice> {
        self.plants
            .remove(plant_id)
            .ok_or_else(|| PlantError::plant_not_found(plant_id))
    }

    pub fn get(&self, plant_id: &str) -> Result<&PlantDevice> {
        self.plants
            .get(plant_id)
            .ok_or_else(|| PlantError::plant_not_found(plant_id))
    }

    pub fn get_mut(&mut self, plant_id: &str) -> Result<&mut PlantDevice> {
        self.plants
            .get_mut(plant_id)
            .ok_or_else(|| PlantError::plant_not_found(plant_id))
    }

    pub fn len(&self) -> usize {
        self.plants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlantDevice> + '_ {
        self.plants.values()
    }

    /// First plant (by id) fed by `sensor_id`, DLI sensors included.
    pub fn find_device_by_sensor(&self, sensor_id: &str) -> Option<&str> {
        self.plants
            .values()
            .find(|p| p.is_fed_by(sensor_id))
            .map(|p| p.plant_id())
    }

    /// Every plant fed by `sensor_id`. A sensor may be shared between plants
    /// standing next to each other.
    pub fn plants_for_sensor(&self, sensor_id: &str) -> Vec<String> {
        self.plants
            .values()
            .filter(|p| p.is_fed_by(sensor_id))
            .map(|p| p.plant_id().to_string())
            .collect()
    }

    /// Plants whose illuminance metric reads from `sensor_id`.
    pub fn plants_lit_by(&self, sensor_id: &str) -> Vec<String> {
        self.plants
            .values()
            .filter(|p| p.metric(MetricKind::Illuminance).source.as_deref() == Some(sensor_id))
            .map(|p| p.plant_id().to_string())
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
