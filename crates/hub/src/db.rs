use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::ingest::dli_sensor_id;
use crate::plant::{Bound, Limits, MetricKind, PlantDevice, PlantIdentity};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Stored configuration of one plant. Source of truth once seeded.
#[derive(Debug, Clone, PartialEq)]
pub struct PlantConfig {
    pub identity: PlantIdentity,
    pub metrics: BTreeMap<MetricKind, MetricConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricConfig {
    /// Always `None` for DLI, which is derived by the hub.
    pub sensor_id: Option<String>,
    pub limits: Limits,
    pub trigger: bool,
}

impl PlantConfig {
    /// Build the live device. Complete once every metric has limits.
    pub fn to_device(&self) -> crate::error::Result<PlantDevice> {
        let mut plant = PlantDevice::new(self.identity.clone());

        let limits: BTreeMap<MetricKind, Limits> =
            self.metrics.iter().map(|(k, m)| (*k, m.limits)).collect();
        let sources: BTreeMap<MetricKind, Option<String>> = self
            .metrics
            .iter()
            .filter(|(k, _)| **k != MetricKind::Dli)
            .map(|(k, m)| (*k, m.sensor_id.clone()))
            .collect();

        plant.add_thresholds(&limits)?;
        plant.add_sensors(&sources)?;
        for (kind, m) in &self.metrics {
            plant.set_trigger(*kind, m.trigger);
        }
        plant.add_dli(&dli_sensor_id(&self.identity.plant_id))?;
        Ok(plant)
    }
}

#[derive(FromRow)]
struct PlantRow {
    plant_id: String,
    name: String,
    species: Option<String>,
    display_species: Option<String>,
    picture: Option<String>,
}

#[derive(FromRow)]
struct MetricRow {
    plant_id: String,
    metric: String,
    sensor_id: Option<String>,
    min_value: f64,
    max_value: f64,
    trigger_enabled: bool,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/plants/plants.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Plant config
    // ----------------------------

    /// Store a plant unless one with the same id already exists. Returns
    /// whether the plant was inserted; stored plants keep their settings.
    pub async fn seed_plant(&self, plant: &PlantConfig) -> Result<bool> {
        let id = &plant.identity;
        let mut tx = self.pool.begin().await.context("seed_plant: begin failed")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO plants (plant_id, name, species, display_species, picture)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(plant_id) DO NOTHING
            "#,
        )
        .bind(&id.plant_id)
        .bind(&id.name)
        .bind(&id.species)
        .bind(&id.display_species)
        .bind(&id.picture)
        .execute(&mut *tx)
        .await
        .context("seed_plant: insert plant failed")?
        .rows_affected()
            > 0;

        if inserted {
            for (kind, m) in &plant.metrics {
                sqlx::query(
                    r#"
                    INSERT INTO plant_metrics
                      (plant_id, metric, sensor_id, min_value, max_value, trigger_enabled)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&id.plant_id)
                .bind(kind.as_str())
                .bind(&m.sensor_id)
                .bind(m.limits.min)
                .bind(m.limits.max)
                .bind(m.trigger)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("seed_plant: insert metric {kind} failed"))?;
            }
        }

        tx.commit().await.context("seed_plant: commit failed")?;
        Ok(inserted)
    }

    pub async fn load_plants(&self) -> Result<Vec<PlantConfig>> {
        let plants: Vec<PlantRow> = sqlx::query_as(
            r#"
            SELECT plant_id, name, species, display_species, picture
            FROM plants
            ORDER BY plant_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_plants failed")?;

        let metrics: Vec<MetricRow> = sqlx::query_as(
            r#"
            SELECT plant_id, metric, sensor_id, min_value, max_value, trigger_enabled
            FROM plant_metrics
            ORDER BY plant_id, metric
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_plants: metrics failed")?;

        let mut by_plant: BTreeMap<String, PlantConfig> = plants
            .into_iter()
            .map(|r| (r.plant_id.clone(), plant_from_row(r)))
            .collect();

        for row in metrics {
            let Some(plant) = by_plant.get_mut(&row.plant_id) else {
                continue;
            };
            let (kind, metric) = metric_from_row(row)?;
            plant.metrics.insert(kind, metric);
        }

        Ok(by_plant.into_values().collect())
    }

    pub async fn get_plant(&self, plant_id: &str) -> Result<Option<PlantConfig>> {
        let row: Option<PlantRow> = sqlx::query_as(
            r#"
            SELECT plant_id, name, species, display_species, picture
            FROM plants
            WHERE plant_id = ?
            "#,
        )
        .bind(plant_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_plant failed")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let metrics: Vec<MetricRow> = sqlx::query_as(
            r#"
            SELECT plant_id, metric, sensor_id, min_value, max_value, trigger_enabled
            FROM plant_metrics
            WHERE plant_id = ?
            "#,
        )
        .bind(plant_id)
        .fetch_all(&self.pool)
        .await
        .context("get_plant: metrics failed")?;

        let mut plant = plant_from_row(row);
        for m in metrics {
            let (kind, metric) = metric_from_row(m)?;
            plant.metrics.insert(kind, metric);
        }
        Ok(Some(plant))
    }

    /// Returns whether a plant was deleted. Metrics cascade.
    pub async fn delete_plant(&self, plant_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM plants WHERE plant_id = ?")
            .bind(plant_id)
            .execute(&self.pool)
            .await
            .context("delete_plant failed")?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Runtime options
    // ----------------------------
    //
    // Each returns whether a matching row existed.

    pub async fn set_picture(&self, plant_id: &str, picture: Option<&str>) -> Result<bool> {
        let res = sqlx::query("UPDATE plants SET picture = ? WHERE plant_id = ?")
            .bind(picture)
            .bind(plant_id)
            .execute(&self.pool)
            .await
            .context("set_picture failed")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn set_species(
        &self,
        plant_id: &str,
        species: Option<&str>,
        display_species: Option<&str>,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE plants SET species = ?, display_species = ? WHERE plant_id = ?",
        )
        .bind(species)
        .bind(display_species)
        .bind(plant_id)
        .execute(&self.pool)
        .await
        .context("set_species failed")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn set_trigger(&self, plant_id: &str, kind: MetricKind, enabled: bool) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE plant_metrics SET trigger_enabled = ? WHERE plant_id = ? AND metric = ?",
        )
        .bind(enabled)
        .bind(plant_id)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await
        .context("set_trigger failed")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn set_threshold(
        &self,
        plant_id: &str,
        kind: MetricKind,
        bound: Bound,
        value: f64,
    ) -> Result<bool> {
        let sql = match bound {
            Bound::Min => "UPDATE plant_metrics SET min_value = ? WHERE plant_id = ? AND metric = ?",
            Bound::Max => "UPDATE plant_metrics SET max_value = ? WHERE plant_id = ? AND metric = ?",
        };
        let res = sqlx::query(sql)
            .bind(value)
            .bind(plant_id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await
            .context("set_threshold failed")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn set_metric_sensor(
        &self,
        plant_id: &str,
        kind: MetricKind,
        sensor_id: Option<&str>,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE plant_metrics SET sensor_id = ? WHERE plant_id = ? AND metric = ?",
        )
        .bind(sensor_id)
        .bind(plant_id)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await
        .context("set_metric_sensor failed")?;
        Ok(res.rows_affected() > 0)
    }
}

fn plant_from_row(r: PlantRow) -> PlantConfig {
    PlantConfig {
        identity: PlantIdentity {
            plant_id: r.plant_id,
            name: r.name,
            species: r.species,
            display_species: r.display_species,
            picture: r.picture,
        },
        metrics: BTreeMap::new(),
    }
}

fn metric_from_row(r: MetricRow) -> Result<(MetricKind, MetricConfig)> {
    let kind: MetricKind = r
        .metric
        .parse()
        .with_context(|| format!("plant '{}' has an unknown stored metric", r.plant_id))?;
    Ok((
        kind,
        MetricConfig {
            sensor_id: r.sensor_id,
            limits: Limits {
                min: r.min_value,
                max: r.max_value,
            },
            trigger: r.trigger_enabled,
        },
    ))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    /// A store whose pool has one connection, so a test can stall writers by
    /// holding it.
    pub(crate) async fn single_connection_db() -> Db {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        let db = Db { pool };
        db.migrate().await.unwrap();
        db
    }

    pub(crate) async fn hold_connection(db: &Db) -> sqlx::pool::PoolConnection<Sqlite> {
        db.pool.acquire().await.unwrap()
    }

    pub(crate) fn plant_config(plant_id: &str) -> PlantConfig {
        PlantConfig {
            identity: PlantIdentity {
                plant_id: plant_id.into(),
                name: "Basil".into(),
                species: Some("ocimum basilicum".into()),
                display_species: None,
                picture: None,
            },
            metrics: MetricKind::ALL
                .into_iter()
                .map(|k| {
                    let sensor_id = (k != MetricKind::Dli).then(|| format!("{plant_id}-node/{k}"));
                    (
                        k,
                        MetricConfig {
                            sensor_id,
                            limits: k.default_limits(),
                            trigger: true,
                        },
                    )
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn seed_and_load_round_trip() {
        let db = test_db().await;
        assert!(db.seed_plant(&plant_config("basil")).await.unwrap());

        let plants = db.load_plants().await.unwrap();
        assert_eq!(plants, vec![plant_config("basil")]);
    }

    #[tokio::test]
    async fn seed_keeps_existing_plant() {
        let db = test_db().await;
        db.seed_plant(&plant_config("basil")).await.unwrap();
        db.set_picture("basil", Some("/local/basil.jpg")).await.unwrap();

        let mut changed = plant_config("basil");
        changed.identity.name = "Other".into();
        assert!(!db.seed_plant(&changed).await.unwrap());

        let stored = db.get_plant("basil").await.unwrap().unwrap();
        assert_eq!(stored.identity.name, "Basil");
        assert_eq!(stored.identity.picture.as_deref(), Some("/local/basil.jpg"));
    }

    #[tokio::test]
    async fn get_missing_plant_is_none() {
        let db = test_db().await;
        assert!(db.get_plant("nope").await.unwrap().is_none());
        assert!(!db.set_picture("nope", None).await.unwrap());
        assert!(!db.delete_plant("nope").await.unwrap());
    }

    #[tokio::test]
    async fn runtime_options_persist() {
        let db = test_db().await;
        db.seed_plant(&plant_config("basil")).await.unwrap();

        assert!(db.set_trigger("basil", MetricKind::Humidity, false).await.unwrap());
        assert!(db
            .set_threshold("basil", MetricKind::Moisture, Bound::Max, 75.0)
            .await
            .unwrap());
        assert!(db
            .set_metric_sensor("basil", MetricKind::Temperature, Some("shelf/temp"))
            .await
            .unwrap());
        assert!(db
            .set_species("basil", Some("thai basil"), Some("Thai Basil"))
            .await
            .unwrap());

        let p = db.get_plant("basil").await.unwrap().unwrap();
        assert!(!p.metrics[&MetricKind::Humidity].trigger);
        assert_eq!(p.metrics[&MetricKind::Moisture].limits.max, 75.0);
        assert_eq!(p.metrics[&MetricKind::Moisture].limits.min, 20.0);
        assert_eq!(
            p.metrics[&MetricKind::Temperature].sensor_id.as_deref(),
            Some("shelf/temp")
        );
        assert_eq!(p.identity.display_species.as_deref(), Some("Thai Basil"));
    }

    #[test]
    fn to_device_builds_complete_plant() {
        let mut cfg = plant_config("basil");
        cfg.metrics.get_mut(&MetricKind::Humidity).unwrap().trigger = false;

        let plant = cfg.to_device().unwrap();
        assert!(plant.is_complete());
        assert!(!plant.metric(MetricKind::Humidity).trigger);
        assert!(plant.is_fed_by("basil/dli"));
        assert!(plant.is_fed_by("basil-node/moisture"));
    }

    #[test]
    fn to_device_without_all_limits_stays_incomplete() {
        let mut cfg = plant_config("basil");
        cfg.metrics.remove(&MetricKind::Dli);

        let plant = cfg.to_device().unwrap();
        assert!(!plant.is_complete());
    }

    #[tokio::test]
    async fn delete_cascades_metrics() {
        let db = test_db().await;
        db.seed_plant(&plant_config("basil")).await.unwrap();
        db.seed_plant(&plant_config("fern")).await.unwrap();

        assert!(db.delete_plant("basil").await.unwrap());
        let plants = db.load_plants().await.unwrap();
        assert_eq!(plants.len(), 1);
        assert_eq!(plants[0].identity.plant_id, "fern");
        assert!(!db.set_trigger("basil", MetricKind::Moisture, false).await.unwrap());
    }
}
