//! HTTP query surface and plant services.
//!
//! Mutations are applied to a copy of the live device first so invalid input
//! never reaches the store. The copy is committed to the registry only after
//! the store accepted the change, then the plant is queued for evaluation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::db::Db;
use crate::error::PlantError;
use crate::ingest::dli_sensor_id;
use crate::monitor::Trigger;
use crate::plant::{Bound, MetricKind, PlantInfo, PlantSummary};
use crate::registry::SharedRegistry;
use crate::sensors::SharedSensors;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub registry: SharedRegistry,
    pub sensors: SharedSensors,
    pub db: Db,
    pub triggers: mpsc::Sender<Trigger>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    Plant(PlantError),
    Internal(anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl From<PlantError> for ApiError {
    fn from(e: PlantError) -> Self {
        Self::Plant(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Plant(e) => {
                let (status, code) = match &e {
                    PlantError::NotFound { .. } => (StatusCode::NOT_FOUND, "entity_not_found"),
                    PlantError::NotReady(_) | PlantError::AlreadyComplete(_) => {
                        (StatusCode::CONFLICT, "not_ready")
                    }
                    PlantError::UnknownSensor(_)
                    | PlantError::UnknownMetric(_)
                    | PlantError::InvalidSource(_)
                    | PlantError::InvalidThreshold(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
                    PlantError::MalformedReading { .. } => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                    }
                };
                (status, code, e.to_string())
            }
            ApiError::Internal(e) => {
                error!("request failed: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    format!("{e:#}"),
                )
            }
        };
        (
            status,
            Json(ErrorBody {
                error: code,
                message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// The store lost the plant underneath the registry.
fn ensure_stored(found: bool, plant_id: &str) -> Result<(), PlantError> {
    if found {
        Ok(())
    } else {
        Err(PlantError::plant_not_found(plant_id))
    }
}

async fn schedule(app: &AppState, plant_id: String) {
    if let Err(e) = app.triggers.send(Trigger::Plant(plant_id)).await {
        warn!("monitor is gone, evaluation not scheduled: {e}");
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/plants", get(list_plants))
        .route("/api/plants/{id}", get(get_plant).delete(delete_plant))
        .route("/api/plants/{id}/info", get(get_info))
        .route("/api/plants/{id}/picture", put(put_picture))
        .route("/api/plants/{id}/species", put(put_species))
        .route("/api/plants/{id}/metrics/{metric}/sensor", put(put_sensor))
        .route("/api/plants/{id}/metrics/{metric}/trigger", put(put_trigger))
        .route("/api/plants/{id}/metrics/{metric}/threshold", put(put_threshold))
        .route("/api/sensors/{*sensor_id}", get(sensor_owner))
        .with_state(state)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.shared.read().await;
    Json(st.to_status())
}

async fn list_plants(State(app): State<AppState>) -> Json<Vec<PlantSummary>> {
    let reg = app.registry.read().await;
    Json(reg.iter().map(|p| p.summary()).collect())
}

async fn get_plant(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let reg = app.registry.read().await;
    let resp = match reg.get(&id)?.attributes() {
        Some(attrs) => Json(attrs).into_response(),
        None => Json(serde_json::Map::new()).into_response(),
    };
    Ok(resp)
}

#[derive(Serialize)]
struct InfoResponse {
    result: PlantInfo,
}

async fn get_info(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<InfoResponse>> {
    let sensors = app.sensors.read().await;
    let reg = app.registry.read().await;
    let result = reg.get(&id)?.info(&*sensors).unwrap_or_default();
    Ok(Json(InfoResponse { result }))
}

#[derive(Serialize)]
struct SensorOwner {
    sensor_id: String,
    plant_id: String,
}

async fn sensor_owner(
    State(app): State<AppState>,
    Path(sensor_id): Path<String>,
) -> ApiResult<Json<SensorOwner>> {
    let reg = app.registry.read().await;
    let plant_id = reg
        .find_device_by_sensor(&sensor_id)
        .map(str::to_string)
        .ok_or_else(|| PlantError::NotFound {
            kind: "sensor",
            id: sensor_id.clone(),
        })?;
    Ok(Json(SensorOwner {
        sensor_id,
        plant_id,
    }))
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SensorBody {
    #[serde(default)]
    new_sensor: Option<String>,
}

async fn put_sensor(
    State(app): State<AppState>,
    Path((id, metric)): Path<(String, String)>,
    Json(body): Json<SensorBody>,
) -> ApiResult<Json<PlantSummary>> {
    let kind: MetricKind = metric.parse()?;
    let sensors = app.sensors.read().await;
    let mut reg = app.registry.write().await;
    let plant = reg.get_mut(&id)?;

    let mut updated = plant.clone();
    updated.rebind_metric_source(kind, body.new_sensor.as_deref(), &*sensors)?;
    // Not held across the store write.
    drop(sensors);

    let source = updated.metric(kind).source.clone();
    ensure_stored(
        app.db.set_metric_sensor(&id, kind, source.as_deref()).await?,
        &id,
    )?;
    *plant = updated;
    let summary = plant.summary();
    drop(reg);

    info!(plant = %id, metric = %kind, sensor = ?source, "metric sensor replaced");
    schedule(&app, id).await;
    Ok(Json(summary))
}

#[derive(Deserialize)]
struct TriggerBody {
    enabled: bool,
}

async fn put_trigger(
    State(app): State<AppState>,
    Path((id, metric)): Path<(String, String)>,
    Json(body): Json<TriggerBody>,
) -> ApiResult<Json<PlantSummary>> {
    let kind: MetricKind = metric.parse()?;
    let mut reg = app.registry.write().await;
    let plant = reg.get_mut(&id)?;

    let mut updated = plant.clone();
    updated.set_trigger(kind, body.enabled);
    ensure_stored(app.db.set_trigger(&id, kind, body.enabled).await?, &id)?;
    *plant = updated;
    let summary = plant.summary();
    drop(reg);

    schedule(&app, id).await;
    Ok(Json(summary))
}

#[derive(Deserialize)]
struct ThresholdBody {
    bound: Bound,
    value: f64,
}

async fn put_threshold(
    State(app): State<AppState>,
    Path((id, metric)): Path<(String, String)>,
    Json(body): Json<ThresholdBody>,
) -> ApiResult<Json<PlantSummary>> {
    let kind: MetricKind = metric.parse()?;
    let mut reg = app.registry.write().await;
    let plant = reg.get_mut(&id)?;

    let mut updated = plant.clone();
    updated.set_threshold(kind, body.bound, body.value)?;
    ensure_stored(
        app.db
            .set_threshold(&id, kind, body.bound, body.value)
            .await?,
        &id,
    )?;
    *plant = updated;
    let summary = plant.summary();
    drop(reg);

    schedule(&app, id).await;
    Ok(Json(summary))
}

#[derive(Deserialize)]
struct PictureBody {
    #[serde(default)]
    picture: Option<String>,
}

async fn put_picture(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PictureBody>,
) -> ApiResult<Json<PlantSummary>> {
    let mut reg = app.registry.write().await;
    let plant = reg.get_mut(&id)?;

    ensure_stored(app.db.set_picture(&id, body.picture.as_deref()).await?, &id)?;
    plant.set_picture(body.picture);
    Ok(Json(plant.summary()))
}

#[derive(Deserialize)]
struct SpeciesBody {
    #[serde(default)]
    species: Option<String>,
    #[serde(default)]
    display_species: Option<String>,
}

async fn put_species(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SpeciesBody>,
) -> ApiResult<Json<PlantSummary>> {
    let mut reg = app.registry.write().await;
    let plant = reg.get_mut(&id)?;

    ensure_stored(
        app.db
            .set_species(&id, body.species.as_deref(), body.display_species.as_deref())
            .await?,
        &id,
    )?;
    plant.set_species(body.species, body.display_species);
    Ok(Json(plant.summary()))
}

async fn delete_plant(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let mut sensors = app.sensors.write().await;
    let mut reg = app.registry.write().await;
    reg.get(&id)?;

    app.db.delete_plant(&id).await?;
    reg.remove(&id)?;
    sensors.remove(&dli_sensor_id(&id));
    drop(reg);
    drop(sensors);

    info!(plant = %id, "plant removed");
    app.shared
        .write()
        .await
        .record_system(format!("plant removed: {id}"));
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind web port {port}: {e}"))?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("web server error: {e}"))
}

// ===========================================================================
// Tests
// ===========================================================================
