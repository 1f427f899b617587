mod config;
mod db;
mod dli;
mod error;
mod evaluate;
mod ingest;
mod monitor;
mod mqtt;
mod notify;
mod plant;
mod registry;
mod sensors;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use db::Db;
use ingest::Ingestor;
use monitor::{MonitorCtx, Trigger, REEVALUATE_EVERY, TRIGGER_QUEUE};
use mqtt::{extract_node_id, ReadingMsg, TELEMETRY_TOPIC};
use notify::MqttNotifier;
use registry::PlantRegistry;
use sensors::SensorStore;
use state::SystemState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:plants.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed plants) ───────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    // Stored plants are the source of truth from here on.
    let mut registry = PlantRegistry::new();
    for plant in db.load_plants().await? {
        match plant.to_device() {
            Ok(device) => {
                registry.insert(device);
            }
            Err(e) => error!(plant = %plant.identity.plant_id, "cannot build plant: {e}"),
        }
    }
    if registry.is_empty() {
        warn!("no plants configured in the database");
    }
    info!(plants = registry.len(), "db ready");

    // ── Shared state ────────────────────────────────────────────────
    let registry = Arc::new(RwLock::new(registry));
    let sensors = Arc::new(RwLock::new(SensorStore::with_stale_after(Some(
        cfg.stale_after(),
    ))));
    let shared = Arc::new(RwLock::new(SystemState::new()));
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    // ── MQTT client ─────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("plant-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);

    // ── Monitor ─────────────────────────────────────────────────────
    let ctx = MonitorCtx {
        registry: Arc::clone(&registry),
        sensors: Arc::clone(&sensors),
        shared: Arc::clone(&shared),
        sink: Arc::new(MqttNotifier::new(client.clone())),
    };
    let (triggers, trigger_rx) = mpsc::channel::<Trigger>(TRIGGER_QUEUE);
    monitor::evaluate_all(&ctx).await;
    tokio::spawn(monitor::run(ctx, trigger_rx, REEVALUATE_EVERY));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: Arc::clone(&shared),
        registry: Arc::clone(&registry),
        sensors: Arc::clone(&sensors),
        db: db.clone(),
        triggers: triggers.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state).await {
            error!("{e:#}");
        }
    });

    // ── Telemetry ───────────────────────────────────────────────────
    let mut ingestor = Ingestor::new(sensors, registry, Arc::clone(&shared));

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(node_id) = extract_node_id(&p.topic) else {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };
                match serde_json::from_slice::<ReadingMsg>(&p.payload) {
                    Ok(msg) => {
                        debug!(node = %node_id, ts = msg.ts, readings = msg.readings.len(), "telemetry");
                        for trigger in ingestor.ingest(node_id, &msg).await {
                            if let Err(e) = triggers.send(trigger).await {
                                error!("monitor stopped, dropping trigger: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(topic = %p.topic, "bad telemetry json: {e}");
                        shared
                            .write()
                            .await
                            .record_error(format!("bad telemetry json from {node_id}: {e}"));
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Clean sessions forget subscriptions, so subscribe on every connect.
                if let Err(e) = client.try_subscribe(TELEMETRY_TOPIC, QoS::AtLeastOnce) {
                    error!("subscribe to {TELEMETRY_TOPIC} failed: {e}");
                } else {
                    info!(topic = TELEMETRY_TOPIC, "hub subscribed");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
