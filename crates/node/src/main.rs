mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sim::{PlantSim, Sample, Scenario};

/// Reported in place of a value when a channel dropped out.
const STATE_UNAVAILABLE: &str = "unavailable";

#[derive(Debug, Serialize)]
struct Reading {
    sensor_id: String,
    state: String,
    unit: String,
}

#[derive(Debug, Serialize)]
struct ReadingMsg {
    ts: i64,
    readings: Vec<Reading>,
}

impl ReadingMsg {
    fn from_sample(ts: i64, sample: &Sample) -> Self {
        let readings = sample
            .values
            .iter()
            .map(|(channel, value)| Reading {
                sensor_id: channel.sensor_id().to_string(),
                state: match value {
                    Some(v) => format!("{v:.1}"),
                    None => STATE_UNAVAILABLE.to_string(),
                },
                unit: channel.unit().to_string(),
            })
            .collect();
        Self { ts, readings }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "node-a".to_string());

    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let day_s: f64 = env::var("SIM_DAY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|d: &f64| *d > 0.0)
        .unwrap_or(86_400.0);

    let client_id = format!("plant-node-{node_id}");

    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // The node only publishes, but the eventloop must run to keep the
    // connection alive.
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let topic = format!("tele/{node_id}/reading");
    info!(%topic, %scenario, sample_every_s, "publishing simulated readings");

    let mut sim = PlantSim::new(scenario, day_s);

    loop {
        let now = OffsetDateTime::now_utc();
        let t = now.unix_timestamp_nanos() as f64 / 1e9;
        let msg = ReadingMsg::from_sample(now.unix_timestamp(), &sim.sample(t));

        let payload = serde_json::to_vec(&msg)?;

        if let Err(e) = client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            warn!("publish error: {e}");
        } else {
            debug!(ts = msg.ts, "published readings");
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
