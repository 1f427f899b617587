use serde::Deserialize;

pub(crate) const TELEMETRY_TOPIC: &str = "tele/+/reading";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct Reading {
    pub(crate) sensor_id: String,
    /// Reported state: a number, `unknown` or `unavailable`.
    pub(crate) state: String,
    #[serde(default)]
    pub(crate) unit: Option<String>,
    #[serde(default)]
    pub(crate) icon: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    pub(crate) ts: i64,
    pub(crate) readings: Vec<Reading>,
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

/// Extract node_id from "tele/<node_id>/reading".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Sensor ids are only unique per node, so the hub qualifies them.
pub(crate) fn qualified_sensor_id(node_id: &str, sensor_id: &str) -> String {
    format!("{node_id}/{sensor_id}")
}

// ===========================================================================
// Tests
// ===========================================================================
