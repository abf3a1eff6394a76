//! Health snapshots published on `alicia/health/<service>`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of a service process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Created,
    Initializing,
    Ready,
    Degraded,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceState {
    /// Running-but-unhealthy still serves traffic; everything from
    /// `Stopping` on does not.
    pub fn is_serving(self) -> bool {
        matches!(self, ServiceState::Ready | ServiceState::Degraded)
    }
}

/// Snapshot published on every heartbeat and served by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub service: String,
    pub version: String,
    /// Regenerated on every process start; distinguishes restarts.
    pub instance_id: Uuid,
    pub state: ServiceState,
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub messages_processed: u64,
    pub errors: u64,
    pub publishes_dropped: u64,
    pub unrouted_messages: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Inbound message count per subscribed topic filter.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub topic_hits: BTreeMap<String, u64>,
    /// Service-specific gauges reported via `report_metric`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fleet view
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One service as seen by the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetEntry {
    pub snapshot: HealthSnapshot,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
    /// False once three consecutive heartbeats have been missed.
    pub online: bool,
}

/// Aggregated view published on `alicia/health/fleet`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetView {
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub services_online: usize,
    pub services_offline: usize,
    pub services: BTreeMap<String, FleetEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serving_states() {
        assert!(ServiceState::Ready.is_serving());
        assert!(ServiceState::Degraded.is_serving());
        assert!(!ServiceState::Stopping.is_serving());
        assert!(!ServiceState::Failed.is_serving());
    }

    #[test]
    fn snapshot_round_trip() {
        let snap = HealthSnapshot {
            service: "voice_router".into(),
            version: "0.1.0".into(),
            instance_id: Uuid::new_v4(),
            state: ServiceState::Ready,
            uptime_secs: 42,
            mqtt_connected: true,
            messages_processed: 10,
            errors: 1,
            publishes_dropped: 0,
            unrouted_messages: 0,
            last_error: Some("stt timeout".into()),
            topic_hits: BTreeMap::from([("alicia/voice/command".into(), 10)]),
            metrics: BTreeMap::from([("active_sessions".into(), 3.0)]),
        };
        let back: HealthSnapshot =
            serde_json::from_str(&serde_json::to_string(&snap).unwrap()).unwrap();
        assert_eq!(back.state, ServiceState::Ready);
        assert_eq!(back.topic_hits["alicia/voice/command"], 10);
    }
}
