//! The `alicia/…` topic namespace.
//!
//! Topic strings are built and parsed here only, so a rename touches one
//! file. Wildcard *matching* is transport behavior and lives in the bus
//! crate's router.

/// Retained, QoS 0 heartbeat snapshots: `alicia/health/<service>`.
pub fn health(service: &str) -> String {
    format!("alicia/health/{service}")
}

/// Aggregated fleet view published by the health monitor.
pub const HEALTH_FLEET: &str = "alicia/health/fleet";

/// Filter covering every service's heartbeat (and the fleet view).
pub const HEALTH_ALL: &str = "alicia/health/#";

// ── Devices ─────────────────────────────────────────────────────────

/// Device announcements (retained).
pub const DEVICES_REGISTER: &str = "alicia/devices/register";
pub const DEVICES_UNREGISTER: &str = "alicia/devices/unregister";
/// Registry confirmations.
pub const DEVICES_REGISTERED: &str = "alicia/devices/registered";
pub const DEVICES_STATUS_CHANGED: &str = "alicia/devices/status_changed";
/// Aggregate command resolution events.
pub const DEVICES_COMMAND_STATUS: &str = "alicia/devices/command_status";

pub const DEVICE_STATE_FILTER: &str = "alicia/devices/+/state";
pub const DEVICE_HEARTBEAT_FILTER: &str = "alicia/devices/+/heartbeat";
pub const DEVICE_ACK_FILTER: &str = "alicia/devices/+/ack";

/// Status updates (retained): `alicia/devices/<device_id>/state`.
pub fn device_state(device_id: &str) -> String {
    format!("alicia/devices/{device_id}/state")
}

pub fn device_heartbeat(device_id: &str) -> String {
    format!("alicia/devices/{device_id}/heartbeat")
}

/// Commands to a device: `alicia/devices/<device_id>/command`.
pub fn device_command(device_id: &str) -> String {
    format!("alicia/devices/{device_id}/command")
}

/// Device → hub acks: `alicia/devices/<device_id>/ack`.
pub fn device_ack(device_id: &str) -> String {
    format!("alicia/devices/{device_id}/ack")
}

/// Extract the device id from `alicia/devices/<id>/<leaf>` topics.
pub fn parse_device_topic(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix("alicia/devices/")?;
    let (device_id, leaf) = rest.split_once('/')?;
    if device_id.is_empty() || leaf.is_empty() || leaf.contains('/') {
        return None;
    }
    Some((device_id, leaf))
}

// ── Voice ───────────────────────────────────────────────────────────

pub const VOICE_COMMAND: &str = "alicia/voice/command";
pub const VOICE_RESPONSE: &str = "alicia/voice/response";
pub const VOICE_CANCEL: &str = "alicia/voice/cancel";

// ── Point-to-point RPC ──────────────────────────────────────────────

/// Requests addressed to a service: `alicia/<service>/request`.
pub fn service_request(service: &str) -> String {
    format!("alicia/{service}/request")
}

/// Responses addressed back to a service: `alicia/<service>/response`.
pub fn service_response(service: &str) -> String {
    format!("alicia/{service}/response")
}
