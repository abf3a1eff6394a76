use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Device command plane
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// A device silent for this long is marked offline.
    #[serde(default = "d_offline_threshold_ms")]
    pub offline_threshold_ms: u64,
    #[serde(default = "d_command_ack_timeout_ms")]
    pub command_ack_timeout_ms: u64,
    #[serde(default = "d_command_max_attempts")]
    pub command_max_attempts: u32,
    /// Commands queued with `allow_offline` expire after this long.
    #[serde(default = "d_offline_queue_ttl_ms")]
    pub offline_queue_ttl_ms: u64,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            offline_threshold_ms: d_offline_threshold_ms(),
            command_ack_timeout_ms: d_command_ack_timeout_ms(),
            command_max_attempts: d_command_max_attempts(),
            offline_queue_ttl_ms: d_offline_queue_ttl_ms(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_offline_threshold_ms() -> u64 {
    120_000
}
fn d_command_ack_timeout_ms() -> u64 {
    5_000
}
fn d_command_max_attempts() -> u32 {
    3
}
fn d_offline_queue_ttl_ms() -> u64 {
    600_000
}
