use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MQTT
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "d_broker")]
    pub broker: String,
    #[serde(default = "d_1883")]
    pub port: u16,
    #[serde(default)]
    pub tls: MqttTls,
    #[serde(default)]
    pub auth: MqttAuth,
    #[serde(default = "d_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Initial reconnect delay; doubles per failed attempt with full jitter.
    #[serde(default = "d_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "d_reconnect_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,
    /// Publishes buffered while disconnected; overflow drops oldest.
    #[serde(default = "d_publish_buffer")]
    pub publish_buffer: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: d_broker(),
            port: d_1883(),
            tls: MqttTls::default(),
            auth: MqttAuth::default(),
            keep_alive_secs: d_keep_alive_secs(),
            reconnect_initial_ms: d_reconnect_initial_ms(),
            reconnect_max_backoff_ms: d_reconnect_max_backoff_ms(),
            publish_buffer: d_publish_buffer(),
        }
    }
}

/// Transport security for the broker connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MqttTls {
    #[default]
    None,
    /// TLS with CA verification of the broker only.
    Server { ca_file: PathBuf },
    /// Mutual TLS with a client certificate.
    Mutual {
        ca_file: PathBuf,
        cert_file: PathBuf,
        key_file: PathBuf,
    },
}

/// Broker authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MqttAuth {
    #[default]
    None,
    UserPass { username: String, password: String },
    /// JWT presented as the MQTT password.
    Jwt { username: String, token: String },
}

// ── serde default helpers ───────────────────────────────────────────

fn d_broker() -> String {
    "localhost".into()
}
fn d_1883() -> u16 {
    1883
}
fn d_keep_alive_secs() -> u64 {
    30
}
fn d_reconnect_initial_ms() -> u64 {
    1_000
}
fn d_reconnect_max_backoff_ms() -> u64 {
    60_000
}
fn d_publish_buffer() -> usize {
    1024
}
