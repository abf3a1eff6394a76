mod devices;
mod http;
mod mqtt;
mod voice;

pub use devices::*;
pub use http::*;
pub use mqtt::*;
pub use voice::*;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration record shared by every Alicia service.
///
/// Precedence: built-in defaults < config file < `ALICIA_*` environment
/// variables < command-line flags. The binaries apply the last layer via
/// their clap definitions; [`Config::apply_env`] applies the third.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Stable service name (e.g. `"voice_router"`). Required for `serve`.
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default = "d_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "d_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "d_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Default deadline for one-shot request/response over the bus.
    #[serde(default = "d_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            log_level: LogLevel::default(),
            heartbeat_interval_ms: d_heartbeat_interval_ms(),
            startup_timeout_ms: d_startup_timeout_ms(),
            shutdown_grace_ms: d_shutdown_grace_ms(),
            request_timeout_ms: d_request_timeout_ms(),
            mqtt: MqttConfig::default(),
            http: HttpConfig::default(),
            voice: VoiceConfig::default(),
            devices: DevicesConfig::default(),
        }
    }
}

fn d_heartbeat_interval_ms() -> u64 {
    30_000
}
fn d_startup_timeout_ms() -> u64 {
    30_000
}
fn d_shutdown_grace_ms() -> u64 {
    10_000
}
fn d_request_timeout_ms() -> u64 {
    10_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Log level
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading & env overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Config {
    /// Load from a TOML file, or fall back to defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw)
                    .map_err(|e| Error::Config(format!("{}: {e}", p.display())))
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply `ALICIA_*` environment overrides via the given lookup.
    ///
    /// Unparseable values are rejected with an error rather than silently
    /// ignored; a typo'd override should never run with the default.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn set_u64(slot: &mut u64, key: &str, val: String) -> Result<()> {
            *slot = val
                .parse()
                .map_err(|_| Error::Config(format!("{key}: expected integer, got {val:?}")))?;
            Ok(())
        }

        if let Some(v) = lookup("ALICIA_SERVICE_NAME") {
            self.service_name = v;
        }
        if let Some(v) = lookup("ALICIA_LOG_LEVEL") {
            self.log_level = v.parse().map_err(Error::Config)?;
        }
        if let Some(v) = lookup("ALICIA_HEARTBEAT_INTERVAL_MS") {
            set_u64(&mut self.heartbeat_interval_ms, "ALICIA_HEARTBEAT_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("ALICIA_STARTUP_TIMEOUT_MS") {
            set_u64(&mut self.startup_timeout_ms, "ALICIA_STARTUP_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("ALICIA_SHUTDOWN_GRACE_MS") {
            set_u64(&mut self.shutdown_grace_ms, "ALICIA_SHUTDOWN_GRACE_MS", v)?;
        }
        if let Some(v) = lookup("ALICIA_REQUEST_TIMEOUT_MS") {
            set_u64(&mut self.request_timeout_ms, "ALICIA_REQUEST_TIMEOUT_MS", v)?;
        }

        // ── MQTT ─────────────────────────────────────────────────────
        if let Some(v) = lookup("ALICIA_MQTT_BROKER") {
            self.mqtt.broker = v;
        }
        if let Some(v) = lookup("ALICIA_MQTT_PORT") {
            let port: u16 = v
                .parse()
                .map_err(|_| Error::Config(format!("ALICIA_MQTT_PORT: expected port, got {v:?}")))?;
            self.mqtt.port = port;
        }
        if let Some(v) = lookup("ALICIA_MQTT_USERNAME") {
            let password = lookup("ALICIA_MQTT_PASSWORD").unwrap_or_default();
            self.mqtt.auth = MqttAuth::UserPass { username: v, password };
        }
        if let Some(v) = lookup("ALICIA_MQTT_JWT") {
            let username = lookup("ALICIA_MQTT_USERNAME").unwrap_or_else(|| "jwt".into());
            self.mqtt.auth = MqttAuth::Jwt { username, token: v };
        }
        if let Some(v) = lookup("ALICIA_MQTT_RECONNECT_MAX_BACKOFF_MS") {
            set_u64(
                &mut self.mqtt.reconnect_max_backoff_ms,
                "ALICIA_MQTT_RECONNECT_MAX_BACKOFF_MS",
                v,
            )?;
        }

        // ── HTTP ─────────────────────────────────────────────────────
        if let Some(v) = lookup("ALICIA_HTTP_PORT") {
            let port: u16 = v
                .parse()
                .map_err(|_| Error::Config(format!("ALICIA_HTTP_PORT: expected port, got {v:?}")))?;
            self.http.port = port;
        }

        // ── Voice / devices ──────────────────────────────────────────
        if let Some(v) = lookup("ALICIA_SESSION_TIMEOUT_MS") {
            set_u64(&mut self.voice.session_timeout_ms, "ALICIA_SESSION_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("ALICIA_MAX_CONCURRENT_SESSIONS") {
            let n: usize = v.parse().map_err(|_| {
                Error::Config(format!("ALICIA_MAX_CONCURRENT_SESSIONS: expected integer, got {v:?}"))
            })?;
            self.voice.max_concurrent_sessions = n;
        }
        if let Some(v) = lookup("ALICIA_COMMAND_ACK_TIMEOUT_MS") {
            set_u64(&mut self.devices.command_ack_timeout_ms, "ALICIA_COMMAND_ACK_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("ALICIA_COMMAND_MAX_ATTEMPTS") {
            let n: u32 = v.parse().map_err(|_| {
                Error::Config(format!("ALICIA_COMMAND_MAX_ATTEMPTS: expected integer, got {v:?}"))
            })?;
            self.devices.command_max_attempts = n;
        }
        if let Some(v) = lookup("ALICIA_OFFLINE_THRESHOLD_MS") {
            set_u64(&mut self.devices.offline_threshold_ms, "ALICIA_OFFLINE_THRESHOLD_MS", v)?;
        }

        Ok(())
    }

    /// [`apply_env`](Self::apply_env) against the process environment.
    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env(|key| std::env::var(key).ok())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let mut error = |field: &str, message: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message,
            });
        };

        if self.service_name.is_empty() {
            error("service_name", "service name must not be empty".into());
        } else if !self
            .service_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            error(
                "service_name",
                format!("{:?} contains characters outside [a-zA-Z0-9_-]", self.service_name),
            );
        }

        if self.mqtt.broker.is_empty() {
            error("mqtt.broker", "broker host must not be empty".into());
        }
        if self.mqtt.port == 0 {
            error("mqtt.port", "port must be greater than 0".into());
        }
        if self.http.port == 0 {
            error("http.port", "port must be greater than 0".into());
        }
        if self.heartbeat_interval_ms == 0 {
            error("heartbeat_interval_ms", "interval must be greater than 0".into());
        }
        if self.devices.command_max_attempts == 0 {
            error("devices.command_max_attempts", "at least one attempt is required".into());
        }
        if self.voice.max_concurrent_sessions == 0 {
            error("voice.max_concurrent_sessions", "must admit at least one session".into());
        }
        if let MqttTls::Mutual { cert_file, key_file, .. } = &self.mqtt.tls {
            if cert_file.as_os_str().is_empty() || key_file.as_os_str().is_empty() {
                error("mqtt.tls", "mutual TLS requires both cert_file and key_file".into());
            }
        }

        // Warnings.
        if self.voice.session_timeout_ms < self.voice.stt_timeout_ms {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "voice.session_timeout_ms".into(),
                message: "session deadline is shorter than the STT budget; \
                          every session will time out in STT"
                    .into(),
            });
        }

        issues
    }
}
