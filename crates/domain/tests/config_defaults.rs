use std::io::Write;

use alicia_domain::config::{Config, LogLevel, MqttAuth, MqttTls};

#[test]
fn default_broker_is_localhost() {
    let config = Config::default();
    assert_eq!(config.mqtt.broker, "localhost");
    assert_eq!(config.mqtt.port, 1883);
    assert!(matches!(config.mqtt.tls, MqttTls::None));
    assert!(matches!(config.mqtt.auth, MqttAuth::None));
}

#[test]
fn default_timing_knobs() {
    let config = Config::default();
    assert_eq!(config.heartbeat_interval_ms, 30_000);
    assert_eq!(config.startup_timeout_ms, 30_000);
    assert_eq!(config.shutdown_grace_ms, 10_000);
    assert_eq!(config.voice.session_timeout_ms, 15_000);
    assert_eq!(config.voice.session_ttl_ms, 300_000);
    assert_eq!(config.voice.max_concurrent_sessions, 64);
    assert_eq!(config.devices.offline_threshold_ms, 120_000);
    assert_eq!(config.devices.command_ack_timeout_ms, 5_000);
    assert_eq!(config.devices.command_max_attempts, 3);
    assert_eq!(config.log_level, LogLevel::Info);
}

#[test]
fn tls_modes_parse_from_toml() {
    let config: Config = toml::from_str(
        r#"
service_name = "device_manager"

[mqtt.tls]
mode = "mutual"
ca_file = "/etc/alicia/ca.pem"
cert_file = "/etc/alicia/client.pem"
key_file = "/etc/alicia/client.key"

[mqtt.auth]
mode = "jwt"
username = "device_manager"
token = "eyJ.fake.jwt"
"#,
    )
    .unwrap();

    match &config.mqtt.tls {
        MqttTls::Mutual { ca_file, .. } => {
            assert_eq!(ca_file.to_str(), Some("/etc/alicia/ca.pem"));
        }
        other => panic!("expected mutual TLS, got {other:?}"),
    }
    assert!(matches!(config.mqtt.auth, MqttAuth::Jwt { .. }));
}

#[test]
fn load_from_file_then_env() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
service_name = "voice_router"
log_level = "warn"

[mqtt]
broker = "broker.home"

[http]
port = 9800
"#
    )
    .unwrap();

    let mut config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.service_name, "voice_router");
    assert_eq!(config.log_level, LogLevel::Warn);
    assert_eq!(config.mqtt.broker, "broker.home");
    assert_eq!(config.http.port, 9800);

    // Env beats file.
    config
        .apply_env(|key| (key == "ALICIA_LOG_LEVEL").then(|| "debug".into()))
        .unwrap();
    assert_eq!(config.log_level, LogLevel::Debug);

    assert!(config.validate().is_empty());
}

#[test]
fn load_without_file_gives_defaults() {
    let config = Config::load(None).unwrap();
    assert_eq!(config.mqtt.publish_buffer, 1024);
}
