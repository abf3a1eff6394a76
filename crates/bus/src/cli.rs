//! Shared binary glue: CLI parsing, config precedence, tracing init,
//! signal handling. Every service binary is a thin wrapper over
//! [`main`].

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use alicia_domain::config::{Config, ConfigSeverity, LogLevel};

use crate::service::Service;

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the service name.
    #[arg(long, global = true)]
    pub service_name: Option<String>,

    /// Override the MQTT broker host.
    #[arg(long, global = true)]
    pub mqtt_broker: Option<String>,

    /// Override the MQTT broker port.
    #[arg(long, global = true)]
    pub mqtt_port: Option<u16>,

    /// Override the HTTP surface port.
    #[arg(long, global = true)]
    pub http_port: Option<u16>,

    /// Override the log level (debug|info|warn|error).
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the service (default).
    Serve,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the effective configuration and exit.
    Validate,
    /// Print the effective configuration as TOML.
    Show,
}

/// Resolve config with the full precedence chain:
/// defaults < file < environment < command line.
pub fn load_config(cli: &Cli, default_service_name: &str) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if config.service_name.is_empty() {
        config.service_name = default_service_name.to_owned();
    }
    config.apply_process_env()?;

    if let Some(name) = &cli.service_name {
        config.service_name = name.clone();
    }
    if let Some(broker) = &cli.mqtt_broker {
        config.mqtt.broker = broker.clone();
    }
    if let Some(port) = cli.mqtt_port {
        config.mqtt.port = port;
    }
    if let Some(port) = cli.http_port {
        config.http.port = port;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    Ok(config)
}

/// Initialize structured JSON tracing (only for the `serve` command).
pub fn init_tracing(config: &Config) {
    let fallback = format!("{},rumqttc=warn", config.log_level.as_directive());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("ALICIA_LOG").unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .json()
        .init();
}

/// Cancel the returned token on SIGINT/SIGTERM.
pub fn shutdown_on_signals() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(term) => term,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                        trigger.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => tracing::info!("SIGINT received"),
                _ = term.recv() => tracing::info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("ctrl-c received");
        }
        trigger.cancel();
    });
    token
}

/// Full binary entry point: parse, dispatch subcommands, serve.
///
/// `build` wires the service-specific handlers and background tasks.
pub async fn main<F>(default_service_name: &str, build: F) -> anyhow::Result<()>
where
    F: FnOnce(Config, &CancellationToken) -> anyhow::Result<Service>,
{
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            let config = load_config(&cli, default_service_name)?;
            init_tracing(&config);
            serve(config, build).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = load_config(&cli, default_service_name)?;
            let issues = config.validate();
            for issue in &issues {
                eprintln!("{issue}");
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("configuration ok");
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = load_config(&cli, default_service_name)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("{default_service_name} {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn serve<F>(config: Config, build: F) -> anyhow::Result<()>
where
    F: FnOnce(Config, &CancellationToken) -> anyhow::Result<Service>,
{
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    let shutdown = shutdown_on_signals();
    let service = build(config, &shutdown)?;
    service.run(shutdown).await?;
    Ok(())
}
