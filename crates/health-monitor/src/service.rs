//! Bus wiring for the health monitor.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use alicia_bus::protocol::{topics, HealthSnapshot};
use alicia_bus::{handler_fn, Service, ServiceBuilder};
use alicia_domain::Config;

use crate::monitor::FleetMonitor;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the fully-wired health monitor service.
pub fn build(config: Config, shutdown: &CancellationToken) -> anyhow::Result<Service> {
    let mut service = ServiceBuilder::new(config.clone(), VERSION).build()?;
    let handle = service.handle();
    let monitor = Arc::new(FleetMonitor::new(config.heartbeat_interval_ms));

    // ── Heartbeat intake ─────────────────────────────────────────────
    {
        let monitor = monitor.clone();
        service.register_handler(
            topics::HEALTH_ALL,
            handler_fn(move |ctx, topic, envelope| {
                let monitor = monitor.clone();
                async move {
                    // Our own republished fleet view also matches the
                    // wildcard; skip it.
                    if topic == topics::HEALTH_FLEET {
                        return Ok(());
                    }
                    let snapshot: HealthSnapshot = envelope.payload_as()?;
                    if monitor.observe(snapshot, chrono::Utc::now()) {
                        ctx.handle.report_metric("fleet_recoveries", 1.0);
                    }
                    Ok(())
                }
            }),
        );
    }

    // ── Sweep + fleet publish ────────────────────────────────────────
    {
        let monitor = monitor.clone();
        let handle = handle.clone();
        let cancel = shutdown.child_token();
        let period = Duration::from_millis(config.heartbeat_interval_ms);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let now = chrono::Utc::now();
                monitor.sweep(now);
                let view = monitor.view(now);
                handle.report_metric("services_online", view.services_online as f64);
                handle.report_metric("services_offline", view.services_offline as f64);
                match serde_json::to_value(&view) {
                    Ok(payload) => {
                        if let Err(e) = handle.publish_retained(topics::HEALTH_FLEET, payload).await
                        {
                            tracing::warn!(error = %e, "fleet view publish failed");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "fleet view serialization failed"),
                }
            }
        });
    }

    Ok(service)
}
