//! Bus wiring for the device manager: topic handlers, the RPC surface,
//! and the offline sweeper.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use alicia_bus::protocol::command::CommandDispatch;
use alicia_bus::protocol::envelope::ErrorPayload;
use alicia_bus::protocol::{topics, CommandRequest, CommandTicket, Device, DeviceAck, DeviceStatus};
use alicia_bus::{handler_fn, Service, ServiceBuilder, ServiceHandle};
use alicia_domain::Config;

use crate::plane::{CommandPlane, DispatchSink, EnqueueError};
use crate::registry::{DeviceFilter, DeviceRegistry, RegistryError, StatusChange};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RPC surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Operations accepted on `alicia/device_manager/request`.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum DeviceManagerOp {
    EnqueueCommand(CommandRequest),
    RegisterDevice(Device),
    UnregisterDevice {
        device_id: String,
    },
    GetCommand {
        command_id: Uuid,
    },
    CancelCommand {
        command_id: Uuid,
    },
    GetDevice {
        device_id: String,
    },
    ListDevices {
        #[serde(default)]
        device_type: Option<String>,
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        capability: Option<String>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch sink over the bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct BusSink {
    handle: ServiceHandle,
}

#[async_trait]
impl DispatchSink for BusSink {
    async fn dispatch(&self, device_id: &str, dispatch: CommandDispatch) -> anyhow::Result<()> {
        let payload = serde_json::to_value(&dispatch)?;
        self.handle
            .publish_command(&topics::device_command(device_id), device_id, payload)
            .await?;
        Ok(())
    }

    async fn command_resolved(&self, ticket: CommandTicket) {
        let payload = match serde_json::to_value(&ticket) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize command resolution");
                return;
            }
        };
        if let Err(e) = self
            .handle
            .publish_event_durable(topics::DEVICES_COMMAND_STATUS, payload)
            .await
        {
            tracing::warn!(error = %e, "command_status publish failed");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the fully-wired device manager service.
pub fn build(config: Config, shutdown: &CancellationToken) -> anyhow::Result<Service> {
    let mut service = ServiceBuilder::new(config.clone(), VERSION).build()?;
    let handle = service.handle();

    let registry = Arc::new(DeviceRegistry::new());
    let sink = Arc::new(BusSink {
        handle: handle.clone(),
    });
    let plane = Arc::new(CommandPlane::new(
        config.devices.clone(),
        registry.clone(),
        sink,
    ));

    // ── Device announcements ─────────────────────────────────────────
    {
        let registry = registry.clone();
        let plane = plane.clone();
        service.register_handler(
            topics::DEVICES_REGISTER,
            handler_fn(move |ctx, _topic, envelope| {
                let registry = registry.clone();
                let plane = plane.clone();
                async move {
                    let device: Device = envelope.payload_as()?;
                    let device_id = device.device_id.clone();
                    handle_registration(&ctx.handle, &registry, &plane, device).await?;
                    ctx.handle
                        .publish_event(
                            topics::DEVICES_REGISTERED,
                            serde_json::json!({ "device_id": device_id }),
                        )
                        .await?;
                    Ok(())
                }
            }),
        );
    }

    {
        let registry = registry.clone();
        service.register_handler(
            topics::DEVICES_UNREGISTER,
            handler_fn(move |ctx, _topic, envelope| {
                let registry = registry.clone();
                async move {
                    #[derive(Deserialize)]
                    struct Unregister {
                        device_id: String,
                    }
                    let req: Unregister = envelope.payload_as()?;
                    if registry.unregister(&req.device_id) {
                        // Tombstone the retained state so a registry
                        // restart does not resurrect the device.
                        ctx.handle
                            .clear_retained(&topics::device_state(&req.device_id))
                            .await?;
                    }
                    Ok(())
                }
            }),
        );
    }

    // ── Retained state messages (also the rebuild path) ──────────────
    {
        let registry = registry.clone();
        let plane = plane.clone();
        service.register_handler(
            topics::DEVICE_STATE_FILTER,
            handler_fn(move |ctx, topic, envelope| {
                let registry = registry.clone();
                let plane = plane.clone();
                async move {
                    let Some((device_id, _)) = topics::parse_device_topic(&topic) else {
                        anyhow::bail!("unparseable device topic: {topic}");
                    };
                    let device: Device = envelope.payload_as()?;
                    anyhow::ensure!(
                        device.device_id == device_id,
                        "state topic {topic} carries device {}",
                        device.device_id
                    );
                    handle_registration(&ctx.handle, &registry, &plane, device).await?;
                    Ok(())
                }
            }),
        );
    }

    {
        let registry = registry.clone();
        let plane = plane.clone();
        service.register_handler(
            topics::DEVICE_HEARTBEAT_FILTER,
            handler_fn(move |ctx, topic, _envelope| {
                let registry = registry.clone();
                let plane = plane.clone();
                async move {
                    let Some((device_id, _)) = topics::parse_device_topic(&topic) else {
                        anyhow::bail!("unparseable device topic: {topic}");
                    };
                    registry.touch(device_id);
                    // A heartbeat from an offline device brings it back.
                    if registry.status(device_id) == Some(DeviceStatus::Offline) {
                        if let Some(change) = registry.set_status(device_id, DeviceStatus::Online) {
                            publish_status_change(&ctx.handle, &registry, &plane, &change).await;
                        }
                    }
                    Ok(())
                }
            }),
        );
    }

    // ── Device acks ──────────────────────────────────────────────────
    {
        let registry = registry.clone();
        let plane = plane.clone();
        service.register_handler(
            topics::DEVICE_ACK_FILTER,
            handler_fn(move |_ctx, topic, envelope| {
                let registry = registry.clone();
                let plane = plane.clone();
                async move {
                    let Some((device_id, _)) = topics::parse_device_topic(&topic) else {
                        anyhow::bail!("unparseable device topic: {topic}");
                    };
                    let ack: DeviceAck = envelope.payload_as()?;
                    registry.touch(device_id);
                    plane.handle_ack(device_id, ack);
                    Ok(())
                }
            }),
        );
    }

    // ── RPC ──────────────────────────────────────────────────────────
    {
        let registry = registry.clone();
        let plane = plane.clone();
        service.register_handler(
            &topics::service_request(&config.service_name),
            handler_fn(move |ctx, _topic, envelope| {
                let registry = registry.clone();
                let plane = plane.clone();
                async move { handle_rpc(&ctx.handle, &registry, &plane, envelope).await }
            }),
        );
    }

    // ── Offline sweeper ──────────────────────────────────────────────
    {
        let registry = registry.clone();
        let plane = plane.clone();
        let handle = handle.clone();
        let threshold_ms = config.devices.offline_threshold_ms;
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            // Sweep at a quarter of the threshold, bounded to stay
            // responsive for short test thresholds.
            let period = Duration::from_millis((threshold_ms / 4).clamp(250, 30_000));
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                for change in registry.sweep_offline(chrono::Utc::now(), threshold_ms) {
                    publish_status_change(&handle, &registry, &plane, &change).await;
                }
                handle.report_metric("devices_registered", registry.len() as f64);
                handle.report_metric("commands_in_flight", plane.in_flight() as f64);
            }
        });
    }

    service.set_http_routes(crate::http::routes(registry.clone(), plane.clone()));

    // Stop workers inside the shutdown grace window.
    {
        let plane = plane.clone();
        service.set_on_stop(move |_handle| async move {
            plane.shutdown();
            Ok(())
        });
    }

    Ok(service)
}

/// Register/refresh a device and fan out the consequences: retained
/// state, status_changed event, worker wake-ups.
async fn handle_registration(
    handle: &ServiceHandle,
    registry: &DeviceRegistry,
    plane: &CommandPlane,
    device: Device,
) -> anyhow::Result<()> {
    let device_id = device.device_id.clone();
    let status = device.status;

    let previous = registry.status(&device_id);
    match registry.register(device.clone()) {
        Ok(_) => {}
        Err(e @ RegistryError::Conflict { .. }) => {
            anyhow::bail!(e);
        }
    }
    // `register` stores the announced status, so transitions are
    // detected against the pre-registration snapshot.
    match previous {
        Some(from) if from != status => {
            let change = StatusChange {
                device_id: device_id.clone(),
                from,
                to: status,
            };
            publish_status_change(handle, registry, plane, &change).await;
        }
        _ => plane.set_device_online(&device_id, status == DeviceStatus::Online),
    }

    // Keep the retained copy authoritative for restarts.
    let snapshot = registry.get(&device_id).unwrap_or(device);
    handle
        .publish_retained(
            &topics::device_state(&device_id),
            serde_json::to_value(&snapshot)?,
        )
        .await?;
    Ok(())
}

async fn publish_status_change(
    handle: &ServiceHandle,
    registry: &DeviceRegistry,
    plane: &CommandPlane,
    change: &StatusChange,
) {
    plane.set_device_online(&change.device_id, change.to == DeviceStatus::Online);

    let payload = serde_json::json!({
        "device_id": change.device_id,
        "from": change.from,
        "to": change.to,
    });
    if let Err(e) = handle
        .publish_event(topics::DEVICES_STATUS_CHANGED, payload)
        .await
    {
        tracing::warn!(error = %e, "status_changed publish failed");
    }

    // Refresh the retained state so restarts see the new status.
    if let Some(device) = registry.get(&change.device_id) {
        if let Ok(value) = serde_json::to_value(&device) {
            let _ = handle
                .publish_retained(&topics::device_state(&change.device_id), value)
                .await;
        }
    }
}

async fn handle_rpc(
    handle: &ServiceHandle,
    registry: &DeviceRegistry,
    plane: &CommandPlane,
    envelope: alicia_bus::Envelope,
) -> anyhow::Result<()> {
    let op: DeviceManagerOp = match envelope.payload_as() {
        Ok(op) => op,
        Err(e) => {
            handle
                .respond_error(
                    &envelope,
                    ErrorPayload::new("bad_request", format!("unrecognized operation: {e}")),
                )
                .await?;
            return Ok(());
        }
    };

    match op {
        DeviceManagerOp::EnqueueCommand(request) => match plane.enqueue(request) {
            Ok(ticket) => {
                handle.respond(&envelope, serde_json::to_value(&ticket)?).await?;
            }
            Err(e) => {
                handle.respond_error(&envelope, enqueue_error_payload(e)).await?;
            }
        },
        DeviceManagerOp::RegisterDevice(device) => {
            let device_id = device.device_id.clone();
            // Surface conflicts synchronously, unlike the event path.
            if let Some(existing) = registry.get(&device_id) {
                if existing.device_type != device.device_type {
                    handle
                        .respond_error(
                            &envelope,
                            ErrorPayload::new(
                                "conflict",
                                format!(
                                    "device {device_id} already registered as {}",
                                    existing.device_type
                                ),
                            ),
                        )
                        .await?;
                    return Ok(());
                }
            }
            handle_registration(handle, registry, plane, device).await?;
            handle
                .respond(&envelope, serde_json::json!({ "device_id": device_id }))
                .await?;
        }
        DeviceManagerOp::UnregisterDevice { device_id } => {
            let existed = registry.unregister(&device_id);
            if existed {
                handle.clear_retained(&topics::device_state(&device_id)).await?;
            }
            handle
                .respond(&envelope, serde_json::json!({ "removed": existed }))
                .await?;
        }
        DeviceManagerOp::GetCommand { command_id } => match plane.get_command(command_id) {
            Some(ticket) => {
                handle.respond(&envelope, serde_json::to_value(&ticket)?).await?;
            }
            None => {
                handle
                    .respond_error(
                        &envelope,
                        ErrorPayload::new("not_found", format!("command {command_id}")),
                    )
                    .await?;
            }
        },
        DeviceManagerOp::CancelCommand { command_id } => match plane.cancel_command(command_id) {
            Some(ticket) => {
                handle.respond(&envelope, serde_json::to_value(&ticket)?).await?;
            }
            None => {
                handle
                    .respond_error(
                        &envelope,
                        ErrorPayload::new("not_found", format!("command {command_id}")),
                    )
                    .await?;
            }
        },
        DeviceManagerOp::GetDevice { device_id } => match registry.get(&device_id) {
            Some(device) => {
                handle.respond(&envelope, serde_json::to_value(&device)?).await?;
            }
            None => {
                handle
                    .respond_error(
                        &envelope,
                        ErrorPayload::new("not_found", format!("device {device_id}")),
                    )
                    .await?;
            }
        },
        DeviceManagerOp::ListDevices {
            device_type,
            room,
            capability,
        } => {
            let devices = registry.list(&DeviceFilter {
                device_type,
                room,
                capability,
            });
            handle.respond(&envelope, serde_json::to_value(&devices)?).await?;
        }
    }
    Ok(())
}

fn enqueue_error_payload(error: EnqueueError) -> ErrorPayload {
    match error {
        EnqueueError::Validation(fields) => {
            let mut payload = ErrorPayload::new("validation_error", "parameter validation failed");
            payload.fields = fields;
            payload
        }
        EnqueueError::UnknownDevice(device_id) => {
            ErrorPayload::new("not_found", format!("device {device_id}"))
        }
        EnqueueError::DeviceUnavailable(device_id, status) => ErrorPayload::new(
            "device_offline",
            format!("device {device_id} is {status:?}"),
        ),
        EnqueueError::CapabilityNotSupported {
            device_id,
            capability,
        } => ErrorPayload::new(
            "capability_not_supported",
            format!("device {device_id} does not support {capability}"),
        ),
    }
}
