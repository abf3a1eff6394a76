//! Integration tests for the command plane: enqueue → dispatch → ack
//! with retries, offline queuing, and per-device FIFO ordering, all
//! against a recording sink and paused time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use alicia_device_manager::plane::{CommandPlane, DispatchSink, EnqueueError};
use alicia_device_manager::registry::DeviceRegistry;
use alicia_domain::config::DevicesConfig;
use alicia_protocol::command::CommandDispatch;
use alicia_protocol::{
    Capability, CommandRequest, CommandState, CommandTicket, Device, DeviceAck, DeviceStatus,
    ParamSchema,
};

// ── Recording sink ──────────────────────────────────────────────────

struct RecordingSink {
    dispatch_tx: mpsc::UnboundedSender<(String, CommandDispatch)>,
    resolved: Mutex<Vec<CommandTicket>>,
}

#[async_trait]
impl DispatchSink for RecordingSink {
    async fn dispatch(&self, device_id: &str, dispatch: CommandDispatch) -> anyhow::Result<()> {
        self.dispatch_tx.send((device_id.to_owned(), dispatch))?;
        Ok(())
    }

    async fn command_resolved(&self, ticket: CommandTicket) {
        self.resolved.lock().push(ticket);
    }
}

struct Fixture {
    registry: Arc<DeviceRegistry>,
    plane: Arc<CommandPlane>,
    sink: Arc<RecordingSink>,
    dispatch_rx: mpsc::UnboundedReceiver<(String, CommandDispatch)>,
}

fn fixture() -> Fixture {
    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
    let sink = Arc::new(RecordingSink {
        dispatch_tx,
        resolved: Mutex::new(Vec::new()),
    });
    let registry = Arc::new(DeviceRegistry::new());
    let plane = Arc::new(CommandPlane::new(
        DevicesConfig::default(),
        registry.clone(),
        sink.clone(),
    ));
    Fixture {
        registry,
        plane,
        sink,
        dispatch_rx,
    }
}

fn light(device_id: &str, status: DeviceStatus) -> Device {
    Device {
        device_id: device_id.into(),
        device_type: "light".into(),
        room: Some("living_room".into()),
        capabilities: BTreeMap::from([
            ("turn_on".into(), Capability::default()),
            (
                "set_brightness".into(),
                Capability {
                    parameters: BTreeMap::from([(
                        "level".into(),
                        ParamSchema::int(0, 100).required(),
                    )]),
                },
            ),
        ]),
        status,
        last_seen: Utc::now(),
        metadata: BTreeMap::new(),
    }
}

fn turn_on(device_ids: &[&str]) -> CommandRequest {
    CommandRequest {
        device_ids: device_ids.iter().map(|s| (*s).to_owned()).collect(),
        capability: "turn_on".into(),
        parameters: BTreeMap::new(),
        allow_offline: false,
    }
}

async fn wait_for_state(plane: &CommandPlane, command_id: Uuid, want: CommandState) {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if plane.get_command(command_id).map(|t| t.state) == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "command never reached {want:?}, last = {:?}",
            plane.get_command(command_id).map(|t| t.state)
        )
    });
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn command_completes_on_ack() {
    let mut fx = fixture();
    fx.registry.register(light("light.a", DeviceStatus::Online)).unwrap();

    let ticket = fx.plane.enqueue(turn_on(&["light.a"])).unwrap();
    assert_eq!(ticket.state, CommandState::Queued);

    let (device_id, dispatch) = fx.dispatch_rx.recv().await.unwrap();
    assert_eq!(device_id, "light.a");
    assert_eq!(dispatch.command_id, ticket.command_id);
    assert_eq!(dispatch.capability, "turn_on");

    fx.plane.handle_ack(
        "light.a",
        DeviceAck {
            command_id: ticket.command_id,
            success: true,
            reason: None,
        },
    );

    wait_for_state(&fx.plane, ticket.command_id, CommandState::Completed).await;
    let done = fx.plane.get_command(ticket.command_id).unwrap();
    assert!(done.resolved_at.is_some());
    assert!(done.dispatched_at.is_some());
    assert_eq!(done.outcomes["light.a"].attempts, 1);
    assert_eq!(fx.sink.resolved.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn commands_for_one_device_dispatch_in_order() {
    let mut fx = fixture();
    fx.registry.register(light("light.a", DeviceStatus::Online)).unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(fx.plane.enqueue(turn_on(&["light.a"])).unwrap().command_id);
    }

    // Each dispatch must match enqueue order; ack to release the next.
    for expected in &ids {
        let (_, dispatch) = fx.dispatch_rx.recv().await.unwrap();
        assert_eq!(dispatch.command_id, *expected);
        fx.plane.handle_ack(
            "light.a",
            DeviceAck {
                command_id: *expected,
                success: true,
                reason: None,
            },
        );
    }
    for id in ids {
        wait_for_state(&fx.plane, id, CommandState::Completed).await;
    }
}

#[tokio::test(start_paused = true)]
async fn ack_timeout_retries_then_gives_up() {
    let mut fx = fixture();
    fx.registry.register(light("light.a", DeviceStatus::Online)).unwrap();

    let ticket = fx.plane.enqueue(turn_on(&["light.a"])).unwrap();

    // Never ack: expect exactly max_attempts dispatches.
    for _ in 0..3 {
        let (_, dispatch) = fx.dispatch_rx.recv().await.unwrap();
        assert_eq!(dispatch.command_id, ticket.command_id);
    }

    wait_for_state(&fx.plane, ticket.command_id, CommandState::TimedOut).await;
    let done = fx.plane.get_command(ticket.command_id).unwrap();
    assert_eq!(done.outcomes["light.a"].attempts, 3);
    // No fourth dispatch after giving up.
    assert!(fx.dispatch_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn failure_ack_fails_without_retry() {
    let mut fx = fixture();
    fx.registry.register(light("light.a", DeviceStatus::Online)).unwrap();

    let ticket = fx.plane.enqueue(turn_on(&["light.a"])).unwrap();
    let _ = fx.dispatch_rx.recv().await.unwrap();
    fx.plane.handle_ack(
        "light.a",
        DeviceAck {
            command_id: ticket.command_id,
            success: false,
            reason: Some("bulb burnt out".into()),
        },
    );

    wait_for_state(&fx.plane, ticket.command_id, CommandState::Failed).await;
    let done = fx.plane.get_command(ticket.command_id).unwrap();
    assert_eq!(done.outcomes["light.a"].attempts, 1);
    assert_eq!(done.outcomes["light.a"].reason.as_deref(), Some("bulb burnt out"));
    assert!(fx.dispatch_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn offline_device_queues_until_online() {
    let mut fx = fixture();
    fx.registry.register(light("speaker.kitchen_1", DeviceStatus::Offline)).unwrap();

    // Fails fast without allow_offline.
    let err = fx.plane.enqueue(turn_on(&["speaker.kitchen_1"])).unwrap_err();
    assert!(matches!(err, EnqueueError::DeviceUnavailable(..)));

    let mut request = turn_on(&["speaker.kitchen_1"]);
    request.allow_offline = true;
    let ticket = fx.plane.enqueue(request).unwrap();

    // An offline device never observes a dispatch.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(fx.dispatch_rx.try_recv().is_err());
    assert_eq!(
        fx.plane.get_command(ticket.command_id).unwrap().state,
        CommandState::Queued
    );

    // Device comes back: dispatched promptly, completes on ack.
    fx.registry.set_status("speaker.kitchen_1", DeviceStatus::Online);
    fx.plane.set_device_online("speaker.kitchen_1", true);

    let (_, dispatch) = fx.dispatch_rx.recv().await.unwrap();
    assert_eq!(dispatch.command_id, ticket.command_id);
    fx.plane.handle_ack(
        "speaker.kitchen_1",
        DeviceAck {
            command_id: ticket.command_id,
            success: true,
            reason: None,
        },
    );
    wait_for_state(&fx.plane, ticket.command_id, CommandState::Completed).await;
}

#[tokio::test(start_paused = true)]
async fn offline_queue_entry_expires() {
    let fx = fixture();
    fx.registry.register(light("light.a", DeviceStatus::Offline)).unwrap();

    let mut request = turn_on(&["light.a"]);
    request.allow_offline = true;
    let ticket = fx.plane.enqueue(request).unwrap();

    // Past the offline queue TTL the entry times out on its own.
    tokio::time::sleep(Duration::from_secs(601)).await;
    wait_for_state(&fx.plane, ticket.command_id, CommandState::TimedOut).await;
}

#[tokio::test(start_paused = true)]
async fn validation_error_enqueues_nothing() {
    let mut fx = fixture();
    fx.registry.register(light("light.a", DeviceStatus::Online)).unwrap();

    let err = fx
        .plane
        .enqueue(CommandRequest {
            device_ids: vec!["light.a".into()],
            capability: "set_brightness".into(),
            parameters: BTreeMap::from([("level".into(), json!(150))]),
            allow_offline: false,
        })
        .unwrap_err();

    let EnqueueError::Validation(fields) = err else {
        panic!("expected Validation");
    };
    assert_eq!(fields[0].parameter, "level");
    assert_eq!(fields[0].reason, "out_of_range");
    assert_eq!(fields[0].allowed.as_deref(), Some("[0,100]"));

    assert_eq!(fx.plane.in_flight(), 0);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(fx.dispatch_rx.try_recv().is_err()); // no ack timer, no dispatch
}

#[tokio::test(start_paused = true)]
async fn multi_device_partial_failure_reports_per_device() {
    let mut fx = fixture();
    fx.registry.register(light("light.a", DeviceStatus::Online)).unwrap();
    fx.registry.register(light("light.b", DeviceStatus::Online)).unwrap();

    let ticket = fx.plane.enqueue(turn_on(&["light.a", "light.b"])).unwrap();

    for _ in 0..2 {
        let (device_id, dispatch) = fx.dispatch_rx.recv().await.unwrap();
        let success = device_id == "light.a";
        fx.plane.handle_ack(
            &device_id,
            DeviceAck {
                command_id: dispatch.command_id,
                success,
                reason: (!success).then(|| "jammed".into()),
            },
        );
    }

    wait_for_state(&fx.plane, ticket.command_id, CommandState::Failed).await;
    let done = fx.plane.get_command(ticket.command_id).unwrap();
    assert_eq!(done.outcomes["light.a"].state, CommandState::Completed);
    assert_eq!(done.outcomes["light.b"].state, CommandState::Failed);
    assert_eq!(done.outcomes["light.b"].reason.as_deref(), Some("jammed"));
}

#[tokio::test(start_paused = true)]
async fn cancel_skips_queued_legs() {
    let mut fx = fixture();
    fx.registry.register(light("light.a", DeviceStatus::Offline)).unwrap();

    let mut request = turn_on(&["light.a"]);
    request.allow_offline = true;
    let ticket = fx.plane.enqueue(request).unwrap();

    let cancelled = fx.plane.cancel_command(ticket.command_id).unwrap();
    assert_eq!(cancelled.state, CommandState::Cancelled);

    // Coming online later must not dispatch a cancelled command.
    fx.registry.set_status("light.a", DeviceStatus::Online);
    fx.plane.set_device_online("light.a", true);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(fx.dispatch_rx.try_recv().is_err());
}
