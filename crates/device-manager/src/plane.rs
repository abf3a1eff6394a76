//! Command queue & dispatcher: one FIFO queue and one worker per device.
//!
//! Accept path: validate, assign a command id, push one queue entry per
//! target device, return immediately. Each device's worker pops entries
//! in order, publishes the dispatch, and tracks the ack with retry and
//! backoff. Commands for different devices never wait on each other.
//!
//! The worker only talks to the bus through [`DispatchSink`], so the
//! whole plane runs against a stub in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use alicia_domain::config::DevicesConfig;
use alicia_protocol::command::CommandDispatch;
use alicia_protocol::{
    CommandRequest, CommandState, CommandTicket, DeviceAck, DeviceOutcome, DeviceStatus,
};

use crate::registry::DeviceRegistry;
pub use crate::validate::EnqueueError;
use crate::validate::validate_request;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DispatchSink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where dispatches and resolutions go: the bus in production, a
/// recorder in tests.
#[async_trait]
pub trait DispatchSink: Send + Sync + 'static {
    /// Publish `alicia/devices/<id>/command`.
    async fn dispatch(&self, device_id: &str, dispatch: CommandDispatch) -> anyhow::Result<()>;
    /// A command reached a terminal aggregate state.
    async fn command_resolved(&self, ticket: CommandTicket);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Internal state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type AckSlot = Arc<Mutex<Option<(Uuid, oneshot::Sender<DeviceAck>)>>>;

#[derive(Debug, Clone, Copy)]
struct QueueItem {
    command_id: Uuid,
    /// While the device is offline, the entry waits at most this long.
    expires_at: tokio::time::Instant,
}

struct Worker {
    queue_tx: mpsc::UnboundedSender<QueueItem>,
    online_tx: watch::Sender<bool>,
    ack_slot: AckSlot,
}

/// State shared between the plane front-end and the device workers.
struct Shared {
    cfg: DevicesConfig,
    sink: Arc<dyn DispatchSink>,
    commands: Mutex<HashMap<Uuid, CommandTicket>>,
}

impl Shared {
    fn outcome_state(&self, command_id: Uuid, device_id: &str) -> Option<CommandState> {
        self.commands
            .lock()
            .get(&command_id)
            .and_then(|t| t.outcomes.get(device_id))
            .map(|o| o.state)
    }

    fn bump_attempts(&self, command_id: Uuid, device_id: &str) -> u32 {
        let mut commands = self.commands.lock();
        let Some(outcome) = commands
            .get_mut(&command_id)
            .and_then(|t| t.outcomes.get_mut(device_id))
        else {
            return u32::MAX;
        };
        outcome.attempts += 1;
        outcome.attempts
    }

    fn dispatch_payload(&self, command_id: Uuid) -> Option<CommandDispatch> {
        self.commands.lock().get(&command_id).map(|t| CommandDispatch {
            command_id,
            capability: t.capability.clone(),
            parameters: t.parameters.clone(),
        })
    }

    /// Move one device's outcome; recompute the aggregate. Returns the
    /// ticket when the aggregate just turned terminal — the caller
    /// announces it.
    fn update(
        &self,
        command_id: Uuid,
        device_id: &str,
        next: CommandState,
        reason: Option<String>,
    ) -> Option<CommandTicket> {
        let mut commands = self.commands.lock();
        let ticket = commands.get_mut(&command_id)?;
        let outcome = ticket.outcomes.get_mut(device_id)?;

        if !outcome.state.can_transition_to(next) {
            tracing::warn!(
                %command_id,
                device_id,
                from = ?outcome.state,
                to = ?next,
                "illegal command transition ignored"
            );
            return None;
        }
        outcome.state = next;
        outcome.reason = reason;

        let now = Utc::now();
        if next == CommandState::Dispatched && ticket.dispatched_at.is_none() {
            ticket.dispatched_at = Some(now);
        }

        let was_terminal = ticket.state.is_terminal();
        ticket.state = aggregate(ticket.outcomes.values());
        if ticket.state.is_terminal() && !was_terminal {
            ticket.resolved_at = Some(now);
            return Some(ticket.clone());
        }
        None
    }
}

/// Aggregate rule: completed iff every device completed; cancelled or
/// timed_out iff every device ended that way; failed once all are
/// terminal with mixed results; otherwise still in flight.
fn aggregate<'a>(outcomes: impl Iterator<Item = &'a DeviceOutcome>) -> CommandState {
    let mut all_terminal = true;
    let mut all_completed = true;
    let mut all_cancelled = true;
    let mut all_timed_out = true;
    let mut any_in_flight = false;

    for outcome in outcomes {
        all_terminal &= outcome.state.is_terminal();
        all_completed &= outcome.state == CommandState::Completed;
        all_cancelled &= outcome.state == CommandState::Cancelled;
        all_timed_out &= outcome.state == CommandState::TimedOut;
        any_in_flight |= matches!(
            outcome.state,
            CommandState::Dispatched | CommandState::Acknowledged
        );
    }

    if all_terminal {
        if all_completed {
            CommandState::Completed
        } else if all_cancelled {
            CommandState::Cancelled
        } else if all_timed_out {
            CommandState::TimedOut
        } else {
            CommandState::Failed
        }
    } else if any_in_flight {
        CommandState::Dispatched
    } else {
        CommandState::Queued
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CommandPlane
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CommandPlane {
    registry: Arc<DeviceRegistry>,
    shared: Arc<Shared>,
    workers: Mutex<HashMap<String, Worker>>,
    cancel: CancellationToken,
    pub late_acks: AtomicU64,
}

impl CommandPlane {
    pub fn new(
        cfg: DevicesConfig,
        registry: Arc<DeviceRegistry>,
        sink: Arc<dyn DispatchSink>,
    ) -> Self {
        Self {
            registry,
            shared: Arc::new(Shared {
                cfg,
                sink,
                commands: Mutex::new(HashMap::new()),
            }),
            workers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            late_acks: AtomicU64::new(0),
        }
    }

    /// Validate and accept a command. Returns the ticket immediately;
    /// dispatch happens on the per-device workers.
    pub fn enqueue(&self, request: CommandRequest) -> Result<CommandTicket, EnqueueError> {
        let devices = validate_request(&self.registry, &request)?;

        let command_id = Uuid::new_v4();
        let ticket = CommandTicket {
            command_id,
            device_ids: request.device_ids.clone(),
            capability: request.capability.clone(),
            parameters: request.parameters.clone(),
            state: CommandState::Queued,
            created_at: Utc::now(),
            dispatched_at: None,
            resolved_at: None,
            outcomes: request
                .device_ids
                .iter()
                .map(|id| {
                    (
                        id.clone(),
                        DeviceOutcome {
                            state: CommandState::Queued,
                            attempts: 0,
                            reason: None,
                        },
                    )
                })
                .collect(),
        };
        self.shared.commands.lock().insert(command_id, ticket.clone());

        let item = QueueItem {
            command_id,
            expires_at: tokio::time::Instant::now()
                + Duration::from_millis(self.shared.cfg.offline_queue_ttl_ms),
        };
        for device in &devices {
            self.send_to_worker(&device.device_id, item);
        }

        tracing::info!(
            %command_id,
            capability = %request.capability,
            devices = request.device_ids.len(),
            "command accepted"
        );
        Ok(ticket)
    }

    pub fn get_command(&self, command_id: Uuid) -> Option<CommandTicket> {
        self.shared.commands.lock().get(&command_id).cloned()
    }

    /// Cancel any still-queued legs. In-flight dispatches are not
    /// recalled. Returns the ticket if anything changed.
    pub fn cancel_command(&self, command_id: Uuid) -> Option<CommandTicket> {
        let queued_devices: Vec<String> = {
            let commands = self.shared.commands.lock();
            let ticket = commands.get(&command_id)?;
            ticket
                .outcomes
                .iter()
                .filter(|(_, o)| o.state == CommandState::Queued)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut resolved = None;
        for device_id in &queued_devices {
            if let Some(ticket) = self.shared.update(
                command_id,
                device_id,
                CommandState::Cancelled,
                Some("cancelled".into()),
            ) {
                resolved = Some(ticket);
            }
        }
        if let Some(ticket) = resolved {
            let sink = self.shared.sink.clone();
            let announce = ticket.clone();
            tokio::spawn(async move { sink.command_resolved(announce).await });
            return Some(ticket);
        }
        self.get_command(command_id)
    }

    /// Route a device ack to the worker waiting on it. Unknown or
    /// duplicate acks are counted, not errors.
    pub fn handle_ack(&self, device_id: &str, ack: DeviceAck) {
        let workers = self.workers.lock();
        if let Some(worker) = workers.get(device_id) {
            let mut slot = worker.ack_slot.lock();
            if slot.as_ref().is_some_and(|(cid, _)| *cid == ack.command_id) {
                if let Some((_, tx)) = slot.take() {
                    let _ = tx.send(ack);
                }
                return;
            }
        }
        drop(workers);
        self.late_acks.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(device_id, command_id = %ack.command_id, "late or unmatched ack");
    }

    /// Tell the device's worker about an online/offline transition.
    pub fn set_device_online(&self, device_id: &str, online: bool) {
        if let Some(worker) = self.workers.lock().get(device_id) {
            let _ = worker.online_tx.send(online);
        }
    }

    /// Commands not yet terminal, for health metrics.
    pub fn in_flight(&self) -> usize {
        self.shared
            .commands
            .lock()
            .values()
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    /// Stop all workers (shutdown path).
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn send_to_worker(&self, device_id: &str, item: QueueItem) {
        let mut workers = self.workers.lock();
        let worker = workers.entry(device_id.to_owned()).or_insert_with(|| {
            let (queue_tx, queue_rx) = mpsc::unbounded_channel();
            let online_now = self.registry.status(device_id) == Some(DeviceStatus::Online);
            let (online_tx, online_rx) = watch::channel(online_now);
            let ack_slot: AckSlot = Arc::new(Mutex::new(None));

            tokio::spawn(run_worker(
                device_id.to_owned(),
                self.shared.clone(),
                queue_rx,
                online_rx,
                ack_slot.clone(),
                self.cancel.child_token(),
            ));

            Worker {
                queue_tx,
                online_tx,
                ack_slot,
            }
        });
        // Worker tasks only exit at shutdown, so the send cannot fail
        // while the plane is live.
        let _ = worker.queue_tx.send(item);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-device worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_worker(
    device_id: String,
    shared: Arc<Shared>,
    mut queue_rx: mpsc::UnboundedReceiver<QueueItem>,
    mut online_rx: watch::Receiver<bool>,
    ack_slot: AckSlot,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = queue_rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };
        process_item(&device_id, &shared, item, &mut online_rx, &ack_slot, &cancel).await;
    }
}

async fn process_item(
    device_id: &str,
    shared: &Arc<Shared>,
    item: QueueItem,
    online_rx: &mut watch::Receiver<bool>,
    ack_slot: &AckSlot,
    cancel: &CancellationToken,
) {
    let command_id = item.command_id;
    let max_attempts = shared.cfg.command_max_attempts;
    let ack_timeout = Duration::from_millis(shared.cfg.command_ack_timeout_ms);

    loop {
        // Skip entries cancelled while waiting in the queue.
        match shared.outcome_state(command_id, device_id) {
            Some(CommandState::Queued) => {}
            _ => return,
        }

        // ── Wait for the device to be online ─────────────────────────
        if !*online_rx.borrow() {
            let woke = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout_at(item.expires_at, online_rx.wait_for(|online| *online)) => result.map(|r| r.is_ok()),
            };
            match woke {
                Ok(true) => {}
                Ok(false) => return, // plane dropped
                Err(_) => {
                    announce(shared, shared.update(
                        command_id,
                        device_id,
                        CommandState::TimedOut,
                        Some("expired waiting for device".into()),
                    )).await;
                    return;
                }
            }
            if shared.outcome_state(command_id, device_id) != Some(CommandState::Queued) {
                return;
            }
        }

        // ── Dispatch attempt ─────────────────────────────────────────
        let attempts = shared.bump_attempts(command_id, device_id);
        announce(shared, shared.update(command_id, device_id, CommandState::Dispatched, None)).await;

        let (ack_tx, ack_rx) = oneshot::channel();
        *ack_slot.lock() = Some((command_id, ack_tx));

        let Some(payload) = shared.dispatch_payload(command_id) else {
            ack_slot.lock().take();
            return;
        };
        if let Err(e) = shared.sink.dispatch(device_id, payload).await {
            tracing::warn!(device_id, %command_id, error = %e, "dispatch publish failed");
            ack_slot.lock().take();
            if attempts >= max_attempts {
                announce(shared, shared.update(
                    command_id,
                    device_id,
                    CommandState::TimedOut,
                    Some("dispatch publish failed".into()),
                )).await;
                return;
            }
            announce(shared, shared.update(command_id, device_id, CommandState::Queued, None)).await;
            if sleep_backoff(attempts, cancel).await.is_err() {
                return;
            }
            continue;
        }

        // ── Await ack / timeout / offline ────────────────────────────
        tokio::select! {
            _ = cancel.cancelled() => {
                ack_slot.lock().take();
                return;
            }

            ack = ack_rx => {
                match ack {
                    Ok(ack) if ack.success => {
                        shared.update(command_id, device_id, CommandState::Acknowledged, None);
                        announce(shared, shared.update(
                            command_id,
                            device_id,
                            CommandState::Completed,
                            None,
                        )).await;
                    }
                    Ok(ack) => {
                        announce(shared, shared.update(
                            command_id,
                            device_id,
                            CommandState::Failed,
                            ack.reason.or_else(|| Some("device reported failure".into())),
                        )).await;
                    }
                    Err(_) => return,
                }
                return;
            }

            // Device dropped offline mid-flight: back to queued (unless
            // out of attempts) and wait for it to come back.
            is_err = async { online_rx.wait_for(|online| !*online).await.is_err() } => {
                ack_slot.lock().take();
                if is_err {
                    return;
                }
                if attempts >= max_attempts {
                    announce(shared, shared.update(
                        command_id,
                        device_id,
                        CommandState::TimedOut,
                        Some("device went offline".into()),
                    )).await;
                    return;
                }
                announce(shared, shared.update(command_id, device_id, CommandState::Queued, None)).await;
                continue;
            }

            _ = tokio::time::sleep(ack_timeout) => {
                ack_slot.lock().take();
                if attempts >= max_attempts {
                    announce(shared, shared.update(
                        command_id,
                        device_id,
                        CommandState::TimedOut,
                        Some(format!("no ack after {attempts} attempts")),
                    )).await;
                    return;
                }
                announce(shared, shared.update(command_id, device_id, CommandState::Queued, None)).await;
                if sleep_backoff(attempts, cancel).await.is_err() {
                    return;
                }
                continue;
            }
        }
    }
}

/// Retry backoff: 1 s, 2 s, 4 s after the first, second, third attempt.
async fn sleep_backoff(attempts: u32, cancel: &CancellationToken) -> Result<(), ()> {
    let delay = Duration::from_secs(1) * 2u32.saturating_pow(attempts.saturating_sub(1));
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(()),
    }
}

async fn announce(shared: &Arc<Shared>, resolved: Option<CommandTicket>) {
    if let Some(ticket) = resolved {
        tracing::info!(
            command_id = %ticket.command_id,
            state = ?ticket.state,
            "command resolved"
        );
        shared.sink.command_resolved(ticket).await;
    }
}
