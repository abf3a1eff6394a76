//! Bus wiring for the voice router: collaborator RPC, topic handlers,
//! and background sweepers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use alicia_bus::correlation::RequestError;
use alicia_bus::protocol::envelope::ErrorPayload;
use alicia_bus::protocol::voice::{VoiceCancel, VoiceCommand, VoiceResponse};
use alicia_bus::protocol::{
    topics, AiRequest, AiResponse, CommandRequest, CommandState, CommandTicket, SttRequest,
    SttResponse, TtsRequest, TtsResponse,
};
use alicia_bus::{handler_fn, Service, ServiceBuilder, ServiceHandle};
use alicia_domain::Config;

use crate::pipeline::{spawn_session_sweeper, CollabError, Collaborators, Pipeline, PipelineError};
use crate::sessions::SessionStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often `await_command` polls the device manager.
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collaborators over the bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct BusCollaborators {
    handle: ServiceHandle,
}

impl BusCollaborators {
    pub fn new(handle: ServiceHandle) -> Self {
        Self { handle }
    }

    async fn call<Req, Resp>(
        &self,
        destination: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, CollabError>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let payload = serde_json::to_value(request)
            .map_err(|e| CollabError::Bus(format!("serialize: {e}")))?;
        let envelope = self
            .handle
            .request(destination, payload, Some(timeout))
            .await
            .map_err(map_request_error)?;
        envelope
            .payload_as()
            .map_err(|e| CollabError::Bus(format!("decode {destination} response: {e}")))
    }

    async fn device_manager_op<Resp: serde::de::DeserializeOwned>(
        &self,
        op: &str,
        mut payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<Resp, CollabError> {
        if let Some(map) = payload.as_object_mut() {
            map.insert("op".into(), serde_json::Value::String(op.to_owned()));
        }
        let envelope = self
            .handle
            .request("device_manager", payload, Some(timeout))
            .await
            .map_err(map_request_error)?;
        envelope
            .payload_as()
            .map_err(|e| CollabError::Bus(format!("decode device_manager response: {e}")))
    }
}

fn map_request_error(error: RequestError) -> CollabError {
    match error {
        RequestError::Timeout => CollabError::Timeout,
        RequestError::Responder { code, message } => CollabError::Upstream { code, message },
        RequestError::Cancelled => CollabError::Bus("request cancelled".into()),
        RequestError::Bus(message) => CollabError::Bus(message),
    }
}

#[async_trait]
impl Collaborators for BusCollaborators {
    async fn stt(&self, request: SttRequest, timeout: Duration) -> Result<SttResponse, CollabError> {
        self.call("stt", &request, timeout).await
    }

    async fn ai(&self, request: AiRequest, timeout: Duration) -> Result<AiResponse, CollabError> {
        self.call("ai", &request, timeout).await
    }

    async fn tts(&self, request: TtsRequest, timeout: Duration) -> Result<TtsResponse, CollabError> {
        self.call("tts", &request, timeout).await
    }

    async fn enqueue_command(
        &self,
        request: CommandRequest,
    ) -> Result<CommandTicket, CollabError> {
        let payload = serde_json::to_value(&request)
            .map_err(|e| CollabError::Bus(format!("serialize: {e}")))?;
        self.device_manager_op("enqueue_command", payload, Duration::from_secs(5))
            .await
    }

    /// Poll the device manager until the command resolves or the wait
    /// budget runs out.
    async fn await_command(
        &self,
        command_id: Uuid,
        timeout: Duration,
    ) -> Result<CommandState, CollabError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let ticket: CommandTicket = self
                .device_manager_op(
                    "get_command",
                    serde_json::json!({ "command_id": command_id }),
                    Duration::from_secs(2),
                )
                .await?;
            if ticket.state.is_terminal() {
                return Ok(ticket.state);
            }
            if tokio::time::Instant::now() + COMMAND_POLL_INTERVAL >= deadline {
                return Err(CollabError::Timeout);
            }
            tokio::time::sleep(COMMAND_POLL_INTERVAL).await;
        }
    }

    async fn publish_response(&self, response: VoiceResponse) -> Result<(), CollabError> {
        let payload = serde_json::to_value(&response)
            .map_err(|e| CollabError::Bus(format!("serialize: {e}")))?;
        self.handle
            .publish_event_durable(topics::VOICE_RESPONSE, payload)
            .await
            .map_err(|e| CollabError::Bus(e.to_string()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RPC surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Operations accepted on `alicia/voice_router/request`.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum VoiceRouterOp {
    GetSession { session_id: Uuid },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the fully-wired voice router service.
pub fn build(config: Config, shutdown: &CancellationToken) -> anyhow::Result<Service> {
    let mut service = ServiceBuilder::new(config.clone(), VERSION).build()?;
    let handle = service.handle();

    let store = Arc::new(SessionStore::new(
        config.voice.max_concurrent_sessions,
        Duration::from_millis(config.voice.session_ttl_ms),
    ));
    let collab = Arc::new(BusCollaborators::new(handle.clone()));
    let pipeline = Arc::new(Pipeline::new(
        config.voice.clone(),
        Duration::from_millis(config.devices.command_ack_timeout_ms),
        store.clone(),
        collab,
    ));

    // ── Inbound voice commands ───────────────────────────────────────
    {
        let pipeline = pipeline.clone();
        service.register_handler(
            topics::VOICE_COMMAND,
            handler_fn(move |ctx, _topic, envelope| {
                let pipeline = pipeline.clone();
                async move {
                    let command: VoiceCommand = envelope.payload_as()?;
                    let session_id = command.session_id;
                    match pipeline.handle_voice_command(command).await {
                        Ok(()) => Ok(()),
                        Err(PipelineError::Busy) => {
                            // Callers may retry; tell them why nothing
                            // will be spoken for this session.
                            ctx.handle
                                .publish_event(
                                    topics::VOICE_RESPONSE,
                                    serde_json::json!({
                                        "session_id": session_id,
                                        "error": "service_busy",
                                    }),
                                )
                                .await?;
                            anyhow::bail!("session {session_id} rejected: busy");
                        }
                        Err(e @ PipelineError::Duplicate(_)) => {
                            anyhow::bail!(e);
                        }
                    }
                }
            }),
        );
    }

    // ── Cancellation ─────────────────────────────────────────────────
    {
        let pipeline = pipeline.clone();
        service.register_handler(
            topics::VOICE_CANCEL,
            handler_fn(move |_ctx, _topic, envelope| {
                let pipeline = pipeline.clone();
                async move {
                    let cancel: VoiceCancel = envelope.payload_as()?;
                    if !pipeline.cancel(cancel.session_id) {
                        tracing::debug!(
                            session_id = %cancel.session_id,
                            "cancel for unknown or finished session"
                        );
                    }
                    Ok(())
                }
            }),
        );
    }

    // ── Operator RPC ─────────────────────────────────────────────────
    {
        let store = store.clone();
        service.register_handler(
            &topics::service_request(&config.service_name),
            handler_fn(move |ctx, _topic, envelope| {
                let store = store.clone();
                async move {
                    let op: VoiceRouterOp = match envelope.payload_as() {
                        Ok(op) => op,
                        Err(e) => {
                            ctx.handle
                                .respond_error(
                                    &envelope,
                                    ErrorPayload::new(
                                        "bad_request",
                                        format!("unrecognized operation: {e}"),
                                    ),
                                )
                                .await?;
                            return Ok(());
                        }
                    };
                    match op {
                        VoiceRouterOp::GetSession { session_id } => match store.get(session_id) {
                            Some(slot) => {
                                ctx.handle
                                    .respond(&envelope, serde_json::to_value(slot.snapshot())?)
                                    .await?;
                            }
                            None => {
                                ctx.handle
                                    .respond_error(
                                        &envelope,
                                        ErrorPayload::new(
                                            "not_found",
                                            format!("session {session_id}"),
                                        ),
                                    )
                                    .await?;
                            }
                        },
                    }
                    Ok(())
                }
            }),
        );
    }

    service.set_http_routes(crate::http::routes(store.clone()));

    // ── Background: TTL sweep + gauges ───────────────────────────────
    spawn_session_sweeper(store.clone(), shutdown.child_token());
    {
        let cancel = shutdown.child_token();
        let handle = handle.clone();
        let store = store.clone();
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(10));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                handle.report_metric("active_sessions", store.active_count() as f64);
                handle.report_metric(
                    "sessions_completed",
                    pipeline.sessions_completed.load(Ordering::Relaxed) as f64,
                );
                handle.report_metric(
                    "sessions_failed",
                    pipeline.sessions_failed.load(Ordering::Relaxed) as f64,
                );
                handle.report_metric(
                    "sessions_cancelled",
                    pipeline.sessions_cancelled.load(Ordering::Relaxed) as f64,
                );
                handle.report_metric(
                    "sessions_rejected",
                    pipeline.sessions_rejected.load(Ordering::Relaxed) as f64,
                );
            }
        });
    }

    Ok(service)
}
