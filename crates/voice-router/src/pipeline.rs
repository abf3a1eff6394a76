//! The pipeline orchestrator: drives one session through
//! STT → AI → (dispatch) → TTS.
//!
//! Collaborators sit behind the [`Collaborators`] trait — the production
//! implementation speaks request/response over the bus, the tests speak
//! to stubs. The driver re-checks the session deadline before every
//! stage and passes the remaining budget down as that stage's timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use alicia_domain::config::VoiceConfig;
use alicia_protocol::voice::{VoiceCommand, VoiceResponse};
use alicia_protocol::{
    AiRequest, AiResponse, CommandRequest, CommandState, CommandTicket, SttRequest, SttResponse,
    TtsRequest, TtsResponse,
};

use crate::sessions::{AdmitError, SessionSlot, SessionState, SessionStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collaborator seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(thiserror::Error, Debug, Clone)]
pub enum CollabError {
    #[error("timed out")]
    Timeout,
    #[error("{code}: {message}")]
    Upstream { code: String, message: String },
    #[error("bus: {0}")]
    Bus(String),
}

/// The out-of-process collaborators the pipeline talks to.
///
/// Every call takes an explicit timeout — the pipeline derives it from
/// the stage budget and the session's remaining deadline.
#[async_trait]
pub trait Collaborators: Send + Sync + 'static {
    async fn stt(&self, request: SttRequest, timeout: Duration) -> Result<SttResponse, CollabError>;
    async fn ai(&self, request: AiRequest, timeout: Duration) -> Result<AiResponse, CollabError>;
    async fn tts(&self, request: TtsRequest, timeout: Duration) -> Result<TtsResponse, CollabError>;
    async fn enqueue_command(&self, request: CommandRequest) -> Result<CommandTicket, CollabError>;
    /// Wait for a command's terminal state, bounded by `timeout`.
    async fn await_command(
        &self,
        command_id: Uuid,
        timeout: Duration,
    ) -> Result<CommandState, CollabError>;
    /// Publish the final audio on `alicia/voice/response`.
    async fn publish_response(&self, response: VoiceResponse) -> Result<(), CollabError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("service busy: session limit reached")]
    Busy,
    #[error("duplicate session {0}")]
    Duplicate(Uuid),
}

/// What interrupted (or didn't) a stage await.
enum Wait<T> {
    Done(T),
    Cancelled,
    DeadlineExceeded,
}

pub struct Pipeline<C> {
    cfg: VoiceConfig,
    /// Bound on waiting for a `synchronous` intent's command.
    command_wait: Duration,
    store: Arc<SessionStore>,
    collab: Arc<C>,
    pub sessions_completed: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub sessions_cancelled: AtomicU64,
    pub sessions_rejected: AtomicU64,
}

impl<C: Collaborators> Pipeline<C> {
    pub fn new(
        cfg: VoiceConfig,
        command_wait: Duration,
        store: Arc<SessionStore>,
        collab: Arc<C>,
    ) -> Self {
        Self {
            cfg,
            command_wait,
            store,
            collab,
            sessions_completed: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            sessions_cancelled: AtomicU64::new(0),
            sessions_rejected: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Admit and drive one session to a terminal state.
    pub async fn handle_voice_command(&self, command: VoiceCommand) -> Result<(), PipelineError> {
        let deadline =
            Utc::now() + chrono::Duration::milliseconds(self.cfg.session_timeout_ms as i64);
        let slot = self.store.admit(command.session_id, deadline).map_err(|e| {
            self.sessions_rejected.fetch_add(1, Ordering::Relaxed);
            match e {
                AdmitError::Busy => PipelineError::Busy,
                AdmitError::Duplicate(id) => PipelineError::Duplicate(id),
            }
        })?;

        self.drive(slot, command).await;
        Ok(())
    }

    /// Cancel a session externally (`alicia/voice/cancel`).
    pub fn cancel(&self, session_id: Uuid) -> bool {
        match self.store.get(session_id) {
            Some(slot) if !slot.state().is_terminal() => {
                slot.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    // ── Driver ───────────────────────────────────────────────────────

    async fn drive(&self, slot: Arc<SessionSlot>, command: VoiceCommand) {
        let session_id = command.session_id;
        if slot.transition(SessionState::SttPending).is_err() {
            return;
        }

        // ── STT ──────────────────────────────────────────────────────
        let budget = self.stage_budget(&slot, self.cfg.stt_timeout_ms);
        let request = SttRequest {
            session_id,
            audio: command.audio,
        };
        let stt = match self.stage(&slot, self.collab.stt(request, budget)).await {
            Wait::Done(Ok(response)) => response,
            Wait::Done(Err(CollabError::Timeout)) => {
                return self.fail(&slot, "stt_timeout", true).await;
            }
            Wait::Done(Err(e)) => {
                tracing::warn!(%session_id, error = %e, "stt failed");
                return self.fail(&slot, "stt_error", true).await;
            }
            Wait::Cancelled => return self.cancelled(&slot, "cancelled"),
            Wait::DeadlineExceeded => return self.cancelled(&slot, "deadline_exceeded"),
        };

        if stt.transcript.trim().is_empty() || stt.confidence < self.cfg.min_stt_confidence {
            return self.fail(&slot, "stt_empty", true).await;
        }
        slot.update(|s| s.transcript = Some(stt.transcript.clone()));
        if slot.transition(SessionState::AiPending).is_err() {
            return;
        }

        // ── AI — remaining deadline budget caps the request ──────────
        let budget = self.stage_budget(&slot, self.cfg.ai_timeout_ms);
        let request = AiRequest {
            session_id,
            transcript: stt.transcript,
        };
        let ai = match self.stage(&slot, self.collab.ai(request, budget)).await {
            Wait::Done(Ok(response)) => response,
            Wait::Done(Err(CollabError::Timeout)) => {
                return self.fail(&slot, "ai_timeout", true).await;
            }
            Wait::Done(Err(e)) => {
                tracing::warn!(%session_id, error = %e, "ai failed");
                return self.fail(&slot, "ai_error", true).await;
            }
            Wait::Cancelled => return self.cancelled(&slot, "cancelled"),
            Wait::DeadlineExceeded => return self.cancelled(&slot, "deadline_exceeded"),
        };
        slot.update(|s| {
            s.response_text = Some(ai.response_text.clone());
            s.intents = ai.intents.clone();
        });

        // ── Dispatch ─────────────────────────────────────────────────
        let mut response_text = ai.response_text;
        if !ai.intents.is_empty() {
            if slot.transition(SessionState::DispatchPending).is_err() {
                return;
            }
            for intent in &ai.intents {
                let request = CommandRequest {
                    device_ids: vec![intent.device_id.clone()],
                    capability: intent.capability.clone(),
                    parameters: intent.parameters.clone(),
                    allow_offline: false,
                };
                match self.collab.enqueue_command(request).await {
                    Ok(ticket) => {
                        slot.update(|s| s.device_commands.push(ticket.command_id));
                        if intent.synchronous {
                            // The session speaks only after this command
                            // lands (or its wait budget runs out).
                            let wait = self
                                .stage(&slot, self.collab.await_command(ticket.command_id, self.command_wait))
                                .await;
                            match wait {
                                Wait::Done(Ok(CommandState::Completed)) => {}
                                Wait::Done(outcome) => {
                                    tracing::warn!(
                                        %session_id,
                                        command_id = %ticket.command_id,
                                        ?outcome,
                                        "synchronous command did not complete, speaking fallback"
                                    );
                                    response_text = self.cfg.fallback_text.clone();
                                }
                                Wait::Cancelled => return self.cancelled(&slot, "cancelled"),
                                Wait::DeadlineExceeded => {
                                    return self.cancelled(&slot, "deadline_exceeded");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%session_id, error = %e, "command enqueue rejected");
                        if intent.synchronous {
                            response_text = self.cfg.fallback_text.clone();
                        }
                    }
                }
            }
        }
        if slot.transition(SessionState::TtsPending).is_err() {
            return;
        }

        // ── TTS ──────────────────────────────────────────────────────
        let budget = self.stage_budget(&slot, self.cfg.tts_timeout_ms);
        let request = TtsRequest {
            session_id,
            text: response_text.clone(),
        };
        match self.stage(&slot, self.collab.tts(request, budget)).await {
            Wait::Done(Ok(tts)) => {
                let response = VoiceResponse {
                    session_id,
                    audio: tts.audio.clone(),
                    text: Some(response_text),
                };
                if let Err(e) = self.collab.publish_response(response).await {
                    tracing::error!(%session_id, error = %e, "voice response publish failed");
                }
                slot.update(|s| s.response_audio = Some(tts.audio));
                if slot.transition(SessionState::Complete).is_ok() {
                    self.sessions_completed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Wait::Done(Err(e)) => {
                // TTS itself is down: no apology is possible.
                tracing::error!(%session_id, error = %e, "tts failed, ending silently");
                self.fail(&slot, "tts_error", false).await;
            }
            Wait::Cancelled => self.cancelled(&slot, "cancelled"),
            Wait::DeadlineExceeded => self.cancelled(&slot, "deadline_exceeded"),
        }
    }

    // ── Stage plumbing ───────────────────────────────────────────────

    /// Effective timeout for a stage: its configured budget, clipped by
    /// what is left of the session deadline.
    fn stage_budget(&self, slot: &SessionSlot, stage_ms: u64) -> Duration {
        let remaining = slot
            .deadline()
            .signed_duration_since(Utc::now())
            .num_milliseconds()
            .max(0) as u64;
        Duration::from_millis(stage_ms.min(remaining))
    }

    /// Await a stage future against cancellation and the session
    /// deadline. The losing futures are dropped; their correlation
    /// entries die in the sweeper.
    async fn stage<T>(
        &self,
        slot: &SessionSlot,
        fut: impl std::future::Future<Output = T>,
    ) -> Wait<T> {
        let remaining = slot
            .deadline()
            .signed_duration_since(Utc::now())
            .num_milliseconds();
        if remaining <= 0 {
            return Wait::DeadlineExceeded;
        }

        tokio::select! {
            _ = slot.cancel.cancelled() => Wait::Cancelled,
            _ = tokio::time::sleep(Duration::from_millis(remaining as u64)) => Wait::DeadlineExceeded,
            result = fut => Wait::Done(result),
        }
    }

    async fn fail(&self, slot: &SessionSlot, reason: &str, apologize: bool) {
        slot.update(|s| s.failure_reason = Some(reason.to_owned()));
        if slot.transition(SessionState::Failed).is_err() {
            return; // lost the race against a cancel
        }
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session_id = %slot.snapshot().session_id, reason, "session failed");
        if apologize {
            self.apologize(slot).await;
        }
    }

    /// Spoken apology on pipeline failure, if TTS is still healthy.
    async fn apologize(&self, slot: &SessionSlot) {
        let session_id = slot.snapshot().session_id;
        let text = self.cfg.fallback_text.clone();
        let request = TtsRequest {
            session_id,
            text: text.clone(),
        };
        match self
            .collab
            .tts(request, Duration::from_millis(self.cfg.tts_timeout_ms))
            .await
        {
            Ok(tts) => {
                let response = VoiceResponse {
                    session_id,
                    audio: tts.audio,
                    text: Some(text),
                };
                if let Err(e) = self.collab.publish_response(response).await {
                    tracing::warn!(%session_id, error = %e, "apology publish failed");
                }
            }
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "tts unhealthy, apology skipped");
            }
        }
    }

    fn cancelled(&self, slot: &SessionSlot, reason: &str) {
        slot.update(|s| s.failure_reason = Some(reason.to_owned()));
        if slot.transition(SessionState::Cancelled).is_ok() {
            self.sessions_cancelled.fetch_add(1, Ordering::Relaxed);
            tracing::info!(session_id = %slot.snapshot().session_id, reason, "session cancelled");
        }
    }
}

/// Spawn the store's TTL sweeper; runs until the token fires.
pub fn spawn_session_sweeper(
    store: Arc<SessionStore>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    store.sweep_expired(Utc::now());
                }
            }
        }
    })
}
