//! `alicia-voice-router` — the voice pipeline orchestrator.
//!
//! Each inbound voice command becomes a session: a state machine driven
//! through STT → AI → (device dispatch) → TTS with a hard end-to-end
//! deadline, per-stage budgets, and cancellation. Session state lives in
//! the store as data, so timeouts and cancels act uniformly no matter
//! which stage is in flight.

pub mod http;
pub mod pipeline;
pub mod service;
pub mod sessions;

pub use pipeline::{CollabError, Collaborators, Pipeline, PipelineError};
pub use sessions::{SessionSlot, SessionState, SessionStore, VoiceSession};
