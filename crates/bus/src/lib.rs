//! `alicia-bus` — the service bus runtime every Alicia service embeds.
//!
//! A "service" is any process that connects to the MQTT broker,
//! subscribes to its topics, and answers requests. This crate provides
//! the pieces none of them should re-implement: connection management
//! with buffered publishes, topic-filter routing, request/response
//! correlation with timeout sweeping, the lifecycle state machine,
//! health counters + heartbeats, and the per-service HTTP surface.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Your service (voice router / device manager / …)        │
//! │                                                          │
//! │   let service = ServiceBuilder::new(config)              │
//! │       .handler(topics::VOICE_COMMAND, OnVoiceCommand)    │
//! │       .on_ready(|handle| async move { … })               │
//! │       .build()?;                                         │
//! │   service.run(shutdown).await?;                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The wrapper owns the MQTT event loop exclusively; collaborator code
//! only ever holds a [`ServiceHandle`] — a narrow publish/request
//! capability — so no component can reach around the lifecycle.
//!
//! # Connection flow (hard-coded by the runtime)
//!
//! 1. Connect (TLS/auth per config), with `startup_timeout` to first ack
//! 2. Replay declared subscriptions; run the `on_ready` hook
//! 3. `Ready`: dispatch inbound envelopes to matching handlers
//! 4. On disconnect: `Degraded`, buffer publishes, reconnect with
//!    jittered exponential backoff, replay subscriptions, drain buffer
//! 5. On shutdown signal: `Stopping`, run `on_stop` hooks, bounded by
//!    `shutdown_grace`

pub mod backoff;
pub mod cli;
pub mod client;
pub mod correlation;
pub mod handler;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod router;
pub mod service;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use backoff::ReconnectBackoff;
pub use client::{BusClient, BusError};
pub use correlation::{CorrelationTracker, RequestError, RequestOutcome};
pub use handler::{handler_fn, BusHandler, HandlerContext};
pub use health::HealthState;
pub use lifecycle::Lifecycle;
pub use service::{Service, ServiceBuilder, ServiceHandle};

// Re-export the protocol so services rarely import alicia-protocol directly.
pub use alicia_protocol as protocol;
pub use alicia_protocol::{Envelope, MessageType, ServiceState};
