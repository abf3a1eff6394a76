//! `alicia-protocol` — everything that crosses the Alicia message bus.
//!
//! Services exchange JSON envelopes over MQTT; this crate defines the
//! envelope, the topic namespace, and the typed payloads for the voice
//! pipeline, the device command plane, and health reporting. It has no
//! transport dependencies, so device firmware and test stubs can speak
//! the protocol without linking the bus runtime.

pub mod command;
pub mod device;
pub mod envelope;
pub mod health;
pub mod topics;
pub mod voice;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use command::{CommandRequest, CommandState, CommandTicket, DeviceAck, DeviceOutcome};
pub use device::{Capability, Device, DeviceStatus, ParamKind, ParamSchema, ParamViolation};
pub use envelope::{
    decode, AudioData, DecodeError, Envelope, ErrorPayload, MessageType, MAX_ENVELOPE_BYTES,
};
pub use health::{FleetEntry, FleetView, HealthSnapshot, ServiceState};
pub use voice::{AiRequest, AiResponse, Intent, SttRequest, SttResponse, TtsRequest, TtsResponse};
