//! `alicia-device-manager` — the device command plane.
//!
//! Owns the authoritative in-memory device registry (rebuilt from
//! retained state messages on startup) and the per-device command
//! queues that turn validated high-level intents into dispatched,
//! acked, retried device commands.

pub mod http;
pub mod plane;
pub mod registry;
pub mod service;
pub mod validate;

pub use plane::{CommandPlane, DispatchSink, EnqueueError};
pub use registry::{DeviceFilter, DeviceRegistry, RegisterOutcome, RegistryError, StatusChange};
