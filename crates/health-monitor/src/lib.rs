//! `alicia-health-monitor` — fleet-wide health aggregation.
//!
//! Subscribes to every `alicia/health/#` heartbeat, tracks per-service
//! liveness (offline after three missed intervals), and republishes the
//! aggregated view on `alicia/health/fleet`.

pub mod monitor;
pub mod service;

pub use monitor::FleetMonitor;
