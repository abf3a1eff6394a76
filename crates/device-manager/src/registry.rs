//! In-memory registry of devices and their capabilities.
//!
//! Single writer (the registration/state handlers), many readers. The
//! primary map and the capability index live under one lock so readers
//! always see them consistent. Authoritative state is in memory; the
//! retained `alicia/devices/+/state` messages on the broker are the
//! source of truth across restarts.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use alicia_protocol::{Device, DeviceStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("device {device_id} already registered as {existing_type}, refusing {claimed_type}")]
    Conflict {
        device_id: String,
        existing_type: String,
        claimed_type: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    New,
    /// Same-type re-registration: metadata refreshed, queue preserved.
    Refreshed,
}

/// A status transition worth announcing on the bus.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub device_id: String,
    pub from: DeviceStatus,
    pub to: DeviceStatus,
}

/// Selection for [`DeviceRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub device_type: Option<String>,
    pub room: Option<String>,
    pub capability: Option<String>,
}

struct Inner {
    devices: HashMap<String, Device>,
    /// capability name → ids of devices advertising it.
    by_capability: HashMap<String, BTreeSet<String>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DeviceRegistry {
    inner: RwLock<Inner>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                devices: HashMap::new(),
                by_capability: HashMap::new(),
            }),
        }
    }

    /// Register or refresh a device.
    ///
    /// A different `device_type` claiming an existing id is a conflict;
    /// the same type refreshes capabilities/metadata in place.
    pub fn register(&self, device: Device) -> Result<RegisterOutcome, RegistryError> {
        let mut inner = self.inner.write();

        let outcome = match inner.devices.get(&device.device_id) {
            Some(existing) if existing.device_type != device.device_type => {
                return Err(RegistryError::Conflict {
                    device_id: device.device_id.clone(),
                    existing_type: existing.device_type.clone(),
                    claimed_type: device.device_type.clone(),
                });
            }
            Some(_) => RegisterOutcome::Refreshed,
            None => RegisterOutcome::New,
        };

        if outcome == RegisterOutcome::Refreshed {
            unindex_capabilities(&mut inner, &device.device_id);
        }
        for capability in device.capabilities.keys() {
            inner
                .by_capability
                .entry(capability.clone())
                .or_default()
                .insert(device.device_id.clone());
        }

        tracing::info!(
            device_id = %device.device_id,
            device_type = %device.device_type,
            capabilities = device.capabilities.len(),
            ?outcome,
            "device registered"
        );
        inner.devices.insert(device.device_id.clone(), device);
        Ok(outcome)
    }

    /// Remove a device entirely. Returns whether it existed.
    pub fn unregister(&self, device_id: &str) -> bool {
        let mut inner = self.inner.write();
        unindex_capabilities(&mut inner, device_id);
        let removed = inner.devices.remove(device_id).is_some();
        if removed {
            tracing::info!(device_id = %device_id, "device unregistered");
        }
        removed
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.inner.read().devices.get(device_id).cloned()
    }

    pub fn status(&self, device_id: &str) -> Option<DeviceStatus> {
        self.inner.read().devices.get(device_id).map(|d| d.status)
    }

    /// Update a device's status. Returns the change when it actually
    /// transitioned.
    pub fn set_status(&self, device_id: &str, status: DeviceStatus) -> Option<StatusChange> {
        let mut inner = self.inner.write();
        let device = inner.devices.get_mut(device_id)?;
        if device.status == status {
            device.last_seen = Utc::now();
            return None;
        }
        let change = StatusChange {
            device_id: device_id.to_owned(),
            from: device.status,
            to: status,
        };
        device.status = status;
        device.last_seen = Utc::now();
        tracing::info!(device_id = %device_id, from = ?change.from, to = ?change.to, "device status changed");
        Some(change)
    }

    /// Refresh `last_seen` (heartbeats, acks, any traffic).
    pub fn touch(&self, device_id: &str) {
        if let Some(device) = self.inner.write().devices.get_mut(device_id) {
            device.last_seen = Utc::now();
        }
    }

    /// List devices matching the filter.
    pub fn list(&self, filter: &DeviceFilter) -> Vec<Device> {
        let inner = self.inner.read();
        let mut out: Vec<Device> = inner
            .devices
            .values()
            .filter(|d| {
                filter
                    .device_type
                    .as_ref()
                    .is_none_or(|t| &d.device_type == t)
                    && filter.room.as_ref().is_none_or(|r| d.room.as_deref() == Some(r))
                    && filter
                        .capability
                        .as_ref()
                        .is_none_or(|c| d.capabilities.contains_key(c))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    /// All device ids advertising a capability (intent routing).
    pub fn find_by_capability(&self, capability: &str) -> Vec<String> {
        self.inner
            .read()
            .by_capability
            .get(capability)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Mark devices unheard-from for longer than `threshold_ms` offline.
    pub fn sweep_offline(&self, now: DateTime<Utc>, threshold_ms: u64) -> Vec<StatusChange> {
        let mut inner = self.inner.write();
        let mut changes = Vec::new();
        for device in inner.devices.values_mut() {
            if !matches!(device.status, DeviceStatus::Online | DeviceStatus::Registered) {
                continue;
            }
            let silent_ms = now.signed_duration_since(device.last_seen).num_milliseconds();
            if silent_ms > threshold_ms as i64 {
                changes.push(StatusChange {
                    device_id: device.device_id.clone(),
                    from: device.status,
                    to: DeviceStatus::Offline,
                });
                device.status = DeviceStatus::Offline;
            }
        }
        if !changes.is_empty() {
            tracing::info!(count = changes.len(), "devices marked offline by sweep");
        }
        changes
    }

    pub fn len(&self) -> usize {
        self.inner.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().devices.is_empty()
    }
}

fn unindex_capabilities(inner: &mut Inner, device_id: &str) {
    let Some(existing) = inner.devices.get(device_id) else {
        return;
    };
    let capabilities: Vec<String> = existing.capabilities.keys().cloned().collect();
    for capability in capabilities {
        if let Some(ids) = inner.by_capability.get_mut(&capability) {
            ids.remove(device_id);
            if ids.is_empty() {
                inner.by_capability.remove(&capability);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alicia_protocol::{Capability, ParamSchema};
    use std::collections::BTreeMap;

    fn device(id: &str, device_type: &str, caps: &[&str]) -> Device {
        Device {
            device_id: id.into(),
            device_type: device_type.into(),
            room: Some("living_room".into()),
            capabilities: caps
                .iter()
                .map(|c| ((*c).to_owned(), Capability::default()))
                .collect(),
            status: DeviceStatus::Online,
            last_seen: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn register_then_get_returns_device() {
        let reg = DeviceRegistry::new();
        let d = device("light.living_room_1", "light", &["turn_on", "turn_off"]);
        assert_eq!(reg.register(d).unwrap(), RegisterOutcome::New);

        let got = reg.get("light.living_room_1").unwrap();
        assert_eq!(got.device_type, "light");
        assert_eq!(reg.find_by_capability("turn_on"), vec!["light.living_room_1"]);
    }

    #[test]
    fn same_type_reregistration_refreshes() {
        let reg = DeviceRegistry::new();
        reg.register(device("d1", "light", &["turn_on"])).unwrap();

        let mut updated = device("d1", "light", &["turn_on", "set_brightness"]);
        updated.capabilities.insert(
            "set_brightness".into(),
            Capability {
                parameters: BTreeMap::from([("level".into(), ParamSchema::int(0, 100))]),
            },
        );
        assert_eq!(reg.register(updated).unwrap(), RegisterOutcome::Refreshed);

        // Last write wins; index follows.
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.find_by_capability("set_brightness"), vec!["d1"]);
    }

    #[test]
    fn different_type_is_a_conflict() {
        let reg = DeviceRegistry::new();
        reg.register(device("d1", "light", &["turn_on"])).unwrap();
        let err = reg.register(device("d1", "thermostat", &["set_temp"])).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
        // Original registration intact.
        assert_eq!(reg.get("d1").unwrap().device_type, "light");
    }

    #[test]
    fn unregister_cleans_capability_index() {
        let reg = DeviceRegistry::new();
        reg.register(device("d1", "light", &["turn_on"])).unwrap();
        reg.register(device("d2", "light", &["turn_on"])).unwrap();

        assert!(reg.unregister("d1"));
        assert_eq!(reg.find_by_capability("turn_on"), vec!["d2"]);
        assert!(!reg.unregister("d1")); // already gone
    }

    #[test]
    fn list_filters_by_type_room_capability() {
        let reg = DeviceRegistry::new();
        reg.register(device("light.a", "light", &["turn_on"])).unwrap();
        let mut kitchen = device("speaker.k", "speaker", &["play_music"]);
        kitchen.room = Some("kitchen".into());
        reg.register(kitchen).unwrap();

        let lights = reg.list(&DeviceFilter {
            device_type: Some("light".into()),
            ..Default::default()
        });
        assert_eq!(lights.len(), 1);
        assert_eq!(lights[0].device_id, "light.a");

        let in_kitchen = reg.list(&DeviceFilter {
            room: Some("kitchen".into()),
            ..Default::default()
        });
        assert_eq!(in_kitchen.len(), 1);

        let can_play = reg.list(&DeviceFilter {
            capability: Some("play_music".into()),
            ..Default::default()
        });
        assert_eq!(can_play[0].device_id, "speaker.k");

        assert_eq!(reg.list(&DeviceFilter::default()).len(), 2);
    }

    #[test]
    fn offline_sweep_flags_silent_devices() {
        let reg = DeviceRegistry::new();
        reg.register(device("d1", "light", &[])).unwrap();
        reg.register(device("d2", "light", &[])).unwrap();
        reg.touch("d2");

        // d1 last seen two minutes in the past.
        {
            let mut inner = reg.inner.write();
            inner.devices.get_mut("d1").unwrap().last_seen =
                Utc::now() - chrono::Duration::milliseconds(125_000);
        }

        let changes = reg.sweep_offline(Utc::now(), 120_000);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].device_id, "d1");
        assert_eq!(changes[0].to, DeviceStatus::Offline);
        assert_eq!(reg.status("d1"), Some(DeviceStatus::Offline));
        assert_eq!(reg.status("d2"), Some(DeviceStatus::Online));

        // Already-offline devices are not re-announced.
        let again = reg.sweep_offline(Utc::now(), 120_000);
        assert!(again.is_empty());
    }

    #[test]
    fn set_status_reports_transitions_only() {
        let reg = DeviceRegistry::new();
        reg.register(device("d1", "light", &[])).unwrap();

        assert!(reg.set_status("d1", DeviceStatus::Online).is_none()); // already online
        let change = reg.set_status("d1", DeviceStatus::Offline).unwrap();
        assert_eq!(change.from, DeviceStatus::Online);
        assert_eq!(change.to, DeviceStatus::Offline);
        assert!(reg.set_status("missing", DeviceStatus::Online).is_none());
    }
}
