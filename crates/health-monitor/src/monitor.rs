//! Per-service liveness tracking and the aggregated fleet view.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use alicia_protocol::{FleetEntry, FleetView, HealthSnapshot};

/// Heartbeats missed before a service counts as offline.
const MISSED_HEARTBEATS: i64 = 3;

pub struct FleetMonitor {
    heartbeat_interval_ms: u64,
    services: Mutex<HashMap<String, FleetEntry>>,
}

impl FleetMonitor {
    pub fn new(heartbeat_interval_ms: u64) -> Self {
        Self {
            heartbeat_interval_ms,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Record a heartbeat. Returns `true` when the service was offline
    /// or unknown and is now back.
    pub fn observe(&self, snapshot: HealthSnapshot, now: DateTime<Utc>) -> bool {
        let mut services = self.services.lock();
        let service = snapshot.service.clone();
        let was_online = services.get(&service).map(|e| e.online);
        services.insert(
            service.clone(),
            FleetEntry {
                snapshot,
                last_heartbeat: now,
                online: true,
            },
        );
        let recovered = was_online != Some(true);
        if recovered {
            tracing::info!(service = %service, "service online");
        }
        recovered
    }

    /// Flag services silent for three intervals. Returns the names that
    /// just went offline.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = Duration::milliseconds(self.heartbeat_interval_ms as i64 * MISSED_HEARTBEATS);
        let mut newly_offline = Vec::new();
        let mut services = self.services.lock();
        for (name, entry) in services.iter_mut() {
            if entry.online && now.signed_duration_since(entry.last_heartbeat) > cutoff {
                entry.online = false;
                newly_offline.push(name.clone());
                tracing::warn!(service = %name, "service offline: missed heartbeats");
            }
        }
        newly_offline
    }

    pub fn view(&self, now: DateTime<Utc>) -> FleetView {
        let services = self.services.lock();
        let map: BTreeMap<String, FleetEntry> = services
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let online = map.values().filter(|e| e.online).count();
        FleetView {
            generated_at: now,
            services_online: online,
            services_offline: map.len() - online,
            services: map,
        }
    }
}
