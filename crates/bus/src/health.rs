//! Per-service health counters, exposed via heartbeat and `GET /health`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use alicia_protocol::{HealthSnapshot, ServiceState};

/// How many recent errors are kept for the health snapshot.
const ERROR_RING_CAPACITY: usize = 32;

/// Shared mutable health state for one service process.
///
/// Counters are atomics so handlers touch them without locking; the
/// error ring and metric map sit behind short-lived mutexes.
pub struct HealthState {
    service: String,
    version: String,
    instance_id: Uuid,
    started_at: DateTime<Utc>,

    pub mqtt_connected: AtomicBool,
    pub messages_processed: AtomicU64,
    pub errors: AtomicU64,
    pub publishes_dropped: AtomicU64,
    pub unrouted_messages: AtomicU64,
    /// Responses that arrived after their correlation timed out.
    pub late_responses: AtomicU64,
    /// Envelopes dropped for TTL expiry / malformed payloads.
    pub dropped_envelopes: AtomicU64,

    recent_errors: Mutex<VecDeque<String>>,
    topic_hits: Mutex<BTreeMap<String, u64>>,
    metrics: Mutex<BTreeMap<String, f64>>,
}

impl HealthState {
    pub fn new(service: &str, version: &str) -> Self {
        Self {
            service: service.to_owned(),
            version: version.to_owned(),
            instance_id: Uuid::new_v4(),
            started_at: Utc::now(),
            mqtt_connected: AtomicBool::new(false),
            messages_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            publishes_dropped: AtomicU64::new(0),
            unrouted_messages: AtomicU64::new(0),
            late_responses: AtomicU64::new(0),
            dropped_envelopes: AtomicU64::new(0),
            recent_errors: Mutex::new(VecDeque::with_capacity(ERROR_RING_CAPACITY)),
            topic_hits: Mutex::new(BTreeMap::new()),
            metrics: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Record a handled inbound message against its topic.
    pub fn record_message(&self, topic: &str) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        *self.topic_hits.lock().entry(topic.to_owned()).or_insert(0) += 1;
    }

    /// Record an error; keeps the most recent [`ERROR_RING_CAPACITY`].
    pub fn record_error(&self, error: impl Into<String>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut ring = self.recent_errors.lock();
        if ring.len() == ERROR_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(error.into());
    }

    pub fn report_metric(&self, name: &str, value: f64) {
        self.metrics.lock().insert(name.to_owned(), value);
    }

    pub fn uptime_secs(&self) -> u64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_seconds()
            .max(0) as u64
    }

    /// Snapshot for the heartbeat payload / HTTP surface.
    pub fn snapshot(&self, state: ServiceState) -> HealthSnapshot {
        HealthSnapshot {
            service: self.service.clone(),
            version: self.version.clone(),
            instance_id: self.instance_id,
            state,
            uptime_secs: self.uptime_secs(),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            publishes_dropped: self.publishes_dropped.load(Ordering::Relaxed),
            unrouted_messages: self.unrouted_messages.load(Ordering::Relaxed),
            last_error: self.recent_errors.lock().back().cloned(),
            topic_hits: self.topic_hits.lock().clone(),
            metrics: self.metrics.lock().clone(),
        }
    }

    /// Prometheus-style plain-text dump for `GET /metrics`.
    pub fn render_prometheus(&self, state: ServiceState) -> String {
        let snap = self.snapshot(state);
        let mut out = String::new();
        let mut counter = |name: &str, value: u64| {
            out.push_str(&format!(
                "# TYPE alicia_{name} counter\nalicia_{name}{{service=\"{}\"}} {value}\n",
                snap.service
            ));
        };
        counter("messages_processed_total", snap.messages_processed);
        counter("errors_total", snap.errors);
        counter("publishes_dropped_total", snap.publishes_dropped);
        counter("unrouted_messages_total", snap.unrouted_messages);
        out.push_str(&format!(
            "# TYPE alicia_uptime_seconds gauge\nalicia_uptime_seconds{{service=\"{}\"}} {}\n",
            snap.service, snap.uptime_secs
        ));
        out.push_str(&format!(
            "# TYPE alicia_mqtt_connected gauge\nalicia_mqtt_connected{{service=\"{}\"}} {}\n",
            snap.service,
            u8::from(snap.mqtt_connected)
        ));
        for (name, value) in &snap.metrics {
            out.push_str(&format!(
                "# TYPE alicia_{name} gauge\nalicia_{name}{{service=\"{}\"}} {value}\n",
                snap.service
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_ring_is_bounded() {
        let health = HealthState::new("test", "0.0.0");
        for i in 0..100 {
            health.record_error(format!("error {i}"));
        }
        let snap = health.snapshot(ServiceState::Ready);
        assert_eq!(snap.errors, 100);
        assert_eq!(snap.last_error.as_deref(), Some("error 99"));
        assert_eq!(health.recent_errors.lock().len(), ERROR_RING_CAPACITY);
    }

    #[test]
    fn topic_hits_accumulate() {
        let health = HealthState::new("test", "0.0.0");
        health.record_message("alicia/voice/command");
        health.record_message("alicia/voice/command");
        health.record_message("alicia/voice/cancel");
        let snap = health.snapshot(ServiceState::Ready);
        assert_eq!(snap.messages_processed, 3);
        assert_eq!(snap.topic_hits["alicia/voice/command"], 2);
        assert_eq!(snap.topic_hits["alicia/voice/cancel"], 1);
    }

    #[test]
    fn prometheus_dump_contains_counters() {
        let health = HealthState::new("voice_router", "0.1.0");
        health.record_message("t");
        health.report_metric("active_sessions", 3.0);
        let text = health.render_prometheus(ServiceState::Ready);
        assert!(text.contains("alicia_messages_processed_total{service=\"voice_router\"} 1"));
        assert!(text.contains("alicia_active_sessions{service=\"voice_router\"} 3"));
    }
}
