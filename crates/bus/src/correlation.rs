//! Request/response correlation with timeout sweeping.
//!
//! Every outbound `request` registers its correlation ID here; the
//! runtime feeds inbound `response`/`error` envelopes back through
//! [`CorrelationTracker::resolve`]. A single sweeper task expires
//! entries past their deadline, so a caller observes exactly one of
//! {response, error, timeout} no later than `deadline + sweep_interval`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use alicia_protocol::{Envelope, MessageType};

/// How often the sweeper wakes; bounds timeout lateness.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// What a waiting caller receives.
#[derive(Debug)]
pub enum RequestOutcome {
    /// A `response` envelope.
    Response(Envelope),
    /// An `error` envelope from the responder.
    Error(Envelope),
    /// No reply within the deadline.
    Timeout,
    /// The request was cancelled locally.
    Cancelled,
}

/// Error form of an outcome, for `request()` callers.
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("responder error: {code}: {message}")]
    Responder { code: String, message: String },
    #[error("bus: {0}")]
    Bus(String),
}

struct PendingEntry {
    deadline: Instant,
    tx: oneshot::Sender<RequestOutcome>,
}

/// Process-wide map of in-flight requests.
#[derive(Default)]
pub struct CorrelationTracker {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight request; the receiver yields its outcome.
    pub fn register(&self, correlation_id: Uuid, deadline: Instant) -> oneshot::Receiver<RequestOutcome> {
        let (tx, rx) = oneshot::channel();
        let prev = self
            .pending
            .lock()
            .insert(correlation_id, PendingEntry { deadline, tx });
        // UUID v4 guarantees this, but assert in debug builds anyway.
        debug_assert!(prev.is_none(), "correlation_id collision: {correlation_id}");
        rx
    }

    /// Feed a `response`/`error` envelope to its waiter.
    ///
    /// Returns `false` when no entry exists (late or duplicate reply);
    /// the caller counts those.
    pub fn resolve(&self, envelope: Envelope) -> bool {
        let Some(correlation_id) = envelope.correlation_id else {
            return false;
        };
        let Some(entry) = self.pending.lock().remove(&correlation_id) else {
            return false;
        };
        let outcome = match envelope.message_type {
            MessageType::Error => RequestOutcome::Error(envelope),
            _ => RequestOutcome::Response(envelope),
        };
        let _ = entry.tx.send(outcome);
        true
    }

    /// Cancel a pending request. Returns `false` if already resolved.
    pub fn cancel(&self, correlation_id: Uuid) -> bool {
        match self.pending.lock().remove(&correlation_id) {
            Some(entry) => {
                let _ = entry.tx.send(RequestOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Expire entries past their deadline. Returns how many timed out.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(Uuid, PendingEntry)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|e| (id, e)))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            tracing::debug!(correlation_id = %id, "request timed out");
            let _ = entry.tx.send(RequestOutcome::Timeout);
        }
        count
    }

    /// Fail everything in flight (shutdown path).
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, e)| e).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(RequestOutcome::Cancelled);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn request_envelope() -> Envelope {
        Envelope::request("voice_router", "stt", Value::Null)
    }

    #[tokio::test]
    async fn resolve_wakes_waiter() {
        let tracker = CorrelationTracker::new();
        let req = request_envelope();
        let id = req.correlation_id.unwrap();

        let rx = tracker.register(id, Instant::now() + Duration::from_secs(5));
        let resp = Envelope::response("stt", &req, serde_json::json!({"transcript": "hi"}));
        assert!(tracker.resolve(resp));

        match rx.await.unwrap() {
            RequestOutcome::Response(env) => {
                assert_eq!(env.correlation_id, Some(id));
            }
            other => panic!("expected Response, got {other:?}"),
        }
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_envelope_resolves_as_error() {
        let tracker = CorrelationTracker::new();
        let req = request_envelope();
        let id = req.correlation_id.unwrap();

        let rx = tracker.register(id, Instant::now() + Duration::from_secs(5));
        let err = Envelope::error_reply(
            "stt",
            &req,
            alicia_protocol::ErrorPayload::new("upstream_error", "model crashed"),
        );
        assert!(tracker.resolve(err));
        assert!(matches!(rx.await.unwrap(), RequestOutcome::Error(_)));
    }

    #[tokio::test]
    async fn late_response_is_rejected() {
        let tracker = CorrelationTracker::new();
        let req = request_envelope();
        let id = req.correlation_id.unwrap();

        let rx = tracker.register(id, Instant::now());
        assert_eq!(tracker.sweep(Instant::now() + Duration::from_millis(1)), 1);
        assert!(matches!(rx.await.unwrap(), RequestOutcome::Timeout));

        // The reply arrives after the sweep: no waiter, counted by caller.
        let resp = Envelope::response("stt", &req, Value::Null);
        assert!(!tracker.resolve(resp));
    }

    #[tokio::test]
    async fn sweep_leaves_fresh_entries() {
        let tracker = CorrelationTracker::new();
        let now = Instant::now();
        let _rx1 = tracker.register(Uuid::new_v4(), now + Duration::from_millis(10));
        let _rx2 = tracker.register(Uuid::new_v4(), now + Duration::from_secs(60));

        assert_eq!(tracker.sweep(now + Duration::from_millis(20)), 1);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[tokio::test]
    async fn cancel_resolves_with_cancelled() {
        let tracker = CorrelationTracker::new();
        let id = Uuid::new_v4();
        let rx = tracker.register(id, Instant::now() + Duration::from_secs(5));

        assert!(tracker.cancel(id));
        assert!(!tracker.cancel(id)); // second cancel is a no-op
        assert!(matches!(rx.await.unwrap(), RequestOutcome::Cancelled));
    }

    #[tokio::test]
    async fn envelope_without_correlation_id_is_rejected() {
        let tracker = CorrelationTracker::new();
        let event = Envelope::event("x", Value::Null);
        assert!(!tracker.resolve(event));
    }
}
