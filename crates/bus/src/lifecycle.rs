//! Service lifecycle state machine.
//!
//! ```text
//! created → initializing → ready ⇄ degraded → stopping → stopped
//!                       ↘ failed
//! ```
//!
//! The current state is broadcast on a `watch` channel so the HTTP
//! surface, heartbeat task, and tests observe transitions without
//! polling shared flags.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;

use alicia_protocol::ServiceState;

/// Errors inside this window count toward the degraded threshold.
const ERROR_WINDOW: Duration = Duration::from_secs(60);
/// More than this many errors in [`ERROR_WINDOW`] degrades the service.
const ERROR_THRESHOLD: usize = 10;

pub struct Lifecycle {
    tx: watch::Sender<ServiceState>,
    error_times: Mutex<VecDeque<Instant>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ServiceState::Created);
        Self {
            tx,
            error_times: Mutex::new(VecDeque::new()),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.tx.subscribe()
    }

    /// Attempt a transition. Illegal transitions are logged and ignored —
    /// a lifecycle bug must never take the process down.
    pub fn transition(&self, next: ServiceState) -> bool {
        let mut ok = false;
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !legal(*current, next) {
                tracing::warn!(from = ?*current, to = ?next, "illegal lifecycle transition ignored");
                return false;
            }
            tracing::info!(from = ?*current, to = ?next, "lifecycle transition");
            *current = next;
            ok = true;
            true
        });
        ok
    }

    /// MQTT connectivity changes drive ready ⇄ degraded.
    pub fn set_connected(&self, connected: bool) {
        match (self.state(), connected) {
            (ServiceState::Ready, false) => {
                self.transition(ServiceState::Degraded);
            }
            (ServiceState::Degraded, true) => {
                if !self.error_rate_exceeded() {
                    self.transition(ServiceState::Ready);
                }
            }
            _ => {}
        }
    }

    /// Record a handler error; degrades the service when the rate
    /// threshold is crossed.
    pub fn record_error(&self) {
        let now = Instant::now();
        let exceeded = {
            let mut times = self.error_times.lock();
            times.push_back(now);
            while times
                .front()
                .is_some_and(|t| now.duration_since(*t) > ERROR_WINDOW)
            {
                times.pop_front();
            }
            times.len() > ERROR_THRESHOLD
        };
        if exceeded && self.state() == ServiceState::Ready {
            tracing::warn!("error rate threshold crossed, degrading");
            self.transition(ServiceState::Degraded);
        }
    }

    /// Called periodically: recover `degraded → ready` once the error
    /// window has drained (connectivity permitting).
    pub fn maybe_recover(&self, mqtt_connected: bool) {
        if self.state() == ServiceState::Degraded && mqtt_connected && !self.error_rate_exceeded()
        {
            self.transition(ServiceState::Ready);
        }
    }

    fn error_rate_exceeded(&self) -> bool {
        let now = Instant::now();
        let mut times = self.error_times.lock();
        while times
            .front()
            .is_some_and(|t| now.duration_since(*t) > ERROR_WINDOW)
        {
            times.pop_front();
        }
        times.len() > ERROR_THRESHOLD
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

fn legal(from: ServiceState, to: ServiceState) -> bool {
    use ServiceState::*;
    match (from, to) {
        (Created, Initializing) => true,
        (Initializing, Ready) | (Initializing, Failed) => true,
        (Ready, Degraded) | (Degraded, Ready) => true,
        // Shutdown can start from any running state.
        (Created | Initializing | Ready | Degraded, Stopping) => true,
        (Stopping, Stopped) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let lc = Lifecycle::new();
        assert!(lc.transition(ServiceState::Initializing));
        assert!(lc.transition(ServiceState::Ready));
        assert!(lc.transition(ServiceState::Degraded));
        assert!(lc.transition(ServiceState::Ready));
        assert!(lc.transition(ServiceState::Stopping));
        assert!(lc.transition(ServiceState::Stopped));
    }

    #[test]
    fn illegal_transitions_ignored() {
        let lc = Lifecycle::new();
        assert!(!lc.transition(ServiceState::Ready)); // created → ready skips init
        assert_eq!(lc.state(), ServiceState::Created);

        lc.transition(ServiceState::Initializing);
        lc.transition(ServiceState::Failed);
        assert!(!lc.transition(ServiceState::Ready)); // failed is terminal
        assert_eq!(lc.state(), ServiceState::Failed);
    }

    #[test]
    fn disconnect_degrades_reconnect_recovers() {
        let lc = Lifecycle::new();
        lc.transition(ServiceState::Initializing);
        lc.transition(ServiceState::Ready);

        lc.set_connected(false);
        assert_eq!(lc.state(), ServiceState::Degraded);
        lc.set_connected(true);
        assert_eq!(lc.state(), ServiceState::Ready);
    }

    #[test]
    fn error_rate_degrades() {
        let lc = Lifecycle::new();
        lc.transition(ServiceState::Initializing);
        lc.transition(ServiceState::Ready);

        for _ in 0..=ERROR_THRESHOLD {
            lc.record_error();
        }
        assert_eq!(lc.state(), ServiceState::Degraded);
        // Still over threshold: recovery refused.
        lc.maybe_recover(true);
        assert_eq!(lc.state(), ServiceState::Degraded);
    }

    #[test]
    fn watch_subscribers_see_transitions() {
        let lc = Lifecycle::new();
        let rx = lc.subscribe();
        lc.transition(ServiceState::Initializing);
        assert_eq!(*rx.borrow(), ServiceState::Initializing);
    }
}
