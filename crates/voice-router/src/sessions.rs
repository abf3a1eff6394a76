//! Voice-session store: TTL-indexed sessions behind per-session locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use alicia_protocol::envelope::AudioData;
use alicia_protocol::Intent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    SttPending,
    AiPending,
    DispatchPending,
    TtsPending,
    Complete,
    Failed,
    Cancelled,
}

impl SessionState {
    /// The legal successor set. Cancellation is reachable from every
    /// non-terminal state; nothing leaves a terminal state.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (Idle, SttPending)
                | (SttPending, AiPending)
                | (SttPending, Failed)
                | (AiPending, DispatchPending)
                | (AiPending, TtsPending)
                | (AiPending, Failed)
                | (DispatchPending, TtsPending)
                | (DispatchPending, Failed)
                | (TtsPending, Complete)
                | (TtsPending, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        use SessionState::*;
        matches!(self, Complete | Failed | Cancelled)
    }
}

/// One voice interaction from audio in to audio out.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VoiceSession {
    pub session_id: Uuid,
    pub state: SessionState,
    pub transcript: Option<String>,
    pub intents: Vec<Intent>,
    /// Commands handed to the device manager on behalf of this session.
    pub device_commands: Vec<Uuid>,
    pub response_text: Option<String>,
    pub response_audio: Option<AudioData>,
    pub failure_reason: Option<String>,
    /// Hard end-to-end deadline; the session cancels past it.
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Slot: per-session single-owner lock + cancel token
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A session plus its lock and cancellation token. The driver task is
/// the single owner; other tasks only read snapshots or cancel.
#[derive(Debug)]
pub struct SessionSlot {
    session: Mutex<VoiceSession>,
    pub cancel: CancellationToken,
}

impl SessionSlot {
    /// Snapshot for status queries.
    pub fn snapshot(&self) -> VoiceSession {
        self.session.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state
    }

    /// Validated state transition.
    pub fn transition(&self, next: SessionState) -> Result<(), IllegalTransition> {
        let mut session = self.session.lock();
        if !session.state.can_transition_to(next) {
            return Err(IllegalTransition {
                from: session.state,
                to: next,
            });
        }
        tracing::debug!(
            session_id = %session.session_id,
            from = ?session.state,
            to = ?next,
            "session transition"
        );
        session.state = next;
        session.updated_at = Utc::now();
        Ok(())
    }

    /// Mutate session data under the lock (never across an await).
    pub fn update<F: FnOnce(&mut VoiceSession)>(&self, f: F) {
        let mut session = self.session.lock();
        f(&mut session);
        session.updated_at = Utc::now();
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.session.lock().deadline
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AdmitError {
    #[error("max concurrent sessions reached")]
    Busy,
    #[error("session {0} already exists")]
    Duplicate(Uuid),
}

pub struct SessionStore {
    max_concurrent: usize,
    ttl: Duration,
    sessions: Mutex<HashMap<Uuid, Arc<SessionSlot>>>,
}

impl SessionStore {
    pub fn new(max_concurrent: usize, ttl: Duration) -> Self {
        Self {
            max_concurrent,
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a new session in `Idle`, enforcing the concurrency cap
    /// against non-terminal sessions.
    pub fn admit(
        &self,
        session_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<Arc<SessionSlot>, AdmitError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&session_id) {
            return Err(AdmitError::Duplicate(session_id));
        }
        let active = sessions.values().filter(|s| !s.state().is_terminal()).count();
        if active >= self.max_concurrent {
            return Err(AdmitError::Busy);
        }

        let now = Utc::now();
        let slot = Arc::new(SessionSlot {
            session: Mutex::new(VoiceSession {
                session_id,
                state: SessionState::Idle,
                transcript: None,
                intents: Vec::new(),
                device_commands: Vec::new(),
                response_text: None,
                response_audio: None,
                failure_reason: None,
                deadline,
                created_at: now,
                updated_at: now,
            }),
            cancel: CancellationToken::new(),
        });
        sessions.insert(session_id, slot.clone());
        Ok(slot)
    }

    pub fn get(&self, session_id: Uuid) -> Option<Arc<SessionSlot>> {
        self.sessions.lock().get(&session_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| !s.state().is_terminal())
            .count()
    }

    /// Drop sessions that have been terminal for longer than the TTL.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl_ms = self.ttl.as_millis() as i64;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, slot| {
            let session = slot.snapshot();
            if !session.state.is_terminal() {
                return true;
            }
            now.signed_duration_since(session.updated_at).num_milliseconds() < ttl_ms
        });
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "expired sessions swept");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(2, Duration::from_secs(300))
    }

    fn minute_deadline() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(60)
    }

    #[test]
    fn admit_get_and_duplicate() {
        let store = store();
        let id = Uuid::new_v4();
        let slot = store.admit(id, minute_deadline()).unwrap();
        assert_eq!(slot.state(), SessionState::Idle);
        assert!(store.get(id).is_some());
        assert_eq!(store.admit(id, minute_deadline()).unwrap_err(), AdmitError::Duplicate(id));
    }

    #[test]
    fn busy_when_cap_reached_and_frees_on_terminal() {
        let store = store();
        let a = store.admit(Uuid::new_v4(), minute_deadline()).unwrap();
        let _b = store.admit(Uuid::new_v4(), minute_deadline()).unwrap();
        assert_eq!(store.admit(Uuid::new_v4(), minute_deadline()).unwrap_err(), AdmitError::Busy);

        // A terminal session no longer counts against the cap.
        a.transition(SessionState::Cancelled).unwrap();
        assert!(store.admit(Uuid::new_v4(), minute_deadline()).is_ok());
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        use SessionState::*;
        for (from, to) in [
            (Idle, SttPending),
            (SttPending, AiPending),
            (AiPending, DispatchPending),
            (DispatchPending, TtsPending),
            (TtsPending, Complete),
        ] {
            assert!(from.can_transition_to(to), "{from:?} -> {to:?}");
        }
        // Skipping dispatch is also legal.
        assert!(AiPending.can_transition_to(TtsPending));
    }

    #[test]
    fn no_back_edges_or_stage_skips() {
        use SessionState::*;
        assert!(!AiPending.can_transition_to(SttPending));
        assert!(!Idle.can_transition_to(AiPending));
        assert!(!SttPending.can_transition_to(TtsPending));
        assert!(!Idle.can_transition_to(Complete));
    }

    #[test]
    fn cancel_reaches_everything_nonterminal_only() {
        use SessionState::*;
        for state in [Idle, SttPending, AiPending, DispatchPending, TtsPending] {
            assert!(state.can_transition_to(Cancelled), "{state:?}");
        }
        for state in [Complete, Failed, Cancelled] {
            assert!(!state.can_transition_to(Cancelled), "{state:?}");
            assert!(!state.can_transition_to(SttPending), "{state:?}");
        }
    }

    #[test]
    fn transition_rejects_illegal_and_keeps_state() {
        let store = store();
        let slot = store.admit(Uuid::new_v4(), minute_deadline()).unwrap();
        let err = slot.transition(SessionState::Complete).unwrap_err();
        assert_eq!(err.from, SessionState::Idle);
        assert_eq!(slot.state(), SessionState::Idle);
    }

    #[test]
    fn sweep_removes_only_stale_terminal_sessions() {
        let store = SessionStore::new(8, Duration::from_millis(100));
        let live = store.admit(Uuid::new_v4(), minute_deadline()).unwrap();
        live.transition(SessionState::SttPending).unwrap();

        let done_id = Uuid::new_v4();
        let done = store.admit(done_id, minute_deadline()).unwrap();
        done.transition(SessionState::Cancelled).unwrap();

        // Inside the TTL both survive.
        assert_eq!(store.sweep_expired(Utc::now()), 0);

        // Past the TTL only the terminal one goes.
        let later = Utc::now() + chrono::Duration::milliseconds(200);
        assert_eq!(store.sweep_expired(later), 1);
        assert!(store.get(done_id).is_none());
        assert_eq!(store.active_count(), 1);
    }
}
