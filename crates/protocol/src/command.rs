//! Device command lifecycle model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Command state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Queued,
    Dispatched,
    Acknowledged,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl CommandState {
    /// Whether the command can move from `self` to `next`.
    ///
    /// The only back-edge is `Dispatched → Queued`, used when a dispatch
    /// attempt times out (retry) or the device drops offline mid-flight.
    pub fn can_transition_to(self, next: CommandState) -> bool {
        use CommandState::*;
        matches!(
            (self, next),
            (Queued, Dispatched)
                | (Queued, Cancelled)
                | (Queued, TimedOut)
                | (Dispatched, Queued)
                | (Dispatched, Acknowledged)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Dispatched, TimedOut)
                | (Dispatched, Cancelled)
                | (Acknowledged, Completed)
                | (Acknowledged, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        use CommandState::*;
        matches!(self, Completed | Failed | TimedOut | Cancelled)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RPC payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `enqueue_command` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Target devices, in order. Must be non-empty.
    pub device_ids: Vec<String>,
    pub capability: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Queue for an offline device instead of failing fast.
    #[serde(default)]
    pub allow_offline: bool,
}

/// Accepted-command view returned by `enqueue_command` and `get_command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTicket {
    pub command_id: Uuid,
    pub device_ids: Vec<String>,
    pub capability: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    pub state: CommandState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Per-device progress; aggregate `state` is derived from these.
    #[serde(default)]
    pub outcomes: BTreeMap<String, DeviceOutcome>,
}

/// Progress of one command on one target device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOutcome {
    pub state: CommandState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload published on `alicia/devices/<id>/command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDispatch {
    pub command_id: Uuid,
    pub capability: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

/// Device → hub ack payload on `alicia/devices/<id>/ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAck {
    pub command_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_is_the_only_back_edge() {
        use CommandState::*;
        assert!(Dispatched.can_transition_to(Queued));
        // No other transition may return to an earlier state.
        for from in [Acknowledged, Completed, Failed, TimedOut, Cancelled] {
            assert!(!from.can_transition_to(Queued), "{from:?} -> Queued");
            assert!(!from.can_transition_to(Dispatched), "{from:?} -> Dispatched");
        }
    }

    #[test]
    fn terminal_states_have_no_successors() {
        use CommandState::*;
        for from in [Completed, Failed, TimedOut, Cancelled] {
            for to in [Queued, Dispatched, Acknowledged, Completed, Failed, TimedOut, Cancelled] {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn happy_path_is_legal() {
        use CommandState::*;
        assert!(Queued.can_transition_to(Dispatched));
        assert!(Dispatched.can_transition_to(Completed));
        assert!(Dispatched.can_transition_to(Acknowledged));
        assert!(Acknowledged.can_transition_to(Completed));
    }
}
