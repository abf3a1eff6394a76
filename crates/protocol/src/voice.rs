//! Voice pipeline payloads: the contracts the STT, AI, and TTS
//! collaborators expose to the bus.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::AudioData;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound voice events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Payload of `alicia/voice/command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceCommand {
    /// Caller-chosen session id; the router rejects duplicates.
    pub session_id: Uuid,
    pub audio: AudioData,
}

/// Payload of `alicia/voice/cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceCancel {
    pub session_id: Uuid,
}

/// Payload of `alicia/voice/response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceResponse {
    pub session_id: Uuid,
    pub audio: AudioData,
    /// Spoken text, for transcripts and debugging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collaborator RPC contracts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttRequest {
    pub session_id: Uuid,
    pub audio: AudioData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttResponse {
    pub transcript: String,
    /// 0.0‥1.0; results under the router's threshold count as empty.
    #[serde(default = "d_confidence")]
    pub confidence: f32,
}

fn d_confidence() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRequest {
    pub session_id: Uuid,
    pub transcript: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponse {
    pub response_text: String,
    #[serde(default)]
    pub intents: Vec<Intent>,
}

/// A device action extracted by the AI collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub device_id: String,
    pub capability: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// When set, the pipeline waits for the command's terminal state
    /// before speaking.
    #[serde(default)]
    pub synchronous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsRequest {
    pub session_id: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsResponse {
    pub audio: AudioData,
}
