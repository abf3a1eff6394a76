use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Voice pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// End-to-end budget for one voice interaction.
    #[serde(default = "d_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Terminal sessions are kept around this long for status queries.
    #[serde(default = "d_session_ttl_ms")]
    pub session_ttl_ms: u64,
    #[serde(default = "d_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "d_stt_timeout_ms")]
    pub stt_timeout_ms: u64,
    #[serde(default = "d_ai_timeout_ms")]
    pub ai_timeout_ms: u64,
    #[serde(default = "d_tts_timeout_ms")]
    pub tts_timeout_ms: u64,
    /// STT results below this confidence are treated as empty.
    #[serde(default = "d_min_confidence")]
    pub min_stt_confidence: f32,
    /// Spoken when the pipeline fails after a successful STT.
    #[serde(default = "d_fallback_text")]
    pub fallback_text: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: d_session_timeout_ms(),
            session_ttl_ms: d_session_ttl_ms(),
            max_concurrent_sessions: d_max_concurrent_sessions(),
            stt_timeout_ms: d_stt_timeout_ms(),
            ai_timeout_ms: d_ai_timeout_ms(),
            tts_timeout_ms: d_tts_timeout_ms(),
            min_stt_confidence: d_min_confidence(),
            fallback_text: d_fallback_text(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_session_timeout_ms() -> u64 {
    15_000
}
fn d_session_ttl_ms() -> u64 {
    300_000
}
fn d_max_concurrent_sessions() -> usize {
    64
}
fn d_stt_timeout_ms() -> u64 {
    10_000
}
fn d_ai_timeout_ms() -> u64 {
    10_000
}
fn d_tts_timeout_ms() -> u64 {
    8_000
}
fn d_min_confidence() -> f32 {
    0.4
}
fn d_fallback_text() -> String {
    "I had trouble with that.".into()
}
