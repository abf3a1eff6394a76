use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_8080")]
    pub port: u16,
    /// Origins allowed for CORS. Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
    /// Environment variable holding the shutdown bearer token.
    /// If the env var is unset, `POST /shutdown` is **disabled** (403).
    #[serde(default = "d_shutdown_token_env")]
    pub shutdown_token_env: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_8080(),
            allowed_origins: d_cors_origins(),
            shutdown_token_env: d_shutdown_token_env(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_8080() -> u16 {
    8080
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".into(), "http://127.0.0.1:*".into()]
}
fn d_shutdown_token_env() -> String {
    "ALICIA_SHUTDOWN_TOKEN".into()
}
