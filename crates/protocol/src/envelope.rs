//! The message envelope every bus payload conforms to.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Hard cap on an encoded envelope. Larger audio must use reference form.
pub const MAX_ENVELOPE_BYTES: usize = 256 * 1024;

/// Destination wildcard meaning "any interested service".
pub const BROADCAST: &str = "*";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Message kinds carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Heartbeat,
    Command,
    Error,
}

/// The outer structure of every bus message.
///
/// Construct via [`Envelope::request`], [`Envelope::response`],
/// [`Envelope::event`] etc. so the correlation rules hold: a `request`
/// always carries a fresh `correlation_id`; a `response`/`error` always
/// echoes the one it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub destination: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    fn new(
        source: &str,
        destination: &str,
        message_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.to_owned(),
            destination: destination.to_owned(),
            message_type,
            correlation_id: None,
            ttl_ms: None,
            payload,
        }
    }

    /// A request with a freshly minted correlation ID.
    pub fn request(source: &str, destination: &str, payload: Value) -> Self {
        let mut env = Self::new(source, destination, MessageType::Request, payload);
        env.correlation_id = Some(Uuid::new_v4());
        env
    }

    /// A response echoing the request's correlation ID.
    pub fn response(source: &str, request: &Envelope, payload: Value) -> Self {
        let mut env = Self::new(source, &request.source, MessageType::Response, payload);
        env.correlation_id = request.correlation_id;
        env
    }

    /// An error reply echoing the request's correlation ID.
    pub fn error_reply(source: &str, request: &Envelope, error: ErrorPayload) -> Self {
        let payload = serde_json::to_value(&error).unwrap_or(Value::Null);
        let mut env = Self::new(source, &request.source, MessageType::Error, payload);
        env.correlation_id = request.correlation_id;
        env
    }

    pub fn event(source: &str, payload: Value) -> Self {
        Self::new(source, BROADCAST, MessageType::Event, payload)
    }

    pub fn command(source: &str, destination: &str, payload: Value) -> Self {
        Self::new(source, destination, MessageType::Command, payload)
    }

    pub fn heartbeat(source: &str, payload: Value) -> Self {
        Self::new(source, BROADCAST, MessageType::Heartbeat, payload)
    }

    /// Set a time-to-live; receivers drop the envelope once it has aged out.
    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    /// Whether the envelope's TTL has lapsed at `now`.
    ///
    /// A `ttl_ms` of zero is expired on arrival. Envelopes with a timestamp
    /// in the future (clock skew) are treated as fresh.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_ms {
            Some(0) => true,
            Some(ttl) => {
                let age = now.signed_duration_since(self.timestamp).num_milliseconds();
                age > ttl as i64
            }
            None => false,
        }
    }

    /// Decode the payload into a typed struct.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Serialize for publishing. Enforces [`MAX_ENVELOPE_BYTES`].
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let bytes = serde_json::to_vec(self).map_err(EncodeError::Json)?;
        if bytes.len() > MAX_ENVELOPE_BYTES {
            return Err(EncodeError::TooLarge { size: bytes.len() });
        }
        Ok(bytes)
    }
}

/// Parse raw bytes into an envelope.
///
/// An unknown `message_type` or malformed JSON is a [`DecodeError`]; the
/// caller counts and drops, never panics.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    if bytes.len() > MAX_ENVELOPE_BYTES {
        return Err(DecodeError::TooLarge { size: bytes.len() });
    }
    serde_json::from_slice(bytes).map_err(|e| {
        // Distinguish "not an envelope at all" from "envelope with a
        // message_type this build does not know" so the counters differ.
        let unknown_kind = serde_json::from_slice::<Value>(bytes)
            .ok()
            .filter(|v| v.get("message_id").is_some())
            .and_then(|v| {
                v.get("message_type")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            })
            .filter(|kind| serde_json::from_value::<MessageType>(Value::String(kind.clone())).is_err());
        match unknown_kind {
            Some(kind) => DecodeError::UnknownMessageType { kind, source: e },
            None => DecodeError::Malformed(e),
        }
    })
}

#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    #[error("envelope exceeds {MAX_ENVELOPE_BYTES} bytes ({size}); use reference form")]
    TooLarge { size: usize },
    #[error("JSON: {0}")]
    Json(#[source] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("payload exceeds {MAX_ENVELOPE_BYTES} bytes ({size})")]
    TooLarge { size: usize },
    #[error("not a valid envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown message_type {kind:?}")]
    UnknownMessageType {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Common payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Body of an `error` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable machine code, e.g. `"validation_error"`, `"service_busy"`.
    pub code: String,
    pub message: String,
    /// Per-field detail for validation errors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}

impl ErrorPayload {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub parameter: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<String>,
}

/// Binary audio, either inline (base64) or referenced by URL.
///
/// Inline form must keep the enclosing envelope under
/// [`MAX_ENVELOPE_BYTES`]; anything bigger travels by reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AudioData {
    Inline {
        content_type: String,
        data_b64: String,
    },
    Reference {
        url: String,
    },
}

impl AudioData {
    pub fn inline(content_type: &str, bytes: &[u8]) -> Self {
        Self::Inline {
            content_type: content_type.to_owned(),
            data_b64: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn reference(url: impl Into<String>) -> Self {
        Self::Reference { url: url.into() }
    }

    /// Decode inline audio; `None` for the reference form.
    pub fn bytes(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        match self {
            Self::Inline { data_b64, .. } => {
                Some(base64::engine::general_purpose::STANDARD.decode(data_b64))
            }
            Self::Reference { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_gets_fresh_correlation_id() {
        let a = Envelope::request("voice_router", "stt", Value::Null);
        let b = Envelope::request("voice_router", "stt", Value::Null);
        assert!(a.correlation_id.is_some());
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn response_echoes_correlation_id() {
        let req = Envelope::request("voice_router", "stt", Value::Null);
        let resp = Envelope::response("stt", &req, serde_json::json!({"transcript": "hi"}));
        assert_eq!(resp.correlation_id, req.correlation_id);
        assert_eq!(resp.destination, "voice_router");
        assert_eq!(resp.message_type, MessageType::Response);
    }

    #[test]
    fn encode_decode_round_trip() {
        let env = Envelope::request(
            "device_manager",
            "light.kitchen",
            serde_json::json!({"capability": "turn_on"}),
        )
        .with_ttl(5_000);
        let bytes = env.encode().unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back.message_id, env.message_id);
        assert_eq!(back.correlation_id, env.correlation_id);
        assert_eq!(back.ttl_ms, Some(5_000));
        assert_eq!(back.payload, env.payload);
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let env = Envelope::event("x", Value::Null).with_ttl(0);
        assert!(env.is_expired(Utc::now()));
    }

    #[test]
    fn ttl_expiry_uses_publish_timestamp() {
        let mut env = Envelope::event("x", Value::Null).with_ttl(1_000);
        assert!(!env.is_expired(Utc::now()));
        env.timestamp = Utc::now() - chrono::Duration::milliseconds(1_500);
        assert!(env.is_expired(Utc::now()));
    }

    #[test]
    fn unknown_message_type_is_a_distinct_error() {
        let raw = serde_json::json!({
            "message_id": Uuid::new_v4(),
            "timestamp": Utc::now(),
            "source": "future_service",
            "destination": "*",
            "message_type": "telepathy",
            "payload": {}
        });
        let err = decode(&serde_json::to_vec(&raw).unwrap()).unwrap_err();
        match err {
            DecodeError::UnknownMessageType { kind, .. } => assert_eq!(kind, "telepathy"),
            other => panic!("expected UnknownMessageType, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(decode(b"not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(
            decode(br#"{"hello": "world"}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_encode_is_rejected() {
        let blob = "x".repeat(MAX_ENVELOPE_BYTES);
        let env = Envelope::event("tts", serde_json::json!({ "audio": blob }));
        assert!(matches!(env.encode(), Err(EncodeError::TooLarge { .. })));
    }

    #[test]
    fn audio_inline_round_trip() {
        let pcm = vec![7u8; 2048];
        let audio = AudioData::inline("audio/pcm", &pcm);
        assert_eq!(audio.bytes().unwrap().unwrap(), pcm);

        let reference = AudioData::reference("mem://u1");
        assert!(reference.bytes().is_none());
    }
}
