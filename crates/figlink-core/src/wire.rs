use crate::identity::Role;
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const JOIN: &str = "join";
pub const JOINED: &str = "joined";
pub const CONNECTED: &str = "connected";
pub const ERROR: &str = "error";

/// JSON object carried by every text frame on the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub broadcast: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub forwarded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            request_id: None,
            timestamp: now_ms(),
            target: None,
            sender: None,
            broadcast: false,
            forwarded: false,
            sender_role: None,
            error: None,
        }
    }

    pub fn ping() -> Self {
        Self::new(PING, Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(PONG, Value::Null)
    }

    /// Reply that fails the pending request `request_id` on the receiving side.
    pub fn error_reply(request_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            request_id,
            error: Some(message.into()),
            ..Self::new(ERROR, Value::Null)
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_sender_role(mut self, role: Role) -> Self {
        self.sender_role = Some(role);
        self
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == PING || self.kind == PONG
    }

    /// Copy handed to a recipient: stamped with the originating connection,
    /// everything else left as the sender wrote it.
    pub fn forwarded_from(&self, sender: &str) -> Self {
        Self {
            sender: Some(sender.to_string()),
            forwarded: true,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame has an empty type")]
    MissingType,
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame(envelope: &Envelope, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(envelope).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame(bytes: &[u8], max_frame_bytes: usize) -> Result<Envelope, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))?;
    if envelope.kind.trim().is_empty() {
        return Err(FrameError::MissingType);
    }
    Ok(envelope)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Browser peers send `Date.now()`, which may arrive as a float or be missing.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(0),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(f) = n.as_f64() {
                Ok(f as i64)
            } else {
                Err(serde::de::Error::custom("timestamp out of range"))
            }
        }
        Value::String(s) => s.trim().parse::<i64>().map_err(serde::de::Error::custom),
        _ => Err(serde::de::Error::custom(
            "expected number or string for timestamp",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_a_minimal_browser_frame() {
        let envelope = decode_frame(
            br#"{"type":"pull","requestId":"r1","timestamp":1700000000000.5}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        assert_eq!(envelope.kind, "pull");
        assert_eq!(envelope.request_id.as_deref(), Some("r1"));
        assert_eq!(envelope.timestamp, 1_700_000_000_000);
        assert!(envelope.data.is_null());
        assert!(!envelope.broadcast);
    }

    #[test]
    fn missing_timestamp_defaults_to_zero() {
        let envelope =
            decode_frame(br#"{"type":"state","data":{"sel":"X"}}"#, DEFAULT_MAX_FRAME_BYTES)
                .expect("decode");
        assert_eq!(envelope.timestamp, 0);
        assert_eq!(envelope.data, json!({"sel": "X"}));
    }

    #[test]
    fn forwarded_copy_keeps_payload_and_stamps_sender() {
        let original = Envelope::new("pull", json!({"node": "1:2"})).with_request_id("r1");
        let forwarded = original.forwarded_from("mcp_abc");
        assert_eq!(forwarded.sender.as_deref(), Some("mcp_abc"));
        assert!(forwarded.forwarded);
        assert_eq!(forwarded.kind, original.kind);
        assert_eq!(forwarded.data, original.data);
        assert_eq!(forwarded.request_id, original.request_id);

        let text = encode_frame(&forwarded, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["type"], "pull");
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["sender"], "mcp_abc");
        assert_eq!(value["forwarded"], true);
        assert!(value.get("broadcast").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn sender_role_serializes_lowercase() {
        let envelope = Envelope::new("get_selection", Value::Null)
            .with_request_id("r9")
            .with_sender_role(Role::Mcp);
        let text = encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["senderRole"], "mcp");
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(
            decode_frame(b"{\"type\":", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
        assert!(matches!(
            decode_frame(br#"{"type":"  "}"#, DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::MissingType)
        ));
        assert!(matches!(
            decode_frame(br#"{"data":1}"#, DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
    }

    #[test]
    fn enforces_frame_limits_both_ways() {
        let envelope = Envelope::new("push", json!({"html": "x".repeat(128)}));
        assert!(matches!(
            encode_frame(&envelope, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
        let raw = serde_json::to_vec(&envelope).expect("encode");
        assert!(matches!(
            decode_frame(&raw, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn error_reply_carries_request_id() {
        let reply = Envelope::error_reply(Some("r4".to_string()), "bad join");
        assert_eq!(reply.kind, ERROR);
        assert_eq!(reply.request_id.as_deref(), Some("r4"));
        assert_eq!(reply.error.as_deref(), Some("bad join"));
    }
}
