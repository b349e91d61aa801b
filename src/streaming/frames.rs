//! Stream wire frames and transport encodings

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One emitted token piece
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenFrame {
    pub token: String,
    /// Strictly increasing per stream, starting at 0
    pub token_index: u64,
    pub timestamp_unix_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprob: Option<f32>,
    pub is_special: bool,
    /// Present only on the final token of a stream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl TokenFrame {
    /// Frame for a token piece at `index`, stamped now
    pub fn new(token: impl Into<String>, index: u64) -> Self {
        Self {
            token: token.into(),
            token_index: index,
            timestamp_unix_ms: Utc::now().timestamp_millis(),
            logprob: None,
            is_special: false,
            finish_reason: None,
        }
    }

    /// Mark this as the stream's final token
    pub fn with_finish(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }
}

/// Periodic stream-level statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataFrame {
    pub stream_id: String,
    pub request_id: String,
    pub model_id: String,
    pub total_tokens: u64,
    pub tokens_per_second: f64,
    pub latency_ms: f64,
}

/// Terminal frame carried on every stream end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseFrame {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Any frame a connection can carry
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Token(TokenFrame),
    Metadata(MetadataFrame),
    Close(CloseFrame),
}

impl StreamFrame {
    /// Event name used by both transport framings
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Metadata(_) => "metadata",
            Self::Close(_) => "close",
        }
    }

    fn payload_json(&self) -> serde_json::Value {
        match self {
            Self::Token(frame) => serde_json::to_value(frame),
            Self::Metadata(frame) => serde_json::to_value(frame),
            Self::Close(frame) => serde_json::to_value(frame),
        }
        .unwrap_or(serde_json::Value::Null)
    }

    /// Server-sent-events framing: `event: <name>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event_name(), self.payload_json())
    }

    /// WebSocket-like framing: one text message of `{type, data}`
    pub fn to_ws_text(&self) -> String {
        serde_json::json!({
            "type": self.event_name(),
            "data": self.payload_json(),
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_framing() {
        let frame = StreamFrame::Token(TokenFrame::new("hello", 0));
        let encoded = frame.to_sse();
        assert!(encoded.starts_with("event: token\ndata: {"));
        assert!(encoded.ends_with("\n\n"));
        assert!(encoded.contains("\"token\":\"hello\""));
        assert!(encoded.contains("\"token_index\":0"));
    }

    #[test]
    fn test_ws_framing() {
        let frame = StreamFrame::Close(CloseFrame {
            reason: "cancelled".into(),
            message: None,
        });
        let parsed: serde_json::Value = serde_json::from_str(&frame.to_ws_text()).unwrap();
        assert_eq!(parsed["type"], "close");
        assert_eq!(parsed["data"]["reason"], "cancelled");
        assert!(parsed["data"].get("message").is_none());
    }

    #[test]
    fn test_final_token_carries_finish_reason() {
        let frame = TokenFrame::new("done", 7).with_finish("stop");
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(encoded.contains("\"finish_reason\":\"stop\""));
        // Optional fields stay absent rather than null.
        assert!(!encoded.contains("logprob"));
    }

    #[test]
    fn test_metadata_round_trip() {
        let frame = MetadataFrame {
            stream_id: "s1".into(),
            request_id: "r1".into(),
            model_id: "mA".into(),
            total_tokens: 42,
            tokens_per_second: 18.5,
            latency_ms: 12.0,
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        let decoded: MetadataFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }
}
