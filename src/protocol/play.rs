//! Sandbox ("play") stream events.

use super::{value_text, WireEnvelope};
use serde::Deserialize;
use serde_json::Value;

pub const PLAY_STARTED: &str = "play_started";
pub const PLAY_SANDBOX: &str = "play_sandbox";
pub const PLAY_LOG: &str = "play_log";
pub const PLAY_PREVIEW: &str = "play_preview";
pub const PLAY_COMPLETE: &str = "play_complete";
pub const PLAY_FAILED: &str = "play_failed";

#[derive(Debug, Clone, PartialEq)]
pub enum PlayEvent {
    Started {
        entry_path: Option<String>,
        runtime: Option<String>,
    },
    Sandbox {
        sandbox_id: String,
        status: Option<String>,
    },
    Log(String),
    Preview {
        url: String,
        port: Option<u16>,
    },
    Complete {
        exit_code: i64,
    },
    Failed(String),
    Unknown {
        event_type: String,
    },
}

impl PlayEvent {
    /// Parse one SSE `data` payload from a play stream.
    pub fn parse_payload(payload: &str) -> Self {
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => Self::parse(&value),
            Err(_) => Self::Unknown {
                event_type: String::new(),
            },
        }
    }

    pub fn parse(value: &Value) -> Self {
        let Ok(envelope) = WireEnvelope::deserialize(value) else {
            return Self::Unknown {
                event_type: String::new(),
            };
        };
        let data = envelope.data.clone().unwrap_or(Value::Null);
        let field = |key: &str| data.get(key).and_then(Value::as_str).map(ToString::to_string);

        match envelope.event_type.as_str() {
            PLAY_STARTED => Self::Started {
                entry_path: field("entry_path"),
                runtime: field("runtime"),
            },
            PLAY_SANDBOX => match field("sandbox_id") {
                Some(sandbox_id) => Self::Sandbox {
                    sandbox_id,
                    status: field("status"),
                },
                None => Self::Unknown {
                    event_type: envelope.event_type.clone(),
                },
            },
            PLAY_LOG => Self::Log(value_text(&data).unwrap_or_default()),
            PLAY_PREVIEW => match field("url") {
                Some(url) => Self::Preview {
                    url,
                    port: data
                        .get("port")
                        .and_then(Value::as_u64)
                        .and_then(|p| u16::try_from(p).ok()),
                },
                None => Self::Unknown {
                    event_type: envelope.event_type.clone(),
                },
            },
            PLAY_COMPLETE => Self::Complete {
                exit_code: data.get("exit_code").and_then(Value::as_i64).unwrap_or(0),
            },
            PLAY_FAILED => Self::Failed(
                envelope
                    .error
                    .as_ref()
                    .and_then(value_text)
                    .or_else(|| value_text(&data))
                    .unwrap_or_else(|| "sandbox failed".to_string()),
            ),
            other => Self::Unknown {
                event_type: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_play_lifecycle() {
        assert_eq!(
            PlayEvent::parse(&json!({"event_type": "play_started", "data": {"entry_path": "main.py", "runtime": "auto"}})),
            PlayEvent::Started {
                entry_path: Some("main.py".into()),
                runtime: Some("auto".into())
            }
        );
        assert_eq!(
            PlayEvent::parse(&json!({"event_type": "play_sandbox", "data": {"sandbox_id": "sb_1", "status": null}})),
            PlayEvent::Sandbox {
                sandbox_id: "sb_1".into(),
                status: None
            }
        );
        assert_eq!(
            PlayEvent::parse(&json!({"event_type": "play_log", "data": "hi\n"})),
            PlayEvent::Log("hi\n".into())
        );
        assert_eq!(
            PlayEvent::parse(&json!({"event_type": "play_preview", "data": {"url": "https://x", "port": 8000}})),
            PlayEvent::Preview {
                url: "https://x".into(),
                port: Some(8000)
            }
        );
        assert_eq!(
            PlayEvent::parse(&json!({"event_type": "play_complete", "data": {"exit_code": 0}})),
            PlayEvent::Complete { exit_code: 0 }
        );
        assert_eq!(
            PlayEvent::parse(&json!({"event_type": "play_failed", "error": "Process exited with code 1"})),
            PlayEvent::Failed("Process exited with code 1".into())
        );
    }

    #[test]
    fn unknown_play_events_are_tolerated() {
        assert_eq!(
            PlayEvent::parse_payload("{\"event_type\":\"play_heartbeat\"}"),
            PlayEvent::Unknown {
                event_type: "play_heartbeat".into()
            }
        );
        assert!(matches!(PlayEvent::parse_payload("nope"), PlayEvent::Unknown { .. }));
    }
}
