use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// One server-pushed notification, discriminated by `kind`. Decoding is
/// enforced here at the connection boundary; consumers never see untyped
/// payloads with optional fields to re-check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerEvent {
    Identity(IdentityFrame),
    Processing(ProcessingFrame),
    Completed(TerminalFrame),
    Error(TerminalFrame),
    Cancelled(TerminalFrame),
}

impl ServerEvent {
    /// The task the event refers to; `identity` frames carry none.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            ServerEvent::Identity(_) => None,
            ServerEvent::Processing(frame) => Some(&frame.task_id),
            ServerEvent::Completed(frame)
            | ServerEvent::Error(frame)
            | ServerEvent::Cancelled(frame) => Some(&frame.task_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Identity(_) => "identity",
            ServerEvent::Processing(_) => "processing",
            ServerEvent::Completed(_) => "completed",
            ServerEvent::Error(_) => "error",
            ServerEvent::Cancelled(_) => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityFrame {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingFrame {
    pub task_id: String,
    pub file_name: String,
    #[serde(default, deserialize_with = "deserialize_progress")]
    pub progress: Option<u8>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TerminalFrame {
    pub task_id: String,
    pub file_name: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Clamp progress into 0..=100 at the boundary rather than trusting the
/// server; out-of-range and fractional values arrive in practice.
fn deserialize_progress<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<f64>::deserialize(deserializer)?;
    Ok(raw.map(|value| value.clamp(0.0, 100.0).round() as u8))
}

pub fn decode_event(text: &str) -> Result<ServerEvent, FrameError> {
    if text.len() > DEFAULT_MAX_FRAME_BYTES {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: DEFAULT_MAX_FRAME_BYTES,
        });
    }
    serde_json::from_str(text).map_err(|err| FrameError::Decode(err.to_string()))
}

pub fn encode_event(event: &ServerEvent) -> Result<String, FrameError> {
    serde_json::to_string(event).map_err(|err| FrameError::Encode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_identity_frame() {
        let event = decode_event(r#"{"kind":"identity","sessionId":"sess-42"}"#).expect("decode");
        match event {
            ServerEvent::Identity(frame) => assert_eq!(frame.session_id, "sess-42"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_processing_frame_with_all_fields() {
        let event = decode_event(
            r#"{"kind":"processing","taskId":"t1","fileName":"a.xlsx","progress":37,"status":"processing","message":"row 370/1000"}"#,
        )
        .expect("decode");
        match event {
            ServerEvent::Processing(frame) => {
                assert_eq!(frame.task_id, "t1");
                assert_eq!(frame.file_name, "a.xlsx");
                assert_eq!(frame.progress, Some(37));
                assert_eq!(frame.status.as_deref(), Some("processing"));
                assert_eq!(frame.message.as_deref(), Some("row 370/1000"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_processing_frame_without_optional_fields() {
        let event = decode_event(r#"{"kind":"processing","taskId":"t1","fileName":"a.xlsx"}"#)
            .expect("decode");
        match event {
            ServerEvent::Processing(frame) => {
                assert_eq!(frame.progress, None);
                assert_eq!(frame.status, None);
                assert_eq!(frame.message, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn clamps_out_of_range_progress() {
        let over = decode_event(
            r#"{"kind":"processing","taskId":"t1","fileName":"a.xlsx","progress":150}"#,
        )
        .expect("decode");
        let under = decode_event(
            r#"{"kind":"processing","taskId":"t1","fileName":"a.xlsx","progress":-3}"#,
        )
        .expect("decode");
        let fractional = decode_event(
            r#"{"kind":"processing","taskId":"t1","fileName":"a.xlsx","progress":42.6}"#,
        )
        .expect("decode");
        for (event, expected) in [(over, 100), (under, 0), (fractional, 43)] {
            match event {
                ServerEvent::Processing(frame) => assert_eq!(frame.progress, Some(expected)),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn decodes_terminal_frames() {
        let completed =
            decode_event(r#"{"kind":"completed","taskId":"t1","fileName":"a.xlsx"}"#).expect("decode");
        assert_eq!(completed.kind(), "completed");
        assert_eq!(completed.task_id(), Some("t1"));

        let error = decode_event(
            r#"{"kind":"error","taskId":"t2","fileName":"b.xlsx","message":"bad format"}"#,
        )
        .expect("decode");
        match error {
            ServerEvent::Error(frame) => assert_eq!(frame.message.as_deref(), Some("bad format")),
            other => panic!("unexpected event: {other:?}"),
        }

        let cancelled = decode_event(
            r#"{"kind":"cancelled","taskId":"t3","fileName":"c.xlsx","message":"operator"}"#,
        )
        .expect("decode");
        assert_eq!(cancelled.kind(), "cancelled");
    }

    #[test]
    fn rejects_unknown_kind() {
        let result = decode_event(r#"{"kind":"telemetry","taskId":"t1","fileName":"a.xlsx"}"#);
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }

    #[test]
    fn rejects_missing_required_fields() {
        let result = decode_event(r#"{"kind":"processing","fileName":"a.xlsx"}"#);
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }

    #[test]
    fn rejects_malformed_json() {
        let result = decode_event(r#"{"kind":"processing""#);
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }

    #[test]
    fn rejects_oversized_frame() {
        let huge = format!(
            r#"{{"kind":"processing","taskId":"t1","fileName":"{}"}}"#,
            "x".repeat(DEFAULT_MAX_FRAME_BYTES)
        );
        assert!(matches!(
            decode_event(&huge),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn encode_decode_round_trip_for_all_kinds() {
        let events = [
            ServerEvent::Identity(IdentityFrame {
                session_id: "sess-1".to_string(),
            }),
            ServerEvent::Processing(ProcessingFrame {
                task_id: "t1".to_string(),
                file_name: "a.xlsx".to_string(),
                progress: Some(50),
                status: Some("processing".to_string()),
                message: None,
            }),
            ServerEvent::Completed(TerminalFrame {
                task_id: "t1".to_string(),
                file_name: "a.xlsx".to_string(),
                message: Some("done".to_string()),
            }),
            ServerEvent::Error(TerminalFrame {
                task_id: "t2".to_string(),
                file_name: "b.xlsx".to_string(),
                message: Some("bad format".to_string()),
            }),
            ServerEvent::Cancelled(TerminalFrame {
                task_id: "t3".to_string(),
                file_name: "c.xlsx".to_string(),
                message: None,
            }),
        ];
        for event in events {
            let encoded = encode_event(&event).expect("encode");
            let decoded = decode_event(&encoded).expect("decode");
            assert_eq!(decoded, event);
        }
    }
}
