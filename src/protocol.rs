use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Literal payload terminating an event stream.
pub const DONE_SENTINEL: &str = "[DONE]";

// ---------------------------------------------------------------------------
// Request wire types
// ---------------------------------------------------------------------------

/// Chat Completions request body. Always sent with `stream: true`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<FunctionSpec>>,
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Function name; required on `role: function` result messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Message author role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

/// A callable function advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the function's arguments.
    pub parameters: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Response wire types
// ---------------------------------------------------------------------------

/// One streamed chunk envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub created: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    pub choices: Vec<ChunkChoice>,
}

/// A single choice in a streamed chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
    pub finish_reason: Option<FinishReason>,
    #[serde(default)]
    pub index: u32,
}

/// Incremental delta payload within a chunk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub function_call: Option<FunctionCallChunk>,
}

/// Function-call fragment: name only on the first chunk of a call,
/// arguments on every chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCallChunk {
    #[serde(default)]
    pub name: Option<String>,
    pub arguments: String,
}

/// Enumerated cause for ending a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    FunctionCall,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinishReason::Stop => write!(f, "stop"),
            FinishReason::Length => write!(f, "length"),
            FinishReason::ContentFilter => write!(f, "content_filter"),
            FinishReason::FunctionCall => write!(f, "function_call"),
        }
    }
}

// ---------------------------------------------------------------------------
// Classified protocol events
// ---------------------------------------------------------------------------

/// Typed event produced from one data line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// First token of a turn carrying only the assistant role tag.
    RoleAnnounced,
    ContentDelta {
        text: String,
    },
    FunctionCallDelta {
        /// Present only on the first fragment of a call.
        name: Option<String>,
        args_delta: String,
    },
    Finish {
        reason: FinishReason,
    },
    /// Explicit `[DONE]` sentinel.
    StreamEnd,
}

/// Classify one protocol line into a typed event.
///
/// Non-data lines (blank separators, comments, unknown fields) produce
/// `Ok(None)`. The done sentinel produces [`ProtocolEvent::StreamEnd`].
/// Everything else must parse as a chunk envelope matching exactly one of
/// three legal shapes: a content-bearing delta with a null finish reason, a
/// finish event with an empty delta, or a function-call delta with a null
/// finish reason.
///
/// # Errors
///
/// Returns [`Error::MalformedEvent`] for any payload outside the closed
/// schema. This is fatal to the stream; there is no resynchronization.
pub fn classify_line(line: &str) -> Result<Option<ProtocolEvent>, Error> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }
    if payload == DONE_SENTINEL {
        return Ok(Some(ProtocolEvent::StreamEnd));
    }

    let chunk: ChatCompletionChunk = serde_json::from_str(payload)
        .map_err(|err| Error::MalformedEvent(format!("invalid chunk JSON: {err}")))?;
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Err(Error::MalformedEvent("chunk has no choices".to_string()));
    };

    classify_choice(choice).map(Some)
}

fn classify_choice(choice: ChunkChoice) -> Result<ProtocolEvent, Error> {
    let ChunkChoice {
        delta,
        finish_reason,
        ..
    } = choice;

    if let Some(reason) = finish_reason {
        // Shape 2: terminal token — the delta must be empty.
        if delta.content.is_some() || delta.function_call.is_some() {
            return Err(Error::MalformedEvent(
                "finish event carries a non-empty delta".to_string(),
            ));
        }
        return Ok(ProtocolEvent::Finish { reason });
    }

    if let Some(function_call) = delta.function_call {
        // Shape 3: function-call fragment.
        if delta.content.is_some() {
            return Err(Error::MalformedEvent(
                "delta carries both content and function_call".to_string(),
            ));
        }
        return Ok(ProtocolEvent::FunctionCallDelta {
            name: function_call.name,
            args_delta: function_call.arguments,
        });
    }

    // Shape 1: content token, possibly the first one carrying the role tag.
    if let Some(text) = delta.content {
        return Ok(ProtocolEvent::ContentDelta { text });
    }
    if delta.role.is_some() {
        return Ok(ProtocolEvent::RoleAnnounced);
    }

    Err(Error::MalformedEvent(
        "delta carries neither content, function_call, nor finish_reason".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ignores_non_data_lines() {
        assert_eq!(classify_line("").unwrap(), None);
        assert_eq!(classify_line(": comment").unwrap(), None);
        assert_eq!(classify_line("event: ping").unwrap(), None);
    }

    #[test]
    fn test_classify_ignores_empty_data_payload() {
        assert_eq!(classify_line("data:").unwrap(), None);
        assert_eq!(classify_line("data:   ").unwrap(), None);
    }

    #[test]
    fn test_classify_done_sentinel() {
        assert_eq!(
            classify_line("data: [DONE]").unwrap(),
            Some(ProtocolEvent::StreamEnd)
        );
    }

    #[test]
    fn test_classify_content_delta() {
        let line = r#"data: {"id":"chatcmpl-1","object":"chat.completion.chunk","created":1,"model":"gpt-4","choices":[{"delta":{"content":"Hi"},"finish_reason":null,"index":0}]}"#;
        assert_eq!(
            classify_line(line).unwrap(),
            Some(ProtocolEvent::ContentDelta {
                text: "Hi".to_string()
            })
        );
    }

    #[test]
    fn test_classify_role_announcement() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"},"finish_reason":null,"index":0}]}"#;
        assert_eq!(
            classify_line(line).unwrap(),
            Some(ProtocolEvent::RoleAnnounced)
        );
    }

    #[test]
    fn test_classify_role_with_empty_content_is_content_delta() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant","content":""},"finish_reason":null,"index":0}]}"#;
        assert_eq!(
            classify_line(line).unwrap(),
            Some(ProtocolEvent::ContentDelta {
                text: String::new()
            })
        );
    }

    #[test]
    fn test_classify_finish_event() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop","index":0}]}"#;
        assert_eq!(
            classify_line(line).unwrap(),
            Some(ProtocolEvent::Finish {
                reason: FinishReason::Stop
            })
        );
    }

    #[test]
    fn test_classify_all_finish_reasons() {
        for (wire, reason) in [
            ("stop", FinishReason::Stop),
            ("length", FinishReason::Length),
            ("content_filter", FinishReason::ContentFilter),
            ("function_call", FinishReason::FunctionCall),
        ] {
            let line = format!(
                r#"data: {{"choices":[{{"delta":{{}},"finish_reason":"{wire}","index":0}}]}}"#
            );
            assert_eq!(
                classify_line(&line).unwrap(),
                Some(ProtocolEvent::Finish { reason })
            );
        }
    }

    #[test]
    fn test_classify_function_call_first_fragment() {
        let line = r#"data: {"choices":[{"delta":{"function_call":{"name":"getUserName","arguments":""}},"finish_reason":null,"index":0}]}"#;
        assert_eq!(
            classify_line(line).unwrap(),
            Some(ProtocolEvent::FunctionCallDelta {
                name: Some("getUserName".to_string()),
                args_delta: String::new()
            })
        );
    }

    #[test]
    fn test_classify_function_call_continuation() {
        let line = r#"data: {"choices":[{"delta":{"function_call":{"arguments":"{}"}},"finish_reason":null,"index":0}]}"#;
        assert_eq!(
            classify_line(line).unwrap(),
            Some(ProtocolEvent::FunctionCallDelta {
                name: None,
                args_delta: "{}".to_string()
            })
        );
    }

    #[test]
    fn test_classify_rejects_invalid_json() {
        assert!(matches!(
            classify_line("data: {not json"),
            Err(Error::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_classify_rejects_unknown_finish_reason() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"eviction","index":0}]}"#;
        assert!(matches!(
            classify_line(line),
            Err(Error::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_classify_rejects_empty_choices() {
        assert!(matches!(
            classify_line(r#"data: {"choices":[]}"#),
            Err(Error::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_classify_rejects_finish_with_content() {
        let line = r#"data: {"choices":[{"delta":{"content":"x"},"finish_reason":"stop","index":0}]}"#;
        assert!(matches!(
            classify_line(line),
            Err(Error::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_classify_rejects_content_plus_function_call() {
        let line = r#"data: {"choices":[{"delta":{"content":"x","function_call":{"arguments":"y"}},"finish_reason":null,"index":0}]}"#;
        assert!(matches!(
            classify_line(line),
            Err(Error::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_classify_rejects_fully_empty_delta() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":null,"index":0}]}"#;
        assert!(matches!(
            classify_line(line),
            Err(Error::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_request_serializes_without_absent_functions() {
        let request = ChatRequest {
            model: "gpt-4".to_string(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: "Hello, World!".to_string(),
                name: None,
            }],
            functions: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("functions").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
