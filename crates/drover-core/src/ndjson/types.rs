//! Message types for the agent stream-json protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Canonical protocol messages read from an agent's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    System(SystemMessage),
    Assistant(AssistantMessage),
    User(UserMessage),
    ToolUse(ToolUseMessage),
    ToolResult(ToolResultMessage),
    Error(ErrorMessage),
    ControlRequest(ControlRequest),
    Result(SessionResult),
    Unknown { msg_type: String, payload: Value },
}

impl Message {
    /// The `type` discriminator this message was parsed from.
    pub fn type_name(&self) -> &str {
        match self {
            Self::System(_) => "system",
            Self::Assistant(_) => "assistant",
            Self::User(_) => "user",
            Self::ToolUse(_) => "tool_use",
            Self::ToolResult(_) => "tool_result",
            Self::Error(_) => "error",
            Self::ControlRequest(_) => "control_request",
            Self::Result(_) => "result",
            Self::Unknown { msg_type, .. } => msg_type,
        }
    }

    /// Session id and cost embedded in the message, independent of how the
    /// message maps to an output record.
    pub fn metadata(&self) -> MessageMetadata {
        let session_id = match self {
            Self::System(m) => m.session_id.clone(),
            Self::Assistant(m) => m.session_id.clone(),
            Self::User(m) => m.session_id.clone(),
            Self::Result(m) => m.session_id.clone(),
            Self::Unknown { payload, .. } => payload
                .get("session_id")
                .and_then(Value::as_str)
                .map(String::from),
            Self::ToolUse(_) | Self::ToolResult(_) | Self::Error(_) | Self::ControlRequest(_) => {
                None
            }
        }
        .filter(|s| !s.is_empty());

        let cost_usd = match self {
            Self::Result(m) => m.cost_usd,
            Self::Unknown { payload, .. } => super::parser::cost_field(payload),
            _ => None,
        };

        MessageMetadata {
            session_id,
            cost_usd,
        }
    }
}

/// Side-channel values scanned from every message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageMetadata {
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
}

/// System message (init, status notices).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemMessage {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<PathBuf>,
    pub tools: Vec<String>,
}

/// Complete assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub session_id: Option<String>,
}

impl AssistantMessage {
    /// First tool invocation in the content, if any.
    pub fn first_tool_use(&self) -> Option<(&str, &Value)> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::ToolUse { name, input, .. } => Some((name.as_str(), input)),
            _ => None,
        })
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        concat_text(&self.content)
    }
}

/// User message (prompt echo or tool results).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserMessage {
    pub content: Vec<ContentBlock>,
    pub session_id: Option<String>,
}

impl UserMessage {
    /// Text of the message; tool results are included when no plain text is
    /// present so the record is never misleadingly empty.
    pub fn text(&self) -> String {
        let text = concat_text(&self.content);
        if !text.is_empty() {
            return text;
        }
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn concat_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Content block inside an assistant or user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// Reason the assistant stopped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    Unknown(String),
}

/// Token usage statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_input_tokens: u32,
    #[serde(default)]
    pub cache_creation_input_tokens: u32,
}

/// Top-level tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUseMessage {
    pub id: Option<String>,
    pub name: String,
    pub input: Value,
}

/// Top-level tool execution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResultMessage {
    pub tool_use_id: Option<String>,
    pub content: String,
    pub is_error: bool,
}

/// Error reported by the agent, or synthesized for a truncated stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub message: String,
    /// `true` when produced by the parser rather than read from the stream.
    pub synthetic: bool,
}

/// Permission or input request from the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_id: String,
    pub request: ControlRequestType,
}

/// Control request type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequestType {
    CanUseTool { tool_name: String, input: Value },
    Unknown(Value),
}

/// Session completion result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionResult {
    pub subtype: ResultSubtype,
    pub session_id: Option<String>,
    pub duration_ms: Option<u64>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
    pub is_error: bool,
    pub result: Option<String>,
    pub usage: Usage,
}

/// Result subtype.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultSubtype {
    #[default]
    Success,
    Error,
    ErrorMaxTurns,
    Unknown(String),
}

impl ResultSubtype {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::ErrorMaxTurns => "error_max_turns",
            Self::Unknown(other) => other,
        }
    }
}
