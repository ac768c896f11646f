//! NDJSON parser for the agent stream-json protocol.
//!
//! Implements tolerant reader pattern: unknown fields ignored, unknown types
//! forwarded as [`Message::Unknown`], malformed payloads of a known type
//! filled with defaults rather than rejected.

use serde_json::Value;
use tracing::debug;

use super::types::*;
use crate::error::{Error, Result};

/// Parse a single NDJSON line from an agent's stdout.
pub fn parse_line(line: &str) -> Result<Message> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into a canonical message.
///
/// Fails only when the value carries no string `type` discriminator.
pub fn parse_value(raw: &Value) -> Result<Message> {
    let msg_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing 'type' field".into()))?;

    let msg = match msg_type {
        "system" => parse_system(raw),
        "assistant" => parse_assistant(raw),
        "user" => parse_user(raw),
        "tool_use" => parse_tool_use(raw),
        "tool_result" => parse_tool_result(raw),
        "error" => parse_error(raw),
        "control_request" => parse_control_request(raw),
        "result" => parse_result(raw),
        _ => Message::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        },
    };
    Ok(msg)
}

fn str_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(String::from)
}

/// Cost of a message: `cost_usd`, falling back to `total_cost_usd`.
pub(crate) fn cost_field(raw: &Value) -> Option<f64> {
    raw.get("cost_usd")
        .and_then(Value::as_f64)
        .or_else(|| raw.get("total_cost_usd").and_then(Value::as_f64))
}

fn parse_system(raw: &Value) -> Message {
    let tools = raw
        .get("tools")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    t.as_str()
                        .or_else(|| t.get("name").and_then(Value::as_str))
                        .map(String::from)
                })
                .collect()
        })
        .unwrap_or_default();

    Message::System(SystemMessage {
        subtype: str_field(raw, "subtype"),
        session_id: str_field(raw, "session_id"),
        model: str_field(raw, "model"),
        cwd: raw
            .get("cwd")
            .and_then(Value::as_str)
            .map(std::path::PathBuf::from),
        tools,
    })
}

fn parse_assistant(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);

    let content = parse_content_blocks(msg.get("content"));
    let stop_reason = parse_stop_reason(msg.get("stop_reason"));
    let usage = parse_usage(msg.get("usage"));

    Message::Assistant(AssistantMessage {
        content,
        stop_reason,
        usage,
        session_id: str_field(raw, "session_id"),
    })
}

fn parse_content_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    match content {
        Some(Value::String(text)) => vec![ContentBlock::Text { text: text.clone() }],
        Some(Value::Array(arr)) => arr.iter().filter_map(parse_content_block).collect(),
        Some(other) => {
            debug!(shape = %json_kind(other), "Unexpected content shape, ignoring");
            Vec::new()
        }
        None => Vec::new(),
    }
}

fn parse_content_block(block: &Value) -> Option<ContentBlock> {
    let block_type = block.get("type")?.as_str()?;
    match block_type {
        "text" => {
            let text = block.get("text")?.as_str()?.to_string();
            Some(ContentBlock::Text { text })
        }
        "tool_use" => {
            let id = str_field(block, "id").unwrap_or_default();
            let name = block.get("name")?.as_str()?.to_string();
            let input = block.get("input").cloned().unwrap_or(Value::Null);
            Some(ContentBlock::ToolUse { id, name, input })
        }
        "tool_result" => Some(ContentBlock::ToolResult {
            tool_use_id: str_field(block, "tool_use_id").unwrap_or_default(),
            content: flatten_content(block.get("content")),
            is_error: block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        _ => None,
    }
}

/// Tool output may be a string, an array of text blocks, or arbitrary JSON.
fn flatten_content(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .or_else(|| item.get("text").and_then(Value::as_str))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

fn parse_stop_reason(val: Option<&Value>) -> StopReason {
    match val.and_then(Value::as_str) {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(other) if other != "end_turn" => StopReason::Unknown(other.to_string()),
        _ => StopReason::EndTurn,
    }
}

pub(crate) fn parse_usage(val: Option<&Value>) -> Usage {
    val.and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn parse_user(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);
    Message::User(UserMessage {
        content: parse_content_blocks(msg.get("content")),
        session_id: str_field(raw, "session_id"),
    })
}

fn parse_tool_use(raw: &Value) -> Message {
    let tool = raw.get("tool").unwrap_or(raw);
    Message::ToolUse(ToolUseMessage {
        id: str_field(tool, "id").or_else(|| str_field(raw, "tool_use_id")),
        name: str_field(tool, "name")
            .or_else(|| str_field(raw, "tool_name"))
            .unwrap_or_default(),
        input: tool
            .get("input")
            .or_else(|| raw.get("input"))
            .cloned()
            .unwrap_or(Value::Null),
    })
}

fn parse_tool_result(raw: &Value) -> Message {
    let content = raw
        .get("content")
        .or_else(|| raw.get("output"))
        .or_else(|| raw.get("result"));
    Message::ToolResult(ToolResultMessage {
        tool_use_id: str_field(raw, "tool_use_id"),
        content: flatten_content(content),
        is_error: raw
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn parse_error(raw: &Value) -> Message {
    let message = match raw.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(obj @ Value::Object(_)) => str_field(obj, "message"),
        _ => None,
    }
    .or_else(|| str_field(raw, "message"))
    .unwrap_or_else(|| "Unknown error".to_string());

    Message::Error(ErrorMessage {
        message,
        synthetic: false,
    })
}

fn parse_control_request(raw: &Value) -> Message {
    let request = raw.get("request").cloned().unwrap_or(Value::Null);
    let subtype = request
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or("");

    let request_type = match subtype {
        "can_use_tool" => ControlRequestType::CanUseTool {
            tool_name: str_field(&request, "tool_name").unwrap_or_default(),
            input: request.get("input").cloned().unwrap_or(Value::Null),
        },
        _ => ControlRequestType::Unknown(request),
    };

    Message::ControlRequest(ControlRequest {
        request_id: str_field(raw, "request_id").unwrap_or_default(),
        request: request_type,
    })
}

fn parse_result(raw: &Value) -> Message {
    let subtype = match raw.get("subtype").and_then(Value::as_str) {
        Some("success") | None => ResultSubtype::Success,
        Some("error" | "error_during_execution") => ResultSubtype::Error,
        Some("error_max_turns") => ResultSubtype::ErrorMaxTurns,
        Some(other) => ResultSubtype::Unknown(other.to_string()),
    };

    Message::Result(SessionResult {
        subtype,
        session_id: str_field(raw, "session_id"),
        duration_ms: raw.get("duration_ms").and_then(Value::as_u64),
        cost_usd: cost_field(raw),
        num_turns: raw
            .get("num_turns")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        is_error: raw
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        result: str_field(raw, "result"),
        usage: parse_usage(raw.get("usage")),
    })
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
