//! Message to output-record mapping.
//!
//! The mapping is total: every [`Message`] yields exactly one
//! [`OutputBody`], and unknown kinds become system records instead of being
//! dropped.

use std::fmt::Write as _;

use super::types::{ControlRequestType, Message, SessionResult, SystemMessage};
use crate::output::{OutputBody, OutputRecord};

/// Map a protocol message to its canonical output body.
pub fn to_output_body(msg: &Message) -> OutputBody {
    match msg {
        Message::Error(err) => OutputBody::Error {
            text: err.message.clone(),
        },
        Message::Result(result) => result_body(result),
        Message::System(system) => OutputBody::System {
            text: describe_system(system),
        },
        Message::ToolResult(tr) => OutputBody::ToolResult {
            tool_output: tr.content.clone(),
            is_error: tr.is_error,
        },
        Message::Assistant(assistant) => match assistant.first_tool_use() {
            Some((name, input)) => OutputBody::ToolUse {
                tool_name: name.to_string(),
                tool_input: input.clone(),
            },
            None => OutputBody::Text {
                text: assistant.text(),
            },
        },
        Message::User(user) => OutputBody::Text { text: user.text() },
        Message::ToolUse(tool) => OutputBody::ToolUse {
            tool_name: tool.name.clone(),
            tool_input: tool.input.clone(),
        },
        Message::ControlRequest(req) => OutputBody::System {
            text: match &req.request {
                ControlRequestType::CanUseTool { tool_name, .. } => {
                    format!("Permission requested for tool {tool_name}")
                }
                ControlRequestType::Unknown(_) => {
                    format!("Control request {}", req.request_id)
                }
            },
        },
        Message::Unknown { msg_type, .. } => OutputBody::System {
            text: format!("Unknown message type: {msg_type}"),
        },
    }
}

/// Map a protocol message to a timestamped output record.
pub fn to_output_record(msg: &Message) -> OutputRecord {
    OutputRecord::new(to_output_body(msg))
}

fn result_body(result: &SessionResult) -> OutputBody {
    if let Some(cost_usd) = result.cost_usd {
        return OutputBody::Cost {
            cost_usd,
            text: result.result.clone(),
        };
    }
    let mut text = format!("Result: {}", result.subtype.as_str());
    if let Some(ms) = result.duration_ms {
        let _ = write!(text, " ({ms} ms)");
    }
    OutputBody::System { text }
}

fn describe_system(system: &SystemMessage) -> String {
    match (system.subtype.as_deref(), system.model.as_deref()) {
        (Some("init"), Some(model)) => format!("Session initialized (model: {model})"),
        (Some("init"), None) => "Session initialized".to_string(),
        (Some(subtype), _) => format!("System: {subtype}"),
        (None, _) => "System message".to_string(),
    }
}
