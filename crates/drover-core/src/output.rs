//! Canonical output records.
//!
//! Every consumer of agent output sees [`OutputRecord`]s, never the upstream
//! wire format. The body is a tagged enum so a record can only carry the
//! fields of its own kind.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminant of an [`OutputBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Text,
    ToolUse,
    ToolResult,
    Error,
    Cost,
    System,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::Error => "error",
            Self::Cost => "cost",
            Self::System => "system",
        })
    }
}

/// Kind-specific payload of an output record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputBody {
    Text {
        text: String,
    },
    ToolUse {
        tool_name: String,
        tool_input: Value,
    },
    ToolResult {
        tool_output: String,
        #[serde(default)]
        is_error: bool,
    },
    Error {
        text: String,
    },
    Cost {
        cost_usd: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    System {
        text: String,
    },
}

impl OutputBody {
    pub const fn kind(&self) -> OutputKind {
        match self {
            Self::Text { .. } => OutputKind::Text,
            Self::ToolUse { .. } => OutputKind::ToolUse,
            Self::ToolResult { .. } => OutputKind::ToolResult,
            Self::Error { .. } => OutputKind::Error,
            Self::Cost { .. } => OutputKind::Cost,
            Self::System { .. } => OutputKind::System,
        }
    }
}

/// One normalized unit of agent output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub body: OutputBody,
}

impl OutputRecord {
    /// Stamp a body with the current time.
    pub fn new(body: OutputBody) -> Self {
        Self {
            timestamp_ms: now_millis(),
            body,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OutputBody::Text { text: text.into() })
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(OutputBody::Error { text: text.into() })
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(OutputBody::System { text: text.into() })
    }

    pub const fn kind(&self) -> OutputKind {
        self.body.kind()
    }

    /// Human-readable text carried by the record, if its kind has any.
    pub fn text_content(&self) -> Option<&str> {
        match &self.body {
            OutputBody::Text { text } | OutputBody::Error { text } | OutputBody::System { text } => {
                Some(text)
            }
            OutputBody::ToolResult { tool_output, .. } => Some(tool_output),
            OutputBody::Cost { text, .. } => text.as_deref(),
            OutputBody::ToolUse { .. } => None,
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[allow(clippy::cast_possible_truncation)]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
