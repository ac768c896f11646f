//! Intervention requests: a running agent asking a human for input.
//!
//! Detection is pure: [`detect_intervention`] inspects a protocol message and
//! returns an [`InterventionDraft`] when the agent is blocked on a human. The
//! daemon turns drafts into tracked [`InterventionRequest`]s and answers them
//! over the agent's stdin.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ndjson::{ContentBlock, ControlRequestType, Message};
use crate::output::now_millis;
use crate::state::{InvalidTransition, StateMachine, Stateful};

/// Tool name the agent uses to ask the operator a question.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    Question,
    Approval,
    Input,
    Choice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    Pending,
    Answered,
    Timeout,
}

impl std::fmt::Display for InterventionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Answered => "answered",
            Self::Timeout => "timeout",
        })
    }
}

pub const INTERVENTION: StateMachine<InterventionStatus> = StateMachine::new(
    "intervention",
    &[
        (
            InterventionStatus::Pending,
            &[InterventionStatus::Answered, InterventionStatus::Timeout],
        ),
        (InterventionStatus::Answered, &[]),
        (InterventionStatus::Timeout, &[]),
    ],
);

/// What the stream told us before an id and owner are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterventionDraft {
    pub kind: InterventionKind,
    pub prompt: String,
    pub options: Option<Vec<String>>,
    pub context: String,
    /// Protocol-level id (control request id or tool use id), if any.
    pub source_id: Option<String>,
}

/// A tracked request for human input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterventionRequest {
    pub id: String,
    pub agent_id: String,
    pub process_id: String,
    pub kind: InterventionKind,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    pub context: String,
    pub status: InterventionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub created_at_ms: u64,
}

impl Stateful<InterventionStatus> for InterventionRequest {
    fn status(&self) -> InterventionStatus {
        self.status
    }

    fn set_status(&mut self, status: InterventionStatus) {
        self.status = status;
    }
}

impl InterventionRequest {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        process_id: impl Into<String>,
        draft: InterventionDraft,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            process_id: process_id.into(),
            kind: draft.kind,
            prompt: draft.prompt,
            options: draft.options,
            context: draft.context,
            status: InterventionStatus::Pending,
            response: None,
            source_id: draft.source_id,
            created_at_ms: now_millis(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == InterventionStatus::Pending
    }

    /// Record a response. Only a pending request can be answered.
    pub fn answer(
        &mut self,
        response: impl Into<String>,
    ) -> Result<(), InvalidTransition<InterventionStatus>> {
        INTERVENTION.apply(self, InterventionStatus::Answered)?;
        self.response = Some(response.into());
        Ok(())
    }

    /// Give up waiting. Only a pending request can time out.
    pub fn expire(&mut self) -> Result<(), InvalidTransition<InterventionStatus>> {
        INTERVENTION.apply(self, InterventionStatus::Timeout)?;
        Ok(())
    }
}

/// Inspect a message for a request that blocks on a human.
pub fn detect_intervention(msg: &Message) -> Option<InterventionDraft> {
    match msg {
        Message::ControlRequest(req) => match &req.request {
            ControlRequestType::CanUseTool { tool_name, input } => Some(InterventionDraft {
                kind: InterventionKind::Approval,
                prompt: format!("Allow tool {tool_name}?"),
                options: Some(vec!["allow".to_string(), "deny".to_string()]),
                context: input.to_string(),
                source_id: Some(req.request_id.clone()).filter(|s| !s.is_empty()),
            }),
            ControlRequestType::Unknown(_) => None,
        },
        Message::Assistant(assistant) => assistant.content.iter().find_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } if name == ASK_USER_TOOL => {
                Some(ask_user_draft(id, input))
            }
            _ => None,
        }),
        Message::ToolUse(tool) if tool.name == ASK_USER_TOOL => {
            Some(ask_user_draft(tool.id.as_deref().unwrap_or(""), &tool.input))
        }
        _ => None,
    }
}

fn ask_user_draft(tool_use_id: &str, input: &Value) -> InterventionDraft {
    let first = input
        .get("questions")
        .and_then(Value::as_array)
        .and_then(|qs| qs.first());
    let question = first.unwrap_or(input);

    let prompt = question
        .get("question")
        .and_then(Value::as_str)
        .unwrap_or("The agent is asking for input")
        .to_string();

    let options: Option<Vec<String>> = question
        .get("options")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(|o| {
                    o.as_str()
                        .or_else(|| o.get("label").and_then(Value::as_str))
                        .map(String::from)
                })
                .collect::<Vec<_>>()
        })
        .filter(|opts| !opts.is_empty());

    let context = question
        .get("header")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    InterventionDraft {
        kind: if options.is_some() {
            InterventionKind::Choice
        } else {
            InterventionKind::Question
        },
        prompt,
        options,
        context,
        source_id: Some(tool_use_id.to_string()).filter(|s| !s.is_empty()),
    }
}
