use crate::constants::{DEFAULT_CLARIFICATION_MARKER, DEFAULT_MAX_TURNS};
use crate::domain::{ConversationState, Task, ToolCall};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Completed,
    NeedsClarification,
    Error,
}

impl TerminalState {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalState::Completed => "completed",
            TerminalState::NeedsClarification => "needs_clarification",
            TerminalState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    BudgetExceeded { max_turns: usize },
    Model { message: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::BudgetExceeded { max_turns } => {
                write!(f, "turn budget of {max_turns} exhausted without a final answer")
            }
            FailureReason::Model { message } => write!(f, "model backend failed: {message}"),
        }
    }
}

/// Result of one conversation. The input task is never touched; callers
/// merge with [`Task::apply_outcome`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationOutcome {
    pub status: TerminalState,
    pub final_response: String,
    pub tool_calls: Vec<ToolCall>,
    pub conversation: ConversationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub model: String,
    pub max_turns: usize,
    pub system_prompt: Option<String>,
    pub clarification_marker: String,
}

impl DriverOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_turns: DEFAULT_MAX_TURNS,
            system_prompt: None,
            clarification_marker: DEFAULT_CLARIFICATION_MARKER.to_string(),
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

impl From<&crate::config::AppConfig> for DriverOptions {
    fn from(config: &crate::config::AppConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_turns: config.max_turns,
            system_prompt: config.system_prompt.clone(),
            clarification_marker: config.clarification_marker.clone(),
        }
    }
}

impl Task {
    /// Returns a copy of the task carrying the outcome's conversation.
    pub fn apply_outcome(&self, outcome: &ConversationOutcome) -> Task {
        let mut merged = self.clone();
        merged.tool_calls = outcome.tool_calls.clone();
        merged.conversation = outcome.conversation.clone();
        merged.final_response = outcome.final_response.clone();
        merged
    }
}
