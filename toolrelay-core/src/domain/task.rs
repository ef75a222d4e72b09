use super::types::{ChatMessage, MessageRole, ToolCall, ToolDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub turns_used: usize,
    #[serde(default)]
    pub max_turns: usize,
}

impl ConversationState {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            turns_used: 0,
            max_turns,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn budget_exhausted(&self) -> bool {
        self.turns_used >= self.max_turns
    }

    pub fn tool_messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages
            .iter()
            .filter(|message| message.role == MessageRole::Tool)
    }

    /// Checks that every tool message answers an earlier call and that every
    /// assistant call batch is answered, in order, before the next assistant turn.
    pub fn tool_pairing_is_consistent(&self) -> bool {
        let mut outstanding: Vec<&str> = Vec::new();
        let mut issued: HashSet<&str> = HashSet::new();

        for message in &self.messages {
            match message.role {
                MessageRole::Assistant => {
                    if !outstanding.is_empty() {
                        return false;
                    }
                    for call in &message.tool_calls {
                        issued.insert(call.id.as_str());
                        outstanding.push(call.id.as_str());
                    }
                }
                MessageRole::Tool => {
                    let Some(id) = message.tool_call_id.as_deref() else {
                        return false;
                    };
                    if !issued.contains(id) || outstanding.first() != Some(&id) {
                        return false;
                    }
                    outstanding.remove(0);
                }
                MessageRole::System | MessageRole::User => {
                    if !outstanding.is_empty() {
                        return false;
                    }
                }
            }
        }

        outstanding.is_empty()
    }
}

/// A unit of work flowing through the pipeline steps.
///
/// Records are written once per output file; the `id` is the resume key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub conversation: ConversationState,
    #[serde(default)]
    pub final_response: String,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: description.into(),
            goal: String::new(),
            tools: Vec::new(),
            tool_calls: Vec::new(),
            conversation: ConversationState::default(),
            final_response: String::new(),
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDescriptor>) -> Self {
        self.tools = tools;
        self
    }

    /// Prompt handed to the model as the opening user message.
    pub fn prompt(&self) -> String {
        let mut prompt = self.description.trim().to_string();
        let goal = self.goal.trim();
        if !goal.is_empty() {
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str("Goal: ");
            prompt.push_str(goal);
        }
        prompt
    }
}
