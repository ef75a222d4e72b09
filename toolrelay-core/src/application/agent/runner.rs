use super::directive::ReplyDirective;
use super::models::{ConversationOutcome, DriverOptions, FailureReason, TerminalState};
use crate::application::tooling::ToolInvoker;
use crate::domain::{ChatMessage, ConversationState, MessageRole, Task, ToolCall};
use crate::infrastructure::model::{ModelProvider, ModelRequest};
use tracing::{debug, info, warn};

/// Alternates model turns with tool invocations until a terminal state.
pub struct ConversationDriver<P: ModelProvider> {
    provider: P,
    options: DriverOptions,
}

impl<P: ModelProvider> ConversationDriver<P> {
    pub fn new(provider: P, options: DriverOptions) -> Self {
        Self { provider, options }
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub async fn run(&self, task: &Task, tools: &dyn ToolInvoker) -> ConversationOutcome {
        self.run_with(task, tools, &self.options).await
    }

    pub async fn run_with(
        &self,
        task: &Task,
        tools: &dyn ToolInvoker,
        options: &DriverOptions,
    ) -> ConversationOutcome {
        info!(task = task.id.as_str(), max_turns = options.max_turns, "Conversation started");

        let offered = if task.tools.is_empty() {
            tools.descriptors().await
        } else {
            task.tools.clone()
        };

        let mut conversation = ConversationState::new(options.max_turns);
        let system: Vec<String> = options
            .system_prompt
            .iter()
            .cloned()
            .chain(tools.instructions().await)
            .filter(|part| !part.trim().is_empty())
            .collect();
        if !system.is_empty() {
            conversation.push(ChatMessage::system(system.join("\n\n")));
        }
        conversation.push(ChatMessage::user(task.prompt()));

        let mut tool_calls: Vec<ToolCall> = Vec::new();

        loop {
            if conversation.budget_exhausted() {
                warn!(
                    task = task.id.as_str(),
                    turns = conversation.turns_used,
                    "Conversation exhausted its turn budget"
                );
                return finish(
                    TerminalState::Error,
                    String::new(),
                    tool_calls,
                    conversation,
                    Some(FailureReason::BudgetExceeded {
                        max_turns: options.max_turns,
                    }),
                );
            }

            let request = ModelRequest {
                model: options.model.clone(),
                messages: conversation.messages.clone(),
                tools: offered.clone(),
            };
            conversation.turns_used += 1;
            debug!(
                task = task.id.as_str(),
                turn = conversation.turns_used,
                "Submitting conversation turn to model provider"
            );

            let mut reply = match self.provider.chat(request).await {
                Ok(response) => response.message,
                Err(err) => {
                    warn!(task = task.id.as_str(), %err, "Model provider failed");
                    return finish(
                        TerminalState::Error,
                        String::new(),
                        tool_calls,
                        conversation,
                        Some(FailureReason::Model {
                            message: err.to_string(),
                        }),
                    );
                }
            };
            reply.role = MessageRole::Assistant;

            if reply.has_tool_calls() {
                let batch_ids: Vec<String> =
                    reply.tool_calls.iter().map(|call| call.id.clone()).collect();
                for call in reply.tool_calls.iter_mut() {
                    if call.id.trim().is_empty() {
                        call.id = synthesize_call_id(&tool_calls, &batch_ids);
                    }
                    tool_calls.push(call.clone());
                }
                let batch = reply.tool_calls.clone();
                conversation.push(reply);

                for call in batch {
                    info!(tool = call.name.as_str(), id = call.id.as_str(), "Invoking tool");
                    let content = match tools.invoke(&call.name, call.arguments.clone()).await {
                        Ok(output) => output.content,
                        Err(err) => {
                            warn!(tool = call.name.as_str(), %err, "Tool call failed");
                            format!("Error: {err}")
                        }
                    };
                    conversation.push(ChatMessage::tool_result(call.id, content));
                }
                continue;
            }

            let text = reply.text().to_string();
            conversation.push(reply);
            if text.is_empty() {
                debug!(task = task.id.as_str(), "Empty reply; requesting another turn");
                continue;
            }

            return match ReplyDirective::parse(&text, &options.clarification_marker) {
                ReplyDirective::Clarify { question } => {
                    info!(task = task.id.as_str(), "Model requested clarification");
                    finish(
                        TerminalState::NeedsClarification,
                        question,
                        tool_calls,
                        conversation,
                        None,
                    )
                }
                ReplyDirective::Final { response } => {
                    info!(
                        task = task.id.as_str(),
                        turns = conversation.turns_used,
                        "Conversation completed"
                    );
                    finish(TerminalState::Completed, response, tool_calls, conversation, None)
                }
            };
        }
    }
}

/// `call_<n>` for the next position, skipping ids the model already used.
fn synthesize_call_id(issued: &[ToolCall], batch: &[String]) -> String {
    let taken = |id: &str| issued.iter().any(|call| call.id == id) || batch.iter().any(|b| b == id);
    let mut n = issued.len() + 1;
    loop {
        let candidate = format!("call_{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn finish(
    status: TerminalState,
    final_response: String,
    tool_calls: Vec<ToolCall>,
    conversation: ConversationState,
    failure: Option<FailureReason>,
) -> ConversationOutcome {
    ConversationOutcome {
        status,
        final_response,
        tool_calls,
        conversation,
        failure,
    }
}
