use super::*;
use crate::application::tooling::{RegistryError, ToolInvoker, ToolOutput};
use crate::domain::{ChatMessage, MessageRole, Task, ToolCall, ToolDescriptor};
use crate::infrastructure::model::{ModelError, ModelProvider, ModelRequest, ModelResponse};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
enum Scripted {
    Text(&'static str),
    Calls(Vec<ToolCall>),
    Fail,
}

#[derive(Clone)]
struct ScriptedProvider {
    responses: Arc<Mutex<Vec<Scripted>>>,
    recordings: Arc<Mutex<Vec<ModelRequest>>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<Scripted>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            recordings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn requests(&self) -> Vec<ModelRequest> {
        self.recordings.lock().await.clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn chat(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        self.recordings.lock().await.push(request);
        let mut responses = self.responses.lock().await;
        let next = if responses.is_empty() {
            Scripted::Text("")
        } else {
            responses.remove(0)
        };
        match next {
            Scripted::Text(text) => Ok(ModelResponse::new(text)),
            Scripted::Calls(calls) => Ok(ModelResponse::with_tool_calls(None, calls)),
            Scripted::Fail => Err(ModelError::invalid_response("scripted", "boom")),
        }
    }
}

#[derive(Default)]
struct StubTools {
    invoked: Mutex<Vec<String>>,
    notes: Vec<String>,
}

#[async_trait]
impl ToolInvoker for StubTools {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput, RegistryError> {
        self.invoked.lock().await.push(name.to_string());
        match name {
            "echo" => Ok(ToolOutput::text(
                arguments["text"].as_str().unwrap_or_default(),
            )),
            "add" => {
                let sum = arguments["a"].as_i64().unwrap_or(0) + arguments["b"].as_i64().unwrap_or(0);
                Ok(ToolOutput::text(sum.to_string()))
            }
            "broken" => Err(RegistryError::ProviderUnavailable {
                tool: name.to_string(),
                endpoint: "servers/broken.py".to_string(),
                reason: "provider terminated unexpectedly".to_string(),
            }),
            other => Err(RegistryError::UnknownTool {
                name: other.to_string(),
            }),
        }
    }

    async fn descriptors(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor::new("echo", "Echo the text argument"),
            ToolDescriptor::new("add", "Add a and b"),
        ]
    }

    async fn instructions(&self) -> Vec<String> {
        self.notes.clone()
    }
}

fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall::new(id, name, arguments)
}

fn driver(provider: ScriptedProvider, max_turns: usize) -> ConversationDriver<ScriptedProvider> {
    ConversationDriver::new(provider, DriverOptions::new("gpt-test").with_max_turns(max_turns))
}

#[tokio::test]
async fn echo_and_add_scenario_completes() {
    let provider = ScriptedProvider::new(vec![
        Scripted::Calls(vec![call("c1", "echo", json!({"text": "hi"}))]),
        Scripted::Calls(vec![call("c2", "add", json!({"a": 2, "b": 3}))]),
        Scripted::Text("Echoed hi; sum is 5."),
    ]);
    let tools = StubTools::default();
    let task = Task::new("t-1", "Echo hi then add 2 and 3");

    let outcome = driver(provider.clone(), 10).run(&task, &tools).await;

    assert_eq!(outcome.status, TerminalState::Completed);
    assert_eq!(outcome.final_response, "Echoed hi; sum is 5.");
    assert_eq!(outcome.conversation.turns_used, 3);
    assert_eq!(outcome.tool_calls.len(), 2);
    assert!(outcome.conversation.tool_pairing_is_consistent());

    let results: Vec<&str> = outcome
        .conversation
        .tool_messages()
        .map(|message| message.text())
        .collect();
    assert_eq!(results, vec!["hi", "5"]);

    let requests = provider.requests().await;
    assert_eq!(requests[0].tools.len(), 2);
    assert_eq!(requests[0].model, "gpt-test");
    assert_eq!(requests[0].messages[0].role, MessageRole::User);
}

#[tokio::test]
async fn tool_results_follow_issue_order() {
    let provider = ScriptedProvider::new(vec![
        Scripted::Calls(vec![
            call("a", "add", json!({"a": 1, "b": 1})),
            call("b", "echo", json!({"text": "second"})),
            call("c", "add", json!({"a": 10, "b": 5})),
        ]),
        Scripted::Text("done"),
    ]);
    let tools = StubTools::default();

    let outcome = driver(provider, 5).run(&Task::new("t", "batch"), &tools).await;

    let ids: Vec<&str> = outcome
        .conversation
        .tool_messages()
        .filter_map(|message| message.tool_call_id.as_deref())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(*tools.invoked.lock().await, vec!["add", "echo", "add"]);
    assert!(outcome.conversation.tool_pairing_is_consistent());
}

#[tokio::test]
async fn provider_errors_become_tool_text() {
    let provider = ScriptedProvider::new(vec![
        Scripted::Calls(vec![
            call("x", "broken", json!({})),
            call("y", "missing", json!({})),
        ]),
        Scripted::Text("Could not finish; tools were unavailable."),
    ]);
    let tools = StubTools::default();

    let outcome = driver(provider, 5).run(&Task::new("t", "try"), &tools).await;

    assert_eq!(outcome.status, TerminalState::Completed);
    let results: Vec<&str> = outcome
        .conversation
        .tool_messages()
        .map(|message| message.text())
        .collect();
    assert!(results[0].starts_with("Error: provider"));
    assert!(results[1].starts_with("Error: no connected provider exposes tool 'missing'"));
}

#[tokio::test]
async fn budget_exhaustion_ends_in_error() {
    let looping: Vec<Scripted> = (0..10)
        .map(|n| Scripted::Calls(vec![call(&format!("c{n}"), "echo", json!({"text": "again"}))]))
        .collect();
    let provider = ScriptedProvider::new(looping);
    let tools = StubTools::default();

    let outcome = driver(provider.clone(), 3).run(&Task::new("t", "loop"), &tools).await;

    assert_eq!(outcome.status, TerminalState::Error);
    assert_eq!(
        outcome.failure,
        Some(FailureReason::BudgetExceeded { max_turns: 3 })
    );
    assert_eq!(outcome.conversation.turns_used, 3);
    assert_eq!(provider.requests().await.len(), 3);
    assert!(outcome.conversation.tool_pairing_is_consistent());
}

#[tokio::test]
async fn empty_replies_consume_turns() {
    let provider = ScriptedProvider::new(vec![
        Scripted::Text(""),
        Scripted::Text("   "),
        Scripted::Text("finally"),
    ]);
    let tools = StubTools::default();

    let outcome = driver(provider, 5).run(&Task::new("t", "quiet"), &tools).await;
    assert_eq!(outcome.status, TerminalState::Completed);
    assert_eq!(outcome.final_response, "finally");
    assert_eq!(outcome.conversation.turns_used, 3);

    let silent = ScriptedProvider::new(Vec::new());
    let outcome = driver(silent, 2).run(&Task::new("t", "quiet"), &tools).await;
    assert_eq!(outcome.status, TerminalState::Error);
}

#[tokio::test]
async fn clarification_is_its_own_terminal_state() {
    let provider = ScriptedProvider::new(vec![Scripted::Text(
        "NEEDS_CLARIFICATION: Which account should be charged?",
    )]);
    let tools = StubTools::default();

    let outcome = driver(provider, 5).run(&Task::new("t", "charge it"), &tools).await;

    assert_eq!(outcome.status, TerminalState::NeedsClarification);
    assert_eq!(outcome.final_response, "Which account should be charged?");
    assert!(outcome.failure.is_none());
}

#[tokio::test]
async fn model_failure_is_reported() {
    let provider = ScriptedProvider::new(vec![Scripted::Fail]);
    let tools = StubTools::default();

    let outcome = driver(provider, 5).run(&Task::new("t", "x"), &tools).await;

    assert_eq!(outcome.status, TerminalState::Error);
    assert!(matches!(outcome.failure, Some(FailureReason::Model { .. })));
}

#[tokio::test]
async fn missing_call_ids_are_synthesized() {
    let provider = ScriptedProvider::new(vec![
        Scripted::Calls(vec![
            call("", "echo", json!({"text": "a"})),
            call("", "echo", json!({"text": "b"})),
        ]),
        Scripted::Text("ok"),
    ]);
    let tools = StubTools::default();

    let outcome = driver(provider, 5).run(&Task::new("t", "ids"), &tools).await;

    let ids: Vec<&str> = outcome.tool_calls.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["call_1", "call_2"]);
    assert!(outcome.conversation.tool_pairing_is_consistent());
}

#[tokio::test]
async fn synthesized_ids_skip_ids_the_model_supplied() {
    let provider = ScriptedProvider::new(vec![
        Scripted::Calls(vec![
            call("", "echo", json!({"text": "a"})),
            call("call_1", "add", json!({"a": 1, "b": 2})),
        ]),
        Scripted::Calls(vec![call("", "echo", json!({"text": "b"}))]),
        Scripted::Text("ok"),
    ]);
    let tools = StubTools::default();

    let outcome = driver(provider, 5).run(&Task::new("t", "ids"), &tools).await;

    let ids: Vec<&str> = outcome.tool_calls.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["call_2", "call_1", "call_3"]);
    let results: Vec<&str> = outcome
        .conversation
        .messages
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(results, vec!["call_2", "call_1", "call_3"]);
    assert!(outcome.conversation.tool_pairing_is_consistent());
}

#[tokio::test]
async fn provider_instructions_follow_the_system_prompt() {
    let provider = ScriptedProvider::new(vec![Scripted::Text("ok")]);
    let tools = StubTools {
        notes: vec!["Prefer short arguments.".to_string()],
        ..StubTools::default()
    };

    let driver = ConversationDriver::new(
        provider.clone(),
        DriverOptions::new("gpt-test").with_system_prompt("You are terse."),
    );
    driver.run(&Task::new("t", "notes"), &tools).await;

    let requests = provider.requests().await;
    assert_eq!(
        requests[0].messages[0],
        ChatMessage::system("You are terse.\n\nPrefer short arguments.")
    );
}

#[tokio::test]
async fn provider_instructions_alone_form_the_system_message() {
    let provider = ScriptedProvider::new(vec![Scripted::Text("ok")]);
    let tools = StubTools {
        notes: vec!["Use metric units.".to_string()],
        ..StubTools::default()
    };

    driver(provider.clone(), 3).run(&Task::new("t", "notes"), &tools).await;

    let requests = provider.requests().await;
    assert_eq!(requests[0].messages[0], ChatMessage::system("Use metric units."));
    assert_eq!(requests[0].messages[1].role, MessageRole::User);
}

#[tokio::test]
async fn task_tools_restrict_the_offer_and_task_is_untouched() {
    let provider = ScriptedProvider::new(vec![Scripted::Text("ok")]);
    let tools = StubTools::default();
    let task = Task::new("t-9", "only echo")
        .with_goal("say hi")
        .with_tools(vec![ToolDescriptor::new("echo", "Echo")]);
    let before = task.clone();

    let driver = ConversationDriver::new(
        provider.clone(),
        DriverOptions::new("gpt-test").with_system_prompt("You are terse."),
    );
    let outcome = driver.run(&task, &tools).await;

    assert_eq!(task, before);
    let requests = provider.requests().await;
    assert_eq!(requests[0].tools.len(), 1);
    assert_eq!(requests[0].messages[0], ChatMessage::system("You are terse."));
    assert!(requests[0].messages[1].text().contains("Goal: say hi"));

    let merged = task.apply_outcome(&outcome);
    assert_eq!(merged.final_response, "ok");
    assert_eq!(merged.conversation.turns_used, 1);
    assert_eq!(merged.id, "t-9");
}
