use super::error::PipelineError;
use super::store::TaskStore;
use crate::application::agent::{ConversationDriver, TerminalState};
use crate::application::bridge::BlockingToolClient;
use crate::application::jobs::JobContext;
use crate::infrastructure::model::ModelProvider;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClarificationRequest {
    pub task_id: String,
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub processed: usize,
    pub skipped: usize,
    pub completed: usize,
    pub clarification_requested: Vec<ClarificationRequest>,
    pub failed: Vec<TaskFailure>,
    pub cancelled: bool,
}

/// Runs every task not yet present in the output file through the
/// conversation driver and appends the completed ones.
pub struct VerificationStep<P: ModelProvider> {
    client: BlockingToolClient,
    driver: Arc<ConversationDriver<P>>,
}

impl<P: ModelProvider + 'static> VerificationStep<P> {
    pub fn new(client: BlockingToolClient, driver: Arc<ConversationDriver<P>>) -> Self {
        Self { client, driver }
    }

    pub fn run(
        &self,
        input: &TaskStore,
        output: &TaskStore,
        job: Option<&JobContext>,
    ) -> Result<StepReport, PipelineError> {
        let tasks = input.load()?;
        let mut done = output.existing_ids()?;
        let total = tasks.len();
        let mut report = StepReport::default();
        info!(
            input = %input.path().display(),
            output = %output.path().display(),
            total,
            already_done = done.len(),
            "verification step started"
        );

        for (index, task) in tasks.into_iter().enumerate() {
            if job.is_some_and(JobContext::is_cancelled) {
                warn!("verification step cancelled");
                report.cancelled = true;
                break;
            }

            let counter = format!("[{}/{}]", index + 1, total);
            if done.contains(&task.id) {
                report.skipped += 1;
                emit(job, format!("{counter} {} already verified", task.id));
                continue;
            }

            let outcome = self
                .client
                .run_conversation(Arc::clone(&self.driver), task.clone())?;
            report.processed += 1;

            match outcome.status {
                TerminalState::Completed => {
                    output.append(&task.apply_outcome(&outcome))?;
                    done.insert(task.id.clone());
                    report.completed += 1;
                }
                TerminalState::NeedsClarification => {
                    report.clarification_requested.push(ClarificationRequest {
                        task_id: task.id.clone(),
                        question: outcome.final_response.clone(),
                    });
                }
                TerminalState::Error => {
                    report.failed.push(TaskFailure {
                        task_id: task.id.clone(),
                        reason: outcome
                            .failure
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "unknown failure".to_string()),
                    });
                }
            }
            emit(
                job,
                format!("{counter} {}: {}", task.id, outcome.status.as_str()),
            );
        }

        info!(
            processed = report.processed,
            skipped = report.skipped,
            completed = report.completed,
            clarifications = report.clarification_requested.len(),
            failed = report.failed.len(),
            "verification step finished"
        );
        Ok(report)
    }
}

fn emit(job: Option<&JobContext>, line: String) {
    info!("{line}");
    if let Some(job) = job {
        job.log(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::agent::DriverOptions;
    use crate::application::bridge::AsyncBridge;
    use crate::application::tooling::{
        ConnectionRegistry, ProviderConnector, ProviderTransport, ToolInvokeError,
    };
    use crate::config::ResolvedEndpoint;
    use crate::domain::{MessageRole, Task};
    use crate::infrastructure::model::{ModelError, ModelRequest, ModelResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    struct NoProviders;

    #[async_trait]
    impl ProviderConnector for NoProviders {
        async fn open(
            &self,
            endpoint: &ResolvedEndpoint,
        ) -> Result<Arc<dyn ProviderTransport>, ToolInvokeError> {
            Err(ToolInvokeError::Transport {
                server: endpoint.label.clone(),
                message: "no providers in this test".into(),
            })
        }
    }

    /// Answers from the task prompt: "vague" asks back, "broken" fails.
    #[derive(Default)]
    struct PromptEcho {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelProvider for PromptEcho {
        async fn chat(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let prompt = request
                .messages
                .iter()
                .find(|message| message.role == MessageRole::User)
                .map(|message| message.text().to_string())
                .unwrap_or_default();
            if prompt.contains("vague") {
                Ok(ModelResponse::new("NEEDS_CLARIFICATION which files?"))
            } else if prompt.contains("broken") {
                Err(ModelError::invalid_response("echo", "no choices"))
            } else {
                Ok(ModelResponse::new(format!("verified: {prompt}")))
            }
        }
    }

    fn write_tasks(store: &TaskStore, tasks: &[Task]) {
        for task in tasks {
            store.append(task).unwrap();
        }
    }

    #[test]
    fn reruns_skip_completed_tasks() {
        let dir = tempdir().unwrap();
        let input = TaskStore::new(dir.path().join("tasks.jsonl"));
        let output = TaskStore::new(dir.path().join("verified.jsonl"));
        write_tasks(
            &input,
            &[
                Task::new("t1", "count lines"),
                Task::new("t2", "something vague"),
                Task::new("t3", "broken request"),
                Task::new("t4", "list files"),
            ],
        );

        let bridge = AsyncBridge::start().unwrap();
        let registry = Arc::new(ConnectionRegistry::new(dir.path(), Arc::new(NoProviders)));
        let client = BlockingToolClient::new(bridge.handle(), registry);
        let provider = Arc::new(PromptEcho::default());
        let driver = Arc::new(ConversationDriver::new(
            Arc::clone(&provider),
            DriverOptions::new("test-model").with_max_turns(3),
        ));
        let step = VerificationStep::new(client, driver);

        let first = step.run(&input, &output, None).unwrap();
        assert_eq!(first.processed, 4);
        assert_eq!(first.completed, 2);
        assert_eq!(first.clarification_requested[0].task_id, "t2");
        assert_eq!(first.clarification_requested[0].question, "which files?");
        assert_eq!(first.failed[0].task_id, "t3");

        let written = output.load().unwrap();
        let ids: Vec<&str> = written.iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t4"]);
        assert_eq!(written[0].final_response, "verified: count lines");
        assert_eq!(written[0].conversation.turns_used, 1);

        let calls_after_first = provider.calls.load(Ordering::SeqCst);
        let second = step.run(&input, &output, None).unwrap();
        assert_eq!(second.skipped, 2);
        assert_eq!(second.completed, 0);
        assert_eq!(second.processed, 2);
        assert_eq!(output.load().unwrap().len(), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls_after_first + 2);

        bridge.teardown(Duration::from_secs(5));
    }
}
