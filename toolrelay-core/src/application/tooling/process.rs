use super::error::ToolInvokeError;
use super::interface::ProviderTransport;
use crate::config::{Launch, ResolvedEndpoint};
use crate::constants::PROTOCOL_VERSION;
use crate::domain::ToolDescriptor;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, info, warn};

const GRACEFUL_EXIT: Duration = Duration::from_secs(2);

/// Tool provider reached over a child process speaking line-delimited JSON-RPC.
pub struct StdioTransport {
    inner: Arc<StdioInner>,
}

struct StdioInner {
    label: String,
    program: PathBuf,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    env: HashMap<String, String>,
    child: AsyncMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<Result<Value, ToolInvokeError>>>>,
    id_counter: AtomicU64,
    alive: AtomicBool,
    instructions: AsyncMutex<Option<String>>,
    tool_cache: AsyncMutex<Vec<ToolDescriptor>>,
    tool_revision: AtomicU64,
}

/// Kills the child if `start` is abandoned before the handshake finishes,
/// e.g. when a caller's timeout drops the future.
struct StartGuard {
    inner: Option<Arc<StdioInner>>,
}

impl StartGuard {
    fn disarm(mut self) {
        self.inner = None;
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        inner.alive.store(false, Ordering::SeqCst);
        let killed = match inner.child.try_lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(child) => child.start_kill().is_ok(),
                None => true,
            },
            Err(_) => false,
        };
        debug!(server = %inner.label, killed, "provider start abandoned");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { inner.reset().await });
        }
    }
}

impl StdioTransport {
    /// Spawns the provider and completes the `initialize` handshake.
    pub async fn spawn(endpoint: &ResolvedEndpoint) -> Result<Self, ToolInvokeError> {
        let Launch::Process {
            program,
            args,
            workdir,
        } = &endpoint.launch
        else {
            return Err(ToolInvokeError::Transport {
                server: endpoint.label.clone(),
                message: "endpoint does not describe a process".to_string(),
            });
        };

        let inner = Arc::new(StdioInner {
            label: endpoint.label.clone(),
            program: program.clone(),
            args: args.clone(),
            workdir: workdir.clone(),
            env: endpoint.env.clone(),
            child: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            pending: AsyncMutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
            alive: AtomicBool::new(false),
            instructions: AsyncMutex::new(None),
            tool_cache: AsyncMutex::new(Vec::new()),
            tool_revision: AtomicU64::new(0),
        });
        inner.start().await?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl ProviderTransport for StdioTransport {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolInvokeError> {
        self.inner.ensure_alive()?;
        Ok(self.inner.tool_cache.lock().await.clone())
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolInvokeError> {
        self.inner.ensure_alive()?;
        self.inner.call_tool(tool, arguments).await
    }

    async fn instructions(&self) -> Option<String> {
        self.inner.instructions.lock().await.clone()
    }

    fn tool_revision(&self) -> u64 {
        self.inner.tool_revision.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), ToolInvokeError> {
        self.inner.shutdown().await
    }
}

impl StdioInner {
    async fn start(self: &Arc<Self>) -> Result<(), ToolInvokeError> {
        let mut command = Command::new(&self.program);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }
        if !self.args.is_empty() {
            command.args(&self.args);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ToolInvokeError::Spawn {
            server: self.label.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.transport_error("failed to capture provider stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.transport_error("failed to capture provider stdout"))?;
        let stderr = child.stderr.take();

        *self.writer.lock().await = Some(BufWriter::new(stdin));
        *self.child.lock().await = Some(child);
        self.alive.store(true, Ordering::SeqCst);
        let guard = StartGuard {
            inner: Some(Arc::clone(self)),
        };

        let reader_self = Arc::clone(self);
        tokio::spawn(async move {
            reader_self.reader_loop(stdout).await;
        });
        if let Some(stderr) = stderr {
            let label = self.label.clone();
            tokio::spawn(forward_stderr(label, stderr));
        }

        let outcome = self.initialize_sequence().await;
        guard.disarm();
        match outcome {
            Ok(()) => {
                let pid = self.pid().await;
                info!(server = %self.label, pid = ?pid, "Provider process ready");
                Ok(())
            }
            Err(err) => {
                self.reset().await;
                Err(err)
            }
        }
    }

    async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    async fn initialize_sequence(&self) -> Result<(), ToolInvokeError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        let init_result = self.send_request("initialize", params).await?;
        if let Some(text) = init_result.get("instructions").and_then(Value::as_str) {
            *self.instructions.lock().await = Some(text.to_string());
        }
        self.send_notification("notifications/initialized", json!({}))
            .await?;

        self.refresh_tools().await
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolInvokeError> {
        let params = json!({
            "name": tool,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });
        self.send_request("tools/call", params).await
    }

    async fn refresh_tools(&self) -> Result<(), ToolInvokeError> {
        let result = self.send_request("tools/list", json!({})).await?;
        self.populate_tool_cache(result).await;
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(raw)) = lines.next_line().await {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('\u{1b}') {
                debug!(
                    server = %self.label,
                    line = trimmed,
                    "skipping non-JSON ANSI log line from provider"
                );
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => {
                    // Notifications may issue new requests; handle them off the
                    // reader so their responses can still be read.
                    if value.get("id").is_none() && value.get("method").is_some() {
                        let handler = Arc::clone(&self);
                        tokio::spawn(async move { handler.handle_notification(value).await });
                        continue;
                    }
                    if let Err(err) = self.process_inbound_message(value).await {
                        warn!(
                            server = %self.label,
                            %err,
                            "failed to process message from provider"
                        );
                    }
                }
                Err(source) => {
                    warn!(
                        server = %self.label,
                        line = trimmed,
                        %source,
                        "received invalid JSON from provider"
                    );
                }
            }
        }

        if self.alive.swap(false, Ordering::SeqCst) {
            warn!(server = %self.label, "provider stdout closed");
        }
        self.reset().await;
    }

    async fn process_inbound_message(&self, value: Value) -> Result<(), ToolInvokeError> {
        match value.get("id").cloned() {
            Some(id) if value.get("method").is_some() => self.handle_server_request(id, value).await,
            Some(id) => {
                self.handle_response(id, value).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn handle_response(&self, id: Value, value: Value) {
        let Some(key) = response_key(&id) else {
            return;
        };

        let responder = self.pending.lock().await.remove(&key);
        let Some(sender) = responder else {
            debug!(
                server = %self.label,
                response_id = key,
                "received response for unknown request"
            );
            return;
        };

        let outcome = match value.get("error") {
            Some(error) => match error.as_object() {
                Some(err) => Err(ToolInvokeError::Rpc {
                    server: self.label.clone(),
                    code: err.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                    message: err
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                }),
                None => Err(self.transport_error("missing error payload in response")),
            },
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = sender.send(outcome);
    }

    async fn handle_server_request(&self, id: Value, value: Value) -> Result<(), ToolInvokeError> {
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match method {
            "ping" => self.send_response(id, json!({})).await,
            other => {
                warn!(
                    server = %self.label,
                    method = other,
                    "provider sent unsupported request"
                );
                let error = json!({
                    "code": -32601,
                    "message": format!("client does not implement method '{other}'"),
                });
                self.send_error(id, error).await
            }
        }
    }

    async fn handle_notification(&self, value: Value) {
        let Some(method) = value.get("method").and_then(Value::as_str) else {
            return;
        };
        debug!(server = %self.label, method, "received notification from provider");
        if method == "notifications/tools/list_changed" {
            if let Err(err) = self.refresh_tools().await {
                warn!(
                    server = %self.label,
                    %err,
                    "failed to refresh tool catalogue"
                );
            }
        }
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, ToolInvokeError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        if let Err(err) = self.write_message(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ToolInvokeError::Cancelled {
                server: self.label.clone(),
            }),
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), ToolInvokeError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        self.write_message(&payload).await
    }

    async fn send_response(&self, id: Value, result: Value) -> Result<(), ToolInvokeError> {
        let payload = json!({ "jsonrpc": "2.0", "id": id, "result": result });
        self.write_message(&payload).await
    }

    async fn send_error(&self, id: Value, error: Value) -> Result<(), ToolInvokeError> {
        let payload = json!({ "jsonrpc": "2.0", "id": id, "error": error });
        self.write_message(&payload).await
    }

    async fn write_message(&self, message: &Value) -> Result<(), ToolInvokeError> {
        let mut encoded =
            serde_json::to_string(message).map_err(|source| ToolInvokeError::InvalidJson {
                server: self.label.clone(),
                source,
            })?;
        encoded.push('\n');

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| ToolInvokeError::Terminated {
                server: self.label.clone(),
            })?;
        let io_error = |source: std::io::Error| ToolInvokeError::Transport {
            server: self.label.clone(),
            message: source.to_string(),
        };
        stream.write_all(encoded.as_bytes()).await.map_err(io_error)?;
        stream.flush().await.map_err(io_error)?;
        Ok(())
    }

    /// Closes stdin, waits briefly for a clean exit, then kills.
    async fn shutdown(&self) -> Result<(), ToolInvokeError> {
        self.alive.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();

        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match tokio::time::timeout(GRACEFUL_EXIT, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(server = %self.label, %status, "provider exited after stdin closed");
                }
                Ok(Err(source)) => {
                    guard.take();
                    return Err(ToolInvokeError::Transport {
                        server: self.label.clone(),
                        message: source.to_string(),
                    });
                }
                Err(_) => {
                    debug!(server = %self.label, "provider ignored stdin close; killing");
                    child.kill().await.map_err(|source| ToolInvokeError::Transport {
                        server: self.label.clone(),
                        message: source.to_string(),
                    })?;
                }
            }
        }
        guard.take();
        drop(guard);

        self.fail_all_pending().await;
        Ok(())
    }

    async fn reset(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();

        let mut guard = self.child.lock().await;
        if let Some(mut running) = guard.take() {
            if let Err(err) = running.kill().await {
                debug!(
                    server = %self.label,
                    %err,
                    "failed to kill provider process (may have already exited)"
                );
            }
        }
        drop(guard);

        self.fail_all_pending().await;
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(ToolInvokeError::Terminated {
                server: self.label.clone(),
            }));
        }
    }

    async fn populate_tool_cache(&self, result: Value) {
        let Some(array) = result.get("tools").and_then(Value::as_array) else {
            return;
        };
        let tools: Vec<ToolDescriptor> = array
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name").and_then(Value::as_str)?;
                let description = tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let mut descriptor = ToolDescriptor::new(name, description);
                if let Some(schema) = tool.get("inputSchema").cloned() {
                    descriptor = descriptor.with_schema(schema);
                }
                Some(descriptor)
            })
            .collect();
        *self.tool_cache.lock().await = tools;
        self.tool_revision.fetch_add(1, Ordering::SeqCst);
    }

    fn ensure_alive(&self) -> Result<(), ToolInvokeError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ToolInvokeError::Terminated {
                server: self.label.clone(),
            })
        }
    }

    fn next_id(&self) -> String {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("req-{id}")
    }

    fn transport_error(&self, message: impl Into<String>) -> ToolInvokeError {
        ToolInvokeError::Transport {
            server: self.label.clone(),
            message: message.into(),
        }
    }
}

fn response_key(id: &Value) -> Option<String> {
    match id {
        Value::String(value) => Some(value.clone()),
        Value::Number(num) => Some(num.to_string()),
        _ => None,
    }
}

async fn forward_stderr(label: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %label, line, "provider stderr");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointKind;
    use std::time::Instant;

    fn process_endpoint(program: &str, args: Vec<String>) -> ResolvedEndpoint {
        ResolvedEndpoint {
            label: program.to_string(),
            kind: EndpointKind::LocalProcess,
            launch: Launch::Process {
                program: PathBuf::from(program),
                args,
                workdir: None,
            },
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn url_endpoints_are_rejected() {
        let endpoint = ResolvedEndpoint {
            label: "http://localhost".into(),
            kind: EndpointKind::Networked,
            launch: Launch::Url("http://localhost".into()),
            env: HashMap::new(),
        };
        assert!(matches!(
            StdioTransport::spawn(&endpoint).await,
            Err(ToolInvokeError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_error() {
        let endpoint = process_endpoint("/definitely/not/a/provider", Vec::new());
        assert!(matches!(
            StdioTransport::spawn(&endpoint).await,
            Err(ToolInvokeError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn provider_exiting_during_handshake_is_terminated() {
        let endpoint = process_endpoint("sh", vec!["-c".into(), "exit 0".into()]);
        let err = match StdioTransport::spawn(&endpoint).await {
            Err(err) => err,
            Ok(_) => panic!("handshake should fail"),
        };
        assert!(err.is_channel_failure());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abandoned_handshake_kills_the_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("provider.pid");
        let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());
        let endpoint = process_endpoint("sh", vec!["-c".into(), script]);

        let attempt =
            tokio::time::timeout(Duration::from_millis(500), StdioTransport::spawn(&endpoint))
                .await;
        assert!(attempt.is_err(), "silent provider cannot finish the handshake");

        let pid = std::fs::read_to_string(&pid_file).expect("provider wrote its pid");
        let status = PathBuf::from(format!("/proc/{}/status", pid.trim()));
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let running = std::fs::read_to_string(&status)
                .map(|content| !content.contains("State:\tZ"))
                .unwrap_or(false);
            if !running {
                break;
            }
            assert!(Instant::now() < deadline, "provider still running");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
