use super::error::ToolInvokeError;
use super::interface::{ProviderConnector, ProviderTransport, ToolInvoker, ToolOutput};
use crate::config::{EndpointKind, EndpointSpec, ResolvedEndpoint};
use crate::domain::ToolDescriptor;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no connected provider exposes tool '{name}'")]
    UnknownTool { name: String },
    #[error("provider '{endpoint}' owning tool '{tool}' is unavailable: {reason}")]
    ProviderUnavailable {
        tool: String,
        endpoint: String,
        reason: String,
    },
    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },
    #[error("failed to connect to any provider: {}", format_failures(.failures))]
    ConnectFailed { failures: Vec<EndpointFailure> },
}

fn format_failures(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({})", failure.endpoint, failure.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointFailure {
    pub endpoint: String,
    pub error: String,
}

/// Connection state of one endpoint as reported in a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub endpoint: String,
    pub kind: EndpointKind,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub tool: ToolDescriptor,
    pub session: SessionId,
    pub endpoint: String,
}

/// Merged view of every endpoint and the tools currently routable.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolCatalog {
    pub endpoints: Vec<EndpointStatus>,
    pub tools: Vec<CatalogEntry>,
}

impl ToolCatalog {
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|entry| entry.tool.name.as_str()).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.endpoints.iter().filter(|status| status.connected).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub endpoint: String,
    pub kind: EndpointKind,
    pub args: Vec<String>,
    pub tools: Vec<String>,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Outcome of [`ConnectionRegistry::close_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CloseSummary {
    pub closed: usize,
    pub failures: Vec<EndpointFailure>,
}

pub struct ProviderSession {
    id: SessionId,
    spec: EndpointSpec,
    endpoint: ResolvedEndpoint,
    tools: Mutex<Vec<ToolDescriptor>>,
    tool_revision: AtomicU64,
    instructions: Option<String>,
    transport: Arc<dyn ProviderTransport>,
    valid: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl ProviderSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.endpoint.label
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn tools(&self) -> std::sync::MutexGuard<'_, Vec<ToolDescriptor>> {
        self.tools.lock().expect("session tools lock")
    }

    /// True when the transport announced a tool list newer than ours.
    fn tools_outdated(&self) -> bool {
        self.transport.tool_revision() != self.tool_revision.load(Ordering::SeqCst)
    }

    fn failure(&self) -> Option<String> {
        self.failure.lock().expect("session failure lock").clone()
    }

    /// Marks the session unusable. Returns false if it already was.
    fn invalidate(&self, reason: &str) -> bool {
        if !self.valid.swap(false, Ordering::SeqCst) {
            return false;
        }
        *self.failure.lock().expect("session failure lock") = Some(reason.to_string());
        true
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            endpoint: self.endpoint.label.clone(),
            kind: self.endpoint.kind,
            args: self.spec.args.clone(),
            tools: self.tools().iter().map(|tool| tool.name.clone()).collect(),
            valid: self.is_valid(),
            failure: self.failure(),
            instructions: self.instructions.clone(),
        }
    }

    fn status(&self) -> EndpointStatus {
        EndpointStatus {
            endpoint: self.endpoint.label.clone(),
            kind: self.endpoint.kind,
            connected: self.is_valid(),
            session: Some(self.id),
            tool_count: self.tools().len(),
            error: self.failure(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: Vec<Arc<ProviderSession>>,
    routes: HashMap<String, Arc<ProviderSession>>,
    failed: Vec<EndpointStatus>,
}

impl RegistryState {
    /// Later sessions overwrite earlier ones on name collisions.
    fn rebuild_routes(&mut self) {
        let mut routes: HashMap<String, Arc<ProviderSession>> = HashMap::new();
        for session in &self.sessions {
            for tool in session.tools().iter() {
                if let Some(previous) = routes.insert(tool.name.clone(), Arc::clone(session)) {
                    if previous.id != session.id {
                        warn!(
                            tool = %tool.name,
                            shadowed = %previous.label(),
                            owner = %session.label(),
                            "tool name collision; later connection wins"
                        );
                    }
                }
            }
        }
        self.routes = routes;
    }

    fn catalog(&self) -> ToolCatalog {
        let mut endpoints: Vec<EndpointStatus> =
            self.sessions.iter().map(|session| session.status()).collect();
        endpoints.extend(self.failed.iter().cloned());

        let mut tools: Vec<CatalogEntry> = self
            .routes
            .iter()
            .map(|(name, session)| {
                let tool = session
                    .tools()
                    .iter()
                    .find(|tool| &tool.name == name)
                    .cloned()
                    .unwrap_or_else(|| ToolDescriptor::new(name.clone(), ""));
                CatalogEntry {
                    tool,
                    session: session.id,
                    endpoint: session.endpoint.label.clone(),
                }
            })
            .collect();
        tools.sort_by(|a, b| a.tool.name.cmp(&b.tool.name));

        ToolCatalog { endpoints, tools }
    }
}

/// Owns every provider session and routes tool calls to their owners.
pub struct ConnectionRegistry {
    project_root: PathBuf,
    connector: Arc<dyn ProviderConnector>,
    call_timeout: Option<Duration>,
    state: RwLock<RegistryState>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(project_root: impl Into<PathBuf>, connector: Arc<dyn ProviderConnector>) -> Self {
        Self {
            project_root: project_root.into(),
            connector,
            call_timeout: None,
            state: RwLock::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    #[cfg(feature = "native-transport")]
    pub fn with_default_connector(project_root: impl Into<PathBuf>) -> Self {
        Self::new(project_root, Arc::new(super::connector::DefaultConnector))
    }

    /// Limits connect handshakes and every tool call.
    pub fn with_call_timeout(mut self, limit: Duration) -> Self {
        self.call_timeout = Some(limit);
        self
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Connects every endpoint, adding to the sessions already open.
    ///
    /// Endpoints that fail are reported in the catalog as disconnected. Only
    /// when every endpoint of a non-empty batch fails is an error returned.
    pub async fn connect(&self, specs: &[EndpointSpec]) -> Result<ToolCatalog, RegistryError> {
        let mut opened = Vec::new();
        let mut failures = Vec::new();

        for spec in specs {
            let endpoint = spec.resolve(&self.project_root);
            match self.open_session(spec, &endpoint).await {
                Ok(session) => {
                    info!(
                        server = %endpoint.label,
                        kind = %endpoint.kind,
                        session = %session.id,
                        tools = session.tools().len(),
                        "connected to provider"
                    );
                    opened.push(session);
                }
                Err(err) => {
                    warn!(server = %endpoint.label, %err, "failed to connect to provider");
                    failures.push(EndpointStatus {
                        endpoint: endpoint.label.clone(),
                        kind: endpoint.kind,
                        connected: false,
                        session: None,
                        tool_count: 0,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        if !specs.is_empty() && opened.is_empty() {
            return Err(RegistryError::ConnectFailed {
                failures: failures
                    .into_iter()
                    .map(|status| EndpointFailure {
                        endpoint: status.endpoint,
                        error: status.error.unwrap_or_default(),
                    })
                    .collect(),
            });
        }

        let (catalog, replaced) = {
            let mut state = self.state.write().expect("registry state lock");
            let reconnected: Vec<String> = opened
                .iter()
                .map(|session| session.endpoint.label.clone())
                .collect();
            state
                .failed
                .retain(|status| !reconnected.contains(&status.endpoint));
            for failure in failures {
                state.failed.retain(|status| status.endpoint != failure.endpoint);
                state.failed.push(failure);
            }

            // Reconnecting an identical spec replaces the older session.
            let mut replaced = Vec::new();
            for session in opened {
                let (stale, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.sessions)
                    .into_iter()
                    .partition(|existing| existing.spec == session.spec);
                state.sessions = kept;
                replaced.extend(stale);
                state.sessions.push(session);
            }
            state.rebuild_routes();
            (state.catalog(), replaced)
        };

        for stale in replaced {
            stale.valid.store(false, Ordering::SeqCst);
            info!(server = %stale.label(), session = %stale.id, "replacing provider session");
            if let Err(err) = stale.transport.close().await {
                warn!(server = %stale.label(), %err, "failed to close replaced provider");
            }
        }
        Ok(catalog)
    }

    async fn open_session(
        &self,
        spec: &EndpointSpec,
        endpoint: &ResolvedEndpoint,
    ) -> Result<Arc<ProviderSession>, ToolInvokeError> {
        let transport = self
            .bounded(&endpoint.label, self.connector.open(endpoint))
            .await?;
        let tool_revision = transport.tool_revision();
        let tools = match self.bounded(&endpoint.label, transport.list_tools()).await {
            Ok(tools) => tools,
            Err(err) => {
                if let Err(close_err) = transport.close().await {
                    debug!(server = %endpoint.label, err = %close_err, "close after failed listing");
                }
                return Err(err);
            }
        };

        Ok(Arc::new(ProviderSession {
            id: SessionId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            spec: spec.clone(),
            endpoint: endpoint.clone(),
            tools: Mutex::new(tools),
            tool_revision: AtomicU64::new(tool_revision),
            instructions: transport.instructions().await,
            transport,
            valid: AtomicBool::new(true),
            failure: Mutex::new(None),
        }))
    }

    async fn bounded<T, F>(&self, server: &str, future: F) -> Result<T, ToolInvokeError>
    where
        F: Future<Output = Result<T, ToolInvokeError>>,
    {
        match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, future)
                .await
                .map_err(|_| ToolInvokeError::TimedOut {
                    server: server.to_string(),
                    limit,
                })?,
            None => future.await,
        }
    }

    pub fn tool_owner(&self, name: &str) -> Option<SessionInfo> {
        let state = self.state.read().expect("registry state lock");
        state.routes.get(name).map(|session| session.info())
    }

    pub fn catalog(&self) -> ToolCatalog {
        self.state.read().expect("registry state lock").catalog()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let state = self.state.read().expect("registry state lock");
        state.sessions.iter().map(|session| session.info()).collect()
    }

    /// Usage notes announced by the live providers, in connection order.
    pub fn instructions(&self) -> Vec<String> {
        let state = self.state.read().expect("registry state lock");
        state
            .sessions
            .iter()
            .filter(|session| session.is_valid())
            .filter_map(|session| session.instructions.clone())
            .filter(|text| !text.trim().is_empty())
            .collect()
    }

    /// Re-reads the tool list of every session whose provider announced a
    /// change, then rebuilds the routing table. Returns how many sessions
    /// were refreshed.
    pub async fn refresh_tools(&self) -> usize {
        let outdated: Vec<Arc<ProviderSession>> = {
            let state = self.state.read().expect("registry state lock");
            state
                .sessions
                .iter()
                .filter(|session| session.is_valid() && session.tools_outdated())
                .cloned()
                .collect()
        };
        if outdated.is_empty() {
            return 0;
        }

        let mut refreshed = 0;
        for session in outdated {
            let revision = session.transport.tool_revision();
            match self
                .bounded(session.label(), session.transport.list_tools())
                .await
            {
                Ok(tools) => {
                    info!(
                        server = %session.label(),
                        tools = tools.len(),
                        "provider tool list changed"
                    );
                    *session.tools() = tools;
                    session.tool_revision.store(revision, Ordering::SeqCst);
                    refreshed += 1;
                }
                Err(err) => {
                    warn!(server = %session.label(), %err, "failed to refresh provider tools");
                }
            }
        }
        if refreshed > 0 {
            self.state
                .write()
                .expect("registry state lock")
                .rebuild_routes();
        }
        refreshed
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.catalog()
            .tools
            .into_iter()
            .map(|entry| entry.tool)
            .collect()
    }

    /// Routes one call to the session owning `name`.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput, RegistryError> {
        self.refresh_tools().await;
        let session = {
            let state = self.state.read().expect("registry state lock");
            state.routes.get(name).cloned()
        }
        .ok_or_else(|| RegistryError::UnknownTool {
            name: name.to_string(),
        })?;

        if !session.is_valid() {
            return Err(RegistryError::ProviderUnavailable {
                tool: name.to_string(),
                endpoint: session.endpoint.label.clone(),
                reason: session
                    .failure()
                    .unwrap_or_else(|| "session closed".to_string()),
            });
        }

        debug!(tool = name, server = %session.label(), "invoking tool");
        let result = self
            .bounded(session.label(), session.transport.call_tool(name, arguments))
            .await;

        match result {
            Ok(raw) => {
                let output = ToolOutput::from_result(raw);
                if output.is_error {
                    Err(RegistryError::ToolFailed {
                        tool: name.to_string(),
                        message: output.content,
                    })
                } else {
                    Ok(output)
                }
            }
            Err(err) if err.is_channel_failure() => {
                let reason = err.to_string();
                self.invalidate(&session, &reason).await;
                Err(RegistryError::ProviderUnavailable {
                    tool: name.to_string(),
                    endpoint: session.endpoint.label.clone(),
                    reason,
                })
            }
            Err(ToolInvokeError::Rpc { message, .. }) => Err(RegistryError::ToolFailed {
                tool: name.to_string(),
                message,
            }),
            Err(other) => Err(RegistryError::ToolFailed {
                tool: name.to_string(),
                message: other.to_string(),
            }),
        }
    }

    async fn invalidate(&self, session: &ProviderSession, reason: &str) {
        if !session.invalidate(reason) {
            return;
        }
        warn!(server = %session.label(), session = %session.id, reason, "provider session invalidated");
        if let Err(err) = session.transport.close().await {
            debug!(server = %session.label(), %err, "failed to close broken provider");
        }
    }

    /// Closes every session. Failures are collected, never propagated.
    pub async fn close_all(&self) -> CloseSummary {
        let sessions = {
            let mut state = self.state.write().expect("registry state lock");
            state.routes.clear();
            state.failed.clear();
            std::mem::take(&mut state.sessions)
        };

        let mut summary = CloseSummary::default();
        for session in sessions {
            session.valid.store(false, Ordering::SeqCst);
            match session.transport.close().await {
                Ok(()) => summary.closed += 1,
                Err(err) => {
                    warn!(server = %session.label(), %err, "failed to close provider");
                    summary.failures.push(EndpointFailure {
                        endpoint: session.endpoint.label.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        info!(
            closed = summary.closed,
            failed = summary.failures.len(),
            "closed provider sessions"
        );
        summary
    }
}

#[async_trait]
impl ToolInvoker for ConnectionRegistry {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput, RegistryError> {
        ConnectionRegistry::invoke(self, name, arguments).await
    }

    async fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.refresh_tools().await;
        ConnectionRegistry::descriptors(self)
    }

    async fn instructions(&self) -> Vec<String> {
        ConnectionRegistry::instructions(self)
    }
}
