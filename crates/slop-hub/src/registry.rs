//! Connection registry.
//!
//! The registry owns one entry per downstream server: its descriptor, its
//! state, the last known tool list and the live session. Calls to one server
//! run one at a time over that server's session, while calls to different
//! servers never wait on each other.
//!
//! Lock order is map, then entry status, then index. The map lock is never
//! held across an await; network I/O runs under the entry's session mutex
//! only.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use slop_core::descriptor::DEFAULT_CONNECT_TIMEOUT;
use slop_core::{fingerprint, ServerDescriptor};
use slop_mcp::{Connector, McpError, NoAuth, Session, TokenProvider, TokenStatus};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, ToolCache, ToolInfo};
use crate::error::RegistryError;
use crate::index::{SearchIndex, SearchPage};
use crate::outcome::ToolOutcome;
use crate::params::{invalid_parameter, looks_like_parameter_error};
use crate::suggest::suggest;

/// How long a health check waits for a `ping` reply.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// First delay of the reconnect backoff.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Ceiling of the reconnect backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// JSON-RPC "invalid params".
const INVALID_PARAMS: i32 = -32602;

/// JSON-RPC "method not found".
const METHOD_NOT_FOUND: i32 = -32601;

/// Lifecycle state of one downstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Known but never attempted.
    Configured,
    Connecting,
    Connected,
    /// Session lost; the next operation connects again.
    Disconnected,
    /// A backoff reconnect loop is running.
    Reconnecting,
    Error,
    /// Credentials are required before connecting.
    NeedsAuth,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::NeedsAuth => "needs_auth",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the most recent health check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Compact per-server line for `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSummary {
    pub name: String,
    pub transport: String,
    pub state: ServerState,
    pub source: String,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Full per-server status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub transport: String,
    pub state: ServerState,
    pub source: String,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub reconnect_attempts: u32,
    pub health_status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_error: Option<String>,
}

/// Metadata for one server, including its tools with schemas.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMetadata {
    pub name: String,
    pub transport: String,
    pub state: ServerState,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    pub tool_count: usize,
    pub tools: Vec<ToolInfo>,
    /// Tools come from the cache rather than a live handshake.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of pinging one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub name: String,
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct Status {
    state: ServerState,
    tools: Vec<ToolInfo>,
    tools_from_cache: bool,
    server_version: Option<String>,
    last_error: Option<String>,
    attempts: u32,
    health: HealthStatus,
    last_health_check: Option<DateTime<Utc>>,
    health_error: Option<String>,
}

struct Entry {
    descriptor: ServerDescriptor,
    status: Mutex<Status>,
    /// Serializes all I/O against this server. `Some` only while connected.
    session: AsyncMutex<Option<Box<dyn Session>>>,
    /// Cancelled when the entry is unregistered or the registry closes.
    shutdown: CancellationToken,
}

impl Entry {
    fn new(descriptor: ServerDescriptor, warm: Option<CacheEntry>) -> Self {
        let (tools, server_version) = match warm {
            Some(cached) => {
                let tools = cached
                    .tools
                    .into_iter()
                    .map(|mut tool| {
                        tool.mcp_name = descriptor.name.clone();
                        tool
                    })
                    .collect::<Vec<_>>();
                let version = Some(cached.server_version).filter(|v| !v.is_empty());
                (tools, version)
            }
            None => (Vec::new(), None),
        };

        Self {
            status: Mutex::new(Status {
                state: ServerState::Configured,
                tools_from_cache: !tools.is_empty(),
                tools,
                server_version,
                last_error: None,
                attempts: 0,
                health: HealthStatus::Unknown,
                last_health_check: None,
                health_error: None,
            }),
            descriptor,
            session: AsyncMutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn snapshot(&self) -> Status {
        self.status.lock().clone()
    }

    fn state(&self) -> ServerState {
        self.status.lock().state
    }

    fn set_state(&self, state: ServerState) {
        self.status.lock().state = state;
    }

    fn has_tool(&self, tool: &str) -> bool {
        self.status.lock().tools.iter().any(|t| t.name == tool)
    }

    fn tool_schema(&self, tool: &str) -> Value {
        self.status
            .lock()
            .tools
            .iter()
            .find(|t| t.name == tool)
            .map(|t| t.input_schema.clone())
            .unwrap_or(Value::Null)
    }

    fn summary(&self) -> ServerSummary {
        let status = self.snapshot();
        let message = match status.state {
            ServerState::Connected => None,
            ServerState::Error => status.last_error.clone(),
            ServerState::NeedsAuth => Some("authentication required".to_string()),
            ServerState::Disconnected => Some("disconnected".to_string()),
            ServerState::Configured if status.tools_from_cache => {
                Some("not connected (tools from cache)".to_string())
            }
            ServerState::Configured => {
                Some("not connected (configured but never attempted)".to_string())
            }
            ServerState::Connecting => Some("connecting...".to_string()),
            ServerState::Reconnecting => {
                Some(format!("reconnecting (attempt {})", status.attempts))
            }
        };

        ServerSummary {
            name: self.descriptor.name.clone(),
            transport: self.descriptor.kind().as_str().to_string(),
            state: status.state,
            source: self.descriptor.source.to_string(),
            tool_count: status.tools.len(),
            message,
        }
    }

    fn status_report(&self) -> ServerStatus {
        let status = self.snapshot();
        ServerStatus {
            name: self.descriptor.name.clone(),
            transport: self.descriptor.kind().as_str().to_string(),
            state: status.state,
            source: self.descriptor.source.to_string(),
            tool_count: status.tools.len(),
            server_version: status.server_version,
            error: status.last_error,
            reconnect_attempts: status.attempts,
            health_status: status.health,
            last_health_check: status.last_health_check,
            health_error: status.health_error,
        }
    }

    /// The error a caller sees when this entry cannot be used.
    fn unavailable(&self) -> RegistryError {
        let status = self.snapshot();
        match status.state {
            ServerState::NeedsAuth => RegistryError::NeedsAuth {
                server: self.name().to_string(),
                message: status
                    .last_error
                    .unwrap_or_else(|| "authentication required".to_string()),
            },
            state => RegistryError::NotConnected {
                server: self.name().to_string(),
                state,
                message: status
                    .last_error
                    .unwrap_or_else(|| "no session".to_string()),
            },
        }
    }

    async fn drop_session(slot: &mut Option<Box<dyn Session>>, name: &str) {
        if let Some(mut session) = slot.take() {
            if let Err(e) = session.close().await {
                debug!(server = %name, error = %e, "Error closing session");
            }
        }
    }
}

/// Registry of downstream MCP servers.
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    index: RwLock<Arc<SearchIndex>>,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    cache: Option<Arc<ToolCache>>,
    connect_timeout: Duration,
    health_task: Mutex<Option<CancellationToken>>,
}

impl Registry {
    /// Create an empty registry opening sessions through `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            index: RwLock::new(Arc::new(SearchIndex::default())),
            connector,
            tokens: Arc::new(NoAuth),
            cache: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            health_task: Mutex::new(None),
        }
    }

    /// Use a tool cache for warm starts and write-back.
    pub fn with_cache(mut self, cache: Arc<ToolCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Consult `tokens` before every HTTP connection attempt.
    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Handshake timeout for descriptors without their own.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Register configured servers, warm-starting those with a valid cache
    /// entry. Opens no connections. Returns the descriptors that were
    /// rejected.
    pub fn intake<I>(&self, descriptors: I) -> Vec<RegistryError>
    where
        I: IntoIterator<Item = ServerDescriptor>,
    {
        let cached = self
            .cache
            .as_ref()
            .map(|cache| cache.load().entries)
            .unwrap_or_default();

        let mut rejected = Vec::new();
        let mut warm = 0usize;
        let mut entries = self.entries.write();

        for descriptor in descriptors {
            if let Err(e) = descriptor.validate() {
                warn!(server = %descriptor.name, error = %e, "Skipping invalid server");
                rejected.push(invalid_descriptor(&descriptor.name, e));
                continue;
            }
            if entries.contains_key(&descriptor.name) {
                warn!(server = %descriptor.name, "Skipping duplicate server");
                rejected.push(RegistryError::DuplicateName(descriptor.name.clone()));
                continue;
            }

            let hit = warm_start(&descriptor, cached.get(&descriptor.name).cloned());
            if hit.is_some() {
                warm += 1;
            }
            entries.insert(
                descriptor.name.clone(),
                Arc::new(Entry::new(descriptor, hit)),
            );
        }

        self.rebuild_index(&entries);
        info!(servers = entries.len(), warm, "Registry loaded");
        rejected
    }

    /// Add one server at runtime. Does not connect.
    pub fn register(&self, descriptor: ServerDescriptor) -> Result<(), RegistryError> {
        descriptor
            .validate()
            .map_err(|e| invalid_descriptor(&descriptor.name, e))?;

        let cached = self
            .cache
            .as_ref()
            .and_then(|cache| cache.get_entry(&descriptor.name));
        let hit = warm_start(&descriptor, cached);

        let mut entries = self.entries.write();
        if entries.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateName(descriptor.name));
        }
        info!(server = %descriptor.name, transport = %descriptor.kind(), "Registered server");
        entries.insert(
            descriptor.name.clone(),
            Arc::new(Entry::new(descriptor, hit)),
        );
        self.rebuild_index(&entries);
        Ok(())
    }

    /// Remove a server, cancelling its in-flight calls and closing its session.
    pub async fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let entry = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.remove(name) else {
                return Err(not_found(name, &entries));
            };
            self.rebuild_index(&entries);
            entry
        };

        entry.shutdown.cancel();
        let mut slot = entry.session.lock().await;
        Entry::drop_session(&mut slot, name).await;
        entry.set_state(ServerState::Disconnected);

        info!(server = %name, "Unregistered server");
        Ok(())
    }

    /// Registered server names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Descriptor of a registered server.
    pub fn descriptor(&self, name: &str) -> Option<ServerDescriptor> {
        self.entries.read().get(name).map(|e| e.descriptor.clone())
    }

    /// Like [`descriptor`](Self::descriptor), but a miss is an
    /// `McpNotFound` error with suggestions.
    pub fn require(&self, name: &str) -> Result<ServerDescriptor, RegistryError> {
        Ok(self.lookup(name)?.descriptor.clone())
    }

    /// Current state of a registered server.
    pub fn state(&self, name: &str) -> Option<ServerState> {
        self.entries.read().get(name).map(|e| e.state())
    }

    /// Compact summaries, sorted by name.
    pub fn list(&self) -> Vec<ServerSummary> {
        let mut out: Vec<ServerSummary> =
            self.entries.read().values().map(|e| e.summary()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Full status of one server, or all servers sorted by name.
    pub fn status(&self, name: Option<&str>) -> Result<Vec<ServerStatus>, RegistryError> {
        match name {
            Some(name) => Ok(vec![self.lookup(name)?.status_report()]),
            None => {
                let mut out: Vec<ServerStatus> = self
                    .entries
                    .read()
                    .values()
                    .map(|e| e.status_report())
                    .collect();
                out.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(out)
            }
        }
    }

    /// Union of every known tool list, ordered by (server, tool).
    pub fn tools(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .entries
            .read()
            .values()
            .flat_map(|e| e.status.lock().tools.clone())
            .collect();
        tools.sort_by(|a, b| {
            a.mcp_name
                .cmp(&b.mcp_name)
                .then_with(|| a.name.cmp(&b.name))
        });
        tools
    }

    /// Ranked search over the current index snapshot.
    pub fn search(
        &self,
        query: &str,
        server: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> SearchPage {
        let index = Arc::clone(&self.index.read());
        index.search(query, server, limit, offset)
    }

    /// Metadata for one server or all of them, tools carrying full schemas.
    ///
    /// A server with no live tool list falls back to the cache, flagged as
    /// cached, when the cached entry was recorded for its current descriptor.
    pub fn get_metadata(&self, server: Option<&str>) -> Result<Vec<ServerMetadata>, RegistryError> {
        let targets: Vec<Arc<Entry>> = match server {
            Some(name) => vec![self.lookup(name)?],
            None => {
                let mut all: Vec<Arc<Entry>> = self.entries.read().values().cloned().collect();
                all.sort_by(|a, b| a.name().cmp(b.name()));
                all
            }
        };

        Ok(targets
            .into_iter()
            .map(|entry| {
                let status = entry.snapshot();
                let mut tools = status.tools;
                let mut cached = status.tools_from_cache && status.state != ServerState::Connected;
                let mut server_version = status.server_version;

                if tools.is_empty() && status.state != ServerState::Connected {
                    let hit = self
                        .cache
                        .as_ref()
                        .and_then(|c| warm_start(&entry.descriptor, c.get_entry(entry.name())));
                    if let Some(hit) = hit {
                        tools = hit.tools;
                        cached = !tools.is_empty();
                        server_version = server_version
                            .or(Some(hit.server_version).filter(|v| !v.is_empty()));
                    }
                }

                ServerMetadata {
                    name: entry.descriptor.name.clone(),
                    transport: entry.descriptor.kind().as_str().to_string(),
                    state: status.state,
                    source: entry.descriptor.source.to_string(),
                    server_version,
                    tool_count: tools.len(),
                    tools,
                    cached,
                    error: status.last_error,
                }
            })
            .collect())
    }

    /// Invoke `tool` on `server`.
    ///
    /// Connects once if the server has no session. A transport failure marks
    /// the server disconnected and is returned without retrying.
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome, RegistryError> {
        let entry = self.lookup(server)?;
        let arguments = if arguments.is_null() {
            Value::Object(Default::default())
        } else {
            arguments
        };

        let mut slot = entry.session.lock().await;

        // Cold entries learn their tool list from the handshake.
        let cold = entry.status.lock().tools.is_empty();
        if slot.is_none() && cold {
            self.connect_locked(&entry, &mut slot, ServerState::Connecting)
                .await
                .map_err(|_| entry.unavailable())?;
        }

        if !entry.has_tool(tool) {
            return Err(tool_not_found(&entry, tool));
        }

        if slot.is_none() {
            self.connect_locked(&entry, &mut slot, ServerState::Connecting)
                .await
                .map_err(|_| entry.unavailable())?;
        }

        let Some(session) = slot.as_mut() else {
            return Err(entry.unavailable());
        };

        debug!(server = %server, tool = %tool, "Calling tool");
        let call_timeout = entry.descriptor.call_timeout();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(CallFailure::Cancelled),
            _ = entry.shutdown.cancelled() => Err(CallFailure::Cancelled),
            result = with_timeout(call_timeout, session.call_tool(tool, arguments.clone())) => {
                match result {
                    Some(Ok(result)) => Ok(result),
                    Some(Err(e)) => Err(CallFailure::Mcp(e)),
                    None => Err(CallFailure::TimedOut),
                }
            }
        };

        match result {
            Ok(result) if result.is_error => {
                let text = result.joined_text();
                if looks_like_parameter_error(&text) {
                    return Err(invalid_parameter(
                        server,
                        tool,
                        &text,
                        &entry.tool_schema(tool),
                        &arguments,
                    ));
                }
                Ok(ToolOutcome::new(result))
            }
            Ok(result) => Ok(ToolOutcome::new(result)),
            Err(CallFailure::Cancelled) => {
                debug!(server = %server, tool = %tool, "Tool call cancelled");
                Err(RegistryError::Cancelled {
                    server: server.to_string(),
                    state: entry.state(),
                })
            }
            Err(CallFailure::TimedOut) => Err(RegistryError::Timeout {
                server: server.to_string(),
                state: entry.state(),
                after: call_timeout.unwrap_or_default(),
            }),
            Err(CallFailure::Mcp(McpError::ServerError { code, message })) => {
                if code == METHOD_NOT_FOUND {
                    return Err(tool_not_found(&entry, tool));
                }
                if code == INVALID_PARAMS || looks_like_parameter_error(&message) {
                    return Err(invalid_parameter(
                        server,
                        tool,
                        &message,
                        &entry.tool_schema(tool),
                        &arguments,
                    ));
                }
                Ok(ToolOutcome::new(
                    slop_mcp::protocol::CallToolResult::error_text(message),
                ))
            }
            Err(CallFailure::Mcp(e)) => {
                Entry::drop_session(&mut slot, server).await;
                if e.is_auth_failure() {
                    let mut status = entry.status.lock();
                    status.state = ServerState::NeedsAuth;
                    status.last_error = Some(e.to_string());
                    drop(status);
                    return Err(entry.unavailable());
                }

                warn!(server = %server, tool = %tool, error = %e, "Session lost during call");
                {
                    let mut status = entry.status.lock();
                    status.state = ServerState::Disconnected;
                    status.last_error = Some(e.to_string());
                }
                Err(RegistryError::Transport {
                    server: server.to_string(),
                    state: ServerState::Disconnected,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Drop any session and connect again.
    pub async fn reconnect(&self, name: &str) -> Result<(), RegistryError> {
        let entry = self.lookup(name)?;
        let mut slot = entry.session.lock().await;
        self.connect_locked(&entry, &mut slot, ServerState::Connecting)
            .await
    }

    /// Reconnect with exponential backoff.
    ///
    /// `max_retries` overrides the descriptor's budget. Without a budget a
    /// single attempt is made. Authentication failures are not retried.
    pub async fn reconnect_with_backoff(
        &self,
        name: &str,
        max_retries: Option<u32>,
    ) -> Result<(), RegistryError> {
        let entry = self.lookup(name)?;
        let Some(budget) = max_retries.or_else(|| entry.descriptor.retry_budget()) else {
            return self.reconnect(name).await;
        };
        let budget = budget.max(1);

        let mut last = None;
        for attempt in 1..=budget {
            {
                let mut status = entry.status.lock();
                status.state = ServerState::Reconnecting;
                status.attempts = attempt;
            }

            let result = {
                let mut slot = entry.session.lock().await;
                self.connect_locked(&entry, &mut slot, ServerState::Reconnecting)
                    .await
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e @ RegistryError::NeedsAuth { .. }) | Err(e @ RegistryError::Cancelled { .. }) => {
                    return Err(e)
                }
                Err(e) => {
                    warn!(server = %name, attempt, budget, error = %e, "Reconnect attempt failed");
                    last = Some(e);
                }
            }

            if attempt < budget {
                tokio::select! {
                    _ = entry.shutdown.cancelled() => {
                        return Err(RegistryError::Cancelled {
                            server: name.to_string(),
                            state: entry.state(),
                        });
                    }
                    _ = tokio::time::sleep(backoff_delay(attempt)) => {}
                }
            }
        }

        let message = format!(
            "reconnect failed after {} attempts: {}",
            budget,
            last.map(|e| e.to_string()).unwrap_or_default()
        );
        {
            let mut status = entry.status.lock();
            status.state = ServerState::Error;
            status.last_error = Some(message.clone());
        }
        Err(RegistryError::NotConnected {
            server: name.to_string(),
            state: ServerState::Error,
            message,
        })
    }

    /// Ping one server, or every connected server concurrently.
    pub async fn health_check(&self, name: Option<&str>) -> Result<Vec<HealthReport>, RegistryError> {
        let targets: Vec<Arc<Entry>> = match name {
            Some(name) => vec![self.lookup(name)?],
            None => {
                let mut all: Vec<Arc<Entry>> = self
                    .entries
                    .read()
                    .values()
                    .filter(|e| e.state() == ServerState::Connected)
                    .cloned()
                    .collect();
                all.sort_by(|a, b| a.name().cmp(b.name()));
                all
            }
        };

        Ok(join_all(targets.iter().map(|entry| check_entry(entry))).await)
    }

    /// Run health checks every `interval` until [`close`](Self::close).
    pub fn start_health_checks(self: &Arc<Self>, interval: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.health_task.lock().replace(token.clone()) {
            previous.cancel();
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if let Ok(reports) = registry.health_check(None).await {
                    let unhealthy = reports
                        .iter()
                        .filter(|r| r.status == HealthStatus::Unhealthy)
                        .count();
                    debug!(checked = reports.len(), unhealthy, "Health check pass");
                }
            }
        });
        info!(interval = ?interval, "Started background health checks");
    }

    /// Connect every entry that has no tool list yet. Failures are logged
    /// and recorded on the entry.
    pub async fn connect_cold(&self) {
        let cold: Vec<String> = {
            let entries = self.entries.read();
            let mut names: Vec<String> = entries
                .values()
                .filter(|e| {
                    let status = e.status.lock();
                    status.state == ServerState::Configured && status.tools.is_empty()
                })
                .map(|e| e.descriptor.name.clone())
                .collect();
            names.sort();
            names
        };

        if cold.is_empty() {
            return;
        }
        info!(count = cold.len(), "Connecting servers without cached tools");

        let results = join_all(cold.iter().map(|name| self.reconnect(name))).await;
        for (name, result) in cold.iter().zip(results) {
            if let Err(e) = result {
                warn!(server = %name, error = %e, "Background connect failed");
            }
        }
    }

    /// Stop background work and close every session.
    pub async fn close(&self) {
        if let Some(token) = self.health_task.lock().take() {
            token.cancel();
        }

        let entries: Vec<Arc<Entry>> = self.entries.read().values().cloned().collect();
        join_all(entries.iter().map(|entry| async move {
            entry.shutdown.cancel();
            let mut slot = entry.session.lock().await;
            if slot.is_some() {
                Entry::drop_session(&mut slot, entry.name()).await;
                entry.set_state(ServerState::Disconnected);
            }
        }))
        .await;
        info!("Registry closed");
    }

    fn lookup(&self, name: &str) -> Result<Arc<Entry>, RegistryError> {
        let entries = self.entries.read();
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name, &entries))
    }

    /// Rebuild the search index. Callers hold the map's write guard.
    fn rebuild_index(&self, entries: &HashMap<String, Arc<Entry>>) {
        let tools: Vec<ToolInfo> = entries
            .values()
            .flat_map(|e| e.status.lock().tools.clone())
            .collect();
        *self.index.write() = Arc::new(SearchIndex::build(&tools));
    }

    fn refresh_index(&self) {
        let entries = self.entries.write();
        self.rebuild_index(&entries);
    }

    /// Open a fresh session for `entry`, replacing whatever `slot` holds.
    /// The caller holds the entry's session mutex.
    async fn connect_locked(
        &self,
        entry: &Entry,
        slot: &mut Option<Box<dyn Session>>,
        transitional: ServerState,
    ) -> Result<(), RegistryError> {
        let name = entry.name().to_string();
        let descriptor = &entry.descriptor;

        Entry::drop_session(slot, &name).await;
        entry.set_state(transitional);

        let authorization = if descriptor.kind().is_http() {
            match self.tokens.ensure_token(&name).await {
                Ok(TokenStatus::Token(header)) => Some(header),
                Ok(TokenStatus::NoAuthRequired) => None,
                Ok(TokenStatus::NeedsInteraction(message)) => {
                    info!(server = %name, "Server needs authentication");
                    let mut status = entry.status.lock();
                    status.state = ServerState::NeedsAuth;
                    status.last_error = Some(message.clone());
                    return Err(RegistryError::NeedsAuth {
                        server: name,
                        message,
                    });
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "Token lookup failed, connecting without credentials");
                    None
                }
            }
        } else {
            None
        };

        let timeout = descriptor.connect_timeout(self.connect_timeout);
        debug!(server = %name, timeout = ?timeout, "Connecting");

        let handshake = async {
            let mut session = self
                .connector
                .connect(descriptor, authorization.as_deref())
                .await?;
            match session.list_tools().await {
                Ok(tools) => Ok((session, tools)),
                Err(e) => {
                    let _ = session.close().await;
                    Err(e)
                }
            }
        };

        let outcome = tokio::select! {
            _ = entry.shutdown.cancelled() => {
                return Err(RegistryError::Cancelled {
                    server: name,
                    state: entry.state(),
                });
            }
            outcome = tokio::time::timeout(timeout, handshake) => outcome,
        };

        let failure = match outcome {
            Ok(Ok((session, definitions))) => {
                let version = session.server_info().version.clone();
                let tools: Vec<ToolInfo> = definitions
                    .into_iter()
                    .map(|d| ToolInfo {
                        name: d.name,
                        description: d.description.unwrap_or_default(),
                        mcp_name: name.clone(),
                        input_schema: d.input_schema,
                    })
                    .collect();

                *slot = Some(session);
                {
                    let mut status = entry.status.lock();
                    status.state = ServerState::Connected;
                    status.tools = tools.clone();
                    status.tools_from_cache = false;
                    status.server_version = Some(version.clone()).filter(|v| !v.is_empty());
                    status.last_error = None;
                    status.attempts = 0;
                }

                self.store_in_cache(descriptor, &version, tools.clone());
                self.refresh_index();
                info!(server = %name, tools = tools.len(), "Connected");
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => McpError::Timeout(timeout),
        };

        let message = failure.to_string();
        let mut status = entry.status.lock();
        if failure.is_auth_failure() {
            status.state = ServerState::NeedsAuth;
            status.last_error = Some(message.clone());
            warn!(server = %name, error = %message, "Server rejected credentials");
            return Err(RegistryError::NeedsAuth {
                server: name,
                message,
            });
        }

        status.state = ServerState::Error;
        status.attempts += 1;
        status.last_error = Some(message.clone());
        warn!(server = %name, error = %message, "Connection failed");
        Err(RegistryError::NotConnected {
            server: name,
            state: ServerState::Error,
            message,
        })
    }

    fn store_in_cache(&self, descriptor: &ServerDescriptor, version: &str, tools: Vec<ToolInfo>) {
        if descriptor.dynamic {
            return;
        }
        let Some(cache) = &self.cache else {
            return;
        };

        let entry = CacheEntry {
            config_hash: fingerprint(descriptor),
            server_name: descriptor.name.clone(),
            server_version: version.to_string(),
            tools,
            cached_at: Utc::now(),
        };
        if let Err(e) = cache.set_entry(&descriptor.name, entry) {
            warn!(server = %descriptor.name, error = %e, "Failed to write tool cache");
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("servers", &self.names())
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

enum CallFailure {
    Cancelled,
    TimedOut,
    Mcp(McpError),
}

/// Delay before retry number `attempt + 1`: 1s, 2s, 4s ... capped at 60s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    INITIAL_BACKOFF
        .checked_mul(factor)
        .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}

/// `None` when `limit` elapsed first.
async fn with_timeout<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn check_entry(entry: &Entry) -> HealthReport {
    let started = Instant::now();
    let (status, latency, error) = {
        let mut slot = entry.session.lock().await;
        match slot.as_mut() {
            None => (HealthStatus::Unhealthy, None, Some("not connected".to_string())),
            Some(session) => match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, session.ping()).await {
                Ok(Ok(())) => (
                    HealthStatus::Healthy,
                    Some(started.elapsed().as_millis() as u64),
                    None,
                ),
                Ok(Err(e)) => (HealthStatus::Unhealthy, None, Some(e.to_string())),
                Err(_) => (
                    HealthStatus::Unhealthy,
                    None,
                    Some(format!("ping timed out after {:?}", HEALTH_CHECK_TIMEOUT)),
                ),
            },
        }
    };

    let checked_at = Utc::now();
    {
        let mut s = entry.status.lock();
        s.health = status;
        s.last_health_check = Some(checked_at);
        s.health_error = error.clone();
    }
    if let Some(ref e) = error {
        debug!(server = %entry.name(), error = %e, "Health check failed");
    }

    HealthReport {
        name: entry.descriptor.name.clone(),
        status,
        checked_at,
        latency_ms: latency,
        error,
    }
}

fn warm_start(descriptor: &ServerDescriptor, cached: Option<CacheEntry>) -> Option<CacheEntry> {
    if descriptor.dynamic {
        return None;
    }
    let cached = cached?;
    if cached.config_hash != fingerprint(descriptor) {
        debug!(server = %descriptor.name, "Cached tools are stale for this descriptor");
        return None;
    }
    Some(cached)
}

fn invalid_descriptor(name: &str, error: slop_core::Error) -> RegistryError {
    let message = match error {
        slop_core::Error::InvalidDescriptor { message, .. } => message,
        other => other.to_string(),
    };
    RegistryError::InvalidDescriptor {
        name: name.to_string(),
        message,
    }
}

fn not_found(name: &str, entries: &HashMap<String, Arc<Entry>>) -> RegistryError {
    let mut available: Vec<String> = entries.keys().cloned().collect();
    available.sort();
    let suggestions = suggest(name, available.iter().map(String::as_str));
    RegistryError::McpNotFound {
        name: name.to_string(),
        available,
        suggestions,
    }
}

fn tool_not_found(entry: &Entry, tool: &str) -> RegistryError {
    let available: Vec<String> = entry
        .status
        .lock()
        .tools
        .iter()
        .map(|t| t.name.clone())
        .collect();
    let suggestions = suggest(tool, available.iter().map(String::as_str));
    RegistryError::ToolNotFound {
        server: entry.descriptor.name.clone(),
        tool: tool.to_string(),
        available,
        suggestions,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use slop_mcp::protocol::{CallToolResult, Implementation, McpToolDefinition};
    use slop_mcp::TransportError;
    use tempfile::TempDir;

    use super::*;

    /// Behaviour of one fake server.
    #[derive(Clone, Default)]
    pub(crate) struct FakeServer {
        pub tools: Vec<&'static str>,
        pub delay: Duration,
        pub fail_connect: bool,
        pub fail_calls: bool,
        pub unauthorized: bool,
    }

    /// Connector handing out in-memory sessions.
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub servers: Mutex<HashMap<String, FakeServer>>,
        pub connects: AtomicUsize,
        pub authorizations: Mutex<Vec<Option<String>>>,
    }

    impl FakeConnector {
        pub fn with(servers: &[(&str, FakeServer)]) -> Arc<Self> {
            let connector = Self::default();
            for (name, server) in servers {
                connector
                    .servers
                    .lock()
                    .insert(name.to_string(), server.clone());
            }
            Arc::new(connector)
        }

        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    struct FakeSession {
        info: Implementation,
        server: FakeServer,
    }

    #[async_trait]
    impl Session for FakeSession {
        fn server_info(&self) -> &Implementation {
            &self.info
        }

        async fn list_tools(&mut self) -> Result<Vec<McpToolDefinition>, McpError> {
            Ok(self
                .server
                .tools
                .iter()
                .map(|name| McpToolDefinition {
                    name: name.to_string(),
                    description: Some(format!("The {} tool", name)),
                    input_schema: json!({
                        "type": "object",
                        "properties": {"path": {"type": "string"}},
                        "required": ["path"]
                    }),
                })
                .collect())
        }

        async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
            if !self.server.delay.is_zero() {
                tokio::time::sleep(self.server.delay).await;
            }
            if self.server.fail_calls {
                return Err(TransportError::ConnectionClosed.into());
            }
            if arguments.get("path").is_none() {
                return Ok(CallToolResult::error_text("missing required parameter: path"));
            }
            if arguments.get("boom").is_some() {
                return Ok(CallToolResult::error_text("disk on fire"));
            }
            Ok(CallToolResult::text(format!("{} ok", name)))
        }

        async fn ping(&mut self) -> Result<(), McpError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), McpError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            descriptor: &ServerDescriptor,
            authorization: Option<&str>,
        ) -> Result<Box<dyn Session>, McpError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.authorizations
                .lock()
                .push(authorization.map(str::to_string));

            let server = self
                .servers
                .lock()
                .get(&descriptor.name)
                .cloned()
                .unwrap_or_default();
            if server.unauthorized {
                return Err(TransportError::Unauthorized("401".into()).into());
            }
            if server.fail_connect {
                return Err(TransportError::ConnectionClosed.into());
            }
            Ok(Box::new(FakeSession {
                info: Implementation {
                    name: descriptor.name.clone(),
                    version: "1.0.0".into(),
                },
                server,
            }))
        }
    }

    pub(crate) fn fs_server() -> FakeServer {
        FakeServer {
            tools: vec!["read", "write"],
            ..Default::default()
        }
    }

    fn cache_in(dir: &TempDir) -> Arc<ToolCache> {
        Arc::new(ToolCache::new(dir.path().join("tools.json")))
    }

    fn seed_cache(cache: &ToolCache, descriptor: &ServerDescriptor, tools: &[&str]) {
        let entry = CacheEntry {
            config_hash: fingerprint(descriptor),
            server_name: descriptor.name.clone(),
            server_version: "0.9".into(),
            tools: tools
                .iter()
                .map(|t| ToolInfo {
                    name: t.to_string(),
                    description: String::new(),
                    mcp_name: descriptor.name.clone(),
                    input_schema: json!({"type": "object"}),
                })
                .collect(),
            cached_at: Utc::now(),
        };
        cache.set_entry(&descriptor.name, entry).unwrap();
    }

    fn args() -> Value {
        json!({"path": "/tmp/x"})
    }

    #[tokio::test]
    async fn test_cold_intake_then_reconnect() {
        let connector = FakeConnector::with(&[("fs", fs_server())]);
        let registry = Registry::new(connector.clone());

        let rejected = registry.intake(vec![ServerDescriptor::stdio("fs", "fs-server")]);
        assert!(rejected.is_empty());
        assert_eq!(registry.search("", None, 20, 0).total, 0);
        assert_eq!(registry.state("fs"), Some(ServerState::Configured));

        registry.reconnect("fs").await.unwrap();
        assert_eq!(registry.state("fs"), Some(ServerState::Connected));

        let page = registry.search("rea", None, 20, 0);
        assert_eq!(page.total, 1);
        assert_eq!(page.matches[0].server, "fs");
        assert_eq!(page.matches[0].tool, "read");
    }

    #[tokio::test]
    async fn test_warm_start_opens_nothing() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let descriptor = ServerDescriptor::stdio("fs", "fs-server");
        seed_cache(&cache, &descriptor, &["read", "write"]);

        let connector = FakeConnector::with(&[("fs", fs_server())]);
        let registry = Registry::new(connector.clone()).with_cache(cache);
        registry.intake(vec![descriptor]);

        let page = registry.search("write", None, 20, 0);
        assert_eq!(page.total, 1);
        assert_eq!(page.matches[0].tool, "write");
        assert_eq!(registry.tools().len(), 2);
        assert_eq!(connector.connects(), 0);

        let summary = &registry.list()[0];
        assert_eq!(summary.tool_count, 2);
        assert_eq!(summary.message.as_deref(), Some("not connected (tools from cache)"));
    }

    #[tokio::test]
    async fn test_fingerprint_drift_is_cold() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        seed_cache(&cache, &ServerDescriptor::stdio("fs", "fs-server"), &["read", "write"]);

        let registry = Registry::new(FakeConnector::with(&[])).with_cache(cache);
        registry.intake(vec![ServerDescriptor::stdio("fs", "fs-server-v2")]);

        assert!(registry.tools().is_empty());
        assert_eq!(registry.search("", None, 20, 0).total, 0);
    }

    #[tokio::test]
    async fn test_dynamic_servers_skip_cache() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let mut descriptor = ServerDescriptor::stdio("fs", "fs-server");
        descriptor.dynamic = true;
        seed_cache(&cache, &descriptor, &["stale"]);

        let registry = Registry::new(FakeConnector::with(&[("fs", fs_server())]))
            .with_cache(cache.clone());
        registry.intake(vec![descriptor]);
        assert!(registry.tools().is_empty());

        registry.reconnect("fs").await.unwrap();
        let cached = cache.get_entry("fs").unwrap();
        assert_eq!(cached.tools[0].name, "stale");
    }

    #[tokio::test]
    async fn test_handshake_writes_cache() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let descriptor = ServerDescriptor::stdio("fs", "fs-server");

        let registry = Registry::new(FakeConnector::with(&[("fs", fs_server())]))
            .with_cache(cache.clone());
        registry.intake(vec![descriptor.clone()]);
        registry.reconnect("fs").await.unwrap();

        assert!(cache.is_valid("fs", &descriptor));
        let cached = cache.get_entry("fs").unwrap();
        assert_eq!(cached.server_version, "1.0.0");
        assert_eq!(cached.tools.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = Registry::new(FakeConnector::with(&[("fs", fs_server())]));
        registry.intake(vec![ServerDescriptor::stdio("fs", "fs-server")]);

        let err = registry
            .call("fs", "delete", json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        let body = err.to_json();
        assert_eq!(body["code"], "TOOL_NOT_FOUND");
        assert_eq!(body["available_tools"], json!(["read", "write"]));
    }

    #[tokio::test]
    async fn test_unknown_server_suggests() {
        let registry = Registry::new(FakeConnector::with(&[]));
        registry.intake(vec![
            ServerDescriptor::stdio("filesystem", "fs"),
            ServerDescriptor::stdio("git", "git-mcp"),
        ]);

        let err = registry
            .call("filesystm", "read", json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            RegistryError::McpNotFound {
                available,
                suggestions,
                ..
            } => {
                assert_eq!(available, vec!["filesystem", "git"]);
                assert_eq!(suggestions[0], "filesystem");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_warm_entry_connects_lazily() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let descriptor = ServerDescriptor::stdio("fs", "fs-server");
        seed_cache(&cache, &descriptor, &["read", "write"]);

        let connector = FakeConnector::with(&[("fs", fs_server())]);
        let registry = Registry::new(connector.clone()).with_cache(cache);
        registry.intake(vec![descriptor]);

        let outcome = registry
            .call("fs", "read", args(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.value, json!("read ok"));
        assert_eq!(connector.connects(), 1);

        registry
            .call("fs", "write", args(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_surfaces_state() {
        let server = FakeServer {
            fail_connect: true,
            ..Default::default()
        };
        let registry = Registry::new(FakeConnector::with(&[("down", server)]));
        registry.intake(vec![ServerDescriptor::stdio("down", "nope")]);

        let err = registry
            .call("down", "read", args(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_CONNECTED");
        assert_eq!(err.to_json()["state"], "error");

        let status = &registry.status(Some("down")).unwrap()[0];
        assert_eq!(status.state, ServerState::Error);
        assert_eq!(status.reconnect_attempts, 1);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_mid_call_failure_disconnects() {
        let server = FakeServer {
            tools: vec!["read"],
            fail_calls: true,
            ..Default::default()
        };
        let connector = FakeConnector::with(&[("fs", server)]);
        let registry = Registry::new(connector.clone());
        registry.intake(vec![ServerDescriptor::stdio("fs", "fs-server")]);
        registry.reconnect("fs").await.unwrap();

        let err = registry
            .call("fs", "read", args(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TRANSPORT_ERROR");
        assert_eq!(registry.state("fs"), Some(ServerState::Disconnected));
        assert_eq!(connector.connects(), 1);
        // Tool list survives the disconnect.
        assert_eq!(registry.tools().len(), 1);
    }

    #[tokio::test]
    async fn test_parameter_error_detail() {
        let registry = Registry::new(FakeConnector::with(&[("fs", fs_server())]));
        registry.intake(vec![ServerDescriptor::stdio("fs", "fs-server")]);
        registry.reconnect("fs").await.unwrap();

        let err = registry
            .call("fs", "read", json!({"file_path": "/x"}), &CancellationToken::new())
            .await
            .unwrap_err();
        let RegistryError::InvalidParameter(detail) = err else {
            panic!("expected invalid parameter");
        };
        assert_eq!(detail.missing_required, vec!["path"]);
        assert_eq!(detail.suggestions.get("file_path").map(String::as_str), Some("path"));
        assert_eq!(detail.input_schema["required"], json!(["path"]));
    }

    #[tokio::test]
    async fn test_tool_error_passes_through() {
        let registry = Registry::new(FakeConnector::with(&[("fs", fs_server())]));
        registry.intake(vec![ServerDescriptor::stdio("fs", "fs-server")]);

        let outcome = registry
            .call("fs", "read", json!({"path": "/x", "boom": true}), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.raw.is_error);
        assert_eq!(outcome.value, json!("disk on fire"));
    }

    #[tokio::test]
    async fn test_cancelled_call_keeps_state() {
        let server = FakeServer {
            tools: vec!["read"],
            delay: Duration::from_secs(5),
            ..Default::default()
        };
        let registry = Registry::new(FakeConnector::with(&[("slow", server)]));
        registry.intake(vec![ServerDescriptor::stdio("slow", "slow")]);
        registry.reconnect("slow").await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = registry.call("slow", "read", args(), &cancel).await.unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
        assert_eq!(registry.state("slow"), Some(ServerState::Connected));
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let server = FakeServer {
            tools: vec!["read"],
            delay: Duration::from_secs(5),
            ..Default::default()
        };
        let registry = Registry::new(FakeConnector::with(&[("slow", server)]));
        registry.intake(vec![ServerDescriptor::stdio("slow", "slow").with_timeout("100ms")]);
        registry.reconnect("slow").await.unwrap();

        let err = registry
            .call("slow", "read", args(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
    }

    #[tokio::test]
    async fn test_parallel_servers_serial_server() {
        let slow = FakeServer {
            tools: vec!["read"],
            delay: Duration::from_millis(200),
            ..Default::default()
        };
        let registry = Arc::new(Registry::new(FakeConnector::with(&[
            ("a", slow.clone()),
            ("b", slow),
        ])));
        registry.intake(vec![
            ServerDescriptor::stdio("a", "a"),
            ServerDescriptor::stdio("b", "b"),
        ]);
        registry.reconnect("a").await.unwrap();
        registry.reconnect("b").await.unwrap();

        let cancel = CancellationToken::new();
        let started = Instant::now();
        let (x, y) = tokio::join!(
            registry.call("a", "read", args(), &cancel),
            registry.call("b", "read", args(), &cancel),
        );
        x.unwrap();
        y.unwrap();
        let parallel = started.elapsed();
        assert!(parallel < Duration::from_millis(380), "took {parallel:?}");

        let started = Instant::now();
        let (x, y) = tokio::join!(
            registry.call("a", "read", args(), &cancel),
            registry.call("a", "read", args(), &cancel),
        );
        x.unwrap();
        y.unwrap();
        let serial = started.elapsed();
        assert!(serial >= Duration::from_millis(400), "took {serial:?}");
    }

    #[tokio::test]
    async fn test_unregister_clears_search() {
        let registry = Registry::new(FakeConnector::with(&[("fs", fs_server())]));
        registry.intake(vec![ServerDescriptor::stdio("fs", "fs-server")]);
        registry.reconnect("fs").await.unwrap();
        assert_eq!(registry.search("", None, 20, 0).total, 2);

        registry.unregister("fs").await.unwrap();
        assert_eq!(registry.search("", None, 20, 0).total, 0);
        assert!(!registry.contains("fs"));
        assert_eq!(registry.unregister("fs").await.unwrap_err().code(), "MCP_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_bad_descriptors() {
        let registry = Registry::new(FakeConnector::with(&[]));
        registry.register(ServerDescriptor::stdio("fs", "fs-server")).unwrap();

        let err = registry
            .register(ServerDescriptor::stdio("fs", "other"))
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_NAME");

        let err = registry
            .register(ServerDescriptor::http("web", "ftp://nowhere"))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_DESCRIPTOR");

        let rejected = registry.intake(vec![ServerDescriptor::stdio("", "x")]);
        assert_eq!(rejected.len(), 1);
    }

    struct NeedsLogin;

    #[async_trait]
    impl TokenProvider for NeedsLogin {
        async fn ensure_token(&self, _server: &str) -> Result<TokenStatus, slop_mcp::AuthError> {
            Ok(TokenStatus::NeedsInteraction("token expired".into()))
        }
    }

    struct FixedToken;

    #[async_trait]
    impl TokenProvider for FixedToken {
        async fn ensure_token(&self, _server: &str) -> Result<TokenStatus, slop_mcp::AuthError> {
            Ok(TokenStatus::Token("Bearer abc".into()))
        }
    }

    #[tokio::test]
    async fn test_needs_interaction_skips_connect() {
        let connector = FakeConnector::with(&[("web", fs_server())]);
        let registry = Registry::new(connector.clone()).with_token_provider(Arc::new(NeedsLogin));
        registry.intake(vec![ServerDescriptor::http("web", "https://mcp.example.com")]);

        let err = registry.reconnect("web").await.unwrap_err();
        assert_eq!(err.code(), "NEEDS_AUTH");
        assert_eq!(registry.state("web"), Some(ServerState::NeedsAuth));
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn test_token_passed_to_http_only() {
        let connector = FakeConnector::with(&[("web", fs_server()), ("fs", fs_server())]);
        let registry = Registry::new(connector.clone()).with_token_provider(Arc::new(FixedToken));
        registry.intake(vec![
            ServerDescriptor::http("web", "https://mcp.example.com"),
            ServerDescriptor::stdio("fs", "fs-server"),
        ]);

        registry.reconnect("web").await.unwrap();
        registry.reconnect("fs").await.unwrap();
        let seen = connector.authorizations.lock().clone();
        assert_eq!(seen, vec![Some("Bearer abc".to_string()), None]);
    }

    #[tokio::test]
    async fn test_unauthorized_handshake() {
        let server = FakeServer {
            unauthorized: true,
            ..Default::default()
        };
        let registry = Registry::new(FakeConnector::with(&[("web", server)]));
        registry.intake(vec![ServerDescriptor::http("web", "https://mcp.example.com")]);

        let err = registry.reconnect("web").await.unwrap_err();
        assert_eq!(err.code(), "NEEDS_AUTH");
        assert_eq!(registry.list()[0].message.as_deref(), Some("authentication required"));
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(7), MAX_BACKOFF);
        assert_eq!(backoff_delay(40), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_exhaustion() {
        let server = FakeServer {
            fail_connect: true,
            ..Default::default()
        };
        let connector = FakeConnector::with(&[("down", server)]);
        let registry = Registry::new(connector.clone());
        registry.intake(vec![ServerDescriptor::stdio("down", "nope")]);

        let err = registry
            .reconnect_with_backoff("down", Some(3))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_CONNECTED");
        assert_eq!(connector.connects(), 3);
        assert_eq!(registry.state("down"), Some(ServerState::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_success_resets_attempts() {
        let registry = Registry::new(FakeConnector::with(&[("fs", fs_server())]));
        registry.intake(vec![ServerDescriptor::stdio("fs", "fs-server")]);

        registry.reconnect_with_backoff("fs", None).await.unwrap();
        let status = &registry.status(Some("fs")).unwrap()[0];
        assert_eq!(status.state, ServerState::Connected);
        assert_eq!(status.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_health_check() {
        let registry = Registry::new(FakeConnector::with(&[("fs", fs_server())]));
        registry.intake(vec![
            ServerDescriptor::stdio("fs", "fs-server"),
            ServerDescriptor::stdio("idle", "idle"),
        ]);
        registry.reconnect("fs").await.unwrap();

        let reports = registry.health_check(None).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, HealthStatus::Healthy);

        let reports = registry.health_check(Some("idle")).await.unwrap();
        assert_eq!(reports[0].status, HealthStatus::Unhealthy);

        let status = registry.status(Some("fs")).unwrap();
        assert_eq!(status[0].health_status, HealthStatus::Healthy);
        assert!(status[0].last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_connect_cold_skips_warm() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let warm = ServerDescriptor::stdio("warm", "warm");
        seed_cache(&cache, &warm, &["read"]);

        let connector = FakeConnector::with(&[("cold", fs_server()), ("warm", fs_server())]);
        let registry = Registry::new(connector.clone()).with_cache(cache);
        registry.intake(vec![warm, ServerDescriptor::stdio("cold", "cold")]);

        registry.connect_cold().await;
        assert_eq!(connector.connects(), 1);
        assert_eq!(registry.state("cold"), Some(ServerState::Connected));
        assert_eq!(registry.state("warm"), Some(ServerState::Configured));
    }

    #[tokio::test]
    async fn test_metadata_falls_back_to_cache() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        seed_cache(&cache, &ServerDescriptor::stdio("fs", "old-command"), &["read"]);

        let registry = Registry::new(FakeConnector::with(&[])).with_cache(cache.clone());
        registry.intake(vec![ServerDescriptor::stdio("fs", "new-command")]);
        assert!(registry.tools().is_empty());

        // Tools cached under another descriptor are not served.
        let meta = registry.get_metadata(Some("fs")).unwrap();
        assert!(!meta[0].cached);
        assert_eq!(meta[0].tool_count, 0);

        // An entry written for the current descriptor after intake is.
        seed_cache(&cache, &ServerDescriptor::stdio("fs", "new-command"), &["read"]);
        let meta = registry.get_metadata(Some("fs")).unwrap();
        assert!(meta[0].cached);
        assert_eq!(meta[0].tool_count, 1);
        assert_eq!(meta[0].server_version.as_deref(), Some("0.9"));

        assert_eq!(registry.get_metadata(Some("nope")).unwrap_err().code(), "MCP_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_close_disconnects() {
        let registry = Registry::new(FakeConnector::with(&[("fs", fs_server())]));
        registry.intake(vec![ServerDescriptor::stdio("fs", "fs-server")]);
        registry.reconnect("fs").await.unwrap();

        registry.close().await;
        assert_eq!(registry.state("fs"), Some(ServerState::Disconnected));
    }
}
