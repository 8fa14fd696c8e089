//! The six meta-tools exposed to the agent.
//!
//! Each handler parses its JSON input, runs against the [`Registry`] and
//! renders a tool result. Failures come back as [`RegistryError`]s, which the
//! server turns into structured error results.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use slop_core::config::{add_server_to_file, remove_server_from_file, ConfigPaths};
use slop_core::{ServerDescriptor, Source, TransportKind};
use slop_mcp::protocol::{CallToolResult, McpToolDefinition};
use slop_mcp::CredentialManager;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::ToolInfo;
use crate::error::RegistryError;
use crate::registry::{Registry, ServerMetadata};
use crate::script::{NoRuntime, ScriptRuntime};
use crate::suggest::suggest;

pub const SEARCH_TOOLS: &str = "search_tools";
pub const EXECUTE_TOOL: &str = "execute_tool";
pub const GET_METADATA: &str = "get_metadata";
pub const RUN_SLOP: &str = "run_slop";
pub const MANAGE_MCPS: &str = "manage_mcps";
pub const AUTH_MCP: &str = "auth_mcp";

pub const DEFAULT_SEARCH_LIMIT: i64 = 20;
pub const MAX_SEARCH_LIMIT: i64 = 100;

const MANAGE_ACTIONS: &[&str] = &[
    "register",
    "unregister",
    "list",
    "reconnect",
    "status",
    "health_check",
];
const AUTH_ACTIONS: &[&str] = &["login", "logout", "status", "list"];

/// Why a meta-tool call could not be handled.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The name is not one of the six meta-tools.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Routes meta-tool calls to their handlers.
pub struct Dispatcher {
    registry: Arc<Registry>,
    credentials: Arc<dyn CredentialManager>,
    runtime: Arc<dyn ScriptRuntime>,
    paths: ConfigPaths,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        credentials: Arc<dyn CredentialManager>,
        paths: ConfigPaths,
    ) -> Self {
        Self {
            registry,
            credentials,
            runtime: Arc::new(NoRuntime),
            paths,
        }
    }

    /// Install a SLOP runtime for `run_slop`.
    pub fn with_runtime(mut self, runtime: Arc<dyn ScriptRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run meta-tool `name`.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<CallToolResult, DispatchError> {
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };

        let result = match name {
            SEARCH_TOOLS => self.search_tools(arguments),
            EXECUTE_TOOL => self.execute_tool(arguments, &cancel).await,
            GET_METADATA => self.get_metadata(arguments).await,
            RUN_SLOP => self.run_slop(arguments, cancel).await,
            MANAGE_MCPS => self.manage_mcps(arguments).await,
            AUTH_MCP => self.auth_mcp(arguments).await,
            other => return Err(DispatchError::UnknownTool(other.to_string())),
        };
        Ok(result?)
    }

    fn search_tools(&self, arguments: Value) -> Result<CallToolResult, RegistryError> {
        let input: SearchInput = parse(SEARCH_TOOLS, arguments)?;

        let limit = input
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT) as usize;
        let offset = match input.offset {
            Some(offset) if offset < 0 => {
                return Err(RegistryError::invalid_argument(
                    "offset must not be negative",
                ))
            }
            Some(offset) => offset as usize,
            None => 0,
        };
        let server = input.server.as_deref().filter(|s| !s.is_empty());

        let page = self.registry.search(&input.query, server, limit, offset);
        let has_more = offset + page.matches.len() < page.total;
        Ok(json_result(&json!({
            "matches": page.matches,
            "total": page.total,
            "limit": limit,
            "offset": offset,
            "has_more": has_more,
        })))
    }

    async fn execute_tool(
        &self,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult, RegistryError> {
        let input: ExecuteInput = parse(EXECUTE_TOOL, arguments)?;
        if input.server.is_empty() {
            return Err(RegistryError::invalid_argument("server is required"));
        }
        if input.tool.is_empty() {
            return Err(RegistryError::invalid_argument("tool is required"));
        }
        if !(input.arguments.is_object() || input.arguments.is_null()) {
            return Err(RegistryError::invalid_argument(
                "arguments must be a JSON object",
            ));
        }

        let outcome = self
            .registry
            .call(&input.server, &input.tool, input.arguments, cancel)
            .await?;
        Ok(outcome.raw)
    }

    async fn get_metadata(&self, arguments: Value) -> Result<CallToolResult, RegistryError> {
        let input: MetadataInput = parse(GET_METADATA, arguments)?;
        let server = input.server.as_deref().filter(|s| !s.is_empty());
        let tool = input.tool_name.as_deref().filter(|t| !t.is_empty());

        let mut servers = self.registry.get_metadata(server)?;

        if let (Some(server), Some(tool)) = (server, tool) {
            for meta in &mut servers {
                if !meta.tools.iter().any(|t| t.name == tool) {
                    return Err(missing_tool(server, tool, &meta.tools));
                }
                meta.tools.retain(|t| t.name == tool);
                meta.tool_count = meta.tools.len();
            }
        }

        let full = input.verbose || (server.is_some() && tool.is_some());
        let rendered: Vec<Value> = servers.iter().map(|m| render_metadata(m, full)).collect();
        let body = json!({ "servers": rendered });

        if let Some(path) = input.file_path.as_deref().filter(|p| !p.is_empty()) {
            let path = PathBuf::from(path);
            write_json(&path, &body).await?;
            let tool_count: usize = servers.iter().map(|m| m.tools.len()).sum();
            info!(path = %path.display(), "Wrote metadata");
            return Ok(json_result(&json!({
                "written": path.display().to_string(),
                "servers": servers.len(),
                "tools": tool_count,
            })));
        }

        Ok(json_result(&body))
    }

    async fn run_slop(
        &self,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<CallToolResult, RegistryError> {
        let input: RunInput = parse(RUN_SLOP, arguments)?;

        let source = match (input.script, input.file_path) {
            (Some(script), None) => script,
            (None, Some(path)) => tokio::fs::read_to_string(&path).await.map_err(|e| {
                RegistryError::invalid_argument(format!("cannot read script {}: {}", path, e))
            })?,
            _ => {
                return Err(RegistryError::invalid_argument(
                    "exactly one of script or file_path is required",
                ))
            }
        };

        let value = self
            .runtime
            .run(&source, Arc::clone(&self.registry), cancel)
            .await?;
        Ok(match value {
            Value::String(text) => CallToolResult::text(text),
            other => json_result(&other),
        })
    }

    async fn manage_mcps(&self, arguments: Value) -> Result<CallToolResult, RegistryError> {
        let input: ManageInput = parse(MANAGE_MCPS, arguments)?;

        match input.action.as_str() {
            "register" => self.register(input).await,
            "unregister" => {
                let name = required_name(&input.name, "unregister")?;
                self.registry.unregister(name).await?;
                let persisted = match input.scope.as_deref() {
                    None | Some("memory") => None,
                    Some(scope) => {
                        let path = self.scope_path(scope)?;
                        remove_server_from_file(&path, name)
                            .map_err(|e| RegistryError::Internal(e.to_string()))?
                            .then(|| path.display().to_string())
                    }
                };
                Ok(json_result(&json!({
                    "action": "unregister",
                    "name": name,
                    "removed": true,
                    "config_file": persisted,
                })))
            }
            "list" => Ok(json_result(&json!({ "servers": self.registry.list() }))),
            "reconnect" => {
                let name = required_name(&input.name, "reconnect")?;
                self.registry.reconnect(name).await?;
                Ok(json_result(&self.server_line(name)?))
            }
            "status" => {
                let name = input.name.as_deref().filter(|n| !n.is_empty());
                Ok(json_result(&json!({ "servers": self.registry.status(name)? })))
            }
            "health_check" => {
                let name = input.name.as_deref().filter(|n| !n.is_empty());
                let results = self.registry.health_check(name).await?;
                Ok(json_result(&json!({ "results": results })))
            }
            other => Err(RegistryError::invalid_argument(format!(
                "unknown action '{}'; expected one of: {}",
                other,
                MANAGE_ACTIONS.join(", ")
            ))),
        }
    }

    async fn register(&self, input: ManageInput) -> Result<CallToolResult, RegistryError> {
        let name = required_name(&input.name, "register")?.to_string();

        let transport = match input.transport.as_deref() {
            None | Some("") => None,
            Some(kind) => Some(TransportKind::parse(kind).ok_or_else(|| {
                RegistryError::InvalidDescriptor {
                    name: name.clone(),
                    message: format!("unknown transport '{}'", kind),
                }
            })?),
        };

        let (source, config_file) = match input.scope.as_deref() {
            None | Some("memory") => (Source::Runtime, None),
            Some("user") => (Source::User, Some(self.scope_path("user")?)),
            Some("project") => (Source::Project, Some(self.scope_path("project")?)),
            Some(other) => {
                return Err(RegistryError::invalid_argument(format!(
                    "unknown scope '{}'; expected memory, user or project",
                    other
                )))
            }
        };

        let descriptor = ServerDescriptor {
            name: name.clone(),
            transport,
            command: input.command.unwrap_or_default(),
            args: input.args,
            env: input.env,
            url: input.url.unwrap_or_default(),
            headers: input.headers,
            timeout: input.timeout,
            max_retries: input.max_retries,
            dynamic: input.dynamic,
            source,
        };

        self.registry.register(descriptor.clone())?;

        if let Some(ref path) = config_file {
            if let Err(e) = add_server_to_file(path, &descriptor) {
                // A failed write leaves nothing registered.
                let _ = self.registry.unregister(&name).await;
                return Err(RegistryError::Internal(e.to_string()));
            }
            info!(server = %name, path = %path.display(), "Persisted server");
        }

        let connected = self.registry.reconnect(&name).await;
        let mut body = self.server_line(&name)?;
        if let Err(e) = connected {
            warn!(server = %name, error = %e, "Registered server failed to connect");
            body["error"] = e.to_json();
        }
        body["action"] = json!("register");
        if let Some(path) = config_file {
            body["config_file"] = json!(path.display().to_string());
        }
        Ok(json_result(&body))
    }

    async fn auth_mcp(&self, arguments: Value) -> Result<CallToolResult, RegistryError> {
        let input: AuthInput = parse(AUTH_MCP, arguments)?;
        let server = input.server.as_deref().filter(|s| !s.is_empty());

        match input.action.as_str() {
            "login" => {
                let server = server.ok_or_else(|| {
                    RegistryError::invalid_argument("server is required for login")
                })?;
                let descriptor = self.registry.require(server)?;
                let url = Some(descriptor.url.as_str()).filter(|u| !u.is_empty());

                let status = self
                    .credentials
                    .login(server, url)
                    .await
                    .map_err(|e| RegistryError::Auth(e.to_string()))?;

                let mut body = json!({ "action": "login", "status": status });
                if status.is_authenticated {
                    if let Err(e) = self.registry.reconnect(server).await {
                        warn!(server = %server, error = %e, "Reconnect after login failed");
                        body["reconnect_error"] = e.to_json();
                    }
                    body["state"] = json!(self.registry.state(server));
                }
                Ok(json_result(&body))
            }
            "logout" => {
                let server = server.ok_or_else(|| {
                    RegistryError::invalid_argument("server is required for logout")
                })?;
                let removed = self
                    .credentials
                    .logout(server)
                    .await
                    .map_err(|e| RegistryError::Auth(e.to_string()))?;
                Ok(json_result(&json!({
                    "action": "logout",
                    "server": server,
                    "removed": removed,
                })))
            }
            "status" if server.is_some() => {
                let server = server.unwrap_or_default();
                let status = self
                    .credentials
                    .status(server)
                    .await
                    .map_err(|e| RegistryError::Auth(e.to_string()))?;
                Ok(json_result(&json!({ "action": "status", "status": status })))
            }
            "status" | "list" => {
                let tokens = self
                    .credentials
                    .list()
                    .await
                    .map_err(|e| RegistryError::Auth(e.to_string()))?;
                Ok(json_result(&json!({ "action": input.action, "servers": tokens })))
            }
            other => Err(RegistryError::invalid_argument(format!(
                "unknown action '{}'; expected one of: {}",
                other,
                AUTH_ACTIONS.join(", ")
            ))),
        }
    }

    fn scope_path(&self, scope: &str) -> Result<PathBuf, RegistryError> {
        match scope {
            "user" => Ok(self.paths.user.clone()),
            "project" => Ok(self.paths.project.clone()),
            other => Err(RegistryError::invalid_argument(format!(
                "unknown scope '{}'; expected memory, user or project",
                other
            ))),
        }
    }

    fn server_line(&self, name: &str) -> Result<Value, RegistryError> {
        let status = self.registry.status(Some(name))?;
        Ok(status
            .first()
            .map(|s| {
                json!({
                    "name": s.name,
                    "state": s.state,
                    "tool_count": s.tool_count,
                })
            })
            .unwrap_or(Value::Null))
    }
}

/// `tools/list` entries for the six meta-tools.
pub fn definitions() -> Vec<McpToolDefinition> {
    vec![
        definition(
            SEARCH_TOOLS,
            "Search the tools of every connected MCP server by name or description. \
             Returns server, tool, description and score, best match first.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search text; empty lists everything"},
                    "server": {"type": "string", "description": "Only search this MCP server"},
                    "limit": {"type": "integer", "description": "Maximum results (1-100, default 20)"},
                    "offset": {"type": "integer", "description": "Results to skip (default 0)"}
                }
            }),
        ),
        definition(
            EXECUTE_TOOL,
            "Call a tool on a downstream MCP server. Use search_tools or get_metadata \
             to find the tool and its parameters first.",
            json!({
                "type": "object",
                "properties": {
                    "server": {"type": "string", "description": "MCP server name"},
                    "tool": {"type": "string", "description": "Tool name on that server"},
                    "arguments": {"type": "object", "description": "Tool arguments"}
                },
                "required": ["server", "tool"]
            }),
        ),
        definition(
            GET_METADATA,
            "Describe MCP servers and their tools. Input schemas are included when \
             verbose is set or when both server and tool_name are given.",
            json!({
                "type": "object",
                "properties": {
                    "server": {"type": "string", "description": "Only this MCP server"},
                    "tool_name": {"type": "string", "description": "Only this tool (needs server)"},
                    "verbose": {"type": "boolean", "description": "Include input schemas"},
                    "file_path": {"type": "string", "description": "Write the metadata to this file instead"}
                }
            }),
        ),
        definition(
            RUN_SLOP,
            "Run a SLOP script that can orchestrate several tool calls. Pass the \
             source inline or a path to a script file.",
            json!({
                "type": "object",
                "properties": {
                    "script": {"type": "string", "description": "SLOP source"},
                    "file_path": {"type": "string", "description": "Path to a SLOP script"}
                }
            }),
        ),
        definition(
            MANAGE_MCPS,
            "Register, unregister, list, reconnect or health-check downstream MCP servers.",
            json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": MANAGE_ACTIONS},
                    "name": {"type": "string", "description": "Server name"},
                    "transport": {"type": "string", "enum": ["stdio", "sse", "http"]},
                    "command": {"type": "string"},
                    "args": {"type": "array", "items": {"type": "string"}},
                    "env": {"type": "object", "additionalProperties": {"type": "string"}},
                    "url": {"type": "string"},
                    "headers": {"type": "object", "additionalProperties": {"type": "string"}},
                    "timeout": {"type": "string", "description": "Duration such as 30s"},
                    "max_retries": {"type": "integer"},
                    "dynamic": {"type": "boolean", "description": "Never cache this server's tools"},
                    "scope": {"type": "string", "enum": ["memory", "user", "project"]}
                },
                "required": ["action"]
            }),
        ),
        definition(
            AUTH_MCP,
            "Manage credentials for HTTP MCP servers.",
            json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": AUTH_ACTIONS},
                    "server": {"type": "string", "description": "Server name"}
                },
                "required": ["action"]
            }),
        ),
    ]
}

fn definition(name: &str, description: &str, input_schema: Value) -> McpToolDefinition {
    McpToolDefinition {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema,
    }
}

#[derive(Debug, Deserialize)]
struct SearchInput {
    #[serde(default)]
    query: String,
    #[serde(default, alias = "mcp_name")]
    server: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ExecuteInput {
    #[serde(alias = "mcp_name")]
    server: String,
    #[serde(alias = "tool_name")]
    tool: String,
    #[serde(default, alias = "parameters")]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct MetadataInput {
    #[serde(default, alias = "mcp_name")]
    server: Option<String>,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    verbose: bool,
    #[serde(default)]
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunInput {
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ManageInput {
    action: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, alias = "type")]
    transport: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    max_retries: Option<i32>,
    #[serde(default)]
    dynamic: bool,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthInput {
    action: String,
    #[serde(default, alias = "name")]
    server: Option<String>,
}

fn parse<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, RegistryError> {
    serde_json::from_value(arguments)
        .map_err(|e| RegistryError::invalid_argument(format!("{}: {}", tool, e)))
}

fn required_name<'a>(name: &'a Option<String>, action: &str) -> Result<&'a str, RegistryError> {
    name.as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| RegistryError::invalid_argument(format!("name is required for {}", action)))
}

fn json_result(value: &Value) -> CallToolResult {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    CallToolResult::text(text)
}

fn render_metadata(meta: &ServerMetadata, full: bool) -> Value {
    let tools: Vec<Value> = meta
        .tools
        .iter()
        .map(|t| {
            if full {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            } else {
                json!({ "name": t.name, "description": t.description })
            }
        })
        .collect();

    let mut value = json!({
        "name": meta.name,
        "transport": meta.transport,
        "state": meta.state,
        "source": meta.source,
        "tool_count": meta.tool_count,
        "tools": tools,
    });
    if let Some(ref version) = meta.server_version {
        value["server_version"] = json!(version);
    }
    if meta.cached {
        value["cached"] = json!(true);
    }
    if let Some(ref error) = meta.error {
        value["error"] = json!(error);
    }
    value
}

fn missing_tool(server: &str, tool: &str, tools: &[ToolInfo]) -> RegistryError {
    let available: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
    let suggestions = suggest(tool, available.iter().map(String::as_str));
    RegistryError::ToolNotFound {
        server: server.to_string(),
        tool: tool.to_string(),
        available,
        suggestions,
    }
}

async fn write_json(path: &Path, value: &Value) -> Result<(), RegistryError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| RegistryError::Internal(e.to_string()))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RegistryError::invalid_argument(format!("{}: {}", parent.display(), e)))?;
    }
    tokio::fs::write(path, text)
        .await
        .map_err(|e| RegistryError::invalid_argument(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::registry::tests::{fs_server, FakeConnector};

    struct Fixture {
        dir: TempDir,
        dispatcher: Dispatcher,
        connector: Arc<FakeConnector>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let connector = FakeConnector::with(&[("fs", fs_server()), ("git", fs_server())]);
        let registry = Arc::new(Registry::new(connector.clone()));
        registry.intake(vec![ServerDescriptor::stdio("fs", "fs-server")]);

        let credentials = Arc::new(slop_mcp::StoredTokenProvider::new(slop_mcp::TokenStore::new(
            dir.path().join("auth.json"),
        )));
        let dispatcher = Dispatcher::new(registry, credentials, ConfigPaths::for_project(dir.path()));
        Fixture {
            dir,
            dispatcher,
            connector,
        }
    }

    async fn call(fx: &Fixture, name: &str, arguments: Value) -> Result<Value, RegistryError> {
        let result = fx
            .dispatcher
            .dispatch(name, arguments, CancellationToken::new())
            .await
            .map_err(|e| match e {
                DispatchError::Registry(e) => e,
                other => RegistryError::Internal(other.to_string()),
            })?;
        let text = result.joined_text();
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    #[tokio::test]
    async fn test_search_pagination_fields() {
        let fx = fixture();
        fx.dispatcher.registry().reconnect("fs").await.unwrap();

        let body = call(&fx, SEARCH_TOOLS, json!({"query": "", "limit": 1})).await.unwrap();
        assert_eq!(body["total"], 2);
        assert_eq!(body["limit"], 1);
        assert_eq!(body["has_more"], true);
        assert_eq!(body["matches"][0]["tool"], "read");

        let body = call(&fx, SEARCH_TOOLS, json!({"query": "", "limit": 500})).await.unwrap();
        assert_eq!(body["limit"], 100);
        assert_eq!(body["has_more"], false);

        let err = call(&fx, SEARCH_TOOLS, json!({"offset": -1})).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_execute_aliases() {
        let fx = fixture();
        let body = call(
            &fx,
            EXECUTE_TOOL,
            json!({"mcp_name": "fs", "tool_name": "read", "parameters": {"path": "/x"}}),
        )
        .await
        .unwrap();
        assert_eq!(body, json!("read ok"));

        let err = call(&fx, EXECUTE_TOOL, json!({"tool": "read"})).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_unknown_meta_tool() {
        let fx = fixture();
        let err = fx
            .dispatcher
            .dispatch("launch_rockets", json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_metadata_disclosure() {
        let fx = fixture();
        fx.dispatcher.registry().reconnect("fs").await.unwrap();

        let compact = call(&fx, GET_METADATA, json!({})).await.unwrap();
        let tool = &compact["servers"][0]["tools"][0];
        assert_eq!(tool["name"], "read");
        assert!(tool.get("input_schema").is_none());

        let verbose = call(&fx, GET_METADATA, json!({"verbose": true})).await.unwrap();
        assert!(verbose["servers"][0]["tools"][0].get("input_schema").is_some());

        let one = call(&fx, GET_METADATA, json!({"server": "fs", "tool_name": "write"}))
            .await
            .unwrap();
        let tools = one["servers"][0]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert!(tools[0].get("input_schema").is_some());

        let err = call(&fx, GET_METADATA, json!({"server": "nope"})).await.unwrap_err();
        assert_eq!(err.code(), "MCP_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_metadata_to_file() {
        let fx = fixture();
        let path = fx.dir.path().join("out").join("meta.json");
        let body = call(
            &fx,
            GET_METADATA,
            json!({"file_path": path.display().to_string()}),
        )
        .await
        .unwrap();
        assert_eq!(body["servers"], 1);

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["servers"][0]["name"], "fs");
    }

    #[tokio::test]
    async fn test_run_slop_without_runtime() {
        let fx = fixture();
        let err = call(&fx, RUN_SLOP, json!({"script": "emit(1)"})).await.unwrap_err();
        assert_eq!(err.code(), "SCRIPT_ERROR");

        let err = call(&fx, RUN_SLOP, json!({})).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");

        let err = call(&fx, RUN_SLOP, json!({"script": "x", "file_path": "y"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_manage_register_and_persist() {
        let fx = fixture();
        let body = call(
            &fx,
            MANAGE_MCPS,
            json!({
                "action": "register",
                "name": "git",
                "type": "command",
                "command": "git-mcp",
                "scope": "project"
            }),
        )
        .await
        .unwrap();
        assert_eq!(body["state"], "connected");
        assert_eq!(body["tool_count"], 2);
        assert_eq!(fx.connector.connects(), 1);

        let saved = std::fs::read_to_string(fx.dir.path().join(".slop-mcp.toml")).unwrap();
        assert!(saved.contains("[servers.git]"));
        assert!(saved.contains("git-mcp"));

        let err = call(
            &fx,
            MANAGE_MCPS,
            json!({"action": "register", "name": "git", "command": "git-mcp"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_NAME");

        let err = call(
            &fx,
            MANAGE_MCPS,
            json!({"action": "register", "name": "bad", "transport": "pigeon", "url": "http://x"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_DESCRIPTOR");
    }

    #[tokio::test]
    async fn test_register_rolls_back_when_persist_fails() {
        let fx = fixture();
        // A directory where the project file belongs makes the write fail.
        std::fs::create_dir(fx.dir.path().join(".slop-mcp.toml")).unwrap();

        let register = json!({
            "action": "register",
            "name": "git",
            "command": "git-mcp",
            "scope": "project"
        });
        let err = call(&fx, MANAGE_MCPS, register.clone()).await.unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(!fx.dispatcher.registry().contains("git"));
        assert_eq!(fx.connector.connects(), 0);

        std::fs::remove_dir(fx.dir.path().join(".slop-mcp.toml")).unwrap();
        let body = call(&fx, MANAGE_MCPS, register).await.unwrap();
        assert_eq!(body["state"], "connected");
    }

    #[tokio::test]
    async fn test_manage_lifecycle() {
        let fx = fixture();

        let list = call(&fx, MANAGE_MCPS, json!({"action": "list"})).await.unwrap();
        assert_eq!(list["servers"][0]["state"], "configured");

        let body = call(&fx, MANAGE_MCPS, json!({"action": "reconnect", "name": "fs"}))
            .await
            .unwrap();
        assert_eq!(body["state"], "connected");

        let health = call(&fx, MANAGE_MCPS, json!({"action": "health_check"})).await.unwrap();
        assert_eq!(health["results"][0]["status"], "healthy");

        let status = call(&fx, MANAGE_MCPS, json!({"action": "status", "name": "fs"}))
            .await
            .unwrap();
        assert_eq!(status["servers"][0]["health_status"], "healthy");

        call(&fx, MANAGE_MCPS, json!({"action": "unregister", "name": "fs"}))
            .await
            .unwrap();
        let err = call(&fx, MANAGE_MCPS, json!({"action": "unregister", "name": "fs"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MCP_NOT_FOUND");

        let err = call(&fx, MANAGE_MCPS, json!({"action": "explode"})).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_auth_actions() {
        let fx = fixture();

        let body = call(&fx, AUTH_MCP, json!({"action": "list"})).await.unwrap();
        assert_eq!(body["servers"], json!([]));

        let body = call(&fx, AUTH_MCP, json!({"action": "status", "server": "fs"}))
            .await
            .unwrap();
        assert_eq!(body["status"]["is_authenticated"], false);

        let err = call(&fx, AUTH_MCP, json!({"action": "login", "server": "fs"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUTH_ERROR");

        let err = call(&fx, AUTH_MCP, json!({"action": "login", "server": "nope"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MCP_NOT_FOUND");

        let body = call(&fx, AUTH_MCP, json!({"action": "logout", "name": "fs"}))
            .await
            .unwrap();
        assert_eq!(body["removed"], false);
    }

    #[test]
    fn test_definitions() {
        let names: Vec<String> = definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![SEARCH_TOOLS, EXECUTE_TOOL, GET_METADATA, RUN_SLOP, MANAGE_MCPS, AUTH_MCP]
        );
    }
}
