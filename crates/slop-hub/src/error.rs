//! Errors surfaced to the agent.
//!
//! Every variant maps to a stable wire code and a JSON payload, so a failure
//! can be returned as a structured tool result rather than a bare string.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::registry::ServerState;

/// One parameter from a tool's input schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamInfo {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub required: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Detail attached to an invalid-parameter failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidParameter {
    pub server: String,
    pub tool: String,
    /// What the downstream server said.
    pub message: String,
    pub input_schema: Value,
    pub provided: Vec<String>,
    pub expected: Vec<ParamInfo>,
    pub missing_required: Vec<String>,
    pub unknown: Vec<String>,
    /// Unknown provided name → closest expected name.
    pub suggestions: BTreeMap<String, String>,
}

/// Errors from the registry and the meta-tools built on it.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("MCP server not found: {name}")]
    McpNotFound {
        name: String,
        available: Vec<String>,
        suggestions: Vec<String>,
    },

    #[error("tool '{tool}' not found on MCP '{server}'")]
    ToolNotFound {
        server: String,
        tool: String,
        available: Vec<String>,
        suggestions: Vec<String>,
    },

    #[error("MCP '{server}' is not connected ({state}): {message}")]
    NotConnected {
        server: String,
        state: ServerState,
        message: String,
    },

    #[error("MCP '{server}' needs authentication: {message}")]
    NeedsAuth { server: String, message: String },

    #[error("transport error on MCP '{server}': {message}")]
    Transport {
        server: String,
        state: ServerState,
        message: String,
    },

    #[error("call to MCP '{server}' was cancelled")]
    Cancelled { server: String, state: ServerState },

    #[error("call to MCP '{server}' timed out after {after:?}")]
    Timeout {
        server: String,
        state: ServerState,
        after: Duration,
    },

    #[error("invalid parameters for tool '{}' on MCP '{}': {}", .0.tool, .0.server, .0.message)]
    InvalidParameter(Box<InvalidParameter>),

    #[error("MCP '{0}' is already registered")]
    DuplicateName(String),

    #[error("invalid descriptor for '{name}': {message}")]
    InvalidDescriptor { name: String, message: String },

    #[error("script error: {0}")]
    Script(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::McpNotFound { .. } => "MCP_NOT_FOUND",
            Self::ToolNotFound { .. } => "TOOL_NOT_FOUND",
            Self::NotConnected { .. } => "NOT_CONNECTED",
            Self::NeedsAuth { .. } => "NEEDS_AUTH",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::InvalidParameter(_) => "INVALID_PARAMETER",
            Self::DuplicateName(_) => "DUPLICATE_NAME",
            Self::InvalidDescriptor { .. } => "INVALID_DESCRIPTOR",
            Self::Script(_) => "SCRIPT_ERROR",
            Self::Auth(_) => "AUTH_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Structured payload: `{code, message, ...details}`.
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "code": self.code(),
            "message": self.to_string(),
        });

        let details = match self {
            Self::McpNotFound {
                name,
                available,
                suggestions,
            } => json!({
                "server": name,
                "available_servers": available,
                "suggestions": suggestions,
            }),
            Self::ToolNotFound {
                server,
                tool,
                available,
                suggestions,
            } => json!({
                "server": server,
                "tool": tool,
                "available_tools": available,
                "suggestions": suggestions,
            }),
            Self::NotConnected { server, state, .. }
            | Self::Transport { server, state, .. }
            | Self::Cancelled { server, state }
            | Self::Timeout { server, state, .. } => json!({
                "server": server,
                "state": state,
            }),
            Self::NeedsAuth { server, .. } => json!({
                "server": server,
                "state": ServerState::NeedsAuth,
                "hint": format!("run `slop-mcp auth set {}` or auth_mcp login", server),
            }),
            Self::InvalidParameter(detail) => serde_json::to_value(detail.as_ref())
                .unwrap_or(Value::Null),
            Self::DuplicateName(name) => json!({ "server": name }),
            Self::InvalidDescriptor { name, .. } => json!({ "server": name }),
            _ => Value::Null,
        };

        if let (Value::Object(body), Value::Object(details)) = (&mut body, details) {
            body.extend(details);
        }
        body
    }
}
