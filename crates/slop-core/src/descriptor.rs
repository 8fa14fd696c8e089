//! Downstream server descriptors.
//!
//! A descriptor is the configuration record for a single downstream MCP
//! server. Descriptors come from the layered config files or are registered
//! at runtime through `manage_mcps`.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::{Error, Result};

/// Environment variable overriding the connection timeout for every server
/// that does not set its own.
pub const TIMEOUT_ENV_VAR: &str = "SLOP_MCP_TIMEOUT";

/// Default handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of reconnect attempts for the backoff loop.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Transport family used to reach a downstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Spawned subprocess speaking line-delimited JSON over stdin/stdout.
    #[serde(rename = "stdio", alias = "command", alias = "subprocess")]
    Stdio,
    /// Long-lived SSE stream plus a POST channel.
    #[serde(rename = "sse")]
    Sse,
    /// Streamable HTTP (POST with JSON or event-stream responses).
    #[serde(
        rename = "http",
        alias = "streamable",
        alias = "streamable-http",
        alias = "streamable_http"
    )]
    StreamableHttp,
}

impl TransportKind {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "http",
        }
    }

    /// Parse a user-supplied transport name, accepting the usual aliases.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stdio" | "command" | "subprocess" => Some(Self::Stdio),
            "sse" => Some(Self::Sse),
            "http" | "streamable" | "streamable-http" | "streamable_http" => {
                Some(Self::StreamableHttp)
            }
            _ => None,
        }
    }

    /// Whether this transport goes over HTTP.
    pub fn is_http(&self) -> bool {
        matches!(self, Self::Sse | Self::StreamableHttp)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// `~/.config/slop-mcp/config.toml`
    User,
    /// `.slop-mcp.toml` in the project root
    Project,
    /// `.slop-mcp.local.toml`, not shared
    Local,
    /// Registered while running
    #[default]
    Runtime,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Project => write!(f, "project"),
            Self::Local => write!(f, "local"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}

/// Configuration for a single downstream MCP server.
///
/// Only `transport`, `command`, `args`, `url`, `headers` and `env` identify
/// the server; everything else is volatile and excluded from the
/// [fingerprint](crate::fingerprint::fingerprint).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique server name. Filled from the table key when loaded from config.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Transport family. Inferred from `command`/`url` when absent.
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    /// Executable for stdio servers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    /// Command arguments (order-sensitive).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment overlay for the subprocess.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Endpoint for HTTP transports.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Extra HTTP headers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Connection timeout such as "30s" or "1m".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Backoff reconnect budget. Negative disables automatic reconnects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i32>,
    /// Dynamic servers are never cached.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dynamic: bool,
    /// Provenance tag, assigned by the config loader.
    #[serde(skip)]
    pub source: Source,
}

impl ServerDescriptor {
    /// Create a stdio descriptor.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: Some(TransportKind::Stdio),
            command: command.into(),
            ..Default::default()
        }
    }

    /// Create a streamable HTTP descriptor.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: Some(TransportKind::StreamableHttp),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create an SSE descriptor.
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: Some(TransportKind::Sse),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add an HTTP header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the connection timeout string.
    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    /// Set the provenance tag.
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// Resolved transport kind.
    pub fn kind(&self) -> TransportKind {
        match self.transport {
            Some(kind) => kind,
            None if self.command.is_empty() && !self.url.is_empty() => TransportKind::StreamableHttp,
            None => TransportKind::Stdio,
        }
    }

    /// Check that the fields required by the transport are present.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_descriptor(&self.name, "name cannot be empty"));
        }

        match self.kind() {
            TransportKind::Stdio => {
                if self.command.trim().is_empty() {
                    return Err(Error::invalid_descriptor(
                        &self.name,
                        "stdio transport requires a command",
                    ));
                }
            }
            kind => {
                if self.url.is_empty() {
                    return Err(Error::invalid_descriptor(
                        &self.name,
                        format!("{} transport requires a url", kind),
                    ));
                }
                if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
                    return Err(Error::invalid_descriptor(
                        &self.name,
                        "url must start with http:// or https://",
                    ));
                }
            }
        }

        if let Some(ref timeout) = self.timeout {
            parse_duration(timeout).map_err(|e| Error::invalid_descriptor(&self.name, e.to_string()))?;
        }

        Ok(())
    }

    /// Connection timeout: the descriptor's own value, then
    /// `SLOP_MCP_TIMEOUT`, then `fallback`.
    pub fn connect_timeout(&self, fallback: Duration) -> Duration {
        if let Some(timeout) = self.timeout.as_deref().and_then(|t| parse_duration(t).ok()) {
            return timeout;
        }
        std::env::var(TIMEOUT_ENV_VAR)
            .ok()
            .and_then(|v| parse_duration(&v).ok())
            .unwrap_or(fallback)
    }

    /// Per-call timeout, only when the descriptor sets one.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.timeout.as_deref().and_then(|t| parse_duration(t).ok())
    }

    /// Reconnect budget for the backoff loop, `None` when disabled.
    pub fn retry_budget(&self) -> Option<u32> {
        match self.max_retries {
            None | Some(0) => Some(DEFAULT_MAX_RETRIES),
            Some(n) if n > 0 => Some(n as u32),
            Some(_) => None,
        }
    }
}
