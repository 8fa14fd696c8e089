//! Configuration system for slop-mcp.
//!
//! Settings are layered with figment: defaults, then the user file, then the
//! project file, then the gitignored local file, then `SLOP_MCP_*`
//! environment variables. Server descriptors are read per layer so each one
//! keeps its [`Source`]; a later layer replaces an earlier descriptor with
//! the same name as a whole.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::descriptor::{ServerDescriptor, Source, TransportKind, DEFAULT_CONNECT_TIMEOUT};
use crate::duration::parse_duration;
use crate::error::{Error, Result};

/// Project config file name.
pub const PROJECT_CONFIG_FILE: &str = ".slop-mcp.toml";

/// Local (unshared) project config file name.
pub const LOCAL_CONFIG_FILE: &str = ".slop-mcp.local.toml";

/// Main configuration struct for slop-mcp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection registry settings
    pub registry: RegistryConfig,
    /// Tool cache settings
    pub cache: CacheConfig,
    /// Token store settings
    pub auth: AuthConfig,
    /// Downstream servers by name
    pub servers: BTreeMap<String, ServerDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Handshake timeout for servers without their own `timeout`
    pub connect_timeout: String,
    /// Connect servers without a cached tool list in the background at startup
    pub eager_connect: bool,
    /// Interval for background health checks; unset disables them
    pub health_check_interval: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            connect_timeout: "30s".to_string(),
            eager_connect: true,
            health_check_interval: None,
        }
    }
}

impl RegistryConfig {
    /// Parsed connect timeout, falling back to 30 seconds.
    pub fn connect_timeout(&self) -> Duration {
        parse_duration(&self.connect_timeout).unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Parsed health check interval; `None` or zero disables.
    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval
            .as_deref()
            .and_then(|v| parse_duration(v).ok())
            .filter(|d| !d.is_zero())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Use the on-disk tool cache
    pub enabled: bool,
    /// Override of the cache file location
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

impl CacheConfig {
    /// Cache file location.
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| Config::config_dir().join("cache").join("tools.json"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Override of the token file location
    pub token_path: Option<PathBuf>,
}

impl AuthConfig {
    /// Token file location.
    pub fn resolved_path(&self) -> PathBuf {
        self.token_path
            .clone()
            .unwrap_or_else(|| Config::config_dir().join("auth.json"))
    }
}

/// Locations of the three file layers.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub user: PathBuf,
    pub project: PathBuf,
    pub local: PathBuf,
}

impl ConfigPaths {
    /// Standard locations relative to `project_dir`.
    pub fn for_project(project_dir: &Path) -> Self {
        Self {
            user: Config::user_config_path(),
            project: project_dir.join(PROJECT_CONFIG_FILE),
            local: project_dir.join(LOCAL_CONFIG_FILE),
        }
    }

    fn layers(&self) -> [(Source, &Path); 3] {
        [
            (Source::User, self.user.as_path()),
            (Source::Project, self.project.as_path()),
            (Source::Local, self.local.as_path()),
        ]
    }
}

#[derive(Debug, Default, Deserialize)]
struct ServersFile {
    #[serde(default)]
    servers: BTreeMap<String, ServerDescriptor>,
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Error).collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Warning).collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "servers.fs.command")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Load configuration from all sources, using the current directory as
    /// the project root.
    pub fn load() -> std::result::Result<Self, figment::Error> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::load_from(&ConfigPaths::for_project(&cwd))
    }

    /// Load configuration from explicit file locations.
    pub fn load_from(paths: &ConfigPaths) -> std::result::Result<Self, figment::Error> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&paths.user))
            .merge(Toml::file(&paths.project))
            .merge(Toml::file(&paths.local))
            .merge(Env::prefixed("SLOP_MCP_").split("__"))
            .extract()?;

        config.servers = Self::load_servers(paths)?;
        Ok(config)
    }

    /// Read descriptors layer by layer, tagging each with its source.
    fn load_servers(
        paths: &ConfigPaths,
    ) -> std::result::Result<BTreeMap<String, ServerDescriptor>, figment::Error> {
        let mut servers = BTreeMap::new();

        for (source, path) in paths.layers() {
            if !path.exists() {
                continue;
            }
            let file: ServersFile = Figment::from(Toml::file(path)).extract()?;
            for (name, mut descriptor) in file.servers {
                descriptor.name = name.clone();
                descriptor.source = source;
                servers.insert(name, descriptor);
            }
        }

        Ok(servers)
    }

    /// Load and validate configuration.
    pub fn load_validated() -> Result<Self> {
        let config = Self::load().map_err(|e| Error::Config(e.to_string()))?;
        let result = config.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Config(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Err(e) = parse_duration(&self.registry.connect_timeout) {
            result.add_error("registry.connect_timeout", e.to_string());
        }

        if let Some(ref interval) = self.registry.health_check_interval {
            if let Err(e) = parse_duration(interval) {
                result.add_error("registry.health_check_interval", e.to_string());
            }
        }

        for (name, server) in &self.servers {
            let field = format!("servers.{}", name);

            if let Err(Error::InvalidDescriptor { message, .. }) = server.validate() {
                result.add_error(&field, message);
                continue;
            }

            match server.kind() {
                TransportKind::Stdio => {
                    if !server.url.is_empty() || !server.headers.is_empty() {
                        result.add_warning(&field, "url and headers are ignored for stdio servers");
                    }
                }
                _ => {
                    if !server.command.is_empty() || !server.args.is_empty() {
                        result.add_warning(&field, "command and args are ignored for HTTP servers");
                    }
                    if !server.env.is_empty() {
                        result.add_warning(&field, "env is ignored for HTTP servers");
                    }
                }
            }
        }

        result
    }

    /// Descriptors in name order.
    pub fn descriptors(&self) -> Vec<ServerDescriptor> {
        self.servers.values().cloned().collect()
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("slop-mcp"))
            .unwrap_or_else(|| PathBuf::from("~/.config/slop-mcp"))
    }

    /// User-level config file.
    pub fn user_config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

/// Append or replace a descriptor under `[servers.<name>]` in a TOML file,
/// creating the file and its parent directories when missing.
pub fn add_server_to_file(path: &Path, descriptor: &ServerDescriptor) -> Result<()> {
    let mut document = read_table(path)?;

    let mut stored = descriptor.clone();
    stored.name.clear();
    let value = toml::Value::try_from(&stored)?;

    let servers = document
        .entry("servers")
        .or_insert(toml::Value::Table(toml::Table::new()));
    match servers {
        toml::Value::Table(table) => {
            table.insert(descriptor.name.clone(), value);
        }
        _ => {
            return Err(Error::Config(format!(
                "'servers' in {} is not a table",
                path.display()
            )))
        }
    }

    write_table(path, &document)
}

/// Remove `[servers.<name>]` from a TOML file. Returns whether it was present.
pub fn remove_server_from_file(path: &Path, name: &str) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let mut document = read_table(path)?;
    let removed = match document.get_mut("servers") {
        Some(toml::Value::Table(table)) => table.remove(name).is_some(),
        _ => false,
    };
    if removed {
        write_table(path, &document)?;
    }
    Ok(removed)
}

fn read_table(path: &Path) -> Result<toml::Table> {
    if !path.exists() {
        return Ok(toml::Table::new());
    }
    let text = std::fs::read_to_string(path)?;
    Ok(text.parse::<toml::Table>()?)
}

fn write_table(path: &Path, document: &toml::Table) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(document)?)?;
    Ok(())
}
