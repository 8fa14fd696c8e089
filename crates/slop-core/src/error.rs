//! Error types for slop-mcp.
//!
//! Core errors carry enough context to print a recovery suggestion next
//! to the message.

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for slop-core.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Descriptor failed validation
    #[error("Invalid descriptor for '{name}': {message}")]
    InvalidDescriptor { name: String, message: String },

    /// Duration string could not be parsed
    #[error("Invalid duration '{0}': expected a number followed by ms, s, m or h")]
    InvalidDuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML write error
    #[error("TOML error: {0}")]
    TomlWrite(#[from] toml::ser::Error),
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => Some("Check your config file at ~/.config/slop-mcp/config.toml"),
            Error::InvalidDescriptor { .. } => {
                Some("stdio servers need a command; sse and http servers need an http(s) url")
            }
            Error::InvalidDuration(_) => Some("Use values such as \"500ms\", \"30s\" or \"1m\""),
            Error::TomlParse(_) => Some("Fix the TOML syntax in the reported file"),
            _ => None,
        }
    }

    /// Create an invalid-descriptor error.
    pub fn invalid_descriptor(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidDescriptor {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}
