//! Credentials for HTTP-class servers.
//!
//! The registry only ever asks a [`TokenProvider`] whether it can get a
//! token for a server. How tokens are obtained is somebody else's problem;
//! the bundled [`StoredTokenProvider`] serves tokens that were saved to a
//! JSON file with `slop-mcp auth set`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Current token file format.
pub const TOKEN_FILE_VERSION: u32 = 1;

/// Tokens this close to expiry are treated as expired.
const EXPIRY_MARGIN_SECS: i64 = 300;

/// Errors from credential storage.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("I/O error on token store: {0}")]
    Io(#[from] std::io::Error),

    #[error("token store is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    /// The provider cannot run an interactive login.
    #[error("{0}")]
    LoginUnavailable(String),
}

/// Answer from [`TokenProvider::ensure_token`].
#[derive(Debug, Clone, PartialEq)]
pub enum TokenStatus {
    /// A ready `Authorization` header value.
    Token(String),
    /// The server needs no credentials from us.
    NoAuthRequired,
    /// A human has to log in before this server can be used.
    NeedsInteraction(String),
}

/// Consulted before every HTTP-class connection attempt.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn ensure_token(&self, server: &str) -> Result<TokenStatus, AuthError>;
}

/// Never supplies credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl TokenProvider for NoAuth {
    async fn ensure_token(&self, _server: &str) -> Result<TokenStatus, AuthError> {
        Ok(TokenStatus::NoAuthRequired)
    }
}

/// Per-server credential summary, as reported by `auth_mcp`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthStatus {
    pub server_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_url: String,
    pub is_authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
    pub has_refresh_token: bool,
}

impl AuthStatus {
    fn missing(server: &str) -> Self {
        Self {
            server_name: server.to_string(),
            server_url: String::new(),
            is_authenticated: false,
            expires_at: None,
            is_expired: false,
            has_refresh_token: false,
        }
    }
}

/// Login/logout/status operations behind `auth_mcp`.
#[async_trait]
pub trait CredentialManager: Send + Sync {
    /// Obtain credentials for `server`. May require a human.
    async fn login(&self, server: &str, url: Option<&str>) -> Result<AuthStatus, AuthError>;

    /// Forget credentials. Returns whether any were stored.
    async fn logout(&self, server: &str) -> Result<bool, AuthError>;

    async fn status(&self, server: &str) -> Result<AuthStatus, AuthError>;

    async fn list(&self) -> Result<Vec<AuthStatus>, AuthError>;
}

/// A token saved for one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub server_name: String,
    #[serde(default)]
    pub server_url: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl StoredToken {
    pub fn new(server_name: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            server_url: String::new(),
            access_token: access_token.into(),
            refresh_token: None,
            token_type: default_token_type(),
            expires_at: None,
        }
    }

    /// Whether the token is expired or about to be.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECS) >= at,
            None => false,
        }
    }

    /// `Authorization` header value for this token.
    pub fn authorization(&self) -> String {
        let kind = if self.token_type.is_empty() {
            "Bearer"
        } else {
            self.token_type.as_str()
        };
        format!("{} {}", kind, self.access_token)
    }

    fn status(&self) -> AuthStatus {
        let is_expired = self.is_expired();
        AuthStatus {
            server_name: self.server_name.clone(),
            server_url: self.server_url.clone(),
            is_authenticated: !is_expired,
            expires_at: self.expires_at,
            is_expired,
            has_refresh_token: self.refresh_token.is_some(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    version: u32,
    #[serde(default)]
    tokens: BTreeMap<String, StoredToken>,
}

impl Default for TokenFile {
    fn default() -> Self {
        Self {
            version: TOKEN_FILE_VERSION,
            tokens: BTreeMap::new(),
        }
    }
}

/// JSON file of tokens keyed by server name.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<TokenFile, AuthError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TokenFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, file: &TokenFile) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(file)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn get(&self, server: &str) -> Result<Option<StoredToken>, AuthError> {
        Ok(self.load()?.tokens.remove(server))
    }

    pub fn set(&self, token: StoredToken) -> Result<(), AuthError> {
        let mut file = self.load()?;
        debug!(server = %token.server_name, "Storing token");
        file.tokens.insert(token.server_name.clone(), token);
        self.save(&file)
    }

    /// Remove a token. Returns whether one was stored.
    pub fn delete(&self, server: &str) -> Result<bool, AuthError> {
        let mut file = self.load()?;
        if file.tokens.remove(server).is_none() {
            return Ok(false);
        }
        self.save(&file)?;
        Ok(true)
    }

    /// All stored tokens, ordered by server name.
    pub fn list(&self) -> Result<Vec<StoredToken>, AuthError> {
        Ok(self.load()?.tokens.into_values().collect())
    }
}

/// Serves tokens from a [`TokenStore`].
#[derive(Debug, Clone)]
pub struct StoredTokenProvider {
    store: TokenStore,
}

impl StoredTokenProvider {
    pub fn new(store: TokenStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }
}

#[async_trait]
impl TokenProvider for StoredTokenProvider {
    async fn ensure_token(&self, server: &str) -> Result<TokenStatus, AuthError> {
        Ok(match self.store.get(server)? {
            Some(token) if token.is_expired() => TokenStatus::NeedsInteraction(format!(
                "token for '{}' has expired; run `slop-mcp auth set {}`",
                server, server
            )),
            Some(token) => TokenStatus::Token(token.authorization()),
            None => TokenStatus::NoAuthRequired,
        })
    }
}

#[async_trait]
impl CredentialManager for StoredTokenProvider {
    async fn login(&self, server: &str, _url: Option<&str>) -> Result<AuthStatus, AuthError> {
        match self.store.get(server)? {
            Some(token) if !token.is_expired() => Ok(token.status()),
            _ => Err(AuthError::LoginUnavailable(format!(
                "interactive login is not available here; run `slop-mcp auth set {} <token>`",
                server
            ))),
        }
    }

    async fn logout(&self, server: &str) -> Result<bool, AuthError> {
        self.store.delete(server)
    }

    async fn status(&self, server: &str) -> Result<AuthStatus, AuthError> {
        Ok(self
            .store
            .get(server)?
            .map(|t| t.status())
            .unwrap_or_else(|| AuthStatus::missing(server)))
    }

    async fn list(&self) -> Result<Vec<AuthStatus>, AuthError> {
        Ok(self.store.list()?.iter().map(StoredToken::status).collect())
    }
}
