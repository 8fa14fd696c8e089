//! # slop-mcp
//!
//! Client side of the Model Context Protocol for the slop-mcp orchestrator.
//!
//! This crate provides:
//! - JSON-RPC and MCP protocol types
//! - stdio, SSE and streamable HTTP transports
//! - Initialized downstream sessions
//! - Token providers and the file token store

pub mod auth;
pub mod error;
pub mod event_stream;
pub mod protocol;
pub mod session;
pub mod transport;

pub use auth::{
    AuthError, AuthStatus, CredentialManager, NoAuth, StoredToken, StoredTokenProvider,
    TokenProvider, TokenStatus, TokenStore,
};
pub use error::{McpError, TransportError};
pub use session::{Connector, McpSession, Session, TransportConnector};
