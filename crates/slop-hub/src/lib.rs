//! # slop-hub
//!
//! The aggregation runtime behind slop-mcp.
//!
//! This crate provides:
//! - The connection registry that owns every downstream session
//! - The on-disk tool cache used for warm starts
//! - Ranked tool search and near-match suggestions
//! - The six meta-tools and the stdio MCP server that exposes them

pub mod cache;
pub mod dispatcher;
pub mod error;
pub mod index;
pub mod outcome;
pub mod params;
pub mod registry;
pub mod script;
pub mod server;
pub mod suggest;

pub use cache::{CacheEntry, CacheFile, ToolCache, ToolInfo, CACHE_VERSION};
pub use dispatcher::{definitions, DispatchError, Dispatcher};
pub use error::{InvalidParameter, ParamInfo, RegistryError};
pub use index::{SearchHit, SearchIndex, SearchPage};
pub use outcome::ToolOutcome;
pub use registry::{
    HealthReport, HealthStatus, Registry, ServerMetadata, ServerState, ServerStatus,
    ServerSummary,
};
pub use script::{NoRuntime, ScriptRuntime};
pub use server::{McpServer, ServeError};
