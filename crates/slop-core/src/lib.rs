//! # slop-core
//!
//! Core types for slop-mcp, the MCP orchestrator.
//!
//! This crate provides:
//! - Downstream server descriptors and their transport kinds
//! - The identity fingerprint used to key the tool cache
//! - The layered configuration system
//! - Common error types

pub mod config;
pub mod descriptor;
pub mod duration;
pub mod error;
pub mod fingerprint;

pub use config::Config;
pub use descriptor::{ServerDescriptor, Source, TransportKind};
pub use error::{Error, Result};
pub use fingerprint::fingerprint;
