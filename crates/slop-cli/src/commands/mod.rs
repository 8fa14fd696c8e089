//! CLI command implementations.

pub mod auth;
pub mod cache;
pub mod doctor;
pub mod mcp;
pub mod serve;
