//! Seam for the SLOP script runtime behind `run_slop`.
//!
//! The interpreter itself lives outside this crate. A runtime gets the
//! registry so scripts can call downstream tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::RegistryError;
use crate::registry::Registry;

/// Executes SLOP source.
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    async fn run(
        &self,
        source: &str,
        registry: Arc<Registry>,
        cancel: CancellationToken,
    ) -> Result<Value, RegistryError>;
}

/// Runtime used when none is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRuntime;

#[async_trait]
impl ScriptRuntime for NoRuntime {
    async fn run(
        &self,
        _source: &str,
        _registry: Arc<Registry>,
        _cancel: CancellationToken,
    ) -> Result<Value, RegistryError> {
        Err(RegistryError::Script(
            "no SLOP runtime is installed in this build".to_string(),
        ))
    }
}
