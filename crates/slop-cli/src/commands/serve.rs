//! The default command: run the aggregating MCP server on stdio.

use std::sync::Arc;

use slop_hub::{Dispatcher, McpServer, Registry, ToolCache};
use slop_mcp::{StoredTokenProvider, TokenStore, TransportConnector};

use crate::AppContext;

pub async fn run(ctx: &AppContext) -> anyhow::Result<()> {
    let config = &ctx.config;

    for issue in config.validate().warnings() {
        tracing::warn!(field = %issue.field, "{}", issue.message);
    }

    let tokens = Arc::new(StoredTokenProvider::new(TokenStore::new(
        config.auth.resolved_path(),
    )));

    let mut registry = Registry::new(Arc::new(TransportConnector))
        .with_token_provider(tokens.clone())
        .with_connect_timeout(config.registry.connect_timeout());
    if config.cache.enabled {
        registry = registry.with_cache(Arc::new(ToolCache::new(config.cache.resolved_path())));
    }
    let registry = Arc::new(registry);

    for rejected in registry.intake(config.descriptors()) {
        tracing::warn!("Skipping server: {}", rejected);
    }
    tracing::info!(servers = registry.names().len(), "Registry ready");

    if config.registry.eager_connect {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            registry.connect_cold().await;
        });
    }

    if let Some(interval) = config.registry.health_check_interval() {
        registry.start_health_checks(interval);
    }

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        tokens,
        ctx.paths.clone(),
    ));
    let server = McpServer::new(dispatcher);

    tokio::select! {
        result = server.serve_stdio() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }

    registry.close().await;
    Ok(())
}
