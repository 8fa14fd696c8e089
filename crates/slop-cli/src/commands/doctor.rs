//! Diagnostic command to check configuration and downstream servers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use slop_core::{Config, ServerDescriptor, TransportKind};
use slop_hub::{Registry, ServerState, ToolCache};
use slop_mcp::{StoredTokenProvider, TokenStore, TransportConnector};

use crate::commands::mcp::target_of;
use crate::AppContext;

pub async fn run(ctx: &AppContext, connect: bool) -> anyhow::Result<()> {
    println!("Running diagnostics...\n");

    let config_dir = Config::config_dir();
    println!("Config directory: {:?}", config_dir);
    if config_dir.exists() {
        println!("  ✓ Exists");
    } else {
        println!("  ✗ Does not exist (will be created on first use)");
    }

    println!("\nConfig files:");
    for (label, path) in [
        ("user", &ctx.paths.user),
        ("project", &ctx.paths.project),
        ("local", &ctx.paths.local),
    ] {
        let mark = if path.exists() { "✓" } else { "-" };
        println!("  {} {:<8} {}", mark, label, path.display());
    }

    println!("\nValidation:");
    let validation = ctx.config.validate();
    if validation.issues.is_empty() {
        println!("  ✓ No issues");
    }
    for issue in validation.errors() {
        println!("  ✗ {}: {}", issue.field, issue.message);
    }
    for issue in validation.warnings() {
        println!("  ! {}: {}", issue.field, issue.message);
    }

    println!("\nTool cache:");
    if ctx.config.cache.enabled {
        let cache = ToolCache::new(ctx.config.cache.resolved_path());
        let entries = cache.load().entries.len();
        println!("  ✓ {} ({} entries)", cache.path().display(), entries);
    } else {
        println!("  - Disabled");
    }

    println!("\nStored tokens:");
    let store = TokenStore::new(ctx.config.auth.resolved_path());
    match store.list() {
        Ok(tokens) => println!("  ✓ {} ({} tokens)", store.path().display(), tokens.len()),
        Err(e) => println!("  ✗ {}", e),
    }

    println!("\nServers:");
    if ctx.config.servers.is_empty() {
        println!("  ✗ No servers configured");
    }
    for descriptor in ctx.config.servers.values() {
        let (ok, note) = check_descriptor(descriptor);
        let mark = if ok { "✓" } else { "✗" };
        println!(
            "  {} {} [{}] {} ({})",
            mark,
            descriptor.name,
            descriptor.kind(),
            target_of(descriptor),
            note
        );
    }

    if connect && !ctx.config.servers.is_empty() {
        println!("\nConnecting:");
        connect_all(ctx).await;
    }

    println!("\nDiagnostics complete.");
    Ok(())
}

/// Static checks that need no connection.
fn check_descriptor(descriptor: &ServerDescriptor) -> (bool, String) {
    if let Err(e) = descriptor.validate() {
        return (false, e.to_string());
    }
    match descriptor.kind() {
        TransportKind::Stdio => match find_command(&descriptor.command) {
            Some(path) => (true, path.display().to_string()),
            None => (false, "command not found".to_string()),
        },
        _ => (true, "remote".to_string()),
    }
}

/// Resolve a command the way a spawn would: explicit paths as-is, bare names
/// through `PATH`.
fn find_command(command: &str) -> Option<PathBuf> {
    let path = Path::new(command);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}

async fn connect_all(ctx: &AppContext) {
    let tokens = Arc::new(StoredTokenProvider::new(TokenStore::new(
        ctx.config.auth.resolved_path(),
    )));
    let registry = Registry::new(Arc::new(TransportConnector))
        .with_token_provider(tokens)
        .with_connect_timeout(ctx.config.registry.connect_timeout());
    for rejected in registry.intake(ctx.config.descriptors()) {
        println!("  ✗ {}", rejected);
    }

    for name in registry.names() {
        match registry.reconnect(&name).await {
            Ok(()) => {
                let tools = registry
                    .status(Some(&name))
                    .ok()
                    .and_then(|statuses| statuses.into_iter().next())
                    .map(|status| status.tool_count)
                    .unwrap_or_default();
                println!("  ✓ {} connected ({} tools)", name, tools);
            }
            Err(e) => {
                let hint = match registry.state(&name) {
                    Some(ServerState::NeedsAuth) => " (run: slop-mcp auth set)",
                    _ => "",
                };
                println!("  ✗ {}: {}{}", name, e, hint);
            }
        }
    }

    registry.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_command_resolves_explicit_and_path_names() {
        assert!(find_command("/definitely/not/here").is_none());
        assert!(find_command("sh").is_some());
    }

    #[test]
    fn test_check_descriptor() {
        let (ok, note) = check_descriptor(&ServerDescriptor::stdio("x", "no-such-binary-xyz"));
        assert!(!ok);
        assert_eq!(note, "command not found");

        let (ok, _) = check_descriptor(&ServerDescriptor::http("docs", "https://example.com/mcp"));
        assert!(ok);
    }
}
