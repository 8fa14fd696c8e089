//! MCP server management commands.

use std::path::Path;

use anyhow::{bail, Context};
use slop_core::config::{add_server_to_file, remove_server_from_file, ConfigPaths};
use slop_core::{ServerDescriptor, TransportKind};

use crate::{AppContext, McpAction, Scope};

pub async fn handle(action: McpAction, ctx: &AppContext) -> anyhow::Result<()> {
    match action {
        McpAction::List => list(ctx),
        McpAction::Add {
            name,
            target,
            args,
            transport,
            env,
            headers,
            timeout,
            scope,
        } => {
            let mut descriptor = build_descriptor(&name, &target, transport.as_deref())?
                .with_args(args);
            for (key, value) in parse_pairs(&env, "--env")? {
                descriptor = descriptor.with_env(key, value);
            }
            for (key, value) in parse_pairs(&headers, "--header")? {
                descriptor = descriptor.with_header(key, value);
            }
            if let Some(timeout) = timeout {
                descriptor = descriptor.with_timeout(timeout);
            }
            descriptor.validate()?;

            let path = scope_path(&ctx.paths, scope);
            add_server_to_file(path, &descriptor)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("✓ Added '{}' ({}) to {}", name, descriptor.kind(), path.display());
            Ok(())
        }
        McpAction::Remove { name, scope } => {
            let scopes = match scope {
                Some(scope) => vec![scope],
                None => vec![Scope::Local, Scope::Project, Scope::User],
            };

            let mut removed = false;
            for scope in scopes {
                let path = scope_path(&ctx.paths, scope);
                if remove_server_from_file(path, &name)? {
                    println!("✓ Removed '{}' from {}", name, path.display());
                    removed = true;
                }
            }
            if !removed {
                bail!("server '{}' is not configured", name);
            }
            Ok(())
        }
    }
}

fn list(ctx: &AppContext) -> anyhow::Result<()> {
    if ctx.config.servers.is_empty() {
        println!("No MCP servers configured.");
        println!("Add one with: slop-mcp mcp add <name> <command-or-url>");
        return Ok(());
    }

    println!("Configured MCP servers:");
    for descriptor in ctx.config.servers.values() {
        println!(
            "  {:<20} {:<6} {:<8} {}",
            descriptor.name,
            descriptor.kind(),
            descriptor.source,
            target_of(descriptor)
        );
    }
    Ok(())
}

/// Command line or URL, for display.
pub fn target_of(descriptor: &ServerDescriptor) -> String {
    match descriptor.kind() {
        TransportKind::Stdio if descriptor.args.is_empty() => descriptor.command.clone(),
        TransportKind::Stdio => format!("{} {}", descriptor.command, descriptor.args.join(" ")),
        _ => descriptor.url.clone(),
    }
}

/// Config file for a scope.
pub fn scope_path(paths: &ConfigPaths, scope: Scope) -> &Path {
    match scope {
        Scope::User => &paths.user,
        Scope::Project => &paths.project,
        Scope::Local => &paths.local,
    }
}

/// A descriptor from the `add` target. URLs default to streamable HTTP.
fn build_descriptor(
    name: &str,
    target: &str,
    transport: Option<&str>,
) -> anyhow::Result<ServerDescriptor> {
    let is_url = target.starts_with("http://") || target.starts_with("https://");
    let kind = match transport {
        Some(value) => match TransportKind::parse(value) {
            Some(kind) => kind,
            None => bail!("unknown transport '{}'", value),
        },
        None if is_url => TransportKind::StreamableHttp,
        None => TransportKind::Stdio,
    };

    Ok(match kind {
        TransportKind::Stdio => ServerDescriptor::stdio(name, target),
        TransportKind::Sse => ServerDescriptor::sse(name, target),
        TransportKind::StreamableHttp => ServerDescriptor::http(name, target),
    })
}

fn parse_pairs(values: &[String], flag: &str) -> anyhow::Result<Vec<(String, String)>> {
    values
        .iter()
        .map(|value| match value.split_once('=') {
            Some((key, val)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), val.to_string()))
            }
            _ => bail!("{} expects KEY=VALUE, got '{}'", flag, value),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use slop_core::Config;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> AppContext {
        let paths = ConfigPaths {
            user: dir.path().join("user.toml"),
            project: dir.path().join(".slop-mcp.toml"),
            local: dir.path().join(".slop-mcp.local.toml"),
        };
        AppContext {
            config: Config::default(),
            paths,
        }
    }

    #[test]
    fn test_url_target_infers_http() {
        let descriptor = build_descriptor("docs", "https://docs.example.com/mcp", None).unwrap();
        assert_eq!(descriptor.kind(), TransportKind::StreamableHttp);
        assert_eq!(descriptor.url, "https://docs.example.com/mcp");

        let descriptor = build_descriptor("docs", "https://x/sse", Some("sse")).unwrap();
        assert_eq!(descriptor.kind(), TransportKind::Sse);
    }

    #[test]
    fn test_unknown_transport_is_rejected() {
        assert!(build_descriptor("x", "cmd", Some("carrier-pigeon")).is_err());
    }

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs(&["A=1".into(), "B=x=y".into()], "--env").unwrap();
        assert_eq!(pairs[1], ("B".to_string(), "x=y".to_string()));
        assert!(parse_pairs(&["NOPE".into()], "--env").is_err());
    }

    #[tokio::test]
    async fn test_add_then_remove_round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        handle(
            McpAction::Add {
                name: "fs".into(),
                target: "npx".into(),
                args: vec!["-y".into(), "server-fs".into()],
                transport: None,
                env: vec!["ROOT=/tmp".into()],
                headers: vec![],
                timeout: Some("45s".into()),
                scope: Scope::Project,
            },
            &ctx,
        )
        .await
        .unwrap();

        let loaded = Config::load_from(&ctx.paths).unwrap();
        let fs = &loaded.servers["fs"];
        assert_eq!(fs.command, "npx");
        assert_eq!(fs.args, vec!["-y", "server-fs"]);
        assert_eq!(fs.env["ROOT"], "/tmp");
        assert_eq!(fs.timeout.as_deref(), Some("45s"));

        handle(McpAction::Remove { name: "fs".into(), scope: None }, &ctx)
            .await
            .unwrap();
        assert!(Config::load_from(&ctx.paths).unwrap().servers.is_empty());

        let missing = handle(McpAction::Remove { name: "fs".into(), scope: None }, &ctx).await;
        assert!(missing.is_err());
    }
}
