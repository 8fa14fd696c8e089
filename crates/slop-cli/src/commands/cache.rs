//! Tool cache commands.

use slop_core::fingerprint;
use slop_hub::ToolCache;

use crate::{AppContext, CacheAction};

pub async fn handle(action: CacheAction, ctx: &AppContext) -> anyhow::Result<()> {
    let cache = ToolCache::new(ctx.config.cache.resolved_path());

    match action {
        CacheAction::Show { json } => {
            let file = cache.load();
            if json {
                println!("{}", serde_json::to_string_pretty(&file)?);
                return Ok(());
            }
            if file.entries.is_empty() {
                println!("Tool cache is empty ({}).", cache.path().display());
                return Ok(());
            }

            println!("Tool cache ({}):", cache.path().display());
            for (name, entry) in &file.entries {
                let freshness = match ctx.config.servers.get(name) {
                    Some(descriptor) if fingerprint(descriptor) == entry.config_hash => "✓ current",
                    Some(_) => "✗ stale",
                    None => "✗ not configured",
                };
                println!(
                    "  {:<20} {:>3} tools  {:<18} cached {}",
                    name,
                    entry.tools.len(),
                    freshness,
                    entry.cached_at.format("%Y-%m-%d %H:%M UTC")
                );
            }
        }
        CacheAction::Clear { name: Some(name) } => {
            if cache.remove_entry(&name)? {
                println!("✓ Dropped cached tools for '{}'", name);
            } else {
                println!("Nothing cached for '{}'", name);
            }
        }
        CacheAction::Clear { name: None } => {
            cache.clear()?;
            println!("✓ Cleared {}", cache.path().display());
        }
    }
    Ok(())
}
