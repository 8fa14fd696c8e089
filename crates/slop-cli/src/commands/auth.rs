//! Stored credential commands.

use anyhow::Context;
use chrono::Utc;
use slop_core::duration::parse_duration;
use slop_mcp::{StoredToken, TokenStore};

use crate::{AppContext, AuthAction};

pub async fn handle(action: AuthAction, ctx: &AppContext) -> anyhow::Result<()> {
    let store = TokenStore::new(ctx.config.auth.resolved_path());

    match action {
        AuthAction::List => {
            let tokens = store.list()?;
            if tokens.is_empty() {
                println!("No stored tokens.");
                return Ok(());
            }
            println!("Stored tokens ({}):", store.path().display());
            for token in tokens {
                let expiry = match token.expires_at {
                    _ if token.is_expired() => "expired".to_string(),
                    Some(at) => format!("expires {}", at.format("%Y-%m-%d %H:%M UTC")),
                    None => "no expiry".to_string(),
                };
                println!("  {:<20} {:<10} {}", token.server_name, expiry, token.server_url);
            }
        }
        AuthAction::Set {
            server,
            token,
            url,
            expires_in,
        } => {
            let mut stored = StoredToken::new(&server, token);
            stored.server_url = url
                .or_else(|| ctx.config.servers.get(&server).map(|d| d.url.clone()))
                .unwrap_or_default();
            if let Some(lifetime) = expires_in {
                let lifetime = parse_duration(&lifetime)?;
                let lifetime = chrono::Duration::from_std(lifetime)
                    .context("token lifetime is out of range")?;
                stored.expires_at = Some(Utc::now() + lifetime);
            }
            store.set(stored)?;
            println!("✓ Stored token for '{}'", server);
        }
        AuthAction::Logout { server } => {
            if store.delete(&server)? {
                println!("✓ Removed token for '{}'", server);
            } else {
                println!("No token stored for '{}'", server);
            }
        }
    }
    Ok(())
}
