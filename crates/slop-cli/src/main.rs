//! # slop-cli
//!
//! Command-line interface for slop-mcp.

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use slop_core::config::ConfigPaths;
use slop_core::Config;

mod commands;

/// Application context shared by every command.
pub struct AppContext {
    pub config: Config,
    pub paths: ConfigPaths,
}

/// slop-mcp - one MCP server in front of many
#[derive(Parser)]
#[command(name = "slop-mcp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the meta-tools over stdio (the default)
    Serve,
    /// Configured MCP server management
    Mcp {
        #[command(subcommand)]
        action: McpAction,
    },
    /// Stored credentials
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
    /// Tool cache inspection
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Show version information
    Version,
    /// Diagnose configuration and downstream servers
    Doctor {
        /// Also try to connect to every configured server
        #[arg(long)]
        connect: bool,
    },
}

/// Config file a change is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scope {
    /// User config in the platform config directory
    User,
    /// `.slop-mcp.toml` in the current directory
    Project,
    /// `.slop-mcp.local.toml` in the current directory
    Local,
}

#[derive(Subcommand)]
pub enum McpAction {
    /// List configured MCP servers
    List,
    /// Add an MCP server
    Add {
        /// Server name
        name: String,
        /// Command to spawn, or an http(s) URL
        target: String,
        /// Arguments passed to the command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Transport (stdio, http, streamable, sse); inferred from the target by default
        #[arg(short, long)]
        transport: Option<String>,
        /// Environment variable for the child process
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// HTTP header sent with every request
        #[arg(short = 'H', long = "header", value_name = "NAME=VALUE")]
        headers: Vec<String>,
        /// Per-call timeout (e.g. 30s, 2m)
        #[arg(long)]
        timeout: Option<String>,
        /// Config file to write
        #[arg(short, long, value_enum, default_value = "user")]
        scope: Scope,
    },
    /// Remove an MCP server
    Remove {
        /// Server name
        name: String,
        /// Only remove from this config file
        #[arg(short, long, value_enum)]
        scope: Option<Scope>,
    },
}

#[derive(Subcommand)]
pub enum AuthAction {
    /// List stored tokens
    List,
    /// Store a bearer token for a server
    Set {
        /// Server name
        server: String,
        /// Access token
        token: String,
        /// Server URL the token belongs to
        #[arg(long)]
        url: Option<String>,
        /// Lifetime of the token (e.g. 1h)
        #[arg(long)]
        expires_in: Option<String>,
    },
    /// Forget the token for a server
    Logout {
        /// Server name
        server: String,
    },
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// Show cached tool lists
    Show {
        /// Print the raw cache file
        #[arg(long)]
        json: bool,
    },
    /// Drop cached tool lists
    Clear {
        /// Only drop this server's entry
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the MCP stream, so logs go to stderr
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cwd = std::env::current_dir()?;
    let paths = ConfigPaths::for_project(&cwd);

    let config = Config::load_from(&paths).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    });

    let ctx = AppContext { config, paths };

    match cli.command {
        None | Some(Commands::Serve) => {
            commands::serve::run(&ctx).await?;
        }
        Some(Commands::Mcp { action }) => {
            commands::mcp::handle(action, &ctx).await?;
        }
        Some(Commands::Auth { action }) => {
            commands::auth::handle(action, &ctx).await?;
        }
        Some(Commands::Cache { action }) => {
            commands::cache::handle(action, &ctx).await?;
        }
        Some(Commands::Version) => {
            println!("slop-mcp {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Doctor { connect }) => {
            commands::doctor::run(&ctx, connect).await?;
        }
    }

    Ok(())
}
