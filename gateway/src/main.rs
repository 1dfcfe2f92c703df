use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use mcp_gateway::handlers::{self, CommandContext, ExposureKind, ServeOverrides};

#[derive(Parser)]
#[command(name = "mcp-gateway", version)]
#[command(about = "Aggregate MCP tool backends behind a single server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: discover .mcp-gateway.json / .mcp-gateway.toml)
    #[arg(long, short, global = true, env = "MCP_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(long, short, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect all backends and serve the aggregated tools
    Serve {
        /// Override the configured exposure
        #[arg(long, value_enum)]
        transport: Option<ExposureKind>,
        /// Listen host for HTTP exposures
        #[arg(long)]
        host: Option<String>,
        /// Listen port for HTTP exposures
        #[arg(long)]
        port: Option<u16>,
        /// Endpoint path for HTTP exposures
        #[arg(long)]
        path: Option<String>,
    },
    /// List the aggregated tools
    Tools {
        /// Only list tools from one backend
        #[arg(long)]
        backend: Option<String>,
    },
    /// Call a tool through the gateway
    Call {
        /// Tool name
        tool: String,
        /// Arguments as JSON
        #[arg(long, short)]
        args: Option<String>,
    },
    /// Connect every backend and report its state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    mcp_common::init_tracing_with_level("mcp_gateway", level)?;

    let ctx = CommandContext::load(cli.config)?;

    match cli.command {
        Commands::Serve {
            transport,
            host,
            port,
            path,
        } => {
            let overrides = ServeOverrides {
                transport,
                host,
                port,
                path,
            };
            handlers::run_serve(&ctx, overrides).await?;
        }
        Commands::Tools { backend } => {
            handlers::run_tools(&ctx, backend).await?;
        }
        Commands::Call { tool, args } => {
            handlers::run_call_tool(&ctx, &tool, args).await?;
        }
        Commands::Status => {
            handlers::run_status(&ctx).await?;
        }
    }

    Ok(())
}
