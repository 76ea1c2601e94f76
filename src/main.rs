//! Warren tunnel bridge
//!
//! Forwards TCP ports over an SSH session that runs on a WebSocket instead
//! of a raw TCP socket:
//! - `warren serve` accepts WebSocket connections carrying the `"ssh"`
//!   subprotocol and serves authorized port-forward requests.
//! - `warren connect` dials a relay, authenticates, binds local listeners,
//!   and relays them to remote endpoints through the session.
//!
//! An optional bridged command (everything after `--`) ties the session's
//! lifetime to a local process.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warren::client::{self, ClientOptions};
use warren::config::{Config, DEFAULT_PORT};
use warren::policy::PrincipalPolicy;
use warren::process::{BridgeOptions, ProcessBridge};
use warren::registry::SessionRegistry;
use warren::server::{Server, ServerOptions};
use warren::tunnel::ForwardSpec;

#[derive(Parser, Debug)]
#[command(name = "warren")]
#[command(author, version, about = "Forward TCP ports over SSH sessions carried on WebSockets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to a relay and forward local ports through it
    Connect(ConnectArgs),

    /// Accept relay connections and serve forward requests
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ConnectArgs {
    /// Relay URL, e.g. ws://relay.example:8022
    url: Option<String>,

    /// Username presented to the relay
    #[arg(short, long, env = "WARREN_USER")]
    username: Option<String>,

    /// Forward spec [bind_host:]local_port:remote_host:remote_port (repeatable)
    #[arg(short = 'L', long = "forward")]
    forwards: Vec<String>,

    /// Command to run once forwarding is up; its exit tears the session down
    #[arg(last = true)]
    exec: Vec<String>,
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the host private key (OpenSSH format); ephemeral if absent
    #[arg(long)]
    host_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load().unwrap_or_default();

    match cli.command {
        Commands::Connect(args) => run_connect(args, &config).await,
        Commands::Serve(args) => run_serve(args, &config).await,
    }
}

async fn run_connect(args: ConnectArgs, config: &Config) -> Result<()> {
    let url = args
        .url
        .or(config.connection.url.clone())
        .context("Relay URL required: pass it as an argument or set it in the config file")?;
    let username = args
        .username
        .or(config.connection.username.clone())
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "warren".to_string());

    let mut specs = Vec::new();
    for raw in &args.forwards {
        specs.push(raw.parse::<ForwardSpec>()?);
    }

    let registry = Arc::new(SessionRegistry::new());
    let connection = client::connect(
        &registry,
        ClientOptions {
            url: url.clone(),
            username,
        },
    )
    .await
    .with_context(|| format!("Failed to connect to {url}"))?;

    for spec in specs {
        let tunnel = connection.forward_to_remote_port(spec.clone()).await?;
        let local = tunnel
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| spec.local_endpoint());
        println!("{local} -> {}", spec.remote_endpoint());
    }

    if !args.exec.is_empty() {
        let bridge = ProcessBridge::new(registry.clone());
        let mut handle = bridge.spawn(
            &args.exec[0],
            &args.exec[1..],
            BridgeOptions {
                session_key: url.clone(),
                evict_keys: Vec::new(),
            },
        )?;
        handle.wait().await?;
        info!("bridged process finished, session torn down");
    } else {
        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        connection.close().await;
        registry.close_all(None).await;
    }

    Ok(())
}

async fn run_serve(args: ServeArgs, config: &Config) -> Result<()> {
    let port = args.port.or(config.connection.port).unwrap_or(DEFAULT_PORT);

    let registry = Arc::new(SessionRegistry::new());
    let server = Server::bind(
        ServerOptions {
            port,
            host_key: args.host_key,
        },
        Arc::new(PrincipalPolicy),
        registry.clone(),
    )
    .await?;

    tokio::select! {
        result = server.serve() => {
            result.context("Server terminated")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            registry.close_all(None).await;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
