//! devrpc server - hot channel hub plus an HTTP status surface.
//!
//! Dev tools connect to the hub over TCP and get bidirectional RPC with the
//! server: they call the functions registered here, and the server can call
//! or broadcast to them. The HTTP side reports health and peers and lets
//! scripts trigger broadcasts.

mod functions;
mod handler;
mod server;

use anyhow::Result;
use clap::Parser;
use devrpc_core::{create_rpc_server, HotHub, RpcOptions, TimeoutPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "devrpc-server")]
#[command(about = "Bidirectional RPC hub for dev tools")]
struct Args {
    /// Hub port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// HTTP port to listen on (0 = auto-assign)
    #[arg(long, default_value = "0")]
    http_port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// RPC surface name; clients use the event "<name>:rpc"
    #[arg(long, default_value = "devrpc")]
    name: String,

    /// Timeout for calls to tools in milliseconds (negative = never)
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    timeout_ms: i64,

    /// Project root served to tools (defaults to the current directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting devrpc server");

    let root = match args.root {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    info!("Project root: {}", root.display());

    let hub = HotHub::start((args.host.as_str(), args.port)).await?;
    let options = RpcOptions::with_timeout(TimeoutPolicy::from_millis(args.timeout_ms));
    let rpc = create_rpc_server(&args.name, &hub, functions::registry(root), options);
    let rpc_port = hub.port;

    let state = Arc::new(server::AppState { rpc, hub });
    let http_addr = server::start_server(state, &args.host, args.http_port).await?;

    // Ports for the launching process to read (intentional stdout)
    println!("RPC_PORT={}", rpc_port);
    println!("HTTP_PORT={}", http_addr.port());

    info!("devrpc server running (hub {}, http {})", rpc_port, http_addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}
