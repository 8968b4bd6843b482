//! flowtap binary: CLI parsing, config loading, engine wiring.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowtap::addons::LogAddon;
use flowtap::config::{self, ProxyConfig, UpstreamConfig};
use flowtap::lifecycle::Shutdown;
use flowtap::Engine;

#[derive(Parser)]
#[command(name = "flowtap")]
#[command(about = "Interactive HTTP reverse proxy for local development")]
#[command(long_about = "flowtap is a reverse proxy that captures, inspects, and replays
HTTP traffic across local development services.

A config file (flowtap.toml) is loaded automatically from the current
directory. CLI flags override config file values.

Examples:
  # Single upstream
  flowtap --upstream http://localhost:8081

  # Multiple upstreams with path routing
  flowtap --route /api=http://localhost:8081 --route /runner=http://localhost:8083

  # Use a config file
  flowtap --config flowtap.toml

  # Print an example config file
  flowtap init")]
struct Cli {
    /// Path to config file (default: flowtap.toml in the current directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Proxy listen address (default: 127.0.0.1:9090).
    #[arg(long)]
    listen: Option<String>,

    /// Single upstream target URL (e.g. http://localhost:8081).
    #[arg(long)]
    upstream: Option<String>,

    /// Path-routed upstream in PREFIX=TARGET form; repeatable.
    #[arg(long = "route")]
    routes: Vec<String>,

    /// Port for the web inspection UI (0 disables it).
    #[arg(long)]
    web_port: Option<u16>,

    /// Maximum number of flows kept in memory.
    #[arg(long)]
    max_flows: Option<usize>,

    /// Maximum bytes captured per request/response body.
    #[arg(long)]
    max_body_size: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print an example flowtap.toml to stdout.
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Commands::Init) = cli.command {
        print!("{}", ProxyConfig::example());
        return Ok(());
    }

    // Config file, then CLI flags on top.
    let mut cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => match config::find_default(Path::new(".")) {
            Some(path) => {
                let cfg = config::load_config(&path)?;
                eprintln!("loaded config: {}", path.display());
                cfg
            }
            None => ProxyConfig::default(),
        },
    };

    if cli.listen.is_some() {
        cfg.listen = cli.listen.clone();
    }
    if cli.web_port.is_some() {
        cfg.web_port = cli.web_port;
    }
    if cli.max_flows.is_some() {
        cfg.max_flows = cli.max_flows;
    }
    if cli.max_body_size.is_some() {
        cfg.max_body_size = cli.max_body_size;
    }
    // --upstream and --route replace (not merge with) the config file's
    // upstreams when either flag is given.
    if cli.upstream.is_some() || !cli.routes.is_empty() {
        cfg.upstream = cli.upstream.clone();
        cfg.upstreams = cli
            .routes
            .iter()
            .map(|r| parse_route(r))
            .collect::<Result<Vec<_>, _>>()?;
    }

    let default_filter = cfg
        .log_level
        .clone()
        .unwrap_or_else(|| "flowtap=info,tower_http=warn".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let opts = cfg.to_options();
    if opts.upstreams.is_empty() {
        return Err("at least one upstream is required (use --upstream, --route, or a config file)".into());
    }

    let engine = Arc::new(Engine::new(opts)?);
    engine.addons().add(LogAddon);

    tracing::info!(
        listen = %engine.options().listen_addr,
        max_flows = engine.options().max_flows,
        max_body_size = engine.options().max_body_size,
        "configuration loaded"
    );
    for upstream in engine.router().upstreams() {
        tracing::info!(name = %upstream.name, prefix = %upstream.prefix, target = %upstream.target, "upstream");
    }

    let shutdown = Shutdown::new();
    shutdown.trigger_on_ctrl_c();

    let listener = TcpListener::bind(&engine.options().listen_addr).await?;
    engine.serve(listener, shutdown.subscribe()).await?;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Parse a `--route PREFIX=TARGET` flag into an upstream entry. The name
/// is derived from the prefix.
fn parse_route(route: &str) -> Result<UpstreamConfig, String> {
    let (prefix, target) = route
        .split_once('=')
        .ok_or_else(|| format!("invalid --route {route:?}: expected PREFIX=TARGET"))?;
    let name = prefix.trim_start_matches('/');
    let name = if name.is_empty() { "default" } else { name };
    Ok(UpstreamConfig {
        name: Some(name.to_string()),
        prefix: Some(prefix.to_string()),
        target: target.to_string(),
    })
}
