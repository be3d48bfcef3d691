//! fluxgate proxy binary.
//!
//! Loads the JSON cluster config for one named node, builds the routing
//! core and serves the HTTP front door until SIGINT/SIGTERM.

use fluxgate::api;
use fluxgate::cluster::Cluster;
use fluxgate::config::FileConfigSource;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// fluxgate: sharding and high-availability proxy for InfluxDB
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON config file
    #[arg(long, env = "FLUXGATE_CONFIG", default_value = "proxy.json")]
    config: String,

    /// Node name to select from the NODES section
    #[arg(long, env = "FLUXGATE_NODE", default_value = "default")]
    node: String,

    /// Directory for per-backend retry spools
    #[arg(long, env = "FLUXGATE_STORE_DIR", default_value = "data")]
    store_dir: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .init();

    info!(config = %args.config, node = %args.node, "starting fluxgate");

    let source = FileConfigSource::new(&args.config, &args.node)?;
    let nodecfg = source.load_node();
    if nodecfg.listen_addr.is_empty() {
        return Err("no listen address configured for this node".into());
    }

    let cluster = Cluster::new(&nodecfg, &args.store_dir)?;
    cluster.load_config(&source).await?;
    cluster.start_statistics();

    let listener = tokio::net::TcpListener::bind(&nodecfg.listen_addr).await?;
    info!(addr = %nodecfg.listen_addr, "listening");

    let app = api::build_router(cluster.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    cluster.close().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
