use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use uma_core::supervisor::Supervisor;
use uma_server::executors::register_default_executors;
use uma_server::mcp::mcp_router;
use uma_server::routes::create_api_router;
use uma_server::state::AppState;

/// Command line arguments for the UMA monitoring daemon.
#[derive(Parser, Debug)]
#[command(name = "uma-server")]
#[command(about = "Host-monitoring daemon with HTTP, WebSocket, and MCP surfaces")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, env = "UMA_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Bind host (overrides config)
    #[arg(long, env = "UMA_BIND_HOST")]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(short, long, env = "UMA_BIND_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config =
        uma_config::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if config.mcp.enabled && config.mcp.port == config.server.port {
        anyhow::bail!(
            "mcp.port {} conflicts with server.port",
            config.mcp.port
        );
    }

    let http_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("parsing server bind address")?;
    let mcp_addr: SocketAddr = format!("{}:{}", config.server.host, config.mcp.port)
        .parse()
        .context("parsing mcp bind address")?;
    let mcp_enabled = config.mcp.enabled;

    let core = Arc::new(Supervisor::new(config));
    core.start()?;
    register_default_executors(
        core.operations(),
        core.probes(),
        &core.config().probes,
    );

    let state = AppState::new(core.clone());
    let api = create_api_router(state.clone());

    // Both listeners bind before any serving starts; a bind failure here is
    // a fatal startup error.
    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding {http_addr}"))?;
    info!(addr = %http_addr, "http surface listening");

    let mcp_listener = if mcp_enabled {
        let listener = tokio::net::TcpListener::bind(mcp_addr)
            .await
            .with_context(|| format!("binding {mcp_addr}"))?;
        info!(addr = %mcp_addr, "mcp surface listening");
        Some(listener)
    } else {
        None
    };

    let stop = CancellationToken::new();

    let http_stop = stop.clone();
    let http_server = tokio::spawn(async move {
        axum::serve(http_listener, api)
            .with_graceful_shutdown(async move { http_stop.cancelled().await })
            .await
    });

    let mcp_server = mcp_listener.map(|listener| {
        let router = mcp_router(state.clone());
        let mcp_stop = stop.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { mcp_stop.cancelled().await })
                .await
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    stop.cancel();

    if let Err(err) = http_server.await? {
        error!(%err, "http server terminated with error");
    }
    if let Some(server) = mcp_server
        && let Err(err) = server.await?
    {
        error!(%err, "mcp server terminated with error");
    }

    core.shutdown().await;
    info!("daemon stopped");
    Ok(())
}
