//! rift-server: reverse-tunneling gateway server.

use clap::Parser;
use rift_server::{RiftServer, ServerConfig};
use std::path::PathBuf;
use tracing::{error, info};

/// rift-server: expose services behind NAT through client-dialed tunnels
#[derive(Parser, Debug)]
#[command(name = "rift-server", version, about = "Reverse-tunneling gateway server")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.rift/server.toml")]
    config: String,

    /// Control listener address
    #[arg(long)]
    bind_addr: Option<String>,

    /// Control listener port
    #[arg(short = 'p', long)]
    bind_port: Option<u16>,

    /// Shared authentication token
    #[arg(short, long)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting rift-server");

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(
        Some(&config_path),
        cli.bind_addr.as_deref(),
        cli.bind_port,
        cli.token.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    if config.token.is_empty() {
        info!("no token configured, any client that signs with an empty token may log in");
    }

    let server = match RiftServer::bind(config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };
    let ctx = server.context();

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            ctx.shutdown();
        }
    }

    info!("rift-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
