//! riftc: rift tunnel client.
//!
//! Exposes local services through a rift server and runs visitors for
//! secret proxies, as described by a TOML config file.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::error;

/// riftc, the rift tunnel client
#[derive(Parser)]
#[command(name = "riftc", version, about = "rift client: expose local services through a rift server")]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = "~/.rift/client.toml")]
    config: String,

    /// Server address (overrides the config file)
    #[arg(short = 's', long, global = true)]
    server_addr: Option<String>,

    /// Server control port (overrides the config file)
    #[arg(short = 'p', long, global = true)]
    server_port: Option<u16>,

    /// Shared authentication token (overrides the config file)
    #[arg(short, long, global = true)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Log in, register proxies and stay connected (default)
    Run {
        /// Keep retrying even if the very first login fails
        #[arg(long)]
        keep_trying: bool,
    },

    /// Validate the config file and list what it would register
    Verify,

    /// Attempt a hole punch to an xtcp proxy and report the outcome
    Punch {
        /// Name of the xtcp proxy on the server
        proxy: String,
        /// Shared secret of the proxy
        #[arg(long)]
        sk: String,
        /// Seconds to keep probing
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
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

    let overrides = config::Overrides {
        server_addr: cli.server_addr.clone(),
        server_port: cli.server_port,
        token: cli.token.clone(),
    };
    let cfg = match config::load(&cli.config, &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("riftc: {e:#}");
            std::process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Command::Run { keep_trying: false }) {
        Command::Run { keep_trying } => commands::run::run(cfg, !keep_trying).await,
        Command::Verify => commands::verify::run(&cfg),
        Command::Punch { proxy, sk, timeout } => {
            commands::punch::run(cfg, &proxy, &sk, Duration::from_secs(timeout)).await
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("riftc: {e:#}");
        std::process::exit(1);
    }
}
