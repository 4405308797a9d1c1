//! switchyard: runs the gateway until Ctrl-C or SIGTERM.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use switchyard::Server;
use switchyard::config::{GatewayConfig, parse_channel_list};
use switchyard::spool::SpoolConfig;

#[derive(Parser, Debug)]
#[command(name = "switchyard", version, about = "Multi-provider webhook message gateway")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "SWITCHYARD_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    #[arg(long, env = "SWITCHYARD_PORT", default_value_t = 8080)]
    port: u16,

    /// Comma-separated channel types to activate. Overrides --exclude-channels.
    #[arg(long, env = "SWITCHYARD_INCLUDE_CHANNELS", default_value = "")]
    include_channels: String,

    /// Comma-separated channel types to skip.
    #[arg(long, env = "SWITCHYARD_EXCLUDE_CHANNELS", default_value = "")]
    exclude_channels: String,

    #[arg(long, env = "SWITCHYARD_BACKEND", default_value = "memory")]
    backend: String,

    /// JSON file with channels to seed the memory backend with.
    #[arg(long, env = "SWITCHYARD_CHANNELS")]
    channels: Option<PathBuf>,

    #[arg(long, env = "SWITCHYARD_READ_TIMEOUT_SECS", default_value_t = 15)]
    read_timeout_secs: u64,

    #[arg(long, env = "SWITCHYARD_WRITE_TIMEOUT_SECS", default_value_t = 15)]
    write_timeout_secs: u64,

    /// How long in-flight requests may finish after shutdown starts.
    #[arg(long, env = "SWITCHYARD_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    shutdown_grace_secs: u64,

    #[arg(long, env = "SWITCHYARD_SPOOL_FLUSH_INTERVAL_MS", default_value_t = 5000)]
    spool_flush_interval_ms: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "SWITCHYARD_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn into_config(self) -> GatewayConfig {
        GatewayConfig {
            host: self.host,
            port: self.port,
            include_channels: parse_channel_list(&self.include_channels),
            exclude_channels: parse_channel_list(&self.exclude_channels),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            backend: self.backend,
            channels_file: self.channels,
            spool: SpoolConfig {
                flush_interval_ms: self.spool_flush_interval_ms,
                ..SpoolConfig::default()
            },
            ..GatewayConfig::default()
        }
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("switchyard=info,tower_http=info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let server = Server::from_config(cli.into_config())
        .await
        .context("failed to set up gateway")?;
    server.start().await.context("failed to start server")?;

    shutdown_signal().await;

    if let Err(e) = server.stop().await {
        tracing::error!(error = %e, "shutdown finished with errors");
    }
    Ok(())
}
