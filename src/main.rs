//! storegate: channel-aware Cloud Storage gateway server.
//!
//! On SIGTERM/SIGINT the server stops accepting connections and lets
//! in-flight calls finish, for at most `server.shutdown_timeout` seconds.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use storegate::config::{self, Config, LoggingConfig};
use storegate::factory::GcsClientFactory;

/// Command-line arguments for the gateway.
#[derive(Parser, Debug)]
#[command(
    name = "storegate",
    version,
    about = "Channel-aware gateway over Google Cloud Storage"
)]
struct Cli {
    /// Path to the YAML configuration file.  Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,

    /// Override the channel table path.
    #[arg(long)]
    channels: Option<String>,
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    init_logging(&config.logging);
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path);
    }

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));
    let channels_path = cli.channels.unwrap_or_else(|| config.channels.path.clone());

    let channels = config::load_channel_map(&channels_path)?;
    info!(
        "Loaded {} channel(s) from {}: {}",
        channels.len(),
        channels_path,
        channels.channels().join(", ")
    );
    if channels.is_empty() {
        warn!("No channels configured; every RPC will be rejected");
    }

    if config.observability.metrics {
        storegate::metrics::init_metrics();
        storegate::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let factory = GcsClientFactory::from_config(&config.gcs)?;
    info!(
        "GCS client factory ready: api_base={} scheme={:?} cache_dir={}",
        factory.endpoints().api_base,
        config.gcs.signing_scheme,
        config.gcs.cache_dir().display()
    );

    let state = Arc::new(storegate::AppState {
        channels: Arc::new(channels),
        factory: Arc::new(factory),
    });

    let app = storegate::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("storegate listening on {}", bind_addr);

    let grace = Duration::from_secs(config.server.shutdown_timeout);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(grace))
        .await?;

    info!("storegate shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful
/// shutdown.  If draining takes longer than `grace`, the process exits.
async fn shutdown_signal(grace: Duration) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }

    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!("In-flight requests still running after {:?}, exiting", grace);
        std::process::exit(1);
    });
}
