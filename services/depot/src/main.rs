//! Depot registry server.

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::Parser;
use depot::{RegistryBuilder, RegistryConfig};
use eyre::WrapErr;
use tracing_subscriber::EnvFilter;

/// Docker Registry V2 server
#[derive(Debug, Parser)]
#[command(name = "depot-server", version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "DEPOT_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration file
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

async fn load_config(path: Option<&Utf8PathBuf>) -> eyre::Result<RegistryConfig> {
    let Some(path) = path else {
        tracing::info!("No configuration file given, using defaults");
        return Ok(RegistryConfig::default());
    };

    let text = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("read configuration from {path}"))?;
    toml_edit::de::from_str(&text).wrap_err_with(|| format!("parse configuration in {path}"))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let mut config = load_config(args.config.as_ref()).await?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let app = RegistryBuilder::from_config(&config)
        .await?
        .build()
        .await
        .wrap_err("open registry storage")?;

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .wrap_err_with(|| format!("bind {}", config.bind))?;

    tracing::info!(bind = %config.bind, bucket = %config.bucket, "Depot listening");
    axum::serve(listener, app).await?;

    Ok(())
}
