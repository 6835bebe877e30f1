//! twind - digital-twin gateway daemon
//!
//! Serves the gateway REST API in front of the twin backend and, unless
//! disabled, ingests the backend's change events into InfluxDB.
//!
//! Usage:
//!   twind [--config <path>]
//!
//! Environment variables override the config file; see `config.rs`.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use twin_api::{create_router, AppState};
use twin_client::BackendClient;
use twin_core::PathTranslator;
use twin_ingest::{IngestionHandle, InfluxSink, Supervisor};

use crate::config::Config;

/// Parsed command-line arguments
struct Args {
    config_path: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut result = Args { config_path: None };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                let path = args
                    .get(i + 1)
                    .context("Missing argument for --config")?;
                result.config_path = Some(PathBuf::from(path));
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                // Positional argument = config file
                result.config_path = Some(PathBuf::from(arg));
                i += 1;
            }
            _ => {
                tracing::warn!("Unknown argument: {}", args[i]);
                i += 1;
            }
        }
    }

    Ok(result)
}

fn print_help() {
    eprintln!(
        r#"twind - digital-twin gateway daemon

Usage: twind [OPTIONS] [config.toml]

Options:
  -c, --config <path>  Load configuration from a TOML file
  -h, --help           Print this help message

Environment overrides:
  DITTO_URL, DITTO_USERNAME, DITTO_PASSWORD, DITTO_WS_URL
  INFLUXDB_URL, INFLUXDB_TOKEN, INFLUXDB_ORG, INFLUXDB_BUCKET
  PROXY_AUTH_USERNAME, PROXY_AUTH_PASSWORD
  PORT
  RUST_LOG (log filter, default twind=info,twin_api=info,...)
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "twind=info,twin_api=info,twin_ingest=info,twin_client=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting twind");

    let args = parse_args()?;
    if let Some(path) = &args.config_path {
        tracing::info!("Loading config from: {}", path.display());
    }
    let config = Config::load(args.config_path.as_deref())?;

    let client = BackendClient::with_config(
        &config.backend.url,
        config.credentials(),
        config.client_config()?,
    )
    .context("Failed to create backend client")?;
    tracing::info!(
        backend = %client.base_url(),
        events = %client.events_url(),
        "Backend configured"
    );

    let translator = PathTranslator::new(client.base_url(), config.credentials())
        .with_external_prefix(&config.gateway.external_prefix);

    let mut state = AppState::with_translator(client.clone(), translator)
        .with_auth(config.auth.clone())
        .with_auto_create_policy(config.gateway.auto_create_policy);
    if state.auth.is_some() {
        tracing::info!("Caller authentication enabled");
    }

    // Ingestion start failures are fatal
    let ingestion = if config.ingestion.enabled {
        let handle = start_ingestion(&config, &client).await?;
        state = state.with_ingestion(handle.state_receiver());
        Some(handle)
    } else {
        tracing::info!("Ingestion disabled");
        None
    };

    let app = create_router(state);

    let ip = config
        .server
        .host
        .parse::<std::net::IpAddr>()
        .with_context(|| format!("Invalid server host: {}", config.server.host))?;
    let addr = SocketAddr::new(ip, config.server.port);
    tracing::info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = ingestion {
        let stats = handle.stats();
        match handle.stop().await {
            Ok(()) => tracing::info!(
                written = stats.samples_written,
                failed = stats.write_failures,
                "Ingestion stopped"
            ),
            Err(e) => tracing::warn!(error = %e, "Ingestion ended with error"),
        }
    }

    tracing::info!("twind stopped");
    Ok(())
}

async fn start_ingestion(config: &Config, client: &BackendClient) -> anyhow::Result<IngestionHandle> {
    let sink = InfluxSink::new(&config.influxdb).context("Invalid [influxdb] configuration")?;
    tracing::info!(
        url = %sink.write_url(),
        measurement = %config.influxdb.measurement,
        "Time-series sink configured"
    );

    let factory_client = client.clone();
    let supervisor = Supervisor::new(
        move || factory_client.event_connection(),
        Arc::new(sink),
        config.ingestion.pipeline(),
        config.ingestion.restart_policy(),
    );

    let handle = supervisor
        .start()
        .await
        .context("Failed to start event ingestion")?;
    tracing::info!(filter = %config.ingestion.filter, "Event ingestion listening");
    Ok(handle)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
