#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use tokio::sync::mpsc;
use tracing::{error, info};

mod bridge;
mod cli;
mod config;
mod db;
mod googlechat;
mod matrix;
mod media;
mod parsers;
mod utils;
mod web;

use bridge::{BridgeContext, IdentityMap, Puppets, SyncOrchestrator};
use cli::Cli;
use config::Config;
use googlechat::{ChatEventListener, GoogleChatApi, GoogleChatClient};
use matrix::{MatrixApi, MatrixAppservice, MatrixEventProcessor};
use media::{MediaHandler, MediaProxy};
use web::WebServer;
use web::metrics::Metrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    if cli.generate_registration {
        print!("{}", serde_yaml::to_string(&matrix::registration(&config))?);
        return Ok(());
    }

    utils::logging::init_tracing(&config.logging);
    let config = Arc::new(config);
    info!("matrix-googlechat bridge starting up");
    Metrics::init();
    install_metrics_exporter(&config)?;

    let db_manager = db::DatabaseManager::new(&config.database).await?;
    db_manager.migrate().await?;
    info!("database ready backend={}", db_manager.backend_name());
    let identity = Arc::new(IdentityMap::new(db_manager));

    let matrix: Arc<dyn MatrixApi> = Arc::new(MatrixAppservice::new(config.clone())?);
    let chat: Arc<dyn GoogleChatApi> = Arc::new(GoogleChatClient::new(&config.googlechat)?);
    let media: Arc<dyn MediaProxy> = Arc::new(MediaHandler::new(&config, chat.clone()));
    let puppets = Arc::new(Puppets::new(
        config.clone(),
        identity.clone(),
        matrix.clone(),
        media.clone(),
    ));

    let orchestrator = Arc::new(SyncOrchestrator::new(BridgeContext {
        config: config.clone(),
        identity,
        puppets,
        matrix,
        chat: chat.clone(),
        media,
    }));

    let capacity = config.limits.event_queue_capacity;
    let (matrix_tx, matrix_rx) = mpsc::channel(capacity);
    let (chat_tx, chat_rx) = mpsc::channel(capacity);
    let matrix_events = Arc::new(MatrixEventProcessor::new(
        matrix_tx,
        config.limits.max_event_age_ms,
    ));
    let chat_events = Arc::new(ChatEventListener::new(
        chat_tx,
        chat.bot_user_id(),
        SecretString::from(config.googlechat.webhook_token.clone()),
    ));

    let web_server = WebServer::new(
        config.clone(),
        orchestrator.clone(),
        matrix_events,
        chat_events,
    );

    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start().await {
            error!("web server error: {}", e);
        }
    });

    let runner = orchestrator.clone();
    let orchestrator_handle = tokio::spawn(async move {
        runner.run(matrix_rx, chat_rx).await;
    });

    tokio::select! {
        _ = web_handle => {},
        _ = orchestrator_handle => {},
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    orchestrator.drain().await;
    info!("matrix-googlechat bridge shutting down");
    Ok(())
}

#[cfg(feature = "metrics")]
fn install_metrics_exporter(config: &Config) -> Result<()> {
    use std::net::SocketAddr;

    use metrics_exporter_prometheus::PrometheusBuilder;

    if !config.metrics.enabled {
        return Ok(());
    }
    let addr: SocketAddr = format!("{}:{}", config.metrics.bind_address, config.metrics.port)
        .parse()
        .context("invalid metrics listen address")?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install prometheus exporter")?;
    info!("prometheus exporter listening on {}", addr);
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn install_metrics_exporter(config: &Config) -> Result<()> {
    if config.metrics.enabled {
        tracing::warn!("metrics.enabled is set but the binary was built without the metrics feature");
    }
    Ok(())
}
