use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use once_cell::sync::OnceCell;
use salvo::prelude::*;
use tracing::info;

use crate::bridge::SyncOrchestrator;
use crate::config::Config;
use crate::googlechat::ChatEventListener;
use crate::matrix::MatrixEventProcessor;

pub mod handlers;
pub mod metrics;
pub mod middleware;

use self::middleware::auth::create_router;

#[derive(Clone)]
pub struct WebState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub matrix_events: Arc<MatrixEventProcessor>,
    pub chat_events: Arc<ChatEventListener>,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

pub fn web_state() -> &'static WebState {
    WEB_STATE
        .get()
        .expect("web state is not initialized before handler execution")
}

#[derive(Clone)]
pub struct WebServer {
    config: Arc<Config>,
}

impl WebServer {
    pub fn new(
        config: Arc<Config>,
        orchestrator: Arc<SyncOrchestrator>,
        matrix_events: Arc<MatrixEventProcessor>,
        chat_events: Arc<ChatEventListener>,
    ) -> Self {
        let _ = WEB_STATE.set(WebState {
            config: config.clone(),
            orchestrator,
            matrix_events,
            chat_events,
            started_at: Instant::now(),
        });

        Self { config }
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.config.bridge.bind_address, self.config.bridge.port
        );
        info!("starting web server on {}", bind_addr);

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor).serve(create_router()).await;

        Ok(())
    }
}
