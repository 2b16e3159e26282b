use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use once_cell::sync::OnceCell;
use salvo::prelude::*;
use tracing::info;

use crate::bridge::SyncEngine;
use crate::config::Config;
use crate::store::StoreManager;

pub mod handlers;
pub mod verify;

use self::handlers::{
    chatwork_webhook, health_check, health_live, health_ready, index, lark_webhook,
    list_failed_messages,
};

#[derive(Clone)]
pub struct WebState {
    pub engine: Arc<SyncEngine>,
    pub store: Arc<StoreManager>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

pub fn web_state() -> &'static WebState {
    WEB_STATE
        .get()
        .expect("web state is not initialized before handler execution")
}

pub fn create_router() -> Router {
    Router::new()
        .get(index)
        .push(
            Router::with_path("health")
                .get(health_check)
                .push(Router::with_path("ready").get(health_ready))
                .push(Router::with_path("live").get(health_live)),
        )
        .push(
            Router::with_path("webhook")
                .push(Router::with_path("chatwork").post(chatwork_webhook))
                .push(Router::with_path("lark").post(lark_webhook)),
        )
        .push(
            Router::with_path("admin")
                .push(Router::with_path("failed-messages").get(list_failed_messages)),
        )
}

#[derive(Clone)]
pub struct WebServer {
    config: Arc<Config>,
}

impl WebServer {
    pub fn new(
        config: Arc<Config>,
        engine: Arc<SyncEngine>,
        store: Arc<StoreManager>,
    ) -> Result<Self> {
        let _ = WEB_STATE.set(WebState {
            engine,
            store,
            config: config.clone(),
            started_at: Instant::now(),
        });

        Ok(Self { config })
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.config.server.bind_address, self.config.server.port
        );
        info!("Starting web server on {}", bind_addr);

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor).serve(create_router()).await;

        Ok(())
    }
}
