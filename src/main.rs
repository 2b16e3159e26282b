#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

mod bridge;
mod chatwork;
mod cli;
mod config;
mod error;
mod lark;
mod mappings;
mod retry;
mod store;
mod utils;
mod web;

use bridge::SyncEngine;
use config::Config;
use web::WebServer;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    let config = Arc::new(
        Config::load_from_file(&cli.config)
            .with_context(|| format!("failed to load config from {}", cli.config))?,
    );

    if cli.check_config {
        println!("configuration ok: {}", cli.config);
        return Ok(());
    }

    utils::logging::init_tracing(&config.logging);
    info!("chatwork-lark bridge starting up");

    let redis_url = config.redis.connection_url()?;
    let redis = store::redis::RedisStore::connect(&redis_url).await?;
    let store = Arc::new(store::StoreManager::new(
        Arc::new(redis),
        Duration::from_secs(config.message.ttl_seconds),
        Duration::from_secs(config.message.mapping_ttl_seconds),
    ));

    let loader = Arc::new(mappings::MappingLoader::new(
        store.clone(),
        config.message.mapping_dir.clone(),
    ));
    let rooms = loader.load_all().await?;
    if rooms == 0 {
        error!("no active room mappings loaded; the bridge will forward nothing");
    }
    let refresh = Duration::from_secs(config.message.mapping_refresh_seconds);
    tokio::spawn(Arc::clone(&loader).run_refresh(refresh));

    let chatwork = Arc::new(chatwork::ChatworkClient::new(
        &config.chatwork,
        store.clone(),
    )?);
    let lark = Arc::new(lark::LarkClient::new(&config.lark)?);

    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        chatwork,
        lark,
        &config.message,
        &config.retry,
    ));

    let web_server = WebServer::new(config.clone(), engine, store)?;
    web_server.start().await?;

    info!("chatwork-lark bridge shutting down");
    Ok(())
}
