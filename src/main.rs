//! Rugpull Game Server
//!
//! Runs the crash loop, the candleflip lobby and the WebSocket server.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rugpull::{
    config::ServerConfig,
    ledger::{self, LoggingPayout},
    network::{game_loop, AppContext, GameServer},
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rugpull=info")),
        )
        .init();

    let config = ServerConfig::from_env();
    info!("Rugpull Server v{}", VERSION);
    info!(
        "Crash tick {:?}, countdown {:?}; candleflip tick {:?}, max {} rooms",
        config.crash.tick_interval,
        config.crash.countdown,
        config.candleflip.tick_interval,
        config.candleflip.max_rooms
    );

    let persistence = ledger::open_persistence(config.ledger_dir.as_deref()).await;

    let ctx = AppContext::start(config, persistence, Arc::new(LoggingPayout));
    ctx.warm_up().await;

    let server = Arc::new(GameServer::new(ctx.clone()));
    let crash = tokio::spawn(game_loop::run_crash_loop(ctx.clone(), server.shutdown_signal()));
    let lobby = tokio::spawn(game_loop::run_rooms_broadcaster(ctx.clone(), server.shutdown_signal()));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            signal_server.shutdown();
        }
    });

    server.run().await.context("game server")?;

    let _ = crash.await;
    let _ = lobby.await;
    info!("Shut down cleanly");
    Ok(())
}
