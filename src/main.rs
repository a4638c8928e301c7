use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vive_mundial_points::api::latency::LatencyStats;
use vive_mundial_points::api::routes::{router, ApiState};
use vive_mundial_points::config::{Config, CHANNEL_CAPACITY};
use vive_mundial_points::db::Db;
use vive_mundial_points::error::Result;
use vive_mundial_points::types::PointsEvent;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let db = Db::connect(&cfg).await?;
    info!(
        "Database ready at {} (max_connections={}, busy_timeout={}ms)",
        cfg.db_path, cfg.db_max_connections, cfg.db_busy_timeout_ms,
    );
    if cfg.welcome_bonus > 0 {
        info!("New users receive a welcome bonus of {} points", cfg.welcome_bonus);
    }

    // --- Post-commit notifications ---
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move { event_consumer(event_rx).await });

    // HTTP API server
    let latency = Arc::new(LatencyStats::new()?);
    let api_state = ApiState::new(db, cfg.welcome_bonus, latency, event_tx);
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Consumes committed point movements and logs them for the notification feed.
async fn event_consumer(mut rx: mpsc::Receiver<PointsEvent>) {
    while let Some(event) = rx.recv().await {
        match &event {
            PointsEvent::TaskCompleted { task_id, chat_id, completer_id, reward } => info!(
                event = event.name(),
                task_id = %task_id,
                chat_id = %chat_id,
                user_id = %completer_id,
                reward = reward,
                "TASK DONE    | task {task_id} in chat {chat_id} | +{reward} to user {completer_id}",
            ),
            PointsEvent::QuinielaJoined { instance_id, chat_id, user_id, stake } => info!(
                event = event.name(),
                instance_id = %instance_id,
                chat_id = %chat_id,
                user_id = %user_id,
                stake = stake,
                "QUINIELA IN  | instance {instance_id} in chat {chat_id} | user {user_id} staked {stake}",
            ),
            PointsEvent::QuinielaFinalized { instance_id, chat_id, result, winner_count, total_paid } => info!(
                event = event.name(),
                instance_id = %instance_id,
                chat_id = %chat_id,
                winners = winner_count,
                total_paid = total_paid,
                "QUINIELA END | instance {instance_id} in chat {chat_id} | result: {result} | winners: {winner_count} | paid: {total_paid}",
            ),
            PointsEvent::ItemPurchased { user_id, item_id, price } => info!(
                event = event.name(),
                user_id = %user_id,
                item_id = %item_id,
                price = price,
                "SHOP BUY     | user {user_id} bought item {item_id} for {price}",
            ),
            PointsEvent::ItemEquipped { user_id, item_id } => match item_id {
                Some(item_id) => info!(
                    event = event.name(),
                    user_id = %user_id,
                    item_id = %item_id,
                    "SHOP EQUIP   | user {user_id} equipped item {item_id}",
                ),
                None => info!(
                    event = event.name(),
                    user_id = %user_id,
                    "SHOP EQUIP   | user {user_id} reset to default icon",
                ),
            },
        }
    }
}
