use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use episodic::db::establish_connection_pool;
use episodic::embedding::{Embedder, EmbeddingEngine};
use episodic::index::VectorIndex;
use episodic::models::config::AppConfig;
use episodic::processing::backfill;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let pool = match establish_connection_pool(&config.database_url) {
        Ok(pool) => pool,
        Err(e) => {
            log::error!("Failed to establish database connection: {e}");
            std::process::exit(1);
        }
    };

    let engine = match EmbeddingEngine::new(config.model.clone()) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            log::error!("Failed to configure embedding engine: {e}");
            std::process::exit(1);
        }
    };

    let index = match VectorIndex::new(engine.dimension()) {
        Ok(index) => index,
        Err(e) => {
            log::error!("Failed to create vector index: {e}");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received; finishing in-flight batches");
            signal_cancel.cancel();
        }
    });

    match backfill::run(&pool, engine, &index, &config.backfill, cancel).await {
        Ok(report) => {
            if !report.failed.is_empty() {
                log::warn!(
                    "Backfill completed with {} failed rows: {:?}",
                    report.failed.len(),
                    report.failed.iter().map(|(id, _)| id).collect::<Vec<_>>()
                );
            }
        }
        Err(e) => {
            log::error!("Backfill failed: {e}");
            std::process::exit(1);
        }
    }
}
