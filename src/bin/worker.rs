use std::sync::Arc;

use clap::Parser;
use eyre::Result;
use tokio::sync::watch;

use tepantlatia_ingest::config::{IngestConfig, WorkerArgs};
use tepantlatia_ingest::embedder::OpenAiEmbedder;
use tepantlatia_ingest::fetcher::HttpFetcher;
use tepantlatia_ingest::scheduler::Worker;
use tepantlatia_ingest::seeder;
use tepantlatia_ingest::store::Store;
use tepantlatia_ingest::store_mongo::MongoStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = WorkerArgs::parse();
    let cfg = IngestConfig::from_args(&args)?;

    let store = MongoStore::connect_with_backoff(&args.store_uri, &cfg.db_name, cfg.tuning()).await;
    let store: Arc<dyn Store> = Arc::new(store);

    tracing::info!(
        db = %cfg.db_name,
        primary_url_base = %cfg.primary_url_base,
        w_primary = cfg.w_primary,
        w_secondary = cfg.w_secondary,
        vector_range_only = cfg.vector_range_only,
        seed = cfg.seed_primary_queue,
        drain = cfg.drain,
        "worker starting"
    );

    if cfg.seed_primary_queue {
        let inserted = seeder::run(store.as_ref(), seeder::SEED_BLOCKS).await?;
        tracing::info!(inserted, "seeding pass finished");
    }

    let fetcher = Arc::new(HttpFetcher::new(cfg.primary_timeout)?);
    let embedder =
        Arc::new(OpenAiEmbedder::new(args.embed_api_key.clone(), cfg.embed_model.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut worker = Worker::new(store, fetcher, embedder, Arc::new(cfg));
    worker.run(shutdown_rx).await
}
