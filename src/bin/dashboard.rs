use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use eyre::Result;

use tepantlatia_ingest::dashboard::{router, DashboardState};
use tepantlatia_ingest::store::{QueueTuning, Store};
use tepantlatia_ingest::store_mongo::MongoStore;

#[derive(Parser, Debug)]
#[command(name = "tepantlatia-dashboard", version, about = "Read-only ingestion panel")]
struct Args {
    #[arg(long, env = "STORE_URI")]
    store_uri: String,

    #[arg(long, env = "DB_NAME", default_value = "tepantlatia_db")]
    db_name: String,

    /// Listen address.
    #[arg(long, env = "DASHBOARD_BIND", default_value = "0.0.0.0:8000")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // The panel never mutates queue timing state, so default tuning is fine.
    let store =
        MongoStore::connect_with_backoff(&args.store_uri, &args.db_name, QueueTuning::default())
            .await;
    let store: Arc<dyn Store> = Arc::new(store);

    let app = router(DashboardState { store });
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "dashboard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
