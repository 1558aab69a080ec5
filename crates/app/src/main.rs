mod auth;
mod dashboard;
mod events;
mod fees;
mod payments;
mod problem;
mod router;
mod seed;
mod telemetry;
mod uploads;

use std::{net::SocketAddr, sync::Arc};

use chrono::Utc;
use chrono_tz::Tz;
use tracing::info;

use school_fees_blob::{BlobStore, HttpBlobStore, LocalBlobStore};
use school_fees_storage::Database;
use school_fees_util::{load_env_file, AppConfig, BlobConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let timezone: Tz = config
        .school_timezone
        .parse()
        .map_err(|err| format!("invalid SCHOOL_TIMEZONE: {err}"))?;

    let storage = Database::connect(&config.database_url).await?;
    storage.run_migrations().await?;
    if config.seed_demo && seed::seed_demo(&storage, Utc::now()).await? {
        info!(stage = "app", "demo data loaded");
    }

    let blobs = blob_store(&config.blob)?;

    let state = router::AppState::new(
        metrics,
        storage,
        blobs,
        &config.token_secret,
        timezone,
        config.receipt_max_bytes,
        config.events_heartbeat_secs,
    );

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        timezone = %timezone,
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}

fn blob_store(config: &BlobConfig) -> Result<Arc<dyn BlobStore>, reqwest::Error> {
    let store: Arc<dyn BlobStore> = match config {
        BlobConfig::Local {
            root,
            public_base_url,
        } => {
            info!(stage = "app", root = %root.display(), "using local receipt storage");
            Arc::new(LocalBlobStore::new(root.clone(), public_base_url))
        }
        BlobConfig::Http { api_url, token } => {
            info!(stage = "app", api = %api_url, "using remote receipt storage");
            let http = reqwest::Client::builder().build()?;
            Arc::new(HttpBlobStore::new(api_url.clone(), token.clone(), http))
        }
    };
    Ok(store)
}
