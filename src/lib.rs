pub mod analytics;
pub mod audit;
pub mod auth;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod db;
pub mod doc_processor;
pub mod export;
pub mod llm;
pub mod session;
pub mod settings;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use commands::{create_router, AppState};
pub use config::Config;
pub use db::{Database, MemoryStore, Store};
pub use llm::{ChatBackend, ProviderRouter};
pub use session::ChatSession;

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("chat_box_lib={0},chat_box={0}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store: Arc<dyn Store> = Arc::new(Database::new(&config.data_dir)?);
    tracing::info!("Using database in {}", config.data_dir.display());

    let providers = Arc::new(ProviderRouter::from_config(&config));
    if providers.available_models().is_empty() {
        tracing::warn!("No provider API keys configured; chat requests will fail");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let state = AppState::new(config, store, providers.clone(), providers);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("chat-box listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
