//! Intake desk - conversational routing for a patient messaging desk
//!
//! Routes each inbound message from the messaging gateway or web chat to
//! one of a closed set of capabilities, keeping multi-turn flows sticky
//! through persisted session locks.

mod api;
mod capability;
mod classifier;
mod config;
mod db;
mod llm;
mod router;

use api::{create_router, AppState};
use capability::CapabilityRegistry;
use classifier::IntentClassifier;
use config::Config;
use db::Database;
use llm::{build_service, LlmConfig};
use router::{DatabaseStorage, SystemClock, TurnRouter};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intake_desk=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env();

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    // Expiry is computed on read; this only tidies rows left behind
    let swept = db.sweep_expired_locks(chrono::Utc::now())?;
    tracing::info!(swept, "Cleared expired session locks");

    let llm = build_service(&LlmConfig::from_env());
    match &llm {
        Some(service) => tracing::info!(model = %service.model_id(), "Completion service configured"),
        None => tracing::warn!(
            "No completion service configured. Set ANTHROPIC_API_KEY or LLM_GATEWAY; \
             classification is keyword-only and capabilities will reply with the fallback."
        ),
    }

    let router = TurnRouter::new(
        DatabaseStorage::new(db.clone()),
        IntentClassifier::new(llm.clone()),
        CapabilityRegistry::from_llm(llm),
        Arc::new(SystemClock),
        config.routing,
    );
    let state = AppState::new(db, router, config.rate_limits);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(compression);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "Intake desk listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
