//! Main Entrypoint for the Tutor API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the database connection pool, running migrations and
//!    seeding an empty curriculum.
//! 3. Building the session engine over the database and the language model.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server, the idle-session sweeper, and handling
//!    graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use chrono::Utc;
use sqlx::PgPool;
use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tutor_api::{config::Config, db::Db, router::create_router, state::AppState};
use tutor_core::{
    SessionEngine,
    curriculum::{CurriculumDocument, CurriculumStore, import_document},
    llm_client::OpenAICompatibleClient,
    prompt::PromptTemplates,
};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// Built-in templates, with any `<key>.md` files in `prompts_path` layered on top.
fn load_prompts(prompts_path: &Path) -> anyhow::Result<PromptTemplates> {
    if !prompts_path.is_dir() {
        info!(path = %prompts_path.display(), "No prompt directory; using built-in templates");
        return Ok(PromptTemplates::default());
    }
    PromptTemplates::load_dir(prompts_path).context("Failed to load prompt templates")
}

/// Imports the seed document when the curriculum tables are empty.
async fn seed_curriculum(db: &Db, seed_path: &Path) -> anyhow::Result<()> {
    if !db.is_curriculum_empty().await? {
        info!("Curriculum already present; skipping seed");
        return Ok(());
    }
    let raw = std::fs::read_to_string(seed_path)
        .with_context(|| format!("Failed to read seed file {}", seed_path.display()))?;
    let document: CurriculumDocument =
        serde_json::from_str(&raw).context("Seed file is not a valid curriculum document")?;
    let counts = import_document(db as &dyn CurriculumStore, document).await?;
    info!(
        lectures = counts.lectures,
        topics = counts.topics,
        subtopics = counts.subtopics,
        "Seeded curriculum"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Database ---
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let db = Arc::new(Db::new(pool));
    db.run_migrations().await?;
    info!("Database connection established and migrations are up-to-date.");

    if let Some(seed_path) = &config.curriculum_seed_path {
        seed_curriculum(&db, seed_path).await?;
    }

    // --- 4. Initialize the Engine ---
    let templates = load_prompts(&config.prompts_path)?;
    let openai_config = OpenAIConfig::new()
        .with_api_key(&config.openai_api_key)
        .with_api_base(&config.openai_api_base);
    let model = Arc::new(
        OpenAICompatibleClient::new(openai_config, config.chat_model.clone())
            .with_sampling(config.max_tokens, config.temperature),
    );

    let engine = Arc::new(SessionEngine::new(
        config.engine.clone(),
        db.clone(),
        db.clone(),
        model,
        templates,
    ));
    match engine.resume_note_jobs().await {
        Ok(0) => {}
        Ok(resumed) => info!(resumed, "Resumed pending note generation"),
        Err(e) => warn!("Failed to resume pending notes: {}", e),
    }

    let app_state = Arc::new(AppState {
        engine: engine.clone(),
        curriculum: db.clone(),
    });

    // Abandons sessions that have been idle past the inactivity timeout.
    let sweeper = {
        let engine = engine.clone();
        let period = Duration::from_secs(config.sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match engine.expire_idle_sessions(Utc::now()).await {
                    Ok(0) => {}
                    Ok(expired) => info!(expired, "Abandoned idle sessions"),
                    Err(e) => warn!("Idle session sweep failed: {}", e),
                }
            }
        })
    };

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        model = %config.chat_model,
        api_base = %config.openai_api_base,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    info!("Waiting for pending note generation...");
    engine.drain_note_jobs().await;

    info!("Server has shut down.");
    Ok(())
}
