// src/main.rs

use std::sync::Arc;
use std::time::Duration;

use exam_backend::config::{Config, StorageBackend};
use exam_backend::engine::{EngineOptions, ExamEngine, Stores};
use exam_backend::repository::memory::MemoryQuestionBank;
use exam_backend::repository::postgres::{PgStore, load_question_bank};
use exam_backend::routes;
use exam_backend::state::AppState;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load configuration from environment (.env included)
    let config = Config::from_env();

    let file_appender = tracing_appender::rolling::daily("logs", "exam.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::new(&config.rust_log);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(false);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    // Initialize Tracing (Logging)
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    let stores = match config.storage {
        StorageBackend::Postgres => postgres_stores(&config).await,
        StorageBackend::Memory => memory_stores(&config),
    };

    let engine = ExamEngine::new(stores, EngineOptions::from_config(&config));
    tracing::info!(
        "Exam engine ready ({} questions per exam, {} access policy)",
        engine.sequencer().plan_len(),
        engine.gate().policy_name()
    );

    let state = AppState {
        engine: Arc::new(engine),
        config: config.clone(),
    };

    // Create the Axum application router
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind {}: {}", config.bind_addr, e));
    tracing::info!("Listening on {}", config.bind_addr);

    // Start the server
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}

async fn postgres_stores(config: &Config) -> Stores {
    let database_url = config
        .database_url
        .as_deref()
        .expect("DATABASE_URL must be set when STORAGE=postgres");
    let pool = connect_with_retry(database_url).await;

    // Run Migrations Automatically
    tracing::info!("Running migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Migrations applied successfully.");

    let bank = load_question_bank(&pool)
        .await
        .expect("Failed to load question bank");

    Stores::postgres(PgStore::new(pool), bank)
}

fn memory_stores(config: &Config) -> Stores {
    let bank = match &config.question_bank_path {
        Some(path) => MemoryQuestionBank::from_json_file(path).expect("Failed to load question bank file"),
        None => {
            tracing::warn!("QUESTION_BANK_PATH not set, starting with an empty question bank");
            MemoryQuestionBank::default()
        }
    };
    tracing::warn!("Using in-memory storage; state is lost on restart");
    Stores::memory(bank)
}

/// Initialize Database Pool with Retry
async fn connect_with_retry(database_url: &str) -> PgPool {
    let mut retry_count = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                tracing::info!("Database connected...");
                return pool;
            }
            Err(e) => {
                retry_count += 1;
                if retry_count > 5 {
                    panic!("Failed to connect to database after 5 retries: {}", e);
                }
                tracing::warn!("Database not ready, retrying in 2s... (Attempt {})", retry_count);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
