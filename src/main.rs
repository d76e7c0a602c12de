mod auth;
mod db;
mod error;
mod extract;
mod message;
mod middleware;
mod routes;
mod state;
mod user;
mod websocket;

use anyhow::Context;
use db::{create_pool, run_migrations};
use message::{InMemoryMessageStore, MessageStore, PgMessageStore};
use routes::create_router;
use state::{AppState, Config};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use user::{IdentityLookup, InMemoryUserDirectory, UserRepository};
use websocket::{InMemoryPresence, PresenceStore, RedisPresence};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hr_messaging=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env().context("invalid configuration")?;

    let (message_store, user_repository): (Arc<dyn MessageStore>, Arc<dyn IdentityLookup>) =
        match &config.database_url {
            Some(database_url) => {
                // Sanitize URL for logging (hide password)
                let url_for_logging = database_url
                    .rsplit('@')
                    .next()
                    .map(|host| format!("<hidden>@{}", host))
                    .unwrap_or_else(|| "<invalid format>".to_string());

                tracing::info!("Connecting to database at {}...", url_for_logging);
                let db = create_pool(database_url, config.database_max_connections)
                    .await
                    .context("failed to connect to database")?;

                tracing::info!("Running migrations...");
                run_migrations(&db).await.context("failed to run migrations")?;

                (
                    Arc::new(PgMessageStore::new(db.clone())),
                    Arc::new(UserRepository::new(db)),
                )
            }
            None => {
                tracing::warn!("DATABASE_URL not set, messages are kept in memory only");
                let directory = match &config.seed_users_file {
                    Some(path) => InMemoryUserDirectory::from_seed_file(path)
                        .await
                        .with_context(|| format!("failed to load {}", path.display()))?,
                    None => InMemoryUserDirectory::default(),
                };
                tracing::info!("Loaded {} users into the in-memory directory", directory.len());

                (Arc::new(InMemoryMessageStore::new()), Arc::new(directory))
            }
        };

    let presence: Arc<dyn PresenceStore> = match &config.redis_url {
        Some(redis_url) => Arc::new(
            RedisPresence::connect(redis_url, config.presence_ttl())
                .await
                .context("failed to connect to Redis")?,
        ),
        None => Arc::new(InMemoryPresence::new()),
    };

    let addr = config.bind_addr();
    let state = AppState::new(config, message_store, user_repository, presence);

    // Create router
    let app = create_router(state);

    tracing::info!("Server starting on http://{}", addr);
    tracing::info!("Swagger UI available at http://{}/swagger-ui", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
