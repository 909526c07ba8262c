use anyhow::Result;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use swe_bridge::config::Config;
use swe_bridge::dashboard::dashboard_router;
use swe_bridge::dedupe::CommentDeduper;
use swe_bridge::executor::Executor;
use swe_bridge::provider::Provider;
use swe_bridge::webhook::webhook_router;
use swe_bridge::{AppState, Dispatcher, GitHubClient, TaskStore};

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "swe-bridge"
    })))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting swe-bridge");

    let config =
        Config::from_env().expect("Failed to load configuration from environment variables");

    let github_client = Arc::new(GitHubClient::new(
        config.github_app_id,
        config.github_private_key.clone(),
    ));

    info!("Using task database: {}", config.taskstore_db_path.display());
    let store = TaskStore::open(&config.taskstore_db_path)
        .await
        .expect("Failed to initialize task database");

    let provider = Arc::new(Provider::from_config(&config));
    info!("Provider selected: {}", provider.name());

    let executor = Arc::new(Executor::new(
        github_client.clone(),
        provider,
        store.clone(),
        &config,
    ));

    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::start(
        config.dispatcher.clone(),
        executor,
        shutdown.clone(),
    ));

    let app_state = Arc::new(AppState {
        github_client,
        store,
        dispatcher: dispatcher.clone(),
        webhook_secret: config.github_webhook_secret.clone(),
        trigger_keyword: config.trigger_keyword.clone(),
        allow_all_users: config.allow_all_users,
        issue_deduper: CommentDeduper::default(),
        review_deduper: CommentDeduper::default(),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(webhook_router(app_state.clone()))
        .merge(dashboard_router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state.clone());

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Stop intake and let in-flight tasks reach a git-command boundary
    dispatcher.shutdown().await;

    Ok(())
}
