use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use liblivefeed::{FileTailSource, IdentityStore, PollRegistry, SqliteIdentityStore};

use crate::config::ServerConfig;
use crate::stream;

pub struct AppState {
    pub identity: Arc<dyn IdentityStore>,
    pub notes: Arc<FileTailSource>,
    pub tasks: Arc<PollRegistry>,
    /// Parent of every source loop and stream session.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build the shared sources and start tailing the notes file.
    pub fn start(
        config: &ServerConfig,
        identity: Arc<dyn IdentityStore>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let notes = FileTailSource::new(config.tail_config());
        tokio::spawn(Arc::clone(&notes).run(shutdown.child_token()));

        let tasks = PollRegistry::new(
            config.poll_config(),
            config.max_active_users,
            shutdown.child_token(),
        )
        .context("failed to build task API client")?;

        Ok(Arc::new(Self {
            identity,
            notes,
            tasks,
            shutdown,
        }))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stream", get(stream::stream_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "file": state.notes.current_status(),
        "active_pollers": state.tasks.active_users(),
    }))
}

/// Serve until `state.shutdown` is cancelled. Open streams end when their
/// sessions observe the cancellation.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("http server failed")
}

pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let store = SqliteIdentityStore::open(&config.database_path).with_context(|| {
        format!(
            "failed to open identity store {}",
            config.database_path.display()
        )
    })?;
    let state = AppState::start(&config, Arc::new(store), shutdown)?;

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(
        addr = %config.listen,
        csv = %config.csv_path.display(),
        api = %config.api_url,
        tick_ms = config.tick_ms,
        "livefeed listening"
    );

    serve(listener, state).await?;
    info!("livefeed stopped");
    Ok(())
}
