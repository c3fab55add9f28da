mod admin;
mod audio;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::artifact::ArtifactDir;
use crate::cache::{CacheStore, CachedItem};
use crate::config::PodtubeConfig;
use crate::queue::ConversionQueue;

pub use admin::{cache_form, cache_page, status, StatusReport, CACHE_PAGE_PATH};
pub use audio::{
    audio_head, parse_range_header, resolve_range, serve_audio, stream_audio, RangeResolution,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Everything request handlers share. Cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<ConversionQueue>,
    pub cache: Arc<CacheStore<CachedItem>>,
    pub artifacts: ArtifactDir,
    pub poll_interval: StdDuration,
    pub chunk_size: usize,
    /// Cancelled on shutdown; requests still waiting for a conversion answer 408.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        queue: Arc<ConversionQueue>,
        cache: Arc<CacheStore<CachedItem>>,
        artifacts: ArtifactDir,
        config: &PodtubeConfig,
    ) -> Self {
        Self {
            queue,
            cache,
            artifacts,
            poll_interval: config.conversion.poll_interval(),
            chunk_size: config.conversion.chunk_size_bytes,
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn router(state: AppState, audio_route_prefix: &str) -> Router {
    let audio_route = format!("{}/{{key}}", audio_route_prefix.trim_end_matches('/'));
    Router::new()
        .route(&audio_route, get(serve_audio).head(audio_head))
        .route(CACHE_PAGE_PATH, get(cache_page).post(cache_form))
        .route("/status", get(status))
        .with_state(state)
}

/// Serves until `state.shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    audio_route_prefix: &str,
) -> ServerResult<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let local = listener.local_addr()?;
    tracing::info!(target: "server", addr = %local, "listening");
    let shutdown = state.shutdown.clone();
    let app = router(state, audio_route_prefix);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!(target: "server", "server stopped");
    Ok(())
}
