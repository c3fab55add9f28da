use std::io::SeekFrom;
use std::path::Path;

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use super::AppState;
use crate::artifact::ArtifactDir;
use crate::cache::VIDEO_LINKS;
use crate::queue::WaitOutcome;

const AUDIO_MPEG: &str = "audio/mpeg";

/// Outcome of matching a `Range` request against a file of known size.
/// Partial spans are half-open: `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeResolution {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parses a single `bytes=` range into `(start, end)` with an exclusive end.
/// A suffix range `-N` becomes a negative start. Anything else is `None`.
pub fn parse_range_header(value: &str) -> Option<(Option<i64>, Option<u64>)> {
    let (unit, ranges) = value.trim().split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let (start, end) = ranges.trim().split_once('-')?;
    let start = parse_bound(start)?;
    let end = parse_bound(end)?;
    match (start, end) {
        (None, None) => None,
        (None, Some(0)) => Some((None, Some(0))),
        (None, Some(suffix)) => Some((Some(-(suffix as i64)), None)),
        (Some(start), end) => Some((Some(start as i64), end.map(|end| end + 1))),
    }
}

// Empty means "unbounded"; a non-number invalidates the whole header.
fn parse_bound(text: &str) -> Option<Option<u64>> {
    let text = text.trim();
    if text.is_empty() {
        return Some(None);
    }
    text.parse::<u64>().ok().filter(|value| *value <= i64::MAX as u64).map(Some)
}

pub fn resolve_range(range: Option<(Option<i64>, Option<u64>)>, size: u64) -> RangeResolution {
    let Some((start, end)) = range else {
        return RangeResolution::Full;
    };
    if start.is_some_and(|start| start >= 0 && start as u64 >= size) || end == Some(0) {
        return RangeResolution::Unsatisfiable;
    }
    let start = match start {
        Some(start) if start < 0 => size.saturating_sub(start.unsigned_abs()),
        Some(start) => start as u64,
        None => 0,
    };
    let end = end.map_or(size, |end| end.min(size));
    if end <= start {
        // Inverted ranges are syntactically invalid; serve as if absent.
        return RangeResolution::Full;
    }
    if start == 0 && end == size {
        return RangeResolution::Full;
    }
    RangeResolution::Partial { start, end }
}

pub async fn serve_audio(
    State(state): State<AppState>,
    AxumPath(key): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    stream_audio(&state, &key, &headers).await
}

pub async fn audio_head(AxumPath(_key): AxumPath<String>) -> Response {
    (
        StatusCode::OK,
        [
            (header::ACCEPT_RANGES, "bytes"),
            (header::CONTENT_TYPE, AUDIO_MPEG),
        ],
    )
        .into_response()
}

/// Serves the artifact for `key`, converting it first when necessary.
///
/// The wait ends early only through `state.shutdown`; a client that goes
/// away simply drops this future, which leaves the conversion running.
pub async fn stream_audio(state: &AppState, key: &str, headers: &HeaderMap) -> Response {
    if !ArtifactDir::is_valid_key(key) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    tracing::info!(target: "audio", key = %key, "audio requested");
    if let Some(response) = verdict_response(state, key) {
        return response;
    }

    let path = state.artifacts.artifact_path(key);
    if !file_exists(&path).await {
        if state.queue.enqueue(key) {
            tracing::debug!(target: "audio", key = %key, "queued for conversion");
        }
        let mut watch = WaitWatch::new(key);
        let outcome = state
            .queue
            .wait_until_done(key, state.poll_interval, state.shutdown.cancelled())
            .await;
        watch.finished = true;
        if outcome == WaitOutcome::Cancelled {
            return StatusCode::REQUEST_TIMEOUT.into_response();
        }
        if let Some(response) = verdict_response(state, key) {
            return response;
        }
        if !file_exists(&path).await {
            tracing::warn!(target: "audio", key = %key, "conversion produced no audio");
            return StatusCode::NOT_FOUND.into_response();
        }
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_range_header);
    match open_span(&path, range, state.chunk_size).await {
        Ok(response) => response,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => {
            tracing::error!(target: "audio", key = %key, error = %err, "failed to open audio");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn verdict_response(state: &AppState, key: &str) -> Option<Response> {
    let item = state.cache.get(VIDEO_LINKS, key)?;
    let verdict = item.as_verdict()?;
    tracing::info!(target: "audio", key = %key, kind = %verdict.kind, "audio unavailable");
    let status =
        StatusCode::from_u16(verdict.kind.http_status()).unwrap_or(StatusCode::NOT_FOUND);
    Some(status.into_response())
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn open_span(
    path: &Path,
    range: Option<(Option<i64>, Option<u64>)>,
    chunk_size: usize,
) -> std::io::Result<Response> {
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();
    let (status, start, end) = match resolve_range(range, size) {
        RangeResolution::Unsatisfiable => {
            return Ok((
                StatusCode::RANGE_NOT_SATISFIABLE,
                [
                    (header::CONTENT_TYPE, AUDIO_MPEG.to_string()),
                    (header::CONTENT_RANGE, format!("bytes */{size}")),
                ],
            )
                .into_response());
        }
        RangeResolution::Full => (StatusCode::OK, 0, size),
        RangeResolution::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end),
    };
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }
    let length = end - start;
    let body = Body::from_stream(ReaderStream::with_capacity(file.take(length), chunk_size));
    let mut response = (
        status,
        [
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (header::CONTENT_TYPE, AUDIO_MPEG.to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
        ],
        body,
    )
        .into_response();
    if status == StatusCode::PARTIAL_CONTENT {
        if let Ok(value) = format!("bytes {}-{}/{size}", start, end - 1).parse() {
            response.headers_mut().insert(header::CONTENT_RANGE, value);
        }
    }
    Ok(response)
}

/// Logs when a waiting request is dropped before its conversion finished.
struct WaitWatch<'a> {
    key: &'a str,
    finished: bool,
}

impl<'a> WaitWatch<'a> {
    fn new(key: &'a str) -> Self {
        Self {
            key,
            finished: false,
        }
    }
}

impl Drop for WaitWatch<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!(target: "audio", key = %self.key, "client left while waiting for conversion");
        }
    }
}
