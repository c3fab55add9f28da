use std::sync::Arc;

use axum::body::to_bytes;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use chrono::{Duration, Utc};
use podtube_core::server::{audio_head, stream_audio};
use podtube_core::{
    AppState, ArtifactCacheItem, ArtifactDir, AvailabilityVerdict, CacheStore, ConversionQueue,
    PodtubeConfig, UnavailableKind, AUDIO_FILES, VIDEO_LINKS,
};
use tempfile::TempDir;

fn state_with_file(dir: &TempDir) -> (AppState, Vec<u8>) {
    let mut config = PodtubeConfig::default();
    config.conversion.chunk_size_bytes = 64;
    let artifacts = ArtifactDir::new(dir.path());
    let content: Vec<u8> = (0..1000u32).map(|value| (value % 251) as u8).collect();
    std::fs::write(artifacts.artifact_path("abc"), &content).unwrap();
    let state = AppState::new(
        Arc::new(ConversionQueue::new()),
        Arc::new(CacheStore::new()),
        artifacts,
        &config,
    );
    (state, content)
}

async fn get(state: &AppState, range: Option<&'static str>) -> Response {
    let mut headers = HeaderMap::new();
    if let Some(range) = range {
        headers.insert(header::RANGE, HeaderValue::from_static(range));
    }
    stream_audio(state, "abc", &headers).await
}

fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

#[tokio::test]
async fn full_range_is_served_as_ok() {
    let dir = TempDir::new().unwrap();
    let (state, content) = state_with_file(&dir);

    let response = get(&state, Some("bytes=0-999")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_LENGTH), Some("1000"));
    assert_eq!(header_str(&response, header::CONTENT_TYPE), Some("audio/mpeg"));
    assert_eq!(header_str(&response, header::ACCEPT_RANGES), Some("bytes"));
    assert!(response.headers().get(header::CONTENT_RANGE).is_none());
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), content.as_slice());
}

#[tokio::test]
async fn open_ended_range_is_partial() {
    let dir = TempDir::new().unwrap();
    let (state, content) = state_with_file(&dir);

    let response = get(&state, Some("bytes=500-")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header_str(&response, header::CONTENT_RANGE),
        Some("bytes 500-999/1000")
    );
    assert_eq!(header_str(&response, header::CONTENT_LENGTH), Some("500"));
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), &content[500..]);
}

#[tokio::test]
async fn suffix_and_bounded_ranges() {
    let dir = TempDir::new().unwrap();
    let (state, content) = state_with_file(&dir);

    let response = get(&state, Some("bytes=-100")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header_str(&response, header::CONTENT_RANGE),
        Some("bytes 900-999/1000")
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), &content[900..]);

    let response = get(&state, Some("bytes=100-199")).await;
    assert_eq!(
        header_str(&response, header::CONTENT_RANGE),
        Some("bytes 100-199/1000")
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), &content[100..200]);
}

#[tokio::test]
async fn unsatisfiable_ranges() {
    let dir = TempDir::new().unwrap();
    let (state, _content) = state_with_file(&dir);

    for range in ["bytes=1000-", "bytes=-0"] {
        let response = get(&state, Some(range)).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{range}");
        assert_eq!(
            header_str(&response, header::CONTENT_RANGE),
            Some("bytes */1000")
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }
}

#[tokio::test]
async fn malformed_range_is_ignored() {
    let dir = TempDir::new().unwrap();
    let (state, _content) = state_with_file(&dir);

    let response = get(&state, Some("bytes=abc")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.len(), 1000);
}

#[tokio::test]
async fn existing_file_skips_the_queue() {
    let dir = TempDir::new().unwrap();
    let (state, _content) = state_with_file(&dir);
    let response = get(&state, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(state.queue.is_empty());
}

#[tokio::test]
async fn verdict_wins_over_existing_file() {
    let dir = TempDir::new().unwrap();
    let (state, _content) = state_with_file(&dir);
    state.cache.set(
        VIDEO_LINKS,
        "abc",
        AvailabilityVerdict::new(
            UnavailableKind::Private,
            "Private video",
            Utc::now() + Duration::hours(1),
        )
        .into(),
    );
    assert_eq!(get(&state, None).await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn head_only_advertises_headers() {
    let response = audio_head(axum::extract::Path("abc".to_string())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::ACCEPT_RANGES), Some("bytes"));
    assert_eq!(header_str(&response, header::CONTENT_TYPE), Some("audio/mpeg"));
}

#[tokio::test]
async fn sweep_at_expiry_deletes_artifact() {
    let dir = TempDir::new().unwrap();
    let (state, _content) = state_with_file(&dir);
    let path = state.artifacts.artifact_path("abc");
    let expire = Utc::now() + Duration::minutes(5);
    state.cache.set(
        AUDIO_FILES,
        "abc",
        ArtifactCacheItem::new(&path, expire).into(),
    );

    assert!(state.cache.sweep_expired(expire - Duration::seconds(1)).is_empty());
    assert!(state.cache.get(AUDIO_FILES, "abc").is_some());
    assert!(path.exists());

    let removed = state.cache.sweep_expired(expire);
    assert_eq!(removed.get(AUDIO_FILES), Some(&1));
    assert!(state.cache.get(AUDIO_FILES, "abc").is_none());
    assert!(!path.exists());

    // Without a worker the request can only wait; shutdown ends it.
    state.shutdown.cancel();
    assert_eq!(get(&state, None).await.status(), StatusCode::REQUEST_TIMEOUT);
    assert!(state.queue.is_queued("abc"));
}
