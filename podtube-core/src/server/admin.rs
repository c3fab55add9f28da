use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use axum::extract::{Query, State};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::{Form, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AppState;
use crate::cache::NamespaceSnapshot;
use crate::queue::QueueEntry;

pub const CACHE_PAGE_PATH: &str = "/youtube/cache/";

const ALL: &str = "ALL";
const NONE: &str = "NONE";

pub async fn cache_page(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    handle_cache_request(&state, &params)
}

pub async fn cache_form(
    State(state): State<AppState>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    handle_cache_request(&state, &params)
}

fn handle_cache_request(state: &AppState, params: &HashMap<String, String>) -> Response {
    let snapshot = state.cache.snapshot();
    let requests: Vec<(&str, &str)> = snapshot
        .iter()
        .filter_map(|namespace| {
            params
                .get(&namespace.name)
                .map(|value| (namespace.name.as_str(), value.as_str()))
        })
        .filter(|(_, value)| *value != NONE)
        .collect();
    if requests.is_empty() {
        return Html(render_cache_page(&snapshot)).into_response();
    }

    for (namespace, value) in requests {
        if value == ALL {
            let removed = state.cache.remove_all(namespace);
            tracing::info!(target: "cache_admin", namespace = %namespace, removed, "cleared namespace");
        } else {
            let removed = state.cache.remove(namespace, value);
            tracing::info!(target: "cache_admin", namespace = %namespace, key = %value, removed, "cleared item");
        }
    }
    Redirect::to(CACHE_PAGE_PATH).into_response()
}

fn render_cache_page(snapshot: &[NamespaceSnapshot]) -> String {
    let mut page = String::from(
        "<html><head><title>PodTube cache</title></head><body>\
         <label>Clear cache</label><br/><br/><form method='POST'>",
    );
    for namespace in snapshot {
        let name = escape_html(&namespace.name);
        let caption = escape_html(&namespace.name.to_lowercase().replace('_', " "));
        let _ = write!(
            page,
            "<label for='{name}'>Cached {caption}: </label><select id='{name}' name='{name}'>\
             <option value='{NONE}' selected>{NONE}</option><option value='{ALL}'>{ALL}</option>"
        );
        for entry in &namespace.entries {
            let caption = entry.label.as_deref().unwrap_or(&entry.key);
            let _ = write!(
                page,
                "<option value='{}'>{} (expires {})</option>",
                escape_html(&entry.key),
                escape_html(caption),
                entry.expire.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        page.push_str("</select><br/><br/>");
    }
    page.push_str(
        "<input type='submit' value='CLEAR SELECTED CACHE' /></form><br/></body></html>",
    );
    page
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub queue: Vec<QueueEntry>,
    pub cache: BTreeMap<String, usize>,
}

pub async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    let cache = state
        .cache
        .namespaces()
        .into_iter()
        .map(|name| {
            let count = state.cache.len(&name);
            (name, count)
        })
        .collect();
    Json(StatusReport {
        generated_at: Utc::now(),
        queue: state.queue.snapshot(),
        cache,
    })
}
