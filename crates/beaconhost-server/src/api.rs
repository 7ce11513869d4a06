use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use beaconhost_core::{Event, EventLog, HostConfig};
use tracing::{debug, error, info, warn};

use crate::download::{download_headers, Download};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const TEXT_HTML: &str = "text/html; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HostConfig>,
    pub events: Arc<EventLog>,
}

impl AppState {
    pub fn new(config: HostConfig, events: EventLog) -> Self {
        Self {
            config: Arc::new(config),
            events: Arc::new(events),
        }
    }
}

/// Every request lands in [`dispatch`]; there are no per-path routes, so no
/// request can fall through to a framework error.
pub fn router(state: AppState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let route = request.uri().path().to_string();
    let raw_path = request
        .uri()
        .path_and_query()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| route.clone());

    let method = request.method().clone();
    match method {
        Method::GET => handle_get(&state, &route, raw_path, remote).await,
        Method::HEAD => handle_head(&state, &route).await,
        Method::POST => handle_beacon(&state, raw_path, remote, request).await,
        _ => ok_text(),
    }
}

async fn handle_get(state: &AppState, route: &str, raw_path: String, remote: String) -> Response {
    if route == "/health" {
        return ok_text();
    }
    if state.config.is_download_path(route) {
        return serve_download(state, raw_path, remote).await;
    }
    if route == "/" || route == "/index.html" {
        return landing_page(&state.config).await;
    }
    ok_text()
}

async fn handle_head(state: &AppState, route: &str) -> Response {
    if !state.config.is_download_path(route) {
        return StatusCode::OK.into_response();
    }

    match current_download(&state.config).await {
        Some((file, size)) => (
            StatusCode::OK,
            download_headers(&state.config, file, size),
        )
            .into_response(),
        None => not_found(),
    }
}

/// The configured download file and its size, if it is a regular file right now.
async fn current_download(config: &HostConfig) -> Option<(&Path, u64)> {
    let file = config.download_path()?;
    match tokio::fs::metadata(file).await {
        Ok(metadata) if metadata.is_file() => Some((file, metadata.len())),
        _ => None,
    }
}

async fn serve_download(state: &AppState, raw_path: String, remote: String) -> Response {
    let Some(file) = state.config.download_path() else {
        debug!(path = %raw_path, %remote, "download route disabled");
        return not_found();
    };

    let download = match Download::open(file).await {
        Ok(download) => download,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %raw_path, %remote, file = %file.display(), "download file missing");
            return not_found();
        }
        Err(err) => {
            warn!(file = %file.display(), error = %err, "failed to open download");
            return not_found();
        }
    };

    let headers = download_headers(&state.config, file, download.size);
    let events = state.events.clone();
    let body = download.into_body(move |sent| {
        tokio::spawn(record(events, Event::download(raw_path, remote, sent)));
    });

    (StatusCode::OK, headers, body).into_response()
}

async fn handle_beacon(
    state: &AppState,
    raw_path: String,
    remote: String,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let user_agent = parts
        .headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let raw = match read_declared_body(&parts.headers, body).await {
        Ok(raw) => raw,
        Err(err) => {
            // Peer went away mid-body; nothing complete to record.
            debug!(path = %raw_path, %remote, error = %err, "beacon body read aborted");
            return ok_text();
        }
    };

    record(state.events.clone(), Event::beacon(raw_path, remote, user_agent, &raw)).await;
    ok_text()
}

/// Length declared by the client; absent or unparsable counts as zero.
pub fn declared_length(headers: &HeaderMap) -> usize {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0)
}

async fn read_declared_body(headers: &HeaderMap, body: Body) -> Result<Bytes, axum::Error> {
    let declared = declared_length(headers);
    if declared == 0 {
        return Ok(Bytes::new());
    }
    axum::body::to_bytes(body, declared).await
}

async fn record(events: Arc<EventLog>, event: Event) {
    let kind = event.kind();
    let path = event.path().to_string();
    let remote = event.remote().to_string();

    match tokio::task::spawn_blocking(move || events.record(event)).await {
        Ok(Ok(record)) => info!(%kind, %path, %remote, ts = record.ts, "event recorded"),
        Ok(Err(err)) => error!(%kind, %path, %remote, error = %err, "failed to record event"),
        Err(err) => error!(%kind, %path, error = %err, "event log task failed"),
    }
}

async fn landing_page(config: &HostConfig) -> Response {
    let html = if current_download(config).await.is_some() {
        format!(
            "<!doctype html><meta charset='utf-8'><title>LockerSim host</title>\
             <p>Server up. <a href='{}'>Download APK</a></p>",
            config.route
        )
    } else {
        "<!doctype html><meta charset='utf-8'><p>Server up.</p>".to_string()
    };
    (StatusCode::OK, [(CONTENT_TYPE, TEXT_HTML)], html).into_response()
}

fn ok_text() -> Response {
    (StatusCode::OK, [(CONTENT_TYPE, TEXT_PLAIN)], "ok").into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [(CONTENT_TYPE, TEXT_PLAIN)],
        "download not available",
    )
        .into_response()
}
