// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// HTTP surface.
//
// Responsibilities:
// - POST /v1/chat/completions: credential lookup, upstream dispatch,
//   streaming transcode or non-streaming aggregation, request logging
// - GET /images/{encoded}: proxied asset bytes
// - Batch admin: start/observe/cancel credential refresh tasks
// - GET /admin/stats: request statistics
// - Heartbeat and model listing

use crate::assets::decode_asset_path;
use crate::batch::{
    run_in_batches, task_sse_stream, BatchItem, ItemOutcome, TaskEvent, TaskRegistry,
    DEFAULT_EXPIRY,
};
use crate::logs::{RequestLogEntry, RequestLogStore};
use crate::openai;
use crate::progress::{ProgressPatch, RefreshProgressStore};
use crate::settings::{SettingsBundle, SettingsStore, StoreError};
use crate::transcode::{
    collect_completion, AssetContext, FinishHook, Transcoder, TranscodeError, TranscodeOptions,
};
use crate::upstream::{Credential, TokenPool, UpstreamClient, UpstreamError, UpstreamRequest};
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;

/// Models advertised by `GET /v1/models`.
pub const ADVERTISED_MODELS: &[&str] = &["grok-3", "grok-3-mini", "grok-4", "grok-4-heavy"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors the HTTP surface maps to responses.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("request body is empty")]
    EmptyBody,

    #[error("request body is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("no credential available for model \"{0}\"")]
    NoCredential(String),

    #[error("unknown task \"{0}\"")]
    UnknownTask(String),

    #[error("invalid asset path")]
    BadAssetPath,

    #[error(transparent)]
    Settings(#[from] StoreError),

    #[error(transparent)]
    Db(#[from] crate::db::DbError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("upstream rejected the request with status {0}")]
    UpstreamStatus(u16),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::EmptyBody
            | GatewayError::MalformedJson(_)
            | GatewayError::BadAssetPath => StatusCode::BAD_REQUEST,
            GatewayError::NoCredential(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UnknownTask(_) => StatusCode::NOT_FOUND,
            GatewayError::Settings(_) | GatewayError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) | GatewayError::UpstreamStatus(_) => StatusCode::BAD_GATEWAY,
        };
        let body = serde_json::json!({ "error": { "message": self.to_string() } });
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Shared state injected into axum handlers. Every collaborator sits
/// behind an `Arc`; handlers never construct clients or pools.
#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<dyn UpstreamClient>,
    pub tokens: Arc<dyn TokenPool>,
    pub settings: Arc<SettingsStore>,
    pub logs: Arc<RequestLogStore>,
    pub progress: Arc<RefreshProgressStore>,
    pub tasks: Arc<TaskRegistry>,
}

/// Build the axum router with all gateway routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/heartbeat", get(heartbeat))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/images/:encoded", get(proxy_asset))
        .route("/admin/tokens/refresh", post(start_refresh))
        .route("/admin/tokens/refresh/progress", get(refresh_progress))
        .route("/admin/tasks/:id/events", get(task_events))
        .route("/admin/tasks/:id/cancel", post(cancel_task))
        .route("/admin/stats", get(stats))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Chat completions
// ---------------------------------------------------------------------------

/// The fields the gateway itself needs; the rest of the body is
/// forwarded to the upstream untouched.
#[derive(Debug, Deserialize)]
struct ChatRequest {
    model: Option<String>,
    #[serde(default)]
    stream: bool,
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    if body.is_empty() {
        return Err(GatewayError::EmptyBody);
    }
    let raw: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| GatewayError::MalformedJson(e.to_string()))?;
    let request: ChatRequest = serde_json::from_value(raw.clone())
        .map_err(|e| GatewayError::MalformedJson(e.to_string()))?;

    let model = request.model.unwrap_or_else(|| "grok-3".to_string());
    let settings = state.settings.load().await?;

    let credential = state
        .tokens
        .lookup(&model)
        .ok_or_else(|| GatewayError::NoCredential(model.clone()))?;

    let upstream_response = state
        .upstream
        .chat_stream(UpstreamRequest {
            model: model.clone(),
            body: raw,
            credential: credential.clone(),
            cf_clearance_cookie: settings.grok.cf_clearance_cookie(),
        })
        .await?;

    let log_context = LogContext {
        logs: Arc::clone(&state.logs),
        ip: client_ip(&headers),
        model: model.clone(),
        key_name: credential.key_name.clone(),
        token_suffix: credential.token_suffix(),
    };

    if upstream_response.status >= 400 {
        tracing::warn!(
            model = %model,
            status = upstream_response.status,
            "upstream rejected chat request"
        );
        log_context.write(
            502,
            0.0,
            Some(format!("upstream status {}", upstream_response.status)),
        );
        return Err(GatewayError::UpstreamStatus(upstream_response.status));
    }

    let options = transcode_options(&settings, &headers, model);

    if request.stream {
        let hook: FinishHook = Box::new(move |info| {
            log_context.write(info.status, info.duration.as_secs_f64(), None);
        });
        let sse = Transcoder::new(options).transcode(upstream_response.body, hook);
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(sse.map(Ok::<_, Infallible>)))
            .expect("static response parts");
        Ok(response)
    } else {
        let started = std::time::Instant::now();
        match collect_completion(upstream_response.body, &options).await {
            Ok(completion) => {
                log_context.write(200, started.elapsed().as_secs_f64(), None);
                Ok(Json(completion).into_response())
            }
            Err(error) => {
                let status = match &error {
                    TranscodeError::Upstream(_) => 500,
                    TranscodeError::Read(_) => 502,
                };
                log_context.write(
                    status,
                    started.elapsed().as_secs_f64(),
                    Some(error.to_string()),
                );
                let body = serde_json::json!({ "error": { "message": error.to_string() } });
                Ok((
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    Json(body),
                )
                    .into_response())
            }
        }
    }
}

fn transcode_options(
    settings: &SettingsBundle,
    headers: &HeaderMap,
    model: String,
) -> TranscodeOptions {
    TranscodeOptions {
        stream_id: openai::completion_id(),
        model,
        filter_tags: settings.global.filter_tags.clone(),
        show_thinking: settings.global.show_thinking,
        timeouts: settings.performance.timeout_budgets(),
        assets: AssetContext {
            base_url: settings.global.base_url.clone(),
            origin: request_origin(headers),
            video_poster_preview: settings.global.video_poster_preview,
        },
    }
}

/// Everything a request-log row needs, captured before the stream
/// outlives the handler.
struct LogContext {
    logs: Arc<RequestLogStore>,
    ip: String,
    model: String,
    key_name: String,
    token_suffix: String,
}

impl LogContext {
    fn write(self, status: u16, duration: f64, error: Option<String>) {
        tokio::spawn(async move {
            let mut entry = RequestLogEntry::at(chrono::Utc::now());
            entry.ip = self.ip;
            entry.model = self.model;
            entry.duration = duration;
            entry.status = i64::from(status);
            entry.key_name = self.key_name;
            entry.token_suffix = self.token_suffix;
            entry.error = error;
            if let Err(e) = self.logs.append(&entry).await {
                tracing::warn!(error = %e, "failed to write request log");
            }
        });
    }
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn request_origin(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

// ---------------------------------------------------------------------------
// Asset proxy
// ---------------------------------------------------------------------------

async fn proxy_asset(
    State(state): State<AppState>,
    Path(encoded): Path<String>,
) -> Result<Response, GatewayError> {
    let asset = decode_asset_path(&encoded).ok_or(GatewayError::BadAssetPath)?;
    let settings = state.settings.load().await?;
    let fetched = state.upstream.fetch_asset(&asset).await?;

    let cache_control = if settings.cache.enabled {
        format!("public, max-age={}", settings.cache.asset_max_age_secs)
    } else {
        "no-store".to_string()
    };

    let response = Response::builder()
        .status(StatusCode::from_u16(fetched.status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header(header::CONTENT_TYPE, fetched.content_type)
        .header(header::CACHE_CONTROL, cache_control)
        .body(Body::from(fetched.body))
        .expect("static response parts");
    Ok(response)
}

// ---------------------------------------------------------------------------
// Batch admin: credential refresh
// ---------------------------------------------------------------------------

impl BatchItem for Credential {
    fn label(&self) -> String {
        self.key_name.clone()
    }
}

async fn start_refresh(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let credentials = state.tokens.credentials();
    let settings = state.settings.load().await?;
    let task = state.tasks.create_task(credentials.len() as u64);

    state
        .progress
        .update(&ProgressPatch::started(credentials.len() as i64))
        .await?;
    spawn_progress_mirror(Arc::clone(&state.progress), &task);

    let upstream = Arc::clone(&state.upstream);
    let registry = Arc::clone(&state.tasks);
    let task_ref = Arc::clone(&task);
    let concurrency = settings.performance.batch_concurrency;
    tokio::spawn(async move {
        run_in_batches(
            credentials,
            Arc::clone(&task_ref),
            move |credential: Credential| {
                let upstream = Arc::clone(&upstream);
                async move {
                    upstream
                        .refresh_credential(&credential)
                        .await
                        .map(|()| ItemOutcome::succeeded())
                }
            },
            concurrency,
        )
        .await;

        if !task_ref.is_cancelled() {
            let snapshot = task_ref.snapshot();
            let mut result = serde_json::Map::new();
            result.insert("refreshed".to_string(), snapshot.ok.into());
            result.insert("failed".to_string(), snapshot.fail.into());
            let warning = (snapshot.fail > 0)
                .then(|| format!("{} credential(s) failed to refresh", snapshot.fail));
            task_ref.finish(result, warning);
        }
        registry.expire_task(task_ref.id().to_string(), DEFAULT_EXPIRY);
    });

    let body = serde_json::json!({ "task_id": task.id() });
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

/// Mirror task progress into the durable refresh snapshot so it is
/// visible without an SSE subscription and survives restarts.
fn spawn_progress_mirror(progress: Arc<RefreshProgressStore>, task: &Arc<crate::batch::BatchTask>) {
    let subscription = task.subscribe();
    tokio::spawn(async move {
        let crate::batch::SubscriptionKind::Live { mut events, .. } = subscription.kind else {
            return;
        };
        while let Some(event) = events.recv().await {
            let patch = match &event {
                TaskEvent::Progress {
                    processed, ok, fail, ..
                } => ProgressPatch {
                    current: Some(*processed as i64),
                    success: Some(*ok as i64),
                    failed: Some(*fail as i64),
                    ..Default::default()
                },
                TaskEvent::Done { .. } | TaskEvent::Error { .. } | TaskEvent::Cancelled => {
                    ProgressPatch {
                        running: Some(false),
                        ..Default::default()
                    }
                }
                TaskEvent::Init { .. } => continue,
            };
            let terminal = event.is_terminal();
            if let Err(e) = progress.update(&patch).await {
                tracing::warn!(error = %e, "failed to persist refresh progress");
            }
            if terminal {
                break;
            }
        }
    });
}

async fn refresh_progress(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let progress = state.progress.read().await?;
    Ok(Json(progress).into_response())
}

async fn task_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    let task = state
        .tasks
        .get(&id)
        .ok_or_else(|| GatewayError::UnknownTask(id.clone()))?;

    let stream = task_sse_stream(task);
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream.map(Ok::<_, Infallible>)))
        .expect("static response parts");
    Ok(response)
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    let task = state
        .tasks
        .get(&id)
        .ok_or_else(|| GatewayError::UnknownTask(id.clone()))?;
    task.cancel();
    Ok(StatusCode::ACCEPTED.into_response())
}

// ---------------------------------------------------------------------------
// Stats, models, heartbeat
// ---------------------------------------------------------------------------

async fn stats(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let report = state.logs.stats().await?;
    Ok(Json(report).into_response())
}

async fn list_models() -> Response {
    let created = chrono::Utc::now().timestamp();
    let data: Vec<serde_json::Value> = ADVERTISED_MODELS
        .iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "xai",
            })
        })
        .collect();
    Json(serde_json::json!({ "object": "list", "data": data })).into_response()
}

/// Heartbeat endpoint: GET /v1/heartbeat -> 200 OK
async fn heartbeat() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
