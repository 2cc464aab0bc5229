//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET  /`                             - Redirect to `/resolver/info`
//! - `GET  /resolver/healthcheck`         - Health check
//! - `GET  /resolver/info`                - Evaluation status
//! - `POST /resolver/admin/evaluate`      - Trigger an evaluation (Bearer auth)
//! - `GET  /resolver/records/{name}`      - Resolved record for a cache key
//! - `HEAD /resolver/records/{name}`      - Same headers, no body
//! - `GET  /metrics`                      - Prometheus metrics

use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::health::HealthState;
use crate::registry::ResolvedRecord;
use crate::AppState;

const RESOLVED_ID_HEADER: HeaderName = HeaderName::from_static("x-resolved-id");
const TTL_SECONDS_HEADER: HeaderName = HeaderName::from_static("x-ttl-seconds");
const PROCESS_ID_HEADER: HeaderName = HeaderName::from_static("x-process-id");
const LEASE_END_HEADER: HeaderName = HeaderName::from_static("x-lease-end");

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/resolver/healthcheck", get(handle_health))
        .route("/resolver/info", get(handle_info))
        .route("/resolver/admin/evaluate", post(handle_admin_evaluate))
        .route(
            "/resolver/records/{name}",
            get(handle_get_record).head(handle_head_record),
        )
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    process_id: String,
    /// Milliseconds since the epoch, `null` before the first evaluation.
    last_evaluation_timestamp: Option<i64>,
    evaluation_in_progress: bool,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: &'static str,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_root() -> Redirect {
    Redirect::temporary("/resolver/info")
}

/// `GET /resolver/healthcheck`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = HealthState {
        store: state.store.clone(),
        scheduler: Arc::clone(&state.scheduler),
        evaluation_enabled: state.config.evaluation.enabled,
        started_at: state.started_at,
    };
    crate::health::health_check(&health_state).await
}

/// `GET /resolver/info`
async fn handle_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        process_id: state.config.registry.process_id.clone(),
        last_evaluation_timestamp: state
            .scheduler
            .last_evaluated_timestamp()
            .map(|ts| ts.timestamp_millis()),
        evaluation_in_progress: state.scheduler.is_evaluation_in_progress(),
    })
}

/// `POST /resolver/admin/evaluate`
///
/// Starts an evaluation in the background and returns immediately.  A cycle
/// that is already running is reported with 202 instead of starting another.
#[instrument(skip(state, headers))]
async fn handle_admin_evaluate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    authorize_admin(&state, &headers)?;

    if state.scheduler.is_evaluation_in_progress() {
        return Ok((
            StatusCode::ACCEPTED,
            Json(MessageResponse {
                message: "Evaluation in progress",
            }),
        )
            .into_response());
    }

    info!(
        process_id = %state.config.registry.process_id,
        "evaluation triggered by request"
    );
    state.scheduler.spawn_trigger();

    Ok((
        StatusCode::OK,
        Json(MessageResponse {
            message: "Evaluation triggered",
        }),
    )
        .into_response())
}

/// `GET /resolver/records/{name}`
#[instrument(skip(state))]
async fn handle_get_record(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    match lookup_record(&state, &name).await? {
        Some(found) => {
            let mut body = serde_json::to_value(&found.record)
                .context("failed to encode record response")?;
            if let Some(fields) = body.as_object_mut() {
                fields.insert("name".to_string(), json!(name));
            }
            Ok((StatusCode::OK, found.headers, Json(body)).into_response())
        }
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Record not found" })),
        )
            .into_response()),
    }
}

/// `HEAD /resolver/records/{name}`
#[instrument(skip(state))]
async fn handle_head_record(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    match lookup_record(&state, &name).await? {
        Some(found) => {
            let mut headers = found.headers;
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            Ok((StatusCode::OK, headers, Body::empty()).into_response())
        }
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the resolver.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

struct FoundRecord {
    record: ResolvedRecord,
    headers: HeaderMap,
}

/// Read and decode the cached record for `name`.  A miss is `Ok(None)`.
async fn lookup_record(state: &AppState, name: &str) -> anyhow::Result<Option<FoundRecord>> {
    debug!(name, "checking cache for record");
    let Some(bytes) = state
        .store
        .get(name)
        .await
        .with_context(|| format!("failed to read record {name}"))?
    else {
        state.metrics.metrics.cache_misses.inc();
        return Ok(None);
    };
    state.metrics.metrics.cache_hits.inc();

    let record: ResolvedRecord = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to decode cached record {name}"))?;
    let headers = record_headers(&record)?;
    debug!(name, target_id = %record.target_id, ttl_seconds = record.ttl_seconds, "served record from cache");
    Ok(Some(FoundRecord { record, headers }))
}

fn record_headers(record: &ResolvedRecord) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_str(&format!("public, max-age={}", record.ttl_seconds))?,
    );
    headers.insert(
        RESOLVED_ID_HEADER,
        HeaderValue::from_str(&record.target_id)
            .with_context(|| format!("target id is not a valid header value: {}", record.target_id))?,
    );
    headers.insert(TTL_SECONDS_HEADER, HeaderValue::from(record.ttl_seconds));
    headers.insert(
        PROCESS_ID_HEADER,
        HeaderValue::from_str(&record.owner_process_id).with_context(|| {
            format!(
                "process id is not a valid header value: {}",
                record.owner_process_id
            )
        })?,
    );
    if let Some(end) = record.end_timestamp {
        headers.insert(LEASE_END_HEADER, HeaderValue::from(end));
    }
    Ok(headers)
}

/// Check the `Authorization: Bearer <token>` header against the configured
/// admin token.
fn authorize_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.admin_token.as_deref() else {
        warn!("admin request rejected: no admin token configured");
        return Err(AppError::Unauthorized("admin token not configured".into()));
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token_matches(token, expected) => Ok(()),
        Some(_) => Err(AppError::Unauthorized("invalid admin token".into())),
        None => Err(AppError::Unauthorized("missing bearer token".into())),
    }
}

/// Length-independent comparison over the whole token.
fn token_matches(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    let diff = a
        .iter()
        .zip(b)
        .fold(a.len() ^ b.len(), |acc, (x, y)| acc | usize::from(x ^ y));
    diff == 0
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The caller did not present a valid admin token.
    Unauthorized(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized(reason) => {
                debug!(%reason, "unauthorized request");
                (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer realm=\"namecache\"")],
                    Json(json!({ "message": "Unauthorized" })),
                )
                    .into_response()
            }
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Internal Server Error" })),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
