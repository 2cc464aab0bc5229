use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::TtlKvStore;
use crate::resolver::EvaluationScheduler;

/// Key probed by the store check.  Never written.
const PROBE_KEY: &str = "__healthcheck__";

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub date: DateTime<Utc>,
    pub message: &'static str,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
    pub evaluation: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn healthy_with(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of the application state the health check reads.
#[derive(Clone)]
pub struct HealthState {
    pub store: TtlKvStore,
    pub scheduler: Arc<EvaluationScheduler>,
    /// Whether the periodic evaluation loop is running.
    pub evaluation_enabled: bool,
    pub started_at: Instant,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_store(store: &TtlKvStore) -> CheckResult {
    match store.has(PROBE_KEY).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("store read failed: {e:#}")),
    }
}

fn check_evaluation(state: &HealthState, now: DateTime<Utc>) -> CheckResult {
    if !state.evaluation_enabled {
        return CheckResult::healthy_with("periodic evaluation disabled");
    }

    let scheduler = &state.scheduler;
    let Some(last) = scheduler.last_evaluated_timestamp() else {
        return if scheduler.is_evaluation_in_progress() {
            CheckResult::healthy_with("initial evaluation in progress")
        } else {
            CheckResult::unhealthy("no evaluation has completed yet")
        };
    };

    let max_age = scheduler.interval() * 2;
    let age = (now - last).to_std().unwrap_or(Duration::ZERO);
    if age > max_age {
        CheckResult::unhealthy(format!(
            "last evaluation finished {}s ago, expected within {}s",
            age.as_secs(),
            max_age.as_secs()
        ))
    } else {
        CheckResult::healthy()
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.store.ok {
        HealthStatus::Unhealthy
    } else if !checks.evaluation.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Handler body
// ---------------------------------------------------------------------------

/// Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_check(state: &HealthState) -> (StatusCode, Json<HealthResponse>) {
    let now = Utc::now();
    let checks = HealthChecks {
        store: check_store(&state.store).await,
        evaluation: check_evaluation(state, now),
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse {
        status,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        date: now,
        message: "Welcome to the name resolver.",
        checks,
    };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
