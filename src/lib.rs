//! Name resolution cache.
//!
//! Periodically pulls every registered apex name from the registry, resolves
//! each name's undernames through its owning process, and keeps the flattened
//! results in a local TTL-bounded store served over HTTP.

pub mod cache;
pub mod config;
pub mod executor;
pub mod health;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod resolver;

use std::sync::Arc;
use std::time::Instant;

use crate::cache::TtlKvStore;
use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::resolver::EvaluationScheduler;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: TtlKvStore,
    pub scheduler: Arc<EvaluationScheduler>,
    pub metrics: MetricsRegistry,
    /// Bearer token for admin routes.  Admin routes reject every request
    /// while this is unset.
    pub admin_token: Option<String>,
    pub started_at: Instant,
}
