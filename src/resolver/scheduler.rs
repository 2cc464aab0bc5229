//! Evaluation scheduling and the single-flight guard.
//!
//! At most one evaluation cycle runs at a time.  A trigger that arrives while
//! a cycle is running is dropped, not queued.  The periodic loop and the
//! admin endpoint both go through [`EvaluationScheduler::trigger`].

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::engine::{EvaluationReport, EvaluationStatus, ResolutionEngine};
use crate::metrics::{MetricsRegistry, Outcome, OutcomeLabels};

const NEVER_EVALUATED: i64 = i64::MIN;

/// Result of asking for an evaluation.
#[derive(Debug)]
pub enum TriggerOutcome {
    /// Another cycle was running; nothing was done.
    AlreadyRunning,
    Completed(EvaluationReport),
    /// The cycle aborted, e.g. because the registry was unreachable.
    Failed(String),
}

pub struct EvaluationScheduler {
    engine: Arc<ResolutionEngine>,
    interval: Duration,
    in_progress: AtomicBool,
    /// Milliseconds since the epoch of the last successful cycle.
    last_evaluated_ms: AtomicI64,
    metrics: MetricsRegistry,
}

/// Clears the in-progress flag on drop, whichever way the cycle ends.
struct InProgressGuard<'a>(&'a AtomicBool);

impl<'a> InProgressGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EvaluationScheduler {
    pub fn new(engine: Arc<ResolutionEngine>, interval: Duration, metrics: MetricsRegistry) -> Self {
        Self {
            engine,
            interval,
            in_progress: AtomicBool::new(false),
            last_evaluated_ms: AtomicI64::new(NEVER_EVALUATED),
            metrics,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_evaluation_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// When the last cycle that reached the write phase finished.
    pub fn last_evaluated_timestamp(&self) -> Option<DateTime<Utc>> {
        match self.last_evaluated_ms.load(Ordering::Acquire) {
            NEVER_EVALUATED => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    /// Run one cycle unless one is already running.
    pub async fn trigger(&self) -> TriggerOutcome {
        let Some(_guard) = InProgressGuard::acquire(&self.in_progress) else {
            info!("evaluation already in progress, skipping");
            self.metrics.metrics.evaluations_skipped.inc();
            return TriggerOutcome::AlreadyRunning;
        };

        match self.engine.evaluate().await {
            Ok(report) => {
                let finished = Utc::now();
                self.last_evaluated_ms
                    .store(finished.timestamp_millis(), Ordering::Release);

                let m = &self.metrics.metrics;
                m.evaluation_duration_seconds
                    .observe(report.duration.as_secs_f64());
                m.last_evaluation_timestamp_seconds
                    .set(finished.timestamp());
                let outcome = match report.status() {
                    EvaluationStatus::Complete => Outcome::Complete,
                    EvaluationStatus::Partial => {
                        warn!(
                            failed_processes = report.failed_processes,
                            failed_writes = report.failed_writes,
                            "evaluation finished with failures"
                        );
                        Outcome::Partial
                    }
                };
                m.evaluations_total
                    .get_or_create(&OutcomeLabels { outcome })
                    .inc();
                TriggerOutcome::Completed(report)
            }
            Err(e) => {
                let message = format!("{e:#}");
                error!(error = %message, "evaluation failed");
                self.metrics
                    .metrics
                    .evaluations_total
                    .get_or_create(&OutcomeLabels {
                        outcome: Outcome::Failed,
                    })
                    .inc();
                TriggerOutcome::Failed(message)
            }
        }
    }

    /// Fire-and-forget [`trigger`](Self::trigger) on a background task.
    pub fn spawn_trigger(self: &Arc<Self>) -> JoinHandle<TriggerOutcome> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.trigger().await })
    }

    /// Trigger an evaluation immediately and then once per interval until
    /// `shutdown` is cancelled.  A tick that lands during a running cycle is
    /// dropped by the single-flight guard.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "evaluation scheduler started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("evaluation scheduler shutting down");
                    break;
                }

                _ = interval.tick() => {
                    self.spawn_trigger();
                }
            }
        }
    }
}
