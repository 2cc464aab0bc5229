//! One evaluation cycle: registry -> processes -> join -> cache.
//!
//! 1. Fetch every apex record from the registry.  Failure aborts the cycle.
//! 2. Collect the distinct owning process ids.
//! 3. Fetch each process's undername records and owner through the fetch
//!    executor.  A process that errors or has no records drops out of this
//!    cycle; the others carry on.
//! 4. Join apex records with their process's undernames into
//!    [`ResolvedRecord`]s.
//! 5. Write every resolved record to the cache through the write executor.
//!    Individual write failures are logged and counted, never fatal.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument};

use crate::cache::RecordSink;
use crate::executor::BoundedExecutor;
use crate::metrics::MetricsRegistry;
use crate::registry::{
    cache_key, ApexRecord, ProcessClientFactory, ProcessRecordSet, RecordType, RegistryClient,
    ResolvedRecord,
};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationStatus {
    /// Every process fetch and every cache write succeeded.
    Complete,
    /// The cycle finished, but some processes or writes failed.
    Partial,
}

/// What a finished evaluation cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationReport {
    pub apex_records: usize,
    /// Distinct owning process ids referenced by the apex records.
    pub processes: usize,
    /// Processes whose record or owner lookup failed.
    pub failed_processes: usize,
    /// Processes that returned no undername records.
    pub empty_processes: usize,
    pub records_written: usize,
    pub failed_writes: usize,
    pub duration: Duration,
}

impl EvaluationReport {
    pub fn status(&self) -> EvaluationStatus {
        if self.failed_processes == 0 && self.failed_writes == 0 {
            EvaluationStatus::Complete
        } else {
            EvaluationStatus::Partial
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ResolutionEngine {
    registry: Arc<dyn RegistryClient>,
    processes: Arc<dyn ProcessClientFactory>,
    sink: Arc<dyn RecordSink>,
    fetch_pool: BoundedExecutor,
    write_pool: BoundedExecutor,
    default_ttl_seconds: u64,
    metrics: MetricsRegistry,
}

impl ResolutionEngine {
    /// Resolved records are written to `sink`.  `max_concurrency` caps
    /// process fetches and cache writes separately.  `default_ttl_seconds` is
    /// used for undernames that carry no TTL.
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        processes: Arc<dyn ProcessClientFactory>,
        sink: Arc<dyn RecordSink>,
        max_concurrency: usize,
        default_ttl_seconds: u64,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            registry,
            processes,
            sink,
            fetch_pool: BoundedExecutor::new(max_concurrency, "process-fetch"),
            write_pool: BoundedExecutor::new(max_concurrency, "cache-write"),
            default_ttl_seconds,
            metrics,
        }
    }

    /// Run one evaluation cycle.
    ///
    /// Returns `Err` only when the registry itself could not be read.
    #[instrument(skip(self))]
    pub async fn evaluate(&self) -> Result<EvaluationReport> {
        let started = Instant::now();
        info!("evaluating registry names");

        let apex_records = self
            .registry
            .apex_records()
            .await
            .context("failed to fetch apex records")?;
        info!(count = apex_records.len(), "retrieved apex records");

        let process_ids = distinct_process_ids(&apex_records);
        let fetches = self
            .fetch_pool
            .run_all(process_ids.iter().map(|id| self.fetch_process(id)))
            .await;

        let mut report = EvaluationReport {
            apex_records: apex_records.len(),
            processes: process_ids.len(),
            ..EvaluationReport::default()
        };

        let mut process_map: HashMap<String, ProcessRecordSet> = HashMap::new();
        for (process_id, fetched) in process_ids.iter().zip(fetches) {
            match fetched.and_then(|r| r) {
                Ok(Some(set)) => {
                    process_map.insert((*process_id).to_string(), set);
                }
                Ok(None) => report.empty_processes += 1,
                Err(e) => {
                    debug!(process_id, error = %format!("{e:#}"), "failed to fetch process records");
                    self.metrics.metrics.process_fetch_failures.inc();
                    report.failed_processes += 1;
                }
            }
        }
        info!(
            processes = process_map.len(),
            failed = report.failed_processes,
            empty = report.empty_processes,
            "retrieved process records"
        );

        let resolved = join_records(&apex_records, &process_map, self.default_ttl_seconds);
        let writes = self
            .write_pool
            .run_all(resolved.iter().map(|record| self.write_record(record)))
            .await;

        for (record, written) in resolved.iter().zip(writes) {
            match written.and_then(|r| r) {
                Ok(()) => report.records_written += 1,
                Err(e) => {
                    error!(cache_key = %record.cache_key, error = %format!("{e:#}"), "failed to set record in cache");
                    self.metrics.metrics.cache_write_failures.inc();
                    report.failed_writes += 1;
                }
            }
        }

        report.duration = started.elapsed();
        self.metrics
            .metrics
            .resolved_records
            .set(i64::try_from(report.records_written).unwrap_or(i64::MAX));

        info!(
            records_written = report.records_written,
            failed_writes = report.failed_writes,
            duration_ms = report.duration.as_millis() as u64,
            "evaluated registry names"
        );
        Ok(report)
    }

    /// Records and owner of one process; `None` when it has no records.
    async fn fetch_process(&self, process_id: &str) -> Result<Option<ProcessRecordSet>> {
        let client = self.processes.client_for(process_id);
        let records = client
            .records()
            .await
            .with_context(|| format!("failed to get records for process {process_id}"))?;
        if records.is_empty() {
            return Ok(None);
        }
        let owner = client
            .owner()
            .await
            .with_context(|| format!("failed to get owner for process {process_id}"))?;
        Ok(Some(ProcessRecordSet {
            owner: Some(owner),
            records,
        }))
    }

    async fn write_record(&self, record: &ResolvedRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)
            .with_context(|| format!("failed to serialize record {}", record.cache_key))?;
        self.sink.put(&record.cache_key, &bytes).await
    }
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

/// Owning process ids referenced by `apex_records`, each once.
pub fn distinct_process_ids(apex_records: &HashMap<String, ApexRecord>) -> BTreeSet<&str> {
    apex_records
        .values()
        .filter_map(|record| record.owner_process_id.as_deref())
        .collect()
}

/// Flatten apex records and their processes' undernames into cache entries.
///
/// Apex records whose process is missing from `processes` produce nothing.
/// Lease end timestamps are only carried for lease records.
pub fn join_records(
    apex_records: &HashMap<String, ApexRecord>,
    processes: &HashMap<String, ProcessRecordSet>,
    default_ttl_seconds: u64,
) -> Vec<ResolvedRecord> {
    let mut resolved = Vec::new();
    for (apex_name, apex) in apex_records {
        let Some(process_id) = apex.owner_process_id.as_deref() else {
            continue;
        };
        let Some(process) = processes.get(process_id) else {
            continue;
        };

        for (undername, record) in &process.records {
            resolved.push(ResolvedRecord {
                cache_key: cache_key(undername, apex_name),
                target_id: record.target_id.clone(),
                ttl_seconds: record
                    .ttl_seconds
                    .filter(|ttl| *ttl > 0)
                    .unwrap_or(default_ttl_seconds),
                owner_process_id: process_id.to_string(),
                record_type: apex.record_type,
                owner: process.owner.clone(),
                end_timestamp: match apex.record_type {
                    RecordType::Lease => apex.end_timestamp,
                    RecordType::Permanent => None,
                },
            });
        }
    }
    resolved
}
