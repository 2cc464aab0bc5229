//! Name resolution: the evaluation cycle and the scheduler that drives it.

pub mod engine;
pub mod scheduler;

pub use engine::{EvaluationReport, EvaluationStatus, ResolutionEngine};
pub use scheduler::{EvaluationScheduler, TriggerOutcome};

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory registry and process fakes shared by the resolver tests.

    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{bail, Result};
    use tokio::sync::Notify;

    use super::ResolutionEngine;
    use crate::cache::{RecordSink, StoreConfig, TtlKvStore};
    use crate::metrics::MetricsRegistry;
    use crate::registry::{
        ApexRecord, ProcessClientFactory, ProcessRecordClient, RecordType, RegistryClient,
        UndernameRecord,
    };

    pub const DEFAULT_TTL_SECONDS: u64 = 900;

    pub fn apex(process_id: Option<&str>, record_type: RecordType, end: Option<i64>) -> ApexRecord {
        ApexRecord {
            owner_process_id: process_id.map(str::to_string),
            record_type,
            end_timestamp: end,
        }
    }

    pub fn undernames(entries: &[(&str, &str, u64)]) -> HashMap<String, UndernameRecord> {
        entries
            .iter()
            .map(|(undername, target, ttl)| {
                (
                    undername.to_string(),
                    UndernameRecord {
                        target_id: target.to_string(),
                        ttl_seconds: Some(*ttl),
                    },
                )
            })
            .collect()
    }

    pub fn open_store(dir: &tempfile::TempDir) -> TtlKvStore {
        let config = StoreConfig::new(dir.path(), Some(Duration::from_secs(3600)))
            .with_commit_delay(Duration::from_millis(5));
        TtlKvStore::open(config).unwrap()
    }

    pub fn engine_with(
        registry: FakeRegistry,
        processes: FakeProcesses,
        store: TtlKvStore,
        max_concurrency: usize,
    ) -> ResolutionEngine {
        engine_with_sink(
            registry,
            processes,
            Arc::new(store),
            max_concurrency,
            MetricsRegistry::new(),
        )
    }

    pub fn engine_with_sink(
        registry: FakeRegistry,
        processes: FakeProcesses,
        sink: Arc<dyn RecordSink>,
        max_concurrency: usize,
        metrics: MetricsRegistry,
    ) -> ResolutionEngine {
        ResolutionEngine::new(
            Arc::new(registry),
            Arc::new(processes),
            sink,
            max_concurrency,
            DEFAULT_TTL_SECONDS,
            metrics,
        )
    }

    // ── sink ─────────────────────────────────────────────────────────

    /// Writes through to a store, except for the listed keys which fail.
    pub struct RejectingSink {
        store: TtlKvStore,
        rejected: HashSet<String>,
    }

    impl RejectingSink {
        pub fn new(store: TtlKvStore, rejected: &[&str]) -> Self {
            Self {
                store,
                rejected: rejected.iter().map(|key| key.to_string()).collect(),
            }
        }
    }

    #[async_trait::async_trait]
    impl RecordSink for RejectingSink {
        async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
            if self.rejected.contains(key) {
                bail!("write rejected for {key}");
            }
            self.store.set(key, value).await
        }
    }

    // ── registry ─────────────────────────────────────────────────────

    pub struct FakeRegistry {
        records: Option<HashMap<String, ApexRecord>>,
        gate: Option<Arc<Notify>>,
        pub calls: Arc<AtomicUsize>,
    }

    impl FakeRegistry {
        pub fn new(records: HashMap<String, ApexRecord>) -> Self {
            Self {
                records: Some(records),
                gate: None,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn failing() -> Self {
            Self {
                records: None,
                gate: None,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Each call blocks until `gate` is notified.
        pub fn gated(mut self, gate: Arc<Notify>) -> Self {
            self.gate = Some(gate);
            self
        }
    }

    #[async_trait::async_trait]
    impl RegistryClient for FakeRegistry {
        async fn apex_records(&self) -> Result<HashMap<String, ApexRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match &self.records {
                Some(records) => Ok(records.clone()),
                None => bail!("registry unavailable"),
            }
        }
    }

    // ── processes ────────────────────────────────────────────────────

    #[derive(Clone, Default)]
    struct ProcessBehaviour {
        records: Option<HashMap<String, UndernameRecord>>,
        owner_fails: bool,
    }

    #[derive(Default)]
    pub struct FakeProcesses {
        processes: HashMap<String, ProcessBehaviour>,
        delay: Option<Duration>,
        outstanding: Arc<AtomicUsize>,
        pub max_outstanding: Arc<AtomicUsize>,
        pub record_calls: Arc<AtomicUsize>,
        pub owner_calls: Arc<AtomicUsize>,
    }

    impl FakeProcesses {
        pub fn with_process(
            mut self,
            process_id: &str,
            records: HashMap<String, UndernameRecord>,
        ) -> Self {
            self.processes
                .entry(process_id.to_string())
                .or_default()
                .records = Some(records);
            self
        }

        pub fn with_failing_process(mut self, process_id: &str) -> Self {
            self.processes
                .insert(process_id.to_string(), ProcessBehaviour::default());
            self
        }

        pub fn with_failing_owner(mut self, process_id: &str) -> Self {
            self.processes
                .entry(process_id.to_string())
                .or_default()
                .owner_fails = true;
            self
        }

        /// Every records call sleeps for `delay` before answering.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    impl ProcessClientFactory for FakeProcesses {
        fn client_for(&self, process_id: &str) -> Box<dyn ProcessRecordClient> {
            Box::new(FakeProcess {
                process_id: process_id.to_string(),
                behaviour: self.processes.get(process_id).cloned().unwrap_or_default(),
                delay: self.delay,
                outstanding: Arc::clone(&self.outstanding),
                max_outstanding: Arc::clone(&self.max_outstanding),
                record_calls: Arc::clone(&self.record_calls),
                owner_calls: Arc::clone(&self.owner_calls),
            })
        }
    }

    struct FakeProcess {
        process_id: String,
        behaviour: ProcessBehaviour,
        delay: Option<Duration>,
        outstanding: Arc<AtomicUsize>,
        max_outstanding: Arc<AtomicUsize>,
        record_calls: Arc<AtomicUsize>,
        owner_calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ProcessRecordClient for FakeProcess {
        async fn records(&self) -> Result<HashMap<String, UndernameRecord>> {
            self.record_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_outstanding.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.outstanding.fetch_sub(1, Ordering::SeqCst);

            match &self.behaviour.records {
                Some(records) => Ok(records.clone()),
                None => bail!("process {} unavailable", self.process_id),
            }
        }

        async fn owner(&self) -> Result<String> {
            self.owner_calls.fetch_add(1, Ordering::SeqCst);
            if self.behaviour.owner_fails {
                bail!("owner lookup failed for {}", self.process_id);
            }
            Ok(format!("owner-of-{}", self.process_id))
        }
    }
}
