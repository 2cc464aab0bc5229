//! Durable key-value store with lazy, read-time expiry.
//!
//! Values are kept in a redb file under the configured directory.  With a
//! store-level TTL every value carries the expiry envelope from
//! [`super::envelope`]; without one, values are stored verbatim.  Expired
//! entries are never returned: the read that notices them reports a miss and
//! removes them, unless a newer value has been committed in the meantime.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use redb::Database;
use tracing::{debug, trace, warn};

use super::envelope::{self, Decoded};
use super::writer::{BatchWriter, WriteHandle, WriteOp, ENTRIES};

/// File name of the redb database inside the storage directory.
pub const STORE_FILE_NAME: &str = "entries.redb";

/// Store configuration surface.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the store file.  Created if missing.
    pub storage_path: PathBuf,
    /// Lifetime of every entry, measured from its `set`.  `None` disables expiry.
    pub ttl: Option<Duration>,
    /// Window during which writes are collected into a single commit.
    pub commit_delay: Duration,
}

impl StoreConfig {
    pub fn new(storage_path: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
        Self {
            storage_path: storage_path.into(),
            ttl,
            commit_delay: Duration::from_millis(100),
        }
    }

    pub fn with_commit_delay(mut self, commit_delay: Duration) -> Self {
        self.commit_delay = commit_delay;
        self
    }
}

/// Cheaply cloneable handle to the cache store.
///
/// Safe to use from any number of tasks at once; mutations are serialised
/// through the batch writer, reads run on the blocking pool.
#[derive(Clone)]
pub struct TtlKvStore {
    db: Arc<Database>,
    writer: WriteHandle,
    ttl: Option<Duration>,
}

impl TtlKvStore {
    /// Open (or create) the store described by `config`.
    ///
    /// Must be called from within a tokio runtime: the batch writer is
    /// spawned onto it.
    pub fn open(config: StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.storage_path).with_context(|| {
            format!(
                "failed to create cache directory: {}",
                config.storage_path.display()
            )
        })?;

        let file = config.storage_path.join(STORE_FILE_NAME);
        let db = Database::create(&file)
            .with_context(|| format!("failed to open cache store: {}", file.display()))?;

        // Create the table up front so readers never race its creation.
        let txn = db.begin_write().context("failed to begin write transaction")?;
        txn.open_table(ENTRIES)
            .context("failed to create entries table")?;
        txn.commit().context("failed to commit table creation")?;

        let db = Arc::new(db);
        let writer = BatchWriter::spawn(Arc::clone(&db), config.commit_delay);

        debug!(
            path = %file.display(),
            ttl_secs = config.ttl.map(|t| t.as_secs()),
            commit_delay_ms = config.commit_delay.as_millis() as u64,
            "cache store opened"
        );

        Ok(Self {
            db,
            writer,
            ttl: config.ttl,
        })
    }

    /// The store-level TTL, if any.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// Returns once the write has been committed.
    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let stored = match self.ttl {
            Some(ttl) => {
                let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
                envelope::encode(value, envelope::now_millis().saturating_add(ttl_ms))
            }
            None => value.to_vec(),
        };
        self.writer
            .submit(WriteOp::Put {
                key: key.to_string(),
                value: stored,
            })
            .await
            .with_context(|| format!("failed to set cache key {key}"))?;
        trace!(key, "cache set");
        Ok(())
    }

    /// Fetch the value under `key`.
    ///
    /// Returns `Ok(None)` on a miss.  An expired entry is a miss too; its
    /// removal is attempted before this returns, and a failed removal still
    /// yields the miss.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(stored) = self.read_raw(key).await? else {
            return Ok(None);
        };

        if self.ttl.is_none() {
            return Ok(Some(stored));
        }

        match envelope::decode(&stored, envelope::now_millis()) {
            Decoded::Live(payload) => Ok(Some(payload.to_vec())),
            Decoded::Expired => {
                trace!(key, "cache entry expired");
                self.discard_stale(key).await;
                Ok(None)
            }
            Decoded::Malformed => {
                warn!(
                    key,
                    len = stored.len(),
                    "cache entry too short for expiry prefix; dropping"
                );
                self.discard_stale(key).await;
                Ok(None)
            }
        }
    }

    /// Remove `key` if what is committed under it is still not live.
    async fn discard_stale(&self, key: &str) {
        let op = WriteOp::RemoveIfStale {
            key: key.to_string(),
            now_ms: envelope::now_millis(),
        };
        if let Err(e) = self.writer.submit(op).await {
            warn!(key, error = %format!("{e:#}"), "failed to remove stale cache entry");
        }
    }

    /// Whether an entry exists under `key`, expired or not.
    pub async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.read_raw(key).await?.is_some())
    }

    /// Remove the entry under `key`.  Removing an absent key is a no-op.
    pub async fn del(&self, key: &str) -> Result<()> {
        if !self.has(key).await? {
            return Ok(());
        }
        self.writer
            .submit(WriteOp::Remove {
                key: key.to_string(),
            })
            .await
            .with_context(|| format!("failed to delete cache key {key}"))?;
        trace!(key, "cache del");
        Ok(())
    }

    /// Wait until every write queued so far has been committed.
    pub async fn flush(&self) -> Result<()> {
        self.writer
            .submit(WriteOp::Barrier)
            .await
            .context("failed to flush cache writes")
    }

    async fn read_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let db = Arc::clone(&self.db);
        let owned_key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            let txn = db.begin_read().context("failed to begin read transaction")?;
            let table = txn
                .open_table(ENTRIES)
                .context("failed to open entries table")?;
            let value = table
                .get(owned_key.as_str())
                .with_context(|| format!("failed to read key {owned_key}"))?;
            Ok(value.map(|guard| guard.value().to_vec()))
        })
        .await
        .map_err(|e| anyhow!("cache read task panicked: {e}"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir, ttl: Option<Duration>) -> TtlKvStore {
        let config =
            StoreConfig::new(dir.path(), ttl).with_commit_delay(Duration::from_millis(10));
        TtlKvStore::open(config).unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips_without_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, None);

        store.set("test", b"hello").await.unwrap();
        assert_eq!(store.get("test").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn set_then_get_strips_prefix_with_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Some(Duration::from_secs(60)));

        store.set("test", b"hello").await.unwrap();
        assert_eq!(store.get("test").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn ttl_store_persists_expiry_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Some(Duration::from_secs(60)));

        let before = envelope::now_millis();
        store.set("k", b"v").await.unwrap();
        let raw = store.read_raw("k").await.unwrap().unwrap();
        let (expires_at, payload) = envelope::split(&raw).unwrap();

        assert_eq!(payload, b"v");
        assert!(expires_at >= before + 60_000);
        assert!(expires_at <= envelope::now_millis() + 60_000);
    }

    #[tokio::test]
    async fn no_ttl_store_writes_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, None);

        store.set("k", b"v").await.unwrap();
        assert_eq!(store.read_raw("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_and_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Some(Duration::from_secs(1)));

        store.set("expire", b"hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(store.get("expire").await.unwrap(), None);
        assert!(!store.has("expire").await.unwrap());
    }

    #[tokio::test]
    async fn malformed_entry_is_a_miss_and_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Some(Duration::from_secs(60)));

        store
            .writer
            .submit(WriteOp::Put {
                key: "short".to_string(),
                value: vec![1, 2, 3],
            })
            .await
            .unwrap();

        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(!store.has("short").await.unwrap());
    }

    #[tokio::test]
    async fn expiry_cleanup_keeps_a_newer_set_in_the_same_batch() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path(), Some(Duration::from_secs(1)))
            .with_commit_delay(Duration::from_millis(200));
        let store = TtlKvStore::open(config).unwrap();

        store.set("permaweb", b"old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        // The refresh opens a commit window; the expired read lands inside it.
        let refresh = tokio::spawn({
            let store = store.clone();
            async move { store.set("permaweb", b"fresh").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.get("permaweb").await.unwrap(), None);
        refresh.await.unwrap().unwrap();
        assert_eq!(store.get("permaweb").await.unwrap(), Some(b"fresh".to_vec()));
    }

    #[tokio::test]
    async fn failed_cleanup_still_reports_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Some(Duration::from_secs(60)));
        store
            .writer
            .submit(WriteOp::Put {
                key: "short".to_string(),
                value: vec![1, 2, 3],
            })
            .await
            .unwrap();

        let detached = TtlKvStore {
            writer: WriteHandle::detached(),
            ..store.clone()
        };
        assert_eq!(detached.get("short").await.unwrap(), None);
        assert!(store.has("short").await.unwrap());
    }

    #[tokio::test]
    async fn second_set_overwrites_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Some(Duration::from_secs(60)));

        store.set("k", b"v1").await.unwrap();
        store.set("k", b"v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Some(Duration::from_secs(60)));

        assert_eq!(store.get("nope").await.unwrap(), None);
        assert!(!store.has("nope").await.unwrap());
    }

    #[tokio::test]
    async fn del_removes_and_tolerates_absent_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, None);

        store.del("never-set").await.unwrap();

        store.set("k", b"v").await.unwrap();
        assert!(store.has("k").await.unwrap());
        store.del("k").await.unwrap();
        assert!(!store.has("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_sets_share_commits_and_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, None);

        let writes = (0..50).map(|i| {
            let store = store.clone();
            async move { store.set(&format!("key-{i}"), format!("value-{i}").as_bytes()).await }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        for i in 0..50 {
            let value = store.get(&format!("key-{i}")).await.unwrap();
            assert_eq!(value, Some(format!("value-{i}").into_bytes()));
        }
    }

    #[tokio::test]
    async fn concurrent_sets_to_one_key_leave_one_intact_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Some(Duration::from_secs(60)));

        let writes = (0..20).map(|i| {
            let store = store.clone();
            async move { store.set("shared", format!("value-{i:02}").as_bytes()).await }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        let value = String::from_utf8(store.get("shared").await.unwrap().unwrap()).unwrap();
        assert!(value.starts_with("value-") && value.len() == "value-00".len());
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir, None);
            store.set("durable", b"yes").await.unwrap();
            store.flush().await.unwrap();
        }
        // Give the first writer task time to see its channel close and
        // release the database file.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reopened = open_store(&dir, None);
        assert_eq!(reopened.get("durable").await.unwrap(), Some(b"yes".to_vec()));
    }
}
