//! Process-local cache of resolved name records.
//!
//! Provides the [`TtlKvStore`], a redb-backed key-value store whose values
//! optionally carry a fixed-width expiry prefix, with writes batched into
//! short commit windows by a background writer.

pub mod envelope;
pub mod store;
pub mod writer;

pub use store::{StoreConfig, TtlKvStore};

use anyhow::Result;

/// Destination for resolved records written by an evaluation cycle.
#[async_trait::async_trait]
pub trait RecordSink: Send + Sync {
    /// Store `value` under `key`; returns once the write is durable.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
}

#[async_trait::async_trait]
impl RecordSink for TtlKvStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.set(key, value).await
    }
}
