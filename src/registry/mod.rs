//! Registry client abstraction layer.
//!
//! The resolver talks to two remote collaborators: the registry, which lists
//! every apex name and its owning process, and the per-process record
//! endpoints, which list a process's undernames and its owner.  Both sit
//! behind async traits so the resolver never sees transport details and
//! tests can substitute in-memory fakes.

pub mod gateway;
pub mod types;

use std::collections::HashMap;

use anyhow::Result;

pub use types::{
    cache_key, ApexRecord, ProcessRecordSet, RecordType, ResolvedRecord, UndernameRecord,
};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Source of the full apex record set.
#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync {
    /// Every registered apex name mapped to its record.
    async fn apex_records(&self) -> Result<HashMap<String, ApexRecord>>;
}

/// Record endpoints of a single owning process.
#[async_trait::async_trait]
pub trait ProcessRecordClient: Send + Sync {
    /// The process's undername records keyed by undername.
    async fn records(&self) -> Result<HashMap<String, UndernameRecord>>;

    /// Identity of the process owner.
    async fn owner(&self) -> Result<String>;
}

/// Builds a [`ProcessRecordClient`] for a given process id.
pub trait ProcessClientFactory: Send + Sync {
    fn client_for(&self, process_id: &str) -> Box<dyn ProcessRecordClient>;
}
