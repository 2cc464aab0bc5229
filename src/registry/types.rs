use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Undername that stands for the apex name itself.
pub const APEX_UNDERNAME: &str = "@";

/// How an apex name is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    /// Held until `end_timestamp`.
    Lease,
    Permanent,
}

/// A registered top-level name, as reported by the registry.  The name
/// itself is the key of the map the registry returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApexRecord {
    /// Process that owns the name's undername records.  Absent on some
    /// legacy record shapes; such names are never resolved.
    #[serde(default, alias = "processId", alias = "contractTxId")]
    pub owner_process_id: Option<String>,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    /// Lease end, milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,
}

/// Where an undername points.
///
/// Older processes publish a bare target id string with no TTL; both shapes
/// are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "UndernameWire")]
pub struct UndernameRecord {
    pub target_id: String,
    pub ttl_seconds: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UndernameWire {
    Current {
        #[serde(rename = "targetId", alias = "transactionId")]
        target_id: String,
        #[serde(default, rename = "ttlSeconds")]
        ttl_seconds: Option<u64>,
    },
    Legacy(String),
}

impl From<UndernameWire> for UndernameRecord {
    fn from(wire: UndernameWire) -> Self {
        match wire {
            UndernameWire::Current {
                target_id,
                ttl_seconds,
            } => Self {
                target_id,
                ttl_seconds,
            },
            UndernameWire::Legacy(target_id) => Self {
                target_id,
                ttl_seconds: None,
            },
        }
    }
}

/// Undername records and owner of one process, rebuilt every evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessRecordSet {
    pub owner: Option<String>,
    pub records: HashMap<String, UndernameRecord>,
}

/// A flattened, cache-ready resolution of one apex/undername pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRecord {
    pub cache_key: String,
    pub target_id: String,
    pub ttl_seconds: u64,
    pub owner_process_id: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,
}

/// Cache key for `undername` under `apex`: the apex itself for `@`,
/// otherwise `{undername}_{apex}`.
pub fn cache_key(undername: &str, apex: &str) -> String {
    if undername == APEX_UNDERNAME {
        apex.to_string()
    } else {
        format!("{undername}_{apex}")
    }
}
