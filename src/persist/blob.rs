//! Persisted blob format
//!
//! ```json
//! { "version": 1, "persistedAt": "...",
//!   "slots": { "buckets": { "items": [...], "lastFetch": "..." } },
//!   "mutations": { "3": { "id": 3, "registryKey": "createBucket", "payload": {...},
//!                         "enqueuedAt": "...", "snapshot": [...], ... } } }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CacheError, CacheResult};
use crate::mutation::PendingMutation;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSlot {
    pub items: Value,
    pub last_fetch: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub version: u32,
    pub persisted_at: DateTime<Utc>,
    #[serde(default)]
    pub slots: BTreeMap<String, PersistedSlot>,
    /// Paused mutations keyed by mutation id
    #[serde(default)]
    pub mutations: BTreeMap<String, PendingMutation>,
}

impl PersistedState {
    pub fn new(persisted_at: DateTime<Utc>) -> Self {
        Self {
            version: FORMAT_VERSION,
            persisted_at,
            slots: BTreeMap::new(),
            mutations: BTreeMap::new(),
        }
    }

    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CacheError::Storage(format!("encode cache state: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> CacheResult<Self> {
        let state: Self =
            serde_json::from_slice(bytes).map_err(|e| CacheError::CorruptPersistedState(e.to_string()))?;
        if state.version != FORMAT_VERSION {
            return Err(CacheError::CorruptPersistedState(format!(
                "unsupported format version {} (expected {})",
                state.version, FORMAT_VERSION
            )));
        }
        Ok(state)
    }

    /// Paused mutations in enqueue order
    pub fn mutations_in_order(&self) -> Vec<PendingMutation> {
        let mut mutations: Vec<PendingMutation> = self.mutations.values().cloned().collect();
        mutations.sort_by_key(|m| m.id);
        mutations
    }
}
