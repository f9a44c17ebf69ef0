//! Domain Layer - Core Entity Trait
//!
//! This trait defines the basic contract for all cached entities.
//! Every entity has a string id, knows how to build an optimistic copy of
//! itself from an insert payload, and how to merge a partial update.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Prefix reserved for ids synthesized before the server confirms a create.
///
/// Server ids never start with it, so a temporary id can always be told
/// apart and replaced once the canonical entity arrives.
pub const TEMP_ID_PREFIX: &str = "temp-";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Entity identifier (server-assigned or temporary)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh temporary id; unique within the process and across restarts
    pub fn temporary(now: DateTime<Utc>) -> Self {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
        Self(format!("{}{}-{}", TEMP_ID_PREFIX, now.timestamp_millis(), n))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Core trait for all cached entities
pub trait Entity:
    Sized + Send + Sync + Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + 'static
{
    /// Insert payload, sent to the remote store verbatim
    type Draft: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static;
    /// Partial update payload; absent fields are left untouched
    type Patch: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static;

    /// Returns the entity's identifier
    fn id(&self) -> &EntityId;

    /// Build the locally-computed result of inserting `draft`
    fn synthesize(draft: &Self::Draft, id: EntityId, now: DateTime<Utc>) -> Self;

    /// Merge an update payload over this entity
    fn merge(&mut self, patch: &Self::Patch, now: DateTime<Utc>);

    /// Reject payloads the remote store would never accept
    fn validate_draft(_draft: &Self::Draft) -> Result<(), String> {
        Ok(())
    }
}

/// Treat an explicit JSON `null` like a missing field
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_ids_are_distinct_and_marked() {
        let now = Utc::now();
        let a = EntityId::temporary(now);
        let b = EntityId::temporary(now);
        assert_ne!(a, b);
        assert!(a.is_temporary());
        assert!(!EntityId::from("8c1f0b7e-4a2d").is_temporary());
    }

    #[test]
    fn test_entity_id_serializes_as_plain_string() {
        let id = EntityId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }
}
