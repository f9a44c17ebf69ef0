//! Persistence & Resume
//!
//! Writes fetched slots and paused mutations to durable storage as one blob
//! and restores them at startup. Hydration fails soft: unreadable storage
//! yields an empty cache plus an error in the report.

mod blob;
mod storage;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::error::{CacheError, CacheResult};
use crate::mutation::{MutationEngine, MutationId, PendingMutation};
use crate::store::{EntityCache, EntityRecord, SlotKey};

pub use blob::{PersistedSlot, PersistedState, FORMAT_VERSION};
pub use storage::{DurableStorage, FileStorage, MemoryStorage};

/// What `hydrate` restored and what it had to drop
#[derive(Debug, Default)]
pub struct HydrateReport {
    /// Restored slots with their item counts
    pub slots: Vec<(SlotKey, usize)>,
    /// Slots older than the retention window
    pub stale_slots: Vec<SlotKey>,
    pub mutations: Vec<MutationId>,
    /// One `MutationExpired` per dropped paused mutation
    pub expired: Vec<CacheError>,
    /// Set when storage could not be read or decoded
    pub error: Option<CacheError>,
}

impl HydrateReport {
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.mutations.is_empty() && self.expired.is_empty() && self.error.is_none()
    }
}

/// What `hydrate` would restore, read without touching storage or a cache
#[derive(Debug, Default)]
pub struct Inspection {
    /// Slots within retention, with item count and fetch time
    pub slots: Vec<(SlotKey, usize, DateTime<Utc>)>,
    pub stale_slots: Vec<SlotKey>,
    /// Paused mutations that would be resumed, in enqueue order
    pub mutations: Vec<PendingMutation>,
    pub expired: Vec<CacheError>,
    pub error: Option<CacheError>,
}

type DecodedSlots = Vec<(SlotKey, Vec<EntityRecord>, DateTime<Utc>)>;

pub struct Persister {
    storage: Arc<dyn DurableStorage>,
    key: String,
    retention: Duration,
    /// Sequence of the last capture; held while capturing
    captures: Mutex<u64>,
    /// Sequence of the capture last written
    written: tokio::sync::Mutex<u64>,
}

impl Persister {
    pub fn new(storage: Arc<dyn DurableStorage>, key: impl Into<String>, retention: Duration) -> Self {
        Self {
            storage,
            key: key.into(),
            retention,
            captures: Mutex::new(0),
            written: tokio::sync::Mutex::new(0),
        }
    }

    pub fn storage(&self) -> &Arc<dyn DurableStorage> {
        &self.storage
    }

    /// Fetched slots and paused mutations as they are right now
    pub fn capture(cache: &EntityCache, engine: &MutationEngine) -> PersistedState {
        let mut state = PersistedState::new(cache.now());
        for key in SlotKey::ALL {
            if let Some((items, last_fetch)) = cache.export(key) {
                state.slots.insert(key.as_str().to_string(), PersistedSlot { items, last_fetch });
            }
        }
        for mutation in engine.paused() {
            state.mutations.insert(mutation.id.0.to_string(), mutation);
        }
        state
    }

    /// Write the current state; writes are serialized and a capture older
    /// than the last written one is dropped
    pub async fn persist_now(&self, cache: &EntityCache, engine: &MutationEngine) -> CacheResult<()> {
        let (seq, state) = {
            let mut captures = self.captures.lock();
            *captures += 1;
            (*captures, Self::capture(cache, engine))
        };
        let bytes = state.encode()?;

        let mut written = self.written.lock().await;
        if *written > seq {
            tracing::debug!(seq, written = *written, "newer cache state already persisted");
            return Ok(());
        }
        self.storage.store(&self.key, &bytes)?;
        *written = seq;
        tracing::debug!(
            slots = state.slots.len(),
            mutations = state.mutations.len(),
            bytes = bytes.len(),
            "cache persisted"
        );
        Ok(())
    }

    /// Read and decode the blob; `Ok(None)` when nothing was persisted
    fn load(&self) -> CacheResult<Option<(PersistedState, DecodedSlots)>> {
        let Some(bytes) = self.storage.load(&self.key)? else {
            return Ok(None);
        };
        let state = PersistedState::decode(&bytes)?;
        let slots = decode_slots(&state)?;
        Ok(Some((state, slots)))
    }

    /// Report what is persisted without changing storage
    pub fn inspect(&self, now: DateTime<Utc>) -> Inspection {
        let mut inspection = Inspection::default();
        let (state, slots) = match self.load() {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return inspection,
            Err(e) => {
                inspection.error = Some(e);
                return inspection;
            }
        };

        for (key, records, last_fetch) in slots {
            if now - last_fetch > self.retention {
                inspection.stale_slots.push(key);
            } else {
                inspection.slots.push((key, records.len(), last_fetch));
            }
        }
        for mutation in state.mutations_in_order() {
            if mutation.is_expired(now, self.retention) {
                inspection.expired.push(expired(&mutation));
            } else {
                inspection.mutations.push(mutation);
            }
        }
        inspection
    }

    /// Restore slots and paused mutations from storage into `cache` and `engine`
    ///
    /// A blob that cannot be decoded is removed; a storage read error leaves
    /// it in place.
    pub fn hydrate(&self, cache: &EntityCache, engine: &MutationEngine) -> HydrateReport {
        let mut report = HydrateReport::default();
        let (state, slots) = match self.load() {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                tracing::info!(key = %self.key, "no persisted cache state");
                return report;
            }
            Err(e @ CacheError::CorruptPersistedState(_)) => {
                tracing::warn!(key = %self.key, error = %e, "discarding corrupt cache state");
                if let Err(remove) = self.storage.remove(&self.key) {
                    tracing::warn!(key = %self.key, error = %remove, "failed to remove corrupt cache state");
                }
                report.error = Some(e);
                return report;
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "persisted cache state unreadable, starting empty");
                report.error = Some(e);
                return report;
            }
        };

        let now = cache.now();
        let mut restored = Vec::new();
        for (key, records, last_fetch) in slots {
            if now - last_fetch > self.retention {
                report.stale_slots.push(key);
                continue;
            }
            let count = cache.import(key, records, last_fetch);
            restored.push(key);
            report.slots.push((key, count));
        }

        for mutation in state.mutations_in_order() {
            if mutation.is_expired(now, self.retention) {
                tracing::warn!(
                    mutation_id = %mutation.id,
                    key = %mutation.registry_key,
                    enqueued_at = %mutation.enqueued_at,
                    "paused mutation expired, dropping"
                );
                engine.discard(&restricted_to(&mutation, &restored));
                report.expired.push(expired(&mutation));
            } else {
                report.mutations.push(mutation.id);
                engine.adopt(mutation);
            }
        }

        tracing::info!(
            slots = report.slots.len(),
            mutations = report.mutations.len(),
            expired = report.expired.len(),
            "cache hydrated"
        );
        report
    }
}

fn decode_slots(state: &PersistedState) -> CacheResult<DecodedSlots> {
    let mut slots = Vec::new();
    for (name, slot) in &state.slots {
        let Some(key) = SlotKey::parse(name) else {
            tracing::warn!(slot = %name, "unknown persisted slot, skipping");
            continue;
        };
        let records = EntityRecord::decode_all(key, &slot.items)
            .map_err(|e| CacheError::CorruptPersistedState(format!("slot `{}`: {}", name, e)))?;
        slots.push((key, records, slot.last_fetch));
    }
    Ok(slots)
}

/// The mutation with prior images only for slots that were restored
fn restricted_to(mutation: &PendingMutation, restored: &[SlotKey]) -> PendingMutation {
    let mut mutation = mutation.clone();
    mutation.snapshot.retain(|prior| restored.contains(&prior.slot));
    mutation
}

fn expired(mutation: &PendingMutation) -> CacheError {
    CacheError::MutationExpired {
        id: mutation.id,
        key: mutation.registry_key.clone(),
        enqueued_at: mutation.enqueued_at,
    }
}
