//! Entity Cache
//!
//! Holds one [`Slot`] per entity-type query. Reads are synchronous and never
//! block; fetches are deduplicated per slot and superseded by invalidation.
//! The engine works on entities through the type-erased [`EntityRecord`] and
//! [`Prior`] so a single code path serves every entity type.

mod slot;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::domain::{Bucket, Entity, EntityId, Subscription, Transaction};
use crate::mutation::{Effect, MutationId};
use crate::remote::RemoteResult;

pub use slot::{FetchOutcome, Slot, SlotStatus, SlotView};
use slot::{FetchStart, FetchTicket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKey {
    Buckets,
    Transactions,
    Subscriptions,
}

impl SlotKey {
    pub const ALL: [SlotKey; 3] = [SlotKey::Buckets, SlotKey::Transactions, SlotKey::Subscriptions];

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotKey::Buckets => "buckets",
            SlotKey::Transactions => "transactions",
            SlotKey::Subscriptions => "subscriptions",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "buckets" => Some(SlotKey::Buckets),
            "transactions" => Some(SlotKey::Transactions),
            // older blobs used the short name
            "subscriptions" | "subs" => Some(SlotKey::Subscriptions),
            _ => None,
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any cached entity, tagged with its type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entity", rename_all = "camelCase")]
pub enum EntityRecord {
    Bucket(Bucket),
    Transaction(Transaction),
    Subscription(Subscription),
}

impl EntityRecord {
    pub fn slot(&self) -> SlotKey {
        match self {
            EntityRecord::Bucket(_) => SlotKey::Buckets,
            EntityRecord::Transaction(_) => SlotKey::Transactions,
            EntityRecord::Subscription(_) => SlotKey::Subscriptions,
        }
    }

    pub fn id(&self) -> &EntityId {
        match self {
            EntityRecord::Bucket(b) => b.id(),
            EntityRecord::Transaction(t) => t.id(),
            EntityRecord::Subscription(s) => s.id(),
        }
    }

    pub(crate) fn rename_ids(&mut self, from: &EntityId, to: &EntityId) {
        match self {
            EntityRecord::Bucket(b) => b.rename_ids(from, to),
            EntityRecord::Transaction(t) => t.rename_ids(from, to),
            EntityRecord::Subscription(s) => s.rename_ids(from, to),
        }
    }

    /// Read a remote result (one row or an array of rows) as entities of `slot`
    pub fn decode_all(slot: SlotKey, value: &Value) -> serde_json::Result<Vec<EntityRecord>> {
        fn rows<T: CachedEntity>(value: &Value) -> serde_json::Result<Vec<EntityRecord>> {
            let rows = match value {
                Value::Array(_) => Vec::<T>::deserialize(value)?,
                _ => vec![T::deserialize(value)?],
            };
            Ok(rows.into_iter().map(T::into_record).collect())
        }
        match slot {
            SlotKey::Buckets => rows::<Bucket>(value),
            SlotKey::Transactions => rows::<Transaction>(value),
            SlotKey::Subscriptions => rows::<Subscription>(value),
        }
    }
}

/// Entity types that live in a cache slot
pub trait CachedEntity: Entity {
    const SLOT: SlotKey;

    fn slot(cache: &EntityCache) -> &Slot<Self>;

    /// Position at which a new entity is inserted into the collection
    fn insert_at(items: &[Self], _entity: &Self) -> usize {
        items.len()
    }

    fn into_record(self) -> EntityRecord;

    fn from_record(record: EntityRecord) -> Option<Self>;

    /// Replace `from` with `to` in this entity's id and in its references
    fn rename_ids(&mut self, from: &EntityId, to: &EntityId);
}

fn rename(id: &mut EntityId, from: &EntityId, to: &EntityId) {
    if id == from {
        *id = to.clone();
    }
}

impl CachedEntity for Bucket {
    const SLOT: SlotKey = SlotKey::Buckets;

    fn slot(cache: &EntityCache) -> &Slot<Self> {
        &cache.buckets
    }

    fn into_record(self) -> EntityRecord {
        EntityRecord::Bucket(self)
    }

    fn from_record(record: EntityRecord) -> Option<Self> {
        match record {
            EntityRecord::Bucket(b) => Some(b),
            _ => None,
        }
    }

    fn rename_ids(&mut self, from: &EntityId, to: &EntityId) {
        rename(&mut self.id, from, to);
    }
}

impl CachedEntity for Transaction {
    const SLOT: SlotKey = SlotKey::Transactions;

    fn slot(cache: &EntityCache) -> &Slot<Self> {
        &cache.transactions
    }

    /// Newest date first
    fn insert_at(items: &[Self], entity: &Self) -> usize {
        items.iter().position(|t| t.date < entity.date).unwrap_or(items.len())
    }

    fn into_record(self) -> EntityRecord {
        EntityRecord::Transaction(self)
    }

    fn from_record(record: EntityRecord) -> Option<Self> {
        match record {
            EntityRecord::Transaction(t) => Some(t),
            _ => None,
        }
    }

    fn rename_ids(&mut self, from: &EntityId, to: &EntityId) {
        rename(&mut self.id, from, to);
        rename(&mut self.bucket_id, from, to);
    }
}

impl CachedEntity for Subscription {
    const SLOT: SlotKey = SlotKey::Subscriptions;

    fn slot(cache: &EntityCache) -> &Slot<Self> {
        &cache.subscriptions
    }

    fn into_record(self) -> EntityRecord {
        EntityRecord::Subscription(self)
    }

    fn from_record(record: EntityRecord) -> Option<Self> {
        match record {
            EntityRecord::Subscription(s) => Some(s),
            _ => None,
        }
    }

    fn rename_ids(&mut self, from: &EntityId, to: &EntityId) {
        rename(&mut self.id, from, to);
        rename(&mut self.bucket_id, from, to);
    }
}

/// State of one entity before a write touched it
///
/// `entity: None` means the id was absent. Restoring priors in reverse
/// order of capture puts the slot back exactly as it was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prior {
    pub slot: SlotKey,
    pub id: EntityId,
    pub index: Option<usize>,
    pub entity: Option<EntityRecord>,
}

impl Prior {
    pub(crate) fn rename_ids(&mut self, from: &EntityId, to: &EntityId) {
        rename(&mut self.id, from, to);
        if let Some(entity) = &mut self.entity {
            entity.rename_ids(from, to);
        }
    }
}

macro_rules! on_slot {
    ($cache:expr, $key:expr, |$slot:ident| $body:expr) => {
        match $key {
            SlotKey::Buckets => {
                let $slot = &$cache.buckets;
                $body
            }
            SlotKey::Transactions => {
                let $slot = &$cache.transactions;
                $body
            }
            SlotKey::Subscriptions => {
                let $slot = &$cache.subscriptions;
                $body
            }
        }
    };
}

pub struct EntityCache {
    buckets: Slot<Bucket>,
    transactions: Slot<Transaction>,
    subscriptions: Slot<Subscription>,
    clock: Arc<dyn Clock>,
    stale_window: Duration,
    /// Logical time shared by fetch starts and write starts
    seq: AtomicU64,
}

impl EntityCache {
    pub fn new(clock: Arc<dyn Clock>, stale_window: Duration) -> Self {
        Self {
            buckets: Slot::new(SlotKey::Buckets),
            transactions: Slot::new(SlotKey::Transactions),
            subscriptions: Slot::new(SlotKey::Subscriptions),
            clock,
            stale_window,
            seq: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn get<T: CachedEntity>(&self) -> SlotView<T> {
        T::slot(self).view()
    }

    pub fn needs_refresh(&self, key: SlotKey) -> bool {
        let now = self.clock.now();
        on_slot!(self, key, |slot| slot.needs_refresh(now, self.stale_window))
    }

    /// Run `loader` for the slot of `T`, or wait for the fetch already in flight
    pub async fn fetch<T, F, Fut>(&self, loader: F) -> SlotView<T>
    where
        T: CachedEntity,
        F: FnOnce() -> Fut,
        Fut: Future<Output = RemoteResult<Vec<T>>>,
    {
        let slot = T::slot(self);
        match slot.begin_fetch(self.tick()) {
            FetchStart::Join(mut done, generation) => {
                tracing::debug!(slot = %T::SLOT, generation, "joining in-flight fetch");
                while *done.borrow_and_update() < generation {
                    if done.changed().await.is_err() {
                        break;
                    }
                }
            }
            FetchStart::Run(ticket) => {
                let guard = FetchGuard { slot, ticket, armed: true };
                let result = loader().await;
                guard.disarm();
                if let Err(e) = &result {
                    tracing::warn!(slot = %T::SLOT, error = %e, "fetch failed, keeping cached data");
                }
                let outcome = slot.finish_fetch(ticket, result, self.clock.now());
                tracing::debug!(slot = %T::SLOT, generation = ticket.generation, ?outcome, "fetch settled");
            }
        }
        slot.view()
    }

    pub fn patch<T: CachedEntity, R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        T::slot(self).patch(f)
    }

    pub fn invalidate(&self, key: SlotKey) {
        tracing::debug!(slot = %key, "invalidating");
        on_slot!(self, key, |slot| slot.invalidate())
    }

    /// Insert or replace an entity, returning what it replaced
    pub(crate) fn put(&self, record: EntityRecord) -> Prior {
        let slot = record.slot();
        let id = record.id().clone();
        let (index, entity) = match record {
            EntityRecord::Bucket(b) => {
                let (i, old) = self.buckets.upsert(b);
                (i, old.map(EntityRecord::Bucket))
            }
            EntityRecord::Transaction(t) => {
                let (i, old) = self.transactions.upsert(t);
                (i, old.map(EntityRecord::Transaction))
            }
            EntityRecord::Subscription(s) => {
                let (i, old) = self.subscriptions.upsert(s);
                (i, old.map(EntityRecord::Subscription))
            }
        };
        Prior { slot, id, index, entity }
    }

    pub(crate) fn remove(&self, key: SlotKey, id: &EntityId) -> Prior {
        let (index, entity) = on_slot!(self, key, |slot| {
            let (i, old) = slot.remove(id);
            (i, old.map(CachedEntity::into_record))
        });
        Prior {
            slot: key,
            id: id.clone(),
            index,
            entity,
        }
    }

    /// Undo a sequence of captured priors, newest first
    pub(crate) fn restore(&self, priors: &[Prior]) {
        for prior in priors.iter().rev() {
            on_slot!(self, prior.slot, |slot| slot.restore(
                &prior.id,
                prior.index,
                prior.entity.clone().and_then(CachedEntity::from_record)
            ));
        }
        let mut slots: Vec<SlotKey> = priors.iter().map(|p| p.slot).collect();
        slots.sort();
        slots.dedup();
        for key in slots {
            on_slot!(self, key, |slot| slot.replay());
        }
    }

    /// Replace the placeholders of `mutation` in `key` with canonical
    /// entities from the server
    pub(crate) fn reconcile(&self, key: SlotKey, mutation: MutationId, placeholders: &[EntityId], canonical: Vec<EntityRecord>) {
        on_slot!(self, key, |slot| slot.reconcile(
            mutation,
            placeholders,
            canonical.into_iter().filter_map(CachedEntity::from_record).collect()
        ))
    }

    /// A resolved temporary id, applied to every slot and pending overlay
    pub(crate) fn rename_ids(&self, from: &EntityId, to: &EntityId) {
        for key in SlotKey::ALL {
            on_slot!(self, key, |slot| slot.rename_ids(from, to));
        }
    }

    /// Register `mutation` against `keys`; its effects are re-applied over
    /// any fetched rows until it ends
    pub(crate) fn begin_write(&self, keys: &[SlotKey], mutation: MutationId, effects: &[Effect]) {
        let now_seq = self.tick();
        for key in keys {
            on_slot!(self, *key, |slot| slot.begin_write(mutation, now_seq, effects));
        }
    }

    /// Apply effects without capturing priors
    pub(crate) fn apply(&self, effects: &[Effect]) {
        for effect in effects {
            match effect {
                Effect::Put(record) => {
                    self.put(record.clone());
                }
                Effect::Remove { slot, id } => {
                    self.remove(*slot, id);
                }
            }
        }
    }

    pub(crate) fn end_write(&self, keys: &[SlotKey], mutation: MutationId) {
        for key in keys {
            on_slot!(self, *key, |slot| slot.end_write(mutation));
        }
    }

    /// Items and fetch time of a slot holding fetched data
    pub(crate) fn export(&self, key: SlotKey) -> Option<(Value, DateTime<Utc>)> {
        on_slot!(self, key, |slot| {
            let (items, fetched) = slot.persistable()?;
            match serde_json::to_value(items) {
                Ok(items) => Some((items, fetched)),
                Err(e) => {
                    tracing::warn!(slot = %key, error = %e, "slot not serializable, skipping");
                    None
                }
            }
        })
    }

    pub(crate) fn import(&self, key: SlotKey, records: Vec<EntityRecord>, last_fetch: DateTime<Utc>) -> usize {
        on_slot!(self, key, |slot| {
            let items: Vec<_> = records.into_iter().filter_map(CachedEntity::from_record).collect();
            let count = items.len();
            slot.hydrate(items, last_fetch);
            count
        })
    }
}

/// Releases the slot if a fetch future is dropped mid-flight
struct FetchGuard<'a, T: CachedEntity> {
    slot: &'a Slot<T>,
    ticket: FetchTicket,
    armed: bool,
}

impl<T: CachedEntity> FetchGuard<'_, T> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T: CachedEntity> Drop for FetchGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.slot.abandon_fetch(self.ticket);
        }
    }
}
