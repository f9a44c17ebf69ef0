//! Cache Slot
//!
//! One slot per entity-type query: the last known collection plus its
//! fetch status, freshness metadata and the writes pending against it.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::{CachedEntity, SlotKey};
use crate::domain::{Entity, EntityId};
use crate::mutation::{Effect, MutationId};
use crate::remote::{RemoteError, RemoteResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Idle,
    Fetching,
    Success,
    Error,
}

/// What a reader sees; always available, even when stale or empty
#[derive(Debug, Clone, PartialEq)]
pub struct SlotView<T> {
    pub items: Vec<T>,
    pub status: SlotStatus,
    pub last_fetch: Option<DateTime<Utc>>,
    /// Marked for refetch by a settled write
    pub invalidated: bool,
    /// Error of the most recent failed fetch
    pub error: Option<RemoteError>,
}

impl<T: Entity> SlotView<T> {
    pub fn find(&self, id: &EntityId) -> Option<&T> {
        self.items.iter().find(|e| e.id() == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchTicket {
    pub(crate) generation: u64,
    /// Logical time the fetch was issued
    pub(crate) started: u64,
}

pub(crate) enum FetchStart {
    /// Another fetch for this slot is in flight; wait for its generation
    Join(watch::Receiver<u64>, u64),
    Run(FetchTicket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied,
    Failed,
    /// A write started after this fetch was issued; the response is stale
    Discarded,
    /// Invalidated or replaced by a newer fetch while in flight
    Superseded,
}

/// One optimistic change of a pending write, typed for this slot
#[derive(Debug, Clone)]
enum Overlay<T> {
    Put(T),
    Remove(EntityId),
}

struct PendingWrite<T> {
    /// Logical time the write started
    started: u64,
    overlay: Vec<Overlay<T>>,
}

struct SlotState<T> {
    items: Vec<T>,
    status: SlotStatus,
    /// Status to fall back to when the in-flight fetch is dropped
    settled: SlotStatus,
    last_fetch: Option<DateTime<Utc>>,
    invalidated: bool,
    generation: u64,
    in_flight: Option<FetchTicket>,
    pending_writes: BTreeMap<MutationId, PendingWrite<T>>,
    last_error: Option<RemoteError>,
}

pub struct Slot<T> {
    key: SlotKey,
    state: Mutex<SlotState<T>>,
    done: watch::Sender<u64>,
}

impl<T: CachedEntity> Slot<T> {
    pub(crate) fn new(key: SlotKey) -> Self {
        let (done, _) = watch::channel(0);
        Self {
            key,
            state: Mutex::new(SlotState {
                items: Vec::new(),
                status: SlotStatus::Idle,
                settled: SlotStatus::Idle,
                last_fetch: None,
                invalidated: false,
                generation: 0,
                in_flight: None,
                pending_writes: BTreeMap::new(),
                last_error: None,
            }),
            done,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock()
    }

    pub fn key(&self) -> SlotKey {
        self.key
    }

    pub fn view(&self) -> SlotView<T> {
        let s = self.lock();
        SlotView {
            items: s.items.clone(),
            status: s.status,
            last_fetch: s.last_fetch,
            invalidated: s.invalidated,
            error: s.last_error.clone(),
        }
    }

    /// Whether a read should kick off a background refresh
    pub(crate) fn needs_refresh(&self, now: DateTime<Utc>, stale_window: Duration) -> bool {
        let s = self.lock();
        if s.in_flight.is_some() {
            return false;
        }
        if s.invalidated || s.status == SlotStatus::Idle {
            return true;
        }
        match s.last_fetch {
            Some(fetched) => now - fetched > stale_window,
            None => true,
        }
    }

    pub(crate) fn begin_fetch(&self, now_seq: u64) -> FetchStart {
        let mut s = self.lock();
        if let Some(ticket) = s.in_flight {
            return FetchStart::Join(self.done.subscribe(), ticket.generation);
        }
        s.generation += 1;
        let ticket = FetchTicket {
            generation: s.generation,
            started: now_seq,
        };
        s.in_flight = Some(ticket);
        if s.status != SlotStatus::Fetching {
            s.settled = s.status;
        }
        s.status = SlotStatus::Fetching;
        FetchStart::Run(ticket)
    }

    pub(crate) fn finish_fetch(&self, ticket: FetchTicket, result: RemoteResult<Vec<T>>, now: DateTime<Utc>) -> FetchOutcome {
        let outcome = {
            let mut s = self.lock();
            if s.in_flight.map(|t| t.generation) != Some(ticket.generation) {
                FetchOutcome::Superseded
            } else {
                s.in_flight = None;
                match result {
                    Err(e) => {
                        // previous collection stays readable
                        s.status = SlotStatus::Error;
                        s.last_error = Some(e);
                        FetchOutcome::Failed
                    }
                    Ok(_) if s.pending_writes.values().any(|w| w.started > ticket.started) => {
                        s.status = s.settled;
                        s.invalidated = true;
                        FetchOutcome::Discarded
                    }
                    Ok(mut items) => {
                        dedup_by_id(&mut items);
                        replay_pending(&mut items, &s.pending_writes);
                        s.items = items;
                        s.status = SlotStatus::Success;
                        s.last_fetch = Some(now);
                        s.invalidated = false;
                        s.last_error = None;
                        FetchOutcome::Applied
                    }
                }
            }
        };
        self.done.send_replace(ticket.generation);
        outcome
    }

    /// Fetch future dropped before completion
    pub(crate) fn abandon_fetch(&self, ticket: FetchTicket) {
        {
            let mut s = self.lock();
            if s.in_flight.map(|t| t.generation) == Some(ticket.generation) {
                s.in_flight = None;
                s.status = s.settled;
            }
        }
        self.done.send_replace(ticket.generation);
    }

    pub(crate) fn invalidate(&self) {
        let mut s = self.lock();
        s.invalidated = true;
        if s.in_flight.take().is_some() {
            s.status = s.settled;
        }
    }

    /// Apply a synchronous transformation to the collection
    pub fn patch<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        f(&mut self.lock().items)
    }

    /// Insert or replace by id; returns the prior position and value
    pub(crate) fn upsert(&self, entity: T) -> (Option<usize>, Option<T>) {
        upsert_into(&mut self.lock().items, entity)
    }

    pub(crate) fn remove(&self, id: &EntityId) -> (Option<usize>, Option<T>) {
        let mut s = self.lock();
        match s.items.iter().position(|e| e.id() == id) {
            Some(index) => (Some(index), Some(s.items.remove(index))),
            None => (None, None),
        }
    }

    /// Put `id` back to how it was before a write touched it
    pub(crate) fn restore(&self, id: &EntityId, index: Option<usize>, entity: Option<T>) {
        let mut s = self.lock();
        s.items.retain(|e| e.id() != id);
        if let Some(entity) = entity {
            let at = index.unwrap_or(s.items.len()).min(s.items.len());
            s.items.insert(at, entity);
        }
    }

    /// Put writes still pending back on top after a restore
    pub(crate) fn replay(&self) {
        let mut guard = self.lock();
        let s = &mut *guard;
        replay_pending(&mut s.items, &s.pending_writes);
    }

    /// Swap the placeholders of `mutation` for the server's canonical
    /// entities; writes still pending stay applied on top
    pub(crate) fn reconcile(&self, mutation: MutationId, placeholders: &[EntityId], canonical: Vec<T>) {
        let mut guard = self.lock();
        let s = &mut *guard;
        s.pending_writes.remove(&mutation);
        let items = &mut s.items;
        let count = canonical.len();
        for (i, entity) in canonical.into_iter().enumerate() {
            let placeholder = placeholders
                .get(i)
                .and_then(|p| items.iter().position(|e| e.id() == p));
            let existing = items.iter().position(|e| e.id() == entity.id());
            match (placeholder, existing) {
                (Some(p), Some(e)) if p != e => {
                    items[p] = entity;
                    items.remove(e);
                }
                (Some(p), _) => items[p] = entity,
                (None, Some(e)) => items[e] = entity,
                (None, None) => {
                    let at = T::insert_at(items, &entity);
                    items.insert(at, entity);
                }
            }
        }
        for leftover in placeholders.iter().skip(count) {
            items.retain(|e| e.id() != leftover);
        }
        replay_pending(items, &s.pending_writes);
    }

    pub(crate) fn rename_ids(&self, from: &EntityId, to: &EntityId) {
        let mut s = self.lock();
        for entity in s.items.iter_mut() {
            entity.rename_ids(from, to);
        }
        for write in s.pending_writes.values_mut() {
            for overlay in write.overlay.iter_mut() {
                match overlay {
                    Overlay::Put(entity) => entity.rename_ids(from, to),
                    Overlay::Remove(id) if id == from => *id = to.clone(),
                    Overlay::Remove(_) => {}
                }
            }
        }
        dedup_by_id(&mut s.items);
    }

    /// Track a write against this slot, keeping the effects that land here
    pub(crate) fn begin_write(&self, mutation: MutationId, now_seq: u64, effects: &[Effect]) {
        let overlay = effects
            .iter()
            .filter(|effect| effect.slot() == self.key)
            .filter_map(|effect| match effect {
                Effect::Put(record) => T::from_record(record.clone()).map(Overlay::Put),
                Effect::Remove { id, .. } => Some(Overlay::Remove(id.clone())),
            })
            .collect();
        self.lock().pending_writes.insert(
            mutation,
            PendingWrite {
                started: now_seq,
                overlay,
            },
        );
    }

    pub(crate) fn end_write(&self, mutation: MutationId) {
        self.lock().pending_writes.remove(&mutation);
    }

    /// Collection and fetch time, if the slot holds fetched data
    pub(crate) fn persistable(&self) -> Option<(Vec<T>, DateTime<Utc>)> {
        let s = self.lock();
        let success = s.status == SlotStatus::Success
            || (s.status == SlotStatus::Fetching && s.settled == SlotStatus::Success);
        match (success, s.last_fetch) {
            (true, Some(fetched)) => Some((s.items.clone(), fetched)),
            _ => None,
        }
    }

    pub(crate) fn hydrate(&self, items: Vec<T>, last_fetch: DateTime<Utc>) {
        let mut s = self.lock();
        s.items = items;
        s.status = SlotStatus::Success;
        s.settled = SlotStatus::Success;
        s.last_fetch = Some(last_fetch);
        s.invalidated = false;
        s.last_error = None;
    }
}

fn upsert_into<T: CachedEntity>(items: &mut Vec<T>, entity: T) -> (Option<usize>, Option<T>) {
    match items.iter().position(|e| e.id() == entity.id()) {
        Some(index) => {
            let old = std::mem::replace(&mut items[index], entity);
            (Some(index), Some(old))
        }
        None => {
            let at = T::insert_at(items, &entity);
            items.insert(at, entity);
            (None, None)
        }
    }
}

/// Re-apply pending writes, oldest first, over freshly replaced rows
fn replay_pending<T: CachedEntity>(items: &mut Vec<T>, pending: &BTreeMap<MutationId, PendingWrite<T>>) {
    for write in pending.values() {
        for overlay in &write.overlay {
            match overlay {
                Overlay::Put(entity) => {
                    upsert_into(items, entity.clone());
                }
                Overlay::Remove(id) => items.retain(|e| e.id() != id),
            }
        }
    }
}

/// Later duplicates of an id are dropped
fn dedup_by_id<T: Entity>(items: &mut Vec<T>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|e| seen.insert(e.id().clone()));
}
