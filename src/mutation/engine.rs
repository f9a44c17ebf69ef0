//! Optimistic Mutation Engine
//!
//! Every write goes through the same protocol: apply its effects to the
//! cache, dispatch the registered remote operation, then settle by folding
//! the response back (or restoring the prior images) and invalidating the
//! dependent slots. Writes that cannot reach the store are paused and
//! replayed in enqueue order by [`MutationEngine::resume`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::pending::{Effect, MutationId, MutationPlan, MutationStatus, PendingMutation, Reconcile};
use crate::domain::EntityId;
use crate::error::{CacheError, CacheResult};
use crate::registry::{OperationRegistry, RemoteOperation};
use crate::remote::{RemoteError, RemoteResult, RetryPolicy};
use crate::store::{EntityCache, EntityRecord, Prior, SlotKey};

/// Result of handing a plan to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// The store accepted the write; its response
    Confirmed(Value),
    /// Queued for resume; the optimistic effect stays visible
    Paused(MutationId),
}

#[derive(Debug, Default)]
pub struct ResumeReport {
    pub confirmed: Vec<MutationId>,
    /// Dropped and rolled back
    pub failed: Vec<(MutationId, CacheError)>,
    pub still_paused: usize,
    /// `NetworkUnavailable` when resume stopped with mutations left paused
    pub stopped: Option<CacheError>,
}

impl ResumeReport {
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.failed.is_empty() && self.still_paused == 0
    }
}

pub struct MutationEngine {
    cache: Arc<EntityCache>,
    registry: OperationRegistry,
    retry: RetryPolicy,
    online: AtomicBool,
    next_id: AtomicU64,
    paused: Mutex<BTreeMap<MutationId, PendingMutation>>,
    resume_lock: tokio::sync::Mutex<()>,
}

impl MutationEngine {
    pub fn new(cache: Arc<EntityCache>, registry: OperationRegistry, retry: RetryPolicy) -> Self {
        Self {
            cache,
            registry,
            retry,
            online: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            paused: Mutex::new(BTreeMap::new()),
            resume_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns whether connectivity actually changed
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online.swap(online, Ordering::SeqCst) != online;
        if changed {
            tracing::info!(online, "connectivity changed");
        }
        changed
    }

    /// Paused mutations in enqueue order
    pub fn paused(&self) -> Vec<PendingMutation> {
        self.paused.lock().values().cloned().collect()
    }

    pub fn paused_count(&self) -> usize {
        self.paused.lock().len()
    }

    /// Apply `plan` optimistically and send it, or queue it when the store
    /// is out of reach
    pub async fn execute(&self, plan: MutationPlan) -> CacheResult<Dispatched> {
        // unknown keys fail before anything becomes visible
        let op = self.registry.resolve(plan.key)?;
        let id = MutationId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let effects = plan.effects;
        let mut touched: Vec<SlotKey> = effects.iter().map(Effect::slot).collect();
        touched.sort();
        touched.dedup();
        self.cache.begin_write(&touched, id, &effects);

        let snapshot: Vec<Prior> = effects
            .iter()
            .map(|effect| match effect {
                Effect::Put(record) => self.cache.put(record.clone()),
                Effect::Remove { slot, id: entity_id } => self.cache.remove(*slot, entity_id),
            })
            .collect();

        let mut mutation = PendingMutation {
            id,
            registry_key: plan.key.to_string(),
            payload: plan.payload,
            enqueued_at: self.cache.now(),
            status: MutationStatus::AppliedOptimistically,
            snapshot,
            effects,
            reconcile: plan.reconcile,
            invalidates: plan.invalidates,
        };
        tracing::debug!(mutation_id = %id, key = plan.key, "applied optimistically");

        if !self.is_online() {
            return Ok(self.pause(mutation, "offline"));
        }
        if self.paused_count() > 0 {
            return Ok(self.pause(mutation, "queued behind paused mutations"));
        }

        mutation.status = MutationStatus::InFlight;
        match self.dispatch(&op, &mutation).await {
            Ok(value) => {
                self.confirm(&mutation, &value);
                Ok(Dispatched::Confirmed(value))
            }
            Err(e) if e.is_unavailable() => {
                tracing::warn!(mutation_id = %id, key = plan.key, error = %e, "store unreachable");
                Ok(self.pause(mutation, "store unreachable"))
            }
            Err(e) => {
                tracing::warn!(mutation_id = %id, key = plan.key, error = %e, "mutation rejected, rolling back");
                self.roll_back(&mutation);
                Err(CacheError::mutation_failed(plan.key, e))
            }
        }
    }

    /// Replay paused mutations one at a time in enqueue order
    ///
    /// Stops at the first mutation that still cannot reach the store; it and
    /// everything after it stay paused. Concurrent calls run one after the
    /// other, so a mutation is never dispatched twice.
    pub async fn resume(&self) -> ResumeReport {
        let _serial = self.resume_lock.lock().await;
        let mut report = ResumeReport::default();
        if !self.is_online() && self.paused_count() > 0 {
            report.stopped = Some(CacheError::NetworkUnavailable("offline".to_string()));
        }

        while self.is_online() {
            let next = self.paused.lock().values().next().cloned();
            let Some(mut mutation) = next else { break };
            let id = mutation.id;

            let op = match self.registry.resolve(&mutation.registry_key) {
                Ok(op) => op,
                Err(e) => {
                    tracing::error!(mutation_id = %id, key = %mutation.registry_key, "no operation registered, dropping paused mutation");
                    self.paused.lock().remove(&id);
                    report.failed.push((id, e));
                    self.roll_back_chain(&mutation, &mut report);
                    continue;
                }
            };

            mutation.status = MutationStatus::InFlight;
            tracing::debug!(mutation_id = %id, key = %mutation.registry_key, "resuming");
            match self.dispatch(&op, &mutation).await {
                Ok(value) => {
                    self.paused.lock().remove(&id);
                    self.confirm(&mutation, &value);
                    report.confirmed.push(id);
                }
                Err(e) if e.is_unavailable() => {
                    tracing::warn!(mutation_id = %id, error = %e, "store still unreachable, resume stopped");
                    report.stopped = Some(CacheError::NetworkUnavailable(e.to_string()));
                    break;
                }
                Err(e) => {
                    tracing::warn!(mutation_id = %id, key = %mutation.registry_key, error = %e, "resumed mutation rejected");
                    self.paused.lock().remove(&id);
                    report.failed.push((id, CacheError::mutation_failed(mutation.registry_key.clone(), e)));
                    self.roll_back_chain(&mutation, &mut report);
                }
            }
        }

        report.still_paused = self.paused_count();
        if !report.is_empty() {
            tracing::info!(
                confirmed = report.confirmed.len(),
                failed = report.failed.len(),
                still_paused = report.still_paused,
                "resume finished"
            );
        }
        report
    }

    /// Take over a paused mutation restored from durable storage
    pub(crate) fn adopt(&self, mut mutation: PendingMutation) {
        mutation.status = MutationStatus::Paused;
        self.next_id.fetch_max(mutation.id.0 + 1, Ordering::SeqCst);
        self.cache.begin_write(&mutation.touched(), mutation.id, &mutation.effects);
        self.cache.apply(&mutation.effects);
        self.paused.lock().insert(mutation.id, mutation);
    }

    /// Undo a mutation that will never be sent
    pub(crate) fn discard(&self, mutation: &PendingMutation) {
        self.paused.lock().remove(&mutation.id);
        self.roll_back(mutation);
    }

    async fn dispatch(&self, op: &RemoteOperation, mutation: &PendingMutation) -> RemoteResult<Value> {
        self.retry
            .run(&mutation.registry_key, RemoteError::is_unavailable, || op(mutation.payload.clone()))
            .await
    }

    fn pause(&self, mut mutation: PendingMutation, reason: &str) -> Dispatched {
        let id = mutation.id;
        mutation.status = MutationStatus::Paused;
        tracing::info!(mutation_id = %id, key = %mutation.registry_key, reason, "mutation paused");
        self.paused.lock().insert(id, mutation);
        Dispatched::Paused(id)
    }

    fn confirm(&self, mutation: &PendingMutation, response: &Value) {
        if let Reconcile::Replace { slot, placeholders } = &mutation.reconcile {
            match EntityRecord::decode_all(*slot, response) {
                Ok(canonical) => {
                    let renames: Vec<(EntityId, EntityId)> = placeholders
                        .iter()
                        .zip(canonical.iter())
                        .filter(|(placeholder, _)| placeholder.is_temporary())
                        .map(|(placeholder, record)| (placeholder.clone(), record.id().clone()))
                        .collect();
                    // later writes may already sit on top of the placeholder
                    for (from, to) in &renames {
                        self.cache.rename_ids(from, to);
                    }
                    self.rename_in_queue(&renames);
                    let resolved: Vec<EntityId> = placeholders
                        .iter()
                        .map(|p| {
                            renames
                                .iter()
                                .find(|(from, _)| from == p)
                                .map_or_else(|| p.clone(), |(_, to)| to.clone())
                        })
                        .collect();
                    self.cache.reconcile(*slot, mutation.id, &resolved, canonical);
                }
                Err(e) => {
                    tracing::warn!(mutation_id = %mutation.id, error = %e, "unreadable response, relying on refetch");
                }
            }
        }
        self.settle(mutation, MutationStatus::Settled);
    }

    fn roll_back(&self, mutation: &PendingMutation) {
        // its own overlay must not be replayed over the restored rows
        self.cache.end_write(&mutation.touched(), mutation.id);
        self.cache.restore(&mutation.snapshot);
        self.settle(mutation, MutationStatus::RolledBack);
    }

    /// Roll back `mutation` and every later paused mutation building on an
    /// entity it created, newest first
    fn roll_back_chain(&self, mutation: &PendingMutation, report: &mut ResumeReport) {
        let mut created = mutation.created_ids();
        let mut dependents = Vec::new();
        if !created.is_empty() {
            let mut paused = self.paused.lock();
            let later: Vec<MutationId> = paused.keys().copied().filter(|id| *id > mutation.id).collect();
            for id in later {
                let builds_on = paused
                    .get(&id)
                    .is_some_and(|candidate| created.iter().any(|c| candidate.mentions(c)));
                if let Some(dependent) = builds_on.then(|| paused.remove(&id)).flatten() {
                    created.extend(dependent.created_ids());
                    dependents.push(dependent);
                }
            }
        }

        for dependent in dependents.iter().rev() {
            tracing::warn!(mutation_id = %dependent.id, depends_on = %mutation.id, "dropping mutation built on a rolled back one");
            self.roll_back(dependent);
        }
        self.roll_back(mutation);
        for dependent in dependents {
            let reason = RemoteError::rejected(format!("depends on rolled back mutation {}", mutation.id));
            report
                .failed
                .push((dependent.id, CacheError::mutation_failed(dependent.registry_key, reason)));
        }
    }

    fn settle(&self, mutation: &PendingMutation, status: MutationStatus) {
        self.cache.end_write(&mutation.touched(), mutation.id);
        for slot in &mutation.invalidates {
            self.cache.invalidate(*slot);
        }
        tracing::debug!(mutation_id = %mutation.id, key = %mutation.registry_key, ?status, "mutation settled");
    }

    /// Point queued mutations at server ids once their temporary ids resolve
    fn rename_in_queue(&self, renames: &[(EntityId, EntityId)]) {
        if renames.is_empty() {
            return;
        }
        let mut paused = self.paused.lock();
        for mutation in paused.values_mut() {
            for (from, to) in renames {
                mutation.rename_ids(from, to);
            }
        }
    }
}
