//! Budget Client
//!
//! The explicit cache object a UI holds for its whole lifetime: reads come
//! from the entity cache (refreshing stale slots in the background), writes
//! go through the mutation engine, and every change is persisted.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::commands::{create_plan, delete_plan, update_plan, Writable};
use crate::config::CacheConfig;
use crate::domain::EntityId;
use crate::error::{CacheError, CacheResult};
use crate::mutation::{Dispatched, MutationEngine, MutationOutcome, MutationPlan, PendingMutation, ResumeReport};
use crate::persist::{DurableStorage, FileStorage, HydrateReport, Persister};
use crate::registry::{default_registry, OperationRegistry};
use crate::remote::{RemoteStore, RestRemote};
use crate::store::{EntityCache, SlotStatus, SlotView};

/// A cached read, plus the background refresh it started if the slot was stale
#[derive(Debug)]
pub struct Read<T> {
    pub view: SlotView<T>,
    pub refresh: Option<JoinHandle<()>>,
}

impl<T> Read<T> {
    pub fn items(&self) -> &[T] {
        &self.view.items
    }
}

/// What `start` restored and replayed
#[derive(Debug)]
pub struct Startup {
    pub hydrated: HydrateReport,
    pub resumed: ResumeReport,
}

struct Inner {
    config: CacheConfig,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<EntityCache>,
    engine: MutationEngine,
    persister: Persister,
}

#[derive(Clone)]
pub struct BudgetClient {
    inner: Arc<Inner>,
}

impl BudgetClient {
    pub fn new(
        config: CacheConfig,
        remote: Arc<dyn RemoteStore>,
        storage: Arc<dyn DurableStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = default_registry(remote.clone());
        Self::with_registry(config, remote, storage, clock, registry)
    }

    pub fn with_registry(
        config: CacheConfig,
        remote: Arc<dyn RemoteStore>,
        storage: Arc<dyn DurableStorage>,
        clock: Arc<dyn Clock>,
        registry: OperationRegistry,
    ) -> Self {
        let cache = Arc::new(EntityCache::new(clock, config.stale_window()));
        let engine = MutationEngine::new(cache.clone(), registry, config.mutation_retry());
        let persister = Persister::new(storage, config.storage_key.clone(), config.retention());
        Self {
            inner: Arc::new(Inner {
                config,
                remote,
                cache,
                engine,
                persister,
            }),
        }
    }

    /// Client for the configured REST endpoint, persisting under `storage_dir`
    pub fn connect(config: CacheConfig, storage_dir: impl AsRef<Path>) -> CacheResult<Self> {
        let remote_config = config
            .remote
            .clone()
            .ok_or_else(|| CacheError::Config("no remote endpoint configured".to_string()))?;
        let remote = Arc::new(RestRemote::new(&remote_config)?);
        let storage = Arc::new(FileStorage::new(storage_dir)?);
        Ok(Self::new(config, remote, storage, Arc::new(SystemClock)))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &EntityCache {
        &self.inner.cache
    }

    pub fn engine(&self) -> &MutationEngine {
        &self.inner.engine
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.inner.cache.now()
    }

    // ========================
    // Reads
    // ========================

    /// Whatever the slot holds right now; stale slots refresh in the background
    pub fn read<T: Writable>(&self) -> Read<T> {
        let view = self.inner.cache.get::<T>();
        let refresh = if self.inner.cache.needs_refresh(T::SLOT) {
            self.spawn_refresh::<T>()
        } else {
            None
        };
        Read { view, refresh }
    }

    /// Fetch the slot of `T` now, joining a fetch already in flight
    pub async fn refresh<T: Writable>(&self) -> SlotView<T> {
        let remote = self.inner.remote.clone();
        let policy = self.inner.config.query_retry();
        let view = self
            .inner
            .cache
            .fetch::<T, _, _>(|| async move {
                policy
                    .run(T::SLOT.as_str(), |e| !e.is_not_found(), || T::collection(remote.as_ref()).list())
                    .await
            })
            .await;
        if view.status == SlotStatus::Success {
            self.auto_persist();
        }
        view
    }

    fn spawn_refresh<T: Writable>(&self) -> Option<JoinHandle<()>> {
        let Ok(runtime) = Handle::try_current() else {
            tracing::debug!(slot = %T::SLOT, "no async runtime, skipping background refresh");
            return None;
        };
        let client = self.clone();
        Some(runtime.spawn(async move {
            client.refresh::<T>().await;
        }))
    }

    // ========================
    // Writes
    // ========================

    pub async fn create<T: Writable>(&self, draft: &T::Draft) -> CacheResult<MutationOutcome<T>> {
        let (plan, optimistic) = create_plan::<T>(draft, self.now())?;
        self.run(plan, optimistic).await
    }

    /// Update a cached entity; the patch is merged optimistically
    pub async fn update<T: Writable>(&self, id: &EntityId, patch: &T::Patch) -> CacheResult<MutationOutcome<T>> {
        let current = self
            .inner
            .cache
            .get::<T>()
            .find(id)
            .cloned()
            .ok_or_else(|| CacheError::InvalidInput(format!("{} {} is not cached", T::SLOT, id)))?;
        let (plan, optimistic) = update_plan(&current, patch, self.now())?;
        self.run(plan, optimistic).await
    }

    pub async fn delete<T: Writable>(&self, id: &EntityId) -> CacheResult<MutationOutcome<EntityId>> {
        let plan = delete_plan::<T>(id)?;
        self.run(plan, id.clone()).await
    }

    pub(crate) async fn run<R: DeserializeOwned>(&self, plan: MutationPlan, optimistic: R) -> CacheResult<MutationOutcome<R>> {
        let key = plan.key;
        let result = self.inner.engine.execute(plan).await;
        self.auto_persist();
        match result? {
            Dispatched::Paused(mutation_id) => Ok(MutationOutcome::Paused {
                mutation_id,
                optimistic,
            }),
            Dispatched::Confirmed(Value::Null) => Ok(MutationOutcome::Confirmed(optimistic)),
            Dispatched::Confirmed(response) => match serde_json::from_value(response) {
                Ok(canonical) => Ok(MutationOutcome::Confirmed(canonical)),
                Err(e) => {
                    tracing::warn!(key, error = %e, "unexpected response shape, returning optimistic value");
                    Ok(MutationOutcome::Confirmed(optimistic))
                }
            },
        }
    }

    // ========================
    // Connectivity & Resume
    // ========================

    pub fn is_online(&self) -> bool {
        self.inner.engine.is_online()
    }

    /// While offline, writes are applied locally and queued; coming back
    /// online replays the queue in the background
    pub fn set_online(&self, online: bool) {
        let changed = self.inner.engine.set_online(online);
        if online && changed && self.inner.engine.paused_count() > 0 {
            self.spawn_resume();
        }
    }

    pub fn paused_mutations(&self) -> Vec<PendingMutation> {
        self.inner.engine.paused()
    }

    pub async fn resume_paused_mutations(&self) -> ResumeReport {
        let report = self.inner.engine.resume().await;
        if !report.confirmed.is_empty() || !report.failed.is_empty() {
            self.auto_persist();
        }
        report
    }

    /// Go online and replay the queue before returning
    pub async fn reconnect(&self) -> ResumeReport {
        self.inner.engine.set_online(true);
        self.resume_paused_mutations().await
    }

    fn spawn_resume(&self) -> Option<JoinHandle<ResumeReport>> {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("no async runtime, paused mutations wait for reconnect");
            return None;
        };
        let client = self.clone();
        Some(runtime.spawn(async move { client.resume_paused_mutations().await }))
    }

    // ========================
    // Persistence
    // ========================

    /// Hydrate, then replay the restored paused mutations; call once at startup
    pub async fn start(&self) -> Startup {
        let hydrated = self.hydrate();
        let resumed = if self.inner.engine.paused_count() > 0 {
            self.resume_paused_mutations().await
        } else {
            ResumeReport::default()
        };
        Startup { hydrated, resumed }
    }

    /// Restore persisted slots and paused mutations without sending anything
    pub fn hydrate(&self) -> HydrateReport {
        let report = self.inner.persister.hydrate(&self.inner.cache, &self.inner.engine);
        if !report.expired.is_empty() || report.error.is_some() {
            self.auto_persist();
        }
        report
    }

    /// Persist in the background without blocking the caller
    pub fn persist(&self) {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("no async runtime, cache state not persisted");
            return;
        };
        let client = self.clone();
        runtime.spawn(async move {
            if let Err(e) = client.persist_now().await {
                tracing::error!(error = %e, "failed to persist cache state");
            }
        });
    }

    pub async fn persist_now(&self) -> CacheResult<()> {
        self.inner.persister.persist_now(&self.inner.cache, &self.inner.engine).await
    }

    fn auto_persist(&self) {
        if self.inner.config.auto_persist {
            self.persist();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::clock::ManualClock;
    use crate::domain::{Bucket, BucketPatch, BucketType, NewBucket, NewSubscription, Subscription, Transaction, TransferRequest};
    use crate::persist::MemoryStorage;
    use crate::remote::{MemoryRemote, RemoteError};
    use crate::store::SlotKey;
    use chrono::Duration;
    use rust_decimal::Decimal;

    struct Setup {
        client: BudgetClient,
        remote: Arc<MemoryRemote>,
        storage: Arc<MemoryStorage>,
        clock: ManualClock,
    }

    fn quiet_config() -> CacheConfig {
        CacheConfig {
            auto_persist: false,
            ..CacheConfig::without_backoff()
        }
    }

    fn setup() -> Setup {
        let clock = ManualClock::new(Utc::now());
        let remote = Arc::new(MemoryRemote::with_clock(Arc::new(clock.clone())));
        let storage = Arc::new(MemoryStorage::new());
        let client = BudgetClient::new(quiet_config(), remote.clone(), storage.clone(), Arc::new(clock.clone()));
        Setup {
            client,
            remote,
            storage,
            clock,
        }
    }

    fn groceries() -> NewBucket {
        NewBucket::new("Groceries", BucketType::Envelope, Decimal::from(300))
    }

    fn assert_unique_ids<T: Writable>(client: &BudgetClient) {
        let items = client.cache().get::<T>().items;
        let ids: HashSet<EntityId> = items.iter().map(|e| e.id().clone()).collect();
        assert_eq!(ids.len(), items.len(), "duplicate ids in {}", T::SLOT);
    }

    /// Yield until `done` holds, so a spawned write can reach the remote
    async fn until(done: impl Fn() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn test_offline_create_resumes_with_server_id() {
        let s = setup();
        s.client.set_online(false);

        let outcome = s.client.create_bucket(groceries()).await.unwrap();

        let temp = outcome.value().id.clone();
        assert!(outcome.is_paused());
        assert!(temp.is_temporary());
        assert!(s.client.cache().get::<Bucket>().find(&temp).is_some());
        assert_eq!(s.client.paused_mutations().len(), 1);

        let report = s.client.reconnect().await;

        assert_eq!(report.confirmed.len(), 1);
        let buckets = s.client.cache().get::<Bucket>().items;
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "Groceries");
        assert!(!buckets[0].id.is_temporary());
        assert!(s.client.cache().get::<Bucket>().find(&temp).is_none());
    }

    #[tokio::test]
    async fn test_transfer_legs_visible_before_confirmation() {
        let s = setup();
        s.remote.hold_calls();
        let request = TransferRequest::new("a", "b", Decimal::from(50), "Savings");
        let task = tokio::spawn({
            let client = s.client.clone();
            async move { client.transfer(request).await }
        });

        until(|| s.client.cache().get::<Transaction>().items.len() == 2).await;
        let pending = s.client.cache().get::<Transaction>().items;
        assert!(pending.iter().all(|t| t.is_transfer && t.id.is_temporary()));
        let amounts: HashSet<Decimal> = pending.iter().map(|t| t.amount).collect();
        assert_eq!(amounts, HashSet::from([Decimal::from(-50), Decimal::from(50)]));

        s.remote.open_gate();
        let outcome = task.await.unwrap().unwrap();

        assert!(!outcome.is_paused());
        let settled = s.client.cache().get::<Transaction>().items;
        assert_eq!(settled.len(), 2);
        assert!(settled.iter().all(|t| !t.id.is_temporary()));
        assert!(s.client.cache().get::<Transaction>().invalidated);
        assert!(s.client.cache().get::<Bucket>().invalidated);
    }

    #[tokio::test]
    async fn test_failed_transfer_removes_both_legs() {
        let s = setup();
        s.remote.hold_calls();
        let request = TransferRequest::new("a", "b", Decimal::from(50), "Savings");
        let task = tokio::spawn({
            let client = s.client.clone();
            async move { client.transfer(request).await }
        });
        until(|| s.client.cache().get::<Transaction>().items.len() == 2).await;

        s.remote.fail_next(RemoteError::rejected("insufficient privileges"));
        s.remote.open_gate();
        let err = task.await.unwrap().unwrap_err();

        assert!(matches!(err, CacheError::MutationFailed { .. }));
        assert!(s.client.cache().get::<Transaction>().items.is_empty());
        assert!(s.remote.transaction_rows().is_empty());
    }

    #[tokio::test]
    async fn test_reads_refresh_only_when_stale() {
        let s = setup();
        s.remote.transactions().insert(&crate::domain::NewTransaction::new("b1", Decimal::from(-4), "tea")).await.unwrap();

        // t=0: empty slot, fetch started
        let first = s.client.transactions();
        assert!(first.items().is_empty());
        first.refresh.unwrap().await.unwrap();

        // t=1min: fresh
        s.clock.advance(Duration::minutes(1));
        let second = s.client.transactions();
        assert_eq!(second.items().len(), 1);
        assert!(second.refresh.is_none());

        // t=6min: cached data returned, refresh in the background
        s.clock.advance(Duration::minutes(5));
        let third = s.client.transactions();
        assert_eq!(third.items().len(), 1);
        third.refresh.unwrap().await.unwrap();
        assert_eq!(s.remote.calls_matching("list transactions"), 2);
    }

    #[tokio::test]
    async fn test_crud_sequence_keeps_ids_unique() {
        let s = setup();
        let a = s.client.create_bucket(groceries()).await.unwrap().into_value();
        s.client.refresh::<Bucket>().await;
        assert_unique_ids::<Bucket>(&s.client);

        let b = s
            .client
            .create_bucket(NewBucket::new("Trip", BucketType::Goal, Decimal::from(2000)))
            .await
            .unwrap()
            .into_value();
        assert_unique_ids::<Bucket>(&s.client);

        let patch = BucketPatch {
            name: Some("Food".into()),
            ..Default::default()
        };
        let renamed = s.client.update_bucket(&a.id, patch).await.unwrap().into_value();
        assert_eq!(renamed.name, "Food");
        assert_unique_ids::<Bucket>(&s.client);

        s.client.delete_bucket(&b.id).await.unwrap();
        s.client.refresh::<Bucket>().await;
        assert_unique_ids::<Bucket>(&s.client);

        let names: Vec<String> = s.client.cache().get::<Bucket>().items.into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["Food"]);
    }

    #[tokio::test]
    async fn test_update_requires_cached_entity() {
        let s = setup();
        let err = s
            .client
            .update_bucket(&EntityId::from("missing"), BucketPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidInput(_)));
        assert!(s.remote.journal().is_empty());
    }

    #[tokio::test]
    async fn test_pay_bill_and_payday() {
        let s = setup();
        let income = s
            .client
            .create_bucket(NewBucket::new("Salary", BucketType::Income, Decimal::ZERO))
            .await
            .unwrap()
            .into_value();
        let bill = s
            .client
            .create_subscription(NewSubscription {
                name: "Netflix".into(),
                amount: Decimal::new(1599, 2),
                day_of_month: 12,
                bucket_id: income.id.clone(),
            })
            .await
            .unwrap()
            .into_value();

        let paid = s.client.pay_bill(&bill.id).await.unwrap().into_value();
        assert_eq!(paid.amount, Decimal::new(-1599, 2));
        assert_eq!(paid.note, "Bill: Netflix");

        let deposit = s.client.payday(&income.id, Decimal::from(2500)).await.unwrap().into_value();
        assert_eq!(deposit.note, "Payday Deposit");
        assert!(matches!(
            s.client.payday(&income.id, Decimal::ZERO).await,
            Err(CacheError::InvalidInput(_))
        ));
        assert_eq!(s.client.cache().get::<Subscription>().items.len(), 1);
    }

    #[tokio::test]
    async fn test_restart_resumes_persisted_write() {
        let s = setup();
        s.client.set_online(false);
        s.client.create_bucket(groceries()).await.unwrap();
        s.client.persist_now().await.unwrap();

        let restarted = BudgetClient::new(quiet_config(), s.remote.clone(), s.storage.clone(), Arc::new(s.clock.clone()));
        let report = restarted.hydrate();
        assert_eq!(report.mutations.len(), 1);

        let resumed = restarted.reconnect().await;
        assert_eq!(resumed.confirmed.len(), 1);
        assert_eq!(s.remote.bucket_rows().len(), 1);
        assert!(restarted.reconnect().await.is_empty());
        assert_eq!(s.remote.calls_matching("insert buckets"), 1);
    }

    #[tokio::test]
    async fn test_ordered_resume_of_edits_to_same_transaction() {
        let s = setup();
        let tx = s
            .client
            .add_transaction(crate::domain::NewTransaction::new("b1", Decimal::from(-10), "lunch"))
            .await
            .unwrap()
            .into_value();

        s.client.set_online(false);
        for note in ["lunch with Sam", "team lunch"] {
            let patch = crate::domain::TransactionPatch {
                note: Some(note.into()),
                ..Default::default()
            };
            s.client.update_transaction(&tx.id, patch).await.unwrap();
        }
        s.client.reconnect().await;

        let updates: Vec<String> = s
            .remote
            .journal()
            .into_iter()
            .filter(|call| call.starts_with("update transactions"))
            .collect();
        assert_eq!(updates.len(), 2);
        assert_eq!(s.remote.transaction_rows()[0].note, "team lunch");
        assert_eq!(s.client.cache().get::<Transaction>().find(&tx.id).unwrap().note, "team lunch");
        assert!(s.client.cache().needs_refresh(SlotKey::Buckets));
    }

    #[tokio::test]
    async fn test_paused_create_survives_restart_and_stale_refetch() {
        let s = setup();
        s.client.refresh::<Bucket>().await;
        s.client.set_online(false);
        let temp = s.client.create_bucket(groceries()).await.unwrap().into_value().id;
        s.client.persist_now().await.unwrap();

        let restarted = BudgetClient::new(quiet_config(), s.remote.clone(), s.storage.clone(), Arc::new(s.clock.clone()));
        restarted.hydrate();
        s.clock.advance(Duration::minutes(6));
        let stale = restarted.buckets();
        assert!(stale.view.find(&temp).is_some());
        stale.refresh.unwrap().await.unwrap();

        // the server has no row yet; the queued create stays visible
        assert!(restarted.cache().get::<Bucket>().find(&temp).is_some());
        assert_eq!(restarted.paused_mutations().len(), 1);

        let report = restarted.reconnect().await;
        assert_eq!(report.confirmed.len(), 1);
        let buckets = restarted.cache().get::<Bucket>().items;
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].id, s.remote.bucket_rows()[0].id);
    }

    #[tokio::test]
    async fn test_paused_create_is_visible_after_restart_without_fetched_slot() {
        let s = setup();
        s.client.set_online(false);
        let temp = s.client.create_bucket(groceries()).await.unwrap().into_value().id;
        s.client.persist_now().await.unwrap();

        let restarted = BudgetClient::new(quiet_config(), s.remote.clone(), s.storage.clone(), Arc::new(s.clock.clone()));
        let report = restarted.hydrate();

        assert!(report.slots.is_empty());
        assert!(restarted.cache().get::<Bucket>().find(&temp).is_some());
    }

    #[tokio::test]
    async fn test_start_replays_restored_queue() {
        let s = setup();
        s.client.set_online(false);
        s.client.create_bucket(groceries()).await.unwrap();
        s.client.persist_now().await.unwrap();

        let restarted = BudgetClient::new(quiet_config(), s.remote.clone(), s.storage.clone(), Arc::new(s.clock.clone()));
        let startup = restarted.start().await;

        assert_eq!(startup.hydrated.mutations.len(), 1);
        assert_eq!(startup.resumed.confirmed.len(), 1);
        assert!(restarted.paused_mutations().is_empty());
        assert_eq!(s.remote.bucket_rows()[0].name, "Groceries");
    }

    #[tokio::test]
    async fn test_start_offline_keeps_queue_paused() {
        let s = setup();
        s.client.set_online(false);
        s.client.create_bucket(groceries()).await.unwrap();
        s.client.persist_now().await.unwrap();

        let restarted = BudgetClient::new(quiet_config(), s.remote.clone(), s.storage.clone(), Arc::new(s.clock.clone()));
        restarted.set_online(false);
        let startup = restarted.start().await;

        assert_eq!(startup.resumed.still_paused, 1);
        assert!(matches!(startup.resumed.stopped, Some(CacheError::NetworkUnavailable(_))));
        assert!(s.remote.bucket_rows().is_empty());
    }

    #[tokio::test]
    async fn test_coming_back_online_replays_queue() {
        let s = setup();
        s.client.set_online(false);
        s.client.create_bucket(groceries()).await.unwrap();
        assert!(s.remote.bucket_rows().is_empty());

        s.client.set_online(true);

        until(|| s.client.paused_mutations().is_empty()).await;
        assert_eq!(s.remote.bucket_rows().len(), 1);
        assert!(!s.client.cache().get::<Bucket>().items[0].id.is_temporary());
    }

    #[test]
    fn test_connect_requires_remote_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = BudgetClient::connect(CacheConfig::default(), dir.path()).err().unwrap();
        assert!(matches!(err, CacheError::Config(_)));
    }
}
