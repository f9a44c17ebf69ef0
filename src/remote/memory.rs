//! In-Memory Remote Store
//!
//! A process-local backing store with server-assigned ids. Besides serving
//! as an offline backend, it can be switched offline, told to fail the
//! next call, held until released, and it journals every call it serves.

use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::traits::{RemoteCollection, RemoteStore};
use super::{RemoteError, RemoteResult};
use crate::clock::{Clock, SystemClock};
use crate::domain::{Bucket, Entity, EntityId, Subscription, Transaction, TransferRequest};

struct Shared {
    online: AtomicBool,
    next_id: AtomicU64,
    failures: Mutex<VecDeque<RemoteError>>,
    journal: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    clock: Arc<dyn Clock>,
}

impl Shared {
    /// Common preamble of every call: gate, connectivity, injected failure
    async fn enter(&self, call: String) -> RemoteResult<()> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::unavailable("offline"));
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        self.journal.lock().push(call);
        Ok(())
    }

    fn server_id(&self) -> EntityId {
        EntityId::new(format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

/// One collection of rows
pub struct MemoryTable<T: Entity> {
    name: &'static str,
    shared: Arc<Shared>,
    rows: Mutex<Vec<T>>,
    order: Option<fn(&T, &T) -> CmpOrdering>,
}

impl<T: Entity> MemoryTable<T> {
    fn new(name: &'static str, shared: Arc<Shared>, order: Option<fn(&T, &T) -> CmpOrdering>) -> Self {
        Self {
            name,
            shared,
            rows: Mutex::new(Vec::new()),
            order,
        }
    }

    fn insert_row(&self, draft: &T::Draft) -> T {
        let row = T::synthesize(draft, self.shared.server_id(), self.shared.clock.now());
        self.rows.lock().push(row.clone());
        row
    }

    pub fn rows(&self) -> Vec<T> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl<T: Entity> RemoteCollection<T> for MemoryTable<T> {
    async fn list(&self) -> RemoteResult<Vec<T>> {
        self.shared.enter(format!("list {}", self.name)).await?;
        let mut rows = self.rows.lock().clone();
        if let Some(order) = self.order {
            rows.sort_by(order);
        }
        Ok(rows)
    }

    async fn insert(&self, draft: &T::Draft) -> RemoteResult<T> {
        self.shared.enter(format!("insert {}", self.name)).await?;
        Ok(self.insert_row(draft))
    }

    async fn update(&self, id: &EntityId, patch: &T::Patch) -> RemoteResult<T> {
        self.shared.enter(format!("update {} {}", self.name, id)).await?;
        let now = self.shared.clock.now();
        let mut rows = self.rows.lock();
        let row = rows
            .iter_mut()
            .find(|row| row.id() == id)
            .ok_or_else(|| RemoteError::not_found(format!("{} {}", self.name, id)))?;
        row.merge(patch, now);
        Ok(row.clone())
    }

    async fn delete(&self, id: &EntityId) -> RemoteResult<()> {
        self.shared.enter(format!("delete {} {}", self.name, id)).await?;
        self.rows.lock().retain(|row| row.id() != id);
        Ok(())
    }
}

fn oldest_first(a: &Bucket, b: &Bucket) -> CmpOrdering {
    a.created_at.cmp(&b.created_at)
}

fn newest_first(a: &Transaction, b: &Transaction) -> CmpOrdering {
    b.date.cmp(&a.date)
}

/// In-memory implementation of the remote store
pub struct MemoryRemote {
    shared: Arc<Shared>,
    buckets: MemoryTable<Bucket>,
    transactions: MemoryTable<Transaction>,
    subscriptions: MemoryTable<Subscription>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let shared = Arc::new(Shared {
            online: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
            failures: Mutex::new(VecDeque::new()),
            journal: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            clock,
        });
        Self {
            buckets: MemoryTable::new("buckets", shared.clone(), Some(oldest_first as fn(&Bucket, &Bucket) -> CmpOrdering)),
            transactions: MemoryTable::new("transactions", shared.clone(), Some(newest_first as fn(&Transaction, &Transaction) -> CmpOrdering)),
            subscriptions: MemoryTable::new("subscriptions", shared.clone(), None),
            shared,
        }
    }

    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::SeqCst);
    }

    /// Fail the next call (of any kind) with `err`
    pub fn fail_next(&self, err: RemoteError) {
        self.shared.failures.lock().push_back(err);
    }

    /// Make every call wait until [`MemoryRemote::release_calls`] lets it through
    pub fn hold_calls(&self) {
        *self.shared.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_calls(&self, count: usize) {
        if let Some(gate) = self.shared.gate.lock().as_ref() {
            gate.add_permits(count);
        }
    }

    /// Stop holding calls and let all waiting ones through
    pub fn open_gate(&self) {
        if let Some(gate) = self.shared.gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Calls served so far, e.g. `"insert buckets"` or `"update transactions srv-3"`
    pub fn journal(&self) -> Vec<String> {
        self.shared.journal.lock().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.shared.journal.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn bucket_rows(&self) -> Vec<Bucket> {
        self.buckets.rows()
    }

    pub fn transaction_rows(&self) -> Vec<Transaction> {
        self.transactions.rows()
    }

    pub fn subscription_rows(&self) -> Vec<Subscription> {
        self.subscriptions.rows()
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn buckets(&self) -> &dyn RemoteCollection<Bucket> {
        &self.buckets
    }

    fn transactions(&self) -> &dyn RemoteCollection<Transaction> {
        &self.transactions
    }

    fn subscriptions(&self) -> &dyn RemoteCollection<Subscription> {
        &self.subscriptions
    }

    async fn transfer(&self, request: &TransferRequest) -> RemoteResult<Vec<Transaction>> {
        self.shared.enter("transfer transactions".to_string()).await?;
        request.validate().map_err(RemoteError::rejected)?;
        let [outflow, inflow] = request.legs();
        Ok(vec![self.transactions.insert_row(&outflow), self.transactions.insert_row(&inflow)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BucketType, NewBucket, NewTransaction};
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_insert_assigns_server_ids() {
        let remote = MemoryRemote::new();
        let created = remote
            .buckets()
            .insert(&NewBucket::new("Food", BucketType::Envelope, Decimal::from(200)))
            .await
            .expect("Failed to create");

        assert!(!created.id.is_temporary());
        assert_eq!(remote.bucket_rows().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_calls_are_unavailable() {
        let remote = MemoryRemote::new();
        remote.set_online(false);

        let err = remote.buckets().list().await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(remote.journal().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let remote = MemoryRemote::new();
        remote.fail_next(RemoteError::rejected("boom"));

        assert!(remote.transactions().list().await.is_err());
        assert!(remote.transactions().list().await.is_ok());
    }

    #[tokio::test]
    async fn test_transactions_listed_newest_first() {
        let remote = MemoryRemote::new();
        let early = chrono::Utc::now() - chrono::Duration::days(2);
        let late = chrono::Utc::now();
        remote.transactions().insert(&NewTransaction::new("b", Decimal::ONE, "old").on(early)).await.unwrap();
        remote.transactions().insert(&NewTransaction::new("b", Decimal::ONE, "new").on(late)).await.unwrap();

        let listed = remote.transactions().list().await.unwrap();
        assert_eq!(listed[0].note, "new");
        assert_eq!(listed[1].note, "old");
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let remote = MemoryRemote::new();
        let err = remote
            .subscriptions()
            .update(&EntityId::from("nope"), &Default::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
