//! Remote Store - Core Traits
//!
//! Defines the abstract interface of the backing store.
//! Implementations can be a PostgREST endpoint, in-memory, etc.

use async_trait::async_trait;

use super::RemoteResult;
use crate::domain::{Bucket, Entity, EntityId, Subscription, Transaction, TransferRequest};

/// CRUD over one remote collection
///
/// Generic over any Entity type. `list` returns rows in the order the
/// cache expects (buckets by creation time, transactions newest first).
#[async_trait]
pub trait RemoteCollection<T: Entity>: Send + Sync {
    async fn list(&self) -> RemoteResult<Vec<T>>;

    /// Insert a row; returns the canonical row with its server id
    async fn insert(&self, draft: &T::Draft) -> RemoteResult<T>;

    async fn update(&self, id: &EntityId, patch: &T::Patch) -> RemoteResult<T>;

    async fn delete(&self, id: &EntityId) -> RemoteResult<()>;
}

/// The whole backing store as seen by the cache
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn buckets(&self) -> &dyn RemoteCollection<Bucket>;

    fn transactions(&self) -> &dyn RemoteCollection<Transaction>;

    fn subscriptions(&self) -> &dyn RemoteCollection<Subscription>;

    /// Insert both legs of a transfer atomically; outflow first
    async fn transfer(&self, request: &TransferRequest) -> RemoteResult<Vec<Transaction>>;
}

/// Entities with a collection in the remote store
pub trait RemoteEntity: Entity {
    fn collection(remote: &dyn RemoteStore) -> &dyn RemoteCollection<Self>;
}

impl RemoteEntity for Bucket {
    fn collection(remote: &dyn RemoteStore) -> &dyn RemoteCollection<Self> {
        remote.buckets()
    }
}

impl RemoteEntity for Transaction {
    fn collection(remote: &dyn RemoteStore) -> &dyn RemoteCollection<Self> {
        remote.transactions()
    }
}

impl RemoteEntity for Subscription {
    fn collection(remote: &dyn RemoteStore) -> &dyn RemoteCollection<Self> {
        remote.subscriptions()
    }
}
