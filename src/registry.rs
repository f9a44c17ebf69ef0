//! Remote Operation Registry
//!
//! Maps the stable name of a write to the function performing it against the
//! remote store. Paused mutations are persisted with this name only, so they
//! can be replayed after a restart without their original call site.
//!
//! # Key stability
//!
//! A key is part of the persisted format. Renaming a key strands every
//! mutation paused under the old name (resume reports it as
//! `UnknownOperation`), and reusing a key for a different operation replays
//! old payloads against the wrong function. Add new keys; never rename or
//! repurpose existing ones.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Bucket, Entity, EntityId, Subscription, Transaction, TransferRequest};
use crate::error::{CacheError, CacheResult};
use crate::remote::{RemoteEntity, RemoteError, RemoteResult, RemoteStore};

pub mod keys {
    pub const CREATE_BUCKET: &str = "createBucket";
    pub const UPDATE_BUCKET: &str = "updateBucket";
    pub const DELETE_BUCKET: &str = "deleteBucket";
    pub const ADD_TRANSACTION: &str = "addTransaction";
    pub const UPDATE_TRANSACTION: &str = "updateTransaction";
    pub const DELETE_TRANSACTION: &str = "deleteTransaction";
    pub const TRANSFER_FUNDS: &str = "transferFunds";
    pub const CREATE_SUBSCRIPTION: &str = "createSubscription";
    pub const UPDATE_SUBSCRIPTION: &str = "updateSubscription";
    pub const DELETE_SUBSCRIPTION: &str = "deleteSubscription";
}

pub type OperationFuture = Pin<Box<dyn Future<Output = RemoteResult<Value>> + Send>>;

/// One remote side effect: JSON payload in, canonical JSON result out
pub type RemoteOperation = Arc<dyn Fn(Value) -> OperationFuture + Send + Sync>;

/// Payload of every update key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload<P> {
    pub id: EntityId,
    pub updates: P,
}

#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: HashMap<String, RemoteOperation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, key: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RemoteResult<Value>> + Send + 'static,
    {
        let op: RemoteOperation = Arc::new(move |payload| Box::pin(handler(payload)) as OperationFuture);
        if self.operations.insert(key.to_string(), op).is_some() {
            tracing::warn!(key, "remote operation re-registered, previous handler replaced");
        }
    }

    pub fn resolve(&self, key: &str) -> CacheResult<RemoteOperation> {
        self.operations
            .get(key)
            .cloned()
            .ok_or_else(|| CacheError::UnknownOperation(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.operations.contains_key(key)
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry").field("keys", &self.keys()).finish()
    }
}

fn decode<P: DeserializeOwned>(key: &str, payload: Value) -> RemoteResult<P> {
    serde_json::from_value(payload).map_err(|e| RemoteError::rejected(format!("malformed `{}` payload: {}", key, e)))
}

fn encode<R: Serialize>(key: &str, result: R) -> RemoteResult<Value> {
    serde_json::to_value(result).map_err(|e| RemoteError::rejected(format!("unencodable `{}` result: {}", key, e)))
}

/// Register create/update/delete of one entity type
fn register_collection<T: RemoteEntity>(
    registry: &mut OperationRegistry,
    remote: &Arc<dyn RemoteStore>,
    [create, update, delete]: [&'static str; 3],
) {
    let store = remote.clone();
    registry.register(create, move |payload| {
        let store = store.clone();
        async move {
            let draft: T::Draft = decode(create, payload)?;
            let row = T::collection(store.as_ref()).insert(&draft).await?;
            encode(create, row)
        }
    });

    let store = remote.clone();
    registry.register(update, move |payload| {
        let store = store.clone();
        async move {
            let UpdatePayload { id, updates } = decode::<UpdatePayload<<T as Entity>::Patch>>(update, payload)?;
            let row = T::collection(store.as_ref()).update(&id, &updates).await?;
            encode(update, row)
        }
    });

    let store = remote.clone();
    registry.register(delete, move |payload| {
        let store = store.clone();
        async move {
            let id: EntityId = decode(delete, payload)?;
            T::collection(store.as_ref()).delete(&id).await?;
            Ok(Value::Null)
        }
    });
}

/// Registry with every operation the budget client issues
pub fn default_registry(remote: Arc<dyn RemoteStore>) -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    register_collection::<Bucket>(
        &mut registry,
        &remote,
        [keys::CREATE_BUCKET, keys::UPDATE_BUCKET, keys::DELETE_BUCKET],
    );
    register_collection::<Transaction>(
        &mut registry,
        &remote,
        [keys::ADD_TRANSACTION, keys::UPDATE_TRANSACTION, keys::DELETE_TRANSACTION],
    );
    register_collection::<Subscription>(
        &mut registry,
        &remote,
        [keys::CREATE_SUBSCRIPTION, keys::UPDATE_SUBSCRIPTION, keys::DELETE_SUBSCRIPTION],
    );

    registry.register(keys::TRANSFER_FUNDS, move |payload| {
        let store = remote.clone();
        async move {
            let request: TransferRequest = decode(keys::TRANSFER_FUNDS, payload)?;
            let legs = store.transfer(&request).await?;
            encode(keys::TRANSFER_FUNDS, legs)
        }
    });
    registry
}
