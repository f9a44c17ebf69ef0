//! Bucket Commands

use super::Writable;
use crate::client::{BudgetClient, Read};
use crate::domain::{Bucket, BucketPatch, EntityId, NewBucket};
use crate::error::CacheResult;
use crate::mutation::MutationOutcome;
use crate::registry::keys;
use crate::store::SlotKey;

impl Writable for Bucket {
    const CREATE: &'static str = keys::CREATE_BUCKET;
    const UPDATE: &'static str = keys::UPDATE_BUCKET;
    const DELETE: &'static str = keys::DELETE_BUCKET;
    const CREATED_INVALIDATES: &'static [SlotKey] = &[SlotKey::Buckets];
    // transactions render their bucket's name and type
    const CHANGED_INVALIDATES: &'static [SlotKey] = &[SlotKey::Buckets, SlotKey::Transactions];
}

impl BudgetClient {
    pub fn buckets(&self) -> Read<Bucket> {
        self.read::<Bucket>()
    }

    pub async fn create_bucket(&self, draft: NewBucket) -> CacheResult<MutationOutcome<Bucket>> {
        self.create::<Bucket>(&draft).await
    }

    pub async fn update_bucket(&self, id: &EntityId, patch: BucketPatch) -> CacheResult<MutationOutcome<Bucket>> {
        self.update::<Bucket>(id, &patch).await
    }

    pub async fn delete_bucket(&self, id: &EntityId) -> CacheResult<MutationOutcome<EntityId>> {
        self.delete::<Bucket>(id).await
    }
}
