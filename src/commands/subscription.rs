//! Subscription Commands

use super::Writable;
use crate::client::{BudgetClient, Read};
use crate::domain::{EntityId, NewSubscription, Subscription, SubscriptionPatch, Transaction};
use crate::error::{CacheError, CacheResult};
use crate::mutation::MutationOutcome;
use crate::registry::keys;
use crate::store::SlotKey;

impl Writable for Subscription {
    const CREATE: &'static str = keys::CREATE_SUBSCRIPTION;
    const UPDATE: &'static str = keys::UPDATE_SUBSCRIPTION;
    const DELETE: &'static str = keys::DELETE_SUBSCRIPTION;
    const CREATED_INVALIDATES: &'static [SlotKey] = &[SlotKey::Subscriptions];
    const CHANGED_INVALIDATES: &'static [SlotKey] = &[SlotKey::Subscriptions];
}

impl BudgetClient {
    pub fn subscriptions(&self) -> Read<Subscription> {
        self.read::<Subscription>()
    }

    pub async fn create_subscription(&self, draft: NewSubscription) -> CacheResult<MutationOutcome<Subscription>> {
        self.create::<Subscription>(&draft).await
    }

    pub async fn update_subscription(
        &self,
        id: &EntityId,
        patch: SubscriptionPatch,
    ) -> CacheResult<MutationOutcome<Subscription>> {
        self.update::<Subscription>(id, &patch).await
    }

    pub async fn delete_subscription(&self, id: &EntityId) -> CacheResult<MutationOutcome<EntityId>> {
        self.delete::<Subscription>(id).await
    }

    /// Record this month's payment of a bill as an outflow from its bucket
    pub async fn pay_bill(&self, id: &EntityId) -> CacheResult<MutationOutcome<Transaction>> {
        let subscription = self
            .cache()
            .get::<Subscription>()
            .find(id)
            .cloned()
            .ok_or_else(|| CacheError::InvalidInput(format!("subscription {} is not cached", id)))?;
        self.add_transaction(subscription.bill_payment()).await
    }
}
