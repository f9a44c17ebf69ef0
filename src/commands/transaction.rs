//! Transaction Commands
//!
//! Besides plain CRUD: transfers between buckets (two linked inserts sent as
//! one remote call) and payday deposits.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{payload, Writable};
use crate::client::{BudgetClient, Read};
use crate::domain::{Entity, EntityId, NewTransaction, Transaction, TransactionPatch, TransferRequest};
use crate::error::{CacheError, CacheResult};
use crate::mutation::{Effect, MutationOutcome, MutationPlan, Reconcile};
use crate::registry::keys;
use crate::store::{CachedEntity, SlotKey};

impl Writable for Transaction {
    const CREATE: &'static str = keys::ADD_TRANSACTION;
    const UPDATE: &'static str = keys::UPDATE_TRANSACTION;
    const DELETE: &'static str = keys::DELETE_TRANSACTION;
    // balances are sums over transactions
    const CREATED_INVALIDATES: &'static [SlotKey] = &[SlotKey::Transactions, SlotKey::Buckets];
    const CHANGED_INVALIDATES: &'static [SlotKey] = &[SlotKey::Transactions, SlotKey::Buckets];
}

/// Both legs applied together, reconciled together, rolled back together
pub fn transfer_plan(request: &TransferRequest, now: DateTime<Utc>) -> CacheResult<(MutationPlan, Vec<Transaction>)> {
    request.validate().map_err(CacheError::InvalidInput)?;
    let legs: Vec<Transaction> = request
        .legs()
        .iter()
        .map(|leg| Transaction::synthesize(leg, EntityId::temporary(now), now))
        .collect();
    let plan = MutationPlan {
        key: keys::TRANSFER_FUNDS,
        payload: payload(request)?,
        effects: legs.iter().cloned().map(|leg| Effect::Put(leg.into_record())).collect(),
        reconcile: Reconcile::Replace {
            slot: SlotKey::Transactions,
            placeholders: legs.iter().map(|leg| leg.id.clone()).collect(),
        },
        invalidates: Transaction::CREATED_INVALIDATES.to_vec(),
    };
    Ok((plan, legs))
}

impl BudgetClient {
    pub fn transactions(&self) -> Read<Transaction> {
        self.read::<Transaction>()
    }

    pub async fn add_transaction(&self, draft: NewTransaction) -> CacheResult<MutationOutcome<Transaction>> {
        self.create::<Transaction>(&draft).await
    }

    pub async fn update_transaction(
        &self,
        id: &EntityId,
        patch: TransactionPatch,
    ) -> CacheResult<MutationOutcome<Transaction>> {
        self.update::<Transaction>(id, &patch).await
    }

    pub async fn delete_transaction(&self, id: &EntityId) -> CacheResult<MutationOutcome<EntityId>> {
        self.delete::<Transaction>(id).await
    }

    /// Move money between buckets; returns the outflow and inflow legs
    pub async fn transfer(&self, request: TransferRequest) -> CacheResult<MutationOutcome<Vec<Transaction>>> {
        let (plan, legs) = transfer_plan(&request, self.now())?;
        self.run(plan, legs).await
    }

    /// Deposit `amount` into an income bucket
    pub async fn payday(&self, bucket_id: &EntityId, amount: Decimal) -> CacheResult<MutationOutcome<Transaction>> {
        if amount <= Decimal::ZERO {
            return Err(CacheError::InvalidInput(format!("payday amount must be positive, got {}", amount)));
        }
        self.add_transaction(NewTransaction::payday(bucket_id.clone(), amount)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_plan_puts_both_legs() {
        let request = TransferRequest::new("a", "b", Decimal::from(50), "rainy day");
        let (plan, legs) = transfer_plan(&request, Utc::now()).unwrap();

        assert_eq!(plan.effects.len(), 2);
        assert_eq!(legs[0].amount, Decimal::from(-50));
        assert_eq!(legs[1].amount, Decimal::from(50));
        assert!(legs.iter().all(|leg| leg.is_transfer && leg.id.is_temporary()));
        assert_ne!(legs[0].id, legs[1].id);
        assert_eq!(plan.payload["from_bucket_id"], "a");
    }

    #[test]
    fn test_invalid_transfer_is_rejected() {
        let request = TransferRequest::new("a", "a", Decimal::from(5), "loop");
        assert!(matches!(transfer_plan(&request, Utc::now()), Err(CacheError::InvalidInput(_))));
    }
}
