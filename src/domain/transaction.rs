//! Transaction Entity
//!
//! A signed movement of money into (positive) or out of (negative) a bucket.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::entity::{null_as_default, Entity, EntityId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: EntityId,
    pub bucket_id: EntityId,
    /// Negative = outflow
    pub amount: Decimal,
    #[serde(default, deserialize_with = "null_as_default")]
    pub note: String,
    pub date: DateTime<Utc>,
    /// One leg of a transfer between buckets
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_transfer: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn is_outflow(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }
}

/// Insert payload for a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub bucket_id: EntityId,
    pub amount: Decimal,
    pub note: String,
    /// Server defaults to now when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_transfer: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl NewTransaction {
    pub fn new(bucket_id: impl Into<EntityId>, amount: Decimal, note: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            amount,
            note: note.into(),
            date: None,
            is_transfer: false,
        }
    }

    /// Deposit into an income bucket; the amount is always positive
    pub fn payday(bucket_id: impl Into<EntityId>, amount: Decimal) -> Self {
        Self::new(bucket_id, amount.abs(), "Payday Deposit")
    }

    pub fn on(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

impl Entity for Transaction {
    type Draft = NewTransaction;
    type Patch = TransactionPatch;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn synthesize(draft: &NewTransaction, id: EntityId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            bucket_id: draft.bucket_id.clone(),
            amount: draft.amount,
            note: draft.note.clone(),
            date: draft.date.unwrap_or(now),
            is_transfer: draft.is_transfer,
            created_at: now,
            updated_at: Some(now),
        }
    }

    fn merge(&mut self, patch: &TransactionPatch, now: DateTime<Utc>) {
        if let Some(bucket_id) = &patch.bucket_id {
            self.bucket_id = bucket_id.clone();
        }
        if let Some(amount) = patch.amount {
            self.amount = amount;
        }
        if let Some(note) = &patch.note {
            self.note = note.clone();
        }
        if let Some(date) = patch.date {
            self.date = date;
        }
        self.updated_at = Some(now);
    }
}

/// Move money between two buckets as one remote call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_bucket_id: EntityId,
    pub to_bucket_id: EntityId,
    /// Always positive; the outflow leg carries the negated amount
    pub amount: Decimal,
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

impl TransferRequest {
    pub fn new(
        from_bucket_id: impl Into<EntityId>,
        to_bucket_id: impl Into<EntityId>,
        amount: Decimal,
        note: impl Into<String>,
    ) -> Self {
        Self {
            from_bucket_id: from_bucket_id.into(),
            to_bucket_id: to_bucket_id.into(),
            amount,
            note: note.into(),
            date: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.amount <= Decimal::ZERO {
            return Err(format!("transfer amount must be positive, got {}", self.amount));
        }
        if self.from_bucket_id == self.to_bucket_id {
            return Err("cannot transfer a bucket into itself".to_string());
        }
        Ok(())
    }

    /// The two inserts the transfer performs: outflow first, inflow second
    pub fn legs(&self) -> [NewTransaction; 2] {
        [
            NewTransaction {
                bucket_id: self.from_bucket_id.clone(),
                amount: -self.amount,
                note: format!("Transfer to {}", self.note),
                date: self.date,
                is_transfer: true,
            },
            NewTransaction {
                bucket_id: self.to_bucket_id.clone(),
                amount: self.amount,
                note: format!("Transfer from {}", self.note),
                date: self.date,
                is_transfer: true,
            },
        ]
    }
}
