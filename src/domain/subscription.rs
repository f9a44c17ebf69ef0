//! Subscription Entity
//!
//! A recurring monthly bill paid out of a bucket.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::entity::{Entity, EntityId};
use super::transaction::NewTransaction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: EntityId,
    pub name: String,
    pub amount: Decimal,
    /// Day of the month the bill is due (1-31)
    pub day_of_month: u32,
    pub bucket_id: EntityId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Outflow transaction that pays this bill from its bucket
    pub fn bill_payment(&self) -> NewTransaction {
        NewTransaction::new(self.bucket_id.clone(), -self.amount.abs(), format!("Bill: {}", self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSubscription {
    pub name: String,
    pub amount: Decimal,
    pub day_of_month: u32,
    pub bucket_id: EntityId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_id: Option<EntityId>,
}

impl Entity for Subscription {
    type Draft = NewSubscription;
    type Patch = SubscriptionPatch;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn synthesize(draft: &NewSubscription, id: EntityId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: draft.name.clone(),
            amount: draft.amount,
            day_of_month: draft.day_of_month,
            bucket_id: draft.bucket_id.clone(),
            created_at: now,
            updated_at: Some(now),
        }
    }

    fn merge(&mut self, patch: &SubscriptionPatch, now: DateTime<Utc>) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(amount) = patch.amount {
            self.amount = amount;
        }
        if let Some(day) = patch.day_of_month {
            self.day_of_month = day;
        }
        if let Some(bucket_id) = &patch.bucket_id {
            self.bucket_id = bucket_id.clone();
        }
        self.updated_at = Some(now);
    }

    fn validate_draft(draft: &NewSubscription) -> Result<(), String> {
        if !(1..=31).contains(&draft.day_of_month) {
            return Err(format!("day_of_month must be 1-31, got {}", draft.day_of_month));
        }
        Ok(())
    }
}
