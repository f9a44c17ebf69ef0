//! Write Commands
//!
//! Builds the mutation plan of every write the client offers, organized by
//! domain. The generic builders below cover create/update/delete; the
//! per-entity modules add their registry keys, dependent slots and any
//! compound writes.

mod bucket;
mod subscription;
mod transaction;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::domain::{Entity, EntityId};
use crate::error::{CacheError, CacheResult};
use crate::mutation::{Effect, MutationPlan, Reconcile};
use crate::remote::RemoteEntity;
use crate::store::{CachedEntity, SlotKey};

pub use transaction::transfer_plan;

/// An entity the client can write
pub trait Writable: CachedEntity + RemoteEntity {
    const CREATE: &'static str;
    const UPDATE: &'static str;
    const DELETE: &'static str;
    /// Slots to invalidate once a create settles
    const CREATED_INVALIDATES: &'static [SlotKey];
    /// Slots to invalidate once an update or delete settles
    const CHANGED_INVALIDATES: &'static [SlotKey];
}

// ========================
// Plan Builders
// ========================

pub(crate) fn payload<P: Serialize + ?Sized>(value: &P) -> CacheResult<Value> {
    serde_json::to_value(value).map_err(|e| CacheError::InvalidInput(e.to_string()))
}

/// Optimistic insert under a fresh temporary id
pub fn create_plan<T: Writable>(draft: &T::Draft, now: DateTime<Utc>) -> CacheResult<(MutationPlan, T)> {
    T::validate_draft(draft).map_err(CacheError::InvalidInput)?;
    let temp = EntityId::temporary(now);
    let optimistic = T::synthesize(draft, temp.clone(), now);
    let plan = MutationPlan {
        key: T::CREATE,
        payload: payload(draft)?,
        effects: vec![Effect::Put(optimistic.clone().into_record())],
        reconcile: Reconcile::Replace {
            slot: T::SLOT,
            placeholders: vec![temp],
        },
        invalidates: T::CREATED_INVALIDATES.to_vec(),
    };
    Ok((plan, optimistic))
}

/// `patch` merged over the cached `current`
pub fn update_plan<T: Writable>(current: &T, patch: &T::Patch, now: DateTime<Utc>) -> CacheResult<(MutationPlan, T)> {
    let id = current.id().clone();
    let mut optimistic = current.clone();
    optimistic.merge(patch, now);
    let plan = MutationPlan {
        key: T::UPDATE,
        payload: serde_json::json!({ "id": id, "updates": payload(patch)? }),
        effects: vec![Effect::Put(optimistic.clone().into_record())],
        reconcile: Reconcile::Replace {
            slot: T::SLOT,
            placeholders: vec![id],
        },
        invalidates: T::CHANGED_INVALIDATES.to_vec(),
    };
    Ok((plan, optimistic))
}

pub fn delete_plan<T: Writable>(id: &EntityId) -> CacheResult<MutationPlan> {
    Ok(MutationPlan {
        key: T::DELETE,
        payload: payload(id)?,
        effects: vec![Effect::Remove {
            slot: T::SLOT,
            id: id.clone(),
        }],
        reconcile: Reconcile::Keep,
        invalidates: T::CHANGED_INVALIDATES.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Bucket, BucketPatch, BucketType, NewBucket, Subscription, Transaction};
    use crate::registry::keys;
    use rust_decimal::Decimal;

    #[test]
    fn test_create_plan_uses_temp_placeholder() {
        let draft = NewBucket::new("Groceries", BucketType::Envelope, Decimal::from(300));
        let (plan, optimistic) = create_plan::<Bucket>(&draft, Utc::now()).unwrap();

        assert_eq!(plan.key, keys::CREATE_BUCKET);
        assert!(optimistic.id.is_temporary());
        assert_eq!(plan.payload["name"], "Groceries");
        assert_eq!(
            plan.reconcile,
            Reconcile::Replace {
                slot: SlotKey::Buckets,
                placeholders: vec![optimistic.id.clone()]
            }
        );
        assert_eq!(plan.invalidates, vec![SlotKey::Buckets]);
    }

    #[test]
    fn test_invalid_draft_is_rejected_up_front() {
        let draft = NewBucket::new("", BucketType::Goal, Decimal::ONE);
        assert!(matches!(create_plan::<Bucket>(&draft, Utc::now()), Err(CacheError::InvalidInput(_))));
    }

    #[test]
    fn test_update_payload_shape() {
        let now = Utc::now();
        let current = Bucket::synthesize(&NewBucket::new("Rent", BucketType::Envelope, Decimal::from(900)), EntityId::from("b1"), now);
        let patch = BucketPatch {
            name: Some("Housing".into()),
            ..Default::default()
        };

        let (plan, optimistic) = update_plan(&current, &patch, now).unwrap();

        assert_eq!(plan.payload, serde_json::json!({ "id": "b1", "updates": { "name": "Housing" } }));
        assert_eq!(optimistic.name, "Housing");
        assert_eq!(plan.invalidates, vec![SlotKey::Buckets, SlotKey::Transactions]);
    }

    #[test]
    fn test_delete_payload_is_bare_id() {
        let plan = delete_plan::<Transaction>(&EntityId::from("t9")).unwrap();
        assert_eq!(plan.payload, serde_json::json!("t9"));
        assert_eq!(plan.reconcile, Reconcile::Keep);
        assert_eq!(plan.invalidates, vec![SlotKey::Transactions, SlotKey::Buckets]);
    }

    #[test]
    fn test_subscription_writes_only_touch_subscriptions() {
        assert_eq!(Subscription::CREATED_INVALIDATES, &[SlotKey::Subscriptions]);
        assert_eq!(Subscription::CHANGED_INVALIDATES, &[SlotKey::Subscriptions]);
    }
}
