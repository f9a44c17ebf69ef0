//! Pending Mutation records
//!
//! A pending mutation is owned by the engine from the moment its optimistic
//! effect is applied until it settles. Paused ones are persisted verbatim.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::EntityId;
use crate::store::{EntityRecord, Prior, SlotKey};

/// Engine-assigned id; increasing in enqueue order, also across restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(pub u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationStatus {
    AppliedOptimistically,
    InFlight,
    Paused,
    Settled,
    RolledBack,
}

/// How a successful response is folded back into the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Reconcile {
    /// The response rows replace the placeholders of `slot`, in order
    Replace { slot: SlotKey, placeholders: Vec<EntityId> },
    /// Nothing to fold back; the optimistic removal stands
    Keep,
}

/// A single optimistic change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "camelCase")]
pub enum Effect {
    Put(EntityRecord),
    Remove { slot: SlotKey, id: EntityId },
}

impl Effect {
    pub fn slot(&self) -> SlotKey {
        match self {
            Effect::Put(record) => record.slot(),
            Effect::Remove { slot, .. } => *slot,
        }
    }

    pub(crate) fn rename_ids(&mut self, from: &EntityId, to: &EntityId) {
        match self {
            Effect::Put(record) => record.rename_ids(from, to),
            Effect::Remove { id, .. } => {
                if id == from {
                    *id = to.clone();
                }
            }
        }
    }
}

/// Everything the engine needs to run one write
#[derive(Debug, Clone)]
pub struct MutationPlan {
    /// Registry key of the remote operation
    pub key: &'static str,
    /// Sent to the remote operation as-is
    pub payload: Value,
    pub effects: Vec<Effect>,
    pub reconcile: Reconcile,
    /// Slots whose contents derive from the written entities
    pub invalidates: Vec<SlotKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub id: MutationId,
    pub registry_key: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip, default = "paused")]
    pub status: MutationStatus,
    /// Prior images of every entity the optimistic apply touched
    pub snapshot: Vec<Prior>,
    /// Re-applied over fetched rows until the mutation settles
    #[serde(default)]
    pub effects: Vec<Effect>,
    pub reconcile: Reconcile,
    pub invalidates: Vec<SlotKey>,
}

fn paused() -> MutationStatus {
    MutationStatus::Paused
}

impl PendingMutation {
    /// Slots the optimistic apply patched
    pub fn touched(&self) -> Vec<SlotKey> {
        let mut slots: Vec<SlotKey> = self
            .snapshot
            .iter()
            .map(|p| p.slot)
            .chain(self.effects.iter().map(Effect::slot))
            .collect();
        slots.sort();
        slots.dedup();
        slots
    }

    pub fn is_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        now - self.enqueued_at > retention
    }

    /// Point everything this mutation carries at `to` instead of `from`
    pub(crate) fn rename_ids(&mut self, from: &EntityId, to: &EntityId) {
        rename_in_value(&mut self.payload, from.as_str(), to.as_str());
        for prior in &mut self.snapshot {
            prior.rename_ids(from, to);
        }
        for effect in &mut self.effects {
            effect.rename_ids(from, to);
        }
        if let Reconcile::Replace { placeholders, .. } = &mut self.reconcile {
            for placeholder in placeholders.iter_mut().filter(|p| *p == from) {
                *placeholder = to.clone();
            }
        }
    }

    /// Temporary ids this mutation brought into existence
    pub(crate) fn created_ids(&self) -> Vec<EntityId> {
        self.snapshot
            .iter()
            .filter(|prior| prior.entity.is_none() && prior.id.is_temporary())
            .map(|prior| prior.id.clone())
            .collect()
    }

    pub(crate) fn mentions(&self, id: &EntityId) -> bool {
        self.snapshot.iter().any(|prior| &prior.id == id)
            || self.effects.iter().any(|effect| match effect {
                Effect::Put(record) => record.id() == id,
                Effect::Remove { id: removed, .. } => removed == id,
            })
            || value_mentions(&self.payload, id.as_str())
    }
}

fn value_mentions(value: &Value, id: &str) -> bool {
    match value {
        Value::String(s) => s == id,
        Value::Array(items) => items.iter().any(|v| value_mentions(v, id)),
        Value::Object(fields) => fields.values().any(|v| value_mentions(v, id)),
        _ => false,
    }
}

pub(crate) fn rename_in_value(value: &mut Value, from: &str, to: &str) {
    match value {
        Value::String(s) if s == from => *s = to.to_string(),
        Value::Array(items) => items.iter_mut().for_each(|v| rename_in_value(v, from, to)),
        Value::Object(fields) => fields.values_mut().for_each(|v| rename_in_value(v, from, to)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(enqueued_at: DateTime<Utc>) -> PendingMutation {
        PendingMutation {
            id: MutationId(4),
            registry_key: "deleteTransaction".to_string(),
            payload: json!("t1"),
            enqueued_at,
            status: MutationStatus::Paused,
            snapshot: vec![
                Prior {
                    slot: SlotKey::Transactions,
                    id: EntityId::from("t1"),
                    index: None,
                    entity: None,
                },
                Prior {
                    slot: SlotKey::Transactions,
                    id: EntityId::from("t2"),
                    index: None,
                    entity: None,
                },
            ],
            effects: vec![Effect::Remove {
                slot: SlotKey::Transactions,
                id: EntityId::from("t1"),
            }],
            reconcile: Reconcile::Keep,
            invalidates: vec![SlotKey::Transactions, SlotKey::Buckets],
        }
    }

    #[test]
    fn test_record_wire_format() {
        let value = serde_json::to_value(record(Utc::now())).unwrap();
        assert_eq!(value["registryKey"], "deleteTransaction");
        assert_eq!(value["id"], 4);
        assert_eq!(value["reconcile"]["kind"], "keep");
        assert!(value.get("status").is_none());
        assert_eq!(value["effects"][0]["op"], "remove");

        let back: PendingMutation = serde_json::from_value(value).unwrap();
        assert_eq!(back.effects, record(back.enqueued_at).effects);
    }

    #[test]
    fn test_records_without_effects_still_decode() {
        let mut value = serde_json::to_value(record(Utc::now())).unwrap();
        value.as_object_mut().unwrap().remove("effects");
        let back: PendingMutation = serde_json::from_value(value).unwrap();
        assert!(back.effects.is_empty());
    }

    #[test]
    fn test_rename_follows_resolved_id_everywhere() {
        let mut mutation = record(Utc::now());
        mutation.payload = json!({ "id": "t1", "updates": { "note": "t1x" } });
        mutation.reconcile = Reconcile::Replace {
            slot: SlotKey::Transactions,
            placeholders: vec![EntityId::from("t1")],
        };

        mutation.rename_ids(&EntityId::from("t1"), &EntityId::from("srv-9"));

        assert_eq!(mutation.payload, json!({ "id": "srv-9", "updates": { "note": "t1x" } }));
        assert_eq!(mutation.snapshot[0].id, EntityId::from("srv-9"));
        assert_eq!(mutation.snapshot[1].id, EntityId::from("t2"));
        assert_eq!(
            mutation.effects[0],
            Effect::Remove {
                slot: SlotKey::Transactions,
                id: EntityId::from("srv-9")
            }
        );
        assert_eq!(
            mutation.reconcile,
            Reconcile::Replace {
                slot: SlotKey::Transactions,
                placeholders: vec![EntityId::from("srv-9")]
            }
        );
    }

    #[test]
    fn test_touched_slots_are_unique() {
        assert_eq!(record(Utc::now()).touched(), vec![SlotKey::Transactions]);
    }

    #[test]
    fn test_expiry_uses_retention_window() {
        let now = Utc::now();
        let week = chrono::Duration::days(7);
        assert!(record(now - chrono::Duration::days(8)).is_expired(now, week));
        assert!(!record(now - chrono::Duration::days(6)).is_expired(now, week));
    }
}
