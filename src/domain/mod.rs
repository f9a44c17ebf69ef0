//! Domain Layer
//!
//! Contains the budgeting entities and their insert/update payloads.
//! This layer has NO dependency on the cache or the remote store.

mod bucket;
mod entity;
mod subscription;
mod transaction;

pub use bucket::{Bucket, BucketPatch, BucketType, NewBucket};
pub use entity::{Entity, EntityId, TEMP_ID_PREFIX};
pub use subscription::{NewSubscription, Subscription, SubscriptionPatch};
pub use transaction::{NewTransaction, Transaction, TransactionPatch, TransferRequest};
