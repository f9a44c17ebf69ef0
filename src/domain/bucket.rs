//! Bucket Entity
//!
//! A named fund container: an income source, a monthly envelope or a savings goal.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::entity::{Entity, EntityId};

/// Bucket type determines how its balance is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    /// Where money arrives; balance is the all-time sum
    #[serde(alias = "income_source")]
    Income,
    /// Monthly spending limit; balance resets each month
    #[default]
    Envelope,
    /// Cumulative savings target
    Goal,
}

impl BucketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketType::Income => "income",
            BucketType::Envelope => "envelope",
            BucketType::Goal => "goal",
        }
    }
}

impl fmt::Display for BucketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: EntityId,
    pub name: String,
    #[serde(rename = "type")]
    pub bucket_type: BucketType,
    /// Monthly limit for envelopes, target for goals
    #[serde(default)]
    pub target_amount: Option<Decimal>,
    /// Color (hex, e.g., "#FF5733")
    #[serde(default)]
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Insert payload for a bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBucket {
    pub name: String,
    #[serde(rename = "type")]
    pub bucket_type: BucketType,
    #[serde(default)]
    pub target_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl NewBucket {
    pub fn new(name: impl Into<String>, bucket_type: BucketType, target_amount: Decimal) -> Self {
        Self {
            name: name.into(),
            bucket_type,
            target_amount: Some(target_amount),
            color: None,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub bucket_type: Option<BucketType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl Entity for Bucket {
    type Draft = NewBucket;
    type Patch = BucketPatch;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn synthesize(draft: &NewBucket, id: EntityId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: draft.name.clone(),
            bucket_type: draft.bucket_type,
            target_amount: draft.target_amount,
            color: draft.color.clone(),
            created_at: now,
            updated_at: Some(now),
        }
    }

    fn merge(&mut self, patch: &BucketPatch, now: DateTime<Utc>) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(bucket_type) = patch.bucket_type {
            self.bucket_type = bucket_type;
        }
        if let Some(target) = patch.target_amount {
            self.target_amount = Some(target);
        }
        if let Some(color) = &patch.color {
            self.color = Some(color.clone());
        }
        self.updated_at = Some(now);
    }

    fn validate_draft(draft: &NewBucket) -> Result<(), String> {
        if draft.name.trim().is_empty() {
            return Err("bucket name must not be empty".to_string());
        }
        Ok(())
    }
}
