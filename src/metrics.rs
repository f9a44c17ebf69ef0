//! Derived Metrics
//!
//! Pure functions over cache contents. Nothing here is cached; callers
//! recompute whenever the slots change.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::{Bucket, BucketType, EntityId, Transaction};

pub const UNKNOWN_BUCKET_NAME: &str = "Unknown";
pub const FALLBACK_COLOR: &str = "#94a3b8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Warning,
    Critical,
}

impl Health {
    fn from_percentage(percentage: Decimal) -> Self {
        if percentage > Decimal::from(50) {
            Health::Healthy
        } else if percentage > Decimal::from(20) {
            Health::Warning
        } else {
            Health::Critical
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvelopeMetrics {
    pub limit: Decimal,
    /// Limit plus this month's (signed) transactions
    pub balance: Decimal,
    pub percentage: Decimal,
    pub health: Health,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalMetrics {
    pub target: Decimal,
    pub saved: Decimal,
    pub percentage: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurnRate {
    pub daily_budget: Decimal,
    pub actual_daily: Decimal,
    pub burning_fast: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpendingSlice {
    pub bucket_id: EntityId,
    pub name: String,
    pub color: String,
    /// Positive amount spent
    pub total: Decimal,
}

// ========================
// Helpers
// ========================

fn in_month(tx: &Transaction, today: NaiveDate) -> bool {
    let date = tx.date.date_naive();
    date.year() == today.year() && date.month() == today.month()
}

fn days_in_month(today: NaiveDate) -> u32 {
    let (year, month) = if today.month() == 12 {
        (today.year() + 1, 1)
    } else {
        (today.year(), today.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|next| next.pred_opt())
        .map(|last| last.day())
        .unwrap_or(30)
}

/// `part / whole` as a percentage clamped to 0..=100; zero when `whole` is zero
fn percentage(part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        return Decimal::ZERO;
    }
    (part / whole * Decimal::ONE_HUNDRED).clamp(Decimal::ZERO, Decimal::ONE_HUNDRED)
}

fn sum_for<'a>(bucket_id: &'a EntityId, txs: impl IntoIterator<Item = &'a Transaction>) -> Decimal {
    txs.into_iter()
        .filter(|tx| &tx.bucket_id == bucket_id)
        .map(|tx| tx.amount)
        .sum()
}

// ========================
// Metrics
// ========================

/// All-time sum of a bucket's transactions
pub fn bucket_balance(bucket_id: &EntityId, txs: &[Transaction]) -> Decimal {
    sum_for(bucket_id, txs)
}

pub fn envelope_metrics(bucket: &Bucket, txs: &[Transaction], today: NaiveDate) -> EnvelopeMetrics {
    let limit = bucket.target_amount.unwrap_or_default();
    let spent = sum_for(&bucket.id, txs.iter().filter(|tx| in_month(tx, today)));
    let balance = limit + spent;
    let percentage = percentage(balance, limit);
    EnvelopeMetrics {
        limit,
        balance,
        percentage,
        health: Health::from_percentage(percentage),
    }
}

pub fn goal_metrics(bucket: &Bucket, txs: &[Transaction]) -> GoalMetrics {
    let target = bucket.target_amount.unwrap_or_default();
    let saved = sum_for(&bucket.id, txs);
    GoalMetrics {
        target,
        saved,
        percentage: percentage(saved, target),
    }
}

/// Compare this month's average daily spend with the envelopes' daily budget
pub fn burn_rate(buckets: &[Bucket], txs: &[Transaction], today: NaiveDate) -> BurnRate {
    let monthly: Decimal = buckets
        .iter()
        .filter(|b| b.bucket_type == BucketType::Envelope)
        .filter_map(|b| b.target_amount)
        .sum();
    let daily_budget = monthly / Decimal::from(days_in_month(today));

    let spent: Decimal = txs
        .iter()
        .filter(|tx| in_month(tx, today) && tx.is_outflow())
        .map(|tx| tx.amount)
        .sum();
    let actual_daily = spent.abs() / Decimal::from(today.day());

    BurnRate {
        daily_budget,
        actual_daily,
        burning_fast: actual_daily > daily_budget * Decimal::new(11, 1),
    }
}

/// Outflows per bucket, largest first
pub fn spending_breakdown(buckets: &[Bucket], txs: &[Transaction]) -> Vec<SpendingSlice> {
    let mut totals: BTreeMap<&EntityId, Decimal> = BTreeMap::new();
    for tx in txs.iter().filter(|tx| tx.is_outflow() && !tx.is_transfer) {
        *totals.entry(&tx.bucket_id).or_default() += tx.amount.abs();
    }

    let mut slices: Vec<SpendingSlice> = totals
        .into_iter()
        .filter(|(_, total)| !total.is_zero())
        .filter_map(|(bucket_id, total)| {
            let bucket = buckets.iter().find(|b| &b.id == bucket_id);
            if bucket.is_some_and(|b| b.bucket_type == BucketType::Income) {
                return None;
            }
            Some(SpendingSlice {
                bucket_id: bucket_id.clone(),
                name: bucket.map_or_else(|| UNKNOWN_BUCKET_NAME.to_string(), |b| b.name.clone()),
                color: bucket
                    .and_then(|b| b.color.clone())
                    .unwrap_or_else(|| FALLBACK_COLOR.to_string()),
                total,
            })
        })
        .collect();
    slices.sort_by(|a, b| b.total.cmp(&a.total));
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Entity, NewBucket, NewTransaction};
    use chrono::{TimeZone, Utc};

    fn bucket(id: &str, bucket_type: BucketType, target: i64) -> Bucket {
        Bucket::synthesize(
            &NewBucket::new(id.to_uppercase(), bucket_type, Decimal::from(target)),
            EntityId::from(id),
            Utc::now(),
        )
    }

    fn tx(bucket_id: &str, amount: i64, day: u32) -> Transaction {
        let date = Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap();
        Transaction::synthesize(
            &NewTransaction::new(bucket_id, Decimal::from(amount), "").on(date),
            EntityId::temporary(date),
            date,
        )
    }

    fn march(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[test]
    fn test_envelope_health_bands() {
        let food = bucket("food", BucketType::Envelope, 200);
        let mut txs = vec![tx("food", -50, 3)];
        // last month does not count
        txs.push(Transaction {
            date: Utc.with_ymd_and_hms(2024, 2, 20, 0, 0, 0).unwrap(),
            ..tx("food", -150, 1)
        });

        let metrics = envelope_metrics(&food, &txs, march(10));
        assert_eq!(metrics.balance, Decimal::from(150));
        assert_eq!(metrics.percentage, Decimal::from(75));
        assert_eq!(metrics.health, Health::Healthy);

        txs.push(tx("food", -100, 4));
        assert_eq!(envelope_metrics(&food, &txs, march(10)).health, Health::Warning);

        txs.push(tx("food", -100, 5));
        let overspent = envelope_metrics(&food, &txs, march(10));
        assert_eq!(overspent.percentage, Decimal::ZERO);
        assert_eq!(overspent.health, Health::Critical);
    }

    #[test]
    fn test_goal_progress_is_clamped() {
        let trip = bucket("trip", BucketType::Goal, 1000);
        let txs = vec![tx("trip", 400, 1), tx("trip", 900, 2)];

        let metrics = goal_metrics(&trip, &txs);
        assert_eq!(metrics.saved, Decimal::from(1300));
        assert_eq!(metrics.percentage, Decimal::ONE_HUNDRED);
        assert_eq!(bucket_balance(&trip.id, &txs), Decimal::from(1300));
    }

    #[test]
    fn test_burn_rate() {
        let buckets = vec![bucket("food", BucketType::Envelope, 310), bucket("pay", BucketType::Income, 0)];
        // 31 days in March: 10 a day
        let calm = burn_rate(&buckets, &[tx("food", -50, 2)], march(10));
        assert_eq!(calm.daily_budget, Decimal::from(10));
        assert_eq!(calm.actual_daily, Decimal::from(5));
        assert!(!calm.burning_fast);

        let fast = burn_rate(&buckets, &[tx("food", -120, 2), tx("pay", 3000, 1)], march(10));
        assert!(fast.burning_fast);
    }

    #[test]
    fn test_spending_breakdown() {
        let buckets = vec![
            bucket("food", BucketType::Envelope, 200),
            bucket("pay", BucketType::Income, 0),
        ];
        let mut transfer = tx("food", -80, 3);
        transfer.is_transfer = true;
        let txs = vec![
            tx("food", -30, 1),
            tx("food", -20, 2),
            tx("pay", -10, 2),
            tx("gone", -70, 2),
            tx("food", 500, 2),
            transfer,
        ];

        let slices = spending_breakdown(&buckets, &txs);

        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].name, UNKNOWN_BUCKET_NAME);
        assert_eq!(slices[0].total, Decimal::from(70));
        assert_eq!(slices[0].color, FALLBACK_COLOR);
        assert_eq!(slices[1].name, "FOOD");
        assert_eq!(slices[1].total, Decimal::from(50));
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(march(1)), 31);
        assert_eq!(days_in_month(NaiveDate::from_ymd_opt(2024, 2, 5).unwrap()), 29);
        assert_eq!(days_in_month(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()), 31);
    }
}
