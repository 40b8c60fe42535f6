use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::fee_calculator::UsageQuantity;
use crate::domain::filters::{FilterMatch, GroupedBy};
use crate::domain::types::{
    overlap_seconds, ChargeFilterId, ChargeId, ExternalSubscriptionId, OrganizationId,
};

/// Checkpoints of one charge for one subscription period
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationScope {
    pub organization_id: OrganizationId,
    pub external_subscription_id: ExternalSubscriptionId,
    pub charge_id: ChargeId,
    pub period_from: DateTime<Utc>,
}

/// Resumable aggregation checkpoint for one bucket of a charge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAggregation {
    pub organization_id: OrganizationId,
    pub external_subscription_id: ExternalSubscriptionId,
    pub charge_id: ChargeId,
    pub charge_filter_id: Option<ChargeFilterId>,
    #[serde(default)]
    pub grouped_by: GroupedBy,
    pub period_from: DateTime<Utc>,
    /// Timestamp of the latest event folded in
    pub timestamp: Option<DateTime<Utc>>,
    /// Ingestion cursor shared by every bucket of the charge
    pub last_sequence: u64,
    pub current_aggregation: Decimal,
    pub max_aggregation: Decimal,
    pub max_aggregation_with_proration: Option<Decimal>,
    pub events_count: u64,
    /// Quantity-seconds accumulated up to `timestamp` (weighted sums)
    pub time_weighted_total: Decimal,
    pub invalidated: bool,
    pub frozen: bool,
    pub updated_at: DateTime<Utc>,
}

impl CachedAggregation {
    pub fn scope(&self) -> AggregationScope {
        AggregationScope {
            organization_id: self.organization_id,
            external_subscription_id: self.external_subscription_id.clone(),
            charge_id: self.charge_id,
            period_from: self.period_from,
        }
    }

    pub fn bucket(&self) -> FilterMatch {
        FilterMatch {
            charge_filter_id: self.charge_filter_id,
            grouped_by: self.grouped_by.clone(),
        }
    }
}

/// Lifetime of one distinct `external_id` for unique and recurring counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantifiedEvent {
    pub id: Uuid,
    pub external_id: String,
    pub bucket: FilterMatch,
    pub added_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl QuantifiedEvent {
    pub fn new(external_id: impl Into<String>, bucket: FilterMatch, added_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: external_id.into(),
            bucket,
            added_at,
            removed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }

    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.added_at < to && self.removed_at.map_or(true, |removed| removed > from)
    }

    pub fn overlap_seconds(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        overlap_seconds(self.added_at, self.removed_at.unwrap_or(to), from, to)
    }
}

/// Quantified events of a charge; period-scoped for unique counts and
/// subscription-wide (`period_from = None`) for recurring counts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuantifiedScope {
    pub organization_id: OrganizationId,
    pub external_subscription_id: ExternalSubscriptionId,
    pub charge_id: ChargeId,
    pub period_from: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantifiedState {
    pub rows: Vec<QuantifiedEvent>,
    pub last_sequence: u64,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl QuantifiedState {
    pub fn active_row_mut(&mut self, external_id: &str) -> Option<&mut QuantifiedEvent> {
        self.rows
            .iter_mut()
            .find(|row| row.external_id == external_id && row.is_active())
    }
}

/// Aggregated value of one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketUsage {
    pub bucket: FilterMatch,
    pub current_aggregation: Decimal,
    pub max_aggregation: Decimal,
    pub usage: UsageQuantity,
}

/// Usage of one charge over a billing period, split by bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeUsage {
    pub charge_id: ChargeId,
    pub period_from: DateTime<Utc>,
    pub buckets: Vec<BucketUsage>,
    /// Values come from an invalidated checkpoint awaiting recompute
    pub stale: bool,
}

impl ChargeUsage {
    pub fn bucket(&self, bucket: &FilterMatch) -> Option<&BucketUsage> {
        self.buckets.iter().find(|b| &b.bucket == bucket)
    }

    pub fn total_value(&self) -> Decimal {
        self.buckets.iter().map(|b| b.usage.value).sum()
    }
}
