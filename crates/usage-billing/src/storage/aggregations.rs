use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::aggregation::{
    AggregationScope, CachedAggregation, QuantifiedScope, QuantifiedState,
};
use crate::domain::types::{ChargeId, ExternalSubscriptionId, OrganizationId};
use crate::error::{BillingError, Result};

#[async_trait]
pub trait AggregationRepository: Send + Sync {
    async fn list_checkpoints(&self, scope: &AggregationScope) -> Result<Vec<CachedAggregation>>;

    /// Replaces every checkpoint of the scope; fails when the scope is frozen
    async fn replace_checkpoints(
        &self,
        scope: &AggregationScope,
        rows: Vec<CachedAggregation>,
    ) -> Result<()>;

    /// Flags unfrozen checkpoints that already folded events later than
    /// `timestamp`, in periods starting at or before it, or in any period
    /// when `include_later_periods` is set. Returns the flagged scopes.
    async fn invalidate_checkpoints(
        &self,
        organization_id: OrganizationId,
        external_subscription_id: &ExternalSubscriptionId,
        charge_id: ChargeId,
        timestamp: DateTime<Utc>,
        include_later_periods: bool,
    ) -> Result<Vec<AggregationScope>>;

    async fn freeze_checkpoints(&self, scopes: &[AggregationScope]) -> Result<()>;

    async fn list_invalidated(&self, limit: usize) -> Result<Vec<AggregationScope>>;

    async fn get_quantified_state(&self, scope: &QuantifiedScope) -> Result<QuantifiedState>;

    async fn update_quantified_state(
        &self,
        scope: &QuantifiedScope,
        state: QuantifiedState,
    ) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryAggregationRepository {
    checkpoints: Arc<RwLock<HashMap<AggregationScope, Vec<CachedAggregation>>>>,
    quantified: Arc<RwLock<HashMap<QuantifiedScope, QuantifiedState>>>,
}

impl InMemoryAggregationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AggregationRepository for InMemoryAggregationRepository {
    async fn list_checkpoints(&self, scope: &AggregationScope) -> Result<Vec<CachedAggregation>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(scope).cloned().unwrap_or_default())
    }

    async fn replace_checkpoints(
        &self,
        scope: &AggregationScope,
        rows: Vec<CachedAggregation>,
    ) -> Result<()> {
        if rows.iter().any(|row| &row.scope() != scope) {
            return Err(BillingError::InvalidState {
                message: "checkpoint rows must belong to the replaced scope".to_string(),
            });
        }

        let mut checkpoints = self.checkpoints.write().await;
        if let Some(existing) = checkpoints.get(scope) {
            if existing.iter().any(|row| row.frozen) {
                return Err(BillingError::FrozenAggregation {
                    charge_id: scope.charge_id.to_string(),
                });
            }
        }
        checkpoints.insert(scope.clone(), rows);
        Ok(())
    }

    async fn invalidate_checkpoints(
        &self,
        organization_id: OrganizationId,
        external_subscription_id: &ExternalSubscriptionId,
        charge_id: ChargeId,
        timestamp: DateTime<Utc>,
        include_later_periods: bool,
    ) -> Result<Vec<AggregationScope>> {
        let mut checkpoints = self.checkpoints.write().await;
        let mut flagged = Vec::new();

        for (scope, rows) in checkpoints.iter_mut() {
            if scope.organization_id != organization_id
                || &scope.external_subscription_id != external_subscription_id
                || scope.charge_id != charge_id
                || (scope.period_from > timestamp && !include_later_periods)
            {
                continue;
            }
            if rows.iter().any(|row| row.frozen) {
                continue;
            }
            let folded_later = rows
                .iter()
                .any(|row| row.timestamp.map_or(false, |ts| ts > timestamp));
            if folded_later || (include_later_periods && scope.period_from > timestamp) {
                rows.iter_mut().for_each(|row| row.invalidated = true);
                flagged.push(scope.clone());
            }
        }

        Ok(flagged)
    }

    async fn freeze_checkpoints(&self, scopes: &[AggregationScope]) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        for scope in scopes {
            if let Some(rows) = checkpoints.get_mut(scope) {
                rows.iter_mut().for_each(|row| row.frozen = true);
            }
        }
        Ok(())
    }

    async fn list_invalidated(&self, limit: usize) -> Result<Vec<AggregationScope>> {
        let checkpoints = self.checkpoints.read().await;
        let mut scopes: Vec<AggregationScope> = checkpoints
            .iter()
            .filter(|(_, rows)| rows.iter().any(|row| row.invalidated && !row.frozen))
            .map(|(scope, _)| scope.clone())
            .collect();
        scopes.sort_by_key(|scope| scope.period_from);
        scopes.truncate(limit);
        Ok(scopes)
    }

    async fn get_quantified_state(&self, scope: &QuantifiedScope) -> Result<QuantifiedState> {
        let quantified = self.quantified.read().await;
        Ok(quantified.get(scope).cloned().unwrap_or_default())
    }

    async fn update_quantified_state(
        &self,
        scope: &QuantifiedScope,
        state: QuantifiedState,
    ) -> Result<()> {
        let mut quantified = self.quantified.write().await;
        quantified.insert(scope.clone(), state);
        Ok(())
    }
}
