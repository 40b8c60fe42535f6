use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::invoices::{ErrorDetail, ErrorOwner, LifetimeUsage, PendingAdjustment};
use crate::domain::types::{InvoiceId, OrganizationId, SubscriptionId};
use crate::error::{BillingError, Result};

/// Bookkeeping that hangs off subscriptions: lifetime usage for progressive
/// billing, adjustments for late usage and captured failures
#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn get_lifetime_usage(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<LifetimeUsage>>;
    async fn save_lifetime_usage(&self, usage: &LifetimeUsage) -> Result<()>;
    /// Oldest flagged rows first
    async fn list_flagged_lifetime_usage(&self, limit: usize) -> Result<Vec<LifetimeUsage>>;

    async fn create_pending_adjustment(&self, adjustment: &PendingAdjustment) -> Result<()>;
    async fn list_pending_adjustments(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<PendingAdjustment>>;
    async fn mark_adjustments_applied(&self, ids: &[Uuid], invoice_id: InvoiceId) -> Result<()>;

    async fn create_error_detail(&self, detail: &ErrorDetail) -> Result<()>;
    async fn list_error_details(
        &self,
        organization_id: OrganizationId,
        owner: Option<ErrorOwner>,
    ) -> Result<Vec<ErrorDetail>>;
}

#[derive(Default)]
pub struct InMemoryUsageRepository {
    lifetime: Arc<RwLock<HashMap<SubscriptionId, LifetimeUsage>>>,
    adjustments: Arc<RwLock<Vec<PendingAdjustment>>>,
    errors: Arc<RwLock<Vec<ErrorDetail>>>,
}

impl InMemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageRepository for InMemoryUsageRepository {
    async fn get_lifetime_usage(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<LifetimeUsage>> {
        Ok(self.lifetime.read().await.get(subscription_id).cloned())
    }

    async fn save_lifetime_usage(&self, usage: &LifetimeUsage) -> Result<()> {
        self.lifetime
            .write()
            .await
            .insert(usage.subscription_id, usage.clone());
        Ok(())
    }

    async fn list_flagged_lifetime_usage(&self, limit: usize) -> Result<Vec<LifetimeUsage>> {
        let lifetime = self.lifetime.read().await;
        let mut flagged: Vec<LifetimeUsage> = lifetime
            .values()
            .filter(|usage| usage.recalculate_current_usage)
            .cloned()
            .collect();
        flagged.sort_by_key(|usage| usage.updated_at);
        flagged.truncate(limit);
        Ok(flagged)
    }

    async fn create_pending_adjustment(&self, adjustment: &PendingAdjustment) -> Result<()> {
        let mut adjustments = self.adjustments.write().await;
        // One open adjustment per charge and period is enough
        let open = adjustments.iter().any(|existing| {
            existing.applied_invoice_id.is_none()
                && existing.subscription_id == adjustment.subscription_id
                && existing.charge_id == adjustment.charge_id
                && existing.original_invoice_id == adjustment.original_invoice_id
        });
        if !open {
            adjustments.push(adjustment.clone());
        }
        Ok(())
    }

    async fn list_pending_adjustments(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<PendingAdjustment>> {
        let adjustments = self.adjustments.read().await;
        Ok(adjustments
            .iter()
            .filter(|a| &a.subscription_id == subscription_id && a.applied_invoice_id.is_none())
            .cloned()
            .collect())
    }

    async fn mark_adjustments_applied(&self, ids: &[Uuid], invoice_id: InvoiceId) -> Result<()> {
        let mut adjustments = self.adjustments.write().await;
        for id in ids {
            let adjustment = adjustments
                .iter_mut()
                .find(|a| &a.id == id)
                .ok_or_else(|| BillingError::not_found("pending_adjustment", id))?;
            adjustment.applied_invoice_id = Some(invoice_id);
        }
        Ok(())
    }

    async fn create_error_detail(&self, detail: &ErrorDetail) -> Result<()> {
        self.errors.write().await.push(detail.clone());
        Ok(())
    }

    async fn list_error_details(
        &self,
        organization_id: OrganizationId,
        owner: Option<ErrorOwner>,
    ) -> Result<Vec<ErrorDetail>> {
        let errors = self.errors.read().await;
        Ok(errors
            .iter()
            .filter(|e| e.organization_id == organization_id)
            .filter(|e| owner.map_or(true, |owner| e.owner == owner))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{BillingBounds, ChargeId, ExternalSubscriptionId};
    use chrono::{Duration, TimeZone, Utc};

    #[tokio::test]
    async fn test_flagged_lifetime_usage_oldest_first() {
        let repo = InMemoryUsageRepository::new();
        let org = OrganizationId::new();
        let now = Utc::now();

        let mut ids = Vec::new();
        for (index, flagged) in [(0, true), (1, false), (2, true), (3, true)] {
            let mut usage = LifetimeUsage::new(
                org,
                SubscriptionId::new(),
                ExternalSubscriptionId::new(format!("sub_{}", index)),
            );
            usage.recalculate_current_usage = flagged;
            usage.updated_at = now - Duration::minutes(index);
            repo.save_lifetime_usage(&usage).await.unwrap();
            ids.push(usage.subscription_id);
        }

        let flagged = repo.list_flagged_lifetime_usage(2).await.unwrap();
        let flagged: Vec<_> = flagged.iter().map(|u| u.subscription_id).collect();
        assert_eq!(flagged, vec![ids[3], ids[2]]);
    }

    #[tokio::test]
    async fn test_adjustments_are_collapsed_until_applied() {
        let repo = InMemoryUsageRepository::new();
        let sub = SubscriptionId::new();
        let bounds = BillingBounds::new(
            Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let adjustment = PendingAdjustment {
            id: Uuid::new_v4(),
            organization_id: OrganizationId::new(),
            subscription_id: sub,
            charge_id: ChargeId::new(),
            original_invoice_id: InvoiceId::new(),
            bounds,
            applied_invoice_id: None,
            created_at: Utc::now(),
        };
        repo.create_pending_adjustment(&adjustment).await.unwrap();
        repo.create_pending_adjustment(&PendingAdjustment {
            id: Uuid::new_v4(),
            ..adjustment.clone()
        })
        .await
        .unwrap();
        assert_eq!(repo.list_pending_adjustments(&sub).await.unwrap().len(), 1);

        repo.mark_adjustments_applied(&[adjustment.id], InvoiceId::new())
            .await
            .unwrap();
        assert!(repo.list_pending_adjustments(&sub).await.unwrap().is_empty());
    }
}
