use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::fees::{Fee, FeeKind};
use crate::domain::types::{FeeId, InvoiceId, SubscriptionId};
use crate::error::{BillingError, Result};

#[async_trait]
pub trait FeeRepository: Send + Sync {
    async fn create_fees(&self, fees: &[Fee]) -> Result<()>;
    async fn get_fee(&self, id: &FeeId) -> Result<Option<Fee>>;
    async fn list_invoice_fees(&self, invoice_id: &InvoiceId) -> Result<Vec<Fee>>;
    /// Invoiceable pay-in-advance fees not yet attached to an invoice
    async fn list_pending_in_advance(
        &self,
        subscription_id: &SubscriptionId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Fee>>;
    /// All pay-in-advance fees created within a window, invoiced or not
    async fn list_in_advance(
        &self,
        subscription_id: &SubscriptionId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Fee>>;
    /// Replaces the fees of a draft invoice
    async fn replace_invoice_fees(&self, invoice_id: &InvoiceId, fees: &[Fee]) -> Result<()>;
    /// Attaches pending fees to an invoice
    async fn attach_fees(&self, invoice_id: &InvoiceId, fee_ids: &[FeeId]) -> Result<()>;
    /// Adjustment fees billed later against an already invoiced period
    async fn list_adjustment_fees(&self, original_invoice_id: &InvoiceId) -> Result<Vec<Fee>>;
}

#[derive(Default)]
pub struct InMemoryFeeRepository {
    fees: Arc<RwLock<HashMap<FeeId, Fee>>>,
}

impl InMemoryFeeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut fees: Vec<Fee>) -> Vec<Fee> {
    fees.sort_by_key(|f| (f.created_at, f.id));
    fees
}

#[async_trait]
impl FeeRepository for InMemoryFeeRepository {
    async fn create_fees(&self, fees: &[Fee]) -> Result<()> {
        let mut store = self.fees.write().await;
        for fee in fees {
            store.insert(fee.id, fee.clone());
        }
        Ok(())
    }

    async fn get_fee(&self, id: &FeeId) -> Result<Option<Fee>> {
        Ok(self.fees.read().await.get(id).cloned())
    }

    async fn list_invoice_fees(&self, invoice_id: &InvoiceId) -> Result<Vec<Fee>> {
        let store = self.fees.read().await;
        Ok(sorted(
            store
                .values()
                .filter(|f| f.invoice_id.as_ref() == Some(invoice_id))
                .cloned()
                .collect(),
        ))
    }

    async fn list_pending_in_advance(
        &self,
        subscription_id: &SubscriptionId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Fee>> {
        let store = self.fees.read().await;
        Ok(sorted(
            store
                .values()
                .filter(|f| &f.subscription_id == subscription_id && f.is_pending_in_advance())
                .filter(|f| f.properties_from >= from && f.properties_from < to)
                .cloned()
                .collect(),
        ))
    }

    async fn list_in_advance(
        &self,
        subscription_id: &SubscriptionId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Fee>> {
        let store = self.fees.read().await;
        Ok(sorted(
            store
                .values()
                .filter(|f| &f.subscription_id == subscription_id && f.pay_in_advance)
                .filter(|f| f.properties_from >= from && f.properties_from < to)
                .cloned()
                .collect(),
        ))
    }

    async fn replace_invoice_fees(&self, invoice_id: &InvoiceId, fees: &[Fee]) -> Result<()> {
        let mut store = self.fees.write().await;
        // Pay-in-advance fees are detached rather than dropped
        store.retain(|_, f| f.invoice_id.as_ref() != Some(invoice_id) || f.pay_in_advance);
        for fee in store.values_mut() {
            if fee.invoice_id.as_ref() == Some(invoice_id) {
                fee.invoice_id = None;
            }
        }
        for fee in fees {
            if fee.invoice_id.as_ref() != Some(invoice_id) {
                return Err(BillingError::InvalidState {
                    message: format!("fee {} does not belong to invoice {}", fee.id, invoice_id),
                });
            }
            store.insert(fee.id, fee.clone());
        }
        Ok(())
    }

    async fn attach_fees(&self, invoice_id: &InvoiceId, fee_ids: &[FeeId]) -> Result<()> {
        let mut store = self.fees.write().await;
        for id in fee_ids {
            let fee = store
                .get_mut(id)
                .ok_or_else(|| BillingError::not_found("fee", id))?;
            if fee.invoice_id.is_some_and(|existing| &existing != invoice_id) {
                return Err(BillingError::InvalidState {
                    message: format!("fee {} is already invoiced", id),
                });
            }
            fee.invoice_id = Some(*invoice_id);
        }
        Ok(())
    }

    async fn list_adjustment_fees(&self, original_invoice_id: &InvoiceId) -> Result<Vec<Fee>> {
        let store = self.fees.read().await;
        Ok(sorted(
            store
                .values()
                .filter(|f| {
                    matches!(
                        &f.kind,
                        FeeKind::Adjustment { original_invoice_id: id, .. } if id == original_invoice_id
                    )
                })
                .cloned()
                .collect(),
        ))
    }
}
