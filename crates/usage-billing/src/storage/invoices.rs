use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::invoices::{
    CreditNote, Invoice, InvoiceStatus, InvoiceSubscription, InvoiceSubscriptionKey,
};
use crate::domain::types::{InvoiceId, OrganizationId, SubscriptionId};
use crate::error::{BillingError, Result};

/// Outcome of creating an invoice for a subscription period
#[derive(Debug, Clone, PartialEq)]
pub enum InvoiceInsert {
    Created,
    /// An invoice already exists for the same period and reason
    Existing(Invoice),
}

#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    /// Creates the invoice together with its subscription link, unless the
    /// link key is already taken
    async fn create_invoice(
        &self,
        invoice: &Invoice,
        link: &InvoiceSubscription,
    ) -> Result<InvoiceInsert>;
    async fn get_invoice(&self, id: &InvoiceId) -> Result<Option<Invoice>>;
    async fn find_invoice(&self, key: &InvoiceSubscriptionKey) -> Result<Option<Invoice>>;
    async fn list_links(&self, subscription_id: &SubscriptionId)
        -> Result<Vec<InvoiceSubscription>>;
    /// Compare-and-swap on `version`; returns the stored invoice
    async fn update_invoice(&self, invoice: &Invoice) -> Result<Invoice>;
    async fn list_drafts(&self, limit: usize) -> Result<Vec<Invoice>>;
    async fn next_invoice_number(&self, organization_id: OrganizationId) -> Result<u64>;
    async fn create_credit_note(&self, credit_note: &CreditNote) -> Result<()>;
    async fn list_credit_notes(&self, invoice_id: &InvoiceId) -> Result<Vec<CreditNote>>;
}

#[derive(Default)]
struct InvoiceTables {
    invoices: HashMap<InvoiceId, Invoice>,
    links: HashMap<InvoiceSubscriptionKey, InvoiceSubscription>,
    sequences: HashMap<OrganizationId, u64>,
    credit_notes: Vec<CreditNote>,
}

#[derive(Default)]
pub struct InMemoryInvoiceRepository {
    tables: Arc<RwLock<InvoiceTables>>,
}

impl InMemoryInvoiceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceRepository for InMemoryInvoiceRepository {
    async fn create_invoice(
        &self,
        invoice: &Invoice,
        link: &InvoiceSubscription,
    ) -> Result<InvoiceInsert> {
        let mut tables = self.tables.write().await;
        let key = link.key();
        if let Some(existing) = tables.links.get(&key) {
            let invoice = tables
                .invoices
                .get(&existing.invoice_id)
                .cloned()
                .ok_or_else(|| BillingError::not_found("invoice", existing.invoice_id))?;
            return Ok(InvoiceInsert::Existing(invoice));
        }
        tables.links.insert(key, link.clone());
        tables.invoices.insert(invoice.id, invoice.clone());
        Ok(InvoiceInsert::Created)
    }

    async fn get_invoice(&self, id: &InvoiceId) -> Result<Option<Invoice>> {
        Ok(self.tables.read().await.invoices.get(id).cloned())
    }

    async fn find_invoice(&self, key: &InvoiceSubscriptionKey) -> Result<Option<Invoice>> {
        let tables = self.tables.read().await;
        Ok(tables
            .links
            .get(key)
            .and_then(|link| tables.invoices.get(&link.invoice_id))
            .cloned())
    }

    async fn list_links(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<InvoiceSubscription>> {
        let tables = self.tables.read().await;
        let mut links: Vec<InvoiceSubscription> = tables
            .links
            .values()
            .filter(|link| &link.subscription_id == subscription_id)
            .cloned()
            .collect();
        links.sort_by_key(|link| (link.bounds.from_datetime, link.invoicing_reason));
        Ok(links)
    }

    async fn update_invoice(&self, invoice: &Invoice) -> Result<Invoice> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .invoices
            .get_mut(&invoice.id)
            .ok_or_else(|| BillingError::not_found("invoice", invoice.id))?;
        if stored.version != invoice.version {
            return Err(BillingError::VersionConflict {
                entity: "invoice",
                id: invoice.id.to_string(),
                expected: invoice.version,
                found: stored.version,
            });
        }
        let mut updated = invoice.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list_drafts(&self, limit: usize) -> Result<Vec<Invoice>> {
        let tables = self.tables.read().await;
        let mut drafts: Vec<Invoice> = tables
            .invoices
            .values()
            .filter(|invoice| invoice.status == InvoiceStatus::Draft)
            .cloned()
            .collect();
        drafts.sort_by_key(|invoice| invoice.created_at);
        drafts.truncate(limit);
        Ok(drafts)
    }

    async fn next_invoice_number(&self, organization_id: OrganizationId) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let sequence = tables.sequences.entry(organization_id).or_insert(0);
        *sequence += 1;
        Ok(*sequence)
    }

    async fn create_credit_note(&self, credit_note: &CreditNote) -> Result<()> {
        self.tables
            .write()
            .await
            .credit_notes
            .push(credit_note.clone());
        Ok(())
    }

    async fn list_credit_notes(&self, invoice_id: &InvoiceId) -> Result<Vec<CreditNote>> {
        let tables = self.tables.read().await;
        Ok(tables
            .credit_notes
            .iter()
            .filter(|note| &note.invoice_id == invoice_id)
            .cloned()
            .collect())
    }
}
