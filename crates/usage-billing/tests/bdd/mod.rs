pub mod scenarios;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use usage_billing::aggregator::{IngestOutcome, RefreshReport, RefreshTarget};
use usage_billing::config::BillingConfig;
use usage_billing::domain::currency::{CurrencyProvider, StaticCurrencies};
use usage_billing::domain::events::{EventInput, PropertyValue};
use usage_billing::domain::fees::Fee;
use usage_billing::domain::invoices::{Invoice, InvoicingReason};
use usage_billing::domain::metrics::{AggregationType, BillableMetric};
use usage_billing::domain::plans::{Customer, Plan, PlanInterval, Subscription};
use usage_billing::domain::taxes::StaticTaxRates;
use usage_billing::domain::types::{
    CustomerId, OrganizationId, TenantContext, WalletId, WalletTransactionId,
};
use usage_billing::domain::wallets::{Wallet, WalletTransaction};
use usage_billing::storage::{InMemoryWalletRepository, Repositories, WalletRepository};
use usage_billing::telemetry::EngineMetrics;
use usage_billing::{BillingEngine, BillingError, Collaborators, InvoiceRequest, Result};

pub struct TestContext {
    pub engine: Arc<BillingEngine>,
    pub tenant: TenantContext,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_taxes(StaticTaxRates::new()).await
    }

    pub async fn with_taxes(taxes: StaticTaxRates) -> Self {
        Self::build(Repositories::in_memory(), taxes).await
    }

    pub async fn with_repositories(repos: Repositories) -> Self {
        Self::build(repos, StaticTaxRates::new()).await
    }

    async fn build(repos: Repositories, taxes: StaticTaxRates) -> Self {
        let metrics = Arc::new(EngineMetrics::new().expect("Failed to create metrics"));
        let collaborators = Collaborators {
            taxes: Arc::new(taxes),
            ..Collaborators::default()
        };
        let engine = BillingEngine::new(BillingConfig::default(), repos, collaborators, metrics);

        TestContext {
            engine: Arc::new(engine),
            tenant: TenantContext::new(OrganizationId::new()),
        }
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.tenant.organization_id
    }

    pub fn repos(&self) -> &Repositories {
        self.engine.repositories()
    }

    pub async fn create_metric(
        &self,
        code: &str,
        aggregation: AggregationType,
        field: Option<&str>,
    ) -> BillableMetric {
        let metric = BillableMetric::new(
            self.organization_id(),
            code,
            aggregation,
            field.map(str::to_string),
        );
        self.repos()
            .catalog
            .save_metric(&metric)
            .await
            .expect("Failed to save metric");
        metric
    }

    /// Monthly USD plan without charges
    pub fn plan(&self, code: &str, amount_cents: i64) -> Plan {
        Plan::new(
            self.organization_id(),
            code,
            PlanInterval::Monthly,
            amount_cents,
            "USD",
        )
    }

    pub async fn save_plan(&self, plan: &Plan) {
        self.repos()
            .catalog
            .save_plan(plan)
            .await
            .expect("Failed to save plan");
    }

    pub async fn create_customer(&self, external_id: &str, grace_period_days: u32) -> Customer {
        let mut customer = Customer::new(self.organization_id(), external_id, "USD");
        customer.invoice_grace_period_days = grace_period_days;
        self.save_customer(&customer).await;
        customer
    }

    pub async fn save_customer(&self, customer: &Customer) {
        self.repos()
            .catalog
            .save_customer(customer)
            .await
            .expect("Failed to save customer");
    }

    pub async fn subscribe(
        &self,
        external_id: &str,
        customer: &Customer,
        plan: &Plan,
        started_at: DateTime<Utc>,
    ) -> Subscription {
        let subscription = Subscription::new(
            self.organization_id(),
            external_id,
            customer.id,
            plan.id,
            started_at,
        );
        self.repos()
            .catalog
            .save_subscription(&subscription)
            .await
            .expect("Failed to save subscription");
        subscription
    }

    pub async fn create_wallet(&self, customer: &Customer, credits: Decimal) -> Wallet {
        let currency = StaticCurrencies::new()
            .currency("USD")
            .expect("USD is supported");
        let mut wallet = Wallet::new(self.organization_id(), customer.id, currency, Decimal::ONE);
        wallet.credits_balance = credits;
        self.repos()
            .wallets
            .create_wallet(&wallet)
            .await
            .expect("Failed to create wallet");
        wallet
    }

    pub async fn get_wallet(&self, wallet: &Wallet) -> Wallet {
        self.repos()
            .wallets
            .get_wallet(&wallet.id)
            .await
            .expect("Failed to load wallet")
            .expect("Wallet should exist")
    }

    pub async fn ingest(
        &self,
        subscription: &str,
        transaction_id: &str,
        code: &str,
        properties: &[(&str, PropertyValue)],
        timestamp: DateTime<Utc>,
    ) -> IngestOutcome {
        self.engine
            .ingest_event(&self.tenant, event(subscription, transaction_id, code, properties, timestamp))
            .await
            .expect("Failed to ingest event")
    }

    pub async fn invoice(
        &self,
        subscription: &Subscription,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        reason: InvoicingReason,
    ) -> Invoice {
        self.engine
            .generate_invoice(&self.tenant, request(subscription, from, to, reason))
            .await
            .expect("Failed to generate invoice")
    }

    pub async fn get_invoice(&self, invoice: &Invoice) -> Invoice {
        self.repos()
            .invoices
            .get_invoice(&invoice.id)
            .await
            .expect("Failed to load invoice")
            .expect("Invoice should exist")
    }

    pub async fn invoice_fees(&self, invoice: &Invoice) -> Vec<Fee> {
        self.repos()
            .fees
            .list_invoice_fees(&invoice.id)
            .await
            .expect("Failed to list invoice fees")
    }

    pub async fn refresh(&self) -> RefreshReport {
        self.engine
            .refresh_pending(100)
            .await
            .expect("Failed to refresh pending work")
    }
}

/// Wallet store that can be told to reject every update of one wallet
#[derive(Default)]
pub struct FlakyWallets {
    inner: InMemoryWalletRepository,
    broken: Mutex<Option<WalletId>>,
}

impl FlakyWallets {
    pub fn break_wallet(&self, id: WalletId) {
        *self.broken.lock().unwrap() = Some(id);
    }

    pub fn repair(&self) {
        *self.broken.lock().unwrap() = None;
    }
}

#[async_trait]
impl WalletRepository for FlakyWallets {
    async fn get_wallet(&self, id: &WalletId) -> Result<Option<Wallet>> {
        self.inner.get_wallet(id).await
    }

    async fn list_wallets(&self, customer_id: &CustomerId) -> Result<Vec<Wallet>> {
        self.inner.list_wallets(customer_id).await
    }

    async fn create_wallet(&self, wallet: &Wallet) -> Result<()> {
        self.inner.create_wallet(wallet).await
    }

    async fn update_wallet(&self, wallet: &Wallet) -> Result<Wallet> {
        if *self.broken.lock().unwrap() == Some(wallet.id) {
            return Err(BillingError::VersionConflict {
                entity: "wallet",
                id: wallet.id.to_string(),
                expected: wallet.version,
                found: wallet.version + 1,
            });
        }
        self.inner.update_wallet(wallet).await
    }

    async fn list_wallets_with_interval_rules(&self) -> Result<Vec<Wallet>> {
        self.inner.list_wallets_with_interval_rules().await
    }

    async fn create_transaction(&self, transaction: &WalletTransaction) -> Result<()> {
        self.inner.create_transaction(transaction).await
    }

    async fn get_transaction(&self, id: &WalletTransactionId) -> Result<Option<WalletTransaction>> {
        self.inner.get_transaction(id).await
    }

    async fn update_transaction(&self, transaction: &WalletTransaction) -> Result<()> {
        self.inner.update_transaction(transaction).await
    }

    async fn list_transactions(&self, wallet_id: &WalletId) -> Result<Vec<WalletTransaction>> {
        self.inner.list_transactions(wallet_id).await
    }
}

pub fn event(
    subscription: &str,
    transaction_id: &str,
    code: &str,
    properties: &[(&str, PropertyValue)],
    timestamp: DateTime<Utc>,
) -> EventInput {
    EventInput {
        external_subscription_id: Some(subscription.to_string()),
        transaction_id: Some(transaction_id.to_string()),
        code: Some(code.to_string()),
        properties: properties
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect(),
        timestamp: Some(timestamp),
        ..EventInput::default()
    }
}

pub fn request(
    subscription: &Subscription,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    reason: InvoicingReason,
) -> InvoiceRequest {
    InvoiceRequest {
        subscription_id: subscription.id,
        from_datetime: from,
        to_datetime: to,
        invoicing_reason: reason,
    }
}

pub fn number(value: i64) -> PropertyValue {
    PropertyValue::Number(Decimal::from(value))
}

pub fn text(value: &str) -> PropertyValue {
    PropertyValue::Text(value.to_string())
}

pub fn date(month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, day, 0, 0, 0).unwrap()
}

pub fn april(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, day, hour, 0, 0).unwrap()
}
