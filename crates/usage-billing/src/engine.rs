use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::backtrace::Backtrace;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::{
    AggregationRequest, Aggregator, EventStore, IngestOutcome, RefreshReport, RefreshTarget,
};
use crate::config::BillingConfig;
use crate::distributed::{LockKey, SubscriptionLocks};
use crate::domain::aggregation::{AggregationScope, BucketUsage};
use crate::domain::charges::Charge;
use crate::domain::coupons::{AppliedCoupon, Coupon};
use crate::domain::currency::{round_cents, Currency, CurrencyProvider, StaticCurrencies};
use crate::domain::events::{Event, EventInput};
use crate::domain::fees::{Fee, FeeKind};
use crate::domain::filters::GroupedBy;
use crate::domain::invoice_assembler::{precise_total, AssemblyContext, InvoiceAssembler};
use crate::domain::invoices::{
    CreditNote, CreditNoteReason, ErrorDetail, ErrorOwner, Invoice, InvoiceStatus,
    InvoiceSubscription, InvoiceSubscriptionKey, InvoicingReason, LifetimeUsage,
    PendingAdjustment,
};
use crate::domain::metrics::BillableMetric;
use crate::domain::plans::{Customer, Plan, Subscription};
use crate::domain::taxes::{StaticTaxRates, TaxRateProvider};
use crate::domain::types::{
    BillableMetricId, BillingBounds, ChargeFilterId, ChargeId, CreditNoteId,
    ExternalSubscriptionId, FeeId, InvoiceId, SubscriptionId, TenantContext, WalletId,
};
use crate::domain::wallet_ledger::{WalletApplication, WalletLedger};
use crate::domain::wallets::TransactionSource;
use crate::error::{BillingError, Result};
use crate::storage::{InvoiceInsert, Repositories};
use crate::telemetry::EngineMetrics;

/// Notified once an invoice is finalized (PDF rendering, webhooks, exports).
/// Runs detached from the billing flow and cannot fail it.
#[async_trait]
pub trait InvoiceHook: Send + Sync {
    async fn invoice_finalized(&self, invoice: &Invoice);
}

pub struct NoopInvoiceHook;

#[async_trait]
impl InvoiceHook for NoopInvoiceHook {
    async fn invoice_finalized(&self, _invoice: &Invoice) {}
}

/// External lookups the engine delegates to
pub struct Collaborators {
    pub taxes: Arc<dyn TaxRateProvider>,
    pub currencies: Arc<dyn CurrencyProvider>,
    pub hook: Arc<dyn InvoiceHook>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            taxes: Arc::new(StaticTaxRates::new()),
            currencies: Arc::new(StaticCurrencies::new()),
            hook: Arc::new(NoopInvoiceHook),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageQuery {
    pub external_subscription_id: ExternalSubscriptionId,
    pub charge_id: ChargeId,
    #[serde(default)]
    pub charge_filter_id: Option<ChargeFilterId>,
    #[serde(default)]
    pub grouped_by: Option<GroupedBy>,
    /// Point in time selecting the billing period; now when absent
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

/// Usage of a charge in the period containing the queried instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentUsage {
    pub charge_id: ChargeId,
    pub from_datetime: DateTime<Utc>,
    pub to_datetime: DateTime<Utc>,
    pub current_aggregation: Decimal,
    pub max_aggregation: Decimal,
    pub buckets: Vec<BucketUsage>,
    /// A recompute is pending; values are the last known good ones
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub subscription_id: SubscriptionId,
    pub from_datetime: DateTime<Utc>,
    pub to_datetime: DateTime<Utc>,
    pub invoicing_reason: InvoicingReason,
}

/// Subscription with everything needed to price it
struct BillingSubject {
    subscription: Subscription,
    plan: Plan,
    customer: Customer,
    currency: Currency,
}

impl BillingSubject {
    fn context(&self, invoice_id: Option<InvoiceId>, bounds: BillingBounds) -> AssemblyContext<'_> {
        AssemblyContext {
            invoice_id,
            subscription: &self.subscription,
            plan: &self.plan,
            customer: &self.customer,
            currency: &self.currency,
            bounds,
        }
    }

    fn lock_key(&self) -> LockKey {
        LockKey::new(
            self.subscription.organization_id,
            &self.subscription.external_id,
        )
    }

    fn arrears_charges(&self) -> impl Iterator<Item = &Charge> {
        self.plan.active_charges().filter(|c| !c.pay_in_advance)
    }
}

#[derive(Default)]
struct AssembledFees {
    fees: Vec<Fee>,
    /// Pending pay-in-advance fees swept into the invoice
    attached: Vec<FeeId>,
    adjustments: Vec<Uuid>,
    progressive_credit_cents: i64,
}

/// Entry point of the billing engine: ingestion, usage queries, invoice
/// lifecycle and the background refresh work
pub struct BillingEngine {
    config: BillingConfig,
    repos: Repositories,
    events: EventStore,
    aggregator: Aggregator,
    assembler: InvoiceAssembler,
    wallets: WalletLedger,
    currencies: Arc<dyn CurrencyProvider>,
    hook: Arc<dyn InvoiceHook>,
    locks: SubscriptionLocks,
    metrics: Arc<EngineMetrics>,
}

impl BillingEngine {
    pub fn new(
        config: BillingConfig,
        repos: Repositories,
        collaborators: Collaborators,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let precision = config.aggregation.default_precision;
        Self {
            events: EventStore::new(repos.events.clone(), metrics.clone()),
            aggregator: Aggregator::new(
                repos.events.clone(),
                repos.aggregations.clone(),
                metrics.clone(),
                precision,
            ),
            assembler: InvoiceAssembler::new(precision, collaborators.taxes),
            wallets: WalletLedger::new(repos.wallets.clone(), config.wallet.clone(), metrics.clone()),
            currencies: collaborators.currencies,
            hook: collaborators.hook,
            locks: SubscriptionLocks::new(),
            metrics,
            repos,
            config,
        }
    }

    /// Engine over in-memory repositories and default collaborators
    pub fn in_memory(config: BillingConfig) -> anyhow::Result<Self> {
        let metrics = Arc::new(EngineMetrics::new()?);
        Ok(Self::new(
            config,
            Repositories::in_memory(),
            Collaborators::default(),
            metrics,
        ))
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn wallet_ledger(&self) -> &WalletLedger {
        &self.wallets
    }

    // Ingestion

    /// Stores one event and applies its billing side effects. Follow-up
    /// failures are logged and persisted; the event itself stays accepted.
    pub async fn ingest_event(
        &self,
        tenant: &TenantContext,
        input: EventInput,
    ) -> Result<IngestOutcome> {
        let outcome = self.events.ingest(tenant, input).await?;
        if let IngestOutcome::Accepted { event } = &outcome {
            if let Err(e) = self.apply_event(event).await {
                error!(
                    "Event {} stored but its billing follow-up failed: {}",
                    event.transaction_id, e
                );
                self.record_event_failure(event, &e).await;
            }
        }
        Ok(outcome)
    }

    /// Ingests events in arrival order; one failure never blocks the rest
    pub async fn ingest_batch(
        &self,
        tenant: &TenantContext,
        inputs: Vec<EventInput>,
    ) -> Vec<Result<IngestOutcome>> {
        let mut results = Vec::with_capacity(inputs.len());
        for input in inputs {
            results.push(self.ingest_event(tenant, input).await);
        }
        results
    }

    async fn apply_event(&self, event: &Event) -> Result<()> {
        let Some(subscription) = self
            .repos
            .catalog
            .find_subscription(event.organization_id, &event.external_subscription_id)
            .await?
        else {
            debug!(
                "No subscription {} for event {} yet",
                event.external_subscription_id, event.transaction_id
            );
            return Ok(());
        };
        let Some(metric) = self
            .repos
            .catalog
            .find_metric_by_code(event.organization_id, &event.code)
            .await?
        else {
            debug!("No billable metric {} for event {}", event.code, event.transaction_id);
            return Ok(());
        };

        let subject = self.load_subject(subscription).await?;
        let _guard = self.locks.acquire(subject.lock_key()).await;

        let Some((from, to)) =
            period_containing(&subject.subscription, &subject.plan, event.timestamp)?
        else {
            debug!(
                "Event {} predates subscription {}",
                event.transaction_id, subject.subscription.id
            );
            return Ok(());
        };
        let bounds = subject.subscription.bounds_for(from, to)?;
        let closing = self.period_invoice(&subject.subscription, from).await?;

        let charges: Vec<&Charge> = subject
            .plan
            .active_charges()
            .filter(|c| c.billable_metric_id == metric.id)
            .collect();
        let mut arrears_touched = false;

        for charge in charges {
            self.aggregator.invalidate(event, &metric, charge).await?;
            if charge.pay_in_advance {
                self.bill_in_advance(&subject, &metric, charge, bounds, event)
                    .await?;
                continue;
            }
            arrears_touched = true;
            if let Some(invoice) = closing.as_ref().filter(|i| i.status == InvoiceStatus::Finalized) {
                self.record_adjustment(&subject, charge, invoice).await?;
            }
        }

        if arrears_touched {
            if let Some(invoice) = closing.as_ref().filter(|i| i.is_draft()) {
                self.flag_for_refresh(invoice.id).await?;
            }
        }

        self.track_lifetime_usage(&subject, from, event.timestamp)
            .await
    }

    async fn bill_in_advance(
        &self,
        subject: &BillingSubject,
        metric: &BillableMetric,
        charge: &Charge,
        bounds: BillingBounds,
        event: &Event,
    ) -> Result<()> {
        let request = AggregationRequest {
            organization_id: subject.subscription.organization_id,
            external_subscription_id: &subject.subscription.external_id,
            metric,
            charge,
            bounds,
        };
        let Some((bucket, before, after)) = self.aggregator.usage_around(&request, event).await?
        else {
            return Ok(());
        };

        let ctx = subject.context(None, bounds);
        if let Some(fee) = self
            .assembler
            .in_advance_fee(&ctx, charge, &bucket, &before, &after, event)?
        {
            self.repos.fees.create_fees(std::slice::from_ref(&fee)).await?;
            info!(
                "Created pay-in-advance fee {} of {} cents for event {}",
                fee.id, fee.amount_cents, event.transaction_id
            );
        }
        Ok(())
    }

    async fn record_adjustment(
        &self,
        subject: &BillingSubject,
        charge: &Charge,
        invoice: &Invoice,
    ) -> Result<()> {
        let pending = self
            .repos
            .usage
            .list_pending_adjustments(&subject.subscription.id)
            .await?;
        if pending
            .iter()
            .any(|a| a.charge_id == charge.id && a.original_invoice_id == invoice.id)
        {
            return Ok(());
        }

        let adjustment = PendingAdjustment {
            id: Uuid::new_v4(),
            organization_id: subject.subscription.organization_id,
            subscription_id: subject.subscription.id,
            charge_id: charge.id,
            original_invoice_id: invoice.id,
            bounds: invoice.bounds,
            applied_invoice_id: None,
            created_at: Utc::now(),
        };
        self.repos.usage.create_pending_adjustment(&adjustment).await?;
        info!(
            "Late usage on finalized invoice {} for charge {}; adjustment queued",
            invoice.id, charge.id
        );
        Ok(())
    }

    async fn flag_for_refresh(&self, invoice_id: InvoiceId) -> Result<()> {
        let Some(mut invoice) = self.repos.invoices.get_invoice(&invoice_id).await? else {
            return Ok(());
        };
        if !invoice.is_draft() || invoice.ready_to_be_refreshed {
            return Ok(());
        }
        invoice.ready_to_be_refreshed = true;
        self.repos.invoices.update_invoice(&invoice).await?;
        debug!("Draft invoice {} flagged for refresh", invoice_id);
        Ok(())
    }

    async fn track_lifetime_usage(
        &self,
        subject: &BillingSubject,
        period_from: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        if subject.plan.usage_thresholds.is_empty() {
            return Ok(());
        }
        let subscription = &subject.subscription;
        let mut usage = self
            .repos
            .usage
            .get_lifetime_usage(&subscription.id)
            .await?
            .unwrap_or_else(|| {
                LifetimeUsage::new(
                    subscription.organization_id,
                    subscription.id,
                    subscription.external_id.clone(),
                )
            });

        // Late events for an earlier period do not roll the counters back
        if usage.period_from.map_or(true, |current| period_from >= current) {
            usage.roll_to_period(period_from);
            usage.last_event_at = Some(usage.last_event_at.map_or(timestamp, |t| t.max(timestamp)));
        }
        usage.recalculate_current_usage = true;
        usage.updated_at = Utc::now();
        self.repos.usage.save_lifetime_usage(&usage).await
    }

    async fn record_event_failure(&self, event: &Event, failure: &BillingError) {
        let Ok(Some(subscription)) = self
            .repos
            .catalog
            .find_subscription(event.organization_id, &event.external_subscription_id)
            .await
        else {
            return;
        };
        let detail = ErrorDetail {
            id: Uuid::new_v4(),
            organization_id: event.organization_id,
            owner: ErrorOwner::Subscription(subscription.id),
            code: failure.code().to_string(),
            details: json!({
                "message": failure.to_string(),
                "transaction_id": event.transaction_id,
                "event": event,
            }),
            created_at: Utc::now(),
        };
        if let Err(e) = self.repos.usage.create_error_detail(&detail).await {
            error!("Failed to persist error detail for event {}: {}", event.transaction_id, e);
        }
    }

    // Usage

    /// Read-only usage of one charge; never writes checkpoints
    pub async fn get_current_usage(
        &self,
        tenant: &TenantContext,
        query: &UsageQuery,
    ) -> Result<CurrentUsage> {
        let subscription = self
            .repos
            .catalog
            .find_subscription(tenant.organization_id, &query.external_subscription_id)
            .await?
            .ok_or_else(|| BillingError::not_found("subscription", &query.external_subscription_id))?;
        let plan = self.get_plan(&subscription).await?;
        let charge = plan
            .charge(query.charge_id)
            .ok_or_else(|| BillingError::not_found("charge", query.charge_id))?;
        let metric = self.get_metric(&charge.billable_metric_id).await?;

        let at = query.at.unwrap_or_else(Utc::now);
        let (from, to) = period_containing(&subscription, &plan, at)?
            .ok_or_else(|| BillingError::validation("at", "precedes the subscription start"))?;
        let bounds = subscription.bounds_for(from, to)?;

        let request = AggregationRequest {
            organization_id: subscription.organization_id,
            external_subscription_id: &subscription.external_id,
            metric: &metric,
            charge,
            bounds,
        };
        let usage = self.aggregator.current_usage(&request).await?;

        let buckets: Vec<BucketUsage> = usage
            .buckets
            .into_iter()
            .filter(|b| {
                query
                    .charge_filter_id
                    .map_or(true, |id| b.bucket.charge_filter_id == Some(id))
            })
            .filter(|b| {
                query
                    .grouped_by
                    .as_ref()
                    .map_or(true, |grouped_by| &b.bucket.grouped_by == grouped_by)
            })
            .collect();

        Ok(CurrentUsage {
            charge_id: charge.id,
            from_datetime: from,
            to_datetime: to,
            current_aggregation: buckets.iter().map(|b| b.current_aggregation).sum(),
            max_aggregation: buckets.iter().map(|b| b.max_aggregation).sum(),
            buckets,
            stale: usage.stale,
        })
    }

    /// Billing period of the subscription containing `at`
    pub async fn billing_period(
        &self,
        tenant: &TenantContext,
        subscription_id: &SubscriptionId,
        at: DateTime<Utc>,
    ) -> Result<Option<BillingBounds>> {
        let subscription = self.load_subscription(tenant, subscription_id).await?;
        let plan = self.get_plan(&subscription).await?;
        period_containing(&subscription, &plan, at)?
            .map(|(from, to)| subscription.bounds_for(from, to))
            .transpose()
    }

    // Invoicing

    /// Generates (or returns the already generated) invoice for a
    /// subscription period and reason. Failures are persisted with a
    /// snapshot of the subscription.
    pub async fn generate_invoice(
        &self,
        tenant: &TenantContext,
        request: InvoiceRequest,
    ) -> Result<Invoice> {
        let subscription = self
            .load_subscription(tenant, &request.subscription_id)
            .await?;
        let bounds = subscription.bounds_for(request.from_datetime, request.to_datetime)?;
        let _guard = self
            .locks
            .acquire(LockKey::new(
                subscription.organization_id,
                &subscription.external_id,
            ))
            .await;

        let generated = match self.load_subject(subscription.clone()).await {
            Ok(subject) => {
                self.generate_locked(&subject, bounds, bounds, request.invoicing_reason)
                    .await
            }
            Err(e) => Err(e),
        };
        match generated {
            Ok(invoice) => Ok(invoice),
            Err(e) => Err(self
                .capture_failure(&subscription, request.invoicing_reason, bounds, e)
                .await),
        }
    }

    /// Generates invoices concurrently; each subscription is isolated from
    /// the failures of the others
    pub async fn generate_invoices(
        &self,
        tenant: &TenantContext,
        requests: Vec<InvoiceRequest>,
    ) -> Vec<Result<Invoice>> {
        join_all(
            requests
                .into_iter()
                .map(|request| self.generate_invoice(tenant, request)),
        )
        .await
    }

    /// Terminates the subscription at `at` and bills its last period
    pub async fn terminate_subscription(
        &self,
        tenant: &TenantContext,
        subscription_id: &SubscriptionId,
        at: DateTime<Utc>,
    ) -> Result<Option<Invoice>> {
        let mut subscription = self.load_subscription(tenant, subscription_id).await?;
        let _guard = self
            .locks
            .acquire(LockKey::new(
                subscription.organization_id,
                &subscription.external_id,
            ))
            .await;

        subscription.terminate(at)?;
        self.repos.catalog.save_subscription(&subscription).await?;
        info!("Subscription {} terminated at {}", subscription.id, at);

        let subject = self.load_subject(subscription).await?;
        for charge in subject.plan.active_charges() {
            self.repos
                .aggregations
                .invalidate_checkpoints(
                    subject.subscription.organization_id,
                    &subject.subscription.external_id,
                    charge.id,
                    at,
                    true,
                )
                .await?;
        }

        let Some((from, to)) = period_containing(&subject.subscription, &subject.plan, at)? else {
            return Ok(None);
        };
        let bounds = subject.subscription.bounds_for(from, to)?;
        let reason = InvoicingReason::SubscriptionTerminating;
        match self.generate_locked(&subject, bounds, bounds, reason).await {
            Ok(invoice) => Ok(Some(invoice)),
            Err(e) => Err(self
                .capture_failure(&subject.subscription, reason, bounds, e)
                .await),
        }
    }

    async fn generate_locked(
        &self,
        subject: &BillingSubject,
        bounds: BillingBounds,
        link_bounds: BillingBounds,
        reason: InvoicingReason,
    ) -> Result<Invoice> {
        let subscription = &subject.subscription;
        let key = InvoiceSubscriptionKey {
            subscription_id: subscription.id,
            from_datetime: link_bounds.from_datetime,
            to_datetime: link_bounds.to_datetime,
            invoicing_reason: reason,
        };
        if let Some(existing) = self.repos.invoices.find_invoice(&key).await? {
            debug!(
                "Invoice {} already bills subscription {} for {}",
                existing.id,
                subscription.id,
                reason.as_str()
            );
            return self.resume_existing(existing, subject).await;
        }

        let mut invoice = Invoice::new_draft(
            subscription.organization_id,
            subject.customer.id,
            subscription.id,
            reason,
            subject.currency.code.clone(),
            bounds,
            subject.customer.invoice_grace_period_days,
        );
        let mut assembled = self
            .assemble(subject, invoice.id, bounds, reason, Vec::new())
            .await?;
        self.price_into(subject, &mut invoice, &mut assembled).await?;

        let link = InvoiceSubscription {
            invoice_id: invoice.id,
            subscription_id: subscription.id,
            bounds: link_bounds,
            invoicing_reason: reason,
        };
        if let InvoiceInsert::Existing(existing) =
            self.repos.invoices.create_invoice(&invoice, &link).await?
        {
            return self.resume_existing(existing, subject).await;
        }

        self.repos
            .fees
            .attach_fees(&invoice.id, &assembled.attached)
            .await?;
        self.repos.fees.create_fees(&assembled.fees).await?;
        if !assembled.adjustments.is_empty() {
            self.repos
                .usage
                .mark_adjustments_applied(&assembled.adjustments, invoice.id)
                .await?;
        }

        self.metrics.record_invoice(reason.as_str());
        info!(
            "Generated {} invoice {} for subscription {}: {} fees, total {} {}",
            reason.as_str(),
            invoice.id,
            subscription.id,
            assembled.fees.len(),
            invoice.totals.total_amount_cents,
            invoice.currency
        );

        if invoice.draft_until.is_none() {
            return self.finalize_locked(invoice, subject).await;
        }
        Ok(invoice)
    }

    /// Completes an invoice left in draft by an interrupted finalization
    async fn resume_existing(&self, existing: Invoice, subject: &BillingSubject) -> Result<Invoice> {
        if !existing.awaiting_finalization() {
            return Ok(existing);
        }
        info!("Resuming finalization of invoice {}", existing.id);
        self.finalize_locked(existing, subject).await
    }

    /// Fee set of an invoice. `carried` fees are kept as they are (pay in
    /// advance fees and adjustments of a draft being refreshed).
    async fn assemble(
        &self,
        subject: &BillingSubject,
        invoice_id: InvoiceId,
        bounds: BillingBounds,
        reason: InvoicingReason,
        carried: Vec<Fee>,
    ) -> Result<AssembledFees> {
        let ctx = subject.context(Some(invoice_id), bounds);
        let mut assembled = AssembledFees {
            fees: carried,
            ..AssembledFees::default()
        };

        match reason {
            InvoicingReason::SubscriptionStarting => {
                assembled
                    .fees
                    .extend(self.assembler.subscription_fee(&ctx, reason)?);
            }
            InvoicingReason::InAdvanceCharge => {
                self.sweep_in_advance(
                    subject,
                    invoice_id,
                    bounds.from_datetime,
                    bounds.to_datetime,
                    &mut assembled,
                )
                .await?;
            }
            InvoicingReason::ProgressiveBilling => {
                for charge in subject.arrears_charges() {
                    let metric = self.get_metric(&charge.billable_metric_id).await?;
                    let request = self.request(subject, &metric, charge, bounds);
                    let usage = self.aggregator.recompute(&request).await?;
                    assembled.fees.extend(
                        self.assembler
                            .charge_fees(&ctx, charge, &usage)?
                            .into_iter()
                            .filter(|f| !matches!(f.kind, FeeKind::TrueUp { .. })),
                    );
                }
                assembled.progressive_credit_cents = self
                    .progressive_credit(&subject.subscription, bounds.from_datetime, Some(invoice_id))
                    .await?;
            }
            InvoicingReason::SubscriptionPeriodic | InvoicingReason::SubscriptionTerminating => {
                for charge in subject.arrears_charges() {
                    let metric = self.get_metric(&charge.billable_metric_id).await?;
                    let request = self.request(subject, &metric, charge, bounds);
                    let usage = self.aggregator.aggregate(&request).await?;
                    assembled
                        .fees
                        .extend(self.assembler.charge_fees(&ctx, charge, &usage)?);
                }
                // Late events of closed periods leave uncollected fees behind
                self.sweep_in_advance(
                    subject,
                    invoice_id,
                    subject.subscription.started_at,
                    bounds.to_datetime,
                    &mut assembled,
                )
                .await?;
                assembled
                    .fees
                    .extend(self.assembler.subscription_fee(&ctx, reason)?);

                let period_fees: Vec<Fee> = assembled
                    .fees
                    .iter()
                    .filter(|f| !matches!(f.kind, FeeKind::Adjustment { .. }))
                    .filter(|f| {
                        !(f.pay_in_advance && f.properties_from < bounds.charges_from_datetime)
                    })
                    .cloned()
                    .collect();
                assembled.fees.extend(
                    self.assembler
                        .commitment_fee(&ctx, precise_total(&period_fees))?,
                );

                let (fees, ids) = self.adjustment_fees(subject, invoice_id).await?;
                assembled.fees.extend(fees);
                assembled.adjustments = ids;
                assembled.progressive_credit_cents = self
                    .progressive_credit(&subject.subscription, bounds.from_datetime, None)
                    .await?;
            }
        }

        Ok(assembled)
    }

    fn request<'a>(
        &self,
        subject: &'a BillingSubject,
        metric: &'a BillableMetric,
        charge: &'a Charge,
        bounds: BillingBounds,
    ) -> AggregationRequest<'a> {
        AggregationRequest {
            organization_id: subject.subscription.organization_id,
            external_subscription_id: &subject.subscription.external_id,
            metric,
            charge,
            bounds,
        }
    }

    /// Attaches pending pay-in-advance fees of periods starting in `[from, to)`
    async fn sweep_in_advance(
        &self,
        subject: &BillingSubject,
        invoice_id: InvoiceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        assembled: &mut AssembledFees,
    ) -> Result<()> {
        let pending = self
            .repos
            .fees
            .list_pending_in_advance(&subject.subscription.id, from, to)
            .await?;
        for mut fee in pending {
            fee.invoice_id = Some(invoice_id);
            assembled.attached.push(fee.id);
            assembled.fees.push(fee);
        }
        Ok(())
    }

    async fn adjustment_fees(
        &self,
        subject: &BillingSubject,
        invoice_id: InvoiceId,
    ) -> Result<(Vec<Fee>, Vec<Uuid>)> {
        let pending = self
            .repos
            .usage
            .list_pending_adjustments(&subject.subscription.id)
            .await?;
        let mut fees = Vec::new();
        let mut ids = Vec::with_capacity(pending.len());
        let mut seen = HashSet::new();

        for adjustment in pending {
            ids.push(adjustment.id);
            if !seen.insert((adjustment.charge_id, adjustment.original_invoice_id)) {
                continue;
            }
            let Some(charge) = subject.plan.charge(adjustment.charge_id) else {
                warn!(
                    "Charge {} of adjustment {} no longer exists",
                    adjustment.charge_id, adjustment.id
                );
                continue;
            };
            let metric = self.get_metric(&charge.billable_metric_id).await?;
            let request = self.request(subject, &metric, charge, adjustment.bounds);
            let recomputed = self.aggregator.recompute(&request).await?;

            let mut billed = self
                .repos
                .fees
                .list_invoice_fees(&adjustment.original_invoice_id)
                .await?;
            billed.extend(
                self.repos
                    .fees
                    .list_adjustment_fees(&adjustment.original_invoice_id)
                    .await?
                    .into_iter()
                    .filter(|f| f.invoice_id != Some(invoice_id)),
            );

            let ctx = subject.context(Some(invoice_id), adjustment.bounds);
            fees.extend(self.assembler.adjustment_fees(
                &ctx,
                charge,
                &recomputed,
                &billed,
                adjustment.original_invoice_id,
            )?);
        }

        Ok((fees, ids))
    }

    /// What non-voided progressive invoices already billed for the period
    async fn progressive_credit(
        &self,
        subscription: &Subscription,
        period_from: DateTime<Utc>,
        exclude: Option<InvoiceId>,
    ) -> Result<i64> {
        let mut credit = 0;
        for link in self.repos.invoices.list_links(&subscription.id).await? {
            if link.invoicing_reason != InvoicingReason::ProgressiveBilling
                || link.bounds.from_datetime != period_from
                || Some(link.invoice_id) == exclude
            {
                continue;
            }
            if let Some(invoice) = self.repos.invoices.get_invoice(&link.invoice_id).await? {
                if invoice.status != InvoiceStatus::Voided {
                    credit += invoice.totals.fees_amount_cents
                        - invoice.totals.progressive_billing_credit_amount_cents;
                }
            }
        }
        Ok(credit)
    }

    async fn price_into(
        &self,
        subject: &BillingSubject,
        invoice: &mut Invoice,
        assembled: &mut AssembledFees,
    ) -> Result<()> {
        for fee in assembled.fees.iter_mut() {
            fee.precise_coupons_amount_cents = Decimal::ZERO;
        }
        let coupons = self.active_coupons(subject, invoice.invoicing_reason).await?;
        let ctx = subject.context(Some(invoice.id), invoice.bounds);
        let priced = self
            .assembler
            .price(
                &ctx,
                &mut assembled.fees,
                &coupons,
                assembled.progressive_credit_cents,
            )
            .await?;
        invoice.totals = priced.totals;
        invoice.applied_taxes = priced.applied_taxes;
        invoice.coupon_credits = priced.coupon_credits;
        Ok(())
    }

    /// Coupons only apply to invoices billing the plan itself
    async fn active_coupons(
        &self,
        subject: &BillingSubject,
        reason: InvoicingReason,
    ) -> Result<Vec<(AppliedCoupon, Coupon)>> {
        if !reason.closes_period() && reason != InvoicingReason::SubscriptionStarting {
            return Ok(Vec::new());
        }
        Ok(self
            .repos
            .catalog
            .list_applied_coupons(&subject.customer.id)
            .await?
            .into_iter()
            .filter(|(applied, _)| applied.is_active())
            .collect())
    }

    async fn refresh_draft_locked(
        &self,
        mut invoice: Invoice,
        subject: &BillingSubject,
    ) -> Result<Invoice> {
        invoice.ensure_mutable()?;
        let carried: Vec<Fee> = self
            .repos
            .fees
            .list_invoice_fees(&invoice.id)
            .await?
            .into_iter()
            .filter(|f| f.pay_in_advance || matches!(f.kind, FeeKind::Adjustment { .. }))
            .collect();

        let mut assembled = self
            .assemble(
                subject,
                invoice.id,
                invoice.bounds,
                invoice.invoicing_reason,
                carried,
            )
            .await?;
        self.price_into(subject, &mut invoice, &mut assembled).await?;

        self.repos
            .fees
            .attach_fees(&invoice.id, &assembled.attached)
            .await?;
        self.repos
            .fees
            .replace_invoice_fees(&invoice.id, &assembled.fees)
            .await?;
        if !assembled.adjustments.is_empty() {
            self.repos
                .usage
                .mark_adjustments_applied(&assembled.adjustments, invoice.id)
                .await?;
        }

        invoice.ready_to_be_refreshed = false;
        let invoice = self.repos.invoices.update_invoice(&invoice).await?;
        info!(
            "Refreshed draft invoice {}: total {} {}",
            invoice.id, invoice.totals.total_amount_cents, invoice.currency
        );
        Ok(invoice)
    }

    /// Finalizes a draft: applies wallet credits, assigns the number and
    /// freezes the billed aggregations
    pub async fn finalize_invoice(
        &self,
        tenant: &TenantContext,
        invoice_id: &InvoiceId,
    ) -> Result<Invoice> {
        let (invoice, subject) = self.load_invoice_subject(tenant, invoice_id).await?;
        let _guard = self.locks.acquire(subject.lock_key()).await;
        let invoice = self.reload_invoice(&invoice.id).await?;
        self.finalize_locked(invoice, &subject).await
    }

    async fn finalize_locked(&self, invoice: Invoice, subject: &BillingSubject) -> Result<Invoice> {
        invoice.ensure_mutable()?;
        let mut invoice = if invoice.ready_to_be_refreshed {
            self.refresh_draft_locked(invoice, subject).await?
        } else {
            invoice
        };
        let now = Utc::now();

        let application = if invoice.totals.total_amount_cents > 0 {
            self.wallets
                .apply_to_invoice(
                    &invoice.customer_id,
                    &invoice.currency,
                    invoice.totals.total_amount_cents,
                    invoice.id,
                )
                .await?
        } else {
            WalletApplication::default()
        };
        InvoiceAssembler::apply_prepaid_credits(&mut invoice.totals, application.amount_cents);
        invoice
            .wallet_transaction_ids
            .extend(application.transaction_ids.iter().copied());

        let invoice_id = invoice.id;
        let invoice = match self.store_finalized(invoice, now).await {
            Ok(invoice) => invoice,
            Err(e) => {
                // The draft stays linked and is retried later, so the credits go back
                if let Err(restore) = self.wallets.reverse_application(&application).await {
                    error!(
                        "Failed to restore wallet credits of invoice {}: {}",
                        invoice_id, restore
                    );
                }
                return Err(e);
            }
        };

        if invoice.invoicing_reason.closes_period() {
            let scopes: Vec<AggregationScope> = subject
                .arrears_charges()
                .map(|charge| AggregationScope {
                    organization_id: invoice.organization_id,
                    external_subscription_id: subject.subscription.external_id.clone(),
                    charge_id: charge.id,
                    period_from: invoice.bounds.from_datetime,
                })
                .collect();
            self.aggregator.freeze(&scopes).await?;
        }
        self.consume_coupons(&invoice, now).await?;

        info!(
            "Finalized invoice {} as {}: total {} {}, prepaid credits {}",
            invoice.id,
            invoice.number.as_deref().unwrap_or_default(),
            invoice.totals.total_amount_cents,
            invoice.currency,
            invoice.totals.prepaid_credit_amount_cents
        );

        let hook = self.hook.clone();
        let finalized = invoice.clone();
        tokio::spawn(async move {
            hook.invoice_finalized(&finalized).await;
        });

        Ok(invoice)
    }

    async fn store_finalized(&self, mut invoice: Invoice, now: DateTime<Utc>) -> Result<Invoice> {
        let number = self
            .repos
            .invoices
            .next_invoice_number(invoice.organization_id)
            .await?;
        invoice.number = Some(format!(
            "{}-{:06}",
            self.config.invoicing.number_prefix, number
        ));
        invoice.transition(InvoiceStatus::Finalized, now)?;
        self.repos.invoices.update_invoice(&invoice).await
    }

    async fn consume_coupons(&self, invoice: &Invoice, at: DateTime<Utc>) -> Result<()> {
        if invoice.coupon_credits.is_empty() {
            return Ok(());
        }
        for (mut applied, coupon) in self
            .repos
            .catalog
            .list_applied_coupons(&invoice.customer_id)
            .await?
        {
            let credits: Vec<_> = invoice
                .coupon_credits
                .iter()
                .filter(|c| c.applied_coupon_id == applied.id)
                .collect();
            if credits.is_empty() {
                continue;
            }
            let used: i64 = credits.iter().map(|c| c.amount_cents).sum();
            applied.consume(&coupon, used, at);
            self.repos.catalog.save_applied_coupon(&applied).await?;
        }
        Ok(())
    }

    pub async fn void_invoice(
        &self,
        tenant: &TenantContext,
        invoice_id: &InvoiceId,
    ) -> Result<Invoice> {
        let (_, subject) = self.load_invoice_subject(tenant, invoice_id).await?;
        let _guard = self.locks.acquire(subject.lock_key()).await;
        let mut invoice = self.reload_invoice(invoice_id).await?;

        invoice.transition(InvoiceStatus::Voided, Utc::now())?;
        let invoice = self.repos.invoices.update_invoice(&invoice).await?;
        info!("Voided invoice {}", invoice.id);
        Ok(invoice)
    }

    /// Credits part of a finalized invoice, optionally refunding it as
    /// granted credits on one of the customer's wallets
    pub async fn issue_credit_note(
        &self,
        tenant: &TenantContext,
        invoice_id: &InvoiceId,
        amount_cents: i64,
        reason: CreditNoteReason,
        refund_wallet_id: Option<WalletId>,
    ) -> Result<CreditNote> {
        if amount_cents <= 0 {
            return Err(BillingError::validation("amount_cents", "must be positive"));
        }
        let (_, subject) = self.load_invoice_subject(tenant, invoice_id).await?;
        let _guard = self.locks.acquire(subject.lock_key()).await;
        let mut invoice = self.reload_invoice(invoice_id).await?;

        if invoice.status != InvoiceStatus::Finalized {
            return Err(BillingError::InvalidState {
                message: format!("invoice {} is not finalized", invoice.id),
            });
        }
        let creditable = invoice.creditable_amount_cents();
        if amount_cents > creditable {
            return Err(BillingError::validation(
                "amount_cents",
                format!("exceeds the creditable amount of {}", creditable),
            ));
        }

        if let Some(wallet_id) = refund_wallet_id {
            let wallet = self
                .repos
                .wallets
                .get_wallet(&wallet_id)
                .await?
                .ok_or_else(|| BillingError::not_found("wallet", wallet_id))?;
            if wallet.customer_id != invoice.customer_id {
                return Err(BillingError::validation(
                    "refund_wallet_id",
                    "wallet belongs to another customer",
                ));
            }
            if wallet.currency.code != invoice.currency {
                return Err(BillingError::CurrencyMismatch {
                    expected: invoice.currency.clone(),
                    found: wallet.currency.code.clone(),
                });
            }
            let credits = wallet.cents_to_credits(Decimal::from(amount_cents));
            self.wallets
                .top_up(&wallet_id, Decimal::ZERO, credits, TransactionSource::CreditNote)
                .await?;
        }

        let credit_note = CreditNote {
            id: CreditNoteId::new(),
            organization_id: invoice.organization_id,
            invoice_id: invoice.id,
            amount_cents,
            reason,
            refund_wallet_id,
            created_at: Utc::now(),
        };
        self.repos.invoices.create_credit_note(&credit_note).await?;
        invoice.credited_amount_cents += amount_cents;
        self.repos.invoices.update_invoice(&invoice).await?;

        info!(
            "Issued credit note {} of {} cents on invoice {}",
            credit_note.id, amount_cents, invoice.id
        );
        Ok(credit_note)
    }

    async fn capture_failure(
        &self,
        subscription: &Subscription,
        reason: InvoicingReason,
        bounds: BillingBounds,
        failure: BillingError,
    ) -> BillingError {
        let backtrace = Backtrace::force_capture().to_string();
        error!(
            "Failed to generate {} invoice for subscription {}: {}",
            reason.as_str(),
            subscription.id,
            failure
        );
        self.metrics.record_invoice_failure();

        let detail = ErrorDetail {
            id: Uuid::new_v4(),
            organization_id: subscription.organization_id,
            owner: ErrorOwner::Subscription(subscription.id),
            code: failure.code().to_string(),
            details: json!({
                "message": failure.to_string(),
                "invoicing_reason": reason.as_str(),
                "from_datetime": bounds.from_datetime,
                "to_datetime": bounds.to_datetime,
                "subscription": subscription,
                "backtrace": backtrace,
            }),
            created_at: Utc::now(),
        };
        if let Err(e) = self.repos.usage.create_error_detail(&detail).await {
            error!(
                "Failed to persist error detail for subscription {}: {}",
                subscription.id, e
            );
        }

        BillingError::InvoiceGenerationFailure {
            subscription: subscription.id.to_string(),
            message: failure.to_string(),
        }
    }

    // Background refresh

    async fn refresh_scope(&self, scope: &AggregationScope) -> Result<bool> {
        let Some(subscription) = self
            .repos
            .catalog
            .find_subscription(scope.organization_id, &scope.external_subscription_id)
            .await?
        else {
            warn!(
                "Invalidated aggregation for unknown subscription {}",
                scope.external_subscription_id
            );
            return Ok(false);
        };
        let subject = self.load_subject(subscription).await?;
        let _guard = self.locks.acquire(subject.lock_key()).await;

        let Some(charge) = subject.plan.charge(scope.charge_id) else {
            warn!("Invalidated aggregation for unknown charge {}", scope.charge_id);
            return Ok(false);
        };
        let metric = self.get_metric(&charge.billable_metric_id).await?;
        let to = subject.plan.interval.advance(scope.period_from)?;
        let bounds = subject.subscription.bounds_for(scope.period_from, to)?;

        self.aggregator
            .aggregate(&self.request(&subject, &metric, charge, bounds))
            .await?;
        Ok(true)
    }

    async fn refresh_draft(&self, draft: &Invoice, due: bool) -> Result<bool> {
        let subscription = self
            .repos
            .catalog
            .get_subscription(&draft.subscription_id)
            .await?
            .ok_or_else(|| BillingError::not_found("subscription", draft.subscription_id))?;
        let subject = self.load_subject(subscription).await?;
        let _guard = self.locks.acquire(subject.lock_key()).await;

        let invoice = self.reload_invoice(&draft.id).await?;
        if !invoice.is_draft() {
            return Ok(false);
        }
        if due {
            self.finalize_locked(invoice, &subject).await?;
        } else {
            self.refresh_draft_locked(invoice, &subject).await?;
        }
        Ok(true)
    }

    /// Recomputes the period's usage amount and bills a progressive invoice
    /// when a usage threshold was crossed. Returns whether one was issued.
    async fn refresh_lifetime_usage(&self, flagged: &LifetimeUsage) -> Result<bool> {
        let subscription = self
            .repos
            .catalog
            .get_subscription(&flagged.subscription_id)
            .await?
            .ok_or_else(|| BillingError::not_found("subscription", flagged.subscription_id))?;
        let subject = self.load_subject(subscription).await?;
        let _guard = self.locks.acquire(subject.lock_key()).await;

        let Some(mut usage) = self
            .repos
            .usage
            .get_lifetime_usage(&flagged.subscription_id)
            .await?
        else {
            return Ok(false);
        };
        usage.recalculate_current_usage = false;
        usage.updated_at = Utc::now();
        let Some(period_from) = usage.period_from else {
            self.repos.usage.save_lifetime_usage(&usage).await?;
            return Ok(false);
        };

        let period_to = subject.plan.interval.advance(period_from)?;
        let bounds = subject.subscription.bounds_for(period_from, period_to)?;
        // Usage is measured up to just after the latest event
        let crossing_at = usage
            .last_event_at
            .map_or(period_to, |t| (t + Duration::seconds(1)).min(period_to))
            .max(period_from + Duration::seconds(1));
        let truncated = bounds.truncated_at(crossing_at);

        let mut precise_cents = Decimal::ZERO;
        for charge in subject.arrears_charges() {
            let metric = self.get_metric(&charge.billable_metric_id).await?;
            let charge_usage = self
                .aggregator
                .recompute(&self.request(&subject, &metric, charge, truncated))
                .await?;
            for bucket in &charge_usage.buckets {
                precise_cents += self
                    .assembler
                    .calculator()
                    .calculate(
                        charge,
                        bucket.bucket.charge_filter_id,
                        &bucket.usage,
                        &truncated,
                        &subject.currency,
                    )
                    .precise_amount_cents;
            }
        }
        usage.current_usage_amount_cents = round_cents(precise_cents)?;

        let previous = usage.last_threshold_amount_cents.unwrap_or(0);
        let mut invoiced = false;
        if let Some(threshold) = subject
            .plan
            .crossed_threshold(previous, usage.current_usage_amount_cents)
        {
            let link_bounds = BillingBounds::new(period_from, crossing_at)?;
            let reason = InvoicingReason::ProgressiveBilling;
            let invoice = match self
                .generate_locked(&subject, truncated, link_bounds, reason)
                .await
            {
                Ok(invoice) => invoice,
                Err(e) => {
                    return Err(self
                        .capture_failure(&subject.subscription, reason, link_bounds, e)
                        .await)
                }
            };
            info!(
                "Subscription {} crossed usage threshold {}: progressive invoice {}",
                subject.subscription.id, threshold, invoice.id
            );
            usage.invoiced_usage_amount_cents = usage.current_usage_amount_cents;
            usage.last_threshold_amount_cents = Some(threshold);
            invoiced = true;
        }

        self.repos.usage.save_lifetime_usage(&usage).await?;
        Ok(invoiced)
    }

    // Loading

    async fn load_subscription(
        &self,
        tenant: &TenantContext,
        id: &SubscriptionId,
    ) -> Result<Subscription> {
        let subscription = self
            .repos
            .catalog
            .get_subscription(id)
            .await?
            .ok_or_else(|| BillingError::not_found("subscription", id))?;
        tenant.ensure_owns(subscription.organization_id, "subscription")?;
        Ok(subscription)
    }

    async fn load_subject(&self, subscription: Subscription) -> Result<BillingSubject> {
        let plan = self.get_plan(&subscription).await?;
        let customer = self
            .repos
            .catalog
            .get_customer(&subscription.customer_id)
            .await?
            .ok_or_else(|| BillingError::not_found("customer", subscription.customer_id))?;
        let code = if customer.currency.is_empty() {
            self.config.invoicing.default_currency.as_str()
        } else {
            customer.currency.as_str()
        };
        let currency = self.currencies.currency(code)?;
        Ok(BillingSubject {
            subscription,
            plan,
            customer,
            currency,
        })
    }

    async fn load_invoice_subject(
        &self,
        tenant: &TenantContext,
        invoice_id: &InvoiceId,
    ) -> Result<(Invoice, BillingSubject)> {
        let invoice = self.reload_invoice(invoice_id).await?;
        tenant.ensure_owns(invoice.organization_id, "invoice")?;
        let subscription = self
            .repos
            .catalog
            .get_subscription(&invoice.subscription_id)
            .await?
            .ok_or_else(|| BillingError::not_found("subscription", invoice.subscription_id))?;
        let subject = self.load_subject(subscription).await?;
        Ok((invoice, subject))
    }

    async fn reload_invoice(&self, id: &InvoiceId) -> Result<Invoice> {
        self.repos
            .invoices
            .get_invoice(id)
            .await?
            .ok_or_else(|| BillingError::not_found("invoice", id))
    }

    async fn get_plan(&self, subscription: &Subscription) -> Result<Plan> {
        self.repos
            .catalog
            .get_plan(&subscription.plan_id)
            .await?
            .ok_or_else(|| BillingError::not_found("plan", subscription.plan_id))
    }

    async fn get_metric(&self, id: &BillableMetricId) -> Result<BillableMetric> {
        self.repos
            .catalog
            .get_metric(id)
            .await?
            .ok_or_else(|| BillingError::not_found("billable_metric", id))
    }

    /// Latest non-voided period-closing invoice for the period starting at `from`
    async fn period_invoice(
        &self,
        subscription: &Subscription,
        from: DateTime<Utc>,
    ) -> Result<Option<Invoice>> {
        let mut latest: Option<Invoice> = None;
        for link in self.repos.invoices.list_links(&subscription.id).await? {
            if !link.invoicing_reason.closes_period() || link.bounds.from_datetime != from {
                continue;
            }
            let Some(invoice) = self.repos.invoices.get_invoice(&link.invoice_id).await? else {
                continue;
            };
            if invoice.status == InvoiceStatus::Voided {
                continue;
            }
            if latest.as_ref().map_or(true, |l| invoice.created_at > l.created_at) {
                latest = Some(invoice);
            }
        }
        Ok(latest)
    }
}

/// Billing period anchored on the subscription start that contains `at`
fn period_containing(
    subscription: &Subscription,
    plan: &Plan,
    at: DateTime<Utc>,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    if at < subscription.started_at {
        return Ok(None);
    }
    let mut from = subscription.started_at;
    let mut to = plan.interval.advance(from)?;
    while to <= at {
        from = to;
        to = plan.interval.advance(from)?;
    }
    Ok(Some((from, to)))
}

#[async_trait]
impl RefreshTarget for BillingEngine {
    async fn refresh_pending(&self, batch_size: usize) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();

        for scope in self.aggregator.invalidated_scopes(batch_size).await? {
            match self.refresh_scope(&scope).await {
                Ok(true) => report.aggregations_recomputed += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    error!(
                        "Failed to recompute charge {} of subscription {}: {}",
                        scope.charge_id, scope.external_subscription_id, e
                    );
                }
            }
        }

        let now = Utc::now();
        for draft in self.repos.invoices.list_drafts(batch_size).await? {
            // No grace period left means finalization was interrupted
            let due = draft.draft_until.map_or(true, |until| until <= now);
            if !due && !draft.ready_to_be_refreshed {
                continue;
            }
            match self.refresh_draft(&draft, due).await {
                Ok(true) if due => report.invoices_finalized += 1,
                Ok(true) => report.drafts_refreshed += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    error!("Failed to refresh draft invoice {}: {}", draft.id, e);
                }
            }
        }

        for usage in self
            .repos
            .usage
            .list_flagged_lifetime_usage(batch_size)
            .await?
        {
            match self.refresh_lifetime_usage(&usage).await {
                Ok(progressive) => {
                    report.lifetime_usage_refreshed += 1;
                    if progressive {
                        report.progressive_invoices += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        "Failed to refresh lifetime usage of subscription {}: {}",
                        usage.subscription_id, e
                    );
                }
            }
        }

        match self.wallets.run_interval_rules(now).await {
            Ok(fired) => report.wallet_rules_fired = fired,
            Err(e) => {
                report.failed += 1;
                error!("Failed to run recurring wallet rules: {}", e);
            }
        }

        Ok(report)
    }
}
