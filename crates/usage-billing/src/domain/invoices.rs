use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::coupons::CouponCredit;
use crate::domain::taxes::AppliedTax;
use crate::domain::types::{
    BillingBounds, ChargeId, CreditNoteId, CustomerId, ExternalSubscriptionId, InvoiceId,
    OrganizationId, SubscriptionId, WalletId, WalletTransactionId,
};
use crate::error::{BillingError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Finalized,
    Voided,
}

impl InvoiceStatus {
    pub fn can_transition_to(&self, to: &InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!((self, to), (Draft, Finalized) | (Finalized, Voided))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoicingReason {
    SubscriptionStarting,
    SubscriptionPeriodic,
    SubscriptionTerminating,
    InAdvanceCharge,
    ProgressiveBilling,
}

impl InvoicingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoicingReason::SubscriptionStarting => "subscription_starting",
            InvoicingReason::SubscriptionPeriodic => "subscription_periodic",
            InvoicingReason::SubscriptionTerminating => "subscription_terminating",
            InvoicingReason::InAdvanceCharge => "in_advance_charge",
            InvoicingReason::ProgressiveBilling => "progressive_billing",
        }
    }

    /// Reasons that close a billing period for usage
    pub fn closes_period(&self) -> bool {
        matches!(
            self,
            InvoicingReason::SubscriptionPeriodic | InvoicingReason::SubscriptionTerminating
        )
    }
}

/// Amount components of an invoice, all non-negative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InvoiceTotals {
    pub fees_amount_cents: i64,
    pub coupons_amount_cents: i64,
    pub taxes_amount_cents: i64,
    pub progressive_billing_credit_amount_cents: i64,
    pub prepaid_credit_amount_cents: i64,
    pub total_amount_cents: i64,
}

impl InvoiceTotals {
    /// Amount due before credits are deducted
    pub fn amount_before_credits(&self) -> i64 {
        self.fees_amount_cents - self.coupons_amount_cents + self.taxes_amount_cents
    }

    pub fn recompute_total(&mut self) {
        self.total_amount_cents = self.amount_before_credits()
            - self.progressive_billing_credit_amount_cents
            - self.prepaid_credit_amount_cents;
    }

    pub fn is_balanced(&self) -> bool {
        self.total_amount_cents
            == self.fees_amount_cents - self.coupons_amount_cents + self.taxes_amount_cents
                - self.progressive_billing_credit_amount_cents
                - self.prepaid_credit_amount_cents
            && self.total_amount_cents >= 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub organization_id: OrganizationId,
    pub customer_id: CustomerId,
    pub subscription_id: SubscriptionId,
    pub invoicing_reason: InvoicingReason,
    pub status: InvoiceStatus,
    /// Assigned at finalization
    pub number: Option<String>,
    pub currency: String,
    pub bounds: BillingBounds,
    pub totals: InvoiceTotals,
    #[serde(default)]
    pub applied_taxes: Vec<AppliedTax>,
    #[serde(default)]
    pub coupon_credits: Vec<CouponCredit>,
    #[serde(default)]
    pub wallet_transaction_ids: Vec<WalletTransactionId>,
    #[serde(default)]
    pub credited_amount_cents: i64,
    #[serde(default)]
    pub ready_to_be_refreshed: bool,
    /// Drafts are finalized automatically once this passes
    pub draft_until: Option<DateTime<Utc>>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub voided_at: Option<DateTime<Utc>>,
}

impl Invoice {
    pub fn new_draft(
        organization_id: OrganizationId,
        customer_id: CustomerId,
        subscription_id: SubscriptionId,
        invoicing_reason: InvoicingReason,
        currency: impl Into<String>,
        bounds: BillingBounds,
        grace_period_days: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: InvoiceId::new(),
            organization_id,
            customer_id,
            subscription_id,
            invoicing_reason,
            status: InvoiceStatus::Draft,
            number: None,
            currency: currency.into(),
            bounds,
            totals: InvoiceTotals::default(),
            applied_taxes: Vec::new(),
            coupon_credits: Vec::new(),
            wallet_transaction_ids: Vec::new(),
            credited_amount_cents: 0,
            ready_to_be_refreshed: false,
            draft_until: (grace_period_days > 0)
                .then(|| now + Duration::days(i64::from(grace_period_days))),
            version: 0,
            created_at: now,
            finalized_at: None,
            voided_at: None,
        }
    }

    pub fn is_draft(&self) -> bool {
        self.status == InvoiceStatus::Draft
    }

    /// A draft without grace period is finalized right away; one still in
    /// draft had its finalization interrupted
    pub fn awaiting_finalization(&self) -> bool {
        self.is_draft() && self.draft_until.is_none()
    }

    pub fn ensure_mutable(&self) -> Result<()> {
        if !self.is_draft() {
            return Err(BillingError::InvoiceImmutable {
                invoice_id: self.id.to_string(),
            });
        }
        Ok(())
    }

    pub fn transition(&mut self, to: InvoiceStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(&to) {
            return Err(BillingError::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", to),
            });
        }
        match to {
            InvoiceStatus::Finalized => {
                self.finalized_at = Some(at);
                self.ready_to_be_refreshed = false;
                self.draft_until = None;
            }
            InvoiceStatus::Voided => self.voided_at = Some(at),
            InvoiceStatus::Draft => {}
        }
        self.status = to;
        Ok(())
    }

    /// Amount still open to credit notes
    pub fn creditable_amount_cents(&self) -> i64 {
        (self.totals.total_amount_cents + self.totals.prepaid_credit_amount_cents
            - self.credited_amount_cents)
            .max(0)
    }
}

/// Link between an invoice and the subscription period it bills; unique per
/// `(subscription, from, to, reason)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSubscription {
    pub invoice_id: InvoiceId,
    pub subscription_id: SubscriptionId,
    pub bounds: BillingBounds,
    pub invoicing_reason: InvoicingReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvoiceSubscriptionKey {
    pub subscription_id: SubscriptionId,
    pub from_datetime: DateTime<Utc>,
    pub to_datetime: DateTime<Utc>,
    pub invoicing_reason: InvoicingReason,
}

impl InvoiceSubscription {
    pub fn key(&self) -> InvoiceSubscriptionKey {
        InvoiceSubscriptionKey {
            subscription_id: self.subscription_id,
            from_datetime: self.bounds.from_datetime,
            to_datetime: self.bounds.to_datetime,
            invoicing_reason: self.invoicing_reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditNoteReason {
    Duplicate,
    ProductUnsatisfactory,
    OrderChange,
    OrderCancellation,
    FraudulentCharge,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditNote {
    pub id: CreditNoteId,
    pub organization_id: OrganizationId,
    pub invoice_id: InvoiceId,
    pub amount_cents: i64,
    pub reason: CreditNoteReason,
    /// Wallet credited with the refund, if any
    pub refund_wallet_id: Option<WalletId>,
    pub created_at: DateTime<Utc>,
}

/// Owner of a captured failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "owner_type", content = "owner_id", rename_all = "snake_case")]
pub enum ErrorOwner {
    Subscription(SubscriptionId),
    Invoice(InvoiceId),
}

/// Persisted failure with enough context to replay it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub id: Uuid,
    pub organization_id: OrganizationId,
    pub owner: ErrorOwner,
    pub code: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Cumulative usage of a subscription's current period, for progressive billing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifetimeUsage {
    pub organization_id: OrganizationId,
    pub subscription_id: SubscriptionId,
    pub external_subscription_id: ExternalSubscriptionId,
    pub invoiced_usage_amount_cents: i64,
    pub current_usage_amount_cents: i64,
    pub last_threshold_amount_cents: Option<i64>,
    pub recalculate_current_usage: bool,
    pub period_from: Option<DateTime<Utc>>,
    /// Latest event timestamp seen in the current period
    #[serde(default)]
    pub last_event_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl LifetimeUsage {
    pub fn new(
        organization_id: OrganizationId,
        subscription_id: SubscriptionId,
        external_subscription_id: ExternalSubscriptionId,
    ) -> Self {
        Self {
            organization_id,
            subscription_id,
            external_subscription_id,
            invoiced_usage_amount_cents: 0,
            current_usage_amount_cents: 0,
            last_threshold_amount_cents: None,
            recalculate_current_usage: false,
            period_from: None,
            last_event_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Resets the per-period counters when a new period starts
    pub fn roll_to_period(&mut self, period_from: DateTime<Utc>) {
        if self.period_from != Some(period_from) {
            self.period_from = Some(period_from);
            self.invoiced_usage_amount_cents = 0;
            self.current_usage_amount_cents = 0;
            self.last_threshold_amount_cents = None;
            self.last_event_at = None;
        }
    }
}

/// Late usage on an already finalized period, billed on a later invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAdjustment {
    pub id: Uuid,
    pub organization_id: OrganizationId,
    pub subscription_id: SubscriptionId,
    pub charge_id: ChargeId,
    pub original_invoice_id: InvoiceId,
    pub bounds: BillingBounds,
    pub applied_invoice_id: Option<InvoiceId>,
    pub created_at: DateTime<Utc>,
}
