use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::currency::Currency;
use crate::domain::plans::PlanInterval;
use crate::domain::types::{
    CustomerId, InvoiceId, OrganizationId, RecurringRuleId, WalletId, WalletTransactionId,
};
use crate::error::{BillingError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Active,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum RuleTrigger {
    /// Top up once the balance drops below the threshold
    Threshold { threshold_credits: Decimal },
    Interval {
        interval: PlanInterval,
        next_run_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RuleMethod {
    Fixed {
        paid_credits: Decimal,
        granted_credits: Decimal,
    },
    /// Top up to bring the balance back to a target
    Target { target_balance: Decimal },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringTransactionRule {
    pub id: RecurringRuleId,
    pub trigger: RuleTrigger,
    pub method: RuleMethod,
}

impl RecurringTransactionRule {
    pub fn new(trigger: RuleTrigger, method: RuleMethod) -> Self {
        Self {
            id: RecurringRuleId::new(),
            trigger,
            method,
        }
    }

    /// Paid and granted credits to add given the current balance
    pub fn credits_for(&self, balance_credits: Decimal) -> (Decimal, Decimal) {
        match &self.method {
            RuleMethod::Fixed {
                paid_credits,
                granted_credits,
            } => (*paid_credits, *granted_credits),
            RuleMethod::Target { target_balance } => (
                (*target_balance - balance_credits).max(Decimal::ZERO),
                Decimal::ZERO,
            ),
        }
    }

    pub fn is_threshold_triggered(&self, balance_credits: Decimal) -> bool {
        matches!(
            &self.trigger,
            RuleTrigger::Threshold { threshold_credits } if balance_credits < *threshold_credits
        )
    }

    pub fn is_interval_due(&self, now: DateTime<Utc>) -> bool {
        matches!(&self.trigger, RuleTrigger::Interval { next_run_at, .. } if *next_run_at <= now)
    }
}

/// Prepaid credit balance of a customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub organization_id: OrganizationId,
    pub customer_id: CustomerId,
    pub name: String,
    pub currency: Currency,
    /// Currency major units per credit
    pub rate_amount: Decimal,
    pub credits_balance: Decimal,
    pub consumed_credits: Decimal,
    /// Lower numbers are consumed first
    pub priority: u32,
    pub status: WalletStatus,
    #[serde(default)]
    pub recurring_rules: Vec<RecurringTransactionRule>,
    /// Optimistic concurrency counter, bumped on every balance change
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(
        organization_id: OrganizationId,
        customer_id: CustomerId,
        currency: Currency,
        rate_amount: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WalletId::new(),
            organization_id,
            customer_id,
            name: "Prepaid credits".to_string(),
            currency,
            rate_amount,
            credits_balance: Decimal::ZERO,
            consumed_credits: Decimal::ZERO,
            priority: 50,
            status: WalletStatus::Active,
            recurring_rules: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_amount <= Decimal::ZERO {
            return Err(BillingError::validation("rate_amount", "must be positive"));
        }
        if self.credits_balance < Decimal::ZERO {
            return Err(BillingError::validation(
                "credits_balance",
                "must not be negative",
            ));
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status == WalletStatus::Active
    }

    /// Minor units a number of credits is worth
    pub fn credits_to_cents(&self, credits: Decimal) -> Decimal {
        self.currency.to_precise_cents(credits * self.rate_amount)
    }

    pub fn cents_to_credits(&self, cents: Decimal) -> Decimal {
        cents / self.currency.subunit_to_unit() / self.rate_amount
    }

    /// Whole minor units available for consumption
    pub fn balance_cents(&self) -> i64 {
        self.credits_to_cents(self.credits_balance)
            .round_dp_with_strategy(0, RoundingStrategy::ToZero)
            .to_i64()
            .unwrap_or(0)
    }

    pub(crate) fn debit(&mut self, credits: Decimal, at: DateTime<Utc>) {
        self.credits_balance -= credits;
        self.consumed_credits += credits;
        self.updated_at = at;
    }

    /// Undoes a `debit`
    pub(crate) fn restore(&mut self, credits: Decimal, at: DateTime<Utc>) {
        self.credits_balance += credits;
        self.consumed_credits -= credits;
        self.updated_at = at;
    }

    pub(crate) fn credit(&mut self, credits: Decimal, at: DateTime<Utc>) {
        self.credits_balance += credits;
        self.updated_at = at;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Settled,
    Failed,
}

impl TransactionStatus {
    pub fn can_transition_to(&self, to: &TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!((self, to), (Pending, Settled) | (Pending, Failed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    Manual,
    Interval,
    Threshold,
    Invoice,
    CreditNote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: WalletTransactionId,
    pub organization_id: OrganizationId,
    pub wallet_id: WalletId,
    pub direction: TransactionDirection,
    pub status: TransactionStatus,
    pub source: TransactionSource,
    pub credit_amount: Decimal,
    /// Currency major units
    pub amount: Decimal,
    pub granted: bool,
    pub invoice_id: Option<InvoiceId>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl WalletTransaction {
    pub fn new(
        wallet: &Wallet,
        direction: TransactionDirection,
        source: TransactionSource,
        credit_amount: Decimal,
        granted: bool,
    ) -> Self {
        Self {
            id: WalletTransactionId::new(),
            organization_id: wallet.organization_id,
            wallet_id: wallet.id,
            direction,
            status: TransactionStatus::Pending,
            source,
            credit_amount,
            amount: wallet
                .currency
                .round_major(credit_amount * wallet.rate_amount),
            granted,
            invoice_id: None,
            created_at: Utc::now(),
            settled_at: None,
        }
    }

    pub fn settle(&mut self, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(&TransactionStatus::Settled) {
            return Err(BillingError::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: "Settled".to_string(),
            });
        }
        self.status = TransactionStatus::Settled;
        self.settled_at = Some(at);
        Ok(())
    }
}
