use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::charges::Charge;
use crate::domain::types::{
    BillingBounds, ChargeId, CustomerId, ExternalCustomerId, ExternalSubscriptionId, Lifecycle,
    OrganizationId, PlanId, SubscriptionId,
};
use crate::error::{BillingError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanInterval {
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl PlanInterval {
    /// Start of the period following the one starting at `from`
    pub fn advance(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let next = match self {
            PlanInterval::Weekly => from.checked_add_signed(Duration::weeks(1)),
            PlanInterval::Monthly => from.checked_add_months(Months::new(1)),
            PlanInterval::Quarterly => from.checked_add_months(Months::new(3)),
            PlanInterval::Yearly => from.checked_add_months(Months::new(12)),
        };
        next.ok_or_else(|| BillingError::validation("interval", "period end out of range"))
    }
}

/// Progressive billing trigger on cumulative period usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageThreshold {
    pub amount_cents: i64,
    #[serde(default)]
    pub recurring: bool,
    #[serde(default)]
    pub threshold_display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub organization_id: OrganizationId,
    pub code: String,
    pub name: String,
    pub interval: PlanInterval,
    pub amount_cents: i64,
    pub amount_currency: String,
    #[serde(default)]
    pub pay_in_advance: bool,
    #[serde(default)]
    pub minimum_commitment_cents: Option<i64>,
    #[serde(default)]
    pub usage_thresholds: Vec<UsageThreshold>,
    #[serde(default)]
    pub parent_id: Option<PlanId>,
    #[serde(default)]
    pub charges: Vec<Charge>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(
        organization_id: OrganizationId,
        code: impl Into<String>,
        interval: PlanInterval,
        amount_cents: i64,
        amount_currency: impl Into<String>,
    ) -> Self {
        let code = code.into();
        Self {
            id: PlanId::new(),
            organization_id,
            name: code.clone(),
            code,
            interval,
            amount_cents,
            amount_currency: amount_currency.into().to_uppercase(),
            pay_in_advance: false,
            minimum_commitment_cents: None,
            usage_thresholds: Vec::new(),
            parent_id: None,
            charges: Vec::new(),
            lifecycle: Lifecycle::Active,
            created_at: Utc::now(),
        }
    }

    pub fn active_charges(&self) -> impl Iterator<Item = &Charge> {
        self.charges.iter().filter(|c| c.is_active())
    }

    pub fn charge(&self, id: ChargeId) -> Option<&Charge> {
        self.charges.iter().find(|c| c.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.amount_cents < 0 {
            return Err(BillingError::validation(
                "amount_cents",
                "must not be negative",
            ));
        }
        if matches!(self.minimum_commitment_cents, Some(c) if c < 0) {
            return Err(BillingError::validation(
                "minimum_commitment_cents",
                "must not be negative",
            ));
        }
        if self.usage_thresholds.iter().any(|t| t.amount_cents <= 0) {
            return Err(BillingError::validation(
                "usage_thresholds",
                "threshold amounts must be positive",
            ));
        }
        if self.usage_thresholds.iter().filter(|t| t.recurring).count() > 1 {
            return Err(BillingError::validation(
                "usage_thresholds",
                "at most one recurring threshold is allowed",
            ));
        }
        for charge in &self.charges {
            if charge.plan_id != self.id {
                return Err(BillingError::validation(
                    "charges",
                    format!("charge {} belongs to another plan", charge.id),
                ));
            }
        }
        Ok(())
    }

    /// Highest threshold crossed when cumulative usage moves from
    /// `previous_cents` to `current_cents`, if any.
    pub fn crossed_threshold(&self, previous_cents: i64, current_cents: i64) -> Option<i64> {
        if current_cents <= previous_cents {
            return None;
        }

        let fixed_max = self
            .usage_thresholds
            .iter()
            .filter(|t| !t.recurring)
            .map(|t| t.amount_cents)
            .max()
            .unwrap_or(0);

        let mut crossed = self
            .usage_thresholds
            .iter()
            .filter(|t| !t.recurring)
            .map(|t| t.amount_cents)
            .filter(|amount| previous_cents < *amount && *amount <= current_cents)
            .max();

        if let Some(step) = self
            .usage_thresholds
            .iter()
            .find(|t| t.recurring)
            .map(|t| t.amount_cents)
        {
            if current_cents >= fixed_max + step {
                let steps = (current_cents - fixed_max) / step;
                let candidate = fixed_max + steps * step;
                if candidate > previous_cents {
                    crossed = Some(crossed.map_or(candidate, |c| c.max(candidate)));
                }
            }
        }

        crossed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub organization_id: OrganizationId,
    pub external_id: ExternalCustomerId,
    pub name: String,
    pub currency: String,
    /// Days a generated invoice stays in draft; zero finalizes immediately
    #[serde(default)]
    pub invoice_grace_period_days: u32,
    /// Tax codes applied to this customer's fees
    #[serde(default)]
    pub tax_codes: Vec<String>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

impl Customer {
    pub fn new(
        organization_id: OrganizationId,
        external_id: impl Into<String>,
        currency: impl Into<String>,
    ) -> Self {
        let external_id = external_id.into();
        Self {
            id: CustomerId::new(),
            organization_id,
            name: external_id.clone(),
            external_id: ExternalCustomerId::new(external_id),
            currency: currency.into().to_uppercase(),
            invoice_grace_period_days: 0,
            tax_codes: Vec::new(),
            lifecycle: Lifecycle::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Terminated,
    Canceled,
}

impl SubscriptionStatus {
    pub fn can_transition_to(&self, to: &SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, to),
            (Pending, Active) | (Pending, Canceled) | (Active, Terminated)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub organization_id: OrganizationId,
    pub external_id: ExternalSubscriptionId,
    pub customer_id: CustomerId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub terminated_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn new(
        organization_id: OrganizationId,
        external_id: impl Into<String>,
        customer_id: CustomerId,
        plan_id: PlanId,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            organization_id,
            external_id: ExternalSubscriptionId::new(external_id),
            customer_id,
            plan_id,
            status: SubscriptionStatus::Active,
            started_at,
            terminated_at: None,
        }
    }

    pub fn terminate(&mut self, at: DateTime<Utc>) -> Result<()> {
        let to = SubscriptionStatus::Terminated;
        if !self.status.can_transition_to(&to) {
            return Err(BillingError::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", to),
            });
        }
        self.status = to;
        self.terminated_at = Some(at);
        Ok(())
    }

    /// Billing bounds of a period, with the charges window narrowed to the
    /// time the subscription was actually live.
    pub fn bounds_for(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<BillingBounds> {
        let charges_from = self.started_at.max(from).min(to);
        let charges_to = self
            .terminated_at
            .map_or(to, |t| t.min(to))
            .max(charges_from);
        BillingBounds::with_charges_window(from, to, charges_from, charges_to)
    }
}
