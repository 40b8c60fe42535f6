use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::currency::round_cents;
use crate::domain::fees::Fee;
use crate::domain::types::{
    AppliedCouponId, BillableMetricId, CouponId, CustomerId, FeeId, Lifecycle, OrganizationId,
    PlanId,
};
use crate::error::{BillingError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouponKind {
    FixedAmount { amount_cents: i64 },
    /// Rate in percent
    Percentage { rate: Decimal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frequency", rename_all = "snake_case")]
pub enum CouponFrequency {
    Once,
    Recurring { periods: u32 },
    Forever,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum CouponLimitation {
    None,
    Plans { plan_ids: Vec<PlanId> },
    BillableMetrics { billable_metric_ids: Vec<BillableMetricId> },
}

impl Default for CouponLimitation {
    fn default() -> Self {
        CouponLimitation::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: CouponId,
    pub organization_id: OrganizationId,
    pub code: String,
    pub kind: CouponKind,
    pub frequency: CouponFrequency,
    #[serde(default = "default_before_taxes")]
    pub before_taxes: bool,
    /// Lower numbers apply first
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub limitation: CouponLimitation,
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

fn default_before_taxes() -> bool {
    true
}

impl Coupon {
    pub fn new(
        organization_id: OrganizationId,
        code: impl Into<String>,
        kind: CouponKind,
        frequency: CouponFrequency,
    ) -> Self {
        Self {
            id: CouponId::new(),
            organization_id,
            code: code.into(),
            kind,
            frequency,
            before_taxes: true,
            priority: 0,
            limitation: CouponLimitation::None,
            lifecycle: Lifecycle::Active,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match &self.kind {
            CouponKind::FixedAmount { amount_cents } if *amount_cents <= 0 => {
                return Err(BillingError::validation("amount_cents", "must be positive"))
            }
            CouponKind::Percentage { rate } if *rate <= Decimal::ZERO || *rate > Decimal::ONE_HUNDRED => {
                return Err(BillingError::validation(
                    "rate",
                    "must be within (0, 100]",
                ))
            }
            _ => {}
        }
        if matches!(self.frequency, CouponFrequency::Recurring { periods: 0 }) {
            return Err(BillingError::validation(
                "frequency",
                "recurring coupons need at least one period",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedCouponStatus {
    Active,
    Terminated,
}

/// A coupon attached to a customer, with its consumption state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedCoupon {
    pub id: AppliedCouponId,
    pub coupon_id: CouponId,
    pub customer_id: CustomerId,
    pub status: AppliedCouponStatus,
    /// Unused part of a fixed-amount coupon
    pub amount_cents_remaining: Option<i64>,
    /// Billing periods left for recurring coupons
    pub periods_remaining: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl AppliedCoupon {
    pub fn new(coupon: &Coupon, customer_id: CustomerId) -> Self {
        Self {
            id: AppliedCouponId::new(),
            coupon_id: coupon.id,
            customer_id,
            status: AppliedCouponStatus::Active,
            amount_cents_remaining: match (&coupon.kind, coupon.frequency) {
                (CouponKind::FixedAmount { amount_cents }, CouponFrequency::Once) => {
                    Some(*amount_cents)
                }
                _ => None,
            },
            periods_remaining: match coupon.frequency {
                CouponFrequency::Recurring { periods } => Some(periods),
                _ => None,
            },
            created_at: Utc::now(),
            terminated_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AppliedCouponStatus::Active
    }

    /// Amount available for one invoice, in cents, for fixed-amount coupons
    fn available_cents(&self, coupon: &Coupon) -> Option<i64> {
        match &coupon.kind {
            CouponKind::FixedAmount { amount_cents } => {
                Some(self.amount_cents_remaining.unwrap_or(*amount_cents))
            }
            CouponKind::Percentage { .. } => None,
        }
    }

    /// Records usage on a finalized invoice
    pub fn consume(&mut self, coupon: &Coupon, used_cents: i64, at: DateTime<Utc>) {
        if !self.is_active() {
            return;
        }
        match coupon.frequency {
            CouponFrequency::Once => match coupon.kind {
                CouponKind::FixedAmount { .. } => {
                    let remaining = self.amount_cents_remaining.unwrap_or(0) - used_cents;
                    self.amount_cents_remaining = Some(remaining.max(0));
                    if remaining <= 0 {
                        self.terminate(at);
                    }
                }
                CouponKind::Percentage { .. } => self.terminate(at),
            },
            CouponFrequency::Recurring { .. } => {
                let left = self.periods_remaining.unwrap_or(0).saturating_sub(1);
                self.periods_remaining = Some(left);
                if left == 0 {
                    self.terminate(at);
                }
            }
            CouponFrequency::Forever => {}
        }
    }

    fn terminate(&mut self, at: DateTime<Utc>) {
        self.status = AppliedCouponStatus::Terminated;
        self.terminated_at = Some(at);
    }
}

/// Plan and metric a fee belongs to, used for coupon limitations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeScope {
    pub plan_id: PlanId,
    pub billable_metric_id: Option<BillableMetricId>,
}

/// Credit granted by one applied coupon on one invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponCredit {
    pub applied_coupon_id: AppliedCouponId,
    pub coupon_id: CouponId,
    pub coupon_code: String,
    pub before_taxes: bool,
    pub precise_amount_cents: Decimal,
    pub amount_cents: i64,
}

fn eligible(limitation: &CouponLimitation, scope: Option<&FeeScope>) -> bool {
    match (limitation, scope) {
        (CouponLimitation::None, _) => true,
        (_, None) => false,
        (CouponLimitation::Plans { plan_ids }, Some(scope)) => plan_ids.contains(&scope.plan_id),
        (CouponLimitation::BillableMetrics { billable_metric_ids }, Some(scope)) => scope
            .billable_metric_id
            .map(|id| billable_metric_ids.contains(&id))
            .unwrap_or(false),
    }
}

fn coupon_amount(applied: &AppliedCoupon, coupon: &Coupon, base: Decimal) -> Decimal {
    let amount = match &coupon.kind {
        CouponKind::FixedAmount { .. } => {
            Decimal::from(applied.available_cents(coupon).unwrap_or(0).max(0))
        }
        CouponKind::Percentage { rate } => base * rate / Decimal::ONE_HUNDRED,
    };
    amount.min(base)
}

/// Applies before-tax coupons in priority order, spreading each credit over
/// the eligible fees in proportion to their remaining amount.
pub fn allocate_before_taxes(
    coupons: &[(AppliedCoupon, Coupon)],
    fees: &mut [Fee],
    scopes: &HashMap<FeeId, FeeScope>,
) -> Result<Vec<CouponCredit>> {
    let mut credits = Vec::new();

    for (applied, coupon) in ordered(coupons).into_iter().filter(|(_, c)| c.before_taxes) {
        let eligible_ids: Vec<usize> = fees
            .iter()
            .enumerate()
            .filter(|(_, fee)| eligible(&coupon.limitation, scopes.get(&fee.id)))
            .map(|(index, _)| index)
            .collect();
        let base: Decimal = eligible_ids
            .iter()
            .map(|i| fees[*i].taxable_precise_cents())
            .sum();
        if base <= Decimal::ZERO {
            continue;
        }

        let amount = coupon_amount(applied, coupon, base);
        if amount <= Decimal::ZERO {
            continue;
        }

        let mut allocated = Decimal::ZERO;
        for (position, index) in eligible_ids.iter().enumerate() {
            let fee = &mut fees[*index];
            let share = if position == eligible_ids.len() - 1 {
                amount - allocated
            } else {
                amount * fee.taxable_precise_cents() / base
            };
            let share = share.min(fee.taxable_precise_cents());
            fee.precise_coupons_amount_cents += share;
            allocated += share;
        }

        credits.push(CouponCredit {
            applied_coupon_id: applied.id,
            coupon_id: coupon.id,
            coupon_code: coupon.code.clone(),
            before_taxes: true,
            precise_amount_cents: allocated,
            amount_cents: round_cents(allocated)?,
        });
    }

    Ok(credits)
}

/// Applies after-tax coupons against the taxed amount of eligible fees
pub fn allocate_after_taxes(
    coupons: &[(AppliedCoupon, Coupon)],
    fees: &[Fee],
    scopes: &HashMap<FeeId, FeeScope>,
) -> Result<Vec<CouponCredit>> {
    let mut credits = Vec::new();
    let mut remaining: HashMap<FeeId, Decimal> = fees
        .iter()
        .map(|fee| {
            (
                fee.id,
                fee.taxable_precise_cents() + fee.taxes_precise_amount_cents,
            )
        })
        .collect();

    for (applied, coupon) in ordered(coupons).into_iter().filter(|(_, c)| !c.before_taxes) {
        let eligible_fees: Vec<FeeId> = fees
            .iter()
            .filter(|fee| eligible(&coupon.limitation, scopes.get(&fee.id)))
            .map(|fee| fee.id)
            .collect();
        let base: Decimal = eligible_fees.iter().filter_map(|id| remaining.get(id)).sum();
        if base <= Decimal::ZERO {
            continue;
        }

        let amount = coupon_amount(applied, coupon, base);
        if amount <= Decimal::ZERO {
            continue;
        }
        for id in &eligible_fees {
            if let Some(left) = remaining.get_mut(id) {
                *left -= amount * *left / base;
            }
        }

        credits.push(CouponCredit {
            applied_coupon_id: applied.id,
            coupon_id: coupon.id,
            coupon_code: coupon.code.clone(),
            before_taxes: false,
            precise_amount_cents: amount,
            amount_cents: round_cents(amount)?,
        });
    }

    Ok(credits)
}

/// Trims the latest credits first so the total never exceeds
/// `limit_cents`; returns the credited total
pub fn cap_credits(credits: &mut Vec<CouponCredit>, limit_cents: i64) -> i64 {
    let mut left = limit_cents.max(0);
    for credit in credits.iter_mut() {
        if credit.amount_cents > left {
            credit.amount_cents = left;
            credit.precise_amount_cents = credit.precise_amount_cents.min(Decimal::from(left));
        }
        left -= credit.amount_cents;
    }
    credits.retain(|c| c.amount_cents > 0);
    credits.iter().map(|c| c.amount_cents).sum()
}

fn ordered(coupons: &[(AppliedCoupon, Coupon)]) -> Vec<&(AppliedCoupon, Coupon)> {
    let mut ordered: Vec<_> = coupons
        .iter()
        .filter(|(applied, coupon)| applied.is_active() && coupon.lifecycle.is_active())
        .collect();
    ordered.sort_by_key(|(applied, coupon)| (coupon.priority, applied.created_at));
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fees::FeeKind;
    use crate::domain::types::{ChargeId, SubscriptionId};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn fee(cents: Decimal) -> Fee {
        let now = Utc::now();
        Fee::new(
            OrganizationId::new(),
            SubscriptionId::new(),
            FeeKind::Charge {
                charge_id: ChargeId::new(),
                charge_filter_id: None,
            },
            "USD",
            dec!(1),
            cents / dec!(100),
            cents,
            (now, now),
        )
        .unwrap()
    }

    fn applied(coupon: &Coupon) -> (AppliedCoupon, Coupon) {
        (AppliedCoupon::new(coupon, CustomerId::new()), coupon.clone())
    }

    #[test]
    fn test_fixed_coupon_spread_proportionally() {
        let org = OrganizationId::new();
        let coupon = Coupon::new(
            org,
            "TEN",
            CouponKind::FixedAmount { amount_cents: 1_000 },
            CouponFrequency::Once,
        );
        let mut fees = vec![fee(dec!(3000)), fee(dec!(1000))];
        let credits =
            allocate_before_taxes(&[applied(&coupon)], &mut fees, &HashMap::new()).unwrap();

        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].amount_cents, 1_000);
        assert_eq!(fees[0].precise_coupons_amount_cents, dec!(750));
        assert_eq!(fees[1].precise_coupons_amount_cents, dec!(250));
    }

    #[test]
    fn test_coupon_capped_at_fee_total_and_priority_order() {
        let org = OrganizationId::new();
        let mut big = Coupon::new(
            org,
            "BIG",
            CouponKind::FixedAmount { amount_cents: 5_000 },
            CouponFrequency::Forever,
        );
        big.priority = 2;
        let mut half = Coupon::new(
            org,
            "HALF",
            CouponKind::Percentage { rate: dec!(50) },
            CouponFrequency::Forever,
        );
        half.priority = 1;

        let mut fees = vec![fee(dec!(2000))];
        let credits =
            allocate_before_taxes(&[applied(&big), applied(&half)], &mut fees, &HashMap::new())
                .unwrap();

        assert_eq!(credits[0].coupon_code, "HALF");
        assert_eq!(credits[0].amount_cents, 1_000);
        assert_eq!(credits[1].amount_cents, 1_000);
        assert_eq!(fees[0].taxable_precise_cents(), Decimal::ZERO);
    }

    #[test]
    fn test_cap_credits_trims_latest_first() {
        let org = OrganizationId::new();
        let credit = |code: &str, cents: i64| {
            let coupon = Coupon::new(
                org,
                code,
                CouponKind::FixedAmount { amount_cents: cents },
                CouponFrequency::Once,
            );
            CouponCredit {
                applied_coupon_id: AppliedCoupon::new(&coupon, CustomerId::new()).id,
                coupon_id: coupon.id,
                coupon_code: coupon.code,
                before_taxes: false,
                precise_amount_cents: Decimal::from(cents),
                amount_cents: cents,
            }
        };
        let mut credits = vec![credit("A", 700), credit("B", 500), credit("C", 200)];

        assert_eq!(cap_credits(&mut credits, 1_000), 1_000);
        assert_eq!(credits.len(), 2);
        assert_eq!(credits[0].amount_cents, 700);
        assert_eq!(credits[1].amount_cents, 300);
        assert_eq!(credits[1].precise_amount_cents, dec!(300));
    }

    #[test]
    fn test_limitation_to_plans() {
        let org = OrganizationId::new();
        let plan = PlanId::new();
        let mut coupon = Coupon::new(
            org,
            "PLAN",
            CouponKind::Percentage { rate: dec!(10) },
            CouponFrequency::Forever,
        );
        coupon.limitation = CouponLimitation::Plans {
            plan_ids: vec![plan],
        };

        let mut fees = vec![fee(dec!(1000)), fee(dec!(1000))];
        let mut scopes = HashMap::new();
        scopes.insert(
            fees[0].id,
            FeeScope {
                plan_id: plan,
                billable_metric_id: None,
            },
        );
        scopes.insert(
            fees[1].id,
            FeeScope {
                plan_id: PlanId::new(),
                billable_metric_id: None,
            },
        );

        allocate_before_taxes(&[applied(&coupon)], &mut fees, &scopes).unwrap();
        assert_eq!(fees[0].precise_coupons_amount_cents, dec!(100));
        assert_eq!(fees[1].precise_coupons_amount_cents, Decimal::ZERO);
    }

    #[test]
    fn test_after_tax_coupon_uses_taxed_amount() {
        let org = OrganizationId::new();
        let mut coupon = Coupon::new(
            org,
            "AFTER",
            CouponKind::Percentage { rate: dec!(10) },
            CouponFrequency::Forever,
        );
        coupon.before_taxes = false;
        let mut taxed = fee(dec!(1000));
        taxed.taxes_precise_amount_cents = dec!(200);

        let credits = allocate_after_taxes(&[applied(&coupon)], &[taxed], &HashMap::new()).unwrap();
        assert_eq!(credits[0].amount_cents, 120);
    }

    #[test]
    fn test_consumption_states() {
        let org = OrganizationId::new();
        let once = Coupon::new(
            org,
            "ONCE",
            CouponKind::FixedAmount { amount_cents: 1_000 },
            CouponFrequency::Once,
        );
        let mut applied_once = AppliedCoupon::new(&once, CustomerId::new());
        applied_once.consume(&once, 400, Utc::now());
        assert_eq!(applied_once.amount_cents_remaining, Some(600));
        assert!(applied_once.is_active());
        applied_once.consume(&once, 600, Utc::now());
        assert!(!applied_once.is_active());

        let recurring = Coupon::new(
            org,
            "TWO",
            CouponKind::Percentage { rate: dec!(5) },
            CouponFrequency::Recurring { periods: 2 },
        );
        let mut applied_recurring = AppliedCoupon::new(&recurring, CustomerId::new());
        let now = Utc::now();
        applied_recurring.consume(&recurring, 10, now);
        applied_recurring.consume(&recurring, 10, now + Duration::days(30));
        assert_eq!(applied_recurring.status, AppliedCouponStatus::Terminated);
    }

    #[test]
    fn test_coupon_validation() {
        let org = OrganizationId::new();
        let bad = Coupon::new(
            org,
            "BAD",
            CouponKind::Percentage { rate: dec!(150) },
            CouponFrequency::Forever,
        );
        assert!(bad.validate().is_err());
    }
}
