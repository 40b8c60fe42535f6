use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::domain::aggregation::ChargeUsage;
use crate::domain::charges::Charge;
use crate::domain::coupons::{
    allocate_after_taxes, allocate_before_taxes, cap_credits, AppliedCoupon, Coupon, CouponCredit,
    FeeScope,
};
use crate::domain::currency::Currency;
use crate::domain::events::Event;
use crate::domain::fee_calculator::{FeeCalculator, UsageQuantity};
use crate::domain::fees::{Fee, FeeKind};
use crate::domain::filters::FilterMatch;
use crate::domain::invoices::{InvoiceTotals, InvoicingReason};
use crate::domain::plans::{Customer, Plan, Subscription};
use crate::domain::taxes::{apply_taxes, AppliedTax, TaxRateProvider};
use crate::domain::types::{BillingBounds, FeeId, InvoiceId};
use crate::error::Result;

/// What an invoice is being assembled for
#[derive(Debug, Clone, Copy)]
pub struct AssemblyContext<'a> {
    /// `None` for fees created ahead of any invoice (pay in advance)
    pub invoice_id: Option<InvoiceId>,
    pub subscription: &'a Subscription,
    pub plan: &'a Plan,
    pub customer: &'a Customer,
    pub currency: &'a Currency,
    pub bounds: BillingBounds,
}

/// Amounts of an invoice after coupons and taxes, before wallet credits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedInvoice {
    pub totals: InvoiceTotals,
    pub applied_taxes: Vec<AppliedTax>,
    pub coupon_credits: Vec<CouponCredit>,
}

/// Turns aggregated usage into fees and prices the fee set of an invoice
pub struct InvoiceAssembler {
    calculator: FeeCalculator,
    taxes: Arc<dyn TaxRateProvider>,
}

impl InvoiceAssembler {
    pub fn new(precision: u32, taxes: Arc<dyn TaxRateProvider>) -> Self {
        Self {
            calculator: FeeCalculator::new(precision),
            taxes,
        }
    }

    pub fn calculator(&self) -> &FeeCalculator {
        &self.calculator
    }

    fn new_fee(
        &self,
        ctx: &AssemblyContext<'_>,
        kind: FeeKind,
        units: Decimal,
        precise_unit_amount: Decimal,
        precise_amount_cents: Decimal,
        period: (chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>),
    ) -> Result<Fee> {
        let mut fee = Fee::new(
            ctx.subscription.organization_id,
            ctx.subscription.id,
            kind,
            ctx.currency.code.clone(),
            units,
            precise_unit_amount,
            precise_amount_cents,
            period,
        )?;
        fee.invoice_id = ctx.invoice_id;
        Ok(fee)
    }

    /// Fees of one charge for the context bounds, plus a true-up when the
    /// charge minimum is not reached
    pub fn charge_fees(
        &self,
        ctx: &AssemblyContext<'_>,
        charge: &Charge,
        usage: &ChargeUsage,
    ) -> Result<Vec<Fee>> {
        let period = (
            ctx.bounds.charges_from_datetime,
            ctx.bounds.charges_to_datetime,
        );
        let mut buckets: Vec<(FilterMatch, UsageQuantity)> = usage
            .buckets
            .iter()
            .map(|b| (b.bucket.clone(), b.usage))
            .collect();
        if buckets.is_empty() {
            buckets.push((FilterMatch::default_bucket(), UsageQuantity::default()));
        }

        let mut fees = Vec::with_capacity(buckets.len());
        for (bucket, quantity) in buckets {
            let amount = self.calculator.calculate(
                charge,
                bucket.charge_filter_id,
                &quantity,
                &ctx.bounds,
                ctx.currency,
            );
            let mut fee = self.new_fee(
                ctx,
                FeeKind::Charge {
                    charge_id: charge.id,
                    charge_filter_id: bucket.charge_filter_id,
                },
                amount.units,
                amount.precise_unit_amount,
                amount.precise_amount_cents,
                period,
            )?;
            fee.grouped_by = bucket.grouped_by;
            fee.events_count = quantity.events_count;
            fee.amount_details = amount.amount_details;
            fee.invoiceable = charge.invoiceable;
            fees.push(fee);
        }

        let charged: Decimal = fees.iter().map(|f| f.precise_amount_cents).sum();
        if let Some(shortfall) =
            self.calculator
                .true_up_precise_cents(charge, charged, &ctx.bounds)
        {
            let parent_fee_id = fees[0].id;
            debug!(
                "Charge {} below its minimum by {} cents, adding true-up",
                charge.id, shortfall
            );
            fees.push(self.new_fee(
                ctx,
                FeeKind::TrueUp {
                    charge_id: charge.id,
                    parent_fee_id,
                },
                Decimal::ONE,
                shortfall / ctx.currency.subunit_to_unit(),
                shortfall,
                period,
            )?);
        }

        Ok(fees)
    }

    /// Extra fees owed for an invoiced period whose usage grew afterwards.
    ///
    /// `billed` holds every charge and adjustment fee already issued for the
    /// charge on that period; only positive differences are billed.
    pub fn adjustment_fees(
        &self,
        ctx: &AssemblyContext<'_>,
        charge: &Charge,
        recomputed: &ChargeUsage,
        billed: &[Fee],
        original_invoice_id: InvoiceId,
    ) -> Result<Vec<Fee>> {
        let period = (
            ctx.bounds.charges_from_datetime,
            ctx.bounds.charges_to_datetime,
        );
        let mut fees = Vec::new();

        for bucket in &recomputed.buckets {
            let amount = self.calculator.calculate(
                charge,
                bucket.bucket.charge_filter_id,
                &bucket.usage,
                &ctx.bounds,
                ctx.currency,
            );
            let previous: Vec<&Fee> = billed
                .iter()
                .filter(|f| f.charge_id() == Some(charge.id))
                .filter(|f| matches!(f.kind, FeeKind::Charge { .. } | FeeKind::Adjustment { .. }))
                .filter(|f| {
                    f.charge_filter_id() == bucket.bucket.charge_filter_id
                        && f.grouped_by == bucket.bucket.grouped_by
                })
                .collect();
            let billed_cents: Decimal = previous.iter().map(|f| f.precise_amount_cents).sum();
            let billed_units: Decimal = previous.iter().map(|f| f.units).sum();

            let delta = amount.precise_amount_cents - billed_cents;
            if delta <= Decimal::ZERO {
                continue;
            }
            let units = (amount.units - billed_units).max(Decimal::ZERO);
            let unit_amount = if units.is_zero() {
                Decimal::ZERO
            } else {
                delta / ctx.currency.subunit_to_unit() / units
            };

            let mut fee = self.new_fee(
                ctx,
                FeeKind::Adjustment {
                    charge_id: charge.id,
                    charge_filter_id: bucket.bucket.charge_filter_id,
                    original_invoice_id,
                },
                units,
                unit_amount,
                delta,
                period,
            )?;
            fee.grouped_by = bucket.bucket.grouped_by.clone();
            fee.events_count = bucket
                .usage
                .events_count
                .saturating_sub(previous.iter().map(|f| f.events_count).sum());
            fees.push(fee);
        }

        Ok(fees)
    }

    /// Plan fee billed by an invoice of the given reason, if any.
    ///
    /// Advance plans bill the first period on `subscription_starting` and the
    /// following period on every periodic invoice; arrears plans bill the
    /// elapsed share of the period on periodic and terminating invoices.
    pub fn subscription_fee(
        &self,
        ctx: &AssemblyContext<'_>,
        reason: InvoicingReason,
    ) -> Result<Option<Fee>> {
        let plan = ctx.plan;
        if plan.amount_cents <= 0 {
            return Ok(None);
        }

        let bounds = match (plan.pay_in_advance, reason) {
            (true, InvoicingReason::SubscriptionStarting) => ctx.bounds,
            (true, InvoicingReason::SubscriptionPeriodic) => {
                if ctx.subscription.terminated_at.is_some() {
                    return Ok(None);
                }
                let from = ctx.bounds.to_datetime;
                let to = plan.interval.advance(from)?;
                ctx.subscription.bounds_for(from, to)?
            }
            (false, InvoicingReason::SubscriptionPeriodic)
            | (false, InvoicingReason::SubscriptionTerminating) => ctx.bounds,
            _ => return Ok(None),
        };

        let factor = bounds.proration_factor();
        let precise_cents = (Decimal::from(plan.amount_cents) * factor).round_dp(12);
        let fee = self.new_fee(
            ctx,
            FeeKind::Subscription { plan_id: plan.id },
            Decimal::ONE,
            precise_cents / ctx.currency.subunit_to_unit(),
            precise_cents,
            (bounds.from_datetime, bounds.to_datetime),
        )?;
        Ok(Some(fee))
    }

    /// Shortfall up to the plan's prorated minimum commitment
    pub fn commitment_fee(
        &self,
        ctx: &AssemblyContext<'_>,
        billed_precise_cents: Decimal,
    ) -> Result<Option<Fee>> {
        let Some(minimum) = ctx.plan.minimum_commitment_cents.filter(|m| *m > 0) else {
            return Ok(None);
        };
        let committed = Decimal::from(minimum) * ctx.bounds.proration_factor();
        let shortfall = (committed - billed_precise_cents).round_dp(12);
        if shortfall <= Decimal::ZERO {
            return Ok(None);
        }
        let fee = self.new_fee(
            ctx,
            FeeKind::Commitment {
                plan_id: ctx.plan.id,
            },
            Decimal::ONE,
            shortfall / ctx.currency.subunit_to_unit(),
            shortfall,
            (ctx.bounds.from_datetime, ctx.bounds.to_datetime),
        )?;
        Ok(Some(fee))
    }

    /// Pay-in-advance fee for the usage change caused by one event
    pub fn in_advance_fee(
        &self,
        ctx: &AssemblyContext<'_>,
        charge: &Charge,
        bucket: &FilterMatch,
        before: &UsageQuantity,
        after: &UsageQuantity,
        event: &Event,
    ) -> Result<Option<Fee>> {
        let amount = self.calculator.in_advance_delta(
            charge,
            bucket.charge_filter_id,
            before,
            after,
            ctx.currency,
        );
        if amount.precise_amount_cents <= Decimal::ZERO {
            return Ok(None);
        }
        let mut fee = self.new_fee(
            ctx,
            FeeKind::Charge {
                charge_id: charge.id,
                charge_filter_id: bucket.charge_filter_id,
            },
            amount.units,
            amount.precise_unit_amount,
            amount.precise_amount_cents,
            (
                ctx.bounds.charges_from_datetime,
                ctx.bounds.charges_to_datetime,
            ),
        )?;
        fee.grouped_by = bucket.grouped_by.clone();
        fee.events_count = 1;
        fee.pay_in_advance = true;
        fee.invoiceable = charge.invoiceable;
        fee.pay_in_advance_transaction_id = Some(event.transaction_id.clone());
        Ok(Some(fee))
    }

    fn fee_scopes(&self, plan: &Plan, fees: &[Fee]) -> HashMap<FeeId, FeeScope> {
        fees.iter()
            .map(|fee| {
                let billable_metric_id = fee
                    .charge_id()
                    .and_then(|id| plan.charge(id))
                    .map(|charge| charge.billable_metric_id);
                (
                    fee.id,
                    FeeScope {
                        plan_id: plan.id,
                        billable_metric_id,
                    },
                )
            })
            .collect()
    }

    /// Applies coupons and taxes to the fee set and computes the invoice
    /// totals. `progressive_credit_cents` is what progressive invoices of the
    /// same period already billed.
    pub async fn price(
        &self,
        ctx: &AssemblyContext<'_>,
        fees: &mut [Fee],
        coupons: &[(AppliedCoupon, Coupon)],
        progressive_credit_cents: i64,
    ) -> Result<PricedInvoice> {
        let scopes = self.fee_scopes(ctx.plan, fees);
        let mut coupon_credits = allocate_before_taxes(coupons, fees, &scopes)?;

        let rates = if ctx.customer.tax_codes.is_empty() {
            Vec::new()
        } else {
            self.taxes
                .rates_for(
                    ctx.subscription.organization_id,
                    ctx.customer.tax_codes.clone(),
                )
                .await?
        };
        let applied_taxes = apply_taxes(fees, &rates)?;

        coupon_credits.extend(allocate_after_taxes(coupons, fees, &scopes)?);

        let fees_amount_cents: i64 = fees.iter().map(|f| f.amount_cents).sum();
        let taxes_amount_cents: i64 = applied_taxes.iter().map(|t| t.amount_cents).sum();
        let coupons_amount_cents =
            cap_credits(&mut coupon_credits, fees_amount_cents + taxes_amount_cents);

        let mut totals = InvoiceTotals {
            fees_amount_cents,
            coupons_amount_cents,
            taxes_amount_cents,
            ..InvoiceTotals::default()
        };
        totals.progressive_billing_credit_amount_cents = progressive_credit_cents
            .max(0)
            .min(totals.amount_before_credits().max(0));
        totals.recompute_total();

        Ok(PricedInvoice {
            totals,
            applied_taxes,
            coupon_credits,
        })
    }

    /// Deducts prepaid credits, which never exceed what is still due
    pub fn apply_prepaid_credits(totals: &mut InvoiceTotals, credit_cents: i64) -> i64 {
        let applied = credit_cents.max(0).min(totals.total_amount_cents.max(0));
        totals.prepaid_credit_amount_cents += applied;
        totals.recompute_total();
        applied
    }
}

/// Total precise cents of fees, used to compare against commitments
pub fn precise_total(fees: &[Fee]) -> Decimal {
    fees.iter().map(|f| f.precise_amount_cents).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregation::BucketUsage;
    use crate::domain::charges::ChargeModel;
    use crate::domain::coupons::{CouponFrequency, CouponKind};
    use crate::domain::plans::PlanInterval;
    use crate::domain::taxes::{StaticTaxRates, TaxRate};
    use crate::domain::types::{BillableMetricId, OrganizationId};
    use crate::error::BillingError;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use mockall::mock;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    mock! {
        Taxes {}

        #[async_trait]
        impl TaxRateProvider for Taxes {
            async fn rates_for(
                &self,
                organization_id: OrganizationId,
                tax_codes: Vec<String>,
            ) -> Result<Vec<TaxRate>>;
        }
    }

    struct Catalog {
        plan: Plan,
        customer: Customer,
        subscription: Subscription,
        currency: Currency,
    }

    impl Catalog {
        fn new(plan_amount_cents: i64, pay_in_advance: bool) -> Self {
            let org = OrganizationId::new();
            let mut plan = Plan::new(org, "pro", PlanInterval::Monthly, plan_amount_cents, "usd");
            plan.pay_in_advance = pay_in_advance;
            let customer = Customer::new(org, "cust_1", "usd");
            let subscription = Subscription::new(org, "sub_1", customer.id, plan.id, day(1));
            Self {
                plan,
                customer,
                subscription,
                currency: Currency::new("USD", 2),
            }
        }

        fn ctx(&self, bounds: BillingBounds) -> AssemblyContext<'_> {
            AssemblyContext {
                invoice_id: Some(InvoiceId::new()),
                subscription: &self.subscription,
                plan: &self.plan,
                customer: &self.customer,
                currency: &self.currency,
                bounds,
            }
        }
    }

    fn day(d: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, d, 0, 0, 0).unwrap()
    }

    fn april() -> BillingBounds {
        BillingBounds::new(day(1), Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()).unwrap()
    }

    fn usage(charge: &Charge, value: Decimal) -> ChargeUsage {
        ChargeUsage {
            charge_id: charge.id,
            period_from: day(1),
            buckets: vec![BucketUsage {
                bucket: FilterMatch::default_bucket(),
                current_aggregation: value,
                max_aggregation: value,
                usage: UsageQuantity::new(value, 1),
            }],
            stale: false,
        }
    }

    fn standard(catalog: &Catalog, amount: Decimal) -> Charge {
        Charge::new(
            catalog.plan.organization_id,
            catalog.plan.id,
            BillableMetricId::new(),
            ChargeModel::Standard { amount },
        )
    }

    fn assembler() -> InvoiceAssembler {
        InvoiceAssembler::new(12, Arc::new(StaticTaxRates::new().with_rate("vat", "VAT", dec!(20))))
    }

    #[test]
    fn test_charge_fee_with_minimum_true_up() {
        let catalog = Catalog::new(0, false);
        let charge = standard(&catalog, dec!(2)).with_min_amount_cents(5_000);
        let ctx = catalog.ctx(april());

        let fees = assembler().charge_fees(&ctx, &charge, &usage(&charge, dec!(10))).unwrap();
        assert_eq!(fees.len(), 2);
        assert_eq!(fees[0].amount_cents, 2_000);
        assert_eq!(fees[1].amount_cents, 3_000);
        assert_eq!(fees[1].true_up_parent_fee_id(), Some(fees[0].id));
    }

    #[test]
    fn test_charge_without_usage_bills_zero_fee() {
        let catalog = Catalog::new(0, false);
        let charge = standard(&catalog, dec!(2));
        let empty = ChargeUsage {
            charge_id: charge.id,
            period_from: day(1),
            buckets: Vec::new(),
            stale: false,
        };
        let fees = assembler().charge_fees(&catalog.ctx(april()), &charge, &empty).unwrap();
        assert_eq!(fees.len(), 1);
        assert_eq!(fees[0].amount_cents, 0);
    }

    #[test]
    fn test_subscription_fee_advance_and_arrears() {
        let assembler = assembler();

        let advance = Catalog::new(3_000, true);
        let starting = assembler
            .subscription_fee(&advance.ctx(april()), InvoicingReason::SubscriptionStarting)
            .unwrap()
            .unwrap();
        assert_eq!(starting.amount_cents, 3_000);
        let periodic = assembler
            .subscription_fee(&advance.ctx(april()), InvoicingReason::SubscriptionPeriodic)
            .unwrap()
            .unwrap();
        assert_eq!(periodic.properties_from, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());

        let mut arrears = Catalog::new(3_000, false);
        arrears.subscription.started_at = day(21);
        let bounds = arrears.subscription.bounds_for(april().from_datetime, april().to_datetime).unwrap();
        let fee = assembler
            .subscription_fee(&arrears.ctx(bounds), InvoicingReason::SubscriptionPeriodic)
            .unwrap()
            .unwrap();
        assert_eq!(fee.amount_cents, 1_000);
        assert!(assembler
            .subscription_fee(&arrears.ctx(bounds), InvoicingReason::SubscriptionStarting)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_commitment_covers_shortfall_only() {
        let mut catalog = Catalog::new(0, false);
        catalog.plan.minimum_commitment_cents = Some(10_000);
        let assembler = assembler();
        let ctx = catalog.ctx(april());

        let fee = assembler.commitment_fee(&ctx, dec!(7_500)).unwrap().unwrap();
        assert_eq!(fee.amount_cents, 2_500);
        assert!(assembler.commitment_fee(&ctx, dec!(12_000)).unwrap().is_none());
    }

    #[test]
    fn test_adjustment_bills_only_the_difference() {
        let catalog = Catalog::new(0, false);
        let charge = standard(&catalog, dec!(1));
        let assembler = assembler();
        let ctx = catalog.ctx(april());
        let original = InvoiceId::new();

        let billed = assembler.charge_fees(&ctx, &charge, &usage(&charge, dec!(10))).unwrap();
        let fees = assembler
            .adjustment_fees(&ctx, &charge, &usage(&charge, dec!(14)), &billed, original)
            .unwrap();
        assert_eq!(fees.len(), 1);
        assert_eq!(fees[0].amount_cents, 400);
        assert_eq!(fees[0].units, dec!(4));

        let mut all = billed.clone();
        all.extend(fees);
        assert!(assembler
            .adjustment_fees(&ctx, &charge, &usage(&charge, dec!(14)), &all, original)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_price_applies_coupons_then_taxes() {
        let mut catalog = Catalog::new(0, false);
        catalog.customer.tax_codes = vec!["vat".to_string()];
        let charge = standard(&catalog, dec!(1));
        let assembler = assembler();
        let ctx = catalog.ctx(april());

        let mut fees = assembler.charge_fees(&ctx, &charge, &usage(&charge, dec!(100))).unwrap();
        let coupon = Coupon::new(
            catalog.plan.organization_id,
            "WELCOME",
            CouponKind::FixedAmount { amount_cents: 1_000 },
            CouponFrequency::Once,
        );
        let applied = AppliedCoupon::new(&coupon, catalog.customer.id);

        let priced = assembler
            .price(&ctx, &mut fees, &[(applied, coupon)], 2_000)
            .await
            .unwrap();
        assert_eq!(priced.totals.fees_amount_cents, 10_000);
        assert_eq!(priced.totals.coupons_amount_cents, 1_000);
        assert_eq!(priced.totals.taxes_amount_cents, 1_800);
        assert_eq!(priced.totals.progressive_billing_credit_amount_cents, 2_000);
        assert_eq!(priced.totals.total_amount_cents, 8_800);
        assert!(priced.totals.is_balanced());

        let mut totals = priced.totals;
        assert_eq!(InvoiceAssembler::apply_prepaid_credits(&mut totals, 50_000), 8_800);
        assert_eq!(totals.total_amount_cents, 0);
        assert!(totals.is_balanced());
    }

    #[tokio::test]
    async fn test_tax_provider_failure_propagates() {
        let mut catalog = Catalog::new(0, false);
        catalog.customer.tax_codes = vec!["vat".to_string()];
        let charge = standard(&catalog, dec!(1));

        let mut taxes = MockTaxes::new();
        taxes.expect_rates_for().times(1).returning(|_, _| {
            Err(BillingError::TaxProviderError {
                message: "rate service unavailable".to_string(),
            })
        });
        let assembler = InvoiceAssembler::new(12, Arc::new(taxes));
        let ctx = catalog.ctx(april());
        let mut fees = assembler.charge_fees(&ctx, &charge, &usage(&charge, dec!(5))).unwrap();

        assert!(matches!(
            assembler.price(&ctx, &mut fees, &[], 0).await,
            Err(BillingError::TaxProviderError { .. })
        ));
    }

    #[tokio::test]
    async fn test_customer_without_tax_codes_skips_provider() {
        let catalog = Catalog::new(0, false);
        let charge = standard(&catalog, dec!(1));
        let mut taxes = MockTaxes::new();
        taxes.expect_rates_for().never();
        let assembler = InvoiceAssembler::new(12, Arc::new(taxes));
        let ctx = catalog.ctx(april());
        let mut fees = assembler.charge_fees(&ctx, &charge, &usage(&charge, dec!(5))).unwrap();

        let priced = assembler.price(&ctx, &mut fees, &[], 0).await.unwrap();
        assert_eq!(priced.totals.total_amount_cents, 500);
        assert!(priced.applied_taxes.is_empty());
    }
}
