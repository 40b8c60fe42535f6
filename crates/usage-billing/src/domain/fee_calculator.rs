use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::charges::{Charge, ChargeModel, PercentageRange, PricingRange};
use crate::domain::currency::Currency;
use crate::domain::fees::RangeDetail;
use crate::domain::types::{BillingBounds, ChargeFilterId};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Aggregated usage handed to the calculator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageQuantity {
    pub value: Decimal,
    /// Time-weighted value for aggregations that prorate on their own
    pub prorated_value: Option<Decimal>,
    pub events_count: u64,
}

impl UsageQuantity {
    pub fn new(value: Decimal, events_count: u64) -> Self {
        Self {
            value,
            prorated_value: None,
            events_count,
        }
    }
}

/// Raw model output in major units, before proration
#[derive(Debug, Clone, PartialEq)]
pub struct ModelAmount {
    pub amount: Decimal,
    pub details: Vec<RangeDetail>,
}

/// Priced usage for one fee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeAmount {
    pub units: Decimal,
    pub precise_unit_amount: Decimal,
    pub precise_amount_cents: Decimal,
    pub amount_details: Vec<RangeDetail>,
}

impl ChargeAmount {
    pub fn zero() -> Self {
        Self {
            units: Decimal::ZERO,
            precise_unit_amount: Decimal::ZERO,
            precise_amount_cents: Decimal::ZERO,
            amount_details: Vec::new(),
        }
    }
}

fn units_in_range(value: Decimal, from: Decimal, to: Option<Decimal>) -> Decimal {
    if value <= from {
        return Decimal::ZERO;
    }
    let upper = to.map_or(value, |to| value.min(to));
    upper - from
}

fn graduated(ranges: &[PricingRange], value: Decimal) -> ModelAmount {
    let mut amount = Decimal::ZERO;
    let mut details = Vec::new();
    for range in ranges {
        let units = units_in_range(value, range.from_value, range.to_value);
        if units.is_zero() {
            break;
        }
        let range_amount = range.flat_amount + range.per_unit_amount * units;
        amount += range_amount;
        details.push(RangeDetail {
            from_value: range.from_value,
            to_value: range.to_value,
            units,
            per_unit_amount: Some(range.per_unit_amount),
            rate: None,
            flat_amount: range.flat_amount,
            amount: range_amount,
        });
    }
    ModelAmount { amount, details }
}

fn volume(ranges: &[PricingRange], value: Decimal) -> ModelAmount {
    if value <= Decimal::ZERO {
        return ModelAmount {
            amount: Decimal::ZERO,
            details: Vec::new(),
        };
    }
    let range = ranges
        .iter()
        .find(|r| value >= r.from_value && r.to_value.map_or(true, |to| value <= to))
        .or_else(|| ranges.last());
    match range {
        Some(range) => {
            let amount = range.flat_amount + range.per_unit_amount * value;
            ModelAmount {
                amount,
                details: vec![RangeDetail {
                    from_value: range.from_value,
                    to_value: range.to_value,
                    units: value,
                    per_unit_amount: Some(range.per_unit_amount),
                    rate: None,
                    flat_amount: range.flat_amount,
                    amount,
                }],
            }
        }
        None => ModelAmount {
            amount: Decimal::ZERO,
            details: Vec::new(),
        },
    }
}

fn graduated_percentage(ranges: &[PercentageRange], value: Decimal) -> ModelAmount {
    let mut amount = Decimal::ZERO;
    let mut details = Vec::new();
    for range in ranges {
        let units = units_in_range(value, range.from_value, range.to_value);
        if units.is_zero() {
            break;
        }
        let range_amount = units * range.rate / HUNDRED + range.flat_amount;
        amount += range_amount;
        details.push(RangeDetail {
            from_value: range.from_value,
            to_value: range.to_value,
            units,
            per_unit_amount: None,
            rate: Some(range.rate),
            flat_amount: range.flat_amount,
            amount: range_amount,
        });
    }
    ModelAmount { amount, details }
}

/// Prices a value with a charge model
pub fn price(model: &ChargeModel, value: Decimal, events_count: u64) -> ModelAmount {
    let simple = |amount: Decimal| ModelAmount {
        amount,
        details: Vec::new(),
    };

    match model {
        ChargeModel::Standard { amount } => simple(value * amount),
        ChargeModel::Graduated { ranges } => graduated(ranges, value),
        ChargeModel::Volume { ranges } => volume(ranges, value),
        ChargeModel::Package {
            amount,
            package_size,
            free_units,
        } => {
            let paying = (value - Decimal::from(*free_units)).max(Decimal::ZERO);
            let packages = (paying / Decimal::from(*package_size)).ceil();
            simple(packages * amount)
        }
        ChargeModel::Percentage {
            rate,
            fixed_amount,
            free_units_per_events,
            free_units_per_total_aggregation,
            min_amount,
            max_amount,
        } => {
            let base = (value - free_units_per_total_aggregation.unwrap_or_default())
                .max(Decimal::ZERO);
            let mut rate_amount = base * rate / HUNDRED;
            if let Some(min) = min_amount {
                if base > Decimal::ZERO {
                    rate_amount = rate_amount.max(*min);
                }
            }
            if let Some(max) = max_amount {
                rate_amount = rate_amount.min(*max);
            }

            let paid_events = events_count.saturating_sub(free_units_per_events.unwrap_or(0));
            let fixed = fixed_amount.unwrap_or_default() * Decimal::from(paid_events);
            simple(rate_amount + fixed)
        }
        ChargeModel::GraduatedPercentage { ranges } => graduated_percentage(ranges, value),
    }
}

/// Turns aggregated usage into fee amounts for a charge
#[derive(Debug, Clone, Copy)]
pub struct FeeCalculator {
    precision: u32,
}

impl FeeCalculator {
    pub fn new(precision: u32) -> Self {
        Self { precision }
    }

    fn proration(&self, charge: &Charge, usage: &UsageQuantity, bounds: &BillingBounds) -> Decimal {
        if !charge.prorated {
            return Decimal::ONE;
        }
        match usage.prorated_value {
            Some(prorated) if !usage.value.is_zero() => prorated / usage.value,
            _ => bounds.proration_factor(),
        }
    }

    fn finish(
        &self,
        units: Decimal,
        amount: Decimal,
        details: Vec<RangeDetail>,
        currency: &Currency,
    ) -> ChargeAmount {
        let precise_amount_cents = currency.to_precise_cents(amount).round_dp(self.precision);
        let precise_unit_amount = if units.is_zero() {
            Decimal::ZERO
        } else {
            (amount / units).round_dp(self.precision)
        };
        ChargeAmount {
            units: units.round_dp(self.precision),
            precise_unit_amount,
            precise_amount_cents,
            amount_details: details,
        }
    }

    /// Amount of one charge bucket over a billing period
    pub fn calculate(
        &self,
        charge: &Charge,
        filter_id: Option<ChargeFilterId>,
        usage: &UsageQuantity,
        bounds: &BillingBounds,
        currency: &Currency,
    ) -> ChargeAmount {
        let model = charge.properties_for(filter_id);
        let priced = price(model, usage.value, usage.events_count);
        let factor = self.proration(charge, usage, bounds);
        self.finish(
            usage.value * factor,
            priced.amount * factor,
            priced.details,
            currency,
        )
    }

    /// Incremental amount caused by usage moving from `before` to `after`
    pub fn in_advance_delta(
        &self,
        charge: &Charge,
        filter_id: Option<ChargeFilterId>,
        before: &UsageQuantity,
        after: &UsageQuantity,
        currency: &Currency,
    ) -> ChargeAmount {
        let model = charge.properties_for(filter_id);
        let previous = price(model, before.value, before.events_count);
        let current = price(model, after.value, after.events_count);
        self.finish(
            after.value - before.value,
            current.amount - previous.amount,
            Vec::new(),
            currency,
        )
    }

    /// Shortfall below the charge minimum, prorated to the charges window
    pub fn true_up_precise_cents(
        &self,
        charge: &Charge,
        charged_precise_cents: Decimal,
        bounds: &BillingBounds,
    ) -> Option<Decimal> {
        if charge.min_amount_cents <= 0 {
            return None;
        }
        let minimum = Decimal::from(charge.min_amount_cents) * bounds.proration_factor();
        let shortfall = (minimum - charged_precise_cents).round_dp(self.precision);
        (shortfall > Decimal::ZERO).then_some(shortfall)
    }
}
