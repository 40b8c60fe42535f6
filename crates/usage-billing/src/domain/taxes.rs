use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::domain::currency::round_cents;
use crate::domain::fees::{Fee, FeeTax};
use crate::domain::types::OrganizationId;
use crate::error::{BillingError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRate {
    pub code: String,
    pub name: String,
    /// Percent
    pub rate: Decimal,
}

/// Tax-rate lookup collaborator
#[async_trait]
pub trait TaxRateProvider: Send + Sync {
    async fn rates_for(
        &self,
        organization_id: OrganizationId,
        tax_codes: Vec<String>,
    ) -> Result<Vec<TaxRate>>;
}

/// Fixed table of tax rates keyed by code
#[derive(Debug, Clone, Default)]
pub struct StaticTaxRates {
    rates: HashMap<String, TaxRate>,
}

impl StaticTaxRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, code: &str, name: &str, rate: Decimal) -> Self {
        self.rates.insert(
            code.to_string(),
            TaxRate {
                code: code.to_string(),
                name: name.to_string(),
                rate,
            },
        );
        self
    }
}

#[async_trait]
impl TaxRateProvider for StaticTaxRates {
    async fn rates_for(
        &self,
        _organization_id: OrganizationId,
        tax_codes: Vec<String>,
    ) -> Result<Vec<TaxRate>> {
        tax_codes
            .iter()
            .map(|code| {
                self.rates
                    .get(code)
                    .cloned()
                    .ok_or_else(|| BillingError::TaxProviderError {
                        message: format!("unknown tax code {}", code),
                    })
            })
            .collect()
    }
}

/// Tax totals of an invoice for one tax code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedTax {
    pub tax_code: String,
    pub tax_name: String,
    pub rate: Decimal,
    pub precise_base_amount_cents: Decimal,
    pub precise_amount_cents: Decimal,
    pub amount_cents: i64,
}

/// Taxes every fee on its post-coupon amount and aggregates per tax code
pub fn apply_taxes(fees: &mut [Fee], rates: &[TaxRate]) -> Result<Vec<AppliedTax>> {
    let mut totals: BTreeMap<String, AppliedTax> = BTreeMap::new();

    for fee in fees.iter_mut() {
        let base = fee.taxable_precise_cents();
        fee.applied_taxes.clear();
        fee.taxes_rate = Decimal::ZERO;
        fee.taxes_precise_amount_cents = Decimal::ZERO;

        for rate in rates {
            let amount = base * rate.rate / Decimal::ONE_HUNDRED;
            fee.applied_taxes.push(FeeTax {
                tax_code: rate.code.clone(),
                rate: rate.rate,
                precise_amount_cents: amount,
            });
            fee.taxes_rate += rate.rate;
            fee.taxes_precise_amount_cents += amount;

            let total = totals
                .entry(rate.code.clone())
                .or_insert_with(|| AppliedTax {
                    tax_code: rate.code.clone(),
                    tax_name: rate.name.clone(),
                    rate: rate.rate,
                    precise_base_amount_cents: Decimal::ZERO,
                    precise_amount_cents: Decimal::ZERO,
                    amount_cents: 0,
                });
            total.precise_base_amount_cents += base;
            total.precise_amount_cents += amount;
        }
    }

    totals
        .into_values()
        .map(|mut tax| {
            tax.amount_cents = round_cents(tax.precise_amount_cents)?;
            Ok(tax)
        })
        .collect()
}
