use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{BillingError, Result};

/// Currency metadata: ISO code and minor-unit exponent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency {
    pub code: String,
    pub exponent: u32,
}

impl Currency {
    pub fn new(code: impl Into<String>, exponent: u32) -> Self {
        Self {
            code: code.into().to_uppercase(),
            exponent,
        }
    }

    pub fn subunit_to_unit(&self) -> Decimal {
        Decimal::from(10u64.pow(self.exponent))
    }

    /// Major-unit amount expressed in unrounded minor units
    pub fn to_precise_cents(&self, amount: Decimal) -> Decimal {
        amount * self.subunit_to_unit()
    }

    pub fn cents_to_major(&self, cents: i64) -> Decimal {
        Decimal::from(cents) / self.subunit_to_unit()
    }

    pub fn round_major(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.exponent, RoundingStrategy::MidpointAwayFromZero)
    }
}

/// Rounds a precise minor-unit amount to integer cents
pub fn round_cents(precise_cents: Decimal) -> Result<i64> {
    precise_cents
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| BillingError::validation("amount_cents", "amount exceeds representable range"))
}

/// Currency metadata lookup collaborator
pub trait CurrencyProvider: Send + Sync {
    fn currency(&self, code: &str) -> Result<Currency>;
}

/// Static ISO 4217 exponent table
pub struct StaticCurrencies {
    currencies: HashMap<String, Currency>,
}

impl StaticCurrencies {
    pub fn new() -> Self {
        let table: &[(&str, u32)] = &[
            ("USD", 2),
            ("EUR", 2),
            ("GBP", 2),
            ("CAD", 2),
            ("AUD", 2),
            ("CHF", 2),
            ("BRL", 2),
            ("INR", 2),
            ("JPY", 0),
            ("KRW", 0),
            ("CLP", 0),
            ("VND", 0),
            ("KWD", 3),
            ("BHD", 3),
            ("JOD", 3),
        ];
        let currencies = table
            .iter()
            .map(|(code, exponent)| (code.to_string(), Currency::new(*code, *exponent)))
            .collect();
        Self { currencies }
    }

    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currencies.insert(currency.code.clone(), currency);
        self
    }
}

impl Default for StaticCurrencies {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrencyProvider for StaticCurrencies {
    fn currency(&self, code: &str) -> Result<Currency> {
        self.currencies
            .get(&code.to_uppercase())
            .cloned()
            .ok_or_else(|| BillingError::UnsupportedCurrency {
                code: code.to_string(),
            })
    }
}
