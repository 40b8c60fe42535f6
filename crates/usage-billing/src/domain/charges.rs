use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::metrics::{AggregationType, BillableMetric, ALL_FILTER_VALUES};
use crate::domain::types::{
    BillableMetricId, ChargeFilterId, ChargeId, Lifecycle, OrganizationId, PlanId,
};
use crate::error::{BillingError, Result};

/// Tier priced per unit plus an optional flat fee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRange {
    pub from_value: Decimal,
    /// `None` is unbounded
    pub to_value: Option<Decimal>,
    pub per_unit_amount: Decimal,
    #[serde(default)]
    pub flat_amount: Decimal,
}

/// Tier priced as a percentage of the value inside it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentageRange {
    pub from_value: Decimal,
    pub to_value: Option<Decimal>,
    pub rate: Decimal,
    #[serde(default)]
    pub flat_amount: Decimal,
}

/// Charge model with its typed configuration. Amounts are major units of
/// the plan currency; rates are percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ChargeModel {
    Standard {
        amount: Decimal,
    },
    Graduated {
        ranges: Vec<PricingRange>,
    },
    Volume {
        ranges: Vec<PricingRange>,
    },
    Package {
        amount: Decimal,
        package_size: u64,
        #[serde(default)]
        free_units: u64,
    },
    Percentage {
        rate: Decimal,
        #[serde(default)]
        fixed_amount: Option<Decimal>,
        #[serde(default)]
        free_units_per_events: Option<u64>,
        #[serde(default)]
        free_units_per_total_aggregation: Option<Decimal>,
        #[serde(default)]
        min_amount: Option<Decimal>,
        #[serde(default)]
        max_amount: Option<Decimal>,
    },
    GraduatedPercentage {
        ranges: Vec<PercentageRange>,
    },
}

fn validate_ranges<'a>(
    bounds: impl Iterator<Item = (&'a Decimal, &'a Option<Decimal>)>,
) -> std::result::Result<(), String> {
    let bounds: Vec<_> = bounds.collect();
    if bounds.is_empty() {
        return Err("at least one range is required".to_string());
    }
    let mut expected_from = Decimal::ZERO;
    for (index, (from, to)) in bounds.iter().enumerate() {
        if **from != expected_from {
            return Err(format!(
                "range {} must start at {} (found {})",
                index, expected_from, from
            ));
        }
        let is_last = index == bounds.len() - 1;
        match to {
            Some(to) if *to <= **from => {
                return Err(format!("range {} must end after it starts", index))
            }
            Some(_) if is_last => return Err("last range must be unbounded".to_string()),
            Some(to) => expected_from = *to,
            None if !is_last => {
                return Err(format!("only the last range may be unbounded (range {})", index))
            }
            None => {}
        }
    }
    Ok(())
}

fn non_negative(value: Decimal, field: &str) -> std::result::Result<(), String> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(format!("{} must not be negative", field));
    }
    Ok(())
}

impl ChargeModel {
    pub fn name(&self) -> &'static str {
        match self {
            ChargeModel::Standard { .. } => "standard",
            ChargeModel::Graduated { .. } => "graduated",
            ChargeModel::Volume { .. } => "volume",
            ChargeModel::Package { .. } => "package",
            ChargeModel::Percentage { .. } => "percentage",
            ChargeModel::GraduatedPercentage { .. } => "graduated_percentage",
        }
    }

    pub fn same_model(&self, other: &ChargeModel) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn supports_proration(&self) -> bool {
        !matches!(
            self,
            ChargeModel::Percentage { .. } | ChargeModel::GraduatedPercentage { .. }
        )
    }

    /// Validates the model configuration; the message names the offending field
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            ChargeModel::Standard { amount } => non_negative(*amount, "amount"),
            ChargeModel::Graduated { ranges } | ChargeModel::Volume { ranges } => {
                validate_ranges(ranges.iter().map(|r| (&r.from_value, &r.to_value)))?;
                for range in ranges {
                    non_negative(range.per_unit_amount, "per_unit_amount")?;
                    non_negative(range.flat_amount, "flat_amount")?;
                }
                Ok(())
            }
            ChargeModel::Package {
                amount,
                package_size,
                ..
            } => {
                if *package_size == 0 {
                    return Err("package_size must be greater than zero".to_string());
                }
                non_negative(*amount, "amount")
            }
            ChargeModel::Percentage {
                rate,
                fixed_amount,
                free_units_per_total_aggregation,
                min_amount,
                max_amount,
                ..
            } => {
                non_negative(*rate, "rate")?;
                if let Some(fixed) = fixed_amount {
                    non_negative(*fixed, "fixed_amount")?;
                }
                if let Some(free) = free_units_per_total_aggregation {
                    non_negative(*free, "free_units_per_total_aggregation")?;
                }
                if let Some(min) = min_amount {
                    non_negative(*min, "min_amount")?;
                }
                if let Some(max) = max_amount {
                    non_negative(*max, "max_amount")?;
                }
                if let (Some(min), Some(max)) = (min_amount, max_amount) {
                    if min > max {
                        return Err("min_amount must not exceed max_amount".to_string());
                    }
                }
                Ok(())
            }
            ChargeModel::GraduatedPercentage { ranges } => {
                validate_ranges(ranges.iter().map(|r| (&r.from_value, &r.to_value)))?;
                for range in ranges {
                    non_negative(range.rate, "rate")?;
                    non_negative(range.flat_amount, "flat_amount")?;
                }
                Ok(())
            }
        }
    }
}

/// Whether events matching no filter fall back to the charge's own properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterPolicy {
    #[default]
    Optional,
    Required,
}

/// One filter combination of a charge: metric filter key to selected values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeFilter {
    pub id: ChargeFilterId,
    pub values: BTreeMap<String, Vec<String>>,
    pub properties: ChargeModel,
    #[serde(default)]
    pub grouped_by: Vec<String>,
    #[serde(default)]
    pub invoice_display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChargeFilter {
    pub fn new(values: &[(&str, &[&str])], properties: ChargeModel) -> Self {
        Self {
            id: ChargeFilterId::new(),
            values: values
                .iter()
                .map(|(key, vals)| {
                    (
                        key.to_string(),
                        vals.iter().map(|v| v.to_string()).collect(),
                    )
                })
                .collect(),
            properties,
            grouped_by: Vec::new(),
            invoice_display_name: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_grouped_by(mut self, keys: &[&str]) -> Self {
        self.grouped_by = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Number of pinned keys, the specificity used for precedence
    pub fn specificity(&self) -> usize {
        self.values.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub id: ChargeId,
    pub organization_id: OrganizationId,
    pub plan_id: PlanId,
    pub billable_metric_id: BillableMetricId,
    #[serde(default)]
    pub parent_id: Option<ChargeId>,
    pub properties: ChargeModel,
    #[serde(default)]
    pub pay_in_advance: bool,
    #[serde(default)]
    pub prorated: bool,
    #[serde(default = "default_invoiceable")]
    pub invoiceable: bool,
    #[serde(default)]
    pub min_amount_cents: i64,
    #[serde(default)]
    pub filter_policy: FilterPolicy,
    #[serde(default)]
    pub filters: Vec<ChargeFilter>,
    /// Free dimensions grouping usage of the default bucket
    #[serde(default)]
    pub grouped_by: Vec<String>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
}

fn default_invoiceable() -> bool {
    true
}

/// Fields a child plan may override when inheriting a charge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChargeOverrides {
    pub properties: Option<ChargeModel>,
    pub min_amount_cents: Option<i64>,
    pub filters: Option<Vec<ChargeFilter>>,
}

impl Charge {
    pub fn new(
        organization_id: OrganizationId,
        plan_id: PlanId,
        billable_metric_id: BillableMetricId,
        properties: ChargeModel,
    ) -> Self {
        Self {
            id: ChargeId::new(),
            organization_id,
            plan_id,
            billable_metric_id,
            parent_id: None,
            properties,
            pay_in_advance: false,
            prorated: false,
            invoiceable: true,
            min_amount_cents: 0,
            filter_policy: FilterPolicy::Optional,
            filters: Vec::new(),
            grouped_by: Vec::new(),
            lifecycle: Lifecycle::Active,
            created_at: Utc::now(),
        }
    }

    pub fn pay_in_advance(mut self, invoiceable: bool) -> Self {
        self.pay_in_advance = true;
        self.invoiceable = invoiceable;
        self
    }

    pub fn prorated(mut self) -> Self {
        self.prorated = true;
        self
    }

    pub fn with_min_amount_cents(mut self, min_amount_cents: i64) -> Self {
        self.min_amount_cents = min_amount_cents;
        self
    }

    pub fn with_filter(mut self, filter: ChargeFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_filter_policy(mut self, filter_policy: FilterPolicy) -> Self {
        self.filter_policy = filter_policy;
        self
    }

    pub fn with_grouped_by(mut self, keys: &[&str]) -> Self {
        self.grouped_by = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Child charge on another plan inheriting from this one
    pub fn derive_override(&self, plan_id: PlanId, overrides: ChargeOverrides) -> Self {
        let now = Utc::now();
        let filters = overrides.filters.unwrap_or_else(|| {
            self.filters
                .iter()
                .map(|f| ChargeFilter {
                    id: ChargeFilterId::new(),
                    created_at: now,
                    ..f.clone()
                })
                .collect()
        });
        Self {
            id: ChargeId::new(),
            plan_id,
            parent_id: Some(self.id),
            properties: overrides
                .properties
                .unwrap_or_else(|| self.properties.clone()),
            min_amount_cents: overrides.min_amount_cents.unwrap_or(self.min_amount_cents),
            filters,
            lifecycle: Lifecycle::Active,
            created_at: now,
            ..self.clone()
        }
    }

    pub fn filter(&self, id: ChargeFilterId) -> Option<&ChargeFilter> {
        self.filters.iter().find(|f| f.id == id)
    }

    /// Pricing used for a bucket: the filter's properties or the charge's own
    pub fn properties_for(&self, filter_id: Option<ChargeFilterId>) -> &ChargeModel {
        filter_id
            .and_then(|id| self.filter(id))
            .map(|f| &f.properties)
            .unwrap_or(&self.properties)
    }

    pub fn grouped_by_for(&self, filter_id: Option<ChargeFilterId>) -> &[String] {
        filter_id
            .and_then(|id| self.filter(id))
            .map(|f| f.grouped_by.as_slice())
            .unwrap_or(&self.grouped_by)
    }

    fn invalid(&self, message: impl Into<String>) -> BillingError {
        BillingError::InvalidChargeModelConfig {
            charge: self.id.to_string(),
            message: message.into(),
        }
    }

    /// Write-time validation against the charge's billable metric
    pub fn validate(&self, metric: &BillableMetric) -> Result<()> {
        if metric.id != self.billable_metric_id {
            return Err(self.invalid("billable metric does not match charge"));
        }
        if metric.organization_id != self.organization_id {
            return Err(BillingError::not_found("billable_metric", metric.id));
        }

        self.properties.validate().map_err(|m| self.invalid(m))?;

        if self.min_amount_cents < 0 {
            return Err(self.invalid("min_amount_cents must not be negative"));
        }
        if self.prorated && !self.properties.supports_proration() {
            return Err(self.invalid(format!(
                "{} charges cannot be prorated",
                self.properties.name()
            )));
        }
        if !self.invoiceable && !self.pay_in_advance {
            return Err(self.invalid("only pay-in-advance charges can be non-invoiceable"));
        }
        if self.pay_in_advance
            && matches!(
                metric.aggregation_type,
                AggregationType::Max | AggregationType::WeightedSum
            )
        {
            return Err(self.invalid(format!(
                "{} metrics cannot be billed in advance",
                metric.aggregation_type.as_str()
            )));
        }
        if self.pay_in_advance && self.min_amount_cents > 0 {
            return Err(self.invalid("pay-in-advance charges cannot carry a minimum amount"));
        }
        if self.grouped_by.iter().any(|k| k.trim().is_empty()) {
            return Err(self.invalid("grouped_by keys must not be blank"));
        }

        let mut combinations = BTreeSet::new();
        for filter in &self.filters {
            if filter.values.is_empty() {
                return Err(self.invalid("charge filter must select at least one key"));
            }
            for (key, values) in &filter.values {
                let metric_filter = metric.filter(key).ok_or_else(|| {
                    self.invalid(format!("filter key '{}' is not declared on the metric", key))
                })?;
                if values.is_empty() {
                    return Err(self.invalid(format!("filter key '{}' selects no values", key)));
                }
                for value in values {
                    if value != ALL_FILTER_VALUES && !metric_filter.allows(value) {
                        return Err(self.invalid(format!(
                            "value '{}' is not allowed for filter key '{}'",
                            value, key
                        )));
                    }
                }
            }
            if !filter.properties.same_model(&self.properties) {
                return Err(self.invalid(format!(
                    "filter properties must use the {} model",
                    self.properties.name()
                )));
            }
            filter.properties.validate().map_err(|m| self.invalid(m))?;
            if filter.grouped_by.iter().any(|k| k.trim().is_empty()) {
                return Err(self.invalid("grouped_by keys must not be blank"));
            }

            let mut normalized: Vec<(String, Vec<String>)> = filter
                .values
                .iter()
                .map(|(k, v)| {
                    let mut v = v.clone();
                    v.sort();
                    (k.clone(), v)
                })
                .collect();
            normalized.sort();
            if !combinations.insert(normalized) {
                return Err(self.invalid("duplicate filter combination"));
            }
        }

        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }
}
