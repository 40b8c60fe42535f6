use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::expression::Expression;
use crate::domain::types::{
    BillableMetricFilterId, BillableMetricId, Lifecycle, MetricCode, OrganizationId,
};
use crate::error::{BillingError, Result};

/// Sentinel filter value matching any of the metric filter's allowed values
pub const ALL_FILTER_VALUES: &str = "__ALL_FILTER_VALUES__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregationType {
    Count,
    Sum,
    Max,
    UniqueCount,
    RecurringCount,
    WeightedSum,
    CustomExpression { expression: Expression },
}

impl AggregationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationType::Count => "count",
            AggregationType::Sum => "sum",
            AggregationType::Max => "max",
            AggregationType::UniqueCount => "unique_count",
            AggregationType::RecurringCount => "recurring_count",
            AggregationType::WeightedSum => "weighted_sum",
            AggregationType::CustomExpression { .. } => "custom_expression",
        }
    }

    pub fn requires_field_name(&self) -> bool {
        !matches!(
            self,
            AggregationType::Count | AggregationType::CustomExpression { .. }
        )
    }

    /// Aggregations backed by quantified events rather than a running value
    pub fn is_quantified(&self) -> bool {
        matches!(
            self,
            AggregationType::UniqueCount | AggregationType::RecurringCount
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RoundingPolicy {
    None,
    Round { precision: u32 },
    Ceil { precision: u32 },
    Floor { precision: u32 },
}

impl Default for RoundingPolicy {
    fn default() -> Self {
        RoundingPolicy::None
    }
}

impl RoundingPolicy {
    pub fn apply(&self, value: Decimal) -> Decimal {
        match *self {
            RoundingPolicy::None => value,
            RoundingPolicy::Round { precision } => {
                value.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
            }
            RoundingPolicy::Ceil { precision } => {
                value.round_dp_with_strategy(precision, RoundingStrategy::ToPositiveInfinity)
            }
            RoundingPolicy::Floor { precision } => {
                value.round_dp_with_strategy(precision, RoundingStrategy::ToNegativeInfinity)
            }
        }
    }
}

/// Named dimension declared on a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillableMetricFilter {
    pub id: BillableMetricFilterId,
    pub key: String,
    pub allowed_values: Vec<String>,
}

impl BillableMetricFilter {
    pub fn new(key: impl Into<String>, allowed_values: Vec<String>) -> Self {
        Self {
            id: BillableMetricFilterId::new(),
            key: key.into(),
            allowed_values,
        }
    }

    pub fn allows(&self, value: &str) -> bool {
        self.allowed_values.iter().any(|v| v == value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillableMetric {
    pub id: BillableMetricId,
    pub organization_id: OrganizationId,
    pub code: MetricCode,
    pub name: String,
    pub aggregation_type: AggregationType,
    pub field_name: Option<String>,
    #[serde(default)]
    pub recurring: bool,
    #[serde(default)]
    pub rounding_policy: RoundingPolicy,
    #[serde(default)]
    pub filters: Vec<BillableMetricFilter>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
}

impl BillableMetric {
    pub fn new(
        organization_id: OrganizationId,
        code: impl Into<String>,
        aggregation_type: AggregationType,
        field_name: Option<String>,
    ) -> Self {
        let code = code.into();
        Self {
            id: BillableMetricId::new(),
            organization_id,
            name: code.clone(),
            code: MetricCode::new(code),
            recurring: matches!(aggregation_type, AggregationType::RecurringCount),
            aggregation_type,
            field_name,
            rounding_policy: RoundingPolicy::None,
            filters: Vec::new(),
            lifecycle: Lifecycle::Active,
            created_at: Utc::now(),
        }
    }

    pub fn with_filter(mut self, key: &str, allowed_values: &[&str]) -> Self {
        self.filters.push(BillableMetricFilter::new(
            key,
            allowed_values.iter().map(|v| v.to_string()).collect(),
        ));
        self
    }

    pub fn with_rounding(mut self, rounding_policy: RoundingPolicy) -> Self {
        self.rounding_policy = rounding_policy;
        self
    }

    pub fn recurring(mut self, recurring: bool) -> Self {
        self.recurring = recurring;
        self
    }

    pub fn filter(&self, key: &str) -> Option<&BillableMetricFilter> {
        self.filters.iter().find(|f| f.key == key)
    }

    fn invalid(&self, message: impl Into<String>) -> BillingError {
        BillingError::InvalidMetric {
            code: self.code.to_string(),
            message: message.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.code.as_str().trim().is_empty() {
            return Err(self.invalid("code must not be blank"));
        }

        let field_blank = self
            .field_name
            .as_deref()
            .map(|f| f.trim().is_empty())
            .unwrap_or(true);
        if self.aggregation_type.requires_field_name() && field_blank {
            return Err(self.invalid(format!(
                "{} aggregation requires field_name",
                self.aggregation_type.as_str()
            )));
        }

        match self.aggregation_type {
            AggregationType::UniqueCount if self.recurring => {
                return Err(self.invalid("unique_count cannot be recurring"))
            }
            AggregationType::RecurringCount if !self.recurring => {
                return Err(self.invalid("recurring_count must be recurring"))
            }
            AggregationType::Count
            | AggregationType::Sum
            | AggregationType::Max
            | AggregationType::CustomExpression { .. }
                if self.recurring =>
            {
                return Err(self.invalid(format!(
                    "{} aggregation cannot be recurring",
                    self.aggregation_type.as_str()
                )))
            }
            _ => {}
        }

        let mut seen = std::collections::HashSet::new();
        for filter in &self.filters {
            if filter.key.trim().is_empty() {
                return Err(self.invalid("filter key must not be blank"));
            }
            if !seen.insert(filter.key.as_str()) {
                return Err(self.invalid(format!("duplicate filter key '{}'", filter.key)));
            }
            if filter.allowed_values.is_empty() {
                return Err(self.invalid(format!(
                    "filter '{}' must declare at least one value",
                    filter.key
                )));
            }
            if filter.allowed_values.iter().any(|v| v == ALL_FILTER_VALUES) {
                return Err(self.invalid(format!(
                    "filter '{}' cannot declare the reserved value {}",
                    filter.key, ALL_FILTER_VALUES
                )));
            }
        }

        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_field_name_required() {
        let org = OrganizationId::new();
        let metric = BillableMetric::new(org, "storage", AggregationType::Sum, None);
        assert!(matches!(
            metric.validate(),
            Err(BillingError::InvalidMetric { .. })
        ));

        let metric = BillableMetric::new(org, "calls", AggregationType::Count, None);
        assert!(metric.validate().is_ok());
    }

    #[test]
    fn test_recurring_constraints() {
        let org = OrganizationId::new();
        let seats = BillableMetric::new(
            org,
            "seats",
            AggregationType::RecurringCount,
            Some("user_id".to_string()),
        );
        assert!(seats.recurring);
        assert!(seats.validate().is_ok());

        let sum = BillableMetric::new(org, "gb", AggregationType::Sum, Some("gb".to_string()))
            .recurring(true);
        assert!(sum.validate().is_err());

        let weighted = BillableMetric::new(
            org,
            "gpus",
            AggregationType::WeightedSum,
            Some("gpus".to_string()),
        )
        .recurring(true);
        assert!(weighted.validate().is_ok());
    }

    #[test]
    fn test_filter_declarations() {
        let org = OrganizationId::new();
        let metric = BillableMetric::new(org, "calls", AggregationType::Count, None)
            .with_filter("region", &["eu", "us"])
            .with_filter("region", &["apac"]);
        assert!(metric.validate().is_err());

        let metric = BillableMetric::new(org, "calls", AggregationType::Count, None)
            .with_filter("region", &[ALL_FILTER_VALUES]);
        assert!(metric.validate().is_err());
    }

    #[test]
    fn test_rounding_policy() {
        assert_eq!(
            RoundingPolicy::Round { precision: 1 }.apply(dec!(1.25)),
            dec!(1.3)
        );
        assert_eq!(
            RoundingPolicy::Ceil { precision: 0 }.apply(dec!(1.01)),
            dec!(2)
        );
        assert_eq!(
            RoundingPolicy::Floor { precision: 2 }.apply(dec!(1.019)),
            dec!(1.01)
        );
        assert_eq!(RoundingPolicy::None.apply(dec!(1.019)), dec!(1.019));
    }

    #[test]
    fn test_custom_expression_metric_deserializes() {
        let json = r#"{"type": "custom_expression", "expression": "round(tokens / 1000, 2)"}"#;
        let aggregation: AggregationType = serde_json::from_str(json).unwrap();
        assert_eq!(aggregation.as_str(), "custom_expression");
        assert!(!aggregation.requires_field_name());
    }
}
