use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::domain::charges::{Charge, ChargeFilter, FilterPolicy};
use crate::domain::events::EventProperties;
use crate::domain::metrics::{BillableMetric, ALL_FILTER_VALUES};
use crate::domain::types::ChargeFilterId;

/// Free-dimension values an aggregation bucket is split by
pub type GroupedBy = BTreeMap<String, String>;

/// Aggregation bucket an event contributes to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterMatch {
    pub charge_filter_id: Option<ChargeFilterId>,
    pub grouped_by: GroupedBy,
}

impl FilterMatch {
    pub fn default_bucket() -> Self {
        Self {
            charge_filter_id: None,
            grouped_by: GroupedBy::new(),
        }
    }
}

fn filter_matches(
    filter: &ChargeFilter,
    metric: &BillableMetric,
    properties: &EventProperties,
) -> bool {
    filter.values.iter().all(|(key, selected)| {
        let Some(value) = properties.get(key).map(|v| v.as_text()) else {
            return false;
        };
        if selected.iter().any(|s| s == ALL_FILTER_VALUES) {
            return metric
                .filter(key)
                .map(|declared| declared.allows(&value))
                .unwrap_or(false);
        }
        selected.iter().any(|s| *s == value)
    })
}

fn grouping(keys: &[String], properties: &EventProperties) -> GroupedBy {
    keys.iter()
        .filter_map(|key| {
            properties
                .get(key)
                .map(|value| (key.clone(), value.as_text()))
        })
        .collect()
}

/// Resolves the bucket of an event for a charge.
///
/// The most specific matching filter wins; among equally specific filters the
/// one created first wins. `None` means the event is excluded from the charge.
pub fn resolve(
    properties: &EventProperties,
    metric: &BillableMetric,
    charge: &Charge,
) -> Option<FilterMatch> {
    let winner = charge
        .filters
        .iter()
        .enumerate()
        .filter(|(_, filter)| filter_matches(filter, metric, properties))
        .min_by_key(|(index, filter)| (Reverse(filter.specificity()), filter.created_at, *index))
        .map(|(_, filter)| filter);

    match winner {
        Some(filter) => Some(FilterMatch {
            charge_filter_id: Some(filter.id),
            grouped_by: grouping(&filter.grouped_by, properties),
        }),
        None if charge.filters.is_empty() || charge.filter_policy == FilterPolicy::Optional => {
            Some(FilterMatch {
                charge_filter_id: None,
                grouped_by: grouping(&charge.grouped_by, properties),
            })
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::charges::ChargeModel;
    use crate::domain::events::PropertyValue;
    use crate::domain::metrics::AggregationType;
    use crate::domain::types::{OrganizationId, PlanId};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn props(pairs: &[(&str, &str)]) -> EventProperties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), PropertyValue::from(*v)))
            .collect()
    }

    fn setup() -> (BillableMetric, Charge) {
        let org = OrganizationId::new();
        let metric = BillableMetric::new(org, "compute", AggregationType::Count, None)
            .with_filter("region", &["eu", "us"])
            .with_filter("gpu", &["a100", "h100"]);
        let standard = ChargeModel::Standard { amount: dec!(1) };
        let mut broad = ChargeFilter::new(&[("region", &["eu"])], standard.clone());
        let mut narrow =
            ChargeFilter::new(&[("region", &["eu"]), ("gpu", &["h100"])], standard.clone());
        narrow.created_at = broad.created_at + Duration::seconds(5);
        broad.grouped_by = vec!["project".to_string()];
        let charge = Charge::new(org, PlanId::new(), metric.id, standard)
            .with_filter(broad)
            .with_filter(narrow);
        (metric, charge)
    }

    #[test]
    fn test_most_specific_filter_wins() {
        let (metric, charge) = setup();
        let matched = resolve(&props(&[("region", "eu"), ("gpu", "h100")]), &metric, &charge)
            .unwrap();
        assert_eq!(matched.charge_filter_id, Some(charge.filters[1].id));

        let matched = resolve(&props(&[("region", "eu"), ("gpu", "a100")]), &metric, &charge)
            .unwrap();
        assert_eq!(matched.charge_filter_id, Some(charge.filters[0].id));
    }

    #[test]
    fn test_tie_broken_by_creation_order() {
        let org = OrganizationId::new();
        let metric = BillableMetric::new(org, "compute", AggregationType::Count, None)
            .with_filter("region", &["eu", "us"])
            .with_filter("gpu", &["a100", "h100"]);
        let standard = ChargeModel::Standard { amount: dec!(1) };
        let mut later = ChargeFilter::new(&[("gpu", &["h100"])], standard.clone());
        let earlier = ChargeFilter::new(&[("region", &["eu"])], standard.clone());
        later.created_at = earlier.created_at + Duration::seconds(1);
        let charge = Charge::new(org, PlanId::new(), metric.id, standard)
            .with_filter(later)
            .with_filter(earlier.clone());

        let matched = resolve(&props(&[("region", "eu"), ("gpu", "h100")]), &metric, &charge)
            .unwrap();
        assert_eq!(matched.charge_filter_id, Some(earlier.id));
    }

    #[test]
    fn test_unmatched_events_follow_filter_policy() {
        let (metric, charge) = setup();
        let unmatched = props(&[("region", "us")]);
        assert_eq!(
            resolve(&unmatched, &metric, &charge),
            Some(FilterMatch::default_bucket())
        );

        let required = charge.with_filter_policy(FilterPolicy::Required);
        assert_eq!(resolve(&unmatched, &metric, &required), None);
    }

    #[test]
    fn test_all_values_sentinel_limited_to_declared_values() {
        let org = OrganizationId::new();
        let metric = BillableMetric::new(org, "compute", AggregationType::Count, None)
            .with_filter("region", &["eu", "us"]);
        let standard = ChargeModel::Standard { amount: dec!(1) };
        let charge = Charge::new(org, PlanId::new(), metric.id, standard.clone())
            .with_filter(ChargeFilter::new(&[("region", &[ALL_FILTER_VALUES])], standard))
            .with_filter_policy(FilterPolicy::Required);

        assert!(resolve(&props(&[("region", "us")]), &metric, &charge).is_some());
        assert!(resolve(&props(&[("region", "apac")]), &metric, &charge).is_none());
        assert!(resolve(&props(&[]), &metric, &charge).is_none());
    }

    #[test]
    fn test_grouped_by_omits_missing_keys() {
        let (metric, charge) = setup();
        let matched = resolve(
            &props(&[("region", "eu"), ("project", "alpha")]),
            &metric,
            &charge,
        )
        .unwrap();
        assert_eq!(matched.grouped_by.get("project").map(String::as_str), Some("alpha"));

        let matched = resolve(&props(&[("region", "eu")]), &metric, &charge).unwrap();
        assert!(matched.grouped_by.is_empty());
    }
}
