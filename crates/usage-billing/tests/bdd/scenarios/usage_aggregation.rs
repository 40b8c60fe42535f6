use crate::bdd::{april, date, number, text, TestContext};
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use usage_billing::domain::{
    AggregationType, BillableMetric, Charge, ChargeModel, InvoicingReason, Subscription,
};
use usage_billing::UsageQuery;

async fn subscribe_to(
    context: &TestContext,
    metric: &BillableMetric,
    grouped_by: &[&str],
    grace_days: u32,
) -> (Subscription, Charge) {
    let mut plan = context.plan("usage", 0);
    let charge = Charge::new(
        context.organization_id(),
        plan.id,
        metric.id,
        ChargeModel::Standard { amount: dec!(1) },
    )
    .with_grouped_by(grouped_by);
    plan.charges.push(charge.clone());
    context.save_plan(&plan).await;

    let customer = context.create_customer("acme", grace_days).await;
    let subscription = context
        .subscribe("sub_acme", &customer, &plan, april(1, 0))
        .await;
    (subscription, charge)
}

fn query(charge: &Charge) -> UsageQuery {
    UsageQuery {
        external_subscription_id: "sub_acme".into(),
        charge_id: charge.id,
        charge_filter_id: None,
        grouped_by: None,
        at: Some(april(20, 0)),
    }
}

#[test_log::test(tokio::test)]
async fn test_max_aggregation_keeps_peak_value() {
    let context = TestContext::new().await;
    let metric = context
        .create_metric("gpu_count", AggregationType::Max, Some("gpus"))
        .await;
    let (_, charge) = subscribe_to(&context, &metric, &[], 0).await;

    for (tx, gpus, day) in [("tx_1", 3, 2), ("tx_2", 9, 5), ("tx_3", 4, 9)] {
        context
            .ingest("sub_acme", tx, "gpu_count", &[("gpus", number(gpus))], april(day, 0))
            .await;
    }

    let usage = context
        .engine
        .get_current_usage(&context.tenant, &query(&charge))
        .await
        .expect("Failed to read usage");
    assert_eq!(usage.current_aggregation, dec!(9));
    assert_eq!(usage.from_datetime, date(4, 1));
    assert_eq!(usage.to_datetime, date(5, 1));
}

#[test_log::test(tokio::test)]
async fn test_unique_count_honors_removals() {
    let context = TestContext::new().await;
    let metric = context
        .create_metric("seats", AggregationType::UniqueCount, Some("user"))
        .await;
    let (_, charge) = subscribe_to(&context, &metric, &[], 0).await;

    context
        .ingest("sub_acme", "tx_1", "seats", &[("user", text("ana"))], april(2, 0))
        .await;
    context
        .ingest("sub_acme", "tx_2", "seats", &[("user", text("bo"))], april(3, 0))
        .await;
    context
        .ingest("sub_acme", "tx_3", "seats", &[("user", text("ana"))], april(4, 0))
        .await;
    context
        .ingest(
            "sub_acme",
            "tx_4",
            "seats",
            &[("user", text("bo")), ("operation_type", text("remove"))],
            april(5, 0),
        )
        .await;

    let usage = context
        .engine
        .get_current_usage(&context.tenant, &query(&charge))
        .await
        .expect("Failed to read usage");
    assert_eq!(usage.current_aggregation, dec!(1));
}

#[test_log::test(tokio::test)]
async fn test_grouped_usage_is_reported_per_group() {
    let context = TestContext::new().await;
    let metric = context
        .create_metric("api_calls", AggregationType::Count, None)
        .await;
    let (_, charge) = subscribe_to(&context, &metric, &["region"], 0).await;

    for (tx, region) in [("tx_1", "eu"), ("tx_2", "us"), ("tx_3", "eu")] {
        context
            .ingest("sub_acme", tx, "api_calls", &[("region", text(region))], april(6, 0))
            .await;
    }

    let all = context
        .engine
        .get_current_usage(&context.tenant, &query(&charge))
        .await
        .expect("Failed to read usage");
    assert_eq!(all.buckets.len(), 2);
    assert_eq!(all.current_aggregation, dec!(3));

    let eu = UsageQuery {
        grouped_by: Some(BTreeMap::from([("region".to_string(), "eu".to_string())])),
        ..query(&charge)
    };
    let usage = context
        .engine
        .get_current_usage(&context.tenant, &eu)
        .await
        .expect("Failed to read grouped usage");
    assert_eq!(usage.current_aggregation, dec!(2));
}

#[test_log::test(tokio::test)]
async fn test_late_event_marks_usage_stale_until_refresh() {
    let context = TestContext::new().await;
    let metric = context
        .create_metric("tokens", AggregationType::Sum, Some("tokens"))
        .await;
    let (subscription, charge) = subscribe_to(&context, &metric, &[], 5).await;

    context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(10))], april(10, 0))
        .await;
    let draft = context
        .invoice(
            &subscription,
            date(4, 1),
            date(5, 1),
            InvoicingReason::SubscriptionPeriodic,
        )
        .await;
    assert!(draft.is_draft(), "Grace period keeps the invoice in draft");

    context
        .ingest("sub_acme", "tx_late", "tokens", &[("tokens", number(5))], april(5, 0))
        .await;

    let stale = context
        .engine
        .get_current_usage(&context.tenant, &query(&charge))
        .await
        .expect("Failed to read usage");
    assert!(stale.stale, "Checkpoint should be invalidated by the late event");
    assert_eq!(stale.current_aggregation, dec!(10));

    let report = context.refresh().await;
    assert_eq!(report.drafts_refreshed, 1);
    assert_eq!(report.failed, 0);

    let fresh = context
        .engine
        .get_current_usage(&context.tenant, &query(&charge))
        .await
        .expect("Failed to read usage");
    assert!(!fresh.stale);
    assert_eq!(fresh.current_aggregation, dec!(15));

    let refreshed = context.get_invoice(&draft).await;
    assert_eq!(refreshed.totals.fees_amount_cents, 1_500);
}
