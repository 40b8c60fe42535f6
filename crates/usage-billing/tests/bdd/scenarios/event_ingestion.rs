use crate::bdd::{april, event, number, TestContext};
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use usage_billing::aggregator::IngestOutcome;
use usage_billing::domain::{AggregationType, Charge, ChargeModel};
use usage_billing::{BillingError, UsageQuery};

async fn tokens_subscription(context: &TestContext) -> Charge {
    let metric = context
        .create_metric("tokens", AggregationType::Sum, Some("tokens"))
        .await;
    let mut plan = context.plan("usage", 0);
    let charge = Charge::new(
        context.organization_id(),
        plan.id,
        metric.id,
        ChargeModel::Standard { amount: dec!(0.01) },
    );
    plan.charges.push(charge.clone());
    context.save_plan(&plan).await;

    let customer = context.create_customer("acme", 0).await;
    context.subscribe("sub_acme", &customer, &plan, april(1, 0)).await;
    charge
}

fn usage_query(charge: &Charge) -> UsageQuery {
    UsageQuery {
        external_subscription_id: "sub_acme".into(),
        charge_id: charge.id,
        charge_filter_id: None,
        grouped_by: None,
        at: Some(april(15, 0)),
    }
}

#[test_log::test(tokio::test)]
async fn test_resubmitted_event_is_counted_once() {
    let context = TestContext::new().await;
    let charge = tokens_subscription(&context).await;

    let first = context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(40))], april(2, 9))
        .await;
    let second = context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(40))], april(2, 9))
        .await;

    assert!(matches!(first, IngestOutcome::Accepted { .. }));
    assert!(
        matches!(second, IngestOutcome::AlreadyIngested { .. }),
        "Identical re-submission should be acknowledged without a second write"
    );

    let usage = context
        .engine
        .get_current_usage(&context.tenant, &usage_query(&charge))
        .await
        .expect("Failed to read usage");
    assert_eq!(usage.current_aggregation, dec!(40));
}

#[test_log::test(tokio::test)]
async fn test_reused_transaction_id_keeps_first_payload() {
    let context = TestContext::new().await;
    let charge = tokens_subscription(&context).await;

    context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(40))], april(2, 9))
        .await;
    let conflicting = context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(900))], april(2, 9))
        .await;

    match conflicting {
        IngestOutcome::DuplicateTransaction { existing } => {
            assert_eq!(existing.transaction_id.as_str(), "tx_1");
        }
        other => panic!("Expected a duplicate transaction, got {:?}", other),
    }

    let usage = context
        .engine
        .get_current_usage(&context.tenant, &usage_query(&charge))
        .await
        .expect("Failed to read usage");
    assert_eq!(usage.current_aggregation, dec!(40), "First write should stand");
}

#[test_log::test(tokio::test)]
async fn test_invalid_event_does_not_block_batch() {
    let context = TestContext::new().await;
    let charge = tokens_subscription(&context).await;

    let mut missing_code = event("sub_acme", "tx_2", "tokens", &[], april(3, 0));
    missing_code.code = None;
    let batch = vec![
        event("sub_acme", "tx_1", "tokens", &[("tokens", number(5))], april(3, 0)),
        missing_code,
        event("sub_acme", "tx_3", "tokens", &[("tokens", number(7))], april(4, 0)),
    ];

    let results = context.engine.ingest_batch(&context.tenant, batch).await;
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(BillingError::ValidationError { ref field, .. }) if field == "code"
    ));
    assert!(results[2].is_ok());

    let usage = context
        .engine
        .get_current_usage(&context.tenant, &usage_query(&charge))
        .await
        .expect("Failed to read usage");
    assert_eq!(usage.current_aggregation, dec!(12));
    assert_eq!(context.engine.metrics().ingested_count("accepted"), 2);
}

#[test_log::test(tokio::test)]
async fn test_event_for_unknown_subscription_is_still_stored() {
    let context = TestContext::new().await;
    tokens_subscription(&context).await;

    let outcome = context
        .ingest("sub_unknown", "tx_1", "tokens", &[("tokens", number(3))], april(2, 0))
        .await;

    assert!(
        matches!(outcome, IngestOutcome::Accepted { .. }),
        "Events are accepted before their subscription is known"
    );
}
