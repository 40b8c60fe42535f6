use crate::bdd::{april, date, number, TestContext};
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use usage_billing::domain::{
    AggregationType, Charge, ChargeModel, FeeKind, InvoicingReason, PricingRange,
};

fn tiers() -> Vec<PricingRange> {
    vec![
        PricingRange {
            from_value: dec!(0),
            to_value: Some(dec!(10)),
            per_unit_amount: dec!(1),
            flat_amount: Decimal::ZERO,
        },
        PricingRange {
            from_value: dec!(10),
            to_value: None,
            per_unit_amount: dec!(0.5),
            flat_amount: Decimal::ZERO,
        },
    ]
}

#[test_log::test(tokio::test)]
async fn test_graduated_and_volume_price_the_same_usage_differently() {
    let context = TestContext::new().await;
    let metric = context
        .create_metric("requests", AggregationType::Sum, Some("count"))
        .await;
    let mut plan = context.plan("tiered", 0);
    let graduated = Charge::new(
        context.organization_id(),
        plan.id,
        metric.id,
        ChargeModel::Graduated { ranges: tiers() },
    );
    let volume = Charge::new(
        context.organization_id(),
        plan.id,
        metric.id,
        ChargeModel::Volume { ranges: tiers() },
    );
    plan.charges.push(graduated.clone());
    plan.charges.push(volume.clone());
    context.save_plan(&plan).await;

    let customer = context.create_customer("acme", 0).await;
    let subscription = context
        .subscribe("sub_acme", &customer, &plan, april(1, 0))
        .await;
    context
        .ingest("sub_acme", "tx_1", "requests", &[("count", number(15))], april(12, 0))
        .await;

    let invoice = context
        .invoice(&subscription, date(4, 1), date(5, 1), InvoicingReason::SubscriptionPeriodic)
        .await;
    let fees = context.invoice_fees(&invoice).await;
    let amount_for = |charge: &Charge| {
        fees.iter()
            .find(|f| f.charge_id() == Some(charge.id))
            .map(|f| f.amount_cents)
    };

    assert_eq!(amount_for(&graduated), Some(1_250), "10 x $1 + 5 x $0.50");
    assert_eq!(amount_for(&volume), Some(750), "15 x $0.50");
    assert_eq!(invoice.totals.fees_amount_cents, 2_000);
    assert!(invoice.totals.is_balanced());
}

#[test_log::test(tokio::test)]
async fn test_package_pricing_rounds_up_after_free_units() {
    let context = TestContext::new().await;
    let metric = context
        .create_metric("messages", AggregationType::Sum, Some("count"))
        .await;
    let mut plan = context.plan("packages", 0);
    let charge = Charge::new(
        context.organization_id(),
        plan.id,
        metric.id,
        ChargeModel::Package {
            amount: dec!(5),
            package_size: 10,
            free_units: 3,
        },
    );
    plan.charges.push(charge.clone());
    context.save_plan(&plan).await;

    let customer = context.create_customer("acme", 0).await;
    let subscription = context
        .subscribe("sub_acme", &customer, &plan, april(1, 0))
        .await;
    context
        .ingest("sub_acme", "tx_1", "messages", &[("count", number(23))], april(3, 0))
        .await;

    let invoice = context
        .invoice(&subscription, date(4, 1), date(5, 1), InvoicingReason::SubscriptionPeriodic)
        .await;
    let fees = context.invoice_fees(&invoice).await;
    let fee = fees
        .iter()
        .find(|f| f.charge_id() == Some(charge.id))
        .expect("Charge fee should be billed");

    assert_eq!(fee.amount_cents, 1_000, "20 paying units make two packages of $5");
    assert_eq!(fee.units, dec!(23));
}

#[test_log::test(tokio::test)]
async fn test_terminated_subscription_prorates_plan_fee() {
    let context = TestContext::new().await;
    let plan = context.plan("seat", 3_000);
    context.save_plan(&plan).await;
    let customer = context.create_customer("acme", 0).await;
    let subscription = context
        .subscribe("sub_acme", &customer, &plan, date(6, 1))
        .await;

    let invoice = context
        .engine
        .terminate_subscription(&context.tenant, &subscription.id, date(6, 11))
        .await
        .expect("Failed to terminate subscription")
        .expect("Termination should bill the last period");

    let fees = context.invoice_fees(&invoice).await;
    let subscription_fee = fees
        .iter()
        .find(|f| matches!(f.kind, FeeKind::Subscription { .. }))
        .expect("Plan fee should be billed");
    assert_eq!(subscription_fee.amount_cents, 1_000, "10 of 30 days of $30");
    assert_eq!(invoice.invoicing_reason, InvoicingReason::SubscriptionTerminating);
}

#[test_log::test(tokio::test)]
async fn test_pay_in_advance_charge_is_not_billed_twice() {
    let context = TestContext::new().await;
    let metric = context
        .create_metric("deployments", AggregationType::Sum, Some("count"))
        .await;
    let mut plan = context.plan("deploys", 0);
    let charge = Charge::new(
        context.organization_id(),
        plan.id,
        metric.id,
        ChargeModel::Standard { amount: dec!(2) },
    )
    .pay_in_advance(true);
    plan.charges.push(charge.clone());
    context.save_plan(&plan).await;

    let customer = context.create_customer("acme", 0).await;
    let subscription = context
        .subscribe("sub_acme", &customer, &plan, april(1, 0))
        .await;
    context
        .ingest("sub_acme", "tx_1", "deployments", &[("count", number(5))], april(8, 0))
        .await;

    let in_advance = context
        .invoice(&subscription, date(4, 1), date(5, 1), InvoicingReason::InAdvanceCharge)
        .await;
    assert_eq!(in_advance.totals.fees_amount_cents, 1_000);

    let periodic = context
        .invoice(&subscription, date(4, 1), date(5, 1), InvoicingReason::SubscriptionPeriodic)
        .await;
    let charge_fees: Vec<_> = context
        .invoice_fees(&periodic)
        .await
        .into_iter()
        .filter(|f| f.charge_id() == Some(charge.id))
        .collect();
    assert!(
        charge_fees.is_empty(),
        "Usage already billed in advance must not reappear on the periodic invoice"
    );
    assert_eq!(periodic.totals.fees_amount_cents, 0);
}

#[test_log::test(tokio::test)]
async fn test_late_in_advance_fee_rolls_into_next_invoice() {
    let context = TestContext::new().await;
    let metric = context
        .create_metric("deployments", AggregationType::Sum, Some("count"))
        .await;
    let mut plan = context.plan("deploys", 0);
    let charge = Charge::new(
        context.organization_id(),
        plan.id,
        metric.id,
        ChargeModel::Standard { amount: dec!(2) },
    )
    .pay_in_advance(true);
    plan.charges.push(charge.clone());
    context.save_plan(&plan).await;

    let customer = context.create_customer("acme", 0).await;
    let subscription = context
        .subscribe("sub_acme", &customer, &plan, april(1, 0))
        .await;
    let april_invoice = context
        .invoice(&subscription, date(4, 1), date(5, 1), InvoicingReason::SubscriptionPeriodic)
        .await;
    assert_eq!(april_invoice.totals.fees_amount_cents, 0);

    context
        .ingest("sub_acme", "tx_late", "deployments", &[("count", number(3))], april(20, 0))
        .await;

    let may_invoice = context
        .invoice(&subscription, date(5, 1), date(6, 1), InvoicingReason::SubscriptionPeriodic)
        .await;
    let late: Vec<_> = context
        .invoice_fees(&may_invoice)
        .await
        .into_iter()
        .filter(|f| f.charge_id() == Some(charge.id))
        .collect();
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].amount_cents, 600);
    assert_eq!(late[0].properties_from, date(4, 1), "Fee keeps the period of its event");
    assert_eq!(may_invoice.totals.fees_amount_cents, 600);
}
