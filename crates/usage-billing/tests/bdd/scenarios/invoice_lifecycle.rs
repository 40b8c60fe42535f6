use crate::bdd::{april, date, number, request, TestContext};
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use usage_billing::domain::invoices::CreditNoteReason;
use usage_billing::domain::{
    AggregationType, AppliedCoupon, Charge, ChargeModel, Coupon, CouponFrequency, CouponKind,
    InvoiceStatus, InvoicingReason, Plan, StaticTaxRates, Subscription,
};
use usage_billing::BillingError;

/// Plan charging $1 per token, customer "acme" on "sub_acme" since April 1st
async fn token_plan(context: &TestContext, grace_days: u32) -> (Plan, Subscription) {
    let metric = context
        .create_metric("tokens", AggregationType::Sum, Some("tokens"))
        .await;
    let mut plan = context.plan("tokens", 0);
    plan.charges.push(Charge::new(
        context.organization_id(),
        plan.id,
        metric.id,
        ChargeModel::Standard { amount: dec!(1) },
    ));
    context.save_plan(&plan).await;

    let customer = context.create_customer("acme", grace_days).await;
    let subscription = context
        .subscribe("sub_acme", &customer, &plan, april(1, 0))
        .await;
    (plan, subscription)
}

#[test_log::test(tokio::test)]
async fn test_concurrent_generation_yields_one_invoice() {
    let context = TestContext::new().await;
    let (_, subscription) = token_plan(&context, 0).await;
    context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(4))], april(2, 0))
        .await;

    let periodic = request(
        &subscription,
        date(4, 1),
        date(5, 1),
        InvoicingReason::SubscriptionPeriodic,
    );
    let results = context
        .engine
        .generate_invoices(&context.tenant, vec![periodic, periodic, periodic])
        .await;

    let ids: Vec<_> = results
        .into_iter()
        .map(|r| r.expect("Generation should succeed").id)
        .collect();
    assert!(ids.iter().all(|id| *id == ids[0]), "All callers see one invoice");

    let links = context
        .repos()
        .invoices
        .list_links(&subscription.id)
        .await
        .expect("Failed to list invoice links");
    assert_eq!(links.len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_coupon_and_tax_totals() {
    let taxes = StaticTaxRates::new().with_rate("vat_fr", "VAT", dec!(20));
    let context = TestContext::with_taxes(taxes).await;
    let (_, subscription) = token_plan(&context, 0).await;

    let mut customer = context
        .repos()
        .catalog
        .get_customer(&subscription.customer_id)
        .await
        .expect("Failed to load customer")
        .expect("Customer should exist");
    customer.tax_codes = vec!["vat_fr".to_string()];
    context.save_customer(&customer).await;

    let coupon = Coupon::new(
        context.organization_id(),
        "welcome",
        CouponKind::FixedAmount { amount_cents: 200 },
        CouponFrequency::Once,
    );
    context
        .repos()
        .catalog
        .save_coupon(&coupon)
        .await
        .expect("Failed to save coupon");
    context
        .repos()
        .catalog
        .save_applied_coupon(&AppliedCoupon::new(&coupon, customer.id))
        .await
        .expect("Failed to apply coupon");

    context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(10))], april(2, 0))
        .await;
    let invoice = context
        .invoice(&subscription, date(4, 1), date(5, 1), InvoicingReason::SubscriptionPeriodic)
        .await;

    assert_eq!(invoice.totals.fees_amount_cents, 1_000);
    assert_eq!(invoice.totals.coupons_amount_cents, 200);
    assert_eq!(invoice.totals.taxes_amount_cents, 160, "20% of the discounted 800");
    assert_eq!(invoice.totals.total_amount_cents, 960);
    assert!(invoice.totals.is_balanced());

    let applied = context
        .repos()
        .catalog
        .list_applied_coupons(&customer.id)
        .await
        .expect("Failed to list applied coupons");
    assert!(
        applied.iter().all(|(applied, _)| !applied.is_active()),
        "A once coupon is used up by the finalized invoice"
    );
}

#[test_log::test(tokio::test)]
async fn test_credit_note_refunds_to_wallet() {
    let context = TestContext::new().await;
    let (_, subscription) = token_plan(&context, 0).await;
    let customer = context
        .repos()
        .catalog
        .get_customer(&subscription.customer_id)
        .await
        .expect("Failed to load customer")
        .expect("Customer should exist");
    let wallet = context.create_wallet(&customer, dec!(0)).await;

    context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(10))], april(2, 0))
        .await;
    let invoice = context
        .invoice(&subscription, date(4, 1), date(5, 1), InvoicingReason::SubscriptionPeriodic)
        .await;
    assert_eq!(invoice.status, InvoiceStatus::Finalized);

    context
        .engine
        .issue_credit_note(
            &context.tenant,
            &invoice.id,
            400,
            CreditNoteReason::ProductUnsatisfactory,
            Some(wallet.id),
        )
        .await
        .expect("Failed to issue credit note");

    assert_eq!(context.get_wallet(&wallet).await.credits_balance, dec!(4));
    assert_eq!(context.get_invoice(&invoice).await.credited_amount_cents, 400);

    let too_much = context
        .engine
        .issue_credit_note(
            &context.tenant,
            &invoice.id,
            700,
            CreditNoteReason::Other,
            None,
        )
        .await;
    assert!(
        matches!(too_much, Err(BillingError::ValidationError { .. })),
        "Only 600 cents remain creditable"
    );
}

#[test_log::test(tokio::test)]
async fn test_voided_invoice_cannot_be_credited() {
    let context = TestContext::new().await;
    let (_, subscription) = token_plan(&context, 0).await;
    context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(3))], april(2, 0))
        .await;
    let invoice = context
        .invoice(&subscription, date(4, 1), date(5, 1), InvoicingReason::SubscriptionPeriodic)
        .await;

    let voided = context
        .engine
        .void_invoice(&context.tenant, &invoice.id)
        .await
        .expect("Failed to void invoice");
    assert_eq!(voided.status, InvoiceStatus::Voided);

    let credit = context
        .engine
        .issue_credit_note(&context.tenant, &invoice.id, 100, CreditNoteReason::Other, None)
        .await;
    assert!(matches!(credit, Err(BillingError::InvalidState { .. })));
}

#[test_log::test(tokio::test)]
async fn test_one_failing_subscription_does_not_block_others() {
    let context = TestContext::new().await;
    let (plan, healthy) = token_plan(&context, 0).await;

    let orphan = context.create_customer("orphan", 0).await;
    let mut broken = context
        .subscribe("sub_orphan", &orphan, &plan, april(1, 0))
        .await;
    broken.plan_id = context.plan("deleted", 0).id;
    context
        .repos()
        .catalog
        .save_subscription(&broken)
        .await
        .expect("Failed to save subscription");

    let results = context
        .engine
        .generate_invoices(
            &context.tenant,
            vec![
                request(&healthy, date(4, 1), date(5, 1), InvoicingReason::SubscriptionPeriodic),
                request(&broken, date(4, 1), date(5, 1), InvoicingReason::SubscriptionPeriodic),
            ],
        )
        .await;

    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(BillingError::InvoiceGenerationFailure { .. })
    ));

    let details = context
        .repos()
        .usage
        .list_error_details(context.organization_id(), None)
        .await
        .expect("Failed to list error details");
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].code, "not_found");
}

#[test_log::test(tokio::test)]
async fn test_draft_is_finalized_on_demand() {
    let context = TestContext::new().await;
    let (_, subscription) = token_plan(&context, 3).await;
    context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(6))], april(2, 0))
        .await;

    let draft = context
        .invoice(&subscription, date(4, 1), date(5, 1), InvoicingReason::SubscriptionPeriodic)
        .await;
    assert_eq!(draft.status, InvoiceStatus::Draft);
    assert_eq!(draft.number, None);

    let finalized = context
        .engine
        .finalize_invoice(&context.tenant, &draft.id)
        .await
        .expect("Failed to finalize draft");
    assert_eq!(finalized.status, InvoiceStatus::Finalized);
    assert_eq!(finalized.number.as_deref(), Some("INV-000001"));
    assert_eq!(finalized.totals.total_amount_cents, 600);
}

#[test_log::test(tokio::test)]
async fn test_oversized_coupon_keeps_its_remainder() {
    let context = TestContext::new().await;
    let (_, subscription) = token_plan(&context, 0).await;
    let coupon = Coupon::new(
        context.organization_id(),
        "big_welcome",
        CouponKind::FixedAmount { amount_cents: 2_500 },
        CouponFrequency::Once,
    );
    let applied = AppliedCoupon::new(&coupon, subscription.customer_id);
    context
        .repos()
        .catalog
        .save_coupon(&coupon)
        .await
        .expect("Failed to save coupon");
    context
        .repos()
        .catalog
        .save_applied_coupon(&applied)
        .await
        .expect("Failed to apply coupon");

    context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(10))], april(2, 0))
        .await;
    let invoice = context
        .invoice(&subscription, date(4, 1), date(5, 1), InvoicingReason::SubscriptionPeriodic)
        .await;

    assert_eq!(invoice.totals.coupons_amount_cents, 1_000);
    assert_eq!(invoice.totals.total_amount_cents, 0);
    let credited: i64 = invoice.coupon_credits.iter().map(|c| c.amount_cents).sum();
    assert_eq!(credited, 1_000);

    let (stored, _) = context
        .repos()
        .catalog
        .list_applied_coupons(&subscription.customer_id)
        .await
        .expect("Failed to list applied coupons")
        .into_iter()
        .find(|(a, _)| a.id == applied.id)
        .expect("Applied coupon should exist");
    assert!(stored.is_active());
    assert_eq!(stored.amount_cents_remaining, Some(1_500));
}
