use crate::bdd::{april, date, number, request, FlakyWallets, TestContext};
use futures::future::join_all;
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use usage_billing::domain::wallets::{TransactionSource, TransactionStatus};
use usage_billing::domain::{
    AggregationType, Charge, ChargeModel, ConsumeOutcome, Customer, InvoiceStatus,
    InvoicingReason, Subscription,
};
use usage_billing::storage::Repositories;
use usage_billing::BillingError;

async fn token_customer(context: &TestContext) -> (Customer, Subscription) {
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

    let customer = context.create_customer("acme", 0).await;
    let subscription = context
        .subscribe("sub_acme", &customer, &plan, april(1, 0))
        .await;
    (customer, subscription)
}

#[test_log::test(tokio::test)]
async fn test_prepaid_credits_reduce_amount_due() {
    let context = TestContext::new().await;
    let (customer, subscription) = token_customer(&context).await;
    let wallet = context.create_wallet(&customer, dec!(5)).await;

    context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(8))], april(4, 0))
        .await;
    let invoice = context
        .invoice(&subscription, date(4, 1), date(5, 1), InvoicingReason::SubscriptionPeriodic)
        .await;

    assert_eq!(invoice.totals.fees_amount_cents, 800);
    assert_eq!(invoice.totals.prepaid_credit_amount_cents, 500);
    assert_eq!(invoice.totals.total_amount_cents, 300);
    assert!(invoice.totals.is_balanced());
    assert_eq!(context.get_wallet(&wallet).await.credits_balance, Decimal::ZERO);

    let transactions = context
        .repos()
        .wallets
        .list_transactions(&wallet.id)
        .await
        .expect("Failed to list transactions");
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].invoice_id, Some(invoice.id));
}

#[test_log::test(tokio::test)]
async fn test_concurrent_consumption_never_overdraws() {
    let context = TestContext::new().await;
    let (customer, _) = token_customer(&context).await;
    let wallet = context.create_wallet(&customer, dec!(10)).await;
    let ledger = context.engine.wallet_ledger();

    let results = join_all((0..20).map(|_| ledger.consume(&wallet.id, 100, None))).await;

    let consumed: i64 = results
        .iter()
        .filter_map(|r| match r {
            Ok(ConsumeOutcome::Consumed { amount_cents, .. }) => Some(*amount_cents),
            _ => None,
        })
        .sum();
    assert!(consumed <= 1_000, "Consumed {} cents from a 1000 cent wallet", consumed);

    let balance = context.get_wallet(&wallet).await.credits_balance;
    assert!(balance >= Decimal::ZERO, "Balance went negative: {}", balance);
    assert_eq!(balance, Decimal::from(1_000 - consumed) / dec!(100));
}

#[test_log::test(tokio::test)]
async fn test_paid_top_up_waits_for_settlement() {
    let context = TestContext::new().await;
    let (customer, _) = token_customer(&context).await;
    let wallet = context.create_wallet(&customer, Decimal::ZERO).await;
    let ledger = context.engine.wallet_ledger();

    let transactions = ledger
        .top_up(&wallet.id, dec!(20), dec!(5), TransactionSource::Manual)
        .await
        .expect("Failed to top up wallet");
    assert_eq!(transactions.len(), 2);
    assert_eq!(
        context.get_wallet(&wallet).await.credits_balance,
        dec!(5),
        "Granted credits land immediately"
    );

    let paid = transactions
        .iter()
        .find(|t| !t.granted)
        .expect("Paid transaction should be recorded");
    assert_eq!(paid.status, TransactionStatus::Pending);

    let settled = ledger
        .settle_transaction(&paid.id)
        .await
        .expect("Failed to settle transaction");
    assert_eq!(settled.status, TransactionStatus::Settled);
    assert_eq!(context.get_wallet(&wallet).await.credits_balance, dec!(25));
}

#[test_log::test(tokio::test)]
async fn test_wallet_failure_during_finalization_is_recovered() {
    let wallets = Arc::new(FlakyWallets::default());
    let mut repos = Repositories::in_memory();
    repos.wallets = wallets.clone();
    let context = TestContext::with_repositories(repos).await;
    let (customer, subscription) = token_customer(&context).await;

    let first = context.create_wallet(&customer, dec!(3)).await;
    let mut second = context.create_wallet(&customer, dec!(50)).await;
    second.priority = first.priority + 10;
    second = context
        .repos()
        .wallets
        .update_wallet(&second)
        .await
        .expect("Failed to reprioritize wallet");

    context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(10))], april(4, 0))
        .await;
    let periodic = request(
        &subscription,
        date(4, 1),
        date(5, 1),
        InvoicingReason::SubscriptionPeriodic,
    );

    wallets.break_wallet(second.id);
    let failed = context.engine.generate_invoice(&context.tenant, periodic).await;
    assert!(matches!(
        failed,
        Err(BillingError::InvoiceGenerationFailure { .. })
    ));
    assert_eq!(
        context.get_wallet(&first).await.credits_balance,
        dec!(3),
        "Credits taken before the failure are given back"
    );

    wallets.repair();
    let report = context.refresh().await;
    assert_eq!(report.invoices_finalized, 1);
    assert_eq!(report.failed, 0);

    let invoice = context
        .engine
        .generate_invoice(&context.tenant, periodic)
        .await
        .expect("Invoice should exist after recovery");
    assert_eq!(invoice.status, InvoiceStatus::Finalized);
    assert_eq!(invoice.totals.prepaid_credit_amount_cents, 1_000);
    assert_eq!(invoice.totals.total_amount_cents, 0);
    assert_eq!(invoice.wallet_transaction_ids.len(), 2);
    assert_eq!(context.get_wallet(&first).await.credits_balance, Decimal::ZERO);
    assert_eq!(context.get_wallet(&second).await.credits_balance, dec!(43));
}

#[test_log::test(tokio::test)]
async fn test_retrying_generation_finishes_interrupted_invoice() {
    let wallets = Arc::new(FlakyWallets::default());
    let mut repos = Repositories::in_memory();
    repos.wallets = wallets.clone();
    let context = TestContext::with_repositories(repos).await;
    let (customer, subscription) = token_customer(&context).await;
    let wallet = context.create_wallet(&customer, dec!(4)).await;

    context
        .ingest("sub_acme", "tx_1", "tokens", &[("tokens", number(10))], april(4, 0))
        .await;
    let periodic = request(
        &subscription,
        date(4, 1),
        date(5, 1),
        InvoicingReason::SubscriptionPeriodic,
    );

    wallets.break_wallet(wallet.id);
    assert!(context
        .engine
        .generate_invoice(&context.tenant, periodic)
        .await
        .is_err());

    wallets.repair();
    let invoice = context
        .engine
        .generate_invoice(&context.tenant, periodic)
        .await
        .expect("Retry should finalize the pending draft");
    assert_eq!(invoice.status, InvoiceStatus::Finalized);
    assert_eq!(invoice.number.as_deref(), Some("INV-000001"));
    assert_eq!(invoice.totals.prepaid_credit_amount_cents, 400);
    assert_eq!(invoice.totals.total_amount_cents, 600);
}
