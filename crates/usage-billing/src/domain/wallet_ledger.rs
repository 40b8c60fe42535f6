use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::WalletConfig;
use crate::domain::types::{CustomerId, InvoiceId, WalletId, WalletTransactionId};
use crate::domain::wallets::{
    RuleTrigger, TransactionDirection, TransactionSource, Wallet, WalletTransaction,
};
use crate::error::{BillingError, Result};
use crate::storage::WalletRepository;
use crate::telemetry::EngineMetrics;

/// Result of consuming prepaid credits
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    /// `amount_cents` may be lower than requested when the balance ran short
    Consumed {
        amount_cents: i64,
        transaction: WalletTransaction,
    },
    InsufficientBalance,
}

/// Credits consumed across a customer's wallets for one invoice
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalletApplication {
    pub amount_cents: i64,
    pub transaction_ids: Vec<WalletTransactionId>,
}

pub struct WalletLedger {
    wallets: Arc<dyn WalletRepository>,
    config: WalletConfig,
    metrics: Arc<EngineMetrics>,
}

impl WalletLedger {
    pub fn new(
        wallets: Arc<dyn WalletRepository>,
        config: WalletConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            wallets,
            config,
            metrics,
        }
    }

    async fn load(&self, wallet_id: &WalletId) -> Result<Wallet> {
        self.wallets
            .get_wallet(wallet_id)
            .await?
            .ok_or_else(|| BillingError::not_found("wallet", wallet_id))
    }

    /// Reads the wallet, applies `mutate` and writes it back, retrying with
    /// backoff while the stored version moves underneath. `mutate` returning
    /// `None` skips the write.
    async fn update_with_retry<T, F>(
        &self,
        wallet_id: &WalletId,
        mut mutate: F,
    ) -> Result<Option<(Wallet, T)>>
    where
        F: FnMut(&mut Wallet) -> Result<Option<T>> + Send,
        T: Send,
    {
        let attempts = self.config.max_retries + 1;
        for attempt in 0..attempts {
            let mut wallet = self.load(wallet_id).await?;
            let Some(outcome) = mutate(&mut wallet)? else {
                return Ok(None);
            };
            match self.wallets.update_wallet(&wallet).await {
                Ok(stored) => return Ok(Some((stored, outcome))),
                Err(BillingError::VersionConflict { found, .. }) => {
                    self.metrics.record_wallet_conflict();
                    warn!(
                        "Wallet {} version moved to {} during update (attempt {}/{})",
                        wallet_id,
                        found,
                        attempt + 1,
                        attempts
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.config.backoff_for(attempt)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(BillingError::ConcurrentWalletConflict {
            wallet_id: wallet_id.to_string(),
            attempts,
        })
    }

    /// Consumes up to `amount_cents` from the wallet; never overdraws
    pub async fn consume(
        &self,
        wallet_id: &WalletId,
        amount_cents: i64,
        invoice_id: Option<InvoiceId>,
    ) -> Result<ConsumeOutcome> {
        if amount_cents <= 0 {
            return Err(BillingError::validation(
                "amount_cents",
                "must be positive",
            ));
        }

        let now = Utc::now();
        let updated = self
            .update_with_retry(wallet_id, |wallet| {
                let available = wallet.balance_cents();
                if !wallet.is_active() || available <= 0 {
                    return Ok(None);
                }
                let consumed_cents = amount_cents.min(available);
                let credits = wallet
                    .cents_to_credits(Decimal::from(consumed_cents))
                    .min(wallet.credits_balance);
                wallet.debit(credits, now);
                Ok(Some((consumed_cents, credits)))
            })
            .await?;

        let Some((wallet, (consumed_cents, credits))) = updated else {
            debug!("Wallet {} has no balance to consume", wallet_id);
            return Ok(ConsumeOutcome::InsufficientBalance);
        };

        let mut transaction = WalletTransaction::new(
            &wallet,
            TransactionDirection::Outbound,
            TransactionSource::Invoice,
            credits,
            false,
        );
        transaction.invoice_id = invoice_id;
        transaction.settle(now)?;
        self.wallets.create_transaction(&transaction).await?;

        info!(
            "Consumed {} cents ({} credits) from wallet {}, balance now {}",
            consumed_cents, credits, wallet.id, wallet.credits_balance
        );

        self.apply_threshold_rules(&wallet).await?;

        Ok(ConsumeOutcome::Consumed {
            amount_cents: consumed_cents,
            transaction,
        })
    }

    /// Deducts up to `amount_cents` from the customer's active wallets in
    /// `currency`, lowest priority number first. All or nothing: when one
    /// wallet fails, credits already taken from the others are restored.
    pub async fn apply_to_invoice(
        &self,
        customer_id: &CustomerId,
        currency: &str,
        amount_cents: i64,
        invoice_id: InvoiceId,
    ) -> Result<WalletApplication> {
        let mut application = WalletApplication::default();
        if amount_cents <= 0 {
            return Ok(application);
        }

        for wallet in self.wallets.list_wallets(customer_id).await? {
            let remaining = amount_cents - application.amount_cents;
            if remaining <= 0 {
                break;
            }
            if !wallet.is_active() || wallet.currency.code != currency {
                continue;
            }
            match self.consume(&wallet.id, remaining, Some(invoice_id)).await {
                Ok(ConsumeOutcome::Consumed {
                    amount_cents,
                    transaction,
                }) => {
                    application.amount_cents += amount_cents;
                    application.transaction_ids.push(transaction.id);
                }
                Ok(ConsumeOutcome::InsufficientBalance) => {}
                Err(e) => {
                    warn!(
                        "Wallet {} failed while paying invoice {}: {}",
                        wallet.id, invoice_id, e
                    );
                    if let Err(restore) = self.reverse_application(&application).await {
                        error!(
                            "Failed to restore credits taken for invoice {}: {}",
                            invoice_id, restore
                        );
                    }
                    return Err(e);
                }
            }
        }

        Ok(application)
    }

    /// Gives back the credits of an application that did not end up on a
    /// finalized invoice, recording a settled inbound transaction per wallet
    pub async fn reverse_application(&self, application: &WalletApplication) -> Result<()> {
        let now = Utc::now();
        for transaction_id in &application.transaction_ids {
            let consumed = self
                .wallets
                .get_transaction(transaction_id)
                .await?
                .ok_or_else(|| BillingError::not_found("wallet_transaction", transaction_id))?;
            let credits = consumed.credit_amount;

            let Some((wallet, ())) = self
                .update_with_retry(&consumed.wallet_id, |wallet| {
                    wallet.restore(credits, now);
                    Ok(Some(()))
                })
                .await?
            else {
                continue;
            };

            let mut refund = WalletTransaction::new(
                &wallet,
                TransactionDirection::Inbound,
                TransactionSource::Invoice,
                credits,
                false,
            );
            refund.invoice_id = consumed.invoice_id;
            refund.settle(now)?;
            self.wallets.create_transaction(&refund).await?;
            info!(
                "Restored {} credits to wallet {}, balance now {}",
                credits, wallet.id, wallet.credits_balance
            );
        }
        Ok(())
    }

    /// Granted credits land immediately; paid credits wait for settlement
    pub async fn top_up(
        &self,
        wallet_id: &WalletId,
        paid_credits: Decimal,
        granted_credits: Decimal,
        source: TransactionSource,
    ) -> Result<Vec<WalletTransaction>> {
        if paid_credits < Decimal::ZERO || granted_credits < Decimal::ZERO {
            return Err(BillingError::validation("credits", "must not be negative"));
        }

        let wallet = self.load(wallet_id).await?;
        if !wallet.is_active() {
            return Err(BillingError::InvalidState {
                message: format!("wallet {} is terminated", wallet_id),
            });
        }

        let mut transactions = Vec::new();
        if granted_credits > Decimal::ZERO {
            let now = Utc::now();
            self.update_with_retry(wallet_id, |wallet| {
                wallet.credit(granted_credits, now);
                Ok(Some(()))
            })
            .await?;
            let mut granted = WalletTransaction::new(
                &wallet,
                TransactionDirection::Inbound,
                source,
                granted_credits,
                true,
            );
            granted.settle(now)?;
            self.wallets.create_transaction(&granted).await?;
            transactions.push(granted);
        }

        if paid_credits > Decimal::ZERO {
            let paid = WalletTransaction::new(
                &wallet,
                TransactionDirection::Inbound,
                source,
                paid_credits,
                false,
            );
            self.wallets.create_transaction(&paid).await?;
            transactions.push(paid);
        }

        info!(
            "Topped up wallet {}: {} paid (pending), {} granted",
            wallet_id, paid_credits, granted_credits
        );
        Ok(transactions)
    }

    /// Settles a pending transaction; inbound credits reach the balance here
    pub async fn settle_transaction(
        &self,
        transaction_id: &WalletTransactionId,
    ) -> Result<WalletTransaction> {
        let mut transaction = self
            .wallets
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| BillingError::not_found("wallet_transaction", transaction_id))?;
        let now = Utc::now();
        transaction.settle(now)?;

        if transaction.direction == TransactionDirection::Inbound {
            let credits = transaction.credit_amount;
            self.update_with_retry(&transaction.wallet_id, |wallet| {
                wallet.credit(credits, now);
                Ok(Some(()))
            })
            .await?;
        }

        self.wallets.update_transaction(&transaction).await?;
        info!(
            "Settled wallet transaction {} for {} credits",
            transaction.id, transaction.credit_amount
        );
        Ok(transaction)
    }

    async fn apply_threshold_rules(&self, wallet: &Wallet) -> Result<()> {
        for rule in &wallet.recurring_rules {
            if !rule.is_threshold_triggered(wallet.credits_balance) {
                continue;
            }
            let (paid, granted) = rule.credits_for(wallet.credits_balance);
            if paid.is_zero() && granted.is_zero() {
                continue;
            }
            info!(
                "Wallet {} fell below threshold, applying rule {}",
                wallet.id, rule.id
            );
            self.top_up(&wallet.id, paid, granted, TransactionSource::Threshold)
                .await?;
        }
        Ok(())
    }

    /// Runs interval top-up rules that are due; returns how many fired
    pub async fn run_interval_rules(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut fired = 0;
        for wallet in self.wallets.list_wallets_with_interval_rules().await? {
            // Advance the schedule first so a concurrent runner cannot fire twice
            let claimed = self
                .update_with_retry(&wallet.id, |wallet| {
                    let balance = wallet.credits_balance;
                    let mut due = Vec::new();
                    for rule in wallet.recurring_rules.iter_mut() {
                        if !rule.is_interval_due(now) {
                            continue;
                        }
                        if let RuleTrigger::Interval {
                            interval,
                            next_run_at,
                        } = &mut rule.trigger
                        {
                            while *next_run_at <= now {
                                *next_run_at = interval.advance(*next_run_at)?;
                            }
                            due.push(rule.credits_for(balance));
                        }
                    }
                    Ok((!due.is_empty()).then_some(due))
                })
                .await?;

            let Some((_, due)) = claimed else {
                continue;
            };
            for (paid, granted) in due {
                if paid.is_zero() && granted.is_zero() {
                    continue;
                }
                self.top_up(&wallet.id, paid, granted, TransactionSource::Interval)
                    .await?;
                fired += 1;
            }
        }
        Ok(fired)
    }
}
