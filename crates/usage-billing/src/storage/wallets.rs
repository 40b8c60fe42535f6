use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::types::{CustomerId, WalletId, WalletTransactionId};
use crate::domain::wallets::{RuleTrigger, Wallet, WalletTransaction};
use crate::error::{BillingError, Result};

#[async_trait]
pub trait WalletRepository: Send + Sync {
    async fn get_wallet(&self, id: &WalletId) -> Result<Option<Wallet>>;
    /// Active and terminated wallets of a customer, by ascending priority
    async fn list_wallets(&self, customer_id: &CustomerId) -> Result<Vec<Wallet>>;
    async fn create_wallet(&self, wallet: &Wallet) -> Result<()>;
    /// Stores the wallet if its `version` still matches the stored one and
    /// returns it with the version bumped
    async fn update_wallet(&self, wallet: &Wallet) -> Result<Wallet>;
    async fn list_wallets_with_interval_rules(&self) -> Result<Vec<Wallet>>;

    async fn create_transaction(&self, transaction: &WalletTransaction) -> Result<()>;
    async fn get_transaction(&self, id: &WalletTransactionId)
        -> Result<Option<WalletTransaction>>;
    async fn update_transaction(&self, transaction: &WalletTransaction) -> Result<()>;
    async fn list_transactions(&self, wallet_id: &WalletId) -> Result<Vec<WalletTransaction>>;
}

#[derive(Default)]
pub struct InMemoryWalletRepository {
    wallets: Arc<RwLock<HashMap<WalletId, Wallet>>>,
    transactions: Arc<RwLock<HashMap<WalletTransactionId, WalletTransaction>>>,
}

impl InMemoryWalletRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletRepository for InMemoryWalletRepository {
    async fn get_wallet(&self, id: &WalletId) -> Result<Option<Wallet>> {
        Ok(self.wallets.read().await.get(id).cloned())
    }

    async fn list_wallets(&self, customer_id: &CustomerId) -> Result<Vec<Wallet>> {
        let wallets = self.wallets.read().await;
        let mut list: Vec<Wallet> = wallets
            .values()
            .filter(|w| &w.customer_id == customer_id)
            .cloned()
            .collect();
        list.sort_by_key(|w| (w.priority, w.created_at));
        Ok(list)
    }

    async fn create_wallet(&self, wallet: &Wallet) -> Result<()> {
        wallet.validate()?;
        self.wallets.write().await.insert(wallet.id, wallet.clone());
        Ok(())
    }

    async fn update_wallet(&self, wallet: &Wallet) -> Result<Wallet> {
        let mut wallets = self.wallets.write().await;
        let stored = wallets
            .get_mut(&wallet.id)
            .ok_or_else(|| BillingError::not_found("wallet", wallet.id))?;
        if stored.version != wallet.version {
            return Err(BillingError::VersionConflict {
                entity: "wallet",
                id: wallet.id.to_string(),
                expected: wallet.version,
                found: stored.version,
            });
        }
        let mut updated = wallet.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list_wallets_with_interval_rules(&self) -> Result<Vec<Wallet>> {
        let wallets = self.wallets.read().await;
        Ok(wallets
            .values()
            .filter(|w| w.is_active())
            .filter(|w| {
                w.recurring_rules
                    .iter()
                    .any(|rule| matches!(rule.trigger, RuleTrigger::Interval { .. }))
            })
            .cloned()
            .collect())
    }

    async fn create_transaction(&self, transaction: &WalletTransaction) -> Result<()> {
        self.transactions
            .write()
            .await
            .insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn get_transaction(
        &self,
        id: &WalletTransactionId,
    ) -> Result<Option<WalletTransaction>> {
        Ok(self.transactions.read().await.get(id).cloned())
    }

    async fn update_transaction(&self, transaction: &WalletTransaction) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        match transactions.get_mut(&transaction.id) {
            Some(stored) => {
                *stored = transaction.clone();
                Ok(())
            }
            None => Err(BillingError::not_found("wallet_transaction", transaction.id)),
        }
    }

    async fn list_transactions(&self, wallet_id: &WalletId) -> Result<Vec<WalletTransaction>> {
        let transactions = self.transactions.read().await;
        let mut list: Vec<WalletTransaction> = transactions
            .values()
            .filter(|t| &t.wallet_id == wallet_id)
            .cloned()
            .collect();
        list.sort_by_key(|t| t.created_at);
        Ok(list)
    }
}
