//! Wallet ledger service.
//!
//! Every balance change is a read-modify-write of the whole wallet guarded by
//! the store's compare-and-swap. A conflicting writer causes a reload and a
//! retry, so concurrent credits and withdrawals never lose an update.

use crate::config::WalletSettings;
use crate::domain::escrow::EscrowTransaction;
use crate::domain::money::{Currency, Money};
use crate::domain::wallet::{
    EntryMetadata, PayoutMetadata, PayoutStatus, PayoutTransition, Wallet, WalletTransaction,
};
use crate::domain::ports::WalletStoreBox;
use crate::error::{PaymentError, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub struct WalletLedger {
    store: WalletStoreBox,
    settings: WalletSettings,
}

impl WalletLedger {
    pub fn new(store: WalletStoreBox, settings: WalletSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &WalletSettings {
        &self.settings
    }

    pub async fn wallet(&self, user_id: &str) -> Result<Option<Wallet>> {
        self.store.get(user_id).await
    }

    pub async fn balances(&self, user_id: &str) -> Result<BTreeMap<Currency, Decimal>> {
        Ok(self
            .store
            .get(user_id)
            .await?
            .map(|w| w.balances().clone())
            .unwrap_or_default())
    }

    pub async fn all_wallets(&self) -> Result<Vec<Wallet>> {
        self.store.all().await
    }

    pub async fn find_by_payout_id(&self, payout_id: &str) -> Result<Option<Wallet>> {
        self.store.find_by_payout_id(payout_id).await
    }

    /// Applies `mutate` to the latest stored wallet, creating it on first use.
    ///
    /// An error from `mutate` aborts without writing. A wallet `mutate` left
    /// unchanged is not written either.
    pub async fn update<T, F>(&self, user_id: &str, mut mutate: F) -> Result<(Wallet, T)>
    where
        F: FnMut(&mut Wallet) -> Result<T>,
    {
        let attempts = self.settings.update_attempts();
        for attempt in 1..=attempts {
            let stored = self.store.get(user_id).await?;
            let expected = stored.as_ref().map_or(0, |w| w.version);
            let original = stored.unwrap_or_else(|| Wallet::new(user_id, Utc::now()));
            let mut wallet = original.clone();
            let out = mutate(&mut wallet)?;
            if wallet == original {
                return Ok((wallet, out));
            }
            match self.store.compare_and_swap(wallet, expected).await {
                Ok(saved) => return Ok((saved, out)),
                Err(PaymentError::Conflict(reason)) => {
                    debug!(user_id, attempt, %reason, "wallet write conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(PaymentError::Conflict(format!(
            "wallet {user_id} still contended after {attempts} attempts"
        )))
    }

    pub async fn credit(
        &self,
        user_id: &str,
        amount: &Money,
        reason: &str,
        metadata: EntryMetadata,
    ) -> Result<String> {
        let (_, entry_id) = self
            .update(user_id, |w| w.credit(amount, reason, metadata.clone(), Utc::now()))
            .await?;
        info!(user_id, %amount, entry_id, "wallet credited");
        Ok(entry_id)
    }

    /// Credits an externally referenced adjustment once per `reference`.
    /// Returns `None` when the reference was already applied.
    pub async fn credit_adjustment(
        &self,
        user_id: &str,
        amount: &Money,
        reference: &str,
    ) -> Result<Option<String>> {
        let (_, entry_id) = self
            .update(user_id, |w| {
                if w.has_adjustment(reference) {
                    return Ok(None);
                }
                let metadata = EntryMetadata::Adjustment {
                    reference: reference.to_string(),
                };
                w.credit(amount, "adjustment", metadata, Utc::now()).map(Some)
            })
            .await?;
        Ok(entry_id)
    }

    /// Releases a completed transaction's proceeds to the seller, keyed by the
    /// transaction id. Returns `None` if they were already released.
    pub async fn credit_sale(&self, txn: &EscrowTransaction) -> Result<Option<String>> {
        let net = Money::new(txn.pricing.seller_net(), txn.pricing.currency.clone());
        if net.amount <= Decimal::ZERO {
            return Err(PaymentError::ValidationError(format!(
                "Transaction {} leaves no proceeds for the seller",
                txn.id
            )));
        }
        let (_, entry_id) = self
            .update(&txn.seller_id, |w| {
                if w.has_sale_credit(txn.id) {
                    return Ok(None);
                }
                let metadata = EntryMetadata::Sale {
                    transaction_id: txn.id,
                };
                w.credit(&net, "sale proceeds", metadata, Utc::now())
                    .map(Some)
            })
            .await?;
        match &entry_id {
            Some(id) => info!(
                transaction_id = %txn.id,
                seller_id = %txn.seller_id,
                amount = %net,
                entry_id = %id,
                "seller credited"
            ),
            None => debug!(transaction_id = %txn.id, "seller already credited"),
        }
        Ok(entry_id)
    }

    /// Debits the wallet into a pending payout entry, enforcing the configured
    /// limits for the currency.
    ///
    /// When `payout.related_transaction` already funds a live payout, or
    /// `payout.payout_id` is already recorded, that entry's id is returned and
    /// nothing is debited.
    pub async fn withdraw(
        &self,
        user_id: &str,
        amount: &Money,
        payout: PayoutMetadata,
    ) -> Result<String> {
        let limits = self.settings.limits_for(&amount.currency).clone();
        let (_, entry_id) = self
            .update(user_id, |w| {
                if let Some(txn_id) = payout.related_transaction
                    && let Some(existing) = w.payout_for_transaction(txn_id)
                {
                    return Ok(existing.id.clone());
                }
                if let Some(payout_id) = &payout.payout_id
                    && let Some(existing) = w.find_payout_entry(payout_id)
                {
                    return Ok(existing.id.clone());
                }
                w.withdraw(amount, &limits, payout.clone(), Utc::now())
            })
            .await?;
        info!(user_id, %amount, entry_id, "withdrawal recorded");
        Ok(entry_id)
    }

    /// Claims the rail call for a pending withdrawal. Returns whether this
    /// caller won, along with the entry as stored.
    pub async fn claim_initiation(
        &self,
        user_id: &str,
        entry_id: &str,
    ) -> Result<(bool, WalletTransaction)> {
        let (wallet, claimed) = self
            .update(user_id, |w| w.claim_initiation(entry_id, Utc::now()))
            .await?;
        let entry = wallet
            .entry(entry_id)
            .cloned()
            .ok_or_else(|| PaymentError::not_found("withdrawal entry", entry_id))?;
        Ok((claimed, entry))
    }

    pub async fn attach_payout_id(&self, user_id: &str, entry_id: &str, payout_id: &str) -> Result<()> {
        self.update(user_id, |w| w.attach_payout_id(entry_id, payout_id))
            .await
            .map(|_| ())
    }

    pub async fn apply_payout_status(
        &self,
        user_id: &str,
        entry_id: &str,
        status: PayoutStatus,
        failure_code: Option<String>,
    ) -> Result<PayoutTransition> {
        let (_, transition) = self
            .update(user_id, |w| {
                w.apply_payout_status(entry_id, status, failure_code.clone(), Utc::now())
            })
            .await?;
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::escrow::EscrowStatus;
    use crate::domain::escrow::tests::sample_transaction;
    use crate::domain::wallet::WithdrawalLimits;
    use crate::infrastructure::in_memory::InMemoryWalletStore;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::new("USD").unwrap())
    }

    fn ledger() -> Arc<WalletLedger> {
        Arc::new(WalletLedger::new(
            Arc::new(InMemoryWalletStore::new()),
            WalletSettings {
                default_limits: WithdrawalLimits {
                    minimum: None,
                    daily: Some(dec!(500)),
                    monthly: None,
                },
                max_update_attempts: Some(64),
                ..WalletSettings::default()
            },
        ))
    }

    fn payout_meta() -> PayoutMetadata {
        PayoutMetadata {
            destination_id: "dest-1".into(),
            rail: "manual".into(),
            payout_id: None,
            status: PayoutStatus::Pending,
            related_transaction: None,
            failure_code: None,
            initiation_claimed_at: None,
        }
    }

    #[tokio::test]
    async fn test_concurrent_credits_are_not_lost() {
        let ledger = ledger();
        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .credit_adjustment("seller", &usd(dec!(5)), &format!("ref-{i}"))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let wallet = ledger.wallet("seller").await.unwrap().unwrap();
        assert_eq!(wallet.balance(&Currency::new("USD").unwrap()), dec!(100));
        assert_eq!(wallet.transactions().len(), 20);
        assert!(wallet.is_consistent());
    }

    #[tokio::test]
    async fn test_sale_credit_is_once_per_transaction() {
        let ledger = ledger();
        let mut txn = sample_transaction();
        txn.transition(EscrowStatus::PaymentProcessing, None, Utc::now())
            .unwrap();
        assert!(ledger.credit_sale(&txn).await.unwrap().is_some());
        assert!(ledger.credit_sale(&txn).await.unwrap().is_none());
        let balances = ledger.balances(&txn.seller_id).await.unwrap();
        assert_eq!(
            balances[&Currency::new("USD").unwrap()],
            txn.pricing.seller_net()
        );
    }

    #[tokio::test]
    async fn test_withdraw_rejections_leave_wallet_untouched() {
        let ledger = ledger();
        ledger
            .credit_adjustment("u1", &usd(dec!(800)), "seed")
            .await
            .unwrap();
        let before = ledger.wallet("u1").await.unwrap().unwrap();

        let over_limit = ledger.withdraw("u1", &usd(dec!(600)), payout_meta()).await;
        assert!(matches!(
            over_limit,
            Err(PaymentError::WithdrawalLimitExceeded { window: "daily", .. })
        ));
        let too_much = ledger.withdraw("u1", &usd(dec!(900)), payout_meta()).await;
        assert!(matches!(too_much, Err(PaymentError::InsufficientFunds { .. })));

        assert_eq!(ledger.wallet("u1").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_payout_reversed_once() {
        let ledger = ledger();
        ledger
            .credit_adjustment("u1", &usd(dec!(100)), "seed")
            .await
            .unwrap();
        let entry = ledger
            .withdraw("u1", &usd(dec!(40)), payout_meta())
            .await
            .unwrap();
        ledger.attach_payout_id("u1", &entry, "po_123").await.unwrap();

        let first = ledger
            .apply_payout_status("u1", &entry, PayoutStatus::Failed, Some("account_closed".into()))
            .await
            .unwrap();
        assert!(matches!(
            first,
            PayoutTransition::Applied {
                reversal_entry_id: Some(_),
                ..
            }
        ));
        let second = ledger
            .apply_payout_status("u1", &entry, PayoutStatus::Failed, None)
            .await
            .unwrap();
        assert_eq!(second, PayoutTransition::Duplicate);

        let wallet = ledger.find_by_payout_id("po_123").await.unwrap().unwrap();
        assert_eq!(wallet.balance(&Currency::new("USD").unwrap()), dec!(100));
        assert!(wallet.is_consistent());
    }

    #[tokio::test]
    async fn test_withdraw_for_transaction_is_idempotent() {
        let ledger = ledger();
        ledger
            .credit_adjustment("u1", &usd(dec!(100)), "seed")
            .await
            .unwrap();
        let txn_id = uuid::Uuid::new_v4();
        let meta = PayoutMetadata {
            related_transaction: Some(txn_id),
            ..payout_meta()
        };
        let a = ledger.withdraw("u1", &usd(dec!(30)), meta.clone()).await.unwrap();
        let b = ledger.withdraw("u1", &usd(dec!(30)), meta).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(
            ledger.balances("u1").await.unwrap()[&Currency::new("USD").unwrap()],
            dec!(70)
        );
    }

    #[tokio::test]
    async fn test_withdraw_with_known_payout_id_debits_once() {
        let ledger = ledger();
        ledger
            .credit_adjustment("u1", &usd(dec!(100)), "seed")
            .await
            .unwrap();
        let meta = PayoutMetadata {
            payout_id: Some("po_ext".into()),
            ..payout_meta()
        };
        let a = ledger.withdraw("u1", &usd(dec!(25)), meta.clone()).await.unwrap();
        let b = ledger.withdraw("u1", &usd(dec!(25)), meta).await.unwrap();
        assert_eq!(a, b);
        let wallet = ledger.find_by_payout_id("po_ext").await.unwrap().unwrap();
        assert_eq!(wallet.balance(&Currency::new("USD").unwrap()), dec!(75));
    }
}
