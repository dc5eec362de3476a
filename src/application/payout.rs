//! Payout destinations and the orchestration of outbound transfers.

use super::ledger::WalletLedger;
use crate::config::PayoutSettings;
use crate::domain::escrow::{EscrowStatus, TransactionId};
use crate::domain::gateway::{PayoutRailBox, PayoutRequest};
use crate::domain::money::{Currency, Money};
use crate::domain::payout::{DestinationType, PayoutDestination, RawDestination};
use crate::domain::ports::{DestinationStoreBox, EscrowStoreBox};
use crate::domain::wallet::{PayoutMetadata, PayoutStatus, PayoutTransition, WalletTransaction};
use crate::error::{PaymentError, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A user's saved payout destinations.
pub struct DestinationBook {
    store: DestinationStoreBox,
}

impl DestinationBook {
    pub fn new(store: DestinationStoreBox) -> Self {
        Self { store }
    }

    /// Stores a new, unverified destination. Raw numbers are masked first.
    pub async fn add(
        &self,
        user_id: &str,
        raw: RawDestination,
        provider_reference: &str,
    ) -> Result<PayoutDestination> {
        let destination = PayoutDestination::new(user_id, raw, provider_reference, Utc::now())?;
        self.store.store(destination.clone()).await?;
        info!(
            user_id,
            destination_id = %destination.id,
            kind = %destination.destination_type(),
            "payout destination added"
        );
        Ok(destination)
    }

    /// The destination, if it exists and belongs to `user_id`.
    pub async fn get(&self, user_id: &str, destination_id: &str) -> Result<PayoutDestination> {
        self.store
            .get(destination_id)
            .await?
            .filter(|d| d.user_id == user_id && !d.is_deleted())
            .ok_or_else(|| PaymentError::not_found("payout destination", destination_id))
    }

    /// Records the outcome of the provider's verification (micro-deposits,
    /// account lookup...).
    pub async fn verify(&self, user_id: &str, destination_id: &str) -> Result<PayoutDestination> {
        let mut destination = self.get(user_id, destination_id).await?;
        destination.is_verified = true;
        self.store.store(destination.clone()).await?;
        info!(user_id, destination_id, "payout destination verified");
        Ok(destination)
    }

    /// Makes one destination the default for its type, clearing the others.
    pub async fn set_default(&self, user_id: &str, destination_id: &str) -> Result<PayoutDestination> {
        let mut chosen = self.get(user_id, destination_id).await?;
        chosen.ensure_payable()?;
        let kind = chosen.destination_type();
        for mut other in self.store.list_for_user(user_id).await? {
            if other.id != chosen.id && other.is_default && other.destination_type() == kind {
                other.is_default = false;
                self.store.store(other).await?;
            }
        }
        chosen.is_default = true;
        self.store.store(chosen.clone()).await?;
        Ok(chosen)
    }

    pub async fn remove(&self, user_id: &str, destination_id: &str) -> Result<()> {
        let mut destination = self.get(user_id, destination_id).await?;
        destination.soft_delete(Utc::now());
        self.store.store(destination).await?;
        info!(user_id, destination_id, "payout destination removed");
        Ok(())
    }

    pub async fn list_active(&self, user_id: &str) -> Result<Vec<PayoutDestination>> {
        Ok(self
            .store
            .list_for_user(user_id)
            .await?
            .into_iter()
            .filter(|d| d.is_active && !d.is_deleted())
            .collect())
    }

    /// The default verified destination, or the only verified one.
    pub async fn default_for(&self, user_id: &str) -> Result<PayoutDestination> {
        let verified: Vec<_> = self
            .list_active(user_id)
            .await?
            .into_iter()
            .filter(|d| d.is_verified)
            .collect();
        if let Some(default) = verified.iter().find(|d| d.is_default) {
            return Ok(default.clone());
        }
        match verified.as_slice() {
            [only] => Ok(only.clone()),
            _ => Err(PaymentError::ValidationError(format!(
                "User {user_id} has no default verified payout destination"
            ))),
        }
    }
}

/// A user's request to move wallet funds out.
#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawalRequest {
    pub user_id: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub withdrawal_method: DestinationType,
    pub destination_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WithdrawalReceipt {
    pub entry_id: String,
    pub payout_id: Option<String>,
    pub status: PayoutStatus,
}

impl WithdrawalReceipt {
    fn from_entry(entry: &WalletTransaction) -> Option<Self> {
        entry.payout().map(|p| Self {
            entry_id: entry.id.clone(),
            payout_id: p.payout_id.clone(),
            status: p.status,
        })
    }
}

/// Result of feeding a provider payout status into the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum PayoutUpdate {
    Applied {
        user_id: String,
        entry_id: String,
        from: PayoutStatus,
        to: PayoutStatus,
        reversed: bool,
    },
    Duplicate,
    Stale { current: PayoutStatus },
}

pub struct PayoutOrchestrator {
    ledger: Arc<WalletLedger>,
    destinations: Arc<DestinationBook>,
    escrow: EscrowStoreBox,
    rails: HashMap<String, PayoutRailBox>,
    routing: PayoutSettings,
}

impl PayoutOrchestrator {
    pub fn new(
        ledger: Arc<WalletLedger>,
        destinations: Arc<DestinationBook>,
        escrow: EscrowStoreBox,
        rails: HashMap<String, PayoutRailBox>,
        routing: PayoutSettings,
    ) -> Self {
        Self {
            ledger,
            destinations,
            escrow,
            rails,
            routing,
        }
    }

    pub fn destinations(&self) -> &Arc<DestinationBook> {
        &self.destinations
    }

    fn rail_for(&self, kind: DestinationType) -> Result<&PayoutRailBox> {
        let name = self
            .routing
            .rails
            .get(&kind)
            .ok_or_else(|| PaymentError::GatewayNotConfigured(format!("payout rail for {kind}")))?;
        self.rails
            .get(name)
            .ok_or_else(|| PaymentError::GatewayNotConfigured(format!("payout rail {name}")))
    }

    /// Debits the wallet and starts the external transfer.
    ///
    /// The destination must be verified and active. A rail that refuses the
    /// transfer fails the payout immediately, which reverses the debit.
    pub async fn request_withdrawal(&self, req: WithdrawalRequest) -> Result<WithdrawalReceipt> {
        let destination = self
            .destinations
            .get(&req.user_id, &req.destination_id)
            .await?;
        let amount = Money::positive(req.amount, req.currency)?;
        self.withdraw_to(&destination, amount, req.withdrawal_method, None)
            .await
    }

    async fn withdraw_to(
        &self,
        destination: &PayoutDestination,
        amount: Money,
        method: DestinationType,
        related_transaction: Option<TransactionId>,
    ) -> Result<WithdrawalReceipt> {
        destination.ensure_payable()?;
        if destination.destination_type() != method {
            return Err(PaymentError::ValidationError(format!(
                "Destination {} is a {}, not a {method}",
                destination.id,
                destination.destination_type()
            )));
        }
        let rail = self.rail_for(method)?.clone();
        let user_id = destination.user_id.clone();

        let entry_id = self
            .ledger
            .withdraw(
                &user_id,
                &amount,
                PayoutMetadata {
                    destination_id: destination.id.clone(),
                    rail: rail.name().to_string(),
                    payout_id: None,
                    status: PayoutStatus::Pending,
                    related_transaction,
                    failure_code: None,
                    initiation_claimed_at: None,
                },
            )
            .await?;

        // Only the caller holding the claim talks to the rail; everyone else
        // reports the entry as it stands.
        let (claimed, entry) = self.ledger.claim_initiation(&user_id, &entry_id).await?;
        if !claimed {
            return WithdrawalReceipt::from_entry(&entry)
                .ok_or_else(|| PaymentError::not_found("withdrawal entry", &entry_id));
        }

        let request = PayoutRequest {
            user_id: user_id.clone(),
            amount: Money::new(entry.amount, entry.currency.clone()),
            destination_type: method,
            destination_reference: destination.provider_reference.clone(),
            entry_id: entry_id.clone(),
        };
        match rail.initiate_payout(&request).await {
            Ok(receipt) => {
                self.ledger
                    .attach_payout_id(&user_id, &entry_id, &receipt.payout_id)
                    .await?;
                if receipt.status != PayoutStatus::Pending {
                    self.ledger
                        .apply_payout_status(&user_id, &entry_id, receipt.status, None)
                        .await?;
                }
                info!(
                    user_id,
                    entry_id,
                    payout_id = %receipt.payout_id,
                    rail = rail.name(),
                    "payout initiated"
                );
                Ok(WithdrawalReceipt {
                    entry_id,
                    payout_id: Some(receipt.payout_id),
                    status: receipt.status,
                })
            }
            Err(e) => {
                warn!(
                    user_id,
                    entry_id,
                    rail = rail.name(),
                    error = %e,
                    "payout rejected, reversing withdrawal"
                );
                self.ledger
                    .apply_payout_status(
                        &user_id,
                        &entry_id,
                        PayoutStatus::Failed,
                        Some(e.to_string()),
                    )
                    .await
                    .inspect_err(|re| {
                        error!(user_id, entry_id, error = %re, "withdrawal reversal failed");
                    })?;
                Err(e)
            }
        }
    }

    /// Applies a provider payout status. Failures and cancellations reverse
    /// the withdrawal once per payout id.
    pub async fn handle_payout_update(
        &self,
        payout_id: &str,
        status: PayoutStatus,
        failure_code: Option<String>,
    ) -> Result<PayoutUpdate> {
        let wallet = self
            .ledger
            .find_by_payout_id(payout_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("payout", payout_id))?;
        let entry_id = wallet
            .find_payout_entry(payout_id)
            .map(|e| e.id.clone())
            .ok_or_else(|| PaymentError::not_found("payout", payout_id))?;
        let user_id = wallet.user_id;

        let transition = self
            .ledger
            .apply_payout_status(&user_id, &entry_id, status, failure_code)
            .await?;
        Ok(match transition {
            PayoutTransition::Applied {
                from,
                to,
                reversal_entry_id,
            } => {
                let reversed = reversal_entry_id.is_some();
                info!(
                    user_id,
                    payout_id,
                    from = from.as_str(),
                    to = to.as_str(),
                    reversed,
                    "payout status updated"
                );
                PayoutUpdate::Applied {
                    user_id,
                    entry_id,
                    from,
                    to,
                    reversed,
                }
            }
            PayoutTransition::Duplicate => PayoutUpdate::Duplicate,
            PayoutTransition::Stale { current } => {
                warn!(
                    payout_id,
                    current = current.as_str(),
                    next = status.as_str(),
                    "stale payout update ignored"
                );
                PayoutUpdate::Stale { current }
            }
        })
    }

    /// Operator trigger: pays a completed transaction's proceeds out to the
    /// seller's default destination. Repeated calls return the first payout.
    pub async fn payout_transaction(&self, id: TransactionId) -> Result<WithdrawalReceipt> {
        let txn = self
            .escrow
            .get(id)
            .await?
            .ok_or_else(|| PaymentError::not_found("transaction", id))?;
        if txn.status() != EscrowStatus::Completed {
            return Err(PaymentError::ValidationError(format!(
                "Transaction {id} is {} and cannot be paid out",
                txn.status()
            )));
        }
        if let Some(wallet) = self.ledger.wallet(&txn.seller_id).await?
            && let Some(existing) = wallet.payout_for_transaction(id)
            && let Some(receipt) = WithdrawalReceipt::from_entry(existing)
            && receipt.payout_id.is_some()
        {
            return Ok(receipt);
        }

        // Completion credits the seller; this covers a credit that failed then.
        self.ledger.credit_sale(&txn).await?;
        let destination = self.destinations.default_for(&txn.seller_id).await?;
        let amount = Money::new(txn.pricing.seller_net(), txn.pricing.currency.clone());
        info!(
            transaction_id = %id,
            seller_id = %txn.seller_id,
            %amount,
            "manual payout triggered"
        );
        self.withdraw_to(&destination, amount, destination.destination_type(), Some(id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalletSettings;
    use crate::domain::escrow::EscrowTransaction;
    use crate::domain::ports::EscrowStore;
    use crate::domain::escrow::tests::sample_transaction;
    use crate::domain::gateway::{PayoutRail, PayoutReceipt};
    use crate::infrastructure::in_memory::{
        InMemoryDestinationStore, InMemoryEscrowStore, InMemoryWalletStore,
    };
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    struct FakeRail {
        fail: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PayoutRail for FakeRail {
        fn name(&self) -> &str {
            "manual"
        }

        async fn initiate_payout(&self, request: &PayoutRequest) -> Result<PayoutReceipt> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Long enough for a concurrent caller to reach the rail too.
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(PaymentError::GatewayRejected {
                    gateway: "manual".into(),
                    message: "account_closed".into(),
                });
            }
            Ok(PayoutReceipt {
                payout_id: format!("po_{}", request.entry_id),
                status: PayoutStatus::Pending,
            })
        }
    }

    struct Fixture {
        orchestrator: PayoutOrchestrator,
        ledger: Arc<WalletLedger>,
        escrow: Arc<InMemoryEscrowStore>,
        rail: Arc<FakeRail>,
    }

    fn fixture(fail: bool) -> Fixture {
        let ledger = Arc::new(WalletLedger::new(
            Arc::new(InMemoryWalletStore::new()),
            WalletSettings::default(),
        ));
        let escrow = Arc::new(InMemoryEscrowStore::new());
        let rail = Arc::new(FakeRail {
            fail: AtomicBool::new(fail),
            calls: AtomicU32::new(0),
        });
        let rails: HashMap<String, PayoutRailBox> =
            HashMap::from([("manual".to_string(), rail.clone() as PayoutRailBox)]);
        let orchestrator = PayoutOrchestrator::new(
            ledger.clone(),
            Arc::new(DestinationBook::new(Arc::new(InMemoryDestinationStore::new()))),
            escrow.clone(),
            rails,
            PayoutSettings::default(),
        );
        Fixture {
            orchestrator,
            ledger,
            escrow,
            rail,
        }
    }

    fn bank() -> RawDestination {
        RawDestination::BankAccount {
            bank_name: "First Bank".into(),
            account_holder: "Sam Seller".into(),
            account_number: "000123456789".into(),
            routing_number: None,
        }
    }

    fn usd() -> Currency {
        Currency::new("USD").unwrap()
    }

    async fn verified_bank(f: &Fixture, user: &str) -> PayoutDestination {
        let book = f.orchestrator.destinations();
        let dest = book.add(user, bank(), "ba_tok").await.unwrap();
        book.verify(user, &dest.id).await.unwrap()
    }

    fn request(user: &str, dest: &PayoutDestination, amount: Decimal) -> WithdrawalRequest {
        WithdrawalRequest {
            user_id: user.into(),
            amount,
            currency: usd(),
            withdrawal_method: DestinationType::BankAccount,
            destination_id: dest.id.clone(),
        }
    }

    #[tokio::test]
    async fn test_default_is_unique_per_type() {
        let f = fixture(false);
        let a = verified_bank(&f, "u1").await;
        let b = verified_bank(&f, "u1").await;
        let book = f.orchestrator.destinations();
        book.set_default("u1", &a.id).await.unwrap();
        book.set_default("u1", &b.id).await.unwrap();
        let defaults: Vec<_> = book
            .list_active("u1")
            .await
            .unwrap()
            .into_iter()
            .filter(|d| d.is_default)
            .map(|d| d.id)
            .collect();
        assert_eq!(defaults, vec![b.id.clone()]);

        book.remove("u1", &b.id).await.unwrap();
        assert_eq!(book.list_active("u1").await.unwrap().len(), 1);
        assert!(book.get("u2", &a.id).await.is_err());
    }

    #[tokio::test]
    async fn test_unverified_destination_rejected_before_debit() {
        let f = fixture(false);
        f.ledger
            .credit_adjustment("u1", &Money::new(dec!(100), usd()), "seed")
            .await
            .unwrap();
        let dest = f
            .orchestrator
            .destinations()
            .add("u1", bank(), "ba_tok")
            .await
            .unwrap();
        let result = f
            .orchestrator
            .request_withdrawal(request("u1", &dest, dec!(10)))
            .await;
        assert!(matches!(result, Err(PaymentError::ValidationError(_))));
        assert_eq!(f.ledger.balances("u1").await.unwrap()[&usd()], dec!(100));
        assert_eq!(f.rail.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_withdrawal_then_failed_webhook_reverses_once() {
        let f = fixture(false);
        f.ledger
            .credit_adjustment("u1", &Money::new(dec!(100), usd()), "seed")
            .await
            .unwrap();
        let dest = verified_bank(&f, "u1").await;
        let receipt = f
            .orchestrator
            .request_withdrawal(request("u1", &dest, dec!(40)))
            .await
            .unwrap();
        assert_eq!(receipt.status, PayoutStatus::Pending);
        let payout_id = receipt.payout_id.unwrap();
        assert_eq!(f.ledger.balances("u1").await.unwrap()[&usd()], dec!(60));

        let first = f
            .orchestrator
            .handle_payout_update(&payout_id, PayoutStatus::Failed, Some("account_closed".into()))
            .await
            .unwrap();
        assert!(matches!(first, PayoutUpdate::Applied { reversed: true, .. }));
        let again = f
            .orchestrator
            .handle_payout_update(&payout_id, PayoutStatus::Failed, None)
            .await
            .unwrap();
        assert_eq!(again, PayoutUpdate::Duplicate);
        assert_eq!(f.ledger.balances("u1").await.unwrap()[&usd()], dec!(100));

        let late = f
            .orchestrator
            .handle_payout_update(&payout_id, PayoutStatus::InTransit, None)
            .await
            .unwrap();
        assert_eq!(
            late,
            PayoutUpdate::Stale {
                current: PayoutStatus::Failed
            }
        );
    }

    #[tokio::test]
    async fn test_rail_rejection_reverses_immediately() {
        let f = fixture(true);
        f.ledger
            .credit_adjustment("u1", &Money::new(dec!(100), usd()), "seed")
            .await
            .unwrap();
        let dest = verified_bank(&f, "u1").await;
        let result = f
            .orchestrator
            .request_withdrawal(request("u1", &dest, dec!(40)))
            .await;
        assert!(matches!(result, Err(PaymentError::GatewayRejected { .. })));
        let wallet = f.ledger.wallet("u1").await.unwrap().unwrap();
        assert_eq!(wallet.balance(&usd()), dec!(100));
        assert!(wallet.is_consistent());
    }

    #[tokio::test]
    async fn test_unknown_payout_id_is_not_found() {
        let f = fixture(false);
        let result = f
            .orchestrator
            .handle_payout_update("po_missing", PayoutStatus::Paid, None)
            .await;
        assert!(matches!(result, Err(PaymentError::NotFound { .. })));
    }

    async fn completed_sale(f: &Fixture) -> EscrowTransaction {
        let mut txn = sample_transaction();
        let now = Utc::now();
        for next in [
            EscrowStatus::PaymentProcessing,
            EscrowStatus::FundsHeld,
            EscrowStatus::Shipped,
            EscrowStatus::Completed,
        ] {
            txn.transition(next, None, now).unwrap();
        }
        f.escrow.insert(txn.clone()).await.unwrap();
        let dest = verified_bank(f, &txn.seller_id).await;
        f.orchestrator
            .destinations()
            .set_default(&txn.seller_id, &dest.id)
            .await
            .unwrap();
        txn
    }

    #[tokio::test]
    async fn test_payout_transaction_is_idempotent() {
        let f = fixture(false);
        let txn = completed_sale(&f).await;

        let first = f.orchestrator.payout_transaction(txn.id).await.unwrap();
        let second = f.orchestrator.payout_transaction(txn.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.rail.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.ledger.balances(&txn.seller_id).await.unwrap()[&usd()],
            dec!(0)
        );
    }

    #[tokio::test]
    async fn test_payout_transaction_retries_after_rail_rejection() {
        let f = fixture(true);
        let txn = completed_sale(&f).await;

        assert!(f.orchestrator.payout_transaction(txn.id).await.is_err());
        assert_eq!(
            f.ledger.balances(&txn.seller_id).await.unwrap()[&usd()],
            txn.pricing.seller_net()
        );

        f.rail.fail.store(false, Ordering::SeqCst);
        let receipt = f.orchestrator.payout_transaction(txn.id).await.unwrap();
        assert!(receipt.payout_id.is_some());
        assert_eq!(f.rail.calls.load(Ordering::SeqCst), 2);
        let wallet = f.ledger.wallet(&txn.seller_id).await.unwrap().unwrap();
        assert_eq!(wallet.balance(&usd()), dec!(0));
        assert!(wallet.is_consistent());
    }

    #[tokio::test]
    async fn test_concurrent_payout_triggers_reach_rail_once() {
        let f = fixture(false);
        let txn = completed_sale(&f).await;

        let (a, b) = tokio::join!(
            f.orchestrator.payout_transaction(txn.id),
            f.orchestrator.payout_transaction(txn.id)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.entry_id, b.entry_id);
        assert_eq!(f.rail.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.ledger.balances(&txn.seller_id).await.unwrap()[&usd()],
            dec!(0)
        );

        let settled = f.orchestrator.payout_transaction(txn.id).await.unwrap();
        assert!(settled.payout_id.is_some());
        assert_eq!(f.rail.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_payout_transaction_requires_completion() {
        let f = fixture(false);
        let txn = sample_transaction();
        f.escrow.insert(txn.clone()).await.unwrap();
        assert!(matches!(
            f.orchestrator.payout_transaction(txn.id).await,
            Err(PaymentError::ValidationError(_))
        ));
    }
}
