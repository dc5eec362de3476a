use crate::application::ledger::WalletLedger;
use crate::application::payout::PayoutOrchestrator;
use crate::domain::money::{Currency, Money};
use crate::domain::wallet::{PayoutMetadata, PayoutStatus};
use crate::error::{PaymentError, Result};
use crate::infrastructure::gateways::manual::MANUAL_RAIL;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;
use tracing::debug;

/// Destination recorded on replayed withdrawals. These payouts were already
/// sent outside this system, so no saved destination or rail is involved.
const REPLAY_DESTINATION: &str = "replay";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOpKind {
    Credit,
    Withdraw,
    PayoutInTransit,
    PayoutPaid,
    PayoutFailed,
    PayoutCanceled,
}

/// One replayed ledger operation.
///
/// `reference` is the adjustment reference of a credit, and the provider
/// payout id of a withdrawal or payout update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LedgerOp {
    #[serde(rename = "type")]
    pub kind: LedgerOpKind,
    pub user: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<Currency>,
    pub reference: String,
}

impl LedgerOp {
    fn user(&self) -> Result<&str> {
        self.user
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| PaymentError::ValidationError(format!("{:?} requires a user", self.kind)))
    }

    fn money(&self) -> Result<Money> {
        match (self.amount, &self.currency) {
            (Some(amount), Some(currency)) => Money::positive(amount, currency.clone()),
            _ => Err(PaymentError::ValidationError(format!(
                "{:?} requires an amount and a currency",
                self.kind
            ))),
        }
    }

    /// Applies the operation. Credits are idempotent per reference, and
    /// withdrawals and payout updates per payout id, so a replayed file
    /// changes nothing.
    ///
    /// Withdrawals record payouts settled elsewhere: they debit the wallet
    /// with the limits enforced but never call a payout rail.
    pub async fn apply(&self, ledger: &WalletLedger, payouts: &PayoutOrchestrator) -> Result<()> {
        let status = match self.kind {
            LedgerOpKind::Credit => {
                ledger
                    .credit_adjustment(self.user()?, &self.money()?, &self.reference)
                    .await?;
                return Ok(());
            }
            LedgerOpKind::Withdraw => {
                let user = self.user()?;
                if ledger.find_by_payout_id(&self.reference).await?.is_some() {
                    debug!(payout_id = %self.reference, "withdrawal already recorded");
                    return Ok(());
                }
                // The payout id is written with the debit, so a replay always
                // finds it and never debits twice.
                ledger
                    .withdraw(
                        user,
                        &self.money()?,
                        PayoutMetadata {
                            destination_id: REPLAY_DESTINATION.to_string(),
                            rail: MANUAL_RAIL.to_string(),
                            payout_id: Some(self.reference.clone()),
                            status: PayoutStatus::Pending,
                            related_transaction: None,
                            failure_code: None,
                            initiation_claimed_at: None,
                        },
                    )
                    .await?;
                return Ok(());
            }
            LedgerOpKind::PayoutInTransit => PayoutStatus::InTransit,
            LedgerOpKind::PayoutPaid => PayoutStatus::Paid,
            LedgerOpKind::PayoutFailed => PayoutStatus::Failed,
            LedgerOpKind::PayoutCanceled => PayoutStatus::Canceled,
        };
        payouts
            .handle_payout_update(&self.reference, status, None)
            .await
            .map(|_| ())
    }
}

/// Reads ledger operations from a CSV source.
///
/// This reader wraps `csv::Reader` and provides an iterator over `Result<LedgerOp>`.
/// It handles whitespace trimming and flexible record lengths automatically.
pub struct LedgerReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> LedgerReader<R> {
    /// Creates a new `LedgerReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads and deserializes operations, one record at a time.
    pub fn operations(self) -> impl Iterator<Item = Result<LedgerOp>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(PaymentError::from))
    }
}
