use super::escrow::{TransactionId, UserId};
use super::money::{Currency, Money};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// How long a claimed payout initiation blocks other callers. A claim older
/// than this belongs to a caller that died before recording the outcome.
pub const INITIATION_LEASE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletEntryType {
    Credit,
    Withdrawal,
    Reversal,
}

/// State of an external payout funded by a withdrawal entry.
///
/// `Pending -> InTransit -> Paid` on the happy path; `Failed` and `Canceled`
/// are terminal and trigger a reversal of the withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    InTransit,
    Paid,
    Failed,
    Canceled,
}

impl PayoutStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InTransit => "in_transit",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn reverses_withdrawal(self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }

    pub fn can_transition_to(self, next: PayoutStatus) -> bool {
        use PayoutStatus::*;
        matches!(
            (self, next),
            (Pending, InTransit)
                | (Pending, Paid)
                | (Pending, Failed)
                | (Pending, Canceled)
                | (InTransit, Paid)
                | (InTransit, Failed)
        )
    }
}

/// Payout tracking carried by a withdrawal entry. `status`, and a one-time
/// attachment of `payout_id`, are the only fields that change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutMetadata {
    pub destination_id: String,
    pub rail: String,
    pub payout_id: Option<String>,
    pub status: PayoutStatus,
    #[serde(default)]
    pub related_transaction: Option<TransactionId>,
    #[serde(default)]
    pub failure_code: Option<String>,
    /// Set while one caller is asking the rail to send this payout.
    #[serde(default)]
    pub initiation_claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryMetadata {
    /// Seller proceeds released from a completed escrow transaction.
    Sale { transaction_id: TransactionId },
    Payout(PayoutMetadata),
    Reversal {
        reversed_entry_id: String,
        payout_id: Option<String>,
    },
    /// Operator or import adjustment identified by an external reference.
    Adjustment { reference: String },
}

/// Immutable journal entry. Amounts are positive; the entry type gives the sign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: String,
    pub entry_type: WalletEntryType,
    pub amount: Decimal,
    pub currency: Currency,
    pub reason: String,
    pub metadata: EntryMetadata,
    pub created_at: DateTime<Utc>,
}

impl WalletTransaction {
    pub fn signed_amount(&self) -> Decimal {
        match self.entry_type {
            WalletEntryType::Credit | WalletEntryType::Reversal => self.amount,
            WalletEntryType::Withdrawal => -self.amount,
        }
    }

    pub fn payout(&self) -> Option<&PayoutMetadata> {
        match &self.metadata {
            EntryMetadata::Payout(p) => Some(p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalLimits {
    #[serde(default)]
    pub minimum: Option<Decimal>,
    #[serde(default)]
    pub daily: Option<Decimal>,
    #[serde(default)]
    pub monthly: Option<Decimal>,
}

/// Withdrawn totals for the current UTC day and calendar month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalCounter {
    pub daily_withdrawn: Decimal,
    pub monthly_withdrawn: Decimal,
    pub day: NaiveDate,
}

impl WithdrawalCounter {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            daily_withdrawn: Decimal::ZERO,
            monthly_withdrawn: Decimal::ZERO,
            day: now.date_naive(),
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today == self.day {
            return;
        }
        if (today.year(), today.month()) != (self.day.year(), self.day.month()) {
            self.monthly_withdrawn = Decimal::ZERO;
        }
        self.daily_withdrawn = Decimal::ZERO;
        self.day = today;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalTracking {
    pub counters: BTreeMap<Currency, WithdrawalCounter>,
}

impl WithdrawalTracking {
    fn counter(&mut self, currency: &Currency, now: DateTime<Utc>) -> &mut WithdrawalCounter {
        let counter = self
            .counters
            .entry(currency.clone())
            .or_insert_with(|| WithdrawalCounter::new(now));
        counter.roll(now);
        counter
    }

    /// Totals for `currency` as seen at `now`, without mutating the windows.
    pub fn current(&self, currency: &Currency, now: DateTime<Utc>) -> (Decimal, Decimal) {
        let Some(counter) = self.counters.get(currency) else {
            return (Decimal::ZERO, Decimal::ZERO);
        };
        let mut counter = counter.clone();
        counter.roll(now);
        (counter.daily_withdrawn, counter.monthly_withdrawn)
    }
}

/// Outcome of applying a provider payout status to a withdrawal entry.
#[derive(Debug, Clone, PartialEq)]
pub enum PayoutTransition {
    Applied {
        from: PayoutStatus,
        to: PayoutStatus,
        reversal_entry_id: Option<String>,
    },
    /// The entry is already in that status (replayed webhook).
    Duplicate,
    /// The update arrived after a later status; nothing to do.
    Stale { current: PayoutStatus },
}

/// A user's multi-currency wallet. `balances` is a cache over the journal and
/// changes only together with an appended entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: UserId,
    balances: BTreeMap<Currency, Decimal>,
    transactions: Vec<WalletTransaction>,
    pub withdrawal_tracking: WithdrawalTracking,
    /// Optimistic concurrency token; 0 means never stored.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(user_id: impl Into<UserId>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            balances: BTreeMap::new(),
            transactions: Vec::new(),
            withdrawal_tracking: WithdrawalTracking::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn balance(&self, currency: &Currency) -> Decimal {
        self.balances.get(currency).copied().unwrap_or_default()
    }

    pub fn balances(&self) -> &BTreeMap<Currency, Decimal> {
        &self.balances
    }

    pub fn transactions(&self) -> &[WalletTransaction] {
        &self.transactions
    }

    /// Balance recomputed from the journal alone.
    pub fn journal_balance(&self, currency: &Currency) -> Decimal {
        self.transactions
            .iter()
            .filter(|t| &t.currency == currency)
            .map(WalletTransaction::signed_amount)
            .sum()
    }

    /// True when every cached balance equals its journal sum and none is negative.
    pub fn is_consistent(&self) -> bool {
        let currencies: std::collections::BTreeSet<&Currency> = self
            .transactions
            .iter()
            .map(|t| &t.currency)
            .chain(self.balances.keys())
            .collect();
        currencies.into_iter().all(|c| {
            let balance = self.balance(c);
            balance == self.journal_balance(c) && balance >= Decimal::ZERO
        })
    }

    pub fn entry(&self, entry_id: &str) -> Option<&WalletTransaction> {
        self.transactions.iter().find(|t| t.id == entry_id)
    }

    pub fn find_payout_entry(&self, payout_id: &str) -> Option<&WalletTransaction> {
        self.transactions
            .iter()
            .find(|t| t.payout().and_then(|p| p.payout_id.as_deref()) == Some(payout_id))
    }

    pub fn has_sale_credit(&self, transaction_id: TransactionId) -> bool {
        self.transactions.iter().any(|t| {
            matches!(t.metadata, EntryMetadata::Sale { transaction_id: id } if id == transaction_id)
        })
    }

    pub fn has_adjustment(&self, reference: &str) -> bool {
        self.transactions.iter().any(
            |t| matches!(&t.metadata, EntryMetadata::Adjustment { reference: r } if r == reference),
        )
    }

    /// Withdrawal entry still funding a payout of `transaction_id`'s
    /// proceeds. Failed or canceled payouts were reversed and do not count.
    pub fn payout_for_transaction(&self, transaction_id: TransactionId) -> Option<&WalletTransaction> {
        self.transactions.iter().find(|t| {
            t.payout().is_some_and(|p| {
                p.related_transaction == Some(transaction_id) && !p.status.reverses_withdrawal()
            })
        })
    }

    fn append(&mut self, entry: WalletTransaction) -> String {
        let id = entry.id.clone();
        *self.balances.entry(entry.currency.clone()).or_default() += entry.signed_amount();
        self.updated_at = entry.created_at;
        self.transactions.push(entry);
        id
    }

    pub fn credit(
        &mut self,
        amount: &Money,
        reason: impl Into<String>,
        metadata: EntryMetadata,
        now: DateTime<Utc>,
    ) -> Result<String> {
        if amount.amount <= Decimal::ZERO {
            return Err(PaymentError::ValidationError(
                "Credit amount must be positive".to_string(),
            ));
        }
        Ok(self.append(WalletTransaction {
            id: Uuid::new_v4().to_string(),
            entry_type: WalletEntryType::Credit,
            amount: amount.amount,
            currency: amount.currency.clone(),
            reason: reason.into(),
            metadata,
            created_at: now,
        }))
    }

    /// Checks funds and limits, then debits and records a pending payout entry.
    /// Nothing changes when a check fails.
    pub fn withdraw(
        &mut self,
        amount: &Money,
        limits: &WithdrawalLimits,
        payout: PayoutMetadata,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let currency = &amount.currency;
        if amount.amount <= Decimal::ZERO {
            return Err(PaymentError::ValidationError(
                "Withdrawal amount must be positive".to_string(),
            ));
        }
        if let Some(minimum) = limits.minimum
            && amount.amount < minimum
        {
            return Err(PaymentError::ValidationError(format!(
                "Minimum withdrawal is {minimum} {currency}"
            )));
        }
        let available = self.balance(currency);
        if available < amount.amount {
            return Err(PaymentError::InsufficientFunds {
                currency: currency.to_string(),
                available,
                requested: amount.amount,
            });
        }
        let (daily, monthly) = self.withdrawal_tracking.current(currency, now);
        if let Some(limit) = limits.daily
            && daily + amount.amount > limit
        {
            return Err(PaymentError::WithdrawalLimitExceeded {
                window: "daily",
                currency: currency.to_string(),
                limit,
            });
        }
        if let Some(limit) = limits.monthly
            && monthly + amount.amount > limit
        {
            return Err(PaymentError::WithdrawalLimitExceeded {
                window: "monthly",
                currency: currency.to_string(),
                limit,
            });
        }

        let counter = self.withdrawal_tracking.counter(currency, now);
        counter.daily_withdrawn += amount.amount;
        counter.monthly_withdrawn += amount.amount;

        Ok(self.append(WalletTransaction {
            id: Uuid::new_v4().to_string(),
            entry_type: WalletEntryType::Withdrawal,
            amount: amount.amount,
            currency: currency.clone(),
            reason: "withdrawal".to_string(),
            metadata: EntryMetadata::Payout(PayoutMetadata {
                status: PayoutStatus::Pending,
                ..payout
            }),
            created_at: now,
        }))
    }

    /// Records the provider's payout id on a withdrawal entry. Allowed once.
    pub fn attach_payout_id(&mut self, entry_id: &str, payout_id: &str) -> Result<()> {
        let payout = self.payout_metadata_mut(entry_id)?;
        match &payout.payout_id {
            None => {
                payout.payout_id = Some(payout_id.to_string());
                Ok(())
            }
            Some(existing) if existing == payout_id => Ok(()),
            Some(existing) => Err(PaymentError::ValidationError(format!(
                "Entry {entry_id} already tracks payout {existing}"
            ))),
        }
    }

    /// Reserves the right to call the payout rail for `entry_id`.
    ///
    /// Returns false when the payout was already sent, settled, or another
    /// caller holds an unexpired claim.
    pub fn claim_initiation(&mut self, entry_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let payout = self.payout_metadata_mut(entry_id)?;
        if payout.payout_id.is_some() || payout.status != PayoutStatus::Pending {
            return Ok(false);
        }
        if let Some(claimed) = payout.initiation_claimed_at
            && now - claimed < chrono::Duration::seconds(INITIATION_LEASE_SECS)
        {
            return Ok(false);
        }
        payout.initiation_claimed_at = Some(now);
        self.updated_at = now;
        Ok(true)
    }

    /// Advances a withdrawal's payout status. A failure or cancellation
    /// re-credits the amount and releases the withdrawal counters, exactly once.
    pub fn apply_payout_status(
        &mut self,
        entry_id: &str,
        next: PayoutStatus,
        failure_code: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<PayoutTransition> {
        let (current, payout_id) = {
            let payout = self
                .entry(entry_id)
                .and_then(WalletTransaction::payout)
                .ok_or_else(|| PaymentError::not_found("withdrawal entry", entry_id))?;
            (payout.status, payout.payout_id.clone())
        };
        if current == next {
            return Ok(PayoutTransition::Duplicate);
        }
        if !current.can_transition_to(next) {
            return Ok(PayoutTransition::Stale { current });
        }

        {
            let payout = self.payout_metadata_mut(entry_id)?;
            payout.status = next;
            if failure_code.is_some() {
                payout.failure_code = failure_code;
            }
        }

        let reversal_entry_id = if next.reverses_withdrawal() && !self.is_reversed(entry_id) {
            Some(self.reverse(entry_id, payout_id, now)?)
        } else {
            None
        };
        self.updated_at = now;

        Ok(PayoutTransition::Applied {
            from: current,
            to: next,
            reversal_entry_id,
        })
    }

    fn is_reversed(&self, entry_id: &str) -> bool {
        self.transactions.iter().any(|t| {
            matches!(&t.metadata, EntryMetadata::Reversal { reversed_entry_id, .. } if reversed_entry_id == entry_id)
        })
    }

    fn reverse(
        &mut self,
        entry_id: &str,
        payout_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let original = self
            .entry(entry_id)
            .cloned()
            .ok_or_else(|| PaymentError::not_found("withdrawal entry", entry_id))?;

        // Only release the counters if the withdrawal still counts in the current windows.
        let counter = self.withdrawal_tracking.counter(&original.currency, now);
        let created = original.created_at.date_naive();
        if created == counter.day {
            counter.daily_withdrawn = (counter.daily_withdrawn - original.amount).max(Decimal::ZERO);
        }
        if (created.year(), created.month()) == (counter.day.year(), counter.day.month()) {
            counter.monthly_withdrawn =
                (counter.monthly_withdrawn - original.amount).max(Decimal::ZERO);
        }

        Ok(self.append(WalletTransaction {
            id: Uuid::new_v4().to_string(),
            entry_type: WalletEntryType::Reversal,
            amount: original.amount,
            currency: original.currency,
            reason: "payout reversal".to_string(),
            metadata: EntryMetadata::Reversal {
                reversed_entry_id: entry_id.to_string(),
                payout_id,
            },
            created_at: now,
        }))
    }

    fn payout_metadata_mut(&mut self, entry_id: &str) -> Result<&mut PayoutMetadata> {
        self.transactions
            .iter_mut()
            .find(|t| t.id == entry_id)
            .and_then(|t| match &mut t.metadata {
                EntryMetadata::Payout(p) => Some(p),
                _ => None,
            })
            .ok_or_else(|| PaymentError::not_found("withdrawal entry", entry_id))
    }
}
