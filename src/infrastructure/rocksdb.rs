use crate::domain::escrow::{EscrowTransaction, TransactionId};
use crate::domain::payout::PayoutDestination;
use crate::domain::ports::{DestinationStore, EscrowStore, WalletStore};
use crate::domain::wallet::Wallet;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for escrow transactions, keyed by transaction id.
pub const CF_ESCROW: &str = "escrow";
/// Column Family for wallets, keyed by user id.
pub const CF_WALLETS: &str = "wallets";
/// Column Family for payout destinations, keyed by destination id.
pub const CF_DESTINATIONS: &str = "destinations";

/// A persistent store implementation using RocksDB.
///
/// Entities are stored as JSON in separate Column Families. Version checks
/// and writes for `compare_and_swap` run under one process-wide write lock.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at `path`, creating the column
    /// families on first use.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_ESCROW, CF_WALLETS, CF_DESTINATIONS]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            PaymentError::InternalError(Box::new(std::io::Error::other(format!(
                "{name} column family not found"
            ))))
        })
    }

    fn read<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db.put_cf(&cf, key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .iterator_cf(cf, IteratorMode::Start)
            .map(|item| -> Result<T> {
                let (_key, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }
}

#[async_trait]
impl EscrowStore for RocksDBStore {
    async fn insert(&self, mut txn: EscrowTransaction) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = txn.id.as_bytes().to_vec();
        if self.read::<EscrowTransaction>(CF_ESCROW, &key)?.is_some() {
            return Err(PaymentError::Conflict(format!(
                "transaction {} already exists",
                txn.id
            )));
        }
        txn.version = 1;
        self.write(CF_ESCROW, &key, &txn)
    }

    async fn get(&self, id: TransactionId) -> Result<Option<EscrowTransaction>> {
        self.read(CF_ESCROW, id.as_bytes())
    }

    async fn find_by_gateway_reference(
        &self,
        gateway: &str,
        gateway_transaction_id: &str,
    ) -> Result<Option<EscrowTransaction>> {
        Ok(self
            .scan::<EscrowTransaction>(CF_ESCROW)?
            .into_iter()
            .find(|t| {
                t.payment_gateway == gateway
                    && t.gateway_transaction_id.as_deref() == Some(gateway_transaction_id)
            }))
    }

    async fn compare_and_swap(
        &self,
        mut txn: EscrowTransaction,
        expected_version: u64,
    ) -> Result<EscrowTransaction> {
        let _guard = self.write_lock.lock().await;
        let key = txn.id.as_bytes().to_vec();
        let current = self
            .read::<EscrowTransaction>(CF_ESCROW, &key)?
            .map(|t| t.version)
            .ok_or_else(|| PaymentError::not_found("transaction", txn.id))?;
        if current != expected_version {
            return Err(PaymentError::Conflict(format!(
                "transaction {} is at version {current}, expected {expected_version}",
                txn.id
            )));
        }
        txn.version = current + 1;
        self.write(CF_ESCROW, &key, &txn)?;
        Ok(txn)
    }

    async fn all(&self) -> Result<Vec<EscrowTransaction>> {
        let mut all: Vec<EscrowTransaction> = self.scan(CF_ESCROW)?;
        all.sort_by_key(|t| t.created_at);
        Ok(all)
    }
}

#[async_trait]
impl WalletStore for RocksDBStore {
    async fn get(&self, user_id: &str) -> Result<Option<Wallet>> {
        self.read(CF_WALLETS, user_id.as_bytes())
    }

    async fn compare_and_swap(&self, mut wallet: Wallet, expected_version: u64) -> Result<Wallet> {
        let _guard = self.write_lock.lock().await;
        let key = wallet.user_id.as_bytes().to_vec();
        let current = self
            .read::<Wallet>(CF_WALLETS, &key)?
            .map_or(0, |w| w.version);
        if current != expected_version {
            return Err(PaymentError::Conflict(format!(
                "wallet {} is at version {current}, expected {expected_version}",
                wallet.user_id
            )));
        }
        wallet.version = current + 1;
        self.write(CF_WALLETS, &key, &wallet)?;
        Ok(wallet)
    }

    async fn find_by_payout_id(&self, payout_id: &str) -> Result<Option<Wallet>> {
        Ok(self
            .scan::<Wallet>(CF_WALLETS)?
            .into_iter()
            .find(|w| w.find_payout_entry(payout_id).is_some()))
    }

    /// Ordered by user id, the column family's key order.
    async fn all(&self) -> Result<Vec<Wallet>> {
        self.scan(CF_WALLETS)
    }
}

#[async_trait]
impl DestinationStore for RocksDBStore {
    async fn store(&self, destination: PayoutDestination) -> Result<()> {
        self.write(CF_DESTINATIONS, destination.id.as_bytes(), &destination)
    }

    async fn get(&self, id: &str) -> Result<Option<PayoutDestination>> {
        self.read(CF_DESTINATIONS, id.as_bytes())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<PayoutDestination>> {
        let mut list: Vec<PayoutDestination> = self
            .scan::<PayoutDestination>(CF_DESTINATIONS)?
            .into_iter()
            .filter(|d| d.user_id == user_id)
            .collect();
        list.sort_by_key(|d| d.created_at);
        Ok(list)
    }
}
