use crate::domain::escrow::{EscrowTransaction, TransactionId};
use crate::domain::payout::PayoutDestination;
use crate::domain::ports::{
    DestinationStore, EscrowStore, ListingStatus, Offer, OrderService, ProductCatalog,
    ProductListing, WalletStore,
};
use crate::domain::wallet::Wallet;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for escrow transactions.
///
/// The write lock is held across the version check and the insert, which makes
/// `compare_and_swap` atomic.
#[derive(Default, Clone)]
pub struct InMemoryEscrowStore {
    transactions: Arc<RwLock<HashMap<TransactionId, EscrowTransaction>>>,
}

impl InMemoryEscrowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EscrowStore for InMemoryEscrowStore {
    async fn insert(&self, mut txn: EscrowTransaction) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&txn.id) {
            return Err(PaymentError::Conflict(format!(
                "transaction {} already exists",
                txn.id
            )));
        }
        txn.version = 1;
        transactions.insert(txn.id, txn);
        Ok(())
    }

    async fn get(&self, id: TransactionId) -> Result<Option<EscrowTransaction>> {
        Ok(self.transactions.read().await.get(&id).cloned())
    }

    async fn find_by_gateway_reference(
        &self,
        gateway: &str,
        gateway_transaction_id: &str,
    ) -> Result<Option<EscrowTransaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .find(|t| {
                t.payment_gateway == gateway
                    && t.gateway_transaction_id.as_deref() == Some(gateway_transaction_id)
            })
            .cloned())
    }

    async fn compare_and_swap(
        &self,
        mut txn: EscrowTransaction,
        expected_version: u64,
    ) -> Result<EscrowTransaction> {
        let mut transactions = self.transactions.write().await;
        let current = transactions
            .get(&txn.id)
            .map(|t| t.version)
            .ok_or_else(|| PaymentError::not_found("transaction", txn.id))?;
        if current != expected_version {
            return Err(PaymentError::Conflict(format!(
                "transaction {} is at version {current}, expected {expected_version}",
                txn.id
            )));
        }
        txn.version = current + 1;
        transactions.insert(txn.id, txn.clone());
        Ok(txn)
    }

    async fn all(&self) -> Result<Vec<EscrowTransaction>> {
        let mut all: Vec<_> = self.transactions.read().await.values().cloned().collect();
        all.sort_by_key(|t| t.created_at);
        Ok(all)
    }
}

/// A thread-safe in-memory store for wallets, keyed by user id.
#[derive(Default, Clone)]
pub struct InMemoryWalletStore {
    wallets: Arc<RwLock<HashMap<String, Wallet>>>,
}

impl InMemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletStore for InMemoryWalletStore {
    async fn get(&self, user_id: &str) -> Result<Option<Wallet>> {
        Ok(self.wallets.read().await.get(user_id).cloned())
    }

    async fn compare_and_swap(&self, mut wallet: Wallet, expected_version: u64) -> Result<Wallet> {
        let mut wallets = self.wallets.write().await;
        let current = wallets.get(&wallet.user_id).map_or(0, |w| w.version);
        if current != expected_version {
            return Err(PaymentError::Conflict(format!(
                "wallet {} is at version {current}, expected {expected_version}",
                wallet.user_id
            )));
        }
        wallet.version = current + 1;
        wallets.insert(wallet.user_id.clone(), wallet.clone());
        Ok(wallet)
    }

    async fn find_by_payout_id(&self, payout_id: &str) -> Result<Option<Wallet>> {
        let wallets = self.wallets.read().await;
        Ok(wallets
            .values()
            .find(|w| w.find_payout_entry(payout_id).is_some())
            .cloned())
    }

    async fn all(&self) -> Result<Vec<Wallet>> {
        let mut all: Vec<_> = self.wallets.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(all)
    }
}

#[derive(Default, Clone)]
pub struct InMemoryDestinationStore {
    destinations: Arc<RwLock<HashMap<String, PayoutDestination>>>,
}

impl InMemoryDestinationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DestinationStore for InMemoryDestinationStore {
    async fn store(&self, destination: PayoutDestination) -> Result<()> {
        self.destinations
            .write()
            .await
            .insert(destination.id.clone(), destination);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PayoutDestination>> {
        Ok(self.destinations.read().await.get(id).cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<PayoutDestination>> {
        let mut list: Vec<_> = self
            .destinations
            .read()
            .await
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by_key(|d| d.created_at);
        Ok(list)
    }
}

/// Product catalogue backed by maps, for tests and the CLI.
#[derive(Default, Clone)]
pub struct InMemoryCatalog {
    products: Arc<RwLock<HashMap<String, ProductListing>>>,
    offers: Arc<RwLock<HashMap<String, Offer>>>,
    sold_by: Arc<RwLock<HashMap<String, TransactionId>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_product(&self, product: ProductListing) {
        self.products
            .write()
            .await
            .insert(product.id.clone(), product);
    }

    pub async fn add_offer(&self, offer: Offer) {
        self.offers.write().await.insert(offer.id.clone(), offer);
    }

    /// The transaction that sold `product_id`, if any.
    pub async fn sold_by(&self, product_id: &str) -> Option<TransactionId> {
        self.sold_by.read().await.get(product_id).copied()
    }
}

#[async_trait]
impl ProductCatalog for InMemoryCatalog {
    async fn product(&self, product_id: &str) -> Result<Option<ProductListing>> {
        Ok(self.products.read().await.get(product_id).cloned())
    }

    async fn offer(&self, offer_id: &str) -> Result<Option<Offer>> {
        Ok(self.offers.read().await.get(offer_id).cloned())
    }

    async fn mark_sold(&self, product_id: &str, transaction_id: TransactionId) -> Result<()> {
        let mut products = self.products.write().await;
        let product = products
            .get_mut(product_id)
            .ok_or_else(|| PaymentError::not_found("product", product_id))?;
        let mut sold_by = self.sold_by.write().await;
        match sold_by.get(product_id) {
            Some(existing) if *existing == transaction_id => Ok(()),
            Some(existing) => Err(PaymentError::Conflict(format!(
                "product {product_id} already sold by transaction {existing}"
            ))),
            None => {
                product.status = ListingStatus::Sold;
                sold_by.insert(product_id.to_string(), transaction_id);
                Ok(())
            }
        }
    }
}

/// Order service that hands out one order id per transaction.
#[derive(Default, Clone)]
pub struct InMemoryOrderService {
    orders: Arc<RwLock<HashMap<TransactionId, String>>>,
}

impl InMemoryOrderService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }
}

#[async_trait]
impl OrderService for InMemoryOrderService {
    async fn create_order(&self, txn: &EscrowTransaction) -> Result<String> {
        let mut orders = self.orders.write().await;
        let id = orders
            .entry(txn.id)
            .or_insert_with(|| format!("ord_{}", txn.id.simple()));
        Ok(id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::escrow::tests::sample_transaction;
    use crate::domain::money::{Currency, Money};
    use crate::domain::wallet::EntryMetadata;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_escrow_compare_and_swap() {
        let store = InMemoryEscrowStore::new();
        let mut txn = sample_transaction();
        txn.gateway_transaction_id = Some("pi_1".into());
        store.insert(txn.clone()).await.unwrap();

        let stored = store.get(txn.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);

        let saved = store.compare_and_swap(stored.clone(), 1).await.unwrap();
        assert_eq!(saved.version, 2);
        assert!(matches!(
            store.compare_and_swap(stored, 1).await,
            Err(PaymentError::Conflict(_))
        ));

        let found = store
            .find_by_gateway_reference(&txn.payment_gateway, "pi_1")
            .await
            .unwrap();
        assert_eq!(found.map(|t| t.id), Some(txn.id));
        assert!(
            store
                .find_by_gateway_reference("other", "pi_1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_wallet_create_requires_version_zero() {
        let store = InMemoryWalletStore::new();
        let wallet = Wallet::new("u1", Utc::now());
        let saved = store.compare_and_swap(wallet.clone(), 0).await.unwrap();
        assert_eq!(saved.version, 1);
        assert!(matches!(
            store.compare_and_swap(wallet, 0).await,
            Err(PaymentError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_wallet_find_by_payout_id() {
        let store = InMemoryWalletStore::new();
        let mut wallet = Wallet::new("u1", Utc::now());
        wallet
            .credit(
                &Money::new(dec!(10), Currency::new("USD").unwrap()),
                "seed",
                EntryMetadata::Adjustment {
                    reference: "r1".into(),
                },
                Utc::now(),
            )
            .unwrap();
        store.compare_and_swap(wallet, 0).await.unwrap();
        assert!(store.find_by_payout_id("po_1").await.unwrap().is_none());
        assert_eq!(store.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_sold_is_idempotent_per_transaction() {
        let catalog = InMemoryCatalog::new();
        catalog
            .add_product(ProductListing {
                id: "p1".into(),
                seller_id: "s1".into(),
                price: dec!(100),
                currency: Currency::new("USD").unwrap(),
                category_id: None,
                shipping_cost: dec!(0),
                status: ListingStatus::Available,
            })
            .await;
        let txn = uuid::Uuid::new_v4();
        catalog.mark_sold("p1", txn).await.unwrap();
        catalog.mark_sold("p1", txn).await.unwrap();
        assert!(catalog.mark_sold("p1", uuid::Uuid::new_v4()).await.is_err());
        assert_eq!(
            catalog.product("p1").await.unwrap().unwrap().status,
            ListingStatus::Sold
        );
    }

    #[tokio::test]
    async fn test_order_per_transaction() {
        let orders = InMemoryOrderService::new();
        let txn = sample_transaction();
        let a = orders.create_order(&txn).await.unwrap();
        let b = orders.create_order(&txn).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(orders.order_count().await, 1);
    }
}
