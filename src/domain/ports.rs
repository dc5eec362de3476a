use super::escrow::{EscrowTransaction, TransactionId, UserId};
use super::fees::PlatformFeeConfig;
use super::gateway::PaymentGatewayConfig;
use super::money::Currency;
use super::payout::PayoutDestination;
use super::wallet::Wallet;
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Persistence for escrow transactions.
///
/// Writes are compare-and-swap on `version` so two webhook deliveries racing
/// on the same transaction cannot both apply.
#[async_trait]
pub trait EscrowStore: Send + Sync {
    async fn insert(&self, txn: EscrowTransaction) -> Result<()>;
    async fn get(&self, id: TransactionId) -> Result<Option<EscrowTransaction>>;
    async fn find_by_gateway_reference(
        &self,
        gateway: &str,
        gateway_transaction_id: &str,
    ) -> Result<Option<EscrowTransaction>>;
    /// Stores `txn` if the stored version still equals `expected_version`,
    /// returning the stored copy with its bumped version. `Conflict` otherwise.
    async fn compare_and_swap(
        &self,
        txn: EscrowTransaction,
        expected_version: u64,
    ) -> Result<EscrowTransaction>;
    async fn all(&self) -> Result<Vec<EscrowTransaction>>;
}

/// Persistence for wallets, with the same optimistic concurrency contract.
/// `expected_version == 0` creates the wallet and fails if it already exists.
#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<Wallet>>;
    async fn compare_and_swap(&self, wallet: Wallet, expected_version: u64) -> Result<Wallet>;
    async fn find_by_payout_id(&self, payout_id: &str) -> Result<Option<Wallet>>;
    async fn all(&self) -> Result<Vec<Wallet>>;
}

#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn store(&self, destination: PayoutDestination) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<PayoutDestination>>;
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<PayoutDestination>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Available,
    Reserved,
    Sold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductListing {
    pub id: String,
    pub seller_id: UserId,
    pub price: Decimal,
    pub currency: Currency,
    pub category_id: Option<String>,
    pub shipping_cost: Decimal,
    pub status: ListingStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub product_id: String,
    pub buyer_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    pub accepted: bool,
}

/// The product catalogue, owned by another part of the marketplace.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn product(&self, product_id: &str) -> Result<Option<ProductListing>>;
    async fn offer(&self, offer_id: &str) -> Result<Option<Offer>>;
    /// Idempotent: marking an already-sold product sold again succeeds.
    async fn mark_sold(&self, product_id: &str, transaction_id: TransactionId) -> Result<()>;
}

/// Downstream order creation, owned by the order subsystem.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Returns the order id. Must be idempotent per transaction id.
    async fn create_order(&self, txn: &EscrowTransaction) -> Result<String>;
}

/// Where gateway and fee configuration is read from at start-up and on reload.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn gateway_configs(&self) -> Result<Vec<PaymentGatewayConfig>>;
    async fn fee_configs(&self) -> Result<Vec<PlatformFeeConfig>>;
}

/// Supplier of exchange rates quoted against `base`.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch(&self, base: &Currency) -> Result<HashMap<Currency, Decimal>>;
}

pub type EscrowStoreBox = Arc<dyn EscrowStore>;
pub type WalletStoreBox = Arc<dyn WalletStore>;
pub type DestinationStoreBox = Arc<dyn DestinationStore>;
pub type ProductCatalogBox = Arc<dyn ProductCatalog>;
pub type OrderServiceBox = Arc<dyn OrderService>;
pub type ConfigSourceBox = Arc<dyn ConfigSource>;
pub type RateSourceBox = Arc<dyn RateSource>;
