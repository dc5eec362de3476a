//! The payment provider contract and the data that crosses it.

use super::escrow::{TransactionId, UserId};
use super::money::{Currency, Money};
use super::payout::DestinationType;
use super::wallet::PayoutStatus;
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Stripe,
    Paypal,
    Paytabs,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    PaypalBalance,
    BankTransfer,
    ApplePay,
    GooglePay,
    Mada,
}

/// Provider credentials. All optional: a provider without them is loaded
/// as unconfigured and excluded from selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayCredentials {
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub profile_id: Option<String>,
}

/// Fixed + percentage gateway fee with optional clamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayFeeStructure {
    #[serde(default)]
    pub fixed_amount: Decimal,
    #[serde(default)]
    pub percentage: Decimal,
    #[serde(default)]
    pub minimum_fee: Option<Decimal>,
    #[serde(default)]
    pub maximum_fee: Option<Decimal>,
}

impl GatewayFeeStructure {
    pub fn calculate(&self, amount: Decimal, currency: &Currency) -> Decimal {
        let mut fee = self.fixed_amount + amount * self.percentage / Decimal::ONE_HUNDRED;
        if let Some(min) = self.minimum_fee {
            fee = fee.max(min);
        }
        if let Some(max) = self.maximum_fee {
            fee = fee.min(max);
        }
        currency.round(fee)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionLimits {
    #[serde(default)]
    pub min_amount: Option<Decimal>,
    #[serde(default)]
    pub max_amount: Option<Decimal>,
}

impl TransactionLimits {
    pub fn allows(&self, amount: Decimal) -> bool {
        self.min_amount.is_none_or(|min| amount >= min)
            && self.max_amount.is_none_or(|max| amount <= max)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettlementInfo {
    /// Set when the provider only settles in one currency.
    #[serde(default)]
    pub currency: Option<Currency>,
    #[serde(default)]
    pub delay_days: u32,
}

/// Running counters. Only ever incremented.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayStats {
    pub total_transactions: u64,
    pub successful_transactions: u64,
    pub failed_transactions: u64,
    pub total_volume: Decimal,
}

impl GatewayStats {
    pub fn record(&mut self, amount: Decimal, success: bool) {
        self.total_transactions += 1;
        if success {
            self.successful_transactions += 1;
            self.total_volume += amount;
        } else {
            self.failed_transactions += 1;
        }
    }

    /// Percentage of successful initialisations, 0 when nothing was attempted.
    pub fn success_rate(&self) -> Decimal {
        if self.total_transactions == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.successful_transactions) * Decimal::ONE_HUNDRED
            / Decimal::from(self.total_transactions)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentGatewayConfig {
    pub name: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub sandbox: bool,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub credentials: GatewayCredentials,
    #[serde(default)]
    pub supported_currencies: Vec<Currency>,
    #[serde(default)]
    pub supported_methods: Vec<PaymentMethod>,
    #[serde(default)]
    pub fees: GatewayFeeStructure,
    #[serde(default)]
    pub limits: TransactionLimits,
    #[serde(default)]
    pub settlement: SettlementInfo,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub return_url: Option<String>,
    #[serde(default)]
    pub stats: GatewayStats,
}

fn default_true() -> bool {
    true
}

impl PaymentGatewayConfig {
    pub fn supports_currency(&self, currency: &Currency) -> bool {
        self.supported_currencies.contains(currency)
    }

    pub fn supports_method(&self, method: &PaymentMethod) -> bool {
        self.supported_methods.is_empty() || self.supported_methods.contains(method)
    }
}

/// What an adapter needs to start a payment.
#[derive(Debug, Clone)]
pub struct PaymentContext {
    pub transaction_id: TransactionId,
    pub amount: Money,
    pub buyer_id: UserId,
    pub description: String,
    pub payment_method: Option<PaymentMethod>,
    /// Reused on every retry so the provider never creates two charges.
    pub idempotency_key: String,
    pub return_url: Option<String>,
}

/// How the buyer completes the payment with the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PaymentAction {
    ClientSecret(String),
    RedirectUrl(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentHandle {
    pub gateway_transaction_id: String,
    pub action: PaymentAction,
    /// The amount the provider will charge, possibly converted.
    pub charged: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    /// The buyer approved the payment; the provider waits for a capture call.
    Approved,
    Completed,
    Failed,
    Cancelled,
}

/// Outcome of capturing an approved payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    pub status: PaymentStatus,
    pub capture_id: Option<String>,
    pub amount: Option<Money>,
}

#[derive(Debug, Clone)]
pub struct RefundContext {
    pub transaction_id: TransactionId,
    pub gateway_transaction_id: String,
    pub amount: Money,
    pub reason: Option<String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundResult {
    pub refund_id: String,
    pub status: RefundStatus,
    pub amount: Money,
}

/// Provider-specific event reduced to what reconciliation acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    /// Buyer approval of a payment that still has to be captured.
    PaymentApproved,
    PaymentCompleted,
    PaymentFailed {
        reason: Option<String>,
    },
    PaymentCancelled,
    DisputeCreated {
        dispute_id: Option<String>,
        reason: Option<String>,
    },
    Payout {
        payout_id: String,
        status: PayoutStatus,
        failure_code: Option<String>,
    },
    Unrecognized {
        provider_event: String,
    },
}

impl EventKind {
    pub fn event_type(&self) -> &str {
        match self {
            Self::PaymentApproved => "payment_approved",
            Self::PaymentCompleted => "payment_completed",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::PaymentCancelled => "payment_cancelled",
            Self::DisputeCreated { .. } => "dispute_created",
            Self::Payout { .. } => "payout_update",
            Self::Unrecognized { provider_event } => provider_event,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledEvent {
    pub gateway: String,
    pub event_id: Option<String>,
    pub kind: EventKind,
    /// Internal id carried back in provider metadata, when present.
    pub transaction_id: Option<TransactionId>,
    pub gateway_transaction_id: Option<String>,
    pub amount: Option<Money>,
}

/// The uniform contract every payment provider adapter implements.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &PaymentGatewayConfig;

    /// False when required credentials are missing. Payment operations then
    /// return `GatewayNotConfigured` instead of calling the provider.
    fn is_configured(&self) -> bool;

    /// Header carrying the webhook signature for this provider.
    fn signature_header(&self) -> &'static str;

    async fn initialize_payment(&self, ctx: &PaymentContext) -> Result<PaymentHandle>;

    async fn verify_payment(&self, gateway_transaction_id: &str) -> Result<PaymentStatus>;

    /// Collects an approved payment. Providers that capture on their own
    /// only report the current status.
    async fn capture_payment(
        &self,
        gateway_transaction_id: &str,
        _idempotency_key: &str,
    ) -> Result<CaptureResult> {
        Ok(CaptureResult {
            status: self.verify_payment(gateway_transaction_id).await?,
            capture_id: None,
            amount: None,
        })
    }

    async fn process_refund(&self, ctx: &RefundContext) -> Result<RefundResult>;

    /// Authenticates and decodes a raw webhook body.
    fn handle_webhook(&self, payload: &[u8], signature: &str) -> Result<ReconciledEvent>;

    fn calculate_gateway_fee(&self, amount: Decimal, currency: &Currency) -> Decimal {
        self.config().fees.calculate(amount, currency)
    }

    fn is_currency_supported(&self, currency: &Currency) -> bool {
        self.config().supports_currency(currency)
    }

    fn supports_method(&self, method: &PaymentMethod) -> bool {
        self.config().supports_method(method)
    }
}

pub type GatewayBox = Arc<dyn PaymentGateway>;

/// Outbound transfer of wallet funds to an external destination.
#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub user_id: UserId,
    pub amount: Money,
    pub destination_type: DestinationType,
    /// Provider-side reference of the destination (connected account, PayPal email token...).
    pub destination_reference: String,
    /// Wallet journal entry the payout settles; doubles as idempotency key.
    pub entry_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutReceipt {
    pub payout_id: String,
    pub status: PayoutStatus,
}

#[async_trait]
pub trait PayoutRail: Send + Sync {
    fn name(&self) -> &str;

    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<PayoutReceipt>;
}

pub type PayoutRailBox = Arc<dyn PayoutRail>;
