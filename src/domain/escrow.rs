use super::fees::AppliedRule;
use super::money::{Currency, Money};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type TransactionId = Uuid;
pub type UserId = String;

/// Lifecycle of an escrow transaction.
///
/// The happy path is `PendingPayment -> PaymentProcessing -> FundsHeld ->
/// Shipped -> Completed`. `PaymentFailed`, `Cancelled`, `Disputed` and
/// `Refunded` are side branches entered only through explicit edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    PendingPayment,
    PaymentProcessing,
    FundsHeld,
    Shipped,
    Completed,
    PaymentFailed,
    Cancelled,
    Disputed,
    Refunded,
}

impl EscrowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PaymentFailed | Self::Cancelled | Self::Refunded
        )
    }

    /// The allowed edge set. Anything not listed here is an invalid transition.
    pub fn can_transition_to(self, next: EscrowStatus) -> bool {
        use EscrowStatus::*;
        matches!(
            (self, next),
            (PendingPayment, PaymentProcessing)
                | (PendingPayment, PaymentFailed)
                | (PendingPayment, Cancelled)
                | (PendingPayment, Disputed)
                | (PaymentProcessing, FundsHeld)
                | (PaymentProcessing, PaymentFailed)
                | (PaymentProcessing, Cancelled)
                | (PaymentProcessing, Disputed)
                | (FundsHeld, Shipped)
                | (FundsHeld, Disputed)
                | (FundsHeld, Refunded)
                | (Shipped, Completed)
                | (Shipped, Disputed)
                | (Shipped, Refunded)
                | (Disputed, Completed)
                | (Disputed, Refunded)
                | (Disputed, Cancelled)
        )
    }

    /// Position along the happy path, `None` for side branches.
    ///
    /// Used to recognise a webhook that arrives after the transaction already
    /// moved past the state the event would produce.
    pub fn progress(self) -> Option<u8> {
        match self {
            Self::PendingPayment => Some(0),
            Self::PaymentProcessing => Some(1),
            Self::FundsHeld => Some(2),
            Self::Shipped => Some(3),
            Self::Completed => Some(4),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingPayment => "pending_payment",
            Self::PaymentProcessing => "payment_processing",
            Self::FundsHeld => "funds_held",
            Self::Shipped => "shipped",
            Self::Completed => "completed",
            Self::PaymentFailed => "payment_failed",
            Self::Cancelled => "cancelled",
            Self::Disputed => "disputed",
            Self::Refunded => "refunded",
        }
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the append-only status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: EscrowStatus,
    pub timestamp: DateTime<Utc>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeePayer {
    Buyer,
    Seller,
}

/// Price components of a transaction, all in `currency`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub product_price: Decimal,
    pub platform_fee_amount: Decimal,
    pub gateway_fee_amount: Decimal,
    pub shipping_cost: Decimal,
    pub sales_tax: Decimal,
    pub total_amount: Decimal,
    pub currency: Currency,
    pub gateway_fee_paid_by: FeePayer,
    pub applied_fee_rule: AppliedRule,
}

impl PriceBreakdown {
    /// Everything the buyer pays before the gateway fee is considered.
    pub fn subtotal(
        product_price: Decimal,
        platform_fee_amount: Decimal,
        shipping_cost: Decimal,
        sales_tax: Decimal,
    ) -> Decimal {
        product_price + platform_fee_amount + shipping_cost + sales_tax
    }

    /// The amount the buyer is charged for the given components.
    pub fn expected_total(&self) -> Decimal {
        let gateway = match self.gateway_fee_paid_by {
            FeePayer::Buyer => self.gateway_fee_amount,
            FeePayer::Seller => Decimal::ZERO,
        };
        self.currency.round(
            Self::subtotal(
                self.product_price,
                self.platform_fee_amount,
                self.shipping_cost,
                self.sales_tax,
            ) + gateway,
        )
    }

    /// Whether `total_amount` matches its components within one minor unit.
    pub fn is_conserved(&self) -> bool {
        (self.total_amount - self.expected_total()).abs() <= self.currency.tolerance()
    }

    /// What the seller is credited on completion: the item and shipping,
    /// less the platform commission, less the gateway fee when the seller bears it.
    pub fn seller_net(&self) -> Decimal {
        let gateway = match self.gateway_fee_paid_by {
            FeePayer::Seller => self.gateway_fee_amount,
            FeePayer::Buyer => Decimal::ZERO,
        };
        self.currency
            .round(self.product_price + self.shipping_cost - self.platform_fee_amount - gateway)
    }

    pub fn total(&self) -> Money {
        Money::new(self.total_amount, self.currency.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub recipient: String,
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    #[serde(default)]
    pub region: Option<String>,
    pub postal_code: String,
    /// ISO-3166 alpha-2.
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub carrier: String,
    pub tracking_number: String,
    pub shipped_at: DateTime<Utc>,
}

/// Follow-up work triggered by a confirmed payment. Each flag is set once the
/// step succeeded, so a replayed event can resume only what is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fulfillment {
    /// The provider confirmed the charge. Tracked separately from the status
    /// because a dispute can be opened before the payment lands.
    #[serde(default)]
    pub funds_received: bool,
    pub product_marked_sold: bool,
    pub order_id: Option<String>,
    pub seller_credited: bool,
}

/// One buyer/seller/product exchange held in escrow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowTransaction {
    pub id: TransactionId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub product_id: String,
    pub offer_id: Option<String>,
    pub pricing: PriceBreakdown,
    pub payment_gateway: String,
    pub gateway_transaction_id: Option<String>,
    /// What the provider actually charges, which differs from the total when
    /// the adapter settles in another currency.
    pub charged_amount: Option<Money>,
    pub shipping_address: ShippingAddress,
    pub shipment: Option<Shipment>,
    pub fulfillment: Fulfillment,
    status: EscrowStatus,
    status_history: Vec<StatusChange>,
    /// Optimistic concurrency token, bumped on every successful store write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inputs needed to open a new transaction.
#[derive(Debug, Clone)]
pub struct NewEscrowTransaction {
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub product_id: String,
    pub offer_id: Option<String>,
    pub pricing: PriceBreakdown,
    pub payment_gateway: String,
    pub shipping_address: ShippingAddress,
}

impl EscrowTransaction {
    pub fn open(new: NewEscrowTransaction, now: DateTime<Utc>) -> Result<Self> {
        if !new.pricing.is_conserved() {
            return Err(PaymentError::ValidationError(format!(
                "Total {} does not match price components (expected {})",
                new.pricing.total_amount,
                new.pricing.expected_total()
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            buyer_id: new.buyer_id,
            seller_id: new.seller_id,
            product_id: new.product_id,
            offer_id: new.offer_id,
            pricing: new.pricing,
            payment_gateway: new.payment_gateway,
            gateway_transaction_id: None,
            charged_amount: None,
            shipping_address: new.shipping_address,
            shipment: None,
            fulfillment: Fulfillment::default(),
            status: EscrowStatus::PendingPayment,
            status_history: vec![StatusChange {
                status: EscrowStatus::PendingPayment,
                timestamp: now,
                note: Some("Transaction created".to_string()),
            }],
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn status(&self) -> EscrowStatus {
        self.status
    }

    pub fn status_history(&self) -> &[StatusChange] {
        &self.status_history
    }

    /// Moves to `next`, appending to the status log.
    ///
    /// Re-stating the current status or taking an edge outside the allowed
    /// set fails with `InvalidTransition` and leaves the log untouched.
    pub fn transition(
        &mut self,
        next: EscrowStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PaymentError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.status_history.push(StatusChange {
            status: next,
            timestamp: now,
            note,
        });
        self.updated_at = now;
        Ok(())
    }

    /// Whether the buyer's money reached the provider, either recorded
    /// directly or implied by having held funds at some point.
    pub fn funds_received(&self) -> bool {
        self.fulfillment.funds_received
            || self
                .status_history
                .iter()
                .any(|c| c.status == EscrowStatus::FundsHeld)
    }

    pub fn is_party(&self, user_id: &str) -> bool {
        self.buyer_id == user_id || self.seller_id == user_id
    }
}
