//! Escrow lifecycle orchestration.
//!
//! `EscrowService` prices and opens transactions, starts payments through the
//! gateway registry and applies the party-driven transitions. Provider-driven
//! transitions arrive through the webhook processor, which uses the same
//! [`EscrowService::update`] primitive.

use super::currency::CurrencyConverter;
use super::fees::FeeSchedule;
use super::ledger::WalletLedger;
use super::registry::GatewayRegistry;
use crate::config::{TaxRate, sales_tax_percentage};
use crate::domain::escrow::{
    EscrowStatus, EscrowTransaction, FeePayer, Fulfillment, NewEscrowTransaction, PriceBreakdown,
    Shipment, ShippingAddress, StatusChange, TransactionId, UserId,
};
use crate::domain::fees::FeeContext;
use crate::domain::gateway::{
    GatewayBox, PaymentContext, PaymentHandle, PaymentMethod, RefundContext, RefundResult,
    RefundStatus,
};
use crate::domain::money::Currency;
use crate::domain::ports::{
    EscrowStoreBox, ListingStatus, OrderServiceBox, ProductCatalogBox, ProductListing,
};
use crate::error::{PaymentError, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const MAX_UPDATE_ATTEMPTS: u32 = 8;

/// Transaction creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub buyer_id: UserId,
    pub product_id: String,
    #[serde(default)]
    pub offer_id: Option<String>,
    /// Explicit gateway; the cheapest eligible one is chosen when absent.
    #[serde(default)]
    pub payment_gateway: Option<String>,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    pub shipping_address: ShippingAddress,
    pub gateway_fee_paid_by: FeePayer,
    pub currency: Currency,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub transaction_id: TransactionId,
    pub status: EscrowStatus,
    pub breakdown: PriceBreakdown,
    pub payment: PaymentHandle,
}

/// Price computed for a checkout, before anything is stored.
#[derive(Clone)]
pub struct PricedCheckout {
    pub product: ProductListing,
    pub breakdown: PriceBreakdown,
    pub gateway: GatewayBox,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub transaction_id: TransactionId,
    pub status: EscrowStatus,
    pub history: Vec<StatusChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolution {
    /// Complete the sale and pay the seller.
    Release,
    /// Return the charge to the buyer.
    Refund,
}

/// Collaborators of [`EscrowService`].
pub struct EscrowDeps {
    pub store: EscrowStoreBox,
    pub catalog: ProductCatalogBox,
    pub orders: OrderServiceBox,
    pub registry: Arc<GatewayRegistry>,
    pub fees: Arc<FeeSchedule>,
    pub converter: Arc<CurrencyConverter>,
    pub ledger: Arc<WalletLedger>,
    pub tax_rates: Vec<TaxRate>,
}

pub struct EscrowService {
    store: EscrowStoreBox,
    catalog: ProductCatalogBox,
    orders: OrderServiceBox,
    registry: Arc<GatewayRegistry>,
    fees: Arc<FeeSchedule>,
    converter: Arc<CurrencyConverter>,
    ledger: Arc<WalletLedger>,
    tax_rates: Vec<TaxRate>,
}

impl EscrowService {
    pub fn new(deps: EscrowDeps) -> Self {
        Self {
            store: deps.store,
            catalog: deps.catalog,
            orders: deps.orders,
            registry: deps.registry,
            fees: deps.fees,
            converter: deps.converter,
            ledger: deps.ledger,
            tax_rates: deps.tax_rates,
        }
    }

    pub fn registry(&self) -> &Arc<GatewayRegistry> {
        &self.registry
    }

    pub async fn get(&self, id: TransactionId) -> Result<EscrowTransaction> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PaymentError::not_found("transaction", id))
    }

    pub async fn find_by_gateway_reference(
        &self,
        gateway: &str,
        gateway_transaction_id: &str,
    ) -> Result<Option<EscrowTransaction>> {
        self.store
            .find_by_gateway_reference(gateway, gateway_transaction_id)
            .await
    }

    /// Applies `mutate` to the latest stored copy and writes it back with
    /// compare-and-swap, retrying on conflict.
    ///
    /// An error from `mutate` aborts without writing; an unchanged copy is
    /// not written.
    pub async fn update<T, F>(&self, id: TransactionId, mut mutate: F) -> Result<(EscrowTransaction, T)>
    where
        F: FnMut(&mut EscrowTransaction) -> Result<T>,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let original = self.get(id).await?;
            let mut txn = original.clone();
            let out = mutate(&mut txn)?;
            if txn == original {
                return Ok((txn, out));
            }
            match self.store.compare_and_swap(txn, original.version).await {
                Ok(saved) => return Ok((saved, out)),
                Err(PaymentError::Conflict(reason)) => {
                    debug!(transaction_id = %id, attempt, %reason, "transaction write conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(PaymentError::Conflict(format!(
            "transaction {id} still contended after {MAX_UPDATE_ATTEMPTS} attempts"
        )))
    }

    /// Computes the price breakdown and picks the gateway for a checkout.
    pub async fn price(&self, req: &CheckoutRequest) -> Result<PricedCheckout> {
        let product = self
            .catalog
            .product(&req.product_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("product", &req.product_id))?;
        if product.status != ListingStatus::Available {
            return Err(PaymentError::ValidationError(format!(
                "Product {} is not available",
                product.id
            )));
        }
        if product.seller_id == req.buyer_id {
            return Err(PaymentError::ValidationError(
                "Sellers cannot buy their own products".to_string(),
            ));
        }

        let (list_price, list_currency) = match &req.offer_id {
            Some(offer_id) => {
                let offer = self
                    .catalog
                    .offer(offer_id)
                    .await?
                    .ok_or_else(|| PaymentError::not_found("offer", offer_id))?;
                if offer.product_id != product.id || offer.buyer_id != req.buyer_id || !offer.accepted
                {
                    return Err(PaymentError::ValidationError(format!(
                        "Offer {offer_id} is not an accepted offer for this buyer and product"
                    )));
                }
                (offer.amount, offer.currency)
            }
            None => (product.price, product.currency.clone()),
        };

        let currency = &req.currency;
        let product_price = self
            .converter
            .convert(list_price, &list_currency, currency)
            .await?;
        let shipping_cost = self
            .converter
            .convert(product.shipping_cost, &product.currency, currency)
            .await?;

        let fee = self
            .fees
            .quote(
                &FeeContext {
                    amount: product_price,
                    currency: currency.clone(),
                    category_id: product.category_id.clone(),
                    user_id: Some(product.seller_id.clone()),
                },
                Utc::now(),
            )
            .await?;

        let address = &req.shipping_address;
        let tax_percentage =
            sales_tax_percentage(&self.tax_rates, &address.country, address.region.as_deref());
        let sales_tax = currency.round(product_price * tax_percentage / Decimal::ONE_HUNDRED);

        let subtotal = PriceBreakdown::subtotal(product_price, fee.fee, shipping_cost, sales_tax);
        let gateway = self.select_gateway(req, subtotal).await?;

        let mut breakdown = PriceBreakdown {
            product_price,
            platform_fee_amount: fee.fee,
            gateway_fee_amount: gateway.calculate_gateway_fee(subtotal, currency),
            shipping_cost,
            sales_tax,
            total_amount: Decimal::ZERO,
            currency: currency.clone(),
            gateway_fee_paid_by: req.gateway_fee_paid_by,
            applied_fee_rule: fee.applied_rule,
        };
        breakdown.total_amount = breakdown.expected_total();

        Ok(PricedCheckout {
            product,
            breakdown,
            gateway,
        })
    }

    async fn select_gateway(&self, req: &CheckoutRequest, amount: Decimal) -> Result<GatewayBox> {
        let currency = &req.currency;
        let Some(name) = &req.payment_gateway else {
            return self
                .registry
                .best_for(amount, currency, req.payment_method.as_ref())
                .await;
        };
        let gateway = self.registry.get(name).await?;
        if !gateway.is_configured() {
            return Err(PaymentError::GatewayNotConfigured(name.clone()));
        }
        if !gateway.is_currency_supported(currency) {
            return Err(PaymentError::unsupported_currency(
                currency,
                format!("gateway {name}"),
            ));
        }
        if let Some(method) = &req.payment_method
            && !gateway.supports_method(method)
        {
            return Err(PaymentError::ValidationError(format!(
                "Gateway {name} does not accept {method:?}"
            )));
        }
        if !gateway.config().limits.allows(amount) {
            return Err(PaymentError::ValidationError(format!(
                "Amount {amount} {currency} is outside the limits of gateway {name}"
            )));
        }
        Ok(gateway)
    }

    /// Prices, opens and starts paying for a transaction.
    ///
    /// A gateway failure leaves the transaction in `payment_failed` and is
    /// returned to the caller.
    pub async fn checkout(&self, req: CheckoutRequest) -> Result<CheckoutResponse> {
        let priced = self.price(&req).await?;
        let gateway = priced.gateway;
        let gateway_name = gateway.name().to_string();

        let txn = EscrowTransaction::open(
            NewEscrowTransaction {
                buyer_id: req.buyer_id.clone(),
                seller_id: priced.product.seller_id.clone(),
                product_id: priced.product.id.clone(),
                offer_id: req.offer_id.clone(),
                pricing: priced.breakdown,
                payment_gateway: gateway_name.clone(),
                shipping_address: req.shipping_address,
            },
            Utc::now(),
        )?;
        let id = txn.id;
        let total = txn.pricing.total();
        self.store.insert(txn).await?;
        info!(transaction_id = %id, gateway = %gateway_name, total = %total, "escrow transaction opened");

        let ctx = PaymentContext {
            transaction_id: id,
            amount: total.clone(),
            buyer_id: req.buyer_id,
            description: format!("Marketplace order for product {}", req.product_id),
            payment_method: req.payment_method,
            idempotency_key: id.to_string(),
            return_url: gateway.config().return_url.clone(),
        };

        match gateway.initialize_payment(&ctx).await {
            Ok(handle) => {
                self.registry
                    .record_attempt(&gateway_name, total.amount, true)
                    .await;
                let (txn, _) = self
                    .update(id, |t| {
                        if t.gateway_transaction_id.is_none() {
                            t.gateway_transaction_id = Some(handle.gateway_transaction_id.clone());
                        }
                        if t.charged_amount.is_none() {
                            t.charged_amount = Some(handle.charged.clone());
                        }
                        // A fast webhook may already have moved the transaction on.
                        if t.status() == EscrowStatus::PendingPayment {
                            t.transition(
                                EscrowStatus::PaymentProcessing,
                                Some(format!("Payment initialised with {gateway_name}")),
                                Utc::now(),
                            )?;
                        }
                        Ok(())
                    })
                    .await?;
                info!(transaction_id = %id, gateway_transaction_id = %handle.gateway_transaction_id, "payment initialised");
                Ok(CheckoutResponse {
                    transaction_id: id,
                    status: txn.status(),
                    breakdown: txn.pricing,
                    payment: handle,
                })
            }
            Err(e) => {
                self.registry
                    .record_attempt(&gateway_name, total.amount, false)
                    .await;
                warn!(transaction_id = %id, gateway = %gateway_name, error = %e, "payment initialisation failed");
                let note = format!("Payment initialisation failed: {e}");
                self.update(id, |t| {
                    if t.status() == EscrowStatus::PendingPayment {
                        t.transition(EscrowStatus::PaymentFailed, Some(note.clone()), Utc::now())?;
                    }
                    Ok(())
                })
                .await?;
                Err(e)
            }
        }
    }

    pub async fn status(&self, id: TransactionId) -> Result<StatusView> {
        let txn = self.get(id).await?;
        Ok(StatusView {
            transaction_id: txn.id,
            status: txn.status(),
            history: txn.status_history().to_vec(),
        })
    }

    pub async fn mark_shipped(
        &self,
        id: TransactionId,
        seller_id: &str,
        carrier: &str,
        tracking_number: &str,
    ) -> Result<EscrowTransaction> {
        if carrier.trim().is_empty() || tracking_number.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "Carrier and tracking number are required".to_string(),
            ));
        }
        let (txn, _) = self
            .update(id, |t| {
                if t.seller_id != seller_id {
                    return Err(PaymentError::ValidationError(
                        "Only the seller can mark a transaction shipped".to_string(),
                    ));
                }
                let now = Utc::now();
                t.transition(
                    EscrowStatus::Shipped,
                    Some(format!("Shipped via {carrier}, tracking {tracking_number}")),
                    now,
                )?;
                t.shipment = Some(Shipment {
                    carrier: carrier.to_string(),
                    tracking_number: tracking_number.to_string(),
                    shipped_at: now,
                });
                Ok(())
            })
            .await?;
        info!(transaction_id = %id, carrier, "transaction shipped");
        Ok(txn)
    }

    /// Buyer confirmation. Completes the sale and releases the seller's proceeds.
    pub async fn confirm_delivery(&self, id: TransactionId, buyer_id: &str) -> Result<EscrowTransaction> {
        let (txn, _) = self
            .update(id, |t| {
                if t.buyer_id != buyer_id {
                    return Err(PaymentError::ValidationError(
                        "Only the buyer can confirm delivery".to_string(),
                    ));
                }
                t.transition(
                    EscrowStatus::Completed,
                    Some("Delivery confirmed by buyer".to_string()),
                    Utc::now(),
                )
            })
            .await?;
        self.release_funds(txn).await
    }

    /// Completion by the delivery timeout policy.
    pub async fn auto_confirm_delivery(&self, id: TransactionId) -> Result<EscrowTransaction> {
        let (txn, _) = self
            .update(id, |t| {
                t.transition(
                    EscrowStatus::Completed,
                    Some("Delivery confirmed automatically after timeout".to_string()),
                    Utc::now(),
                )
            })
            .await?;
        self.release_funds(txn).await
    }

    /// Credits the seller for a completed transaction, once.
    async fn release_funds(&self, txn: EscrowTransaction) -> Result<EscrowTransaction> {
        if txn.status() != EscrowStatus::Completed || txn.fulfillment.seller_credited {
            return Ok(txn);
        }
        self.ledger.credit_sale(&txn).await?;
        let (txn, _) = self
            .update(txn.id, |t| {
                t.fulfillment.seller_credited = true;
                Ok(())
            })
            .await?;
        Ok(txn)
    }

    /// Buyer-initiated cancellation, honoured only before a payment exists.
    pub async fn cancel(&self, id: TransactionId, user_id: &str) -> Result<EscrowTransaction> {
        let (txn, _) = self
            .update(id, |t| {
                if t.buyer_id != user_id {
                    return Err(PaymentError::ValidationError(
                        "Only the buyer can cancel a checkout".to_string(),
                    ));
                }
                if t.status() == EscrowStatus::PaymentProcessing {
                    return Err(PaymentError::ValidationError(
                        "Payment is in flight; cancellation needs provider confirmation".to_string(),
                    ));
                }
                t.transition(
                    EscrowStatus::Cancelled,
                    Some("Cancelled by buyer".to_string()),
                    Utc::now(),
                )
            })
            .await?;
        info!(transaction_id = %id, "transaction cancelled");
        Ok(txn)
    }

    pub async fn raise_dispute(
        &self,
        id: TransactionId,
        user_id: &str,
        reason: &str,
    ) -> Result<EscrowTransaction> {
        let (txn, _) = self
            .update(id, |t| {
                if !t.is_party(user_id) {
                    return Err(PaymentError::ValidationError(
                        "Only the buyer or seller can open a dispute".to_string(),
                    ));
                }
                t.transition(
                    EscrowStatus::Disputed,
                    Some(format!("Dispute raised by {user_id}: {reason}")),
                    Utc::now(),
                )
            })
            .await?;
        warn!(transaction_id = %id, user_id, "dispute raised");
        Ok(txn)
    }

    /// Operator decision on a disputed transaction.
    ///
    /// Release needs the payment on record. Refunding a dispute that was
    /// never paid cancels it without calling the provider.
    pub async fn resolve_dispute(
        &self,
        id: TransactionId,
        resolution: DisputeResolution,
        note: &str,
    ) -> Result<EscrowTransaction> {
        let txn = self.get(id).await?;
        if txn.status() != EscrowStatus::Disputed {
            let to = match resolution {
                DisputeResolution::Release => EscrowStatus::Completed,
                DisputeResolution::Refund => EscrowStatus::Refunded,
            };
            return Err(PaymentError::InvalidTransition {
                from: txn.status(),
                to,
            });
        }
        info!(transaction_id = %id, ?resolution, paid = txn.funds_received(), "resolving dispute");
        match resolution {
            DisputeResolution::Release => {
                let (txn, _) = self
                    .update(id, |t| {
                        if !t.funds_received() {
                            return Err(PaymentError::ValidationError(format!(
                                "Transaction {} has no confirmed payment to release",
                                t.id
                            )));
                        }
                        t.transition(
                            EscrowStatus::Completed,
                            Some(format!("Dispute released to seller: {note}")),
                            Utc::now(),
                        )
                    })
                    .await?;
                if !txn.fulfillment.product_marked_sold || txn.fulfillment.order_id.is_none() {
                    self.run_fulfillment(id).await?;
                }
                self.release_funds(self.get(id).await?).await
            }
            DisputeResolution::Refund if !txn.funds_received() => {
                let (txn, _) = self
                    .update(id, |t| {
                        if t.funds_received() {
                            return Err(PaymentError::Conflict(format!(
                                "Payment for {} landed while resolving the dispute",
                                t.id
                            )));
                        }
                        t.transition(
                            EscrowStatus::Cancelled,
                            Some(format!("Unpaid dispute closed: {note}")),
                            Utc::now(),
                        )
                    })
                    .await?;
                if txn.gateway_transaction_id.is_some() {
                    warn!(transaction_id = %id, "unpaid dispute closed with a provider payment still open");
                }
                Ok(txn)
            }
            DisputeResolution::Refund => self.refund_with_gateway(txn, note).await,
        }
    }

    /// Operator refund of held funds, before the sale completes.
    pub async fn refund(&self, id: TransactionId, reason: &str) -> Result<EscrowTransaction> {
        let txn = self.get(id).await?;
        if !matches!(
            txn.status(),
            EscrowStatus::FundsHeld | EscrowStatus::Shipped
        ) {
            return Err(PaymentError::InvalidTransition {
                from: txn.status(),
                to: EscrowStatus::Refunded,
            });
        }
        self.refund_with_gateway(txn, reason).await
    }

    async fn refund_with_gateway(
        &self,
        txn: EscrowTransaction,
        reason: &str,
    ) -> Result<EscrowTransaction> {
        let id = txn.id;
        let gateway = self.registry.get(&txn.payment_gateway).await?;
        let gateway_transaction_id = txn.gateway_transaction_id.clone().ok_or_else(|| {
            PaymentError::ValidationError(format!("Transaction {id} has no provider payment to refund"))
        })?;
        let amount = txn.charged_amount.clone().unwrap_or_else(|| txn.pricing.total());

        let result: RefundResult = gateway
            .process_refund(&RefundContext {
                transaction_id: id,
                gateway_transaction_id,
                amount,
                reason: Some(reason.to_string()),
                idempotency_key: format!("refund_{id}"),
            })
            .await?;
        if result.status == RefundStatus::Failed {
            return Err(PaymentError::GatewayRejected {
                gateway: txn.payment_gateway.clone(),
                message: format!("refund {} failed", result.refund_id),
            });
        }

        let (txn, _) = self
            .update(id, |t| {
                t.transition(
                    EscrowStatus::Refunded,
                    Some(format!("Refunded ({}): {reason}", result.refund_id)),
                    Utc::now(),
                )
            })
            .await
            .inspect_err(|e| {
                error!(
                    transaction_id = %id,
                    refund_id = %result.refund_id,
                    error = %e,
                    "refund issued but transaction not updated"
                );
            })?;
        info!(transaction_id = %id, refund_id = %result.refund_id, amount = %result.amount, "transaction refunded");
        Ok(txn)
    }

    /// Marks the product sold and creates the order for a paid transaction,
    /// skipping steps already done. Step failures are logged and left for
    /// [`Self::retry_pending_orders`].
    pub async fn run_fulfillment(&self, id: TransactionId) -> Result<Fulfillment> {
        let txn = self.get(id).await?;
        if !matches!(
            txn.status(),
            EscrowStatus::FundsHeld | EscrowStatus::Shipped | EscrowStatus::Completed
        ) {
            return Ok(txn.fulfillment);
        }

        let mut sold = txn.fulfillment.product_marked_sold;
        if !sold {
            match self.catalog.mark_sold(&txn.product_id, id).await {
                Ok(()) => {
                    info!(transaction_id = %id, product_id = %txn.product_id, "product marked sold");
                    sold = true;
                }
                Err(e) => {
                    warn!(transaction_id = %id, product_id = %txn.product_id, error = %e, "marking product sold failed")
                }
            }
        }

        let mut order_id = txn.fulfillment.order_id.clone();
        if order_id.is_none() {
            match self.orders.create_order(&txn).await {
                Ok(order) => {
                    info!(transaction_id = %id, order_id = %order, "order created");
                    order_id = Some(order);
                }
                Err(e) => {
                    warn!(transaction_id = %id, error = %e, "order creation failed, will retry")
                }
            }
        }

        let (txn, _) = self
            .update(id, |t| {
                t.fulfillment.product_marked_sold |= sold;
                if t.fulfillment.order_id.is_none() {
                    t.fulfillment.order_id = order_id.clone();
                }
                Ok(())
            })
            .await?;
        Ok(txn.fulfillment)
    }

    /// Sweeps paid transactions with unfinished follow-up work and completed
    /// ones whose seller was not credited. Returns how many were fully repaired.
    pub async fn retry_pending_orders(&self) -> Result<usize> {
        let mut repaired = 0;
        for txn in self.store.all().await? {
            let paid = matches!(
                txn.status(),
                EscrowStatus::FundsHeld | EscrowStatus::Shipped | EscrowStatus::Completed
            );
            let needs_fulfillment =
                !txn.fulfillment.product_marked_sold || txn.fulfillment.order_id.is_none();
            let needs_credit =
                txn.status() == EscrowStatus::Completed && !txn.fulfillment.seller_credited;
            if !paid || !(needs_fulfillment || needs_credit) {
                continue;
            }

            let fulfillment = self.run_fulfillment(txn.id).await?;
            let credited = if needs_credit {
                match self.release_funds(self.get(txn.id).await?).await {
                    Ok(t) => t.fulfillment.seller_credited,
                    Err(e) => {
                        warn!(transaction_id = %txn.id, error = %e, "seller credit retry failed");
                        false
                    }
                }
            } else {
                true
            };
            if fulfillment.product_marked_sold && fulfillment.order_id.is_some() && credited {
                repaired += 1;
            }
        }
        if repaired > 0 {
            info!(repaired, "pending follow-up work completed");
        }
        Ok(repaired)
    }
}
