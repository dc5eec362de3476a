//! Webhook reconciliation.
//!
//! Every delivery is authenticated by the owning adapter before anything is
//! looked up. Handlers are idempotent and tolerate any delivery order: an
//! event whose effect is already in place acknowledges as a duplicate, and one
//! that arrives after a later state acknowledges as stale.

use super::escrow::EscrowService;
use super::payout::{PayoutOrchestrator, PayoutUpdate};
use crate::domain::escrow::{EscrowStatus, EscrowTransaction, TransactionId};
use crate::domain::gateway::{EventKind, PaymentStatus, ReconciledEvent};
use crate::error::{PaymentError, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The event moved the target forward.
    Applied {
        event_type: String,
        reference: String,
        status: String,
    },
    /// The event's effect was already in place.
    Duplicate { event_type: String, reference: String },
    /// The target already moved past the state this event would produce.
    Stale {
        event_type: String,
        reference: String,
        current: String,
    },
    /// Acknowledged without action.
    Ignored { event_type: String, reason: String },
}

/// What a webhook endpoint returns to the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookResponse {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WebhookOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

enum Decision {
    Moved(EscrowStatus),
    /// Recorded on the transaction without a status change.
    Recorded(EscrowStatus),
    Duplicate,
    Stale(EscrowStatus),
}

pub struct WebhookProcessor {
    escrow: Arc<EscrowService>,
    payouts: Arc<PayoutOrchestrator>,
}

impl WebhookProcessor {
    pub fn new(escrow: Arc<EscrowService>, payouts: Arc<PayoutOrchestrator>) -> Self {
        Self { escrow, payouts }
    }

    /// Endpoint entry point: `POST /webhooks/{gateway}` with the raw body.
    ///
    /// Successful and no-op deliveries return 200. Authentication failures,
    /// unknown targets and transient errors return the error's status so the
    /// provider redelivers.
    pub async fn handle(
        &self,
        gateway: &str,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> WebhookResponse {
        let result = match self.escrow.registry().get(gateway).await {
            Ok(adapter) => {
                let header = adapter.signature_header();
                let signature = headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(header))
                    .map(|(_, v)| v.as_str())
                    .unwrap_or_default();
                self.process(gateway, body, signature).await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(outcome) => WebhookResponse {
                status: 200,
                outcome: Some(outcome),
                error: None,
            },
            Err(e) => {
                warn!(gateway, error = %e, "webhook rejected");
                WebhookResponse {
                    status: e.http_status(),
                    outcome: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Authenticates, decodes and applies one delivery.
    pub async fn process(&self, gateway: &str, body: &[u8], signature: &str) -> Result<WebhookOutcome> {
        let adapter = self.escrow.registry().get(gateway).await?;
        let event = adapter.handle_webhook(body, signature)?;
        info!(
            gateway,
            event_type = event.kind.event_type(),
            event_id = event.event_id.as_deref().unwrap_or("-"),
            "webhook verified"
        );
        self.apply_event(event).await
    }

    /// Drives state from a decoded event.
    pub async fn apply_event(&self, event: ReconciledEvent) -> Result<WebhookOutcome> {
        let event_type = event.kind.event_type().to_string();
        match &event.kind {
            EventKind::Unrecognized { provider_event } => {
                info!(gateway = %event.gateway, provider_event, "unsupported webhook event acknowledged");
                Ok(WebhookOutcome::Ignored {
                    event_type,
                    reason: "unsupported event type".to_string(),
                })
            }
            EventKind::Payout {
                payout_id,
                status,
                failure_code,
            } => {
                let update = self
                    .payouts
                    .handle_payout_update(payout_id, *status, failure_code.clone())
                    .await?;
                let reference = payout_id.clone();
                Ok(match update {
                    PayoutUpdate::Applied { to, .. } => WebhookOutcome::Applied {
                        event_type,
                        reference,
                        status: to.as_str().to_string(),
                    },
                    PayoutUpdate::Duplicate => WebhookOutcome::Duplicate {
                        event_type,
                        reference,
                    },
                    PayoutUpdate::Stale { current } => WebhookOutcome::Stale {
                        event_type,
                        reference,
                        current: current.as_str().to_string(),
                    },
                })
            }
            EventKind::PaymentApproved => self.capture_approved(&event).await,
            _ => self.apply_payment_event(&event).await,
        }
    }

    /// Captures a payment the buyer approved and applies the capture result.
    /// Repeated approvals reuse one idempotency key, so the provider never
    /// collects twice.
    async fn capture_approved(&self, event: &ReconciledEvent) -> Result<WebhookOutcome> {
        let txn = self.locate(event).await?;
        let id = txn.id;
        let event_type = event.kind.event_type().to_string();
        if txn.funds_received() {
            return Ok(WebhookOutcome::Duplicate {
                event_type,
                reference: id.to_string(),
            });
        }
        if txn.status().is_terminal() {
            return Ok(WebhookOutcome::Stale {
                event_type,
                reference: id.to_string(),
                current: txn.status().to_string(),
            });
        }
        let reference = event
            .gateway_transaction_id
            .clone()
            .or_else(|| txn.gateway_transaction_id.clone())
            .ok_or_else(|| {
                PaymentError::ValidationError(format!("Transaction {id} has no provider payment yet"))
            })?;

        let gateway = self.escrow.registry().get(&txn.payment_gateway).await?;
        let capture = gateway
            .capture_payment(&reference, &format!("capture_{id}"))
            .await?;
        info!(
            transaction_id = %id,
            gateway = %txn.payment_gateway,
            status = ?capture.status,
            capture_id = capture.capture_id.as_deref().unwrap_or("-"),
            "approved payment captured"
        );

        let kind = match capture.status {
            PaymentStatus::Completed => EventKind::PaymentCompleted,
            PaymentStatus::Failed => EventKind::PaymentFailed {
                reason: Some("capture declined by provider".to_string()),
            },
            PaymentStatus::Cancelled => EventKind::PaymentCancelled,
            PaymentStatus::Pending | PaymentStatus::Approved => {
                return Ok(WebhookOutcome::Ignored {
                    event_type,
                    reason: "capture still pending".to_string(),
                });
            }
        };
        self.apply_payment_event(&ReconciledEvent {
            gateway: event.gateway.clone(),
            event_id: event.event_id.clone(),
            kind,
            transaction_id: Some(id),
            gateway_transaction_id: Some(reference),
            amount: capture.amount,
        })
        .await
    }

    /// Finds the target by the internal id carried in provider metadata,
    /// falling back to the provider's own payment reference.
    async fn locate(&self, event: &ReconciledEvent) -> Result<EscrowTransaction> {
        let by_id = match event.transaction_id {
            Some(id) => self.escrow.get(id).await.ok(),
            None => None,
        };
        let found = match (by_id, &event.gateway_transaction_id) {
            (Some(txn), _) => Some(txn),
            (None, Some(reference)) => {
                self.escrow
                    .find_by_gateway_reference(&event.gateway, reference)
                    .await?
            }
            (None, None) => None,
        };
        let txn = found.ok_or_else(|| {
            let reference = event
                .transaction_id
                .map(|id| id.to_string())
                .or_else(|| event.gateway_transaction_id.clone())
                .unwrap_or_else(|| "-".to_string());
            PaymentError::not_found("transaction", reference)
        })?;
        if txn.payment_gateway != event.gateway {
            return Err(PaymentError::ValidationError(format!(
                "Transaction {} is not paid through {}",
                txn.id, event.gateway
            )));
        }
        Ok(txn)
    }

    async fn apply_payment_event(&self, event: &ReconciledEvent) -> Result<WebhookOutcome> {
        let txn = self.locate(event).await?;
        let id = txn.id;
        let event_type = event.kind.event_type().to_string();

        let (txn, decision) = self
            .escrow
            .update(id, |t| {
                if t.gateway_transaction_id.is_none() {
                    t.gateway_transaction_id = event.gateway_transaction_id.clone();
                }
                decide(t, event)
            })
            .await?;

        let outcome = match decision {
            Decision::Moved(status) => {
                info!(transaction_id = %id, gateway = %event.gateway, event_type, to = %status, "webhook applied");
                WebhookOutcome::Applied {
                    event_type,
                    reference: id.to_string(),
                    status: status.to_string(),
                }
            }
            Decision::Recorded(status) => {
                info!(transaction_id = %id, event_type, status = %status, "webhook recorded");
                WebhookOutcome::Applied {
                    event_type,
                    reference: id.to_string(),
                    status: status.to_string(),
                }
            }
            Decision::Duplicate => {
                info!(transaction_id = %id, event_type, "duplicate webhook acknowledged");
                WebhookOutcome::Duplicate {
                    event_type,
                    reference: id.to_string(),
                }
            }
            Decision::Stale(current) => {
                warn!(transaction_id = %id, event_type, current = %current, "stale webhook acknowledged");
                WebhookOutcome::Stale {
                    event_type,
                    reference: id.to_string(),
                    current: current.to_string(),
                }
            }
        };

        // Replays resume whatever follow-up work is still missing.
        if matches!(event.kind, EventKind::PaymentCompleted) && !fulfilled(&txn) {
            self.escrow.run_fulfillment(id).await?;
        }
        Ok(outcome)
    }

    /// Asks the provider for the payment status and applies it like a webhook.
    pub async fn reconcile_by_polling(&self, id: TransactionId) -> Result<WebhookOutcome> {
        let txn = self.escrow.get(id).await?;
        let gateway = self.escrow.registry().get(&txn.payment_gateway).await?;
        let reference = txn.gateway_transaction_id.clone().ok_or_else(|| {
            PaymentError::ValidationError(format!("Transaction {id} has no provider payment yet"))
        })?;
        let kind = match gateway.verify_payment(&reference).await? {
            PaymentStatus::Pending => {
                return Ok(WebhookOutcome::Ignored {
                    event_type: "payment_pending".to_string(),
                    reason: "provider still processing".to_string(),
                });
            }
            PaymentStatus::Approved => EventKind::PaymentApproved,
            PaymentStatus::Completed => EventKind::PaymentCompleted,
            PaymentStatus::Failed => EventKind::PaymentFailed {
                reason: Some("reported by provider status query".to_string()),
            },
            PaymentStatus::Cancelled => EventKind::PaymentCancelled,
        };
        self.apply_event(ReconciledEvent {
            gateway: txn.payment_gateway.clone(),
            event_id: None,
            kind,
            transaction_id: Some(id),
            gateway_transaction_id: Some(reference),
            amount: None,
        })
        .await
    }
}

fn fulfilled(txn: &EscrowTransaction) -> bool {
    !matches!(
        txn.status(),
        EscrowStatus::FundsHeld | EscrowStatus::Shipped | EscrowStatus::Completed
    ) || (txn.fulfillment.product_marked_sold && txn.fulfillment.order_id.is_some())
}

/// The transition an event calls for, given where the transaction is now.
fn decide(t: &mut EscrowTransaction, event: &ReconciledEvent) -> Result<Decision> {
    use EscrowStatus::*;
    let now = Utc::now();
    let current = t.status();
    match &event.kind {
        EventKind::PaymentCompleted => {
            if current == Disputed {
                // The dispute stays open; the operator decides with the
                // payment now on record.
                if t.fulfillment.funds_received {
                    return Ok(Decision::Duplicate);
                }
                t.fulfillment.funds_received = true;
                return Ok(Decision::Recorded(Disputed));
            }
            let expected = t.charged_amount.clone().unwrap_or_else(|| t.pricing.total());
            if let Some(received) = &event.amount
                && !received.approx_eq(&expected)
            {
                if !current.can_transition_to(Disputed) {
                    return Ok(Decision::Stale(current));
                }
                warn!(transaction_id = %t.id, %expected, %received, "payment amount mismatch");
                t.transition(
                    Disputed,
                    Some(format!(
                        "Amount mismatch: expected {expected}, provider reported {received}"
                    )),
                    now,
                )?;
                t.fulfillment.funds_received = true;
                return Ok(Decision::Moved(Disputed));
            }
            match current {
                PendingPayment => {
                    t.transition(
                        PaymentProcessing,
                        Some("Payment confirmed before initialisation was recorded".to_string()),
                        now,
                    )?;
                    t.transition(FundsHeld, Some(completed_note(event)), now)?;
                    t.fulfillment.funds_received = true;
                    Ok(Decision::Moved(FundsHeld))
                }
                PaymentProcessing => {
                    t.transition(FundsHeld, Some(completed_note(event)), now)?;
                    t.fulfillment.funds_received = true;
                    Ok(Decision::Moved(FundsHeld))
                }
                FundsHeld | Shipped | Completed | Disputed | Refunded => Ok(Decision::Duplicate),
                PaymentFailed | Cancelled => Ok(Decision::Stale(current)),
            }
        }
        EventKind::PaymentFailed { reason } => match current {
            PendingPayment | PaymentProcessing => {
                let note = format!(
                    "Payment failed: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                t.transition(PaymentFailed, Some(note), now)?;
                Ok(Decision::Moved(PaymentFailed))
            }
            PaymentFailed => Ok(Decision::Duplicate),
            _ => Ok(Decision::Stale(current)),
        },
        EventKind::PaymentCancelled => match current {
            PendingPayment | PaymentProcessing => {
                t.transition(Cancelled, Some("Cancelled by provider".to_string()), now)?;
                Ok(Decision::Moved(Cancelled))
            }
            Cancelled => Ok(Decision::Duplicate),
            _ => Ok(Decision::Stale(current)),
        },
        EventKind::DisputeCreated { dispute_id, reason } => match current {
            Disputed => Ok(Decision::Duplicate),
            s if s.can_transition_to(Disputed) => {
                let note = format!(
                    "Provider dispute {}: {}",
                    dispute_id.as_deref().unwrap_or("-"),
                    reason.as_deref().unwrap_or("no reason given")
                );
                t.transition(Disputed, Some(note), now)?;
                Ok(Decision::Moved(Disputed))
            }
            _ => Ok(Decision::Stale(current)),
        },
        EventKind::PaymentApproved | EventKind::Payout { .. } | EventKind::Unrecognized { .. } => {
            Ok(Decision::Duplicate)
        }
    }
}

fn completed_note(event: &ReconciledEvent) -> String {
    match &event.event_id {
        Some(id) => format!("Payment confirmed by {} ({id})", event.gateway),
        None => format!("Payment confirmed by {}", event.gateway),
    }
}
