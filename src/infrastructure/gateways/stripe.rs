//! Stripe: payment intents, refunds, payouts to connected accounts.
//!
//! Amounts cross the wire in minor units and form-encoded. Webhooks carry a
//! `stripe-signature: t=..,v1=..` header over `"{t}.{body}"`.

use super::signature::{DEFAULT_TOLERANCE_SECS, TimestampedSignature};
use super::{base_url, credential, parse_payload, required_text, text, transaction_id_at};
use crate::domain::gateway::{
    EventKind, PaymentAction, PaymentContext, PaymentGateway, PaymentGatewayConfig,
    PaymentHandle, PaymentStatus, PayoutRail, PayoutReceipt, PayoutRequest, ReconciledEvent,
    RefundContext, RefundResult, RefundStatus,
};
use crate::domain::money::{Currency, Money};
use crate::domain::wallet::PayoutStatus;
use crate::error::Result;
use crate::infrastructure::http::{HttpRequest, HttpTransportBox, Method, send_json};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

const DEFAULT_API: &str = "https://api.stripe.com";

pub struct StripeGateway {
    config: PaymentGatewayConfig,
    transport: HttpTransportBox,
    api: String,
    tolerance_secs: i64,
}

impl StripeGateway {
    pub fn new(config: PaymentGatewayConfig, transport: HttpTransportBox) -> Self {
        let api = base_url(&config, DEFAULT_API);
        Self {
            config,
            transport,
            api,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    fn secret(&self) -> Result<&str> {
        credential(&self.config.name, &self.config.credentials.secret_key)
    }

    fn request(&self, method: Method, path: &str) -> Result<HttpRequest> {
        let secret = self.secret()?;
        Ok(HttpRequest::new(&self.config.name, method, format!("{}{path}", self.api)).bearer(secret))
    }

    fn minor(money: &Money) -> Result<String> {
        money.currency.to_minor_units(money.amount).map(|m| m.to_string())
    }

    fn money_from_minor(object: &Value, amount_field: &str) -> Option<Money> {
        let currency = Currency::new(text(object, "/currency")?).ok()?;
        let minor = object.pointer(amount_field)?.as_i64()?;
        Some(Money::new(currency.from_minor_units(minor), currency))
    }

    fn payout_status(status: &str) -> Option<PayoutStatus> {
        Some(match status {
            "pending" => PayoutStatus::Pending,
            "in_transit" => PayoutStatus::InTransit,
            "paid" => PayoutStatus::Paid,
            "failed" => PayoutStatus::Failed,
            "canceled" => PayoutStatus::Canceled,
            _ => return None,
        })
    }

    fn intent_status(intent: &Value) -> PaymentStatus {
        match text(intent, "/status") {
            Some("succeeded") => PaymentStatus::Completed,
            Some("canceled") => PaymentStatus::Cancelled,
            Some("requires_payment_method")
                if intent
                    .pointer("/last_payment_error")
                    .is_some_and(|e| !e.is_null()) =>
            {
                PaymentStatus::Failed
            }
            _ => PaymentStatus::Pending,
        }
    }

    fn decode_event(&self, event: &Value) -> ReconciledEvent {
        let object = event.pointer("/data/object").cloned().unwrap_or(Value::Null);
        let provider_event = text(event, "/type").unwrap_or_default().to_string();
        let object_id = text(&object, "/id").map(str::to_string);

        let mut reconciled = ReconciledEvent {
            gateway: self.config.name.clone(),
            event_id: text(event, "/id").map(str::to_string),
            kind: EventKind::Unrecognized {
                provider_event: provider_event.clone(),
            },
            transaction_id: transaction_id_at(&object, "/metadata/transaction_id"),
            gateway_transaction_id: None,
            amount: None,
        };

        match provider_event.as_str() {
            "payment_intent.succeeded" => {
                reconciled.kind = EventKind::PaymentCompleted;
                reconciled.gateway_transaction_id = object_id;
                reconciled.amount = Self::money_from_minor(&object, "/amount_received")
                    .or_else(|| Self::money_from_minor(&object, "/amount"));
            }
            "payment_intent.payment_failed" => {
                reconciled.kind = EventKind::PaymentFailed {
                    reason: text(&object, "/last_payment_error/message").map(str::to_string),
                };
                reconciled.gateway_transaction_id = object_id;
            }
            "payment_intent.canceled" => {
                reconciled.kind = EventKind::PaymentCancelled;
                reconciled.gateway_transaction_id = object_id;
            }
            "charge.dispute.created" => {
                reconciled.kind = EventKind::DisputeCreated {
                    dispute_id: object_id,
                    reason: text(&object, "/reason").map(str::to_string),
                };
                reconciled.gateway_transaction_id =
                    text(&object, "/payment_intent").map(str::to_string);
            }
            kind if kind.starts_with("payout.") => {
                if let (Some(payout_id), Some(status)) = (
                    object_id,
                    text(&object, "/status").and_then(Self::payout_status),
                ) {
                    reconciled.kind = EventKind::Payout {
                        payout_id,
                        status,
                        failure_code: text(&object, "/failure_code").map(str::to_string),
                    };
                }
            }
            _ => {}
        }
        reconciled
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &PaymentGatewayConfig {
        &self.config
    }

    fn is_configured(&self) -> bool {
        self.secret().is_ok()
    }

    fn signature_header(&self) -> &'static str {
        "stripe-signature"
    }

    async fn initialize_payment(&self, ctx: &PaymentContext) -> Result<PaymentHandle> {
        let form = vec![
            ("amount".to_string(), Self::minor(&ctx.amount)?),
            (
                "currency".to_string(),
                ctx.amount.currency.code().to_ascii_lowercase(),
            ),
            ("description".to_string(), ctx.description.clone()),
            (
                "metadata[transaction_id]".to_string(),
                ctx.transaction_id.to_string(),
            ),
            ("metadata[buyer_id]".to_string(), ctx.buyer_id.clone()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
        ];
        let request = self
            .request(Method::Post, "/v1/payment_intents")?
            .header("Idempotency-Key", &ctx.idempotency_key)
            .form(form);
        let body = send_json(&self.transport, &request).await?;
        let intent_id = required_text(&self.config.name, &body, "/id")?;
        let client_secret = required_text(&self.config.name, &body, "/client_secret")?;
        debug!(gateway = %self.config.name, intent_id, "payment intent created");
        Ok(PaymentHandle {
            gateway_transaction_id: intent_id,
            action: PaymentAction::ClientSecret(client_secret),
            charged: ctx.amount.clone(),
        })
    }

    async fn verify_payment(&self, gateway_transaction_id: &str) -> Result<PaymentStatus> {
        let request = self.request(
            Method::Get,
            &format!("/v1/payment_intents/{gateway_transaction_id}"),
        )?;
        let body = send_json(&self.transport, &request).await?;
        Ok(Self::intent_status(&body))
    }

    async fn process_refund(&self, ctx: &RefundContext) -> Result<RefundResult> {
        let mut form = vec![
            (
                "payment_intent".to_string(),
                ctx.gateway_transaction_id.clone(),
            ),
            ("amount".to_string(), Self::minor(&ctx.amount)?),
            (
                "metadata[transaction_id]".to_string(),
                ctx.transaction_id.to_string(),
            ),
        ];
        if let Some(reason) = &ctx.reason {
            form.push(("metadata[reason]".to_string(), reason.clone()));
        }
        let request = self
            .request(Method::Post, "/v1/refunds")?
            .header("Idempotency-Key", &ctx.idempotency_key)
            .form(form);
        let body = send_json(&self.transport, &request).await?;
        let status = match text(&body, "/status") {
            Some("succeeded") => RefundStatus::Succeeded,
            Some("failed") | Some("canceled") => RefundStatus::Failed,
            _ => RefundStatus::Pending,
        };
        Ok(RefundResult {
            refund_id: required_text(&self.config.name, &body, "/id")?,
            status,
            amount: ctx.amount.clone(),
        })
    }

    fn handle_webhook(&self, payload: &[u8], signature: &str) -> Result<ReconciledEvent> {
        let secret = credential(&self.config.name, &self.config.credentials.webhook_secret)?;
        TimestampedSignature::parse(signature)?.verify(
            secret.as_bytes(),
            payload,
            Utc::now().timestamp(),
            self.tolerance_secs,
        )?;
        let event = parse_payload(&self.config.name, payload)?;
        Ok(self.decode_event(&event))
    }
}

#[async_trait]
impl PayoutRail for StripeGateway {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// Pays out from the seller's connected account balance.
    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<PayoutReceipt> {
        let http = self
            .request(Method::Post, "/v1/payouts")?
            .header("Idempotency-Key", &request.entry_id)
            .header("Stripe-Account", &request.destination_reference)
            .form(vec![
                ("amount".to_string(), Self::minor(&request.amount)?),
                (
                    "currency".to_string(),
                    request.amount.currency.code().to_ascii_lowercase(),
                ),
                ("metadata[entry_id]".to_string(), request.entry_id.clone()),
                ("metadata[user_id]".to_string(), request.user_id.clone()),
            ]);
        let body = send_json(&self.transport, &http).await?;
        let status = text(&body, "/status")
            .and_then(Self::payout_status)
            .unwrap_or(PayoutStatus::Pending);
        Ok(PayoutReceipt {
            payout_id: required_text(&self.config.name, &body, "/id")?,
            status,
        })
    }
}
