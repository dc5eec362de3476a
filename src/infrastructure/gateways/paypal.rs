//! PayPal: Orders v2 checkout, capture refunds and Payouts.
//!
//! Calls authenticate with an OAuth client-credentials token that is cached
//! until shortly before it expires. Webhooks are authenticated with an
//! HMAC-SHA256 hex digest of the raw body in `x-signature`.

use super::signature::verify_hmac_hex;
use super::{
    base_url, credential, money_at, parse_payload, required_text, text, transaction_id_at,
};
use crate::domain::gateway::{
    CaptureResult, EventKind, PaymentAction, PaymentContext, PaymentGateway, PaymentGatewayConfig,
    PaymentHandle, PaymentStatus, PayoutRail, PayoutReceipt, PayoutRequest, ReconciledEvent,
    RefundContext, RefundResult, RefundStatus,
};
use crate::domain::money::Money;
use crate::domain::wallet::PayoutStatus;
use crate::error::{PaymentError, Result};
use crate::infrastructure::http::{HttpRequest, HttpTransportBox, Method, send_json};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_API: &str = "https://api-m.paypal.com";
const SANDBOX_API: &str = "https://api-m.sandbox.paypal.com";
/// Tokens are renewed this long before PayPal's stated expiry.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct PaypalGateway {
    config: PaymentGatewayConfig,
    transport: HttpTransportBox,
    api: String,
    token: Mutex<Option<CachedToken>>,
}

impl PaypalGateway {
    pub fn new(config: PaymentGatewayConfig, transport: HttpTransportBox) -> Self {
        let api = base_url(
            &config,
            if config.sandbox { SANDBOX_API } else { DEFAULT_API },
        );
        Self {
            config,
            transport,
            api,
            token: Mutex::new(None),
        }
    }

    fn amount(money: &Money) -> Value {
        json!({
            "currency_code": money.currency.code(),
            "value": money.currency.round(money.amount).to_string(),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.value.clone());
        }
        let client_id = credential(&self.config.name, &self.config.credentials.client_id)?;
        let secret = credential(&self.config.name, &self.config.credentials.secret_key)?;
        let request = HttpRequest::new(
            &self.config.name,
            Method::Post,
            format!("{}/v1/oauth2/token", self.api),
        )
        .basic_auth(client_id, secret)
        .form(vec![(
            "grant_type".to_string(),
            "client_credentials".to_string(),
        )]);
        let body = send_json(&self.transport, &request).await?;
        let value = required_text(&self.config.name, &body, "/access_token")?;
        let ttl = body
            .pointer("/expires_in")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + ttl.saturating_sub(TOKEN_MARGIN),
        });
        debug!(gateway = %self.config.name, "oauth token refreshed");
        Ok(value)
    }

    async fn authed(&self, method: Method, path: &str) -> Result<HttpRequest> {
        let token = self.access_token().await?;
        Ok(
            HttpRequest::new(&self.config.name, method, format!("{}{path}", self.api))
                .bearer(&token),
        )
    }

    async fn order(&self, order_id: &str) -> Result<Value> {
        let request = self
            .authed(Method::Get, &format!("/v2/checkout/orders/{order_id}"))
            .await?;
        send_json(&self.transport, &request).await
    }

    fn payout_status(status: &str) -> Option<PayoutStatus> {
        Some(match status {
            "SUCCEEDED" | "SUCCESS" => PayoutStatus::Paid,
            "PENDING" | "UNCLAIMED" | "ONHOLD" => PayoutStatus::InTransit,
            // Refunded and reversed items sent money back to the platform.
            "FAILED" | "RETURNED" | "BLOCKED" | "DENIED" | "REFUNDED" | "REVERSED" => {
                PayoutStatus::Failed
            }
            "CANCELED" => PayoutStatus::Canceled,
            _ => return None,
        })
    }

    fn decode_event(&self, event: &Value) -> ReconciledEvent {
        let resource = event.pointer("/resource").cloned().unwrap_or(Value::Null);
        let provider_event = text(event, "/event_type").unwrap_or_default().to_string();
        let order_id = text(&resource, "/supplementary_data/related_ids/order_id")
            .map(str::to_string);

        let mut reconciled = ReconciledEvent {
            gateway: self.config.name.clone(),
            event_id: text(event, "/id").map(str::to_string),
            kind: EventKind::Unrecognized {
                provider_event: provider_event.clone(),
            },
            transaction_id: transaction_id_at(&resource, "/custom_id"),
            gateway_transaction_id: None,
            amount: None,
        };

        match provider_event.as_str() {
            "CHECKOUT.ORDER.APPROVED" => {
                reconciled.kind = EventKind::PaymentApproved;
                reconciled.gateway_transaction_id = text(&resource, "/id").map(str::to_string);
                reconciled.transaction_id =
                    transaction_id_at(&resource, "/purchase_units/0/custom_id");
                reconciled.amount = money_at(
                    &resource,
                    "/purchase_units/0/amount/value",
                    "/purchase_units/0/amount/currency_code",
                );
            }
            "PAYMENT.CAPTURE.COMPLETED" => {
                reconciled.kind = EventKind::PaymentCompleted;
                reconciled.gateway_transaction_id = order_id;
                reconciled.amount = money_at(&resource, "/amount/value", "/amount/currency_code");
            }
            "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => {
                reconciled.kind = EventKind::PaymentFailed {
                    reason: text(&resource, "/status_details/reason").map(str::to_string),
                };
                reconciled.gateway_transaction_id = order_id;
            }
            "CHECKOUT.ORDER.VOIDED" => {
                reconciled.kind = EventKind::PaymentCancelled;
                reconciled.gateway_transaction_id = text(&resource, "/id").map(str::to_string);
                reconciled.transaction_id =
                    transaction_id_at(&resource, "/purchase_units/0/custom_id");
            }
            "CUSTOMER.DISPUTE.CREATED" => {
                reconciled.kind = EventKind::DisputeCreated {
                    dispute_id: text(&resource, "/dispute_id").map(str::to_string),
                    reason: text(&resource, "/reason").map(str::to_string),
                };
                reconciled.transaction_id =
                    transaction_id_at(&resource, "/disputed_transactions/0/custom");
            }
            kind if kind.starts_with("PAYMENT.PAYOUTS-ITEM.") => {
                let status = text(&resource, "/transaction_status")
                    .and_then(Self::payout_status)
                    .or_else(|| kind.rsplit('.').next().and_then(Self::payout_status));
                if let (Some(payout_id), Some(status)) =
                    (text(&resource, "/payout_batch_id"), status)
                {
                    reconciled.transaction_id = None;
                    reconciled.kind = EventKind::Payout {
                        payout_id: payout_id.to_string(),
                        status,
                        failure_code: text(&resource, "/errors/name").map(str::to_string),
                    };
                }
            }
            _ => {}
        }
        reconciled
    }
}

#[async_trait]
impl PaymentGateway for PaypalGateway {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &PaymentGatewayConfig {
        &self.config
    }

    fn is_configured(&self) -> bool {
        let credentials = &self.config.credentials;
        credential(&self.config.name, &credentials.client_id).is_ok()
            && credential(&self.config.name, &credentials.secret_key).is_ok()
    }

    fn signature_header(&self) -> &'static str {
        "x-signature"
    }

    async fn initialize_payment(&self, ctx: &PaymentContext) -> Result<PaymentHandle> {
        let mut body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": ctx.transaction_id.to_string(),
                "custom_id": ctx.transaction_id.to_string(),
                "description": ctx.description,
                "amount": Self::amount(&ctx.amount),
            }],
        });
        if let Some(url) = &ctx.return_url {
            body["application_context"] = json!({ "return_url": url });
        }
        let request = self
            .authed(Method::Post, "/v2/checkout/orders")
            .await?
            .header("PayPal-Request-Id", &ctx.idempotency_key)
            .json(body);
        let order = send_json(&self.transport, &request).await?;
        let order_id = required_text(&self.config.name, &order, "/id")?;
        let approve = order
            .pointer("/links")
            .and_then(Value::as_array)
            .and_then(|links| {
                links.iter().find(|l| {
                    matches!(text(l, "/rel"), Some("approve") | Some("payer-action"))
                })
            })
            .and_then(|l| text(l, "/href"))
            .ok_or_else(|| PaymentError::GatewayRejected {
                gateway: self.config.name.clone(),
                message: format!("order {order_id} has no approval link"),
            })?;
        Ok(PaymentHandle {
            gateway_transaction_id: order_id,
            action: PaymentAction::RedirectUrl(approve.to_string()),
            charged: ctx.amount.clone(),
        })
    }

    async fn verify_payment(&self, gateway_transaction_id: &str) -> Result<PaymentStatus> {
        let order = self.order(gateway_transaction_id).await?;
        Ok(match text(&order, "/status") {
            Some("COMPLETED") => PaymentStatus::Completed,
            Some("APPROVED") => PaymentStatus::Approved,
            Some("VOIDED") => PaymentStatus::Cancelled,
            _ => PaymentStatus::Pending,
        })
    }

    /// Orders are created with intent `CAPTURE`; funds move only once the
    /// approved order is captured here.
    async fn capture_payment(
        &self,
        gateway_transaction_id: &str,
        idempotency_key: &str,
    ) -> Result<CaptureResult> {
        let request = self
            .authed(
                Method::Post,
                &format!("/v2/checkout/orders/{gateway_transaction_id}/capture"),
            )
            .await?
            .header("PayPal-Request-Id", idempotency_key)
            .json(json!({}));
        let order = send_json(&self.transport, &request).await?;
        let capture = order
            .pointer("/purchase_units/0/payments/captures/0")
            .cloned()
            .unwrap_or(Value::Null);
        let status = match text(&capture, "/status").or_else(|| text(&order, "/status")) {
            Some("COMPLETED") => PaymentStatus::Completed,
            Some("DECLINED") | Some("FAILED") => PaymentStatus::Failed,
            Some("VOIDED") => PaymentStatus::Cancelled,
            _ => PaymentStatus::Pending,
        };
        debug!(gateway = %self.config.name, order_id = gateway_transaction_id, ?status, "order captured");
        Ok(CaptureResult {
            status,
            capture_id: text(&capture, "/id").map(str::to_string),
            amount: money_at(&capture, "/amount/value", "/amount/currency_code"),
        })
    }

    async fn process_refund(&self, ctx: &RefundContext) -> Result<RefundResult> {
        let order = self.order(&ctx.gateway_transaction_id).await?;
        let capture_id = required_text(
            &self.config.name,
            &order,
            "/purchase_units/0/payments/captures/0/id",
        )?;
        let mut body = json!({ "amount": Self::amount(&ctx.amount) });
        if let Some(reason) = &ctx.reason {
            body["note_to_payer"] = json!(reason);
        }
        let request = self
            .authed(
                Method::Post,
                &format!("/v2/payments/captures/{capture_id}/refund"),
            )
            .await?
            .header("PayPal-Request-Id", &ctx.idempotency_key)
            .json(body);
        let refund = send_json(&self.transport, &request).await?;
        let status = match text(&refund, "/status") {
            Some("COMPLETED") => RefundStatus::Succeeded,
            Some("FAILED") | Some("CANCELLED") => RefundStatus::Failed,
            _ => RefundStatus::Pending,
        };
        Ok(RefundResult {
            refund_id: required_text(&self.config.name, &refund, "/id")?,
            status,
            amount: ctx.amount.clone(),
        })
    }

    fn handle_webhook(&self, payload: &[u8], signature: &str) -> Result<ReconciledEvent> {
        let secret = credential(&self.config.name, &self.config.credentials.webhook_secret)?;
        verify_hmac_hex(secret.as_bytes(), payload, signature)?;
        let event = parse_payload(&self.config.name, payload)?;
        Ok(self.decode_event(&event))
    }
}

#[async_trait]
impl PayoutRail for PaypalGateway {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// One batch per withdrawal; the batch id is the tracked payout id.
    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<PayoutReceipt> {
        let body = json!({
            "sender_batch_header": {
                "sender_batch_id": request.entry_id,
                "email_subject": "You have a payout",
            },
            "items": [{
                "recipient_type": "PAYPAL_ID",
                "receiver": request.destination_reference,
                "amount": {
                    "currency": request.amount.currency.code(),
                    "value": request.amount.currency.round(request.amount.amount).to_string(),
                },
                "sender_item_id": request.entry_id,
            }],
        });
        let http = self
            .authed(Method::Post, "/v1/payments/payouts")
            .await?
            .header("PayPal-Request-Id", &request.entry_id)
            .json(body);
        let batch = send_json(&self.transport, &http).await?;
        let status = text(&batch, "/batch_header/batch_status")
            .and_then(Self::payout_status)
            .unwrap_or(PayoutStatus::Pending);
        Ok(PayoutReceipt {
            payout_id: required_text(&self.config.name, &batch, "/batch_header/payout_batch_id")?,
            status,
        })
    }
}
