//! PayTabs hosted payment page.
//!
//! A PayTabs profile settles in a single currency, so amounts are converted
//! before they are sent. Queries and refunds share the `payment/request`
//! family of endpoints; callbacks are signed with the profile's server key.

use super::signature::verify_hmac_hex;
use super::{base_url, credential, money_at, parse_payload, required_text, text, transaction_id_at};
use crate::application::currency::CurrencyConverter;
use crate::domain::gateway::{
    EventKind, PaymentAction, PaymentContext, PaymentGateway, PaymentGatewayConfig,
    PaymentHandle, PaymentStatus, ReconciledEvent, RefundContext, RefundResult, RefundStatus,
};
use crate::domain::money::{Currency, Money};
use crate::error::{PaymentError, Result};
use crate::infrastructure::http::{HttpRequest, HttpTransportBox, Method, send_json};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_API: &str = "https://secure.paytabs.com";

pub struct PaytabsGateway {
    config: PaymentGatewayConfig,
    transport: HttpTransportBox,
    converter: Arc<CurrencyConverter>,
    api: String,
}

impl PaytabsGateway {
    pub fn new(
        config: PaymentGatewayConfig,
        transport: HttpTransportBox,
        converter: Arc<CurrencyConverter>,
    ) -> Self {
        let api = base_url(&config, DEFAULT_API);
        Self {
            config,
            transport,
            converter,
            api,
        }
    }

    fn server_key(&self) -> Result<&str> {
        credential(&self.config.name, &self.config.credentials.secret_key)
    }

    fn profile_id(&self) -> Result<i64> {
        let raw = credential(&self.config.name, &self.config.credentials.profile_id)?;
        raw.parse().map_err(|_| {
            PaymentError::ConfigError(format!(
                "{} profile_id '{raw}' is not numeric",
                self.config.name
            ))
        })
    }

    /// The profile currency, or the first supported one when none is set.
    fn settlement_currency(&self) -> Result<Currency> {
        self.config
            .settlement
            .currency
            .clone()
            .or_else(|| self.config.supported_currencies.first().cloned())
            .ok_or_else(|| {
                PaymentError::ConfigError(format!(
                    "{} has no settlement currency",
                    self.config.name
                ))
            })
    }

    async fn to_settlement(&self, money: &Money) -> Result<Money> {
        let target = self.settlement_currency()?;
        let amount = self
            .converter
            .convert(money.amount, &money.currency, &target)
            .await?;
        Ok(Money::new(amount, target))
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let request = HttpRequest::new(
            &self.config.name,
            Method::Post,
            format!("{}{path}", self.api),
        )
        .header("authorization", self.server_key()?)
        .json(body);
        send_json(&self.transport, &request).await
    }

    fn payment_status(body: &Value) -> PaymentStatus {
        match text(body, "/payment_result/response_status") {
            Some("A") => PaymentStatus::Completed,
            Some("D") | Some("E") | Some("X") => PaymentStatus::Failed,
            Some("V") => PaymentStatus::Cancelled,
            _ => PaymentStatus::Pending,
        }
    }

    fn decode_callback(&self, body: &Value) -> ReconciledEvent {
        let status = text(body, "/payment_result/response_status").unwrap_or_default();
        let is_sale = text(body, "/tran_type").is_none_or(|t| t.eq_ignore_ascii_case("sale"));
        let kind = match (is_sale, status) {
            (true, "A") => EventKind::PaymentCompleted,
            (true, "D") | (true, "E") => EventKind::PaymentFailed {
                reason: text(body, "/payment_result/response_message").map(str::to_string),
            },
            (true, "V") => EventKind::PaymentCancelled,
            _ => EventKind::Unrecognized {
                provider_event: format!(
                    "{}:{status}",
                    text(body, "/tran_type").unwrap_or("unknown")
                ),
            },
        };
        ReconciledEvent {
            gateway: self.config.name.clone(),
            event_id: None,
            kind,
            transaction_id: transaction_id_at(body, "/cart_id"),
            gateway_transaction_id: text(body, "/tran_ref").map(str::to_string),
            amount: money_at(body, "/cart_amount", "/cart_currency"),
        }
    }
}

#[async_trait]
impl PaymentGateway for PaytabsGateway {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &PaymentGatewayConfig {
        &self.config
    }

    fn is_configured(&self) -> bool {
        self.server_key().is_ok() && self.profile_id().is_ok() && self.settlement_currency().is_ok()
    }

    fn signature_header(&self) -> &'static str {
        "signature"
    }

    async fn initialize_payment(&self, ctx: &PaymentContext) -> Result<PaymentHandle> {
        self.server_key()?;
        let profile_id = self.profile_id()?;
        let charged = self.to_settlement(&ctx.amount).await?;
        let mut body = json!({
            "profile_id": profile_id,
            "tran_type": "sale",
            "tran_class": "ecom",
            "cart_id": ctx.transaction_id.to_string(),
            "cart_currency": charged.currency.code(),
            "cart_amount": charged.amount,
            "cart_description": ctx.description,
        });
        if let Some(url) = &ctx.return_url {
            body["return"] = json!(url);
        }
        let page = self.post("/payment/request", body).await?;
        let tran_ref = required_text(&self.config.name, &page, "/tran_ref")?;
        let redirect = required_text(&self.config.name, &page, "/redirect_url")?;
        debug!(gateway = %self.config.name, tran_ref, charged = %charged, "hosted page created");
        Ok(PaymentHandle {
            gateway_transaction_id: tran_ref,
            action: PaymentAction::RedirectUrl(redirect),
            charged,
        })
    }

    async fn verify_payment(&self, gateway_transaction_id: &str) -> Result<PaymentStatus> {
        let body = self
            .post(
                "/payment/query",
                json!({ "profile_id": self.profile_id()?, "tran_ref": gateway_transaction_id }),
            )
            .await?;
        Ok(Self::payment_status(&body))
    }

    async fn process_refund(&self, ctx: &RefundContext) -> Result<RefundResult> {
        self.server_key()?;
        let profile_id = self.profile_id()?;
        let amount = self.to_settlement(&ctx.amount).await?;
        let body = self
            .post(
                "/payment/request",
                json!({
                    "profile_id": profile_id,
                    "tran_type": "refund",
                    "tran_class": "ecom",
                    "cart_id": ctx.idempotency_key,
                    "cart_currency": amount.currency.code(),
                    "cart_amount": amount.amount,
                    "cart_description": ctx.reason.clone().unwrap_or_else(|| "refund".to_string()),
                    "tran_ref": ctx.gateway_transaction_id,
                }),
            )
            .await?;
        let status = match Self::payment_status(&body) {
            PaymentStatus::Completed => RefundStatus::Succeeded,
            PaymentStatus::Pending | PaymentStatus::Approved => RefundStatus::Pending,
            PaymentStatus::Failed | PaymentStatus::Cancelled => RefundStatus::Failed,
        };
        Ok(RefundResult {
            refund_id: required_text(&self.config.name, &body, "/tran_ref")?,
            status,
            amount,
        })
    }

    fn handle_webhook(&self, payload: &[u8], signature: &str) -> Result<ReconciledEvent> {
        verify_hmac_hex(self.server_key()?.as_bytes(), payload, signature)?;
        let body = parse_payload(&self.config.name, payload)?;
        Ok(self.decode_callback(&body))
    }
}
