//! Payment provider adapters and the factory the registry builds them with.

pub mod manual;
pub mod paypal;
pub mod paytabs;
pub mod signature;
pub mod stripe;

use crate::application::currency::CurrencyConverter;
use crate::application::registry::GatewayFactory;
use crate::domain::escrow::TransactionId;
use crate::domain::gateway::{GatewayBox, PaymentGatewayConfig, PayoutRailBox, ProviderKind};
use crate::domain::money::{Currency, Money};
use crate::error::{PaymentError, Result};
use crate::infrastructure::http::HttpTransportBox;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

pub use manual::ManualPayoutRail;
pub use paypal::PaypalGateway;
pub use paytabs::PaytabsGateway;
pub use stripe::StripeGateway;

/// Shared collaborators handed to every adapter.
#[derive(Clone)]
pub struct GatewayDeps {
    pub transport: HttpTransportBox,
    pub converter: Arc<CurrencyConverter>,
}

/// Builds the adapter matching each config's provider.
pub fn gateway_factory(deps: GatewayDeps) -> GatewayFactory {
    Arc::new(move |config: &PaymentGatewayConfig| -> GatewayBox {
        match config.provider {
            ProviderKind::Stripe => Arc::new(StripeGateway::new(config.clone(), deps.transport.clone())),
            ProviderKind::Paypal => Arc::new(PaypalGateway::new(config.clone(), deps.transport.clone())),
            ProviderKind::Paytabs => Arc::new(PaytabsGateway::new(
                config.clone(),
                deps.transport.clone(),
                deps.converter.clone(),
            )),
        }
    })
}

/// Payout rails keyed by name: the manual rail plus one per active Stripe or
/// PayPal config.
pub fn build_payout_rails(
    configs: &[PaymentGatewayConfig],
    deps: &GatewayDeps,
) -> HashMap<String, PayoutRailBox> {
    let mut rails: HashMap<String, PayoutRailBox> = HashMap::new();
    rails.insert(
        manual::MANUAL_RAIL.to_string(),
        Arc::new(ManualPayoutRail::new()),
    );
    for config in configs.iter().filter(|c| c.is_active) {
        let rail: PayoutRailBox = match config.provider {
            ProviderKind::Stripe => Arc::new(StripeGateway::new(config.clone(), deps.transport.clone())),
            ProviderKind::Paypal => Arc::new(PaypalGateway::new(config.clone(), deps.transport.clone())),
            ProviderKind::Paytabs => continue,
        };
        rails.insert(config.name.clone(), rail);
    }
    rails
}

pub(crate) fn credential<'a>(gateway: &str, value: &'a Option<String>) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PaymentError::GatewayNotConfigured(gateway.to_string()))
}

pub(crate) fn base_url(config: &PaymentGatewayConfig, default: &str) -> String {
    config
        .api_base_url
        .as_deref()
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}

pub(crate) fn text<'a>(body: &'a Value, pointer: &str) -> Option<&'a str> {
    body.pointer(pointer).and_then(Value::as_str)
}

/// A field the provider must return; its absence is a rejected response.
pub(crate) fn required_text(gateway: &str, body: &Value, pointer: &str) -> Result<String> {
    text(body, pointer)
        .map(str::to_string)
        .ok_or_else(|| PaymentError::GatewayRejected {
            gateway: gateway.to_string(),
            message: format!("response is missing {pointer}"),
        })
}

/// Decimal carried as a JSON string or number.
pub(crate) fn decimal_at(body: &Value, pointer: &str) -> Option<Decimal> {
    match body.pointer(pointer)? {
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

pub(crate) fn money_at(body: &Value, amount: &str, currency: &str) -> Option<Money> {
    let currency = Currency::new(text(body, currency)?).ok()?;
    Some(Money::new(decimal_at(body, amount)?, currency))
}

pub(crate) fn transaction_id_at(body: &Value, pointer: &str) -> Option<TransactionId> {
    text(body, pointer).and_then(|s| s.parse().ok())
}

pub(crate) fn parse_payload(gateway: &str, payload: &[u8]) -> Result<Value> {
    serde_json::from_slice(payload).map_err(|e| {
        PaymentError::ValidationError(format!("{gateway} webhook payload is not JSON: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decimal_at_accepts_strings_and_numbers() {
        let body = json!({"a": "12.50", "b": 7.25, "c": true});
        assert_eq!(decimal_at(&body, "/a"), Some(Decimal::new(1250, 2)));
        assert_eq!(decimal_at(&body, "/b"), Some(Decimal::new(725, 2)));
        assert_eq!(decimal_at(&body, "/c"), None);
        assert_eq!(decimal_at(&body, "/missing"), None);
    }

    #[test]
    fn test_credential_rejects_empty() {
        assert!(credential("stripe", &Some(String::new())).is_err());
        assert!(credential("stripe", &None).is_err());
        assert_eq!(credential("stripe", &Some("sk".into())).unwrap(), "sk");
    }
}
