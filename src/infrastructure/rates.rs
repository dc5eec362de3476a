//! Exchange rate sources for the currency converter.

use crate::domain::money::Currency;
use crate::domain::ports::RateSource;
use crate::error::{PaymentError, Result};
use crate::infrastructure::http::{HttpRequest, HttpTransportBox, Method, send_json};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;

/// Fixed table, replaceable at runtime. Mostly for tests.
#[derive(Default)]
pub struct StaticRateSource {
    rates: RwLock<HashMap<Currency, Decimal>>,
    fail: RwLock<bool>,
}

impl StaticRateSource {
    pub fn new(rates: HashMap<Currency, Decimal>) -> Self {
        Self {
            rates: RwLock::new(rates),
            fail: RwLock::new(false),
        }
    }

    pub async fn set_rates(&self, rates: HashMap<Currency, Decimal>) {
        *self.rates.write().await = rates;
    }

    /// Makes the next fetches fail as an unreachable provider would.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.fail.write().await = unavailable;
    }
}

#[async_trait]
impl RateSource for StaticRateSource {
    async fn fetch(&self, _base: &Currency) -> Result<HashMap<Currency, Decimal>> {
        if *self.fail.read().await {
            return Err(PaymentError::GatewayUnavailable {
                gateway: "rates".to_string(),
                message: "rate source unavailable".to_string(),
            });
        }
        Ok(self.rates.read().await.clone())
    }
}

/// JSON rate API answering `{"rates": {"EUR": 0.92, ...}}` quoted against
/// the base currency. `{base}` in the URL is replaced by the base code.
pub struct HttpRateSource {
    url: String,
    transport: HttpTransportBox,
}

impl HttpRateSource {
    pub fn new(url: impl Into<String>, transport: HttpTransportBox) -> Self {
        Self {
            url: url.into(),
            transport,
        }
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn fetch(&self, base: &Currency) -> Result<HashMap<Currency, Decimal>> {
        let url = self.url.replace("{base}", base.code());
        let body = send_json(&self.transport, &HttpRequest::new("rates", Method::Get, url)).await?;
        let rates = body
            .pointer("/rates")
            .and_then(Value::as_object)
            .ok_or_else(|| PaymentError::GatewayRejected {
                gateway: "rates".to_string(),
                message: "response has no rates object".to_string(),
            })?;
        Ok(rates
            .iter()
            .filter_map(|(code, rate)| {
                let currency = Currency::new(code).ok()?;
                let rate = match rate {
                    Value::Number(n) => Decimal::from_str(&n.to_string()).ok()?,
                    Value::String(s) => Decimal::from_str(s).ok()?,
                    _ => return None,
                };
                Some((currency, rate))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::http::{HttpResponse, HttpTransport};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    struct Fixed(Value, Mutex<Vec<String>>);

    #[async_trait]
    impl HttpTransport for Fixed {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
            self.1.lock().unwrap().push(request.url.clone());
            Ok(HttpResponse {
                status: 200,
                body: self.0.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_http_source_parses_rates() {
        let transport = Arc::new(Fixed(
            json!({"base": "USD", "rates": {"EUR": 0.92, "SAR": "3.75", "bad!": 1, "GBP": null}}),
            Mutex::new(Vec::new()),
        ));
        let source = HttpRateSource::new("https://rates.example/latest/{base}", transport.clone());
        let rates = source.fetch(&Currency::usd()).await.unwrap();
        assert_eq!(rates.len(), 2);
        assert_eq!(rates[&Currency::new("EUR").unwrap()], dec!(0.92));
        assert_eq!(rates[&Currency::new("SAR").unwrap()], dec!(3.75));
        assert_eq!(
            transport.1.lock().unwrap().as_slice(),
            ["https://rates.example/latest/USD".to_string()]
        );
    }

    #[tokio::test]
    async fn test_static_source_can_fail() {
        let source = StaticRateSource::new(HashMap::new());
        assert!(source.fetch(&Currency::usd()).await.is_ok());
        source.set_unavailable(true).await;
        assert!(source.fetch(&Currency::usd()).await.is_err());
    }
}
