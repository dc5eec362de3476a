#![allow(dead_code)]

use async_trait::async_trait;
use marketplace_escrow::application::currency::CurrencyConverter;
use marketplace_escrow::application::escrow::{CheckoutRequest, EscrowDeps, EscrowService};
use marketplace_escrow::application::fees::FeeSchedule;
use marketplace_escrow::application::ledger::WalletLedger;
use marketplace_escrow::application::payout::{DestinationBook, PayoutOrchestrator};
use marketplace_escrow::application::registry::GatewayRegistry;
use marketplace_escrow::application::webhook::WebhookProcessor;
use marketplace_escrow::config::{CurrencySettings, PayoutSettings, WalletSettings};
use marketplace_escrow::domain::escrow::{
    EscrowTransaction, FeePayer, ShippingAddress, TransactionId,
};
use marketplace_escrow::domain::fees::PlatformFeeConfig;
use marketplace_escrow::domain::gateway::PaymentGatewayConfig;
use marketplace_escrow::domain::money::Currency;
use marketplace_escrow::domain::ports::{ListingStatus, OrderService, ProductListing};
use marketplace_escrow::error::{PaymentError, Result};
use marketplace_escrow::infrastructure::config_source::StaticConfigSource;
use marketplace_escrow::infrastructure::gateways::signature::{hmac_sha256_hex, sign_timestamped};
use marketplace_escrow::infrastructure::gateways::{GatewayDeps, build_payout_rails, gateway_factory};
use marketplace_escrow::infrastructure::http::{HttpRequest, HttpResponse, HttpTransport};
use marketplace_escrow::infrastructure::in_memory::{
    InMemoryCatalog, InMemoryDestinationStore, InMemoryEscrowStore, InMemoryOrderService,
    InMemoryWalletStore,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_test";
pub const PAYPAL_WEBHOOK_SECRET: &str = "paypal_hook_secret";
pub const PAYTABS_SERVER_KEY: &str = "SERVER_KEY_TEST";
pub const SELLER: &str = "seller-1";
pub const BUYER: &str = "buyer-1";
pub const PRODUCT: &str = "prod-1";

/// Scripted provider API. Responses are queued per URL fragment; the last
/// queued response keeps answering. Unmatched requests get a 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<(String, VecDeque<HttpResponse>)>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, url_fragment: &str, status: u16, body: Value) {
        let mut routes = self.routes.lock().unwrap();
        let response = HttpResponse { status, body };
        match routes.iter_mut().find(|(k, _)| k == url_fragment) {
            Some((_, queue)) => queue.push_back(response),
            None => routes.push((url_fragment.to_string(), VecDeque::from([response]))),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, url_fragment: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.contains(url_fragment))
            .collect()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let mut routes = self.routes.lock().unwrap();
        // Longest fragment wins so `/orders/ID` is not answered by `/orders`.
        let route = routes
            .iter_mut()
            .filter(|(k, _)| request.url.contains(k.as_str()))
            .max_by_key(|(k, _)| k.len());
        let response = match route {
            Some((_, queue)) if queue.len() > 1 => queue.pop_front(),
            Some((_, queue)) => queue.front().cloned(),
            None => None,
        };
        Ok(response.unwrap_or(HttpResponse {
            status: 404,
            body: json!({ "error": { "message": format!("no route for {}", request.url) } }),
        }))
    }
}

/// Order service that can be switched into failing.
#[derive(Default)]
pub struct FlakyOrderService {
    pub inner: InMemoryOrderService,
    failing: AtomicBool,
}

impl FlakyOrderService {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl OrderService for FlakyOrderService {
    async fn create_order(&self, txn: &EscrowTransaction) -> Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PaymentError::GatewayUnavailable {
                gateway: "orders".to_string(),
                message: "order service down".to_string(),
            });
        }
        self.inner.create_order(txn).await
    }
}

pub fn usd() -> Currency {
    Currency::usd()
}

pub fn currency(code: &str) -> Currency {
    Currency::new(code).unwrap()
}

pub fn stripe_config() -> PaymentGatewayConfig {
    serde_json::from_value(json!({
        "name": "stripe",
        "provider": "stripe",
        "sandbox": true,
        "priority": 1,
        "credentials": { "secret_key": "sk_test_123", "webhook_secret": STRIPE_WEBHOOK_SECRET },
        "supported_currencies": ["USD", "EUR"],
        "supported_methods": ["card", "apple_pay", "google_pay"],
        "fees": { "fixed_amount": "0.30", "percentage": "2.9" },
        "api_base_url": "https://stripe.test"
    }))
    .unwrap()
}

pub fn paypal_config() -> PaymentGatewayConfig {
    serde_json::from_value(json!({
        "name": "paypal",
        "provider": "paypal",
        "sandbox": true,
        "priority": 2,
        "credentials": {
            "client_id": "client-1",
            "secret_key": "paypal-secret",
            "webhook_secret": PAYPAL_WEBHOOK_SECRET
        },
        "supported_currencies": ["USD", "EUR"],
        "supported_methods": ["paypal_balance", "card"],
        "fees": { "fixed_amount": "0.49", "percentage": "3.49" },
        "api_base_url": "https://paypal.test",
        "return_url": "https://shop.test/return"
    }))
    .unwrap()
}

pub fn paytabs_config() -> PaymentGatewayConfig {
    serde_json::from_value(json!({
        "name": "paytabs",
        "provider": "paytabs",
        "priority": 3,
        "credentials": { "secret_key": PAYTABS_SERVER_KEY, "profile_id": "12345" },
        "supported_currencies": ["SAR", "USD"],
        "supported_methods": ["mada", "card"],
        "fees": { "percentage": "2.75" },
        "settlement": { "currency": "SAR" },
        "api_base_url": "https://paytabs.test"
    }))
    .unwrap()
}

pub fn all_gateways() -> Vec<PaymentGatewayConfig> {
    vec![stripe_config(), paypal_config(), paytabs_config()]
}

pub fn currency_settings() -> CurrencySettings {
    CurrencySettings {
        base: usd(),
        rates: BTreeMap::from([(currency("EUR"), dec!(0.9)), (currency("SAR"), dec!(3.75))]),
        rates_url: None,
        refresh_interval_secs: 3600,
    }
}

pub fn product(id: &str, price: Decimal, shipping: Decimal) -> ProductListing {
    ProductListing {
        id: id.to_string(),
        seller_id: SELLER.to_string(),
        price,
        currency: usd(),
        category_id: Some("electronics".to_string()),
        shipping_cost: shipping,
        status: ListingStatus::Available,
    }
}

pub fn address() -> ShippingAddress {
    ShippingAddress {
        recipient: "Jane Buyer".to_string(),
        line1: "1 Market St".to_string(),
        line2: None,
        city: "Springfield".to_string(),
        region: None,
        postal_code: "12345".to_string(),
        country: "US".to_string(),
    }
}

pub fn checkout_request(gateway: Option<&str>, fee_payer: FeePayer) -> CheckoutRequest {
    CheckoutRequest {
        buyer_id: BUYER.to_string(),
        product_id: PRODUCT.to_string(),
        offer_id: None,
        payment_gateway: gateway.map(str::to_string),
        payment_method: None,
        shipping_address: address(),
        gateway_fee_paid_by: fee_payer,
        currency: usd(),
    }
}

pub fn stripe_headers(body: &[u8]) -> HashMap<String, String> {
    let now = chrono::Utc::now().timestamp();
    let signature = sign_timestamped(STRIPE_WEBHOOK_SECRET.as_bytes(), body, now).unwrap();
    HashMap::from([("Stripe-Signature".to_string(), signature)])
}

pub fn hmac_headers(header: &str, secret: &str, body: &[u8]) -> HashMap<String, String> {
    let signature = hmac_sha256_hex(secret.as_bytes(), body).unwrap();
    HashMap::from([(header.to_string(), signature)])
}

pub fn stripe_payment_succeeded(id: TransactionId, intent: &str, amount_minor: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": format!("evt_{intent}"),
        "type": "payment_intent.succeeded",
        "data": { "object": {
            "id": intent,
            "object": "payment_intent",
            "amount": amount_minor,
            "amount_received": amount_minor,
            "currency": "usd",
            "status": "succeeded",
            "metadata": { "transaction_id": id.to_string() }
        }}
    }))
    .unwrap()
}

pub fn stripe_payout_event(payout_id: &str, status: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": format!("evt_{payout_id}_{status}"),
        "type": format!("payout.{status}"),
        "data": { "object": {
            "id": payout_id,
            "object": "payout",
            "status": status,
            "failure_code": if status == "failed" { json!("account_closed") } else { Value::Null }
        }}
    }))
    .unwrap()
}

/// The whole service graph wired over in-memory stores and the mock transport.
pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub catalog: InMemoryCatalog,
    pub orders: Arc<FlakyOrderService>,
    pub escrow_store: Arc<InMemoryEscrowStore>,
    pub config_source: Arc<StaticConfigSource>,
    pub registry: Arc<GatewayRegistry>,
    pub ledger: Arc<WalletLedger>,
    pub escrow: Arc<EscrowService>,
    pub payouts: Arc<PayoutOrchestrator>,
    pub webhooks: WebhookProcessor,
}

impl Harness {
    pub async fn new(gateways: Vec<PaymentGatewayConfig>) -> Self {
        Self::with_wallet_settings(gateways, WalletSettings::default()).await
    }

    pub async fn with_wallet_settings(
        gateways: Vec<PaymentGatewayConfig>,
        wallet: WalletSettings,
    ) -> Self {
        let transport = MockTransport::new();
        let catalog = InMemoryCatalog::new();
        catalog.add_product(product(PRODUCT, dec!(100), dec!(10))).await;
        let orders = Arc::new(FlakyOrderService::default());
        let escrow_store = Arc::new(InMemoryEscrowStore::new());
        let config_source = Arc::new(StaticConfigSource::new(
            gateways.clone(),
            vec![PlatformFeeConfig::default()],
        ));

        let converter = Arc::new(CurrencyConverter::with_static_rates(&currency_settings()));
        let deps = GatewayDeps {
            transport: transport.clone(),
            converter: converter.clone(),
        };
        let registry = Arc::new(
            GatewayRegistry::init(config_source.clone(), gateway_factory(deps.clone()))
                .await
                .unwrap(),
        );
        let fees = Arc::new(FeeSchedule::init(config_source.clone()).await.unwrap());
        let ledger = Arc::new(WalletLedger::new(Arc::new(InMemoryWalletStore::new()), wallet));

        let escrow = Arc::new(EscrowService::new(EscrowDeps {
            store: escrow_store.clone(),
            catalog: Arc::new(catalog.clone()),
            orders: orders.clone(),
            registry: registry.clone(),
            fees,
            converter,
            ledger: ledger.clone(),
            tax_rates: Vec::new(),
        }));
        let payouts = Arc::new(PayoutOrchestrator::new(
            ledger.clone(),
            Arc::new(DestinationBook::new(Arc::new(InMemoryDestinationStore::new()))),
            escrow_store.clone(),
            build_payout_rails(&gateways, &deps),
            PayoutSettings::default(),
        ));
        let webhooks = WebhookProcessor::new(escrow.clone(), payouts.clone());

        Self {
            transport,
            catalog,
            orders,
            escrow_store,
            config_source,
            registry,
            ledger,
            escrow,
            payouts,
            webhooks,
        }
    }

    /// Answers Stripe payment intent creation with `intent`.
    pub fn stripe_intent(&self, intent: &str) {
        self.transport.respond(
            "/v1/payment_intents",
            200,
            json!({
                "id": intent,
                "client_secret": format!("{intent}_secret_abc"),
                "status": "requires_payment_method"
            }),
        );
    }

    pub async fn seller_balance(&self) -> Decimal {
        self.ledger
            .balances(SELLER)
            .await
            .unwrap()
            .get(&usd())
            .copied()
            .unwrap_or_default()
    }
}
