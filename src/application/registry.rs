//! Gateway registry: one adapter per configured provider, keyed by name.

use crate::domain::gateway::{GatewayBox, GatewayStats, PaymentGatewayConfig, PaymentMethod};
use crate::domain::money::Currency;
use crate::domain::ports::ConfigSourceBox;
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Builds an adapter from its configuration. Missing credentials yield an
/// unconfigured adapter, never an error.
pub type GatewayFactory = Arc<dyn Fn(&PaymentGatewayConfig) -> GatewayBox + Send + Sync>;

pub struct GatewayRegistry {
    source: ConfigSourceBox,
    factory: GatewayFactory,
    gateways: RwLock<HashMap<String, GatewayBox>>,
    stats: Mutex<HashMap<String, GatewayStats>>,
}

impl GatewayRegistry {
    /// Constructs the registry and loads every active gateway.
    pub async fn init(source: ConfigSourceBox, factory: GatewayFactory) -> Result<Self> {
        let registry = Self {
            source,
            factory,
            gateways: RwLock::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
        };
        registry.reload().await?;
        Ok(registry)
    }

    /// Rebuilds every adapter from the source and swaps them in at once.
    /// Requests already holding an adapter finish on the old instance.
    pub async fn reload(&self) -> Result<usize> {
        let configs = self.source.gateway_configs().await?;
        let mut gateways = HashMap::new();
        {
            let mut stats = self.stats.lock().await;
            for config in configs.iter().filter(|c| c.is_active) {
                let adapter = (self.factory)(config);
                if !adapter.is_configured() {
                    warn!(gateway = %config.name, "gateway loaded without credentials, excluded from selection");
                }
                stats
                    .entry(config.name.clone())
                    .or_insert_with(|| config.stats.clone());
                gateways.insert(config.name.clone(), adapter);
            }
        }
        let count = gateways.len();
        *self.gateways.write().await = gateways;
        info!(count, "payment gateways loaded");
        Ok(count)
    }

    pub async fn get(&self, name: &str) -> Result<GatewayBox> {
        self.gateways
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PaymentError::not_found("gateway", name))
    }

    /// Every loaded adapter, ordered by name.
    pub async fn all(&self) -> Vec<GatewayBox> {
        let mut all: Vec<GatewayBox> = self.gateways.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// The configured adapter with the lowest fee for this charge.
    ///
    /// Candidates must support the currency and method and accept the amount.
    /// Equal fees go to the lower `priority` value, then to the name.
    pub async fn best_for(
        &self,
        amount: Decimal,
        currency: &Currency,
        method: Option<&PaymentMethod>,
    ) -> Result<GatewayBox> {
        let gateways = self.gateways.read().await;
        let supporting: Vec<&GatewayBox> = gateways
            .values()
            .filter(|g| g.is_configured() && g.is_currency_supported(currency))
            .collect();
        if supporting.is_empty() {
            return Err(PaymentError::unsupported_currency(
                currency,
                "no configured gateway",
            ));
        }
        supporting
            .into_iter()
            .filter(|g| method.is_none_or(|m| g.supports_method(m)))
            .filter(|g| g.config().limits.allows(amount))
            .min_by(|a, b| {
                let fee_a = a.calculate_gateway_fee(amount, currency);
                let fee_b = b.calculate_gateway_fee(amount, currency);
                fee_a
                    .cmp(&fee_b)
                    .then(a.config().priority.cmp(&b.config().priority))
                    .then(a.name().cmp(b.name()))
            })
            .cloned()
            .ok_or_else(|| {
                PaymentError::GatewayNotConfigured(format!(
                    "no gateway accepts {amount} {currency}{}",
                    method.map(|m| format!(" by {m:?}")).unwrap_or_default()
                ))
            })
    }

    /// Counts one payment initialisation against `gateway`.
    pub async fn record_attempt(&self, gateway: &str, amount: Decimal, success: bool) {
        self.stats
            .lock()
            .await
            .entry(gateway.to_string())
            .or_default()
            .record(amount, success);
    }

    pub async fn stats(&self, gateway: &str) -> Option<GatewayStats> {
        self.stats.lock().await.get(gateway).cloned()
    }
}
