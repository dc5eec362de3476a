//! Process configuration.
//!
//! Loaded from a JSON file; every section has a default so a partial file is
//! valid. Gateway secrets may be supplied through the environment instead of
//! the file: `<GATEWAY>_SECRET_KEY`, `<GATEWAY>_WEBHOOK_SECRET` and
//! `<GATEWAY>_CLIENT_ID`, with the gateway name upper-cased.

use crate::domain::fees::PlatformFeeConfig;
use crate::domain::gateway::PaymentGatewayConfig;
use crate::domain::money::Currency;
use crate::domain::payout::DestinationType;
use crate::domain::wallet::WithdrawalLimits;
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrencySettings {
    pub base: Currency,
    /// Rates quoted as units of each currency per one unit of `base`.
    pub rates: BTreeMap<Currency, Decimal>,
    pub rates_url: Option<String>,
    pub refresh_interval_secs: u64,
}

impl Default for CurrencySettings {
    fn default() -> Self {
        Self {
            base: Currency::usd(),
            rates: BTreeMap::new(),
            rates_url: None,
            refresh_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletSettings {
    pub default_limits: WithdrawalLimits,
    pub limits: BTreeMap<Currency, WithdrawalLimits>,
    /// Attempts for an optimistic wallet update before giving up with `Conflict`.
    pub max_update_attempts: Option<u32>,
}

impl WalletSettings {
    pub fn limits_for(&self, currency: &Currency) -> &WithdrawalLimits {
        self.limits.get(currency).unwrap_or(&self.default_limits)
    }

    pub fn update_attempts(&self) -> u32 {
        self.max_update_attempts.unwrap_or(8).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayoutSettings {
    /// Payout rail name per destination type.
    pub rails: BTreeMap<DestinationType, String>,
}

impl Default for PayoutSettings {
    fn default() -> Self {
        Self {
            rails: BTreeMap::from([
                (DestinationType::BankAccount, "manual".to_string()),
                (DestinationType::PaypalAccount, "paypal".to_string()),
                (DestinationType::Card, "stripe".to_string()),
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_attempts: 3,
            backoff_base_ms: 2000,
        }
    }
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxRate {
    /// ISO-3166 alpha-2.
    pub country: String,
    #[serde(default)]
    pub region: Option<String>,
    pub percentage: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateways: Vec<PaymentGatewayConfig>,
    pub platform_fees: Vec<PlatformFeeConfig>,
    pub currency: CurrencySettings,
    pub wallet: WalletSettings,
    pub payouts: PayoutSettings,
    pub http: HttpSettings,
    pub tax_rates: Vec<TaxRate>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateways: Vec::new(),
            platform_fees: vec![PlatformFeeConfig::default()],
            currency: CurrencySettings::default(),
            wallet: WalletSettings::default(),
            payouts: PayoutSettings::default(),
            http: HttpSettings::default(),
            tax_rates: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_json(&raw)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Replaces gateway credentials with values found through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for gateway in &mut self.gateways {
            let prefix = gateway.name.to_ascii_uppercase().replace('-', "_");
            if let Some(v) = lookup(&format!("{prefix}_SECRET_KEY")) {
                gateway.credentials.secret_key = Some(v);
            }
            if let Some(v) = lookup(&format!("{prefix}_WEBHOOK_SECRET")) {
                gateway.credentials.webhook_secret = Some(v);
            }
            if let Some(v) = lookup(&format!("{prefix}_CLIENT_ID")) {
                gateway.credentials.client_id = Some(v);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for gateway in &self.gateways {
            if !names.insert(gateway.name.as_str()) {
                return Err(PaymentError::ConfigError(format!(
                    "duplicate gateway name '{}'",
                    gateway.name
                )));
            }
            if gateway.fees.fixed_amount < Decimal::ZERO || gateway.fees.percentage < Decimal::ZERO
            {
                return Err(PaymentError::ConfigError(format!(
                    "gateway '{}' has negative fee components",
                    gateway.name
                )));
            }
        }
        for fees in &self.platform_fees {
            fees.validate()?;
        }
        PlatformFeeConfig::select_active(&self.platform_fees)?;
        if self.http.max_attempts == 0 {
            return Err(PaymentError::ConfigError(
                "http.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tax_percentage(&self, country: &str, region: Option<&str>) -> Decimal {
        sales_tax_percentage(&self.tax_rates, country, region)
    }
}

/// Tax percentage for a destination, preferring a region-specific rate.
pub fn sales_tax_percentage(rates: &[TaxRate], country: &str, region: Option<&str>) -> Decimal {
    let country_rates = || {
        rates
            .iter()
            .filter(|t| t.country.eq_ignore_ascii_case(country))
    };
    region
        .and_then(|r| {
            country_rates().find(|t| {
                t.region
                    .as_deref()
                    .is_some_and(|tr| tr.eq_ignore_ascii_case(r))
            })
        })
        .or_else(|| country_rates().find(|t| t.region.is_none()))
        .map_or(Decimal::ZERO, |t| t.percentage)
}
