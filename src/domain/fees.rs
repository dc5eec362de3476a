//! Platform fee rules and the pure calculator that applies them.
//!
//! Exactly one rule set decides each calculation. The first match in this
//! order wins: user override, promotion, category, currency, tier bracket,
//! global default.

use super::money::Currency;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How the default rule is chosen. Every rule charges its fixed amount plus
/// its percentage, so a pure fixed or pure percentage fee is a rule with the
/// other component at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeType {
    /// The flattened default rule applies when nothing more specific matches.
    #[default]
    Percentage,
    /// Amount brackets in `tiers` are consulted before the default rule.
    Tiered,
}

/// Percentage and fixed component with optional clamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeeRule {
    #[serde(default)]
    pub percentage: Decimal,
    #[serde(default)]
    pub fixed_amount: Decimal,
    #[serde(default)]
    pub minimum_fee: Option<Decimal>,
    #[serde(default)]
    pub maximum_fee: Option<Decimal>,
}

impl FeeRule {
    pub fn apply(&self, amount: Decimal) -> Decimal {
        let raw = self.fixed_amount + amount * self.percentage / Decimal::ONE_HUNDRED;
        clamp(raw, self.minimum_fee, self.maximum_fee)
    }

    fn validate(&self, context: &str) -> Result<()> {
        if self.percentage < Decimal::ZERO || self.fixed_amount < Decimal::ZERO {
            return Err(PaymentError::ConfigError(format!(
                "{context}: fee components must not be negative"
            )));
        }
        if let (Some(min), Some(max)) = (self.minimum_fee, self.maximum_fee)
            && min > max
        {
            return Err(PaymentError::ConfigError(format!(
                "{context}: minimum fee {min} exceeds maximum {max}"
            )));
        }
        Ok(())
    }
}

fn clamp(value: Decimal, min: Option<Decimal>, max: Option<Decimal>) -> Decimal {
    let value = min.map_or(value, |min| value.max(min));
    max.map_or(value, |max| value.min(max))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyFee {
    pub currency: Currency,
    #[serde(flatten)]
    pub rule: FeeRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryFee {
    pub category_id: String,
    #[serde(flatten)]
    pub rule: FeeRule,
}

/// An amount bracket, `min_amount <= amount < max_amount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeTier {
    pub min_amount: Decimal,
    #[serde(default)]
    pub max_amount: Option<Decimal>,
    #[serde(flatten)]
    pub rule: FeeRule,
}

impl FeeTier {
    fn contains(&self, amount: Decimal) -> bool {
        amount >= self.min_amount && self.max_amount.is_none_or(|max| amount < max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFeeOverride {
    pub user_id: String,
    pub valid_from: DateTime<Utc>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub rule: FeeRule,
}

impl UserFeeOverride {
    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && self.valid_until.is_none_or(|until| now < until)
    }
}

/// A time-boxed promotion. Empty category/user lists match everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionalFee {
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub min_amount: Option<Decimal>,
    #[serde(default)]
    pub max_amount: Option<Decimal>,
    #[serde(default)]
    pub category_ids: Vec<String>,
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(flatten)]
    pub rule: FeeRule,
}

fn default_true() -> bool {
    true
}

impl PromotionalFee {
    fn matches(&self, ctx: &FeeContext, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.starts_at <= now
            && now < self.ends_at
            && self.min_amount.is_none_or(|min| ctx.amount >= min)
            && self.max_amount.is_none_or(|max| ctx.amount <= max)
            && (self.category_ids.is_empty()
                || ctx
                    .category_id
                    .as_ref()
                    .is_some_and(|c| self.category_ids.contains(c)))
            && (self.user_ids.is_empty()
                || ctx
                    .user_id
                    .as_ref()
                    .is_some_and(|u| self.user_ids.contains(u)))
    }
}

/// A versioned platform fee rule set. Only one version may be active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformFeeConfig {
    pub version: u32,
    pub is_active: bool,
    #[serde(default)]
    pub fee_type: FeeType,
    #[serde(flatten)]
    pub default_rule: FeeRule,
    /// Global clamps applied after the winning rule's own clamps.
    #[serde(default)]
    pub global_minimum_fee: Option<Decimal>,
    #[serde(default)]
    pub global_maximum_fee: Option<Decimal>,
    #[serde(default)]
    pub currency_fees: Vec<CurrencyFee>,
    #[serde(default)]
    pub category_fees: Vec<CategoryFee>,
    #[serde(default)]
    pub tiers: Vec<FeeTier>,
    #[serde(default)]
    pub user_overrides: Vec<UserFeeOverride>,
    #[serde(default)]
    pub promotions: Vec<PromotionalFee>,
}

impl Default for PlatformFeeConfig {
    fn default() -> Self {
        Self {
            version: 1,
            is_active: true,
            fee_type: FeeType::Percentage,
            default_rule: FeeRule {
                percentage: Decimal::TEN,
                ..FeeRule::default()
            },
            global_minimum_fee: None,
            global_maximum_fee: None,
            currency_fees: Vec::new(),
            category_fees: Vec::new(),
            tiers: Vec::new(),
            user_overrides: Vec::new(),
            promotions: Vec::new(),
        }
    }
}

impl PlatformFeeConfig {
    pub fn validate(&self) -> Result<()> {
        let v = self.version;
        self.default_rule.validate(&format!("fee config v{v} default"))?;
        for c in &self.currency_fees {
            c.rule.validate(&format!("fee config v{v} currency {}", c.currency))?;
        }
        for c in &self.category_fees {
            c.rule.validate(&format!("fee config v{v} category {}", c.category_id))?;
        }
        for (i, t) in self.tiers.iter().enumerate() {
            t.rule.validate(&format!("fee config v{v} tier {i}"))?;
        }
        for u in &self.user_overrides {
            u.rule.validate(&format!("fee config v{v} user {}", u.user_id))?;
        }
        for p in &self.promotions {
            p.rule.validate(&format!("fee config v{v} promotion {}", p.name))?;
        }
        if self.fee_type == FeeType::Tiered && self.tiers.is_empty() {
            return Err(PaymentError::ConfigError(format!(
                "fee config v{v} is tiered but defines no tiers"
            )));
        }
        Ok(())
    }

    /// Picks the single active version out of all stored versions.
    pub fn select_active(configs: &[PlatformFeeConfig]) -> Result<&PlatformFeeConfig> {
        let mut active = configs.iter().filter(|c| c.is_active);
        match (active.next(), active.next()) {
            (Some(config), None) => Ok(config),
            (None, _) => Err(PaymentError::ConfigError(
                "no active platform fee configuration".to_string(),
            )),
            (Some(_), Some(_)) => Err(PaymentError::ConfigError(
                "more than one active platform fee configuration".to_string(),
            )),
        }
    }
}

/// Inputs to a fee calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeContext {
    pub amount: Decimal,
    pub currency: Currency,
    pub category_id: Option<String>,
    pub user_id: Option<String>,
}

/// Which rule produced a fee, kept with the transaction for dispute audits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum AppliedRule {
    UserOverride { user_id: String },
    Promotion { name: String },
    Category { category_id: String },
    Currency { currency: String },
    Tier { index: usize },
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeQuote {
    pub fee: Decimal,
    pub currency: Currency,
    pub applied_rule: AppliedRule,
    pub config_version: u32,
    pub percentage: Decimal,
    pub fixed_amount: Decimal,
}

/// Applies one `PlatformFeeConfig`. Holds no clock; callers pass `now`.
#[derive(Debug, Clone)]
pub struct FeeCalculator {
    config: PlatformFeeConfig,
}

impl FeeCalculator {
    pub fn new(config: PlatformFeeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Builds a calculator from every stored version, requiring exactly one active.
    pub fn from_versions(configs: &[PlatformFeeConfig]) -> Result<Self> {
        Self::new(PlatformFeeConfig::select_active(configs)?.clone())
    }

    pub fn config(&self) -> &PlatformFeeConfig {
        &self.config
    }

    pub fn calculate(&self, ctx: &FeeContext, now: DateTime<Utc>) -> Result<FeeQuote> {
        if ctx.amount < Decimal::ZERO {
            return Err(PaymentError::ValidationError(
                "Fee base amount must not be negative".to_string(),
            ));
        }
        let (rule, applied_rule) = self.select_rule(ctx, now);
        let fee = clamp(
            rule.apply(ctx.amount),
            self.config.global_minimum_fee,
            self.config.global_maximum_fee,
        );
        Ok(FeeQuote {
            fee: ctx.currency.round(fee),
            currency: ctx.currency.clone(),
            applied_rule,
            config_version: self.config.version,
            percentage: rule.percentage,
            fixed_amount: rule.fixed_amount,
        })
    }

    fn select_rule(&self, ctx: &FeeContext, now: DateTime<Utc>) -> (&FeeRule, AppliedRule) {
        let config = &self.config;

        if let Some(user_id) = &ctx.user_id
            && let Some(o) = config
                .user_overrides
                .iter()
                .find(|o| &o.user_id == user_id && o.is_valid_at(now))
        {
            return (
                &o.rule,
                AppliedRule::UserOverride {
                    user_id: o.user_id.clone(),
                },
            );
        }

        if let Some(p) = config.promotions.iter().find(|p| p.matches(ctx, now)) {
            return (
                &p.rule,
                AppliedRule::Promotion {
                    name: p.name.clone(),
                },
            );
        }

        if let Some(category_id) = &ctx.category_id
            && let Some(c) = config
                .category_fees
                .iter()
                .find(|c| &c.category_id == category_id)
        {
            return (
                &c.rule,
                AppliedRule::Category {
                    category_id: c.category_id.clone(),
                },
            );
        }

        if let Some(c) = config
            .currency_fees
            .iter()
            .find(|c| c.currency == ctx.currency)
        {
            return (
                &c.rule,
                AppliedRule::Currency {
                    currency: c.currency.to_string(),
                },
            );
        }

        if config.fee_type == FeeType::Tiered
            && let Some((index, t)) = config
                .tiers
                .iter()
                .enumerate()
                .find(|(_, t)| t.contains(ctx.amount))
        {
            return (&t.rule, AppliedRule::Tier { index });
        }

        (&config.default_rule, AppliedRule::Default)
    }
}
