use crate::domain::fees::{FeeCalculator, FeeContext, FeeQuote, PlatformFeeConfig};
use crate::domain::ports::ConfigSourceBox;
use crate::error::Result;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;

/// The active platform fee configuration, swappable at runtime.
pub struct FeeSchedule {
    source: ConfigSourceBox,
    calculator: RwLock<FeeCalculator>,
}

impl FeeSchedule {
    /// Loads the stored versions and selects the single active one.
    pub async fn init(source: ConfigSourceBox) -> Result<Self> {
        let calculator = FeeCalculator::from_versions(&source.fee_configs().await?)?;
        info!(version = calculator.config().version, "platform fee config loaded");
        Ok(Self {
            source,
            calculator: RwLock::new(calculator),
        })
    }

    /// Re-reads the source. An invalid set of versions keeps the current one.
    pub async fn reload(&self) -> Result<u32> {
        let calculator = FeeCalculator::from_versions(&self.source.fee_configs().await?)?;
        let version = calculator.config().version;
        *self.calculator.write().await = calculator;
        info!(version, "platform fee config reloaded");
        Ok(version)
    }

    pub async fn quote(&self, ctx: &FeeContext, now: DateTime<Utc>) -> Result<FeeQuote> {
        self.calculator.read().await.calculate(ctx, now)
    }

    pub async fn active_config(&self) -> PlatformFeeConfig {
        self.calculator.read().await.config().clone()
    }
}
