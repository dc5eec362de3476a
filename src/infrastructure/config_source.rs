use crate::config::AppConfig;
use crate::domain::fees::PlatformFeeConfig;
use crate::domain::gateway::PaymentGatewayConfig;
use crate::domain::ports::ConfigSource;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Configuration held in memory. Setters let an operator or a test swap
/// the stored documents before calling `reload()` on the services.
#[derive(Default, Clone)]
pub struct StaticConfigSource {
    gateways: Arc<RwLock<Vec<PaymentGatewayConfig>>>,
    fees: Arc<RwLock<Vec<PlatformFeeConfig>>>,
}

impl StaticConfigSource {
    pub fn new(gateways: Vec<PaymentGatewayConfig>, fees: Vec<PlatformFeeConfig>) -> Self {
        Self {
            gateways: Arc::new(RwLock::new(gateways)),
            fees: Arc::new(RwLock::new(fees)),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.gateways.clone(), config.platform_fees.clone())
    }

    pub async fn set_gateway_configs(&self, gateways: Vec<PaymentGatewayConfig>) {
        *self.gateways.write().await = gateways;
    }

    pub async fn set_fee_configs(&self, fees: Vec<PlatformFeeConfig>) {
        *self.fees.write().await = fees;
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn gateway_configs(&self) -> Result<Vec<PaymentGatewayConfig>> {
        Ok(self.gateways.read().await.clone())
    }

    async fn fee_configs(&self) -> Result<Vec<PlatformFeeConfig>> {
        Ok(self.fees.read().await.clone())
    }
}

/// Re-reads a JSON `AppConfig` file, with environment overrides, on every call.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<AppConfig> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || AppConfig::from_path(path))
            .await
            .map_err(|e| PaymentError::InternalError(Box::new(e)))?
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn gateway_configs(&self) -> Result<Vec<PaymentGatewayConfig>> {
        Ok(self.load().await?.gateways)
    }

    async fn fee_configs(&self) -> Result<Vec<PlatformFeeConfig>> {
        Ok(self.load().await?.platform_fees)
    }
}
