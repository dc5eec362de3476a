use crate::domain::escrow::EscrowStatus;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors produced by the escrow engine, its adapters and its stores.
///
/// Duplicate webhook deliveries are not errors; they are reported as successful
/// outcomes by the reconciliation processor and the payout orchestrator.
#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Gateway {gateway} rejected credentials: {message}")]
    GatewayAuthError { gateway: String, message: String },
    #[error("Gateway {gateway} unavailable: {message}")]
    GatewayUnavailable { gateway: String, message: String },
    #[error("Gateway {gateway} rejected the request: {message}")]
    GatewayRejected { gateway: String, message: String },
    #[error("Gateway {0} is not configured")]
    GatewayNotConfigured(String),
    #[error("Currency {currency} is not supported by {context}")]
    CurrencyUnsupported { currency: String, context: String },
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: EscrowStatus, to: EscrowStatus },
    #[error("Insufficient funds: {available} {currency} available, {requested} requested")]
    InsufficientFunds {
        currency: String,
        available: Decimal,
        requested: Decimal,
    },
    #[error("{window} withdrawal limit of {limit} {currency} exceeded")]
    WithdrawalLimitExceeded {
        window: &'static str,
        currency: String,
        limit: Decimal,
    },
    #[error("Webhook signature rejected: {0}")]
    InvalidSignature(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("Concurrent modification of {0}")]
    Conflict(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, PaymentError>;

impl PaymentError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn unsupported_currency(currency: impl ToString, context: impl ToString) -> Self {
        Self::CurrencyUnsupported {
            currency: currency.to_string(),
            context: context.to_string(),
        }
    }

    /// Whether the failure is transient and the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GatewayUnavailable { .. } | Self::Conflict(_)
        )
    }

    /// The HTTP status class an endpoint should answer with.
    ///
    /// Webhook providers retry on anything that is not 2xx, so transient and
    /// signature failures must never map to a success code.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ValidationError(_)
            | Self::CurrencyUnsupported { .. }
            | Self::InvalidSignature(_)
            | Self::GatewayRejected { .. } => 400,
            Self::InsufficientFunds { .. } | Self::WithdrawalLimitExceeded { .. } => 422,
            Self::NotFound { .. } => 404,
            Self::InvalidTransition { .. } | Self::Conflict(_) => 409,
            Self::GatewayUnavailable { .. } => 503,
            Self::GatewayAuthError { .. } | Self::GatewayNotConfigured(_) => 502,
            _ => 500,
        }
    }
}
