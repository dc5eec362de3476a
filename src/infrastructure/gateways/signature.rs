//! Webhook signature checks shared by the provider adapters.

use crate::error::{PaymentError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a timestamped signature.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

pub fn hmac_sha256_hex(secret: &[u8], payload: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| PaymentError::InvalidSignature(e.to_string()))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a hex HMAC-SHA256 digest of `payload` in constant time.
pub fn verify_hmac_hex(secret: &[u8], payload: &[u8], signature_hex: &str) -> Result<()> {
    let expected = hex::decode(signature_hex.trim())
        .map_err(|_| PaymentError::InvalidSignature("signature is not hex".to_string()))?;
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| PaymentError::InvalidSignature(e.to_string()))?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| PaymentError::InvalidSignature("digest mismatch".to_string()))
}

/// Parsed `t=<unix>,v1=<hex>[,v1=<hex>...]` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedSignature {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

impl TimestampedSignature {
    pub fn parse(header: &str) -> Result<Self> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    timestamp = value.parse::<i64>().ok();
                }
                Some(("v1", value)) => signatures.push(value.to_string()),
                _ => {}
            }
        }
        let timestamp = timestamp
            .ok_or_else(|| PaymentError::InvalidSignature("missing timestamp".to_string()))?;
        if signatures.is_empty() {
            return Err(PaymentError::InvalidSignature(
                "missing v1 signature".to_string(),
            ));
        }
        Ok(Self {
            timestamp,
            signatures,
        })
    }

    /// Accepts the header if any `v1` matches `HMAC(secret, "{t}.{body}")` and
    /// the timestamp lies within `tolerance_secs` of `now`.
    pub fn verify(&self, secret: &[u8], body: &[u8], now: i64, tolerance_secs: i64) -> Result<()> {
        if (now - self.timestamp).abs() > tolerance_secs {
            return Err(PaymentError::InvalidSignature(
                "timestamp outside tolerance".to_string(),
            ));
        }
        let mut signed = format!("{}.", self.timestamp).into_bytes();
        signed.extend_from_slice(body);
        if self
            .signatures
            .iter()
            .any(|s| verify_hmac_hex(secret, &signed, s).is_ok())
        {
            Ok(())
        } else {
            Err(PaymentError::InvalidSignature(
                "no matching v1 signature".to_string(),
            ))
        }
    }
}

/// Builds a `t=..,v1=..` header, as a provider would.
pub fn sign_timestamped(secret: &[u8], body: &[u8], timestamp: i64) -> Result<String> {
    let mut signed = format!("{timestamp}.").into_bytes();
    signed.extend_from_slice(body);
    Ok(format!("t={timestamp},v1={}", hmac_sha256_hex(secret, &signed)?))
}
