use crate::error::{PaymentError, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An ISO-4217 currency code.
///
/// Codes are normalised to upper case on construction so `usd` from a
/// provider payload and `USD` from configuration compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code))
        } else {
            Err(PaymentError::ValidationError(format!(
                "Invalid currency code '{code}'"
            )))
        }
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    /// Number of decimal places in the currency's smallest unit.
    pub fn minor_units(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" | "CLP" | "ISK" | "UGX" | "XAF" | "XOF" => 0,
            "BHD" | "JOD" | "KWD" | "OMR" | "TND" | "IQD" | "LYD" => 3,
            _ => 2,
        }
    }

    /// Rounds to the smallest unit, half away from zero.
    pub fn round(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.minor_units(), RoundingStrategy::MidpointAwayFromZero)
    }

    /// The value of one smallest unit, used as the comparison tolerance.
    pub fn tolerance(&self) -> Decimal {
        Decimal::new(1, self.minor_units())
    }

    pub fn to_minor_units(&self, amount: Decimal) -> Result<i64> {
        let scaled = self.round(amount) * Decimal::from(10_i64.pow(self.minor_units()));
        scaled.trunc().try_into().map_err(|_| {
            PaymentError::ValidationError(format!("Amount {amount} out of range for {self}"))
        })
    }

    pub fn from_minor_units(&self, minor: i64) -> Decimal {
        Decimal::new(minor, self.minor_units())
    }
}

impl TryFrom<String> for Currency {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl FromStr for Currency {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A monetary amount tagged with its currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// Builds a strictly positive amount, as required for charges and transfers.
    pub fn positive(amount: Decimal, currency: Currency) -> Result<Self> {
        if amount > Decimal::ZERO {
            Ok(Self { amount, currency })
        } else {
            Err(PaymentError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn rounded(&self) -> Self {
        Self {
            amount: self.currency.round(self.amount),
            currency: self.currency.clone(),
        }
    }

    /// Equality within one smallest currency unit.
    pub fn approx_eq(&self, other: &Money) -> bool {
        self.currency == other.currency
            && (self.amount - other.amount).abs() <= self.currency.tolerance()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_currency_normalisation() {
        assert_eq!(Currency::new("usd").unwrap(), Currency::new("USD").unwrap());
        assert!(matches!(
            Currency::new("US"),
            Err(PaymentError::ValidationError(_))
        ));
        assert!(Currency::new("U$D").is_err());
    }

    #[test]
    fn test_rounding_respects_minor_units() {
        let usd = Currency::new("USD").unwrap();
        let jpy = Currency::new("JPY").unwrap();
        let kwd = Currency::new("KWD").unwrap();
        assert_eq!(usd.round(dec!(3.185)), dec!(3.19));
        assert_eq!(jpy.round(dec!(150.5)), dec!(151));
        assert_eq!(kwd.round(dec!(1.23456)), dec!(1.235));
    }

    #[test]
    fn test_minor_unit_conversion() {
        let usd = Currency::new("USD").unwrap();
        assert_eq!(usd.to_minor_units(dec!(113.49)).unwrap(), 11349);
        assert_eq!(usd.from_minor_units(11349), dec!(113.49));

        let jpy = Currency::new("JPY").unwrap();
        assert_eq!(jpy.to_minor_units(dec!(1500)).unwrap(), 1500);
    }

    #[test]
    fn test_money_validation() {
        let usd = Currency::new("USD").unwrap();
        assert!(Money::positive(dec!(1.0), usd.clone()).is_ok());
        assert!(Money::positive(dec!(0.0), usd.clone()).is_err());
        assert!(Money::positive(dec!(-1.0), usd).is_err());
    }

    #[test]
    fn test_money_tolerance() {
        let usd = Currency::new("USD").unwrap();
        let a = Money::new(dec!(10.00), usd.clone());
        assert!(a.approx_eq(&Money::new(dec!(10.01), usd.clone())));
        assert!(!a.approx_eq(&Money::new(dec!(10.02), usd)));
    }

    #[test]
    fn test_currency_serde_roundtrip_is_uppercase() {
        let c: Currency = serde_json::from_str("\"eur\"").unwrap();
        assert_eq!(serde_json::to_string(&c).unwrap(), "\"EUR\"");
    }
}
