use super::escrow::UserId;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationType {
    BankAccount,
    PaypalAccount,
    Card,
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BankAccount => "bank_account",
            Self::PaypalAccount => "paypal_account",
            Self::Card => "card",
        })
    }
}

/// Destination details. Only masked identifiers are ever stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestinationDetails {
    BankAccount {
        bank_name: String,
        account_holder: String,
        masked_account_number: String,
        masked_routing_number: Option<String>,
    },
    PaypalAccount {
        masked_email: String,
    },
    Card {
        brand: String,
        last4: String,
        expiry_month: u8,
        expiry_year: u16,
    },
}

impl DestinationDetails {
    pub fn destination_type(&self) -> DestinationType {
        match self {
            Self::BankAccount { .. } => DestinationType::BankAccount,
            Self::PaypalAccount { .. } => DestinationType::PaypalAccount,
            Self::Card { .. } => DestinationType::Card,
        }
    }
}

/// Raw destination data as submitted by the user. Never persisted.
#[derive(Debug, Clone)]
pub enum RawDestination {
    BankAccount {
        bank_name: String,
        account_holder: String,
        account_number: String,
        routing_number: Option<String>,
    },
    PaypalAccount {
        email: String,
    },
    Card {
        brand: String,
        number: String,
        expiry_month: u8,
        expiry_year: u16,
    },
}

/// Keeps the last four characters, replacing the rest with `*`.
pub fn mask_tail(value: &str) -> String {
    let chars: Vec<char> = value.chars().filter(|c| !c.is_whitespace()).collect();
    let visible = chars.len().min(4);
    let hidden = chars.len() - visible;
    "*".repeat(hidden) + &chars[hidden..].iter().collect::<String>()
}

/// `jane.doe@example.com` becomes `j*******@example.com`.
pub fn mask_email(email: &str) -> Result<String> {
    let (local, domain) = email
        .split_once('@')
        .filter(|(l, d)| !l.is_empty() && d.contains('.'))
        .ok_or_else(|| PaymentError::ValidationError(format!("Invalid email '{email}'")))?;
    let mut chars = local.chars();
    let first = chars.next().unwrap_or('*');
    Ok(format!("{first}{}@{domain}", "*".repeat(chars.count())))
}

impl RawDestination {
    pub fn mask(self) -> Result<DestinationDetails> {
        match self {
            Self::BankAccount {
                bank_name,
                account_holder,
                account_number,
                routing_number,
            } => {
                if account_number.trim().len() < 4 {
                    return Err(PaymentError::ValidationError(
                        "Account number is too short".to_string(),
                    ));
                }
                Ok(DestinationDetails::BankAccount {
                    bank_name,
                    account_holder,
                    masked_account_number: mask_tail(&account_number),
                    masked_routing_number: routing_number.as_deref().map(mask_tail),
                })
            }
            Self::PaypalAccount { email } => Ok(DestinationDetails::PaypalAccount {
                masked_email: mask_email(&email)?,
            }),
            Self::Card {
                brand,
                number,
                expiry_month,
                expiry_year,
            } => {
                let digits: String = number.chars().filter(char::is_ascii_digit).collect();
                if digits.len() < 12 || !(1..=12).contains(&expiry_month) {
                    return Err(PaymentError::ValidationError(
                        "Invalid card details".to_string(),
                    ));
                }
                Ok(DestinationDetails::Card {
                    brand,
                    last4: digits[digits.len() - 4..].to_string(),
                    expiry_month,
                    expiry_year,
                })
            }
        }
    }
}

/// A user's payout destination. Soft-deleted only, to keep the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutDestination {
    pub id: String,
    pub user_id: UserId,
    pub details: DestinationDetails,
    /// Provider-side token (connected account, vault id...), never a raw number.
    pub provider_reference: String,
    pub is_verified: bool,
    pub is_active: bool,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PayoutDestination {
    pub fn new(
        user_id: impl Into<UserId>,
        raw: RawDestination,
        provider_reference: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            details: raw.mask()?,
            provider_reference: provider_reference.into(),
            is_verified: false,
            is_active: true,
            is_default: false,
            created_at: now,
            deleted_at: None,
        })
    }

    pub fn destination_type(&self) -> DestinationType {
        self.details.destination_type()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Payouts go only to verified, active, non-deleted destinations.
    pub fn ensure_payable(&self) -> Result<()> {
        if self.is_deleted() || !self.is_active {
            return Err(PaymentError::ValidationError(format!(
                "Payout destination {} is not active",
                self.id
            )));
        }
        if !self.is_verified {
            return Err(PaymentError::ValidationError(format!(
                "Payout destination {} is not verified",
                self.id
            )));
        }
        Ok(())
    }

    pub fn soft_delete(&mut self, now: DateTime<Utc>) {
        self.deleted_at = Some(now);
        self.is_active = false;
        self.is_default = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_tail() {
        assert_eq!(mask_tail("123456789"), "*****6789");
        assert_eq!(mask_tail("12"), "12");
        assert_eq!(mask_tail("1234 5678"), "****5678");
    }

    #[test]
    fn test_mask_email() {
        assert_eq!(
            mask_email("jane.doe@example.com").unwrap(),
            "j*******@example.com"
        );
        assert!(mask_email("not-an-email").is_err());
    }

    #[test]
    fn test_raw_numbers_never_stored() {
        let dest = PayoutDestination::new(
            "u1",
            RawDestination::BankAccount {
                bank_name: "First Bank".into(),
                account_holder: "Jane".into(),
                account_number: "000123456789".into(),
                routing_number: Some("110000000".into()),
            },
            "ba_token",
            Utc::now(),
        )
        .unwrap();
        let json = serde_json::to_string(&dest).unwrap();
        assert!(!json.contains("000123456789"));
        assert!(!json.contains("110000000"));
        assert!(json.contains("********6789"));
    }

    #[test]
    fn test_card_keeps_last4() {
        let details = RawDestination::Card {
            brand: "visa".into(),
            number: "4242 4242 4242 4242".into(),
            expiry_month: 12,
            expiry_year: 2030,
        }
        .mask()
        .unwrap();
        assert!(matches!(details, DestinationDetails::Card { ref last4, .. } if last4 == "4242"));
    }

    #[test]
    fn test_unverified_destination_not_payable() {
        let mut dest = PayoutDestination::new(
            "u1",
            RawDestination::PaypalAccount {
                email: "jane@example.com".into(),
            },
            "PAYER-7KX2",
            Utc::now(),
        )
        .unwrap();
        assert!(dest.ensure_payable().is_err());
        dest.is_verified = true;
        assert!(dest.ensure_payable().is_ok());
        dest.soft_delete(Utc::now());
        assert!(dest.ensure_payable().is_err());
        assert!(!dest.is_default);
    }
}
