use crate::domain::gateway::{PayoutRail, PayoutReceipt, PayoutRequest};
use crate::domain::wallet::PayoutStatus;
use crate::error::Result;
use async_trait::async_trait;
use tracing::info;

pub const MANUAL_RAIL: &str = "manual";

/// Bank transfers settled by an operator. The payout stays pending until an
/// operator reports its outcome through the usual payout update path.
#[derive(Debug, Default, Clone)]
pub struct ManualPayoutRail;

impl ManualPayoutRail {
    pub fn new() -> Self {
        Self
    }

    pub fn payout_id(entry_id: &str) -> String {
        format!("{MANUAL_RAIL}-{entry_id}")
    }
}

#[async_trait]
impl PayoutRail for ManualPayoutRail {
    fn name(&self) -> &str {
        MANUAL_RAIL
    }

    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<PayoutReceipt> {
        let payout_id = Self::payout_id(&request.entry_id);
        info!(
            user_id = %request.user_id,
            payout_id,
            amount = %request.amount,
            "manual payout queued for operator"
        );
        Ok(PayoutReceipt {
            payout_id,
            status: PayoutStatus::Pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::{Currency, Money};
    use crate::domain::payout::DestinationType;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_payout_id_derives_from_entry() {
        let rail = ManualPayoutRail::new();
        let receipt = rail
            .initiate_payout(&PayoutRequest {
                user_id: "u1".into(),
                amount: Money::new(dec!(25), Currency::usd()),
                destination_type: DestinationType::BankAccount,
                destination_reference: "ba_tok".into(),
                entry_id: "e-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(receipt.payout_id, "manual-e-1");
        assert_eq!(receipt.status, PayoutStatus::Pending);
    }
}
