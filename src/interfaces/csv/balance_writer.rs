use crate::domain::wallet::Wallet;
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct BalanceRow<'a> {
    user: &'a str,
    currency: &'a str,
    balance: Decimal,
    withdrawals_pending: usize,
    consistent: bool,
}

/// Writes one CSV row per wallet and currency.
pub struct BalanceWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> BalanceWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_wallets<'a, I>(&mut self, wallets: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Wallet>,
    {
        for wallet in wallets {
            let consistent = wallet.is_consistent();
            for (currency, balance) in wallet.balances() {
                let withdrawals_pending = wallet
                    .transactions()
                    .iter()
                    .filter(|t| &t.currency == currency)
                    .filter_map(|t| t.payout())
                    .filter(|p| !p.status.is_terminal())
                    .count();
                self.writer.serialize(BalanceRow {
                    user: &wallet.user_id,
                    currency: currency.code(),
                    balance: currency.round(*balance).normalize(),
                    withdrawals_pending,
                    consistent,
                })?;
            }
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::{Currency, Money};
    use crate::domain::wallet::EntryMetadata;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_writes_one_row_per_currency() {
        let mut wallet = Wallet::new("alice", Utc::now());
        for (amount, code, reference) in [(dec!(10.50), "USD", "a"), (dec!(3), "EUR", "b")] {
            wallet
                .credit(
                    &Money::new(amount, Currency::new(code).unwrap()),
                    "seed",
                    EntryMetadata::Adjustment {
                        reference: reference.into(),
                    },
                    Utc::now(),
                )
                .unwrap();
        }
        let mut out = Vec::new();
        BalanceWriter::new(&mut out).write_wallets([&wallet]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "user,currency,balance,withdrawals_pending,consistent",
                "alice,EUR,3,0,true",
                "alice,USD,10.5,0,true",
            ]
        );
    }
}
