//! Currency conversion with a periodically refreshed rate table.
//!
//! Requests read the cached table and never wait on a live fetch. The
//! configured static table is the fallback for pairs the live source lacks.

use crate::config::CurrencySettings;
use crate::domain::money::Currency;
use crate::domain::ports::RateSourceBox;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
struct RateTable {
    /// Units of each currency per one unit of the base currency.
    rates: HashMap<Currency, Decimal>,
    fetched_at: Option<DateTime<Utc>>,
}

impl RateTable {
    fn rate(&self, base: &Currency, from: &Currency, to: &Currency) -> Option<Decimal> {
        let quote = |c: &Currency| {
            if c == base {
                Some(Decimal::ONE)
            } else {
                self.rates.get(c).copied().filter(|r| *r > Decimal::ZERO)
            }
        };
        Some(quote(to)? / quote(from)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateOrigin {
    Identity,
    Live,
    Fallback,
}

pub struct CurrencyConverter {
    base: Currency,
    fallback: RateTable,
    live: RwLock<RateTable>,
    source: Option<RateSourceBox>,
    refreshing: AtomicBool,
}

/// Clears the in-flight flag even if the fetch future is dropped.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CurrencyConverter {
    pub fn new(settings: &CurrencySettings, source: Option<RateSourceBox>) -> Self {
        Self {
            base: settings.base.clone(),
            fallback: RateTable {
                rates: settings
                    .rates
                    .iter()
                    .map(|(c, r)| (c.clone(), *r))
                    .collect(),
                fetched_at: None,
            },
            live: RwLock::new(RateTable::default()),
            source,
            refreshing: AtomicBool::new(false),
        }
    }

    /// Static rates only.
    pub fn with_static_rates(settings: &CurrencySettings) -> Self {
        Self::new(settings, None)
    }

    pub fn base(&self) -> &Currency {
        &self.base
    }

    /// First fetch. A failure leaves the converter on static rates.
    pub async fn init(&self) -> Result<()> {
        self.refresh().await.map(|_| ())
    }

    /// Fetches a new table unless one is already being fetched.
    ///
    /// Returns `Ok(false)` when another refresh was in flight or no live
    /// source is configured. Fetch errors are logged and the previous table
    /// keeps serving.
    pub async fn refresh(&self) -> Result<bool> {
        let Some(source) = &self.source else {
            return Ok(false);
        };
        if self.refreshing.swap(true, Ordering::AcqRel) {
            debug!("rate refresh already in flight");
            return Ok(false);
        }
        let _guard = RefreshGuard(&self.refreshing);

        match source.fetch(&self.base).await {
            Ok(rates) => {
                let count = rates.len();
                *self.live.write().await = RateTable {
                    rates,
                    fetched_at: Some(Utc::now()),
                };
                info!(base = %self.base, count, "exchange rates refreshed");
                Ok(true)
            }
            Err(e) => {
                warn!(base = %self.base, error = %e, "exchange rate refresh failed, serving stale rates");
                Ok(false)
            }
        }
    }

    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.live.read().await.fetched_at
    }

    /// Rate to multiply an amount in `from` by to get `to`, and where it came from.
    pub async fn rate(&self, from: &Currency, to: &Currency) -> Option<(Decimal, RateOrigin)> {
        if from == to {
            return Some((Decimal::ONE, RateOrigin::Identity));
        }
        if let Some(rate) = self.live.read().await.rate(&self.base, from, to) {
            return Some((rate, RateOrigin::Live));
        }
        self.fallback
            .rate(&self.base, from, to)
            .map(|rate| (rate, RateOrigin::Fallback))
    }

    /// Converts and rounds to `to`'s minor unit. Unknown pairs are refused.
    pub async fn convert(&self, amount: Decimal, from: &Currency, to: &Currency) -> Result<Decimal> {
        let (rate, origin) = self.rate(from, to).await.ok_or_else(|| {
            PaymentError::unsupported_currency(to, format!("no exchange rate from {from}"))
        })?;
        if origin == RateOrigin::Fallback {
            debug!(%from, %to, %rate, "using fallback exchange rate");
        }
        Ok(to.round(amount * rate))
    }

    /// Refreshes every `interval` until the handle is aborted.
    pub fn spawn_periodic_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = self.refresh().await;
            }
        })
    }
}
