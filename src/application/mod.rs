//! Application services. Each is constructed once with its ports and shared
//! behind an `Arc`.

pub mod currency;
pub mod escrow;
pub mod fees;
pub mod ledger;
pub mod payout;
pub mod registry;
pub mod webhook;
