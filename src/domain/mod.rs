//! Domain types, invariants and the ports the application layer depends on.

pub mod escrow;
pub mod fees;
pub mod gateway;
pub mod money;
pub mod payout;
pub mod ports;
pub mod wallet;
