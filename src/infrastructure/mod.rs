//! Adapters behind the domain ports: stores, providers, transport, config.

pub mod config_source;
pub mod gateways;
pub mod http;
pub mod in_memory;
pub mod rates;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
