pub mod balance_writer;
pub mod ledger_reader;
