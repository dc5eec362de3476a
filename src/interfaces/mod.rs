//! Outer adapters for the command-line binary.

pub mod csv;
