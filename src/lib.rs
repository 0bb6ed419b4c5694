//! # dYdX Signal Rebalancer
//!
//! Reconciles isolated-margin perpetual positions on dYdX v4 against a
//! daily list of trading signals.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: dYdX gateway (indexer REST + order broadcaster) and paper client
//! - `strategy`: Signal parsing, margin allocation, and two-phase reconciliation
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod exchange;
pub mod strategy;
pub mod utils;

pub use config::Config;
