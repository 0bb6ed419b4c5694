//! Exchange integrations for the signal rebalancer.
//!
//! ## dYdX v4
//! - Account and market reads from the public indexer REST API
//! - Order submission through a signing broadcaster service
//!
//! ## Paper trading
//! In-memory exchange that fills orders immediately against injected prices.

mod client;
pub mod mock;
mod traits;
mod types;

pub use client::DydxClient;
pub use mock::MockDydxClient;
#[cfg(test)]
pub use traits::MockExchangeGateway;
pub use traits::{ExchangeGateway, GatewayError};
pub use types::*;
