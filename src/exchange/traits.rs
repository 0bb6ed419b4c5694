//! Venue-agnostic gateway trait used by the reconciliation engine.
//!
//! One implementation talks to the live dYdX indexer and order
//! broadcaster; the other is the in-memory paper exchange.

use super::types::{OpenPosition, OrderAck, OrderRequest};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single gateway call.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("exchange API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

/// Account, market and order operations against a perpetuals exchange.
///
/// A gateway is bound to a single account when constructed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// All open perpetual positions across the account's subaccounts.
    /// Empty when nothing is open.
    async fn list_open_positions(&self) -> Result<Vec<OpenPosition>, GatewayError>;

    /// Quote-currency balance of the main subaccount.
    async fn get_balance(&self) -> Result<Decimal, GatewayError>;

    /// Current oracle price for a ticker.
    ///
    /// `Ok(None)` means the price is unavailable, which is not an error.
    async fn get_price(&self, ticker: &str) -> Result<Option<Decimal>, GatewayError>;

    /// Submit a limit order.
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError>;
}
