//! Type definitions for dYdX v4 indexer responses and order requests.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Suffix of every USD-quoted perpetual market.
pub const MARKET_SUFFIX: &str = "-USD";

/// Market id for a ticker (e.g. "BTC" -> "BTC-USD").
pub fn market_id(ticker: &str) -> String {
    format!("{}{}", ticker, MARKET_SUFFIX)
}

/// Order side (buy or sell).
///
/// The indexer reports position sides as LONG/SHORT; those map onto
/// `Buy`/`Sell` respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    #[serde(alias = "LONG")]
    Buy,
    #[serde(alias = "SHORT")]
    Sell,
}

impl OrderSide {
    /// The side that flattens a position held on `self`.
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Time in force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Ioc, // Immediate or Cancel
}

/// Open perpetual position, normalised across subaccounts.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenPosition {
    /// Market id (e.g. "SOL-USD")
    pub market: String,
    pub side: OrderSide,
    /// Absolute position size in the base asset
    pub size: Decimal,
    pub subaccount_id: u32,
}

impl OpenPosition {
    /// Ticker part of the market id.
    pub fn ticker(&self) -> &str {
        self.market
            .strip_suffix(MARKET_SUFFIX)
            .unwrap_or(&self.market)
    }
}

/// Order to submit to the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub ticker: String,
    pub side: OrderSide,
    /// Size in the base asset
    pub size: Decimal,
    /// Limit price in USD
    pub price: Decimal,
    pub subaccount_id: u32,
    pub reduce_only: bool,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    /// Immediate-or-cancel limit order.
    pub fn ioc(
        ticker: impl Into<String>,
        side: OrderSide,
        size: Decimal,
        price: Decimal,
        subaccount_id: u32,
        reduce_only: bool,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            side,
            size,
            price,
            subaccount_id,
            reduce_only,
            time_in_force: TimeInForce::Ioc,
        }
    }

    pub fn market(&self) -> String {
        market_id(&self.ticker)
    }
}

/// Acknowledgement returned once an order is accepted for broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub status: String,
    #[serde(rename = "txHash")]
    pub tx_reference: String,
}

// ==================== Indexer Types ====================

/// Response from `GET /v4/addresses/{address}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressResponse {
    #[serde(default)]
    pub subaccounts: Vec<SubaccountInfo>,
}

/// Response from `GET /v4/addresses/{address}/subaccountNumber/{n}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubaccountResponse {
    pub subaccount: SubaccountInfo,
}

/// Subaccount state as reported by the indexer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubaccountInfo {
    pub subaccount_number: u32,
    #[serde(default)]
    pub open_perpetual_positions: HashMap<String, PerpetualPosition>,
    #[serde(default)]
    pub asset_positions: HashMap<String, AssetPosition>,
}

/// Perpetual position entry. Short sizes are negative.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerpetualPosition {
    pub market: String,
    pub side: OrderSide,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    #[serde(default)]
    pub status: Option<String>,
}

/// Collateral asset entry (e.g. USDC).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPosition {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
}

impl AssetPosition {
    /// Balance with the sign implied by the side.
    pub fn signed_size(&self) -> Decimal {
        match self.side {
            OrderSide::Buy => self.size.abs(),
            OrderSide::Sell => -self.size.abs(),
        }
    }
}

/// Response from `GET /v4/perpetualMarkets?ticker=...`.
#[derive(Debug, Clone, Deserialize)]
pub struct PerpetualMarketsResponse {
    #[serde(default)]
    pub markets: HashMap<String, PerpetualMarket>,
}

/// Perpetual market metadata and oracle price.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerpetualMarket {
    pub ticker: String,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub oracle_price: Option<Decimal>,
}

/// Order payload sent to the broadcaster.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastOrder {
    pub market: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: &'static str,
    pub time_in_force: TimeInForce,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub subaccount_number: u32,
    pub client_id: u32,
    pub reduce_only: bool,
    #[serde(rename = "goodTilBlock")]
    pub good_til_block: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_ticker_strips_market_suffix() {
        let position = OpenPosition {
            market: "LINK-USD".to_string(),
            side: OrderSide::Sell,
            size: dec!(50),
            subaccount_id: 129,
        };
        assert_eq!(position.ticker(), "LINK");
        assert_eq!(market_id("LINK"), position.market);
    }

    #[test]
    fn test_side_accepts_long_short_aliases() {
        let long: OrderSide = serde_json::from_str("\"LONG\"").unwrap();
        let short: OrderSide = serde_json::from_str("\"SHORT\"").unwrap();
        assert_eq!(long, OrderSide::Buy);
        assert_eq!(short, OrderSide::Sell);
        assert_eq!(short.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_parse_subaccount_response() {
        let body = r#"{
            "subaccount": {
                "address": "dydx1abc",
                "subaccountNumber": 0,
                "equity": "1520.5",
                "freeCollateral": "1400",
                "openPerpetualPositions": {
                    "BTC-USD": {"market": "BTC-USD", "status": "OPEN", "side": "SHORT", "size": "-0.25"}
                },
                "assetPositions": {
                    "USDC": {"symbol": "USDC", "side": "LONG", "size": "1000.75", "assetId": "0"}
                }
            }
        }"#;

        let parsed: SubaccountResponse = serde_json::from_str(body).unwrap();
        let sub = parsed.subaccount;
        assert_eq!(sub.subaccount_number, 0);
        assert_eq!(sub.asset_positions["USDC"].signed_size(), dec!(1000.75));
        let btc = &sub.open_perpetual_positions["BTC-USD"];
        assert_eq!(btc.side, OrderSide::Sell);
        assert_eq!(btc.size, dec!(-0.25));
    }

    #[test]
    fn test_parse_market_with_null_oracle_price() {
        let body = r#"{"markets": {"DOGE-USD": {"ticker": "DOGE-USD", "status": "ACTIVE", "oraclePrice": null}}}"#;
        let parsed: PerpetualMarketsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.markets["DOGE-USD"].oracle_price, None);
    }
}
