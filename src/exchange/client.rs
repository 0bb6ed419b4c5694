//! dYdX v4 client: indexer REST reads plus signed order submission.

use crate::config::{DydxConfig, ExecutionConfig};
use crate::exchange::traits::{ExchangeGateway, GatewayError};
use crate::exchange::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::{debug, info, instrument};

const QUOTE_ASSET: &str = "USDC";

/// dYdX v4 client bound to one account address.
pub struct DydxClient {
    http: Client,
    address: String,
    signing_key: String,
    indexer_url: String,
    broker_url: String,
    main_subaccount: u32,
    good_til_blocks: u32,
}

impl DydxClient {
    /// Create a new client from configuration.
    ///
    /// Reads work without credentials, so the same client can feed prices
    /// into the paper exchange.
    pub fn new(config: &DydxConfig, execution: &ExecutionConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            address: config.address.clone(),
            signing_key: config.signing_key.clone(),
            indexer_url: config.indexer_url.trim_end_matches('/').to_string(),
            broker_url: config.broker_url.trim_end_matches('/').to_string(),
            main_subaccount: config.main_subaccount,
            good_til_blocks: execution.good_til_blocks,
        })
    }

    /// Generate HMAC-SHA256 signature over `timestamp + body`.
    fn sign(&self, timestamp: u64, body: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.signing_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current timestamp in milliseconds.
    fn timestamp() -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    /// Client order id derived from the submission time.
    fn client_id(timestamp: u64) -> u32 {
        (timestamp % u64::from(u32::MAX)) as u32
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GatewayError> {
        let response = self.http.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ExchangeGateway for DydxClient {
    #[instrument(skip(self), fields(address = %self.address))]
    async fn list_open_positions(&self) -> Result<Vec<OpenPosition>, GatewayError> {
        let url = format!(
            "{}/v4/addresses/{}",
            self.indexer_url,
            urlencoding::encode(&self.address)
        );
        let response: AddressResponse = self.get_json(&url).await?;

        let mut positions: Vec<OpenPosition> = response
            .subaccounts
            .into_iter()
            .flat_map(|sub| {
                let subaccount_id = sub.subaccount_number;
                sub.open_perpetual_positions
                    .into_values()
                    .filter(|p| p.status.as_deref().map_or(true, |s| s == "OPEN"))
                    .map(move |p| OpenPosition {
                        market: p.market,
                        side: p.side,
                        size: p.size.abs(),
                        subaccount_id,
                    })
            })
            .collect();

        // Indexer maps are unordered; keep close order stable between runs.
        positions.sort_by(|a, b| {
            a.subaccount_id
                .cmp(&b.subaccount_id)
                .then_with(|| a.market.cmp(&b.market))
        });

        info!(count = positions.len(), "Fetched open positions");
        Ok(positions)
    }

    #[instrument(skip(self), fields(address = %self.address))]
    async fn get_balance(&self) -> Result<Decimal, GatewayError> {
        let url = format!(
            "{}/v4/addresses/{}/subaccountNumber/{}",
            self.indexer_url,
            urlencoding::encode(&self.address),
            self.main_subaccount
        );
        let response: SubaccountResponse = self.get_json(&url).await?;

        let balance = response
            .subaccount
            .asset_positions
            .get(QUOTE_ASSET)
            .map(AssetPosition::signed_size)
            .unwrap_or(Decimal::ZERO);

        info!(%balance, subaccount = self.main_subaccount, "Fetched quote balance");
        Ok(balance)
    }

    #[instrument(skip(self))]
    async fn get_price(&self, ticker: &str) -> Result<Option<Decimal>, GatewayError> {
        let market = market_id(ticker);
        let url = format!(
            "{}/v4/perpetualMarkets?ticker={}",
            self.indexer_url,
            urlencoding::encode(&market)
        );

        let response: PerpetualMarketsResponse = match self.get_json(&url).await {
            Ok(r) => r,
            Err(GatewayError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                debug!(%market, "Market not listed");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let price = response
            .markets
            .get(&market)
            .and_then(|m| m.oracle_price)
            .filter(|p| *p > Decimal::ZERO);

        debug!(%market, price = ?price, "Fetched oracle price");
        Ok(price)
    }

    #[instrument(skip(self), fields(market = %order.market(), side = %order.side))]
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError> {
        if self.signing_key.is_empty() {
            return Err(GatewayError::Rejected(
                "no signing credential configured".to_string(),
            ));
        }

        let timestamp = Self::timestamp();
        let payload = BroadcastOrder {
            market: order.market(),
            side: order.side,
            order_type: "LIMIT",
            time_in_force: order.time_in_force,
            size: order.size.normalize(),
            price: order.price.normalize(),
            subaccount_number: order.subaccount_id,
            client_id: Self::client_id(timestamp),
            reduce_only: order.reduce_only,
            good_til_block: self.good_til_blocks,
        };
        let body =
            serde_json::to_string(&payload).map_err(|e| GatewayError::Decode(e.to_string()))?;
        let signature = self.sign(timestamp, &body);

        let url = format!("{}/v1/orders", self.broker_url);
        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Account-Address", &self.address)
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Signature", signature)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let ack: OrderAck = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        info!(
            client_id = payload.client_id,
            tx = %ack.tx_reference,
            status = %ack.status,
            "Order accepted by broadcaster"
        );
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, signing_key: &str) -> DydxClient {
        let config = DydxConfig {
            address: "dydx1test".to_string(),
            signing_key: signing_key.to_string(),
            indexer_url: server.uri(),
            broker_url: server.uri(),
            main_subaccount: 0,
        };
        DydxClient::new(&config, &ExecutionConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_list_open_positions_flattens_subaccounts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/addresses/dydx1test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "subaccounts": [
                    {
                        "subaccountNumber": 0,
                        "openPerpetualPositions": {},
                        "assetPositions": {}
                    },
                    {
                        "subaccountNumber": 129,
                        "openPerpetualPositions": {
                            "LINK-USD": {"market": "LINK-USD", "status": "OPEN", "side": "SHORT", "size": "-50"}
                        }
                    },
                    {
                        "subaccountNumber": 128,
                        "openPerpetualPositions": {
                            "SOL-USD": {"market": "SOL-USD", "status": "OPEN", "side": "LONG", "size": "10.5"}
                        }
                    }
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, "");
        let positions = client.list_open_positions().await.unwrap();

        assert_eq!(
            positions,
            vec![
                OpenPosition {
                    market: "SOL-USD".to_string(),
                    side: OrderSide::Buy,
                    size: dec!(10.5),
                    subaccount_id: 128,
                },
                OpenPosition {
                    market: "LINK-USD".to_string(),
                    side: OrderSide::Sell,
                    size: dec!(50),
                    subaccount_id: 129,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_get_balance_reads_usdc_asset_position() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/addresses/dydx1test/subaccountNumber/0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "subaccount": {
                    "subaccountNumber": 0,
                    "equity": "2500",
                    "assetPositions": {
                        "USDC": {"symbol": "USDC", "side": "LONG", "size": "2400.5"}
                    }
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, "");
        assert_eq!(client.get_balance().await.unwrap(), dec!(2400.5));
    }

    #[tokio::test]
    async fn test_get_price_returns_oracle_price() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/perpetualMarkets"))
            .and(query_param("ticker", "BTC-USD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "markets": {
                    "BTC-USD": {"ticker": "BTC-USD", "status": "ACTIVE", "oraclePrice": "64000.5"}
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, "");
        assert_eq!(client.get_price("BTC").await.unwrap(), Some(dec!(64000.5)));
    }

    #[tokio::test]
    async fn test_get_price_unavailable_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/perpetualMarkets"))
            .and(query_param("ticker", "DOGE-USD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"markets": {}})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v4/perpetualMarkets"))
            .and(query_param("ticker", "XRP-USD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server, "");
        assert_eq!(client.get_price("DOGE").await.unwrap(), None);
        assert_eq!(client.get_price("XRP").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_price_server_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/perpetualMarkets"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let client = client_for(&server, "");
        match client.get_price("ETH").await {
            Err(GatewayError::Api { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_order_signs_and_posts_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .and(header("X-Account-Address", "dydx1test"))
            .and(header_exists("X-Signature"))
            .and(header_exists("X-Timestamp"))
            .and(body_partial_json(json!({
                "market": "LINK-USD",
                "side": "BUY",
                "type": "LIMIT",
                "timeInForce": "IOC",
                "size": "50",
                "price": "14.2",
                "subaccountNumber": 129,
                "reduceOnly": true,
                "goodTilBlock": 20
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "txHash": "ABCDEF"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, "secret");
        let order = OrderRequest::ioc("LINK", OrderSide::Buy, dec!(50.0), dec!(14.20), 129, true);
        let ack = client.submit_order(&order).await.unwrap();

        assert_eq!(ack.status, "success");
        assert_eq!(ack.tx_reference, "ABCDEF");
    }

    #[tokio::test]
    async fn test_submit_order_without_credential_is_rejected() {
        let server = MockServer::start().await;
        let client = client_for(&server, "");
        let order = OrderRequest::ioc("BTC", OrderSide::Sell, dec!(0.1), dec!(60000), 1, false);

        assert!(matches!(
            client.submit_order(&order).await,
            Err(GatewayError::Rejected(_))
        ));
    }

    #[test]
    fn test_signature_depends_on_timestamp_and_body() {
        let config = DydxConfig {
            signing_key: "secret".to_string(),
            ..DydxConfig::default()
        };
        let client = DydxClient::new(&config, &ExecutionConfig::default()).unwrap();

        let a = client.sign(1, "{}");
        assert_eq!(a.len(), 64);
        assert_eq!(a, client.sign(1, "{}"));
        assert_ne!(a, client.sign(2, "{}"));
        assert_ne!(a, client.sign(1, "{\"x\":1}"));
    }
}
