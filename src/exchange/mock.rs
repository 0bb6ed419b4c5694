//! Mock trading client for paper trading and tests.

use super::traits::{ExchangeGateway, GatewayError};
use super::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Simulated isolated position.
#[derive(Debug, Clone, PartialEq)]
pub struct MockPosition {
    pub market: String,
    /// Signed quantity (negative = short)
    pub qty: Decimal,
    pub entry_price: Decimal,
}

/// Mock trading state for paper trading.
#[derive(Debug, Clone)]
pub struct MockTradingState {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    /// Positions keyed by (subaccount, market)
    pub positions: BTreeMap<(u32, String), MockPosition>,
    pub total_trading_fees: Decimal,
    /// Every accepted order, in submission order
    pub orders: Vec<OrderRequest>,
}

impl Default for MockTradingState {
    fn default() -> Self {
        Self {
            initial_balance: dec!(10000),
            balance: dec!(10000),
            positions: BTreeMap::new(),
            total_trading_fees: Decimal::ZERO,
            orders: Vec::new(),
        }
    }
}

/// Injected failures for exercising error paths.
#[derive(Debug, Default)]
struct FailureInjection {
    positions: bool,
    balance: bool,
    price_errors: HashSet<String>,
    rejected_tickers: HashSet<String>,
    latency: Option<Duration>,
}

/// Mock client that simulates the dYdX gateway.
pub struct MockDydxClient {
    state: Arc<RwLock<MockTradingState>>,
    order_id_counter: AtomicU64,
    /// Simulated oracle prices keyed by ticker
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
    failures: Arc<RwLock<FailureInjection>>,
    /// Trading fee rate (0.05% taker)
    fee_rate: Decimal,
}

impl MockDydxClient {
    /// Create a new mock client with initial balance.
    pub fn new(initial_balance: Decimal) -> Self {
        let state = MockTradingState {
            initial_balance,
            balance: initial_balance,
            ..Default::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            order_id_counter: AtomicU64::new(1),
            prices: Arc::new(RwLock::new(HashMap::new())),
            failures: Arc::new(RwLock::new(FailureInjection::default())),
            fee_rate: dec!(0.0005),
        }
    }

    /// Update simulated prices (call this with real data).
    pub async fn update_market_data(&self, prices: HashMap<String, Decimal>) {
        *self.prices.write().await = prices;
    }

    /// Set or replace a single ticker price.
    pub async fn set_price(&self, ticker: &str, price: Decimal) {
        self.prices.write().await.insert(ticker.to_string(), price);
    }

    /// Remove a ticker price so lookups report it as unavailable.
    pub async fn clear_price(&self, ticker: &str) {
        self.prices.write().await.remove(ticker);
    }

    /// Seed an existing position, as if opened in an earlier cycle.
    pub async fn insert_position(
        &self,
        market: &str,
        side: OrderSide,
        size: Decimal,
        subaccount_id: u32,
        entry_price: Decimal,
    ) {
        let qty = match side {
            OrderSide::Buy => size,
            OrderSide::Sell => -size,
        };
        self.state.write().await.positions.insert(
            (subaccount_id, market.to_string()),
            MockPosition {
                market: market.to_string(),
                qty,
                entry_price,
            },
        );
    }

    /// Make position snapshot fetches fail.
    pub async fn fail_positions(&self, fail: bool) {
        self.failures.write().await.positions = fail;
    }

    /// Make balance fetches fail.
    pub async fn fail_balance(&self, fail: bool) {
        self.failures.write().await.balance = fail;
    }

    /// Make price lookups for a ticker return a transport error.
    pub async fn fail_price(&self, ticker: &str) {
        self.failures
            .write()
            .await
            .price_errors
            .insert(ticker.to_string());
    }

    /// Make order submissions for a ticker get rejected.
    pub async fn reject_orders(&self, ticker: &str) {
        self.failures
            .write()
            .await
            .rejected_tickers
            .insert(ticker.to_string());
    }

    /// Delay every call by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.failures.write().await.latency = latency;
    }

    /// Get current mock state for logging.
    pub async fn get_state(&self) -> MockTradingState {
        self.state.read().await.clone()
    }

    /// Orders accepted so far.
    pub async fn orders(&self) -> Vec<OrderRequest> {
        self.state.read().await.orders.clone()
    }

    /// Reset all state for a new paper session.
    pub async fn reset(&self, initial_balance: Decimal) {
        *self.state.write().await = MockTradingState {
            initial_balance,
            balance: initial_balance,
            ..Default::default()
        };
        self.order_id_counter.store(1, Ordering::SeqCst);
        self.prices.write().await.clear();
        *self.failures.write().await = FailureInjection::default();

        debug!(balance = %initial_balance, "Mock client state reset");
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = self.failures.read().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Apply a fill to the position book.
    fn apply_fill(state: &mut MockTradingState, order: &OrderRequest) -> Result<(), GatewayError> {
        let key = (order.subaccount_id, order.market());
        let delta = match order.side {
            OrderSide::Buy => order.size,
            OrderSide::Sell => -order.size,
        };

        if order.reduce_only {
            let position = state.positions.get_mut(&key).ok_or_else(|| {
                GatewayError::Rejected(format!(
                    "reduce-only order without position on {} subaccount {}",
                    key.1, key.0
                ))
            })?;

            let reduces = (position.qty > Decimal::ZERO && delta < Decimal::ZERO)
                || (position.qty < Decimal::ZERO && delta > Decimal::ZERO);
            if !reduces {
                return Err(GatewayError::Rejected(format!(
                    "reduce-only {} would increase position on {}",
                    order.side, key.1
                )));
            }

            // Reduce-only fills are capped at the open quantity.
            let capped = delta.abs().min(position.qty.abs());
            if delta > Decimal::ZERO {
                position.qty += capped;
            } else {
                position.qty -= capped;
            }
            if position.qty == Decimal::ZERO {
                state.positions.remove(&key);
            }
            return Ok(());
        }

        let position = state
            .positions
            .entry(key.clone())
            .or_insert_with(|| MockPosition {
                market: key.1.clone(),
                qty: Decimal::ZERO,
                entry_price: order.price,
            });
        position.qty += delta;
        position.entry_price = order.price;
        if position.qty == Decimal::ZERO {
            state.positions.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeGateway for MockDydxClient {
    async fn list_open_positions(&self) -> Result<Vec<OpenPosition>, GatewayError> {
        self.simulate_latency().await;
        if self.failures.read().await.positions {
            return Err(GatewayError::Unavailable("positions endpoint down".to_string()));
        }

        let state = self.state.read().await;
        Ok(state
            .positions
            .iter()
            .map(|((subaccount_id, market), p)| OpenPosition {
                market: market.clone(),
                side: if p.qty >= Decimal::ZERO {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                },
                size: p.qty.abs(),
                subaccount_id: *subaccount_id,
            })
            .collect())
    }

    async fn get_balance(&self) -> Result<Decimal, GatewayError> {
        self.simulate_latency().await;
        if self.failures.read().await.balance {
            return Err(GatewayError::Unavailable("balance endpoint down".to_string()));
        }
        Ok(self.state.read().await.balance)
    }

    async fn get_price(&self, ticker: &str) -> Result<Option<Decimal>, GatewayError> {
        self.simulate_latency().await;
        if self.failures.read().await.price_errors.contains(ticker) {
            return Err(GatewayError::Unavailable(format!(
                "price feed down for {}",
                ticker
            )));
        }
        Ok(self.prices.read().await.get(ticker).copied())
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError> {
        self.simulate_latency().await;
        if self
            .failures
            .read()
            .await
            .rejected_tickers
            .contains(&order.ticker)
        {
            return Err(GatewayError::Rejected(format!(
                "order for {} rejected",
                order.ticker
            )));
        }

        let mut state = self.state.write().await;
        Self::apply_fill(&mut state, order)?;

        let fee = order.size * order.price * self.fee_rate;
        state.balance -= fee;
        state.total_trading_fees += fee;
        state.orders.push(order.clone());

        let order_id = self.next_order_id();

        info!(
            order_id,
            market = %order.market(),
            side = %order.side,
            size = %order.size,
            price = %order.price,
            subaccount = order.subaccount_id,
            reduce_only = order.reduce_only,
            fee = %fee,
            "Mock order filled"
        );

        Ok(OrderAck {
            status: "success".to_string(),
            tx_reference: format!("MOCK-{:08}", order_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_client_with_price(ticker: &str, price: Decimal) -> MockDydxClient {
        let client = MockDydxClient::new(dec!(10000));
        client.set_price(ticker, price).await;
        client
    }

    #[tokio::test]
    async fn test_open_order_creates_position_and_charges_fee() {
        let client = setup_client_with_price("BTC", dec!(50000)).await;

        let order = OrderRequest::ioc("BTC", OrderSide::Sell, dec!(0.2), dec!(50000), 1, false);
        let ack = client.submit_order(&order).await.unwrap();
        assert_eq!(ack.tx_reference, "MOCK-00000001");

        let positions = client.list_open_positions().await.unwrap();
        assert_eq!(
            positions,
            vec![OpenPosition {
                market: "BTC-USD".to_string(),
                side: OrderSide::Sell,
                size: dec!(0.2),
                subaccount_id: 1,
            }]
        );

        // Fee = 0.2 * 50000 * 0.0005 = $5
        let state = client.get_state().await;
        assert_eq!(state.total_trading_fees, dec!(5));
        assert_eq!(state.balance, dec!(9995));
    }

    #[tokio::test]
    async fn test_reduce_only_close_removes_position() {
        let client = setup_client_with_price("LINK", dec!(15)).await;
        client
            .insert_position("LINK-USD", OrderSide::Sell, dec!(50), 129, dec!(14))
            .await;

        let close = OrderRequest::ioc("LINK", OrderSide::Buy, dec!(50), dec!(15), 129, true);
        client.submit_order(&close).await.unwrap();

        assert!(client.list_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reduce_only_on_wrong_subaccount_is_rejected() {
        let client = setup_client_with_price("LINK", dec!(15)).await;
        client
            .insert_position("LINK-USD", OrderSide::Sell, dec!(50), 129, dec!(14))
            .await;

        let close = OrderRequest::ioc("LINK", OrderSide::Buy, dec!(50), dec!(15), 130, true);
        assert!(matches!(
            client.submit_order(&close).await,
            Err(GatewayError::Rejected(_))
        ));
        assert_eq!(client.list_open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reduce_only_same_side_is_rejected() {
        let client = setup_client_with_price("SOL", dec!(150)).await;
        client
            .insert_position("SOL-USD", OrderSide::Buy, dec!(10.5), 128, dec!(140))
            .await;

        let wrong = OrderRequest::ioc("SOL", OrderSide::Buy, dec!(1), dec!(150), 128, true);
        assert!(client.submit_order(&wrong).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_price_is_unavailable_not_error() {
        let client = MockDydxClient::new(dec!(1000));
        assert_eq!(client.get_price("DOGE").await.unwrap(), None);

        client.fail_price("DOGE").await;
        assert!(client.get_price("DOGE").await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let client = MockDydxClient::new(dec!(1000));
        client.fail_positions(true).await;
        client.fail_balance(true).await;
        client.reject_orders("ETH").await;

        assert!(client.list_open_positions().await.is_err());
        assert!(client.get_balance().await.is_err());

        let order = OrderRequest::ioc("ETH", OrderSide::Buy, dec!(1), dec!(3000), 1, false);
        assert!(client.submit_order(&order).await.is_err());
        assert!(client.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_all_state() {
        let client = setup_client_with_price("BTC", dec!(50000)).await;
        let order = OrderRequest::ioc("BTC", OrderSide::Buy, dec!(0.1), dec!(50000), 1, false);
        client.submit_order(&order).await.unwrap();
        client.fail_balance(true).await;

        client.reset(dec!(5000)).await;

        let state = client.get_state().await;
        assert_eq!(state.balance, dec!(5000));
        assert!(state.positions.is_empty());
        assert!(state.orders.is_empty());
        assert_eq!(client.get_balance().await.unwrap(), dec!(5000));
        assert_eq!(client.get_price("BTC").await.unwrap(), None);
    }
}
