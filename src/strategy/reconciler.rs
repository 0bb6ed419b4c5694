//! Two-phase reconciliation of open positions against the day's signals.
//!
//! Phase 1 (safety close) flattens every position whose ticker is absent
//! from the signal set. Phase 2 (open) allocates margin across buy/sell
//! signals that have no position yet and opens isolated positions.
//!
//! Both phases are best-effort: a failure on one item never stops its
//! siblings, and a failed snapshot or balance fetch only aborts its own phase.

use crate::config::TradingConfig;
use crate::exchange::{
    market_id, ExchangeGateway, GatewayError, OpenPosition, OrderAck, OrderRequest, OrderSide,
};
use crate::strategy::allocator::{AllocationPlan, PlanStep, SkipReason};
use crate::strategy::signal::Signal;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Reconciliation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SafetyClose,
    Open,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::SafetyClose => write!(f, "safety-close"),
            Phase::Open => write!(f, "open"),
        }
    }
}

/// What happened to a single position or signal.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Submitted(OrderAck),
    Skipped(SkipReason),
    Failed(String),
}

/// Per-item record of a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    pub ticker: String,
    /// Order details, when an order was built
    pub order: Option<OrderRequest>,
    pub outcome: ItemOutcome,
}

impl ItemReport {
    fn skipped(ticker: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            ticker: ticker.into(),
            order: None,
            outcome: ItemOutcome::Skipped(reason),
        }
    }
}

/// Result of running one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub items: Vec<ItemReport>,
    /// Set when the phase stopped before processing its items
    pub aborted: Option<String>,
    /// Margin assigned to each candidate (open phase only)
    pub margin_per_trade: Option<Decimal>,
}

impl PhaseReport {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            items: Vec::new(),
            aborted: None,
            margin_per_trade: None,
        }
    }

    fn abort(mut self, reason: &GatewayError) -> Self {
        self.aborted = Some(reason.to_string());
        self
    }

    pub fn submitted(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Submitted(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|i| pred(&i.outcome)).count()
    }
}

/// Drives gateway calls for both reconciliation phases.
pub struct ReconciliationEngine {
    gateway: Arc<dyn ExchangeGateway>,
    trading: TradingConfig,
    call_timeout: Duration,
}

impl ReconciliationEngine {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        trading: TradingConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            trading,
            call_timeout,
        }
    }

    /// Bound a gateway call by the configured timeout.
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.call_timeout)),
        }
    }

    /// Look up prices concurrently. Only usable prices are returned.
    async fn fetch_prices<'a>(
        &self,
        tickers: impl IntoIterator<Item = &'a str>,
    ) -> HashMap<String, Decimal> {
        let unique: BTreeSet<&str> = tickers.into_iter().collect();
        let lookups = unique.into_iter().map(|ticker| async move {
            (ticker, self.call(self.gateway.get_price(ticker)).await)
        });

        join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(ticker, result)| match result {
                Ok(Some(price)) if price > Decimal::ZERO => {
                    info!(ticker, %price, "Oracle price");
                    Some((ticker.to_string(), price))
                }
                Ok(_) => {
                    warn!(ticker, "Price unavailable");
                    None
                }
                Err(e) => {
                    warn!(ticker, error = %e, "Price lookup failed");
                    None
                }
            })
            .collect()
    }

    async fn submit(&self, order: OrderRequest) -> ItemReport {
        let outcome = match self.call(self.gateway.submit_order(&order)).await {
            Ok(ack) => {
                info!(
                    market = %order.market(),
                    side = %order.side,
                    size = %order.size,
                    price = %order.price,
                    subaccount = order.subaccount_id,
                    reduce_only = order.reduce_only,
                    tx = %ack.tx_reference,
                    "Order submitted"
                );
                ItemOutcome::Submitted(ack)
            }
            Err(e) => {
                error!(
                    market = %order.market(),
                    subaccount = order.subaccount_id,
                    error = %e,
                    "Order submission failed"
                );
                ItemOutcome::Failed(e.to_string())
            }
        };

        ItemReport {
            ticker: order.ticker.clone(),
            order: Some(order),
            outcome,
        }
    }

    /// Phase 1: close every position whose ticker has no signal today.
    ///
    /// Any valid signal, including CLOSE, keeps its ticker exempt.
    pub async fn close_unsignaled(&self, signals: &[Signal]) -> PhaseReport {
        let report = PhaseReport::new(Phase::SafetyClose);
        info!("--- Phase 1: safety close ---");

        let snapshot = match self.call(self.gateway.list_open_positions()).await {
            Ok(positions) => positions,
            Err(e) => {
                error!(error = %e, "Failed to fetch open positions, skipping safety close");
                return report.abort(&e);
            }
        };

        let signaled: HashSet<&str> = signals.iter().map(|s| s.ticker.as_str()).collect();
        info!(
            open = ?snapshot.iter().map(|p| p.market.as_str()).collect::<Vec<_>>(),
            signaled = ?signaled.iter().collect::<BTreeSet<_>>(),
            "Reconciling positions against signals"
        );

        let to_close: Vec<&OpenPosition> = snapshot
            .iter()
            .filter(|p| !signaled.contains(p.ticker()))
            .collect();
        for position in &to_close {
            warn!(
                market = %position.market,
                subaccount = position.subaccount_id,
                "Closing: position is not part of today's signals"
            );
        }

        let prices = self
            .fetch_prices(
                to_close
                    .iter()
                    .filter(|p| p.size > Decimal::ZERO)
                    .map(|p| p.ticker()),
            )
            .await;

        self.submit_closes(report, &to_close, &prices).await
    }

    async fn submit_closes(
        &self,
        mut report: PhaseReport,
        to_close: &[&OpenPosition],
        prices: &HashMap<String, Decimal>,
    ) -> PhaseReport {
        for position in to_close {
            let ticker = position.ticker();

            if position.size <= Decimal::ZERO {
                warn!(market = %position.market, "Position has no size, nothing to close");
                report
                    .items
                    .push(ItemReport::skipped(ticker, SkipReason::EmptyPosition));
                continue;
            }

            let Some(&price) = prices.get(ticker) else {
                error!(market = %position.market, "No price to close position, skipping");
                report
                    .items
                    .push(ItemReport::skipped(ticker, SkipReason::PriceUnavailable));
                continue;
            };

            let order = OrderRequest::ioc(
                ticker,
                closing_side(position),
                position.size,
                price,
                position.subaccount_id,
                true,
            );
            report.items.push(self.submit(order).await);
        }

        info!(
            submitted = report.submitted(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Safety close finished"
        );
        report
    }

    /// Phase 2: open positions for buy/sell signals without one.
    pub async fn open_new_positions(&self, signals: &[Signal]) -> PhaseReport {
        let mut report = PhaseReport::new(Phase::Open);
        info!("--- Phase 2: open new positions ---");

        let candidates: Vec<&Signal> = signals
            .iter()
            .filter(|s| s.action.opens_position())
            .collect();
        if candidates.is_empty() {
            info!("No new BUY/SELL signals to execute");
            return report;
        }

        let balance = match self.call(self.gateway.get_balance()).await {
            Ok(balance) => balance,
            Err(e) => {
                error!(error = %e, "Failed to fetch balance, aborting open phase");
                return report.abort(&e);
            }
        };

        let snapshot = match self.call(self.gateway.list_open_positions()).await {
            Ok(positions) => positions,
            Err(e) => {
                error!(error = %e, "Failed to fetch open positions, aborting open phase");
                return report.abort(&e);
            }
        };

        let open_markets: HashSet<&str> = snapshot.iter().map(|p| p.market.as_str()).collect();
        let prices = self
            .fetch_prices(
                candidates
                    .iter()
                    .filter(|s| !open_markets.contains(market_id(&s.ticker).as_str()))
                    .map(|s| s.ticker.as_str()),
            )
            .await;

        let plan = AllocationPlan::build(signals, &snapshot, balance, &prices, &self.trading);
        report.margin_per_trade = Some(plan.margin_per_trade);

        for step in plan.steps {
            match step {
                PlanStep::Open(planned) => report.items.push(self.submit(planned.to_order()).await),
                PlanStep::Skip { ticker, reason } => {
                    report.items.push(ItemReport::skipped(ticker, reason))
                }
            }
        }

        info!(
            submitted = report.submitted(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Open phase finished"
        );
        report
    }
}

/// Side of the order that flattens `position`.
pub fn closing_side(position: &OpenPosition) -> OrderSide {
    position.side.opposite()
}
