//! Margin allocation and isolated subaccount assignment.

use crate::config::TradingConfig;
use crate::exchange::{market_id, OpenPosition, OrderRequest, OrderSide};
use crate::strategy::signal::{Signal, SignalAction};
use crate::utils::decimal::{round_to_precision, safe_div};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{info, warn};

/// Hands out isolated-margin subaccount ids that are not in use.
///
/// Works on its own copy of the used set, so ids handed out earlier in the
/// same cycle are never returned twice.
#[derive(Debug, Clone)]
pub struct SubaccountAllocator {
    next: u32,
    used: HashSet<u32>,
}

impl SubaccountAllocator {
    pub fn new(start: u32, used: impl IntoIterator<Item = u32>) -> Self {
        Self {
            next: start,
            used: used.into_iter().collect(),
        }
    }

    /// Smallest free id >= start; marks it used.
    pub fn allocate(&mut self) -> u32 {
        // Every id below `next` is either used or below start.
        while self.used.contains(&self.next) {
            self.next += 1;
        }
        let id = self.next;
        self.used.insert(id);
        id
    }
}

/// Equal margin split across this cycle's candidates.
///
/// Decided once up front; margin of candidates skipped later is not
/// redistributed within the cycle. Negative balances allocate nothing.
pub fn margin_per_trade(balance: Decimal, candidates: usize) -> Decimal {
    safe_div(balance.max(Decimal::ZERO), Decimal::from(candidates))
}

/// Why an item produced no order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A position already exists for the market
    AlreadyOpen,
    /// The ticker was already planned earlier in this cycle
    DuplicateSignal,
    /// No usable price
    PriceUnavailable,
    /// Computed order size is zero
    ZeroSize,
    /// Position to close has no size
    EmptyPosition,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::AlreadyOpen => "position already open",
            SkipReason::DuplicateSignal => "ticker already planned this cycle",
            SkipReason::PriceUnavailable => "price unavailable",
            SkipReason::ZeroSize => "computed size is zero",
            SkipReason::EmptyPosition => "position size is zero",
        };
        f.write_str(text)
    }
}

/// One new position to open.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOrder {
    pub ticker: String,
    pub side: OrderSide,
    pub subaccount_id: u32,
    pub leverage: Decimal,
    pub size_in_asset: Decimal,
    pub limit_price: Decimal,
}

impl PlannedOrder {
    pub fn to_order(&self) -> OrderRequest {
        OrderRequest::ioc(
            self.ticker.clone(),
            self.side,
            self.size_in_asset,
            self.limit_price,
            self.subaccount_id,
            false,
        )
    }
}

/// Decision for one candidate signal.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    Open(PlannedOrder),
    Skip { ticker: String, reason: SkipReason },
}

/// Orders to open this cycle, in signal order.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationPlan {
    pub margin_per_trade: Decimal,
    pub candidates: usize,
    pub steps: Vec<PlanStep>,
}

fn order_side(action: SignalAction) -> Option<OrderSide> {
    match action {
        SignalAction::Buy => Some(OrderSide::Buy),
        SignalAction::Sell => Some(OrderSide::Sell),
        SignalAction::Close => None,
    }
}

impl AllocationPlan {
    /// Build the plan for the buy/sell signals in `signals`.
    ///
    /// `prices` holds only usable prices; a ticker missing from it is
    /// skipped after its subaccount has been allocated.
    pub fn build(
        signals: &[Signal],
        snapshot: &[OpenPosition],
        balance: Decimal,
        prices: &HashMap<String, Decimal>,
        trading: &TradingConfig,
    ) -> Self {
        let candidates: Vec<(&Signal, OrderSide)> = signals
            .iter()
            .filter_map(|s| order_side(s.action).map(|side| (s, side)))
            .collect();

        let candidate_count = candidates.len();
        let margin = margin_per_trade(balance, candidate_count);
        info!(
            %balance,
            candidates = candidate_count,
            margin_per_trade = %round_to_precision(margin, 2),
            "Margin allocation"
        );

        let open_markets: HashSet<&str> = snapshot.iter().map(|p| p.market.as_str()).collect();
        let mut planned_markets: HashSet<String> = HashSet::new();
        let mut allocator = SubaccountAllocator::new(
            trading.isolated_subaccount_start,
            snapshot.iter().map(|p| p.subaccount_id),
        );

        let mut steps = Vec::with_capacity(candidate_count);
        for (signal, side) in candidates {
            let ticker = signal.ticker.clone();
            let market = market_id(&ticker);

            if open_markets.contains(market.as_str()) {
                info!(%ticker, "Position already exists, skipping open");
                steps.push(PlanStep::Skip {
                    ticker,
                    reason: SkipReason::AlreadyOpen,
                });
                continue;
            }
            if planned_markets.contains(&market) {
                warn!(%ticker, "Ticker already planned this cycle, skipping duplicate");
                steps.push(PlanStep::Skip {
                    ticker,
                    reason: SkipReason::DuplicateSignal,
                });
                continue;
            }

            let subaccount_id = allocator.allocate();
            let leverage = trading.leverage_for(&ticker);

            let Some(price) = prices.get(&ticker).copied().filter(|p| *p > Decimal::ZERO) else {
                warn!(%ticker, subaccount_id, "No price available, order aborted");
                steps.push(PlanStep::Skip {
                    ticker,
                    reason: SkipReason::PriceUnavailable,
                });
                continue;
            };

            let size_in_asset = (margin * leverage) / price;
            if size_in_asset <= Decimal::ZERO {
                warn!(%ticker, %margin, "No margin to allocate, order skipped");
                steps.push(PlanStep::Skip {
                    ticker,
                    reason: SkipReason::ZeroSize,
                });
                continue;
            }

            info!(
                %ticker,
                %side,
                margin = %round_to_precision(margin, 2),
                %leverage,
                %price,
                size = %round_to_precision(size_in_asset, 6),
                subaccount_id,
                "Order sized: (margin x leverage) / price"
            );

            planned_markets.insert(market);
            steps.push(PlanStep::Open(PlannedOrder {
                ticker,
                side,
                subaccount_id,
                leverage,
                size_in_asset,
                limit_price: price,
            }));
        }

        Self {
            margin_per_trade: margin,
            candidates: candidate_count,
            steps,
        }
    }

    /// Orders that will be submitted.
    pub fn orders(&self) -> impl Iterator<Item = &PlannedOrder> {
        self.steps.iter().filter_map(|step| match step {
            PlanStep::Open(order) => Some(order),
            PlanStep::Skip { .. } => None,
        })
    }
}
