//! One reconciliation cycle: parse, safety close, then open.

use crate::config::Config;
use crate::exchange::ExchangeGateway;
use crate::strategy::reconciler::{PhaseReport, ReconciliationEngine};
use crate::strategy::signal::{ActionVocabulary, Rejection, Signal, SignalParser};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every raw signal was rejected; no phase ran
    NoValidSignals,
    /// Safety close ran; there were no buy/sell signals
    NothingToOpen,
    /// Both phases ran
    Complete,
    /// Another cycle held the guard; this trigger was dropped
    AlreadyRunning,
}

/// Everything that happened in one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub signals: Vec<Signal>,
    pub rejections: Vec<Rejection>,
    pub close_phase: Option<PhaseReport>,
    pub open_phase: Option<PhaseReport>,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>, outcome: CycleOutcome) -> Self {
        Self {
            started_at,
            signals: Vec::new(),
            rejections: Vec::new(),
            close_phase: None,
            open_phase: None,
            outcome,
        }
    }

    /// Orders accepted by the exchange across both phases.
    pub fn orders_submitted(&self) -> usize {
        [&self.close_phase, &self.open_phase]
            .into_iter()
            .flatten()
            .map(PhaseReport::submitted)
            .sum()
    }

    fn log_summary(&self) {
        let elapsed = Utc::now() - self.started_at;
        info!(
            outcome = ?self.outcome,
            accepted = self.signals.len(),
            rejected = self.rejections.len(),
            closed = self.close_phase.as_ref().map_or(0, PhaseReport::submitted),
            opened = self.open_phase.as_ref().map_or(0, PhaseReport::submitted),
            elapsed_ms = elapsed.num_milliseconds(),
            "=== Cycle finished ==="
        );
    }
}

/// Runs cycles one at a time.
pub struct CycleRunner {
    parser: SignalParser,
    engine: ReconciliationEngine,
    guard: Mutex<()>,
}

impl CycleRunner {
    pub fn new(parser: SignalParser, engine: ReconciliationEngine) -> Self {
        Self {
            parser,
            engine,
            guard: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config, gateway: Arc<dyn ExchangeGateway>) -> Self {
        let vocabulary = ActionVocabulary::new(
            config
                .trading
                .action_vocabulary
                .iter()
                .map(|(word, action)| (word, *action)),
        );
        let parser = SignalParser::new(&config.trading.supported_tickers, vocabulary);
        let engine = ReconciliationEngine::new(
            gateway,
            config.trading.clone(),
            config.execution.call_timeout(),
        );
        Self::new(parser, engine)
    }

    /// Run one full cycle over `raw_signals`.
    ///
    /// A trigger that arrives while a cycle is in flight returns
    /// [`CycleOutcome::AlreadyRunning`] without touching the exchange.
    pub async fn run_cycle<S: AsRef<str>>(&self, raw_signals: &[S]) -> CycleReport {
        let started_at = Utc::now();
        let Ok(_running) = self.guard.try_lock() else {
            warn!("Cycle already in progress, trigger ignored");
            return CycleReport::new(started_at, CycleOutcome::AlreadyRunning);
        };

        info!(
            %started_at,
            raw_signals = raw_signals.len(),
            "=== Starting reconciliation cycle ==="
        );

        let batch = self.parser.parse_batch(raw_signals);
        let mut report = CycleReport {
            signals: batch.signals,
            rejections: batch.rejections,
            ..CycleReport::new(started_at, CycleOutcome::NoValidSignals)
        };

        if report.signals.is_empty() {
            warn!("No valid signals received, skipping reconciliation");
            report.log_summary();
            return report;
        }

        report.close_phase = Some(self.engine.close_unsignaled(&report.signals).await);

        if !report.signals.iter().any(|s| s.action.opens_position()) {
            info!("No BUY/SELL signals, nothing to open");
            report.outcome = CycleOutcome::NothingToOpen;
            report.log_summary();
            return report;
        }

        report.open_phase = Some(self.engine.open_new_positions(&report.signals).await);
        report.outcome = CycleOutcome::Complete;
        report.log_summary();
        report
    }
}
