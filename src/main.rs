//! dYdX Signal Rebalancer - Main Entry Point
//!
//! Paper trading by default; set `LIVE_TRADING=true` to trade real funds.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dydx_signal_rebalancer::config::Config;
use dydx_signal_rebalancer::exchange::{DydxClient, ExchangeGateway, MockDydxClient};
use dydx_signal_rebalancer::strategy::{
    ActionVocabulary, CycleReport, CycleRunner, ItemOutcome, SignalParser,
};
use futures_util::future::{join_all, LocalBoxFuture};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

const DEFAULT_PAPER_BALANCE: Decimal = dec!(10000);

/// dYdX Signal Rebalancer CLI
#[derive(Parser)]
#[command(name = "dydx-signal-rebalancer")]
#[command(version, about = "Reconcile dYdX v4 isolated positions against daily signals")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run reconciliation cycles (default)
    Run(RunArgs),

    /// Parse signals and print each decision without trading
    Parse {
        /// Raw signals, e.g. "BTC COMPRAR"
        signals: Vec<String>,

        /// Read signals from a file, one per line
        #[arg(short = 'f', long)]
        signals_file: Option<PathBuf>,
    },

    /// Print the effective configuration (secrets redacted)
    ShowConfig,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Raw signal, repeatable: --signal "BTC COMPRAR" --signal "ETH FECHAR"
    #[arg(short, long = "signal")]
    signals: Vec<String>,

    /// Read signals from a file, one per line ('#' starts a comment)
    #[arg(short = 'f', long)]
    signals_file: Option<PathBuf>,

    /// Repeat the cycle every N seconds instead of running once
    #[arg(short, long)]
    interval_secs: Option<u64>,

    /// Starting USDC balance of the paper exchange
    #[arg(long)]
    paper_balance: Option<Decimal>,
}

/// Trading mode: Live (real money) or Mock (paper trading).
#[derive(Debug, Clone, Copy, PartialEq)]
enum TradingMode {
    Live,
    Mock,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Parse {
            signals,
            signals_file,
        }) => parse_only(&signals, signals_file.as_deref()),
        Some(Commands::ShowConfig) => show_config(),
        Some(Commands::Run(args)) => run(args).await,
        None => run(RunArgs::default()).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    init_logging()?;

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║          dYdX Signal Rebalancer v{}                     ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let trading_mode = if std::env::var("LIVE_TRADING").unwrap_or_default() == "true" {
        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
        TradingMode::Live
    } else {
        info!("📝 MOCK TRADING MODE - Paper trading enabled");
        TradingMode::Mock
    };

    let config = Config::load()?;
    config.validate()?;
    if trading_mode == TradingMode::Live {
        config.validate_credentials()?;
    }
    log_config(&config);

    let dydx = Arc::new(DydxClient::new(&config.dydx, &config.execution)?);
    let paper = match trading_mode {
        TradingMode::Live => None,
        TradingMode::Mock => {
            let balance = args.paper_balance.unwrap_or(DEFAULT_PAPER_BALANCE);
            info!(%balance, "Paper exchange initialized");
            Some(Arc::new(MockDydxClient::new(balance)))
        }
    };
    let gateway: Arc<dyn ExchangeGateway> = match &paper {
        Some(mock) => mock.clone(),
        None => dydx.clone(),
    };

    let runner = CycleRunner::from_config(&config, gateway);
    let interval = args.interval_secs.or(config.execution.cycle_interval_secs);

    let Some(interval_secs) = interval else {
        let raw = load_signals(&args.signals, args.signals_file.as_deref(), &config)?;
        if let Some(mock) = &paper {
            refresh_paper_prices(&dydx, mock, &config.trading.supported_tickers).await;
        }
        let report = runner.run_cycle(&raw).await;
        log_report(&report);
        if let Some(mock) = &paper {
            log_paper_state(mock).await;
        }
        return Ok(());
    };

    // Shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    info!(interval_secs, "🚀 Starting cycle loop...");
    let (args, config, runner, dydx, paper) = (&args, &config, &runner, &*dydx, paper.as_deref());
    cycle_loop(Duration::from_secs(interval_secs), &shutdown, move || {
        Box::pin(run_tick(args, config, runner, dydx, paper))
    })
    .await;

    info!("👋 Shutting down");
    Ok(())
}

/// Run `tick` on every interval until shutdown is requested.
///
/// A tick in progress always completes; shutdown is only observed between ticks.
async fn cycle_loop<'a, F>(period: Duration, shutdown: &AtomicBool, mut tick: F)
where
    F: FnMut() -> LocalBoxFuture<'a, ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while !shutdown.load(Ordering::SeqCst) {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_for_shutdown(shutdown) => break,
        }
        tick().await;
    }
}

/// One interval tick: reload signals, refresh paper prices, run a cycle.
async fn run_tick(
    args: &RunArgs,
    config: &Config,
    runner: &CycleRunner,
    dydx: &DydxClient,
    paper: Option<&MockDydxClient>,
) {
    // Signals are re-read every tick so the file can change between cycles.
    let raw = match load_signals(&args.signals, args.signals_file.as_deref(), config) {
        Ok(raw) => raw,
        Err(e) => {
            error!(error = %e, "Failed to load signals, skipping this cycle");
            return;
        }
    };

    if let Some(mock) = paper {
        refresh_paper_prices(dydx, mock, &config.trading.supported_tickers).await;
    }
    let report = runner.run_cycle(&raw).await;
    log_report(&report);
    if let Some(mock) = paper {
        log_paper_state(mock).await;
    }
}

async fn wait_for_shutdown(shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Resolve the raw signals for a cycle.
///
/// Precedence: command-line signals, then the signals file, then config.
fn load_signals(cli: &[String], file: Option<&Path>, config: &Config) -> Result<Vec<String>> {
    if !cli.is_empty() {
        return Ok(cli.to_vec());
    }

    if let Some(path) = file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read signals file {}", path.display()))?;
        return Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect());
    }

    Ok(config.signals.clone())
}

/// Copy live oracle prices into the paper exchange.
///
/// Tickers the indexer cannot price become unavailable on the paper side.
async fn refresh_paper_prices(dydx: &DydxClient, paper: &MockDydxClient, tickers: &[String]) {
    let lookups = tickers
        .iter()
        .map(|ticker| async move { (ticker, dydx.get_price(ticker).await) });

    let mut prices = HashMap::new();
    for (ticker, result) in join_all(lookups).await {
        match result {
            Ok(Some(price)) => {
                prices.insert(ticker.clone(), price);
            }
            Ok(None) => warn!(%ticker, "Live price unavailable"),
            Err(e) => warn!(%ticker, error = %e, "Failed to fetch live price"),
        }
    }

    if prices.is_empty() {
        warn!("No live prices fetched, paper exchange keeps previous prices");
        return;
    }

    info!(count = prices.len(), "Paper prices refreshed from indexer");
    paper.update_market_data(prices).await;
}

/// Initialize logging to stdout and a daily rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", "signal-rebalancer.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("dydx_signal_rebalancer=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Indexer: {}", config.dydx.indexer_url);
    info!("   Main Subaccount: {}", config.dydx.main_subaccount);
    info!(
        "   Supported Tickers: {}",
        config.trading.supported_tickers.join(", ")
    );
    info!("   Default Leverage: {}x", config.trading.default_leverage);
    let mut overrides: Vec<_> = config.trading.leverage.iter().collect();
    overrides.sort();
    for (ticker, leverage) in overrides {
        info!("   Leverage {}: {}x", ticker, leverage);
    }
    info!(
        "   Isolated Subaccounts From: {}",
        config.trading.isolated_subaccount_start
    );
    info!(
        "   Call Timeout: {}s",
        config.execution.call_timeout_secs
    );
}

/// Log the per-item outcome of a finished cycle.
fn log_report(report: &CycleReport) {
    for rejection in &report.rejections {
        warn!("   ✗ '{}' rejected: {}", rejection.raw, rejection.reason);
    }

    for phase in [&report.close_phase, &report.open_phase].into_iter().flatten() {
        if let Some(reason) = &phase.aborted {
            error!("   ⚠️  {} phase aborted: {}", phase.phase, reason);
        }
        for item in &phase.items {
            match &item.outcome {
                ItemOutcome::Submitted(ack) => {
                    info!("   ✓ [{}] {} submitted ({})", phase.phase, item.ticker, ack.tx_reference)
                }
                ItemOutcome::Skipped(reason) => {
                    info!("   - [{}] {} skipped: {}", phase.phase, item.ticker, reason)
                }
                ItemOutcome::Failed(reason) => {
                    error!("   ✗ [{}] {} failed: {}", phase.phase, item.ticker, reason)
                }
            }
        }
    }
}

async fn log_paper_state(paper: &MockDydxClient) {
    let state = paper.get_state().await;
    info!(
        "📊 Paper account: balance ${:.2} | fees ${:.4} | positions {}",
        state.balance,
        state.total_trading_fees,
        state.positions.len()
    );
    for ((subaccount, market), position) in &state.positions {
        info!(
            "   ├─ #{} {} qty {} @ {}",
            subaccount, market, position.qty, position.entry_price
        );
    }
}

/// Parse signals and print each decision.
fn parse_only(signals: &[String], signals_file: Option<&Path>) -> Result<()> {
    let config = Config::load()?;
    config.validate()?;

    let raw = load_signals(signals, signals_file, &config)?;
    let parser = SignalParser::new(
        &config.trading.supported_tickers,
        ActionVocabulary::new(
            config
                .trading
                .action_vocabulary
                .iter()
                .map(|(word, action)| (word, *action)),
        ),
    );

    println!("📥 {} raw signal(s)", raw.len());
    for line in &raw {
        match parser.parse(line) {
            Ok(signal) => println!("   ✓ {:<24} -> {}", format!("'{}'", line), signal),
            Err(reason) => println!("   ✗ {:<24} -> {}", format!("'{}'", line), reason),
        }
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let config = Config::load()?;
    println!("{:#?}", config);
    match config.validate() {
        Ok(()) => println!("\n✓ Configuration is valid"),
        Err(e) => println!("\n✗ Configuration is invalid: {}", e),
    }
    Ok(())
}
