//! Configuration management for the signal rebalancer.
//!
//! Loads settings from environment variables and config files once at
//! startup. The resulting [`Config`] is immutable for the process lifetime.

use crate::strategy::SignalAction;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// dYdX account, credentials and endpoints
    #[serde(default)]
    pub dydx: DydxConfig,
    /// Ticker universe, leverage and subaccount settings
    #[serde(default)]
    pub trading: TradingConfig,
    /// Timeouts and scheduling
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Default signal feed, used when none is given on the command line
    #[serde(default = "default_signals")]
    pub signals: Vec<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DydxConfig {
    /// Account address (dydx1...)
    #[serde(default)]
    pub address: String,
    /// Secret used to sign order submissions
    #[serde(default)]
    pub signing_key: String,
    /// Indexer REST endpoint
    #[serde(default = "default_indexer_url")]
    pub indexer_url: String,
    /// Order broadcaster endpoint
    #[serde(default)]
    pub broker_url: String,
    /// Cross-margin subaccount holding the quote balance
    #[serde(default)]
    pub main_subaccount: u32,
}

impl fmt::Debug for DydxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DydxConfig")
            .field("address", &self.address)
            .field("signing_key", &redact(&self.signing_key))
            .field("indexer_url", &self.indexer_url)
            .field("broker_url", &self.broker_url)
            .field("main_subaccount", &self.main_subaccount)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Tickers accepted by the signal parser
    #[serde(default = "default_supported_tickers")]
    pub supported_tickers: Vec<String>,
    /// Per-ticker leverage overrides
    #[serde(default = "default_leverage_overrides")]
    pub leverage: HashMap<String, Decimal>,
    /// Leverage for tickers without an override
    #[serde(default = "default_leverage")]
    pub default_leverage: Decimal,
    /// First subaccount number used for isolated positions
    #[serde(default = "default_isolated_subaccount_start")]
    pub isolated_subaccount_start: u32,
    /// Action words accepted in signals (e.g. COMPRAR -> BUY)
    #[serde(default = "default_action_vocabulary")]
    pub action_vocabulary: HashMap<String, SignalAction>,
}

impl TradingConfig {
    /// Leverage for a ticker, falling back to the default.
    ///
    /// Keys are matched case-insensitively since environment sources
    /// lowercase map keys.
    pub fn leverage_for(&self, ticker: &str) -> Decimal {
        self.leverage
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(ticker))
            .map(|(_, v)| *v)
            .unwrap_or(self.default_leverage)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound for every exchange call in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Seconds between cycles; `None` runs a single cycle
    #[serde(default)]
    pub cycle_interval_secs: Option<u64>,
    /// Blocks an IOC order stays valid for
    #[serde(default = "default_good_til_blocks")]
    pub good_til_blocks: u32,
}

impl ExecutionConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

// Default value functions
fn default_indexer_url() -> String {
    "https://indexer.dydx.trade".to_string()
}

fn default_supported_tickers() -> Vec<String> {
    ["BTC", "ETH", "SOL", "DOGE", "LINK"]
        .iter()
        .map(|t| t.to_string())
        .collect()
}

fn default_leverage_overrides() -> HashMap<String, Decimal> {
    HashMap::from([("BTC".to_string(), Decimal::new(3, 0))])
}

fn default_leverage() -> Decimal {
    Decimal::ONE
}

fn default_isolated_subaccount_start() -> u32 {
    1
}

fn default_action_vocabulary() -> HashMap<String, SignalAction> {
    HashMap::from([
        ("COMPRAR".to_string(), SignalAction::Buy),
        ("VENDER".to_string(), SignalAction::Sell),
        ("FECHAR".to_string(), SignalAction::Close),
    ])
}

fn default_call_timeout() -> u64 {
    10
}

fn default_good_til_blocks() -> u32 {
    20
}

fn default_signals() -> Vec<String> {
    [
        "BTC VENDER",
        "ETH FECHAR",
        "SOL COMPRAR",
        "DOGE FECHAR",
        "LINK COMPRAR",
        "XRP VOAR",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    /// Load configuration from environment variables and config files.
    ///
    /// `DYDX_ADDRESS` and `DYDX_PRIVATE_KEY` override the credential fields
    /// when set.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("DSR")
                    .list_separator(",")
                    .with_list_parse_key("trading.supported_tickers")
                    .with_list_parse_key("signals")
                    .try_parsing(true),
            )
            .set_override_option("dydx.address", std::env::var("DYDX_ADDRESS").ok())
            .context("Failed to apply DYDX_ADDRESS override")?
            .set_override_option("dydx.signing_key", std::env::var("DYDX_PRIVATE_KEY").ok())
            .context("Failed to apply DYDX_PRIVATE_KEY override")?
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.trading.supported_tickers.is_empty(),
            "supported_tickers must not be empty"
        );

        anyhow::ensure!(
            self.trading.default_leverage > Decimal::ZERO,
            "default_leverage must be positive"
        );

        if let Some((ticker, lev)) = self
            .trading
            .leverage
            .iter()
            .find(|(_, lev)| **lev <= Decimal::ZERO)
        {
            anyhow::bail!("leverage for {} must be positive, got {}", ticker, lev);
        }

        anyhow::ensure!(
            !self.trading.action_vocabulary.is_empty(),
            "action_vocabulary must not be empty"
        );

        anyhow::ensure!(
            self.execution.call_timeout_secs > 0,
            "call_timeout_secs must be positive"
        );

        anyhow::ensure!(
            self.execution.cycle_interval_secs != Some(0),
            "cycle_interval_secs must be positive when set"
        );

        Ok(())
    }

    /// Check the fields required to trade with real funds.
    ///
    /// Missing credentials are fatal at startup, never a per-cycle error.
    pub fn validate_credentials(&self) -> Result<()> {
        anyhow::ensure!(
            !self.dydx.address.is_empty() && !self.dydx.signing_key.is_empty(),
            "FATAL: DYDX_ADDRESS and DYDX_PRIVATE_KEY must be set for live trading"
        );

        anyhow::ensure!(
            !self.dydx.broker_url.is_empty(),
            "FATAL: dydx.broker_url must be set for live trading"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dydx: DydxConfig::default(),
            trading: TradingConfig::default(),
            execution: ExecutionConfig::default(),
            signals: default_signals(),
        }
    }
}

impl Default for DydxConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            signing_key: String::new(),
            indexer_url: default_indexer_url(),
            broker_url: String::new(),
            main_subaccount: 0,
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            supported_tickers: default_supported_tickers(),
            leverage: default_leverage_overrides(),
            default_leverage: default_leverage(),
            isolated_subaccount_start: default_isolated_subaccount_start(),
            action_vocabulary: default_action_vocabulary(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
            cycle_interval_secs: None,
            good_til_blocks: default_good_til_blocks(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_leverage_override_and_fallback() {
        let trading = TradingConfig::default();
        assert_eq!(trading.leverage_for("BTC"), dec!(3));
        assert_eq!(trading.leverage_for("ETH"), dec!(1));
    }

    #[test]
    fn test_leverage_lookup_ignores_key_case() {
        let mut trading = TradingConfig::default();
        trading.leverage = HashMap::from([("sol".to_string(), dec!(2.5))]);
        assert_eq!(trading.leverage_for("SOL"), dec!(2.5));
    }

    #[test]
    fn test_non_positive_leverage_rejected() {
        let mut config = Config::default();
        config.trading.leverage.insert("ETH".to_string(), Decimal::ZERO);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trading.default_leverage = dec!(-1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_ticker_set_rejected() {
        let mut config = Config::default();
        config.trading.supported_tickers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_credentials_are_fatal() {
        let config = Config::default();
        let err = config.validate_credentials().unwrap_err();
        assert!(err.to_string().contains("FATAL"));

        let mut config = Config::default();
        config.dydx.address = "dydx1abc".to_string();
        config.dydx.signing_key = "secret".to_string();
        assert!(config.validate_credentials().is_err());

        config.dydx.broker_url = "http://localhost:8700".to_string();
        assert!(config.validate_credentials().is_ok());
    }

    #[test]
    fn test_debug_output_redacts_signing_key() {
        let mut config = DydxConfig::default();
        config.signing_key = "super-secret".to_string();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
