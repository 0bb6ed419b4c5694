//! Trading signal parsing and validation.
//!
//! A raw signal is a two-token line `<TICKER> <ACTION>`, case-insensitive.
//! Action words come from an injectable vocabulary table so the bot can be
//! fed signals in any language.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

/// What a signal asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Close,
}

impl SignalAction {
    /// Buy and sell signals may open new positions.
    pub fn opens_position(self) -> bool {
        matches!(self, SignalAction::Buy | SignalAction::Sell)
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalAction::Buy => write!(f, "BUY"),
            SignalAction::Sell => write!(f, "SELL"),
            SignalAction::Close => write!(f, "CLOSE"),
        }
    }
}

/// A validated trading signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signal {
    pub ticker: String,
    pub action: SignalAction,
}

impl Signal {
    pub fn new(ticker: impl Into<String>, action: SignalAction) -> Self {
        Self {
            ticker: ticker.into(),
            action,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.ticker, self.action)
    }
}

/// Why a raw signal was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseRejection {
    #[error("empty signal")]
    Empty,
    #[error("expected 2 tokens, found {0}")]
    Malformed(usize),
    #[error("unsupported ticker {0}")]
    UnsupportedTicker(String),
    #[error("unknown action {0}")]
    UnknownAction(String),
}

/// A rejected raw signal together with its reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub raw: String,
    pub reason: ParseRejection,
}

/// Mapping from action words to actions.
#[derive(Debug, Clone)]
pub struct ActionVocabulary(HashMap<String, SignalAction>);

impl ActionVocabulary {
    /// Build a vocabulary; words are matched upper-case.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, SignalAction)>,
        S: AsRef<str>,
    {
        Self(
            entries
                .into_iter()
                .map(|(word, action)| (word.as_ref().trim().to_uppercase(), action))
                .collect(),
        )
    }

    pub fn lookup(&self, word: &str) -> Option<SignalAction> {
        self.0.get(word).copied()
    }
}

impl Default for ActionVocabulary {
    fn default() -> Self {
        Self::new([
            ("COMPRAR", SignalAction::Buy),
            ("VENDER", SignalAction::Sell),
            ("FECHAR", SignalAction::Close),
        ])
    }
}

/// Result of parsing a batch of raw signals.
#[derive(Debug, Clone, Default)]
pub struct ParsedBatch {
    /// Accepted signals, in input order
    pub signals: Vec<Signal>,
    /// Rejected inputs, in input order
    pub rejections: Vec<Rejection>,
}

/// Converts raw signal lines into validated [`Signal`]s.
#[derive(Debug, Clone)]
pub struct SignalParser {
    supported_tickers: HashSet<String>,
    vocabulary: ActionVocabulary,
}

impl SignalParser {
    pub fn new<I, S>(supported_tickers: I, vocabulary: ActionVocabulary) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            supported_tickers: supported_tickers
                .into_iter()
                .map(|t| t.as_ref().trim().to_uppercase())
                .collect(),
            vocabulary,
        }
    }

    /// Parse one raw line. Pure: no logging, no I/O.
    ///
    /// The ticker is checked before the action.
    pub fn parse(&self, raw: &str) -> Result<Signal, ParseRejection> {
        let normalized = raw.trim().to_uppercase();
        let tokens: Vec<&str> = normalized.split_whitespace().collect();

        let (ticker, action_word) = match tokens.as_slice() {
            [] => return Err(ParseRejection::Empty),
            [ticker, action] => (*ticker, *action),
            other => return Err(ParseRejection::Malformed(other.len())),
        };

        if !self.supported_tickers.contains(ticker) {
            return Err(ParseRejection::UnsupportedTicker(ticker.to_string()));
        }

        let action = self
            .vocabulary
            .lookup(action_word)
            .ok_or_else(|| ParseRejection::UnknownAction(action_word.to_string()))?;

        Ok(Signal::new(ticker, action))
    }

    /// Parse a batch, preserving input order and reporting each decision.
    pub fn parse_batch<S: AsRef<str>>(&self, raw_signals: &[S]) -> ParsedBatch {
        let mut batch = ParsedBatch::default();

        for raw in raw_signals {
            let raw = raw.as_ref();
            match self.parse(raw) {
                Ok(signal) => {
                    info!(raw, %signal, "Signal accepted");
                    batch.signals.push(signal);
                }
                Err(reason) => {
                    warn!(raw, %reason, "Signal rejected");
                    batch.rejections.push(Rejection {
                        raw: raw.to_string(),
                        reason,
                    });
                }
            }
        }

        batch
    }
}
