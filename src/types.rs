// =============================================================================
// Shared types used across the candle streaming engine
// =============================================================================

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a request symbol cannot be parsed into a [`SymbolPair`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid symbol format: {0}")]
pub struct InvalidSymbol(pub String);

/// An ordered `(base, quote)` market identifier, e.g. `btc` / `usdt`.
///
/// Both fields are lowercased at construction so equality is effectively
/// case-insensitive and venue renderings can be derived without further
/// cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolPair {
    base: String,
    quote: String,
}

impl SymbolPair {
    /// Parse a request symbol of the form `base-quote` (any case).
    ///
    /// Rejects anything without exactly one `-` separator or with an empty
    /// field on either side.
    pub fn parse(raw: &str) -> Result<Self, InvalidSymbol> {
        let mut parts = raw.split('-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty() => Ok(Self {
                base: base.to_lowercase(),
                quote: quote.to_lowercase(),
            }),
            _ => Err(InvalidSymbol(raw.to_string())),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// The separator-free lowercase rendering used as the canonical trade
    /// symbol, e.g. `btcusdt`.
    pub fn joined(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl std::fmt::Display for SymbolPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

/// Canonicalize a venue-reported symbol: lowercase, venue separators
/// stripped, so `BTC-USDT`, `BTCUSDT`, and `btcusdt` all map to `btcusdt`.
pub fn normalize_symbol(raw: &str) -> String {
    raw.to_lowercase().replace('-', "")
}

/// A normalized tick observed on one venue.
///
/// Trades carry no identity; the same economic trade may arrive from several
/// venues and every copy counts toward the aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    /// Canonical lowercase symbol, e.g. `btcusdt`.
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    /// Venue wall clock, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Venue label, stable per adapter.
    pub source: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_symbol() {
        let pair = SymbolPair::parse("btc-usdt").unwrap();
        assert_eq!(pair.base(), "btc");
        assert_eq!(pair.quote(), "usdt");
        assert_eq!(pair.joined(), "btcusdt");
    }

    #[test]
    fn parse_is_case_insensitive() {
        let upper = SymbolPair::parse("BTC-USDT").unwrap();
        let lower = SymbolPair::parse("btc-usdt").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.to_string(), "btc-usdt");
    }

    #[test]
    fn parse_rejects_malformed_symbols() {
        for raw in ["btcusdt", "btc-usdt-perp", "-usdt", "btc-", "-", ""] {
            assert!(SymbolPair::parse(raw).is_err(), "expected rejection: {raw:?}");
        }
    }

    #[test]
    fn normalization_strips_separator_and_case() {
        assert_eq!(normalize_symbol("BTC-USDT"), "btcusdt");
        assert_eq!(normalize_symbol("BTCUSDT"), "btcusdt");
        assert_eq!(normalize_symbol("btcusdt"), "btcusdt");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["BTC-USDT", "EthUsdc", "sol-USD"] {
            let once = normalize_symbol(raw);
            assert_eq!(normalize_symbol(&once), once);
        }
    }
}
