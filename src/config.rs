// =============================================================================
// Service configuration, read once from the environment at startup
// =============================================================================
//
// Every knob lives here so that operators tune the service entirely through
// environment variables (a `.env` file is honoured via dotenv in main).
// Unset or malformed values fall back to the documented default with a
// logged warning; the loaded config is immutable afterwards.
// =============================================================================

use std::fmt::Display;
use std::str::FromStr;

use tracing::warn;

/// Immutable runtime configuration for the candle streaming service.
#[derive(Debug, Clone)]
pub struct Config {
    /// gRPC listening port.
    pub server_port: u16,

    /// Dial attempts per venue before the streamer goes Terminal.
    pub ws_connection_max_retries: u32,

    /// Idle threshold in milliseconds before the liveness prober pings.
    pub ws_connection_timeout_ms: u64,

    /// Capacity of the shared trade channel feeding the candle builder.
    pub trade_stream_buffer_size: usize,

    /// Ceiling on buffered trades per interval; excess trades are dropped.
    pub max_trades_per_interval: usize,

    /// Candle emission period in milliseconds.
    pub candle_interval_ms: u64,

    pub binance_address: String,
    pub binance_port: u16,
    pub bybit_address: String,
    pub okx_address: String,
    pub okx_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 8080,
            ws_connection_max_retries: 5,
            ws_connection_timeout_ms: 5000,
            trade_stream_buffer_size: 1000,
            max_trades_per_interval: 10_000,
            candle_interval_ms: 1000,
            binance_address: "stream.binance.com".to_string(),
            binance_port: 9443,
            bybit_address: "stream.bybit.com".to_string(),
            okx_address: "ws.okx.com".to_string(),
            okx_port: 8443,
        }
    }
}

impl Config {
    /// Load the configuration from the process environment, filling defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_port: env_or("SERVER_PORT", defaults.server_port),
            ws_connection_max_retries: env_or(
                "WS_CONNECTION_MAX_RETRIES",
                defaults.ws_connection_max_retries,
            ),
            ws_connection_timeout_ms: env_or(
                "WS_CONNECTION_TIMEOUT",
                defaults.ws_connection_timeout_ms,
            ),
            trade_stream_buffer_size: env_or(
                "TRADE_STREAM_BUFFER_SIZE",
                defaults.trade_stream_buffer_size,
            ),
            max_trades_per_interval: env_or(
                "MAX_TRADES_PER_INTERVAL",
                defaults.max_trades_per_interval,
            ),
            candle_interval_ms: env_or("CANDLE_INTERVAL_MS", defaults.candle_interval_ms),
            binance_address: env_or("BINANCE_ADDRESS", defaults.binance_address),
            binance_port: env_or("BINANCE_PORT", defaults.binance_port),
            bybit_address: env_or("BYBIT_ADDRESS", defaults.bybit_address),
            okx_address: env_or("OKX_ADDRESS", defaults.okx_address),
            okx_port: env_or("OKX_PORT", defaults.okx_port),
        }
    }
}

/// Read `key` from the environment and parse it, falling back to `default`
/// when the variable is absent or malformed.
fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default = %default, "unparseable env var, using default");
                default
            }
        },
        Err(_) => default,
    }
}
