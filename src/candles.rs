// =============================================================================
// CandleBuilder -- time-bucketed aggregation of the unified trade stream
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant as TokioInstant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::types::Trade;

/// One OHLCV bar covering a single emission interval for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candle {
    pub symbol: String,
    /// Emit-time wall clock, seconds since the Unix epoch.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Fold a non-empty, arrival-ordered trade snapshot into a candle.
///
/// `open` and `close` come from the first and last trade, `high`/`low` are
/// the price extrema, `volume` is the quantity sum.
pub fn candle_from_trades(symbol: &str, trades: &[Trade]) -> Option<Candle> {
    let first = trades.first()?;
    let last = trades.last()?;

    let mut high = first.price;
    let mut low = first.price;
    let mut volume = 0.0;
    for trade in trades {
        high = high.max(trade.price);
        low = low.min(trade.price);
        volume += trade.quantity;
    }

    Some(Candle {
        symbol: symbol.to_string(),
        timestamp: Utc::now().timestamp(),
        open: first.price,
        high,
        low,
        close: last.price,
        volume,
    })
}

/// Consumes the unified trade channel and emits one candle per symbol per
/// interval tick, covering exactly the trades that arrived in that interval.
pub struct CandleBuilder {
    interval: Duration,
    max_trades_per_interval: usize,
}

impl CandleBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            interval: Duration::from_millis(config.candle_interval_ms.max(1)),
            max_trades_per_interval: config.max_trades_per_interval.max(1),
        }
    }

    /// Run until the token cancels, the trade channel closes, or the candle
    /// channel's consumer goes away. The builder itself never fails: bursts
    /// that would overflow the buffer lose their tail trades instead of
    /// stalling the pipeline.
    pub async fn run(
        self,
        token: CancellationToken,
        mut trades: mpsc::Receiver<Trade>,
        candles: mpsc::Sender<Candle>,
    ) {
        let mut ticker = interval_at(TokioInstant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Per-symbol buffers in arrival order, plus the total across all
        // symbols that the drop threshold applies to.
        let mut buffers: HashMap<String, Vec<Trade>> = HashMap::new();
        let mut buffered: usize = 0;
        let mut dropped: u64 = 0;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("candle builder cancelled");
                    return;
                }

                received = trades.recv() => {
                    let Some(trade) = received else {
                        debug!("trade channel closed, candle builder exiting");
                        return;
                    };
                    if buffered >= self.max_trades_per_interval {
                        dropped += 1;
                        if dropped.is_power_of_two() {
                            warn!(
                                max = self.max_trades_per_interval,
                                dropped,
                                "trade buffer full, dropping trades"
                            );
                        }
                        continue;
                    }
                    buffers.entry(trade.symbol.clone()).or_default().push(trade);
                    buffered += 1;
                }

                _ = ticker.tick() => {
                    if dropped > 0 {
                        info!(dropped, "trades dropped during the last interval");
                        dropped = 0;
                    }
                    for (symbol, buffer) in buffers.iter_mut() {
                        if buffer.is_empty() {
                            continue;
                        }
                        let snapshot = std::mem::take(buffer);
                        buffered -= snapshot.len();

                        let Some(candle) = candle_from_trades(symbol, &snapshot) else {
                            continue;
                        };
                        if candles.send(candle).await.is_err() {
                            debug!("candle channel closed, candle builder exiting");
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(symbol: &str, price: f64, quantity: f64) -> Trade {
        Trade {
            symbol: symbol.to_string(),
            price,
            quantity,
            timestamp_ms: 1_700_000_000_000,
            source: "test",
        }
    }

    fn config_with(interval_ms: u64, max_trades: usize) -> Config {
        Config {
            candle_interval_ms: interval_ms,
            max_trades_per_interval: max_trades,
            ..Config::default()
        }
    }

    #[test]
    fn single_bucket_ohlcv_law() {
        let trades = vec![
            trade("btcusdt", 100.0, 1.0),
            trade("btcusdt", 110.0, 2.0),
            trade("btcusdt", 105.0, 0.5),
        ];
        let candle = candle_from_trades("btcusdt", &trades).unwrap();
        assert_eq!(candle.symbol, "btcusdt");
        assert!((candle.open - 100.0).abs() < f64::EPSILON);
        assert!((candle.high - 110.0).abs() < f64::EPSILON);
        assert!((candle.low - 100.0).abs() < f64::EPSILON);
        assert!((candle.close - 105.0).abs() < f64::EPSILON);
        assert!((candle.volume - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn single_trade_collapses_ohlc() {
        let trades = vec![trade("ethusdt", 2000.0, 0.5)];
        let candle = candle_from_trades("ethusdt", &trades).unwrap();
        assert!((candle.open - 2000.0).abs() < f64::EPSILON);
        assert!((candle.high - 2000.0).abs() < f64::EPSILON);
        assert!((candle.low - 2000.0).abs() < f64::EPSILON);
        assert!((candle.close - 2000.0).abs() < f64::EPSILON);
        assert!((candle.volume - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn candle_invariants_hold() {
        let trades = vec![
            trade("btcusdt", 104.0, 1.0),
            trade("btcusdt", 99.0, 0.0),
            trade("btcusdt", 107.5, 2.5),
        ];
        let candle = candle_from_trades("btcusdt", &trades).unwrap();
        assert!(candle.low <= candle.open && candle.open <= candle.high);
        assert!(candle.low <= candle.close && candle.close <= candle.high);
        assert!(candle.volume >= 0.0);
    }

    #[test]
    fn empty_snapshot_yields_no_candle() {
        assert!(candle_from_trades("btcusdt", &[]).is_none());
    }

    #[tokio::test]
    async fn emits_one_candle_per_symbol_per_tick() {
        let (trade_tx, trade_rx) = mpsc::channel(16);
        let (candle_tx, mut candle_rx) = mpsc::channel(4);
        let token = CancellationToken::new();

        let builder = CandleBuilder::new(&config_with(50, 1000));
        let task = tokio::spawn(builder.run(token.clone(), trade_rx, candle_tx));

        trade_tx.send(trade("btcusdt", 100.0, 1.0)).await.unwrap();
        trade_tx.send(trade("ethusdt", 2000.0, 0.5)).await.unwrap();
        trade_tx.send(trade("btcusdt", 101.0, 1.0)).await.unwrap();

        let first = candle_rx.recv().await.unwrap();
        let second = candle_rx.recv().await.unwrap();
        let mut by_symbol = HashMap::new();
        by_symbol.insert(first.symbol.clone(), first);
        by_symbol.insert(second.symbol.clone(), second);

        let btc = &by_symbol["btcusdt"];
        assert!((btc.open - 100.0).abs() < f64::EPSILON);
        assert!((btc.close - 101.0).abs() < f64::EPSILON);
        assert!((btc.volume - 2.0).abs() < f64::EPSILON);

        let eth = &by_symbol["ethusdt"];
        assert!((eth.open - 2000.0).abs() < f64::EPSILON);
        assert!((eth.volume - 0.5).abs() < f64::EPSILON);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn empty_interval_emits_nothing() {
        let (_trade_tx, trade_rx) = mpsc::channel::<Trade>(4);
        let (candle_tx, mut candle_rx) = mpsc::channel(4);
        let token = CancellationToken::new();

        let builder = CandleBuilder::new(&config_with(30, 1000));
        let task = tokio::spawn(builder.run(token.clone(), trade_rx, candle_tx));

        // Let several ticks pass with no trades.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(candle_rx.try_recv().is_err());

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn drops_trades_beyond_the_interval_ceiling() {
        let (trade_tx, trade_rx) = mpsc::channel(16);
        let (candle_tx, mut candle_rx) = mpsc::channel(4);
        let token = CancellationToken::new();

        // Ceiling of two buffered trades; the overflow trades must vanish
        // from the emitted candle instead of stalling the pipeline.
        let builder = CandleBuilder::new(&config_with(100, 2));
        let task = tokio::spawn(builder.run(token.clone(), trade_rx, candle_tx));

        trade_tx.send(trade("btcusdt", 100.0, 1.0)).await.unwrap();
        trade_tx.send(trade("btcusdt", 101.0, 1.0)).await.unwrap();
        trade_tx.send(trade("btcusdt", 999.0, 9.0)).await.unwrap();
        trade_tx.send(trade("btcusdt", 998.0, 9.0)).await.unwrap();

        let candle = candle_rx.recv().await.unwrap();
        assert!((candle.open - 100.0).abs() < f64::EPSILON);
        assert!((candle.close - 101.0).abs() < f64::EPSILON);
        assert!((candle.high - 101.0).abs() < f64::EPSILON);
        assert!((candle.volume - 2.0).abs() < f64::EPSILON);

        token.cancel();
        task.await.unwrap();
    }
}
