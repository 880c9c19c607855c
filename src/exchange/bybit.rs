use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::config::Config;
use crate::types::{normalize_symbol, SymbolPair, Trade};

use super::{
    forward_trade, parse_price, parse_quantity, pong_channel, post_pong, AdapterError,
    ExchangeAdapter, ExchangeSession, WsStream,
};

const VENUE: &str = "Bybit";

/// Bybit spot public-trade shim.
///
/// Fixed dial URL; the subscription is an application-level
/// `{"op":"subscribe","args":["publicTrade.BTCUSDT", ...]}` frame sent after
/// the dial. Liveness is an application-level `{"op":"ping"}` exchange.
pub struct BybitAdapter {
    config: Arc<Config>,
    trades: tokio::sync::mpsc::Sender<Trade>,
    sink: Option<SplitSink<WsStream, Message>>,
    pongs: Option<tokio::sync::mpsc::Sender<std::time::Instant>>,
}

/// Trade push, e.g.
/// `{"topic":"publicTrade.BTCUSDT","data":[{"s":"BTCUSDT","p":"...","v":"...","T":...}]}`.
#[derive(Debug, Deserialize)]
struct TradeFrame {
    data: Vec<TradeData>,
}

#[derive(Debug, Deserialize)]
struct TradeData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "v")]
    quantity: String,
    #[serde(rename = "T")]
    time_ms: i64,
}

impl BybitAdapter {
    pub fn new(config: Arc<Config>, trades: tokio::sync::mpsc::Sender<Trade>) -> Self {
        Self {
            config,
            trades,
            sink: None,
            pongs: None,
        }
    }

    /// `publicTrade.BTCUSDT`-style topics for the subscribe frame.
    fn subscribe_args(symbols: &[SymbolPair]) -> Vec<String> {
        symbols
            .iter()
            .map(|pair| {
                format!(
                    "publicTrade.{}{}",
                    pair.base().to_uppercase(),
                    pair.quote().to_uppercase()
                )
            })
            .collect()
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), AdapterError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| AdapterError::Parse(e.to_string()))?;

        // Liveness responses echo an `op` field; subscription acks carry
        // `success`. Neither contains trade data.
        if let Some(op) = value.get("op").and_then(|v| v.as_str()) {
            if op == "ping" || op == "pong" {
                post_pong(&self.pongs);
            } else {
                debug!(venue = VENUE, op, "ignoring control frame");
            }
            return Ok(());
        }
        if value.get("success").is_some() {
            debug!(venue = VENUE, "subscription acknowledged");
            return Ok(());
        }

        let frame: TradeFrame =
            serde_json::from_value(value).map_err(|e| AdapterError::Parse(e.to_string()))?;

        for data in frame.data {
            let (Some(price), Some(quantity)) = (
                parse_price(VENUE, &data.price),
                parse_quantity(VENUE, &data.quantity),
            ) else {
                continue;
            };

            let delivered = forward_trade(
                &self.trades,
                Trade {
                    symbol: normalize_symbol(&data.symbol),
                    price,
                    quantity,
                    timestamp_ms: data.time_ms,
                    source: VENUE,
                },
            )
            .await;
            if !delivered {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn name(&self) -> &'static str {
        VENUE
    }

    async fn connect_and_subscribe(
        &mut self,
        symbols: &[SymbolPair],
    ) -> Result<ExchangeSession, AdapterError> {
        let url = format!("wss://{}/v5/public/spot", self.config.bybit_address);
        info!(venue = VENUE, url = %url, "connecting");

        let (ws, _response) = connect_async(&url).await.map_err(AdapterError::Connect)?;
        let (mut sink, stream) = ws.split();

        let subscribe = json!({
            "op": "subscribe",
            "args": Self::subscribe_args(symbols),
        });
        sink.send(Message::Text(subscribe.to_string()))
            .await
            .map_err(AdapterError::Subscribe)?;
        self.sink = Some(sink);

        let (pong_tx, pong_rx) = pong_channel();
        self.pongs = Some(pong_tx);

        Ok(ExchangeSession {
            frames: Box::pin(stream),
            pongs: pong_rx,
        })
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), AdapterError> {
        match message {
            Message::Text(text) => self.handle_text(&text).await,
            other => {
                debug!(venue = VENUE, frame = ?other, "ignoring non-text frame");
                Ok(())
            }
        }
    }

    async fn ping(&mut self) -> Result<(), AdapterError> {
        let sink = self.sink.as_mut().ok_or(AdapterError::NotConnected)?;
        sink.send(Message::Text(json!({"op": "ping"}).to_string()))
            .await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            let close = sink.send(Message::Close(None));
            let _ = tokio::time::timeout(Duration::from_secs(1), close).await;
        }
        self.pongs = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn adapter_with_channel() -> (BybitAdapter, mpsc::Receiver<Trade>) {
        let (tx, rx) = mpsc::channel(8);
        (BybitAdapter::new(Arc::new(Config::default()), tx), rx)
    }

    #[test]
    fn subscribe_args_use_uppercase_concatenation() {
        let symbols = vec![
            SymbolPair::parse("btc-usdt").unwrap(),
            SymbolPair::parse("eth-usdt").unwrap(),
        ];
        assert_eq!(
            BybitAdapter::subscribe_args(&symbols),
            vec!["publicTrade.BTCUSDT", "publicTrade.ETHUSDT"]
        );
    }

    #[tokio::test]
    async fn parses_public_trade_batch() {
        let (mut adapter, mut rx) = adapter_with_channel();
        let frame = r#"{
            "topic": "publicTrade.BTCUSDT",
            "data": [
                { "s": "BTCUSDT", "p": "50000.00", "v": "0.1", "T": 1753453611045 },
                { "s": "BTCUSDT", "p": "50001.00", "v": "0.2", "T": 1753453611046 }
            ]
        }"#;

        adapter
            .handle_message(Message::Text(frame.to_string()))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.symbol, "btcusdt");
        assert_eq!(first.source, "Bybit");
        assert!((first.price - 50000.0).abs() < f64::EPSILON);
        assert!((second.price - 50001.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn op_frames_signal_liveness() {
        let (mut adapter, _rx) = adapter_with_channel();
        let (pong_tx, mut pong_rx) = pong_channel();
        adapter.pongs = Some(pong_tx);

        adapter
            .handle_message(Message::Text(r#"{"op":"pong"}"#.to_string()))
            .await
            .unwrap();
        assert!(pong_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn subscription_ack_is_ignored() {
        let (mut adapter, mut rx) = adapter_with_channel();
        adapter
            .handle_message(Message::Text(
                r#"{"success":true,"op":"subscribe","conn_id":"abc"}"#.to_string(),
            ))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bad_quantity_skips_only_that_trade() {
        let (mut adapter, mut rx) = adapter_with_channel();
        let frame = r#"{
            "data": [
                { "s": "BTCUSDT", "p": "100", "v": "oops", "T": 1 },
                { "s": "BTCUSDT", "p": "101", "v": "1.0", "T": 2 }
            ]
        }"#;

        adapter
            .handle_message(Message::Text(frame.to_string()))
            .await
            .unwrap();

        let trade = rx.recv().await.unwrap();
        assert!((trade.price - 101.0).abs() < f64::EPSILON);
        assert!(rx.try_recv().is_err());
    }
}
