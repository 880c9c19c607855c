use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::config::Config;
use crate::types::{normalize_symbol, SymbolPair, Trade};

use super::{
    forward_trade, parse_price, parse_quantity, pong_channel, post_pong, AdapterError,
    ExchangeAdapter, ExchangeSession, WsStream,
};

const VENUE: &str = "Binance";

/// Binance trade-stream shim.
///
/// Subscription is encoded entirely in the dial URL (`/stream?streams=...`),
/// so there is no post-dial handshake. Liveness rides on transport-level
/// ping/pong frames.
pub struct BinanceAdapter {
    config: Arc<Config>,
    trades: tokio::sync::mpsc::Sender<Trade>,
    sink: Option<SplitSink<WsStream, Message>>,
    pongs: Option<tokio::sync::mpsc::Sender<std::time::Instant>>,
}

/// Combined-stream envelope, e.g.
/// `{"stream":"btcusdt@trade","data":{"s":"BTCUSDT","p":"...","q":"...","T":...}}`.
#[derive(Debug, Deserialize)]
struct TradeFrame {
    data: TradeData,
}

#[derive(Debug, Deserialize)]
struct TradeData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    time_ms: i64,
}

impl BinanceAdapter {
    pub fn new(config: Arc<Config>, trades: tokio::sync::mpsc::Sender<Trade>) -> Self {
        Self {
            config,
            trades,
            sink: None,
            pongs: None,
        }
    }

    /// `btcusdt@trade/ethusdt@trade/...` for the `streams=` query parameter.
    fn streams_query(symbols: &[SymbolPair]) -> String {
        symbols
            .iter()
            .map(|pair| format!("{}@trade", pair.joined()))
            .collect::<Vec<_>>()
            .join("/")
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), AdapterError> {
        let frame: TradeFrame =
            serde_json::from_str(text).map_err(|e| AdapterError::Parse(e.to_string()))?;

        let data = frame.data;
        let (Some(price), Some(quantity)) = (
            parse_price(VENUE, &data.price),
            parse_quantity(VENUE, &data.quantity),
        ) else {
            return Ok(());
        };

        forward_trade(
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
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        VENUE
    }

    async fn connect_and_subscribe(
        &mut self,
        symbols: &[SymbolPair],
    ) -> Result<ExchangeSession, AdapterError> {
        let url = format!(
            "wss://{}:{}/stream?streams={}",
            self.config.binance_address,
            self.config.binance_port,
            Self::streams_query(symbols),
        );
        info!(venue = VENUE, url = %url, "connecting");

        let (ws, _response) = connect_async(&url).await.map_err(AdapterError::Connect)?;
        let (sink, stream) = ws.split();
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
            Message::Pong(_) => {
                post_pong(&self.pongs);
                Ok(())
            }
            other => {
                debug!(venue = VENUE, frame = ?other, "ignoring non-trade frame");
                Ok(())
            }
        }
    }

    async fn ping(&mut self) -> Result<(), AdapterError> {
        let sink = self.sink.as_mut().ok_or(AdapterError::NotConnected)?;
        sink.send(Message::Ping(Vec::new())).await?;
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

    fn adapter_with_channel() -> (BinanceAdapter, mpsc::Receiver<Trade>) {
        let (tx, rx) = mpsc::channel(8);
        (BinanceAdapter::new(Arc::new(Config::default()), tx), rx)
    }

    #[test]
    fn streams_query_joins_pairs() {
        let symbols = vec![
            SymbolPair::parse("btc-usdt").unwrap(),
            SymbolPair::parse("eth-usdt").unwrap(),
        ];
        assert_eq!(
            BinanceAdapter::streams_query(&symbols),
            "btcusdt@trade/ethusdt@trade"
        );
    }

    #[tokio::test]
    async fn parses_combined_stream_trade() {
        let (mut adapter, mut rx) = adapter_with_channel();
        let frame = r#"{
            "stream": "btcusdt@trade",
            "data": { "e": "trade", "s": "BTCUSDT", "p": "37000.50", "q": "0.123", "T": 1700000000000 }
        }"#;

        adapter
            .handle_message(Message::Text(frame.to_string()))
            .await
            .unwrap();

        let trade = rx.recv().await.unwrap();
        assert_eq!(trade.symbol, "btcusdt");
        assert!((trade.price - 37000.50).abs() < f64::EPSILON);
        assert!((trade.quantity - 0.123).abs() < f64::EPSILON);
        assert_eq!(trade.timestamp_ms, 1_700_000_000_000);
        assert_eq!(trade.source, "Binance");
    }

    #[tokio::test]
    async fn unparseable_price_drops_trade_but_keeps_session() {
        let (mut adapter, mut rx) = adapter_with_channel();
        let frame = r#"{"stream":"x","data":{"s":"BTCUSDT","p":"bogus","q":"1","T":1}}"#;

        adapter
            .handle_message(Message::Text(frame.to_string()))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_json_is_a_parse_error() {
        let (mut adapter, _rx) = adapter_with_channel();
        let result = adapter
            .handle_message(Message::Text("not json".to_string()))
            .await;
        assert!(matches!(result, Err(AdapterError::Parse(_))));
    }

    #[tokio::test]
    async fn transport_pong_posts_liveness_signal() {
        let (mut adapter, _rx) = adapter_with_channel();
        let (pong_tx, mut pong_rx) = pong_channel();
        adapter.pongs = Some(pong_tx);

        adapter.handle_message(Message::Pong(Vec::new())).await.unwrap();
        assert!(pong_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn ping_without_session_is_not_connected() {
        let (mut adapter, _rx) = adapter_with_channel();
        assert!(matches!(
            adapter.ping().await,
            Err(AdapterError::NotConnected)
        ));
    }
}
