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

const VENUE: &str = "Okx";

/// OKX public trades shim.
///
/// Fixed dial URL; subscription is `{"op":"subscribe","args":[{"channel":
/// "trades","instId":"BTC-USDT"}, ...]}`. Liveness is a plaintext `ping`
/// frame answered by a plaintext `pong`.
pub struct OkxAdapter {
    config: Arc<Config>,
    trades: tokio::sync::mpsc::Sender<Trade>,
    sink: Option<SplitSink<WsStream, Message>>,
    pongs: Option<tokio::sync::mpsc::Sender<std::time::Instant>>,
}

/// Trade push, e.g.
/// `{"arg":{"channel":"trades","instId":"BTC-USDT"},"data":[{"instId":"BTC-USDT","px":"...","sz":"...","ts":"..."}]}`.
#[derive(Debug, Deserialize)]
struct TradeFrame {
    data: Vec<TradeData>,
}

#[derive(Debug, Deserialize)]
struct TradeData {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "px")]
    price: String,
    #[serde(rename = "sz")]
    quantity: String,
    /// Milliseconds since epoch, string-encoded on the wire.
    #[serde(rename = "ts")]
    time_ms: String,
}

impl OkxAdapter {
    pub fn new(config: Arc<Config>, trades: tokio::sync::mpsc::Sender<Trade>) -> Self {
        Self {
            config,
            trades,
            sink: None,
            pongs: None,
        }
    }

    /// `{"channel":"trades","instId":"BTC-USDT"}`-style subscribe arguments.
    fn subscribe_args(symbols: &[SymbolPair]) -> Vec<serde_json::Value> {
        symbols
            .iter()
            .map(|pair| {
                json!({
                    "channel": "trades",
                    "instId": format!(
                        "{}-{}",
                        pair.base().to_uppercase(),
                        pair.quote().to_uppercase()
                    ),
                })
            })
            .collect()
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), AdapterError> {
        if text == "pong" {
            post_pong(&self.pongs);
            return Ok(());
        }

        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| AdapterError::Parse(e.to_string()))?;

        // Subscription acks and errors arrive as `{"event": ...}` frames.
        if let Some(event) = value.get("event").and_then(|v| v.as_str()) {
            debug!(venue = VENUE, event, "ignoring control frame");
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
            let Ok(timestamp_ms) = data.time_ms.parse::<i64>() else {
                debug!(venue = VENUE, ts = %data.time_ms, "dropping trade with unparseable timestamp");
                continue;
            };

            let delivered = forward_trade(
                &self.trades,
                Trade {
                    symbol: normalize_symbol(&data.inst_id),
                    price,
                    quantity,
                    timestamp_ms,
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
impl ExchangeAdapter for OkxAdapter {
    fn name(&self) -> &'static str {
        VENUE
    }

    async fn connect_and_subscribe(
        &mut self,
        symbols: &[SymbolPair],
    ) -> Result<ExchangeSession, AdapterError> {
        let url = format!(
            "wss://{}:{}/ws/v5/public",
            self.config.okx_address, self.config.okx_port
        );
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
        sink.send(Message::Text("ping".to_string())).await?;
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
