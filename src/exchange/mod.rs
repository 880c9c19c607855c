// =============================================================================
// Exchange adapters -- one protocol shim per venue behind a uniform trait
// =============================================================================
//
// Each adapter owns the venue-specific pieces of a websocket session: the
// dial URL, the subscription handshake, the trade-frame parser, and the
// liveness convention. Everything above this seam (reconnection, liveness
// probing, fan-in, candle building) is venue-agnostic.
// =============================================================================

mod binance;
mod bybit;
mod okx;

pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;
pub use okx::OkxAdapter;

use std::pin::Pin;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::Stream;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::warn;

use crate::types::{SymbolPair, Trade};

/// The websocket transport every live adapter runs over.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Incoming half of a session, boxed so tests can substitute scripted frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// Capacity of the pong channel: one slot, newest pong wins.
const PONG_CHANNEL_CAPACITY: usize = 1;

/// A freshly subscribed venue session.
///
/// The adapter keeps the write half for [`ExchangeAdapter::ping`] and
/// [`ExchangeAdapter::close`]; the caller owns the read half and the pong
/// receiver.
pub struct ExchangeSession {
    pub frames: FrameStream,
    pub pongs: mpsc::Receiver<Instant>,
}

/// Errors surfaced by an adapter. Parse failures are recoverable (the frame
/// is dropped); the rest tear the session down.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("dial failed: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("subscribe handshake failed: {0}")]
    Subscribe(#[source] tungstenite::Error),

    #[error("malformed frame: {0}")]
    Parse(String),

    #[error("no active session")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
}

/// Uniform capability set over one venue's wire protocol.
///
/// One instance per venue per subscription; the instance owns the socket for
/// the lifetime of each session it opens.
#[async_trait]
pub trait ExchangeAdapter: Send {
    /// Stable venue label, used as [`Trade::source`].
    fn name(&self) -> &'static str;

    /// Dial the venue and perform its subscription handshake for `symbols`.
    ///
    /// Replaces any previous session state held by the adapter.
    async fn connect_and_subscribe(
        &mut self,
        symbols: &[SymbolPair],
    ) -> Result<ExchangeSession, AdapterError>;

    /// Parse one incoming websocket message, pushing any embedded trades to
    /// the trade channel and posting to the pong channel for liveness
    /// responses. A [`AdapterError::Parse`] return leaves the session usable.
    async fn handle_message(&mut self, message: Message) -> Result<(), AdapterError>;

    /// Send the venue-appropriate liveness probe on the current session.
    async fn ping(&mut self) -> Result<(), AdapterError>;

    /// Best-effort graceful close of the current session, if any.
    async fn close(&mut self);
}

pub(crate) fn pong_channel() -> (mpsc::Sender<Instant>, mpsc::Receiver<Instant>) {
    mpsc::channel(PONG_CHANNEL_CAPACITY)
}

/// Post a liveness response without blocking; with a full one-slot channel
/// the waiter is already satisfied, so dropping the newcomer is harmless.
pub(crate) fn post_pong(pongs: &Option<mpsc::Sender<Instant>>) {
    if let Some(tx) = pongs {
        let _ = tx.try_send(Instant::now());
    }
}

/// Parse a venue price string. Venue numerics arrive as JSON strings; a
/// value that is not a finite positive float disqualifies the trade, which
/// is dropped with a warning rather than ending the session.
pub(crate) fn parse_price(venue: &'static str, raw: &str) -> Option<f64> {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => Some(value),
        _ => {
            warn!(venue, price = %raw, "dropping trade with unparseable price");
            None
        }
    }
}

/// Parse a venue quantity string: finite and non-negative, or the trade is
/// dropped with a warning.
pub(crate) fn parse_quantity(venue: &'static str, raw: &str) -> Option<f64> {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Some(value),
        _ => {
            warn!(venue, quantity = %raw, "dropping trade with unparseable quantity");
            None
        }
    }
}

/// Forward a normalized trade to the shared trade channel. Returns false
/// when the channel is closed (the subscription is tearing down).
pub(crate) async fn forward_trade(trades: &mpsc::Sender<Trade>, trade: Trade) -> bool {
    trades.send(trade).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_must_be_finite_and_positive() {
        assert_eq!(parse_price("test", "37000.5"), Some(37000.5));
        assert_eq!(parse_price("test", "0"), None);
        assert_eq!(parse_price("test", "-1.0"), None);
        assert_eq!(parse_price("test", "NaN"), None);
        assert_eq!(parse_price("test", "inf"), None);
        assert_eq!(parse_price("test", "garbage"), None);
    }

    #[test]
    fn quantity_may_be_zero_but_not_negative() {
        assert_eq!(parse_quantity("test", "0"), Some(0.0));
        assert_eq!(parse_quantity("test", "1.25"), Some(1.25));
        assert_eq!(parse_quantity("test", "-0.1"), None);
        assert_eq!(parse_quantity("test", "NaN"), None);
    }
}
