// =============================================================================
// gRPC surface -- per-subscription pipeline construction and dispatch
// =============================================================================
//
// Each accepted StreamCandles call gets its own isolated pipeline: three
// venue adapters writing into one bounded trade channel, a candle builder
// binning that channel on the configured interval, and a dispatcher task
// that is the sole producer for the response stream. A cancellation token
// ties the stages together; client disconnects and fatal stage errors both
// cancel it, and every stage exits through it.
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

use crate::aggregator::Aggregator;
use crate::candles::{Candle, CandleBuilder};
use crate::config::Config;
use crate::exchange::{BinanceAdapter, BybitAdapter, ExchangeAdapter, OkxAdapter};
use crate::proto::candles::v1::candle_service_server::CandleService;
use crate::proto::candles::v1::{StreamCandlesRequest, StreamCandlesResponse};
use crate::streamer::TradeStreamer;
use crate::types::SymbolPair;

/// Candle channel capacity. The dispatcher drains promptly; a sustained
/// stall here means the client is slow or gone and ends the subscription.
const CANDLE_CHANNEL_CAPACITY: usize = 1;

/// Response channel capacity between the dispatcher and the transport.
const OUTBOUND_CHANNEL_CAPACITY: usize = 16;

/// gRPC implementation of `candles.v1.CandleService`.
pub struct CandleGrpcService {
    config: Arc<Config>,
}

impl CandleGrpcService {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

/// Validate request symbols of the form `base-quote`; any malformed element
/// rejects the whole request before pipeline construction.
fn parse_symbols(raw: &[String]) -> Result<Vec<SymbolPair>, Status> {
    if raw.is_empty() {
        return Err(Status::invalid_argument("no symbols requested"));
    }
    raw.iter()
        .map(|symbol| {
            SymbolPair::parse(symbol).map_err(|e| Status::invalid_argument(e.to_string()))
        })
        .collect()
}

#[tonic::async_trait]
impl CandleService for CandleGrpcService {
    type StreamCandlesStream = ReceiverStream<Result<StreamCandlesResponse, Status>>;

    async fn stream_candles(
        &self,
        request: Request<StreamCandlesRequest>,
    ) -> Result<Response<Self::StreamCandlesStream>, Status> {
        let symbols = parse_symbols(&request.into_inner().symbols)?;
        info!(
            symbols = ?symbols.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "subscription accepted"
        );

        let token = CancellationToken::new();
        let (trade_tx, trade_rx) = mpsc::channel(self.config.trade_stream_buffer_size.max(1));
        let (candle_tx, candle_rx) = mpsc::channel(CANDLE_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

        // One adapter per venue, all writing to the shared trade channel.
        // The last clone of trade_tx moves into an adapter, so the channel
        // closes exactly when the last venue is gone.
        let adapters: Vec<Box<dyn ExchangeAdapter>> = vec![
            Box::new(BinanceAdapter::new(self.config.clone(), trade_tx.clone())),
            Box::new(BybitAdapter::new(self.config.clone(), trade_tx.clone())),
            Box::new(OkxAdapter::new(self.config.clone(), trade_tx)),
        ];
        let streamers = adapters
            .into_iter()
            .map(|adapter| TradeStreamer::new(adapter, &self.config))
            .collect();
        let aggregator = Aggregator::new(streamers);

        // Venue fan-in; exhaustion of every venue surfaces as Unavailable.
        let agg_token = token.clone();
        let agg_out = out_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = aggregator.stream(agg_token.clone(), symbols).await {
                error!(error = %e, "subscription has no venues left");
                let _ = agg_out.send(Err(Status::unavailable(e.to_string()))).await;
                agg_token.cancel();
            }
        });

        // Time-bucketed aggregation.
        let builder = CandleBuilder::new(&self.config);
        tokio::spawn(builder.run(token.clone(), trade_rx, candle_tx));

        // Dispatcher, the sole candle producer for the response stream.
        tokio::spawn(dispatch_candles(token, candle_rx, out_tx));

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

/// Forward candles to the subscriber until the client goes away or the
/// pipeline shuts down, then cancel the subscription token so every
/// upstream stage unwinds.
async fn dispatch_candles(
    token: CancellationToken,
    mut candles: mpsc::Receiver<Candle>,
    out: mpsc::Sender<Result<StreamCandlesResponse, Status>>,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            _ = out.closed() => {
                debug!("client stream closed");
                break;
            }

            received = candles.recv() => {
                let Some(candle) = received else { break };
                if out.send(Ok(to_response(candle))).await.is_err() {
                    debug!("client stream closed while sending");
                    break;
                }
            }
        }
    }
    token.cancel();
}

fn to_response(candle: Candle) -> StreamCandlesResponse {
    StreamCandlesResponse {
        symbol: candle.symbol,
        timestamp: candle.timestamp,
        open: candle.open,
        high: candle.high,
        low: candle.low,
        close: candle.close,
        volume: candle.volume,
    }
}
