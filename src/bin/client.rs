// =============================================================================
// candlestream-client -- subscribes to the candle stream and prints each bar
// =============================================================================

use anyhow::Context;
use chrono::{TimeZone, Utc};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use candlestream::proto::candles::v1::candle_service_client::CandleServiceClient;
use candlestream::proto::candles::v1::StreamCandlesRequest;

#[derive(Parser)]
#[command(name = "candlestream-client")]
#[command(about = "Streams aggregated OHLCV candles from a candlestream server")]
struct Cli {
    /// Server address.
    #[arg(long, default_value = "http://localhost:8080")]
    server: String,

    /// Comma-separated list of symbols to subscribe to, e.g. btc-usdt,eth-usdt.
    #[arg(long, default_value = "btc-usdt")]
    symbols: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let symbols: Vec<String> = cli
        .symbols
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let mut client = CandleServiceClient::connect(cli.server.clone())
        .await
        .with_context(|| format!("failed to connect to {}", cli.server))?;

    let mut stream = client
        .stream_candles(StreamCandlesRequest { symbols })
        .await?
        .into_inner();

    info!(server = %cli.server, "connected to candle service");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, closing stream");
                break;
            }
            message = stream.message() => {
                match message {
                    Ok(Some(candle)) => {
                        let at = Utc
                            .timestamp_opt(candle.timestamp, 0)
                            .single()
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| candle.timestamp.to_string());
                        println!(
                            "{} {} open={} high={} low={} close={} volume={}",
                            at,
                            candle.symbol,
                            candle.open,
                            candle.high,
                            candle.low,
                            candle.close,
                            candle.volume,
                        );
                    }
                    Ok(None) => {
                        info!("stream closed by server");
                        break;
                    }
                    Err(status) => {
                        info!(code = ?status.code(), message = status.message(), "stream ended");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
