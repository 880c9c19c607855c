// =============================================================================
// candlestream -- server entry point
// =============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use candlestream::config::Config;
use candlestream::proto::candles::v1::candle_service_server::CandleServiceServer;
use candlestream::service::CandleGrpcService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env());
    info!(
        port = config.server_port,
        candle_interval_ms = config.candle_interval_ms,
        max_retries = config.ws_connection_max_retries,
        "starting candle streaming service"
    );

    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let service = CandleGrpcService::new(config);

    info!(addr = %addr, "gRPC server listening");
    Server::builder()
        .add_service(CandleServiceServer::new(service))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    warn!("shutdown signal received, stopping gracefully");
}
