// =============================================================================
// Aggregator -- fan-in of all venue streamers for one subscription
// =============================================================================

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::streamer::TradeStreamer;
use crate::types::SymbolPair;

/// Every venue reached Terminal while the subscription was still wanted.
#[derive(Debug, Error)]
#[error("all venues terminated")]
pub struct AllVenuesDown;

/// Runs N trade streamers concurrently against the shared trade channel and
/// supervises their lifetimes.
///
/// A single venue giving up degrades the aggregate stream instead of ending
/// it; the subscription only fails once no venue is left.
pub struct Aggregator {
    streamers: Vec<TradeStreamer>,
}

impl Aggregator {
    pub fn new(streamers: Vec<TradeStreamer>) -> Self {
        Self { streamers }
    }

    /// Returns when the token cancels (`Ok`) or when every streamer has gone
    /// Terminal without cancellation (`AllVenuesDown`).
    pub async fn stream(
        self,
        token: CancellationToken,
        symbols: Vec<SymbolPair>,
    ) -> Result<(), AllVenuesDown> {
        let mut tasks = JoinSet::new();
        for streamer in self.streamers {
            let token = token.clone();
            let symbols = symbols.clone();
            tasks.spawn(async move { streamer.run(token, &symbols).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "venue stream terminated"),
                Err(e) => error!(error = %e, "venue stream task failed"),
            }
        }

        if token.is_cancelled() {
            Ok(())
        } else {
            Err(AllVenuesDown)
        }
    }
}
