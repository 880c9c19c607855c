// =============================================================================
// TradeStreamer -- per-venue supervisor for reconnection and liveness
// =============================================================================
//
// Wraps one exchange adapter and turns its flaky websocket session into a
// durable trade producer. The supervisor owns the dial/backoff loop; each
// live session runs a reader task and a liveness prober task, and the
// supervisor tears the session down when either signals or the subscription
// is cancelled.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, timeout, Instant as TokioInstant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::exchange::{ExchangeAdapter, ExchangeSession};
use crate::types::SymbolPair;

/// Cadence of the liveness check while a session is up.
const PROBE_PERIOD: Duration = Duration::from_secs(10);

/// How long a probe waits for its pong before dropping the session.
const PONG_WAIT: Duration = Duration::from_secs(10);

/// Terminal failure of one venue's streamer.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("{venue}: failed to establish a stable connection after {attempts} attempts")]
    RetriesExhausted { venue: &'static str, attempts: u32 },
}

/// Why a live session ended.
enum SessionEnd {
    Cancelled,
    LivenessLost,
    Transport(String),
}

/// Durable trade producer for a single venue.
pub struct TradeStreamer {
    venue: &'static str,
    adapter: Arc<Mutex<Box<dyn ExchangeAdapter>>>,
    max_retries: u32,
    liveness_timeout: Duration,
    probe_period: Duration,
    pong_wait: Duration,
}

impl TradeStreamer {
    pub fn new(adapter: Box<dyn ExchangeAdapter>, config: &Config) -> Self {
        let venue = adapter.name();
        Self {
            venue,
            adapter: Arc::new(Mutex::new(adapter)),
            max_retries: config.ws_connection_max_retries.max(1),
            liveness_timeout: Duration::from_millis(config.ws_connection_timeout_ms),
            probe_period: PROBE_PERIOD,
            pong_wait: PONG_WAIT,
        }
    }

    /// Override the probe cadence and pong deadline. Tests cannot wait out
    /// the production timings.
    pub fn with_probe_timing(mut self, probe_period: Duration, pong_wait: Duration) -> Self {
        self.probe_period = probe_period;
        self.pong_wait = pong_wait;
        self
    }

    /// Keep a subscribed session alive until the token cancels or the dial
    /// budget runs out.
    ///
    /// Returns `Ok(())` on cancellation (after writing a graceful close
    /// frame) and `RetriesExhausted` once the venue is given up on. A lost
    /// session consumes one retry slot before the redial; any session that
    /// was successfully established resets the budget.
    pub async fn run(
        &self,
        token: CancellationToken,
        symbols: &[SymbolPair],
    ) -> Result<(), StreamError> {
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                let delay = Duration::from_secs(u64::from(attempt));
                info!(
                    venue = self.venue,
                    delay_s = attempt,
                    attempt = attempt + 1,
                    max_attempts = self.max_retries,
                    "reconnecting after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return Ok(()),
                }
            }

            let dialed = {
                let mut adapter = self.adapter.lock().await;
                tokio::select! {
                    result = adapter.connect_and_subscribe(symbols) => result,
                    _ = token.cancelled() => return Ok(()),
                }
            };

            let session = match dialed {
                Ok(session) => session,
                Err(e) => {
                    attempt += 1;
                    warn!(
                        venue = self.venue,
                        error = %e,
                        attempt,
                        max_attempts = self.max_retries,
                        "failed to connect"
                    );
                    if attempt >= self.max_retries {
                        return Err(StreamError::RetriesExhausted {
                            venue: self.venue,
                            attempts: self.max_retries,
                        });
                    }
                    continue;
                }
            };

            info!(venue = self.venue, "session established");
            attempt = 0;

            match self.run_session(session, &token).await {
                SessionEnd::Cancelled => {
                    self.adapter.lock().await.close().await;
                    info!(venue = self.venue, "session closed on cancellation");
                    return Ok(());
                }
                SessionEnd::LivenessLost => {
                    warn!(venue = self.venue, "liveness lost, reconnecting");
                }
                SessionEnd::Transport(e) => {
                    warn!(venue = self.venue, error = %e, "session lost, reconnecting");
                }
            }

            attempt += 1;
            if attempt >= self.max_retries {
                return Err(StreamError::RetriesExhausted {
                    venue: self.venue,
                    attempts: self.max_retries,
                });
            }
        }
    }

    /// Drive one live session: a reader task and a liveness prober, with the
    /// supervisor selecting over their signals and cancellation.
    async fn run_session(&self, session: ExchangeSession, token: &CancellationToken) -> SessionEnd {
        let last_message_at = Arc::new(RwLock::new(Instant::now()));
        let (done_tx, mut done_rx) = mpsc::channel::<SessionEnd>(2);

        // Reader: frames in, trades out, watermark refreshed on every frame.
        // Parse failures are logged and skipped; only transport failures end
        // the session.
        let reader = {
            let adapter = self.adapter.clone();
            let last_seen = last_message_at.clone();
            let done = done_tx.clone();
            let venue = self.venue;
            let mut frames = session.frames;
            tokio::spawn(async move {
                loop {
                    match frames.next().await {
                        Some(Ok(message)) => {
                            *last_seen.write() = Instant::now();
                            if let Err(e) = adapter.lock().await.handle_message(message).await {
                                warn!(venue, error = %e, "failed to handle frame");
                            }
                        }
                        Some(Err(e)) => {
                            let _ = done.try_send(SessionEnd::Transport(e.to_string()));
                            return;
                        }
                        None => {
                            let _ =
                                done.try_send(SessionEnd::Transport("stream ended".to_string()));
                            return;
                        }
                    }
                }
            })
        };

        // Prober: ping once the session has been quiet past the idle
        // threshold, then demand a pong within the deadline.
        let prober = {
            let adapter = self.adapter.clone();
            let last_seen = last_message_at.clone();
            let done = done_tx;
            let venue = self.venue;
            let mut pongs = session.pongs;
            let liveness_timeout = self.liveness_timeout;
            let probe_period = self.probe_period;
            let pong_wait = self.pong_wait;
            tokio::spawn(async move {
                let mut ticker = interval_at(TokioInstant::now() + probe_period, probe_period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let idle = last_seen.read().elapsed();
                    if idle <= liveness_timeout {
                        continue;
                    }

                    // Discard pongs from earlier probes before arming a new one.
                    while pongs.try_recv().is_ok() {}

                    warn!(
                        venue,
                        idle_ms = idle.as_millis() as u64,
                        "no recent messages, sending ping"
                    );
                    if let Err(e) = adapter.lock().await.ping().await {
                        let _ = done.try_send(SessionEnd::Transport(e.to_string()));
                        return;
                    }
                    match timeout(pong_wait, pongs.recv()).await {
                        Ok(Some(_)) => debug!(venue, "pong received"),
                        _ => {
                            warn!(
                                venue,
                                wait_ms = pong_wait.as_millis() as u64,
                                "pong not received, dropping session"
                            );
                            let _ = done.try_send(SessionEnd::LivenessLost);
                            return;
                        }
                    }
                }
            })
        };

        let end = tokio::select! {
            _ = token.cancelled() => SessionEnd::Cancelled,
            signal = done_rx.recv() => signal.unwrap_or(SessionEnd::LivenessLost),
        };

        reader.abort();
        prober.abort();
        let _ = reader.await;
        let _ = prober.await;
        end
    }
}
