//! Control-plane subscription: keeps the live ring current.
//!
//! One task per client. It resolves the ring-server endpoint (configured or
//! discovered), subscribes, and applies every decodable ring it receives.
//! Failures back off exponentially; a delivered ring resets the backoff. A
//! stream that stays silent past the staleness deadline is dropped and
//! re-dialed, since the transport's receive has no timeout of its own.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::Shared;

const BACKOFF_FLOOR: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Idle window after which the ring stream is considered stale.
const STALE_STREAM_DEADLINE: Duration = Duration::from_secs(15 * 60);

pub(crate) struct Backoff {
    current: Duration,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self {
            current: BACKOFF_FLOOR,
        }
    }

    /// Delay to sleep now; the next one doubles, up to the cap.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(BACKOFF_CAP);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = BACKOFF_FLOOR;
    }
}

enum AttemptEnd {
    Shutdown,
    Retry,
}

pub(crate) async fn run(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut backoff = Backoff::new();
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        match attempt(&shared, &shutdown, &mut backoff).await {
            AttemptEnd::Shutdown => break,
            AttemptEnd::Retry => {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    debug!(target: "replistore::sync", "ring sync task exited");
}

/// One subscription attempt: endpoint resolution, dial, receive loop.
async fn attempt(
    shared: &Shared,
    shutdown: &CancellationToken,
    backoff: &mut Backoff,
) -> AttemptEnd {
    let config = &shared.config;
    let endpoint = match &config.ring_server {
        Some(endpoint) => endpoint.clone(),
        None => {
            let discovered = tokio::select! {
                _ = shutdown.cancelled() => return AttemptEnd::Shutdown,
                result = shared.discovery.discover(
                    &config.ring_discovery_service,
                    &config.ring_discovery_namespace,
                    &config.ring_discovery_protocol,
                ) => result,
            };
            match discovered {
                Ok(address) => address,
                Err(err) => {
                    warn!(error = %err, "ring server discovery failed");
                    return AttemptEnd::Retry;
                }
            }
        }
    };

    let subscribed = tokio::select! {
        _ = shutdown.cancelled() => return AttemptEnd::Shutdown,
        result = shared.source.subscribe(
            &endpoint,
            &config.ring_client_id,
            &config.ring_server_transport_options,
        ) => result,
    };
    let mut subscription = match subscribed {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(endpoint = %endpoint, error = %err, "ring subscription failed");
            return AttemptEnd::Retry;
        }
    };
    info!(endpoint = %endpoint, "subscribed to ring updates");

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => return AttemptEnd::Shutdown,
            received = tokio::time::timeout(
                STALE_STREAM_DEADLINE,
                subscription.recv(),
            ) => received,
        };
        match received {
            Err(_) => {
                warn!(endpoint = %endpoint, "ring stream idle past deadline, reconnecting");
                return AttemptEnd::Retry;
            }
            Ok(Ok(Some(envelope))) => match shared.codec.decode(&envelope.ring) {
                Ok(ring) => {
                    debug!(
                        target: "replistore::sync",
                        version = envelope.version,
                        "applying ring update"
                    );
                    shared.apply_ring(ring).await;
                    backoff.reset();
                }
                Err(err) => {
                    debug!(
                        target: "replistore::sync",
                        version = envelope.version,
                        error = %err,
                        "discarding undecodable ring message"
                    );
                }
            },
            Ok(Ok(None)) => {
                debug!(endpoint = %endpoint, "ring stream closed by server");
                return AttemptEnd::Retry;
            }
            Ok(Err(err)) => {
                warn!(endpoint = %endpoint, error = %err, "ring stream receive failed");
                return AttemptEnd::Retry;
            }
        }
    }
}
