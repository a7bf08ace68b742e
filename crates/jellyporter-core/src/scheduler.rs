use metrics::counter;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use jellyporter_events::{SyncRejected, SyncRequest};

use crate::engine::SyncEngine;

const METRIC_EVENT_REQUESTS: &str = "jellyporter_events_requests_total";
const METRIC_EVENT_ERRORS: &str = "jellyporter_events_request_errors_total";
const METRIC_EVENT_COOLDOWNS: &str = "jellyporter_events_cooldown_phases_total";

impl SyncEngine {
    /// Daemon loop: an immediate first cycle, then cycles driven by the
    /// periodic ticker and by external sync requests, until cancellation.
    /// Cycle errors are already logged by the engine and never end the loop.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SyncRequest>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // an interval's first tick fires immediately; it stands in for the
        // startup sync
        ticker.tick().await;
        let _ = self.sync_once(&shutdown).await;

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    self.handle_event(event, &shutdown).await;
                }
                _ = ticker.tick() => {
                    let _ = self.sync_once(&shutdown).await;
                }
                _ = shutdown.cancelled() => {
                    info!("Stopping sync loop");
                    return;
                }
            }
        }
    }

    /// A burst of events within the cooldown window triggers exactly one
    /// cycle; the rest are shed with a rejection reply.
    async fn handle_event(&self, event: SyncRequest, shutdown: &CancellationToken) {
        counter!(METRIC_EVENT_REQUESTS, "source" => event.source).increment(1);

        if self
            .cooldown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            counter!(METRIC_EVENT_COOLDOWNS).increment(1);
            info!(
                source = event.source,
                metadata = %event.metadata,
                "Received external request to sync data"
            );

            let flag = self.cooldown.clone();
            let timer = self.cooldown_timer;
            let token = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timer) => {}
                    _ = token.cancelled() => {}
                }
                flag.store(false, Ordering::SeqCst);
            });

            let _ = event.reply.send(Ok(()));
            let _ = self.sync_once(shutdown).await;
        } else {
            counter!(METRIC_EVENT_ERRORS, "source" => event.source).increment(1);
            debug!(
                source = event.source,
                metadata = %event.metadata,
                "Not initiating sync due to having received too many requests in the last {:?}",
                self.cooldown_timer
            );
            let _ = event.reply.send(Err(SyncRejected::TooManyRequests));
        }
    }
}
