use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::gauge;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use jellyporter_config::Config;
use jellyporter_jellyfin::{ItemQueryOpts, MediaServer};
use jellyporter_models::ItemType;
use jellyporter_store::{ChangelogEntry, LibraryStore};

pub(crate) const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

const FULL_FETCH_PAGE_SIZE: u32 = 500;
const DELTA_FETCH_PAGE_SIZE: u32 = 25;

const METRIC_TOTAL_ITEMS: &str = "jellyporter_media_items_total";
const METRIC_TOTAL_ITEMS_TIMESTAMP: &str = "jellyporter_media_items_fetched_timestamp_seconds";
const METRIC_ITEMS_UPDATED: &str = "jellyporter_media_items_updated_userdata_total";

/// Reconciles per-user watched state across all configured servers. A cycle
/// refreshes every server's catalog snapshot first, then pushes the newest
/// user-data to every server holding a stale copy.
pub struct SyncEngine {
    servers: HashMap<String, Arc<dyn MediaServer>>,
    store: Arc<dyn LibraryStore>,

    // at most one cycle in flight, whether ticker- or event-initiated
    cycle_guard: Mutex<()>,

    // tracks cycles to decide between full and delta fetches
    cycle_counter: AtomicU32,
    sync_interval_mins: u32,
    full_sync_interval_mins: u32,

    // sheds event bursts: while set, incoming sync requests are rejected
    pub(crate) cooldown: Arc<AtomicBool>,
    pub(crate) cooldown_timer: Duration,
}

impl SyncEngine {
    pub fn new(
        servers: HashMap<String, Arc<dyn MediaServer>>,
        store: Arc<dyn LibraryStore>,
        cfg: &Config,
    ) -> Result<Self> {
        if servers.is_empty() {
            return Err(anyhow!("empty server map provided"));
        }

        Ok(Self {
            servers,
            store,
            cycle_guard: Mutex::new(()),
            cycle_counter: AtomicU32::new(0),
            sync_interval_mins: cfg.sync_interval_mins,
            full_sync_interval_mins: cfg.full_sync_interval_mins,
            cooldown: Arc::new(AtomicBool::new(false)),
            cooldown_timer: DEFAULT_COOLDOWN,
        })
    }

    pub fn with_cooldown_timer(mut self, timer: Duration) -> Self {
        self.cooldown_timer = timer;
        self
    }

    pub(crate) fn sync_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.sync_interval_mins) * 60)
    }

    /// Run a single reconciliation cycle. Errors from individual servers are
    /// aggregated; the cycle always covers every server and both item types
    /// before reporting them.
    #[instrument(skip_all)]
    pub async fn sync_once(&self, shutdown: &CancellationToken) -> Result<()> {
        let _guard = self.cycle_guard.lock().await;

        let start = Instant::now();
        let mut failures = Vec::new();
        for item_type in [ItemType::Movie, ItemType::Episode] {
            if let Err(err) = self.sync_watched_state(item_type, shutdown).await {
                error!(
                    duration_ms = start.elapsed().as_millis() as u64,
                    error = %err,
                    "Experienced errors while syncing 'watched' data for {}s between {} servers",
                    item_type.metric_label(),
                    self.servers.len()
                );
                failures.push(format!("{}: {}", item_type.metric_label(), err));
            }
        }

        self.cycle_counter.fetch_add(1, Ordering::SeqCst);
        info!(
            duration_ms = start.elapsed().as_millis() as u64,
            "Finished syncing data between {} servers",
            self.servers.len()
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(failures.join("; ")))
        }
    }

    async fn sync_watched_state(
        &self,
        item_type: ItemType,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        // Phase B operates on the snapshot Phase A produced; a failed refresh
        // means the snapshot is not trustworthy for this type.
        self.refresh_catalogs(item_type, shutdown).await?;
        self.apply_remote_user_data(item_type, shutdown).await
    }

    /// Phase A: one worker per server pulls the catalog (full or delta) into
    /// the store.
    async fn refresh_catalogs(
        &self,
        item_type: ItemType,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let start = Instant::now();
        let failures = Arc::new(Mutex::new(Vec::<String>::new()));

        info!(r#type = %item_type, "Fetching data from Jellyfin");
        let workers = self.servers.iter().map(|(server, client)| {
            let failures = failures.clone();
            async move {
                let result = match shutdown
                    .run_until_cancelled(self.refresh_catalog(item_type, server, client.as_ref()))
                    .await
                {
                    Some(result) => result,
                    None => Err(anyhow!("cancelled")),
                };

                if let Err(err) = result {
                    failures.lock().await.push(format!("{server}: {err}"));
                }
            }
        });
        join_all(workers).await;

        info!(
            duration_ms = start.elapsed().as_millis() as u64,
            r#type = %item_type,
            "Finished fetching items from {} servers",
            self.servers.len()
        );

        let failures = failures.lock().await;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(failures.join("; ")))
        }
    }

    async fn refresh_catalog(
        &self,
        item_type: ItemType,
        server: &str,
        client: &dyn MediaServer,
    ) -> Result<()> {
        let cycle_start = Utc::now();

        let user_id = client
            .user_id()
            .await
            .with_context(|| format!("could not resolve user on {server}"))?;

        let last_sync = match self.store.last_sync(server, item_type).await {
            Ok(ts) => ts,
            Err(err) => {
                error!(server, r#type = %item_type, error = %err, "could not get state from DB");
                DateTime::UNIX_EPOCH
            }
        };

        let opts = self.query_opts(last_sync, server, item_type);
        let page = client.items(&user_id, &opts).await?;

        if !opts.is_delta() {
            // Only meaningful when the full list was enumerated.
            gauge!(METRIC_TOTAL_ITEMS,
                "server" => server.to_string(),
                "type" => item_type.metric_label())
            .set(page.items.len() as f64);
            gauge!(METRIC_TOTAL_ITEMS_TIMESTAMP,
                "server" => server.to_string(),
                "type" => item_type.metric_label())
            .set(Utc::now().timestamp() as f64);
        }

        info!(
            server,
            r#type = %item_type,
            "Fetched {} items from server",
            page.items.len()
        );
        self.store
            .upsert_items(server, item_type, &page.items)
            .await?;

        // A delta fetch does not enumerate the catalog and must not be used
        // as evidence of removal.
        if !opts.is_delta() {
            self.store
                .prune_items_not_seen_since(server, item_type, cycle_start)
                .await?;
        }

        Ok(())
    }

    fn query_opts(
        &self,
        last_sync: DateTime<Utc>,
        server: &str,
        item_type: ItemType,
    ) -> ItemQueryOpts {
        let count = self.cycle_counter.load(Ordering::SeqCst);
        let cadence = (self.full_sync_interval_mins / self.sync_interval_mins).max(1);

        if last_sync.timestamp() == 0 || count % cadence == 0 {
            info!(server, r#type = %item_type, "Requesting full list of items");
            return ItemQueryOpts::full(item_type, FULL_FETCH_PAGE_SIZE);
        }

        info!(
            server,
            since = %last_sync,
            "Not requesting full list of items, only deltas since last check"
        );
        ItemQueryOpts::delta(item_type, DELTA_FETCH_PAGE_SIZE, last_sync)
    }

    /// Phase B: one worker per server pushes the user-data every stale row is
    /// missing and advances the server's watermark.
    async fn apply_remote_user_data(
        &self,
        item_type: ItemType,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let failures = Arc::new(Mutex::new(Vec::<String>::new()));

        let workers = self.servers.iter().map(|(server, client)| {
            let failures = failures.clone();
            async move {
                let result = match shutdown
                    .run_until_cancelled(self.apply_server_user_data(
                        item_type,
                        server,
                        client.as_ref(),
                    ))
                    .await
                {
                    Some(result) => result,
                    None => Err(anyhow!("cancelled")),
                };

                if let Err(err) = result {
                    failures.lock().await.push(format!("{server}: {err}"));
                }
            }
        });
        join_all(workers).await;

        let failures = failures.lock().await;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(failures.join("; ")))
        }
    }

    async fn apply_server_user_data(
        &self,
        item_type: ItemType,
        server: &str,
        client: &dyn MediaServer,
    ) -> Result<()> {
        let updated = self
            .store
            .items_with_newer_remote_user_data(server, item_type)
            .await?;

        gauge!(METRIC_ITEMS_UPDATED,
            "server" => server.to_string(),
            "type" => item_type.metric_label())
        .set(updated.len() as f64);

        if updated.is_empty() {
            let now = Utc::now();
            match self.store.upsert_last_sync(server, item_type, now).await {
                Ok(()) => {
                    info!(server, ts = %now, updated = 0, r#type = %item_type, "Upsert state");
                }
                Err(err) => {
                    warn!(server, error = %err, "could not upsert timestamp");
                }
            }
            return Ok(());
        }

        info!(
            server,
            updated = updated.len(),
            r#type = %item_type,
            "Found items with updated UserData"
        );

        let user_id = client
            .user_id()
            .await
            .with_context(|| format!("could not resolve user on {server}"))?;

        let mut lowest_watched_date = i64::MAX;
        let mut write_failures = Vec::new();
        for item in &updated {
            lowest_watched_date = lowest_watched_date.min(item.watched_date);

            match client
                .update_user_data(&user_id, &item.local_id, &item.as_user_data())
                .await
            {
                Ok(()) => {
                    info!(
                        id = %item.local_id,
                        name = %item.name,
                        ts = item.watched_date,
                        server,
                        r#type = %item_type,
                        "Updated UserData for item"
                    );
                    if let Err(err) = self
                        .store
                        .insert_changelog(server, ChangelogEntry::from(item))
                        .await
                    {
                        error!(server, error = %err, "Could not insert changelog");
                    }
                }
                Err(err) => {
                    error!(
                        id = %item.local_id,
                        name = %item.name,
                        server,
                        r#type = %item_type,
                        error = %err,
                        "Could not update UserData for item"
                    );
                    write_failures.push(format!("{}: {}", item.local_id, err));
                }
            }
        }

        if !write_failures.is_empty() {
            // Leaving the watermark untouched keeps every failed item inside
            // the next delta window.
            return Err(anyhow!(write_failures.join("; ")));
        }

        // Biased one second below the batch minimum so the next delta query
        // still observes the just-written boundary.
        let watermark =
            DateTime::from_timestamp(lowest_watched_date - 1, 0).unwrap_or(DateTime::UNIX_EPOCH);
        info!(
            server,
            ts = %watermark,
            updated = updated.len(),
            r#type = %item_type,
            "Upsert state"
        );
        if let Err(err) = self
            .store
            .upsert_last_sync(server, item_type, watermark)
            .await
        {
            error!(server, error = %err, r#type = %item_type, "could not upsert timestamp");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
