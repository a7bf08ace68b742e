use super::*;
use async_trait::async_trait;
use jellyporter_jellyfin::ApiError;
use jellyporter_models::{Item, ItemsPage, UserDataUpdate};
use jellyporter_store::{StaleItem, StoreError};
use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, oneshot};

use jellyporter_events::{SyncRejected, SyncRequest};

fn config() -> Config {
    Config {
        database: Default::default(),
        clients: HashMap::new(),
        events: None,
        sync_interval_mins: 5,
        full_sync_interval_mins: 360,
        metrics_addr: "127.0.0.1:8972".to_string(),
        metrics_path: None,
    }
}

fn stale(local_id: &str, watched_date: i64) -> StaleItem {
    StaleItem {
        local_id: local_id.to_string(),
        name: "The Matrix".to_string(),
        series_name: None,
        watched_date,
        watched_progress: 0.5,
        watched_position_ticks: 100,
        is_favorite: false,
    }
}

#[derive(Default)]
struct FakeServer {
    catalog: Vec<Item>,
    fail_listing: bool,
    fail_writes_for: HashSet<String>,
    listing_delay: Option<Duration>,

    listings: StdMutex<Vec<ItemQueryOpts>>,
    writes: StdMutex<Vec<(String, UserDataUpdate)>>,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl FakeServer {
    fn listings(&self) -> Vec<ItemQueryOpts> {
        self.listings.lock().unwrap().clone()
    }

    fn writes(&self) -> Vec<(String, UserDataUpdate)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaServer for FakeServer {
    async fn user_id(&self) -> Result<String, ApiError> {
        Ok("user-1".to_string())
    }

    async fn items(&self, _user_id: &str, opts: &ItemQueryOpts) -> Result<ItemsPage, ApiError> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.listing_delay {
            tokio::time::sleep(delay).await;
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        self.listings.lock().unwrap().push(opts.clone());
        if self.fail_listing {
            return Err(ApiError::Status {
                path: "/Users/user-1/Items".to_string(),
                status: 500,
            });
        }

        Ok(ItemsPage {
            total_record_count: self.catalog.len(),
            start_index: 0,
            items: self.catalog.clone(),
        })
    }

    async fn update_user_data(
        &self,
        _user_id: &str,
        item_id: &str,
        update: &UserDataUpdate,
    ) -> Result<(), ApiError> {
        if self.fail_writes_for.contains(item_id) {
            return Err(ApiError::Status {
                path: format!("/Users/user-1/Items/{item_id}/UserData"),
                status: 500,
            });
        }

        self.writes
            .lock()
            .unwrap()
            .push((item_id.to_string(), update.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct FakeStore {
    stale: StdMutex<HashMap<(String, ItemType), Vec<StaleItem>>>,

    upserts: StdMutex<Vec<(String, ItemType, usize)>>,
    prunes: StdMutex<Vec<(String, ItemType)>>,
    stale_queries: StdMutex<Vec<(String, ItemType)>>,
    changelog: StdMutex<Vec<(String, ChangelogEntry)>>,
    watermarks: StdMutex<HashMap<(String, ItemType), DateTime<Utc>>>,
}

impl FakeStore {
    fn set_stale(&self, server: &str, item_type: ItemType, items: Vec<StaleItem>) {
        self.stale
            .lock()
            .unwrap()
            .insert((server.to_string(), item_type), items);
    }

    fn watermark(&self, server: &str, item_type: ItemType) -> Option<DateTime<Utc>> {
        self.watermarks
            .lock()
            .unwrap()
            .get(&(server.to_string(), item_type))
            .copied()
    }

    fn prune_count(&self) -> usize {
        self.prunes.lock().unwrap().len()
    }

    fn listing_count(&self) -> usize {
        self.upserts.lock().unwrap().len()
    }

    fn changelog_entries(&self) -> Vec<(String, ChangelogEntry)> {
        self.changelog.lock().unwrap().clone()
    }
}

#[async_trait]
impl LibraryStore for FakeStore {
    async fn upsert_items(
        &self,
        server: &str,
        item_type: ItemType,
        items: &[Item],
    ) -> Result<(), StoreError> {
        self.upserts
            .lock()
            .unwrap()
            .push((server.to_string(), item_type, items.len()));
        Ok(())
    }

    async fn prune_items_not_seen_since(
        &self,
        server: &str,
        item_type: ItemType,
        _since: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.prunes
            .lock()
            .unwrap()
            .push((server.to_string(), item_type));
        Ok(())
    }

    async fn items_with_newer_remote_user_data(
        &self,
        server: &str,
        item_type: ItemType,
    ) -> Result<Vec<StaleItem>, StoreError> {
        self.stale_queries
            .lock()
            .unwrap()
            .push((server.to_string(), item_type));
        Ok(self
            .stale
            .lock()
            .unwrap()
            .get(&(server.to_string(), item_type))
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_changelog(
        &self,
        server: &str,
        entry: ChangelogEntry,
    ) -> Result<(), StoreError> {
        self.changelog
            .lock()
            .unwrap()
            .push((server.to_string(), entry));
        Ok(())
    }

    async fn last_sync(
        &self,
        server: &str,
        item_type: ItemType,
    ) -> Result<DateTime<Utc>, StoreError> {
        Ok(self
            .watermark(server, item_type)
            .unwrap_or(DateTime::UNIX_EPOCH))
    }

    async fn upsert_last_sync(
        &self,
        server: &str,
        item_type: ItemType,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.watermarks
            .lock()
            .unwrap()
            .insert((server.to_string(), item_type), ts);
        Ok(())
    }
}

fn engine_with(
    servers: Vec<(&str, Arc<FakeServer>)>,
    store: Arc<FakeStore>,
) -> Arc<SyncEngine> {
    let servers: HashMap<String, Arc<dyn MediaServer>> = servers
        .into_iter()
        .map(|(name, server)| (name.to_string(), server as Arc<dyn MediaServer>))
        .collect();
    Arc::new(SyncEngine::new(servers, store, &config()).unwrap())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[test]
fn empty_server_map_is_rejected() {
    let store = Arc::new(FakeStore::default());
    let result = SyncEngine::new(HashMap::new(), store, &config());
    assert!(result.is_err());
}

#[tokio::test]
async fn first_cycle_requests_full_listings_and_prunes() {
    let server = Arc::new(FakeServer::default());
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(vec![("dd", server.clone())], store.clone());

    engine.sync_once(&CancellationToken::new()).await.unwrap();

    let listings = server.listings();
    assert_eq!(listings.len(), 2);
    assert!(listings.iter().all(|opts| !opts.is_delta()));
    assert!(listings.iter().all(|opts| opts.limit == 500));
    // Both item types were pruned against the full enumeration.
    assert_eq!(store.prune_count(), 2);
}

#[tokio::test]
async fn later_cycles_request_deltas_and_skip_prune() {
    let server = Arc::new(FakeServer::default());
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(vec![("dd", server.clone())], store.clone());
    let token = CancellationToken::new();

    // First cycle is full and leaves a watermark behind (empty diff).
    engine.sync_once(&token).await.unwrap();
    engine.sync_once(&token).await.unwrap();

    let listings = server.listings();
    assert_eq!(listings.len(), 4);
    assert!(listings[2].is_delta());
    assert!(listings[3].is_delta());
    assert!(listings[2].limit == 25);
    // No prune after the delta cycle.
    assert_eq!(store.prune_count(), 2);
}

#[tokio::test]
async fn missing_watermark_forces_a_full_listing() {
    let server = Arc::new(FakeServer::default());
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(vec![("dd", server.clone())], store.clone());
    let token = CancellationToken::new();

    engine.sync_once(&token).await.unwrap();
    // Drop the watermarks as if the pair had never synced.
    store.watermarks.lock().unwrap().clear();
    engine.sync_once(&token).await.unwrap();

    let listings = server.listings();
    assert!(listings.iter().all(|opts| !opts.is_delta()));
}

#[tokio::test]
async fn watermark_advances_to_batch_minimum_minus_one() {
    let server = Arc::new(FakeServer::default());
    let store = Arc::new(FakeStore::default());
    store.set_stale("dd", ItemType::Movie, vec![stale("1", 2000), stale("2", 1000)]);
    let engine = engine_with(vec![("dd", server.clone())], store.clone());

    engine.sync_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        store.watermark("dd", ItemType::Movie).unwrap().timestamp(),
        999
    );
    assert_eq!(server.writes().len(), 2);
}

#[tokio::test]
async fn empty_diff_advances_watermark_to_now() {
    let server = Arc::new(FakeServer::default());
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(vec![("dd", server.clone())], store.clone());

    let before = Utc::now();
    engine.sync_once(&CancellationToken::new()).await.unwrap();

    let watermark = store.watermark("dd", ItemType::Movie).unwrap();
    assert!(watermark >= before - chrono::Duration::seconds(1));
}

#[tokio::test]
async fn failed_write_freezes_watermark_and_fails_the_cycle() {
    let server = Arc::new(FakeServer {
        fail_writes_for: HashSet::from(["2".to_string()]),
        ..Default::default()
    });
    let store = Arc::new(FakeStore::default());
    store.set_stale("dd", ItemType::Movie, vec![stale("1", 2000), stale("2", 1000)]);
    let engine = engine_with(vec![("dd", server.clone())], store.clone());

    let result = engine.sync_once(&CancellationToken::new()).await;
    assert!(result.is_err());

    // No movie watermark, while the untroubled episode pass advanced its own.
    assert!(store.watermark("dd", ItemType::Movie).is_none());
    assert!(store.watermark("dd", ItemType::Episode).is_some());

    // Only the successful write reached the changelog.
    let entries = store.changelog_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.local_id, "1");
}

#[tokio::test]
async fn write_propagates_remote_user_data() {
    let server = Arc::new(FakeServer::default());
    let store = Arc::new(FakeStore::default());
    let mut item = stale("1", 2000);
    item.is_favorite = true;
    store.set_stale("dd", ItemType::Movie, vec![item]);
    let engine = engine_with(vec![("dd", server.clone())], store.clone());

    engine.sync_once(&CancellationToken::new()).await.unwrap();

    let writes = server.writes();
    assert_eq!(writes.len(), 1);
    let (item_id, update) = &writes[0];
    assert_eq!(item_id, "1");
    assert_eq!(update.is_favorite, Some(true));
    assert_eq!(update.played_percentage, Some(0.5));
    assert!(update.played);
}

#[tokio::test]
async fn fetch_failure_skips_apply_phase_for_the_type() {
    let server = Arc::new(FakeServer {
        fail_listing: true,
        ..Default::default()
    });
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(vec![("dd", server.clone())], store.clone());

    let result = engine.sync_once(&CancellationToken::new()).await;
    assert!(result.is_err());
    assert!(store.stale_queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn server_failure_does_not_block_other_servers() {
    let healthy = Arc::new(FakeServer::default());
    let broken = Arc::new(FakeServer {
        fail_writes_for: HashSet::from(["1".to_string()]),
        ..Default::default()
    });
    let store = Arc::new(FakeStore::default());
    store.set_stale("dd", ItemType::Movie, vec![stale("1", 2000)]);
    store.set_stale("ez", ItemType::Movie, vec![stale("2", 3000)]);
    let engine = engine_with(
        vec![("dd", broken.clone()), ("ez", healthy.clone())],
        store.clone(),
    );

    let result = engine.sync_once(&CancellationToken::new()).await;
    assert!(result.is_err());

    // The healthy server still received its write and advanced its watermark.
    assert_eq!(healthy.writes().len(), 1);
    assert_eq!(
        store.watermark("ez", ItemType::Movie).unwrap().timestamp(),
        2999
    );
    assert!(store.watermark("dd", ItemType::Movie).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cycles_are_serialized() {
    let server = Arc::new(FakeServer {
        listing_delay: Some(Duration::from_millis(25)),
        ..Default::default()
    });
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(vec![("dd", server.clone())], store.clone());

    let token = CancellationToken::new();
    let first = {
        let engine = engine.clone();
        let token = token.clone();
        tokio::spawn(async move { engine.sync_once(&token).await })
    };
    let second = {
        let engine = engine.clone();
        let token = token.clone();
        tokio::spawn(async move { engine.sync_once(&token).await })
    };

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    // With a single configured server, overlapping cycles would be the only
    // source of concurrent listings.
    assert_eq!(server.max_concurrent.load(Ordering::SeqCst), 1);
    assert_eq!(server.listings().len(), 4);
}

#[tokio::test]
async fn event_burst_triggers_exactly_one_cycle() {
    let server = Arc::new(FakeServer::default());
    let store = Arc::new(FakeStore::default());
    let engine = engine_with(vec![("dd", server.clone())], store.clone());

    let (events_tx, events_rx) = mpsc::channel(2);
    let token = CancellationToken::new();
    let loop_handle = tokio::spawn(engine.clone().run(events_rx, token.clone()));

    // Startup cycle: one upsert per item type.
    {
        let store = store.clone();
        wait_until(move || store.listing_count() >= 2).await;
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    events_tx
        .send(SyncRequest {
            source: "webhook",
            metadata: "203.0.113.9".to_string(),
            reply: reply_tx,
        })
        .await
        .unwrap();
    assert_eq!(reply_rx.await.unwrap(), Ok(()));

    // Second event within the cooldown window is shed.
    let (reply_tx, reply_rx) = oneshot::channel();
    events_tx
        .send(SyncRequest {
            source: "webhook",
            metadata: "203.0.113.9".to_string(),
            reply: reply_tx,
        })
        .await
        .unwrap();
    assert_eq!(reply_rx.await.unwrap(), Err(SyncRejected::TooManyRequests));

    // Startup cycle + exactly one event-driven cycle.
    {
        let store = store.clone();
        wait_until(move || store.listing_count() >= 4).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.listing_count(), 4);

    token.cancel();
    loop_handle.await.unwrap();
}
