use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

use jellyporter_models::{Item, ItemType, UserDataUpdate};

use crate::migrations::{latest_version, MIGRATIONS};

const METRIC_QUERY_TIME: &str = "jellyporter_database_queries_time_total";
const METRIC_QUERY_ERRORS: &str = "jellyporter_database_query_errors_total";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not open database: {0}")]
    Open(#[source] sqlx::Error),
    #[error("query {query} failed: {source}")]
    Query {
        query: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("migration to version {version} failed: {source}")]
    Migration {
        version: i64,
        #[source]
        source: sqlx::Error,
    },
    #[error("prune timestamp must be after the epoch")]
    ZeroPruneTimestamp,
}

/// A row produced by the staleness diff: the target server's `local_id`
/// joined with the winning remote server's user-data.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StaleItem {
    pub local_id: String,
    pub name: String,
    pub series_name: Option<String>,
    pub watched_date: i64,
    pub watched_progress: f64,
    pub watched_position_ticks: i64,
    pub is_favorite: bool,
}

impl StaleItem {
    /// The write body propagating this row's user-data to the target server.
    pub fn as_user_data(&self) -> UserDataUpdate {
        UserDataUpdate {
            is_favorite: Some(self.is_favorite),
            playback_position_ticks: Some(self.watched_position_ticks),
            played_percentage: Some(self.watched_progress),
            play_count: 0,
            last_played_date: DateTime::from_timestamp(self.watched_date, 0).unwrap_or_default(),
            played: true,
        }
    }
}

/// One remote write that succeeded, recorded for the audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangelogEntry {
    pub local_id: String,
    pub new_watched_date: i64,
    pub new_watched_progress: f64,
    pub new_watched_position_ticks: i64,
    pub new_is_favorite: bool,
}

impl From<&StaleItem> for ChangelogEntry {
    fn from(item: &StaleItem) -> Self {
        Self {
            local_id: item.local_id.clone(),
            new_watched_date: item.watched_date,
            new_watched_progress: item.watched_progress,
            new_watched_position_ticks: item.watched_position_ticks,
            new_is_favorite: item.is_favorite,
        }
    }
}

/// The capability set the reconciliation engine needs from its local store.
#[async_trait]
pub trait LibraryStore: Send + Sync {
    /// Replace the snapshot rows for `items` on `server` in one transaction.
    async fn upsert_items(
        &self,
        server: &str,
        item_type: ItemType,
        items: &[Item],
    ) -> Result<(), StoreError>;

    /// Delete rows for `server` whose `last_seen` predates `since`.
    async fn prune_items_not_seen_since(
        &self,
        server: &str,
        item_type: ItemType,
        since: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Rows on `server` whose user-data is older than some other server's
    /// copy of the same logical item.
    async fn items_with_newer_remote_user_data(
        &self,
        server: &str,
        item_type: ItemType,
    ) -> Result<Vec<StaleItem>, StoreError>;

    async fn insert_changelog(&self, server: &str, entry: ChangelogEntry)
        -> Result<(), StoreError>;

    /// The last-sync watermark for `(server, item_type)`, the epoch when the
    /// pair has never completed a cycle.
    async fn last_sync(&self, server: &str, item_type: ItemType)
        -> Result<DateTime<Utc>, StoreError>;

    async fn upsert_last_sync(
        &self,
        server: &str,
        item_type: ItemType,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

const INSERT_MOVIE: &str = r#"
INSERT INTO movies (server, local_id, name, imdb_id, tmdb_id, runtime,
                    watched_date, watched_progress, watched_position_ticks,
                    is_favorite, last_seen)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
ON CONFLICT (server, local_id) DO UPDATE SET
    name = excluded.name,
    imdb_id = excluded.imdb_id,
    tmdb_id = excluded.tmdb_id,
    runtime = excluded.runtime,
    watched_date = excluded.watched_date,
    watched_progress = excluded.watched_progress,
    watched_position_ticks = excluded.watched_position_ticks,
    is_favorite = excluded.is_favorite,
    last_seen = excluded.last_seen
"#;

const INSERT_EPISODE: &str = r#"
INSERT INTO episodes (server, local_id, name, series_name, season_name,
                      imdb_id, tmdb_id, tvdb_id, runtime, watched_date,
                      watched_progress, watched_position_ticks, is_favorite,
                      last_seen)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
ON CONFLICT (server, local_id) DO UPDATE SET
    name = excluded.name,
    series_name = excluded.series_name,
    season_name = excluded.season_name,
    imdb_id = excluded.imdb_id,
    tmdb_id = excluded.tmdb_id,
    tvdb_id = excluded.tvdb_id,
    runtime = excluded.runtime,
    watched_date = excluded.watched_date,
    watched_progress = excluded.watched_progress,
    watched_position_ticks = excluded.watched_position_ticks,
    is_favorite = excluded.is_favorite,
    last_seen = excluded.last_seen
"#;

// The staleness diff. Rows are keyed across servers by provider identity
// (imdb over tmdb, then a name+runtime fallback); for every key the newest
// remote playback wins, with a (server, local_id) tiebreak so equal
// timestamps resolve the same way on every run. A strict comparison against
// the target's own watched_date keeps already-current rows out of the result.
const MOVIES_WITH_NEWER_USER_DATA: &str = r#"
WITH keyed AS (
    SELECT server, local_id, name, watched_date, watched_progress,
           watched_position_ticks, is_favorite,
           CASE
               WHEN imdb_id IS NOT NULL THEN 'imdb_' || imdb_id
               WHEN tmdb_id IS NOT NULL THEN 'tmdb_' || tmdb_id
               ELSE 'name_' || name || '_' || runtime
           END AS match_key
    FROM movies
),
newest_remote AS (
    SELECT match_key, name, watched_date, watched_progress,
           watched_position_ticks, is_favorite,
           ROW_NUMBER() OVER (
               PARTITION BY match_key
               ORDER BY watched_date DESC, server, local_id
           ) AS rank
    FROM keyed
    WHERE server <> ?1 AND watched_date > 0
)
SELECT local.local_id AS local_id,
       remote.name AS name,
       NULL AS series_name,
       remote.watched_date AS watched_date,
       remote.watched_progress AS watched_progress,
       remote.watched_position_ticks AS watched_position_ticks,
       remote.is_favorite AS is_favorite
FROM keyed AS local
JOIN newest_remote AS remote
  ON remote.match_key = local.match_key AND remote.rank = 1
WHERE local.server = ?1
  AND remote.watched_date > COALESCE(local.watched_date, 0)
ORDER BY local.local_id
"#;

const EPISODES_WITH_NEWER_USER_DATA: &str = r#"
WITH keyed AS (
    SELECT server, local_id, name, series_name, watched_date,
           watched_progress, watched_position_ticks, is_favorite,
           CASE
               WHEN imdb_id IS NOT NULL THEN 'imdb_' || imdb_id
               WHEN tmdb_id IS NOT NULL THEN 'tmdb_' || tmdb_id
               WHEN tvdb_id IS NOT NULL THEN 'tvdb_' || tvdb_id
               ELSE 'name_' || name || '_' || series_name || '_' || season_name || '_' || runtime
           END AS match_key
    FROM episodes
),
newest_remote AS (
    SELECT match_key, name, series_name, watched_date, watched_progress,
           watched_position_ticks, is_favorite,
           ROW_NUMBER() OVER (
               PARTITION BY match_key
               ORDER BY watched_date DESC, server, local_id
           ) AS rank
    FROM keyed
    WHERE server <> ?1 AND watched_date > 0
)
SELECT local.local_id AS local_id,
       remote.name AS name,
       remote.series_name AS series_name,
       remote.watched_date AS watched_date,
       remote.watched_progress AS watched_progress,
       remote.watched_position_ticks AS watched_position_ticks,
       remote.is_favorite AS is_favorite
FROM keyed AS local
JOIN newest_remote AS remote
  ON remote.match_key = local.match_key AND remote.rank = 1
WHERE local.server = ?1
  AND remote.watched_date > COALESCE(local.watched_date, 0)
ORDER BY local.local_id
"#;

/// SQLite-backed reconciliation store.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date. An empty path opens a private in-memory database.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        let in_memory = path.as_os_str().is_empty();

        let options = if in_memory {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StoreError::Open(sqlx::Error::Io(e)))?;
                }
            }
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        }
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

        // An in-memory database is private per connection, so the pool must
        // never hand out a second one.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StoreError::Open)?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Apply every embedded migration newer than the recorded schema version,
    /// one transaction per step.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        // A fresh database has no schema_version table yet; treat any read
        // failure as version 0.
        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
            .unwrap_or(0);

        info!(
            current_version = current,
            latest_version = latest_version(),
            "Checked DB schema version"
        );

        for (idx, sql) in MIGRATIONS.iter().enumerate() {
            let version = idx as i64 + 1;
            if version <= current {
                continue;
            }

            let step = |source| StoreError::Migration { version, source };

            let mut tx = self.pool.begin().await.map_err(step)?;
            sqlx::raw_sql(sql).execute(&mut *tx).await.map_err(step)?;
            sqlx::query("DELETE FROM schema_version")
                .execute(&mut *tx)
                .await
                .map_err(step)?;
            sqlx::query("INSERT INTO schema_version (version) VALUES (?1)")
                .bind(version)
                .execute(&mut *tx)
                .await
                .map_err(step)?;
            tx.commit().await.map_err(step)?;

            info!(version, "Migrated DB schema");
        }

        Ok(())
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(&self.pool)
            .await
            .map_err(|source| StoreError::Query {
                query: "get_schema_version",
                source,
            })
    }

    async fn upsert_movies(&self, server: &str, items: &[Item]) -> Result<(), StoreError> {
        const QUERY: &str = "insert_movies";
        let start = Instant::now();
        let last_seen = Utc::now().timestamp();

        let result: Result<(), sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            for item in items {
                sqlx::query(INSERT_MOVIE)
                    .bind(server)
                    .bind(&item.id)
                    .bind(&item.name)
                    .bind(sanitize_provider_id(item.provider_ids.imdb.as_deref()))
                    .bind(sanitize_provider_id(item.provider_ids.tmdb.as_deref()))
                    .bind(item.runtime)
                    .bind(item.user_data.watched_date_unix())
                    .bind(item.user_data.played_percentage)
                    .bind(item.user_data.playback_position_ticks)
                    .bind(item.user_data.is_favorite)
                    .bind(last_seen)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        }
        .await;

        track(QUERY, start, result)
    }

    async fn upsert_episodes(&self, server: &str, items: &[Item]) -> Result<(), StoreError> {
        const QUERY: &str = "insert_episodes";
        let start = Instant::now();
        let last_seen = Utc::now().timestamp();

        let result: Result<(), sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            for item in items {
                sqlx::query(INSERT_EPISODE)
                    .bind(server)
                    .bind(&item.id)
                    .bind(&item.name)
                    .bind(&item.series_name)
                    .bind(&item.season_name)
                    .bind(sanitize_provider_id(item.provider_ids.imdb.as_deref()))
                    .bind(sanitize_provider_id(item.provider_ids.tmdb.as_deref()))
                    .bind(sanitize_provider_id(item.provider_ids.tvdb.as_deref()))
                    .bind(item.runtime)
                    .bind(item.user_data.watched_date_unix())
                    .bind(item.user_data.played_percentage)
                    .bind(item.user_data.playback_position_ticks)
                    .bind(item.user_data.is_favorite)
                    .bind(last_seen)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        }
        .await;

        track(QUERY, start, result)
    }
}

#[async_trait]
impl LibraryStore for Store {
    async fn upsert_items(
        &self,
        server: &str,
        item_type: ItemType,
        items: &[Item],
    ) -> Result<(), StoreError> {
        match item_type {
            ItemType::Movie => self.upsert_movies(server, items).await,
            ItemType::Episode => self.upsert_episodes(server, items).await,
        }
    }

    async fn prune_items_not_seen_since(
        &self,
        server: &str,
        item_type: ItemType,
        since: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if since.timestamp() <= 0 {
            return Err(StoreError::ZeroPruneTimestamp);
        }

        let (query, sql): (&'static str, &str) = match item_type {
            ItemType::Movie => (
                "remove_movies_not_seen_since",
                "DELETE FROM movies WHERE server = ?1 AND last_seen < ?2",
            ),
            ItemType::Episode => (
                "remove_episodes_not_seen_since",
                "DELETE FROM episodes WHERE server = ?1 AND last_seen < ?2",
            ),
        };

        info!(
            server,
            r#type = %item_type,
            not_seen_since = since.timestamp(),
            "Deleting items not seen since {}",
            since.format("%Y-%m-%d %H:%M:%S")
        );

        let start = Instant::now();
        let result = sqlx::query(sql)
            .bind(server)
            .bind(since.timestamp())
            .execute(&self.pool)
            .await
            .map(|_| ());
        track(query, start, result)
    }

    async fn items_with_newer_remote_user_data(
        &self,
        server: &str,
        item_type: ItemType,
    ) -> Result<Vec<StaleItem>, StoreError> {
        let (query, sql): (&'static str, &str) = match item_type {
            ItemType::Movie => ("movies_with_newer_user_data", MOVIES_WITH_NEWER_USER_DATA),
            ItemType::Episode => (
                "episodes_with_newer_user_data",
                EPISODES_WITH_NEWER_USER_DATA,
            ),
        };

        let start = Instant::now();
        let result = sqlx::query_as::<_, StaleItem>(sql)
            .bind(server)
            .fetch_all(&self.pool)
            .await;
        track(query, start, result)
    }

    async fn insert_changelog(
        &self,
        server: &str,
        entry: ChangelogEntry,
    ) -> Result<(), StoreError> {
        const QUERY: &str = "insert_changelog";
        let start = Instant::now();

        let result = sqlx::query(
            r#"INSERT INTO changelog (server, local_id, event_date, new_watched_date,
                                      new_watched_progress, new_watched_position_ticks,
                                      new_is_favorite)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
        )
        .bind(server)
        .bind(&entry.local_id)
        .bind(Utc::now().timestamp())
        .bind(entry.new_watched_date)
        .bind(entry.new_watched_progress)
        .bind(entry.new_watched_position_ticks)
        .bind(entry.new_is_favorite)
        .execute(&self.pool)
        .await
        .map(|_| ());
        track(QUERY, start, result)
    }

    async fn last_sync(
        &self,
        server: &str,
        item_type: ItemType,
    ) -> Result<DateTime<Utc>, StoreError> {
        const QUERY: &str = "get_last_sync";
        let start = Instant::now();

        let result = sqlx::query_scalar::<_, i64>(
            "SELECT last_sync FROM state WHERE server = ?1 AND type = ?2",
        )
        .bind(server)
        .bind(item_type.as_str())
        .fetch_optional(&self.pool)
        .await;

        let secs = track(QUERY, start, result)?.unwrap_or(0);
        Ok(DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH))
    }

    async fn upsert_last_sync(
        &self,
        server: &str,
        item_type: ItemType,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        const QUERY: &str = "upsert_last_sync";
        let start = Instant::now();

        let result = sqlx::query(
            r#"INSERT INTO state (server, type, last_sync) VALUES (?1, ?2, ?3)
               ON CONFLICT (server, type) DO UPDATE SET last_sync = excluded.last_sync"#,
        )
        .bind(server)
        .bind(item_type.as_str())
        .bind(ts.timestamp())
        .execute(&self.pool)
        .await
        .map(|_| ());
        track(QUERY, start, result)
    }
}

fn track<T>(
    query: &'static str,
    start: Instant,
    result: Result<T, sqlx::Error>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            histogram!(METRIC_QUERY_TIME, "query" => query)
                .record(start.elapsed().as_secs_f64());
            Ok(value)
        }
        Err(source) => {
            counter!(METRIC_QUERY_ERRORS, "query" => query).increment(1);
            Err(StoreError::Query { query, source })
        }
    }
}

/// Reduce a provider id string to a numeric id. Only decimal digits and a
/// leading minus survive; an empty result, a bare "-" or a zero value yields
/// no id so the match key falls through to the next tier.
fn sanitize_provider_id(input: Option<&str>) -> Option<i64> {
    let filtered: String = input?
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-')
        .collect();

    if filtered.is_empty() || filtered == "-" {
        return None;
    }

    filtered.parse::<i64>().ok().filter(|id| *id != 0)
}
