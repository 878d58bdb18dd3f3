//! SQLite-backed listing store.
//!
//! The table layout is shared with external tooling (stats queries), so column
//! names and the `(site, link)` uniqueness constraint are part of the contract.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use prsf_core::{
    parse_keywords, AutoRule, AutoRuleParams, Destination, Listing, ListingId, ListingState,
    MessageRef, RawListing, SavedSearch, SavedSearchParams,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};
use thiserror::Error;
use tracing::{debug, info};

pub const REQUIRED_TABLES: [&str; 6] = [
    "listings",
    "posts",
    "rejects",
    "saved_searches",
    "auto_rules",
    "moderation_cards",
];

const SCHEMA: [&str; 7] = [
    r#"
    CREATE TABLE IF NOT EXISTS listings (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      site TEXT NOT NULL,
      title TEXT NOT NULL DEFAULT '',
      payout TEXT NOT NULL DEFAULT '',
      date_posted TEXT NOT NULL DEFAULT '',
      location TEXT NOT NULL DEFAULT '',
      method TEXT NOT NULL DEFAULT '',
      link TEXT NOT NULL,
      description TEXT NOT NULL DEFAULT '',
      image_url TEXT NOT NULL DEFAULT '',
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL,
      UNIQUE(site, link)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS posts (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      listing_id INTEGER NOT NULL,
      channel_id TEXT NOT NULL,
      message_id TEXT NOT NULL,
      posted_at TEXT NOT NULL,
      FOREIGN KEY(listing_id) REFERENCES listings(id) ON DELETE CASCADE,
      UNIQUE(listing_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rejects (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      listing_id INTEGER,
      site TEXT NOT NULL,
      link TEXT NOT NULL,
      rejected_at TEXT NOT NULL,
      UNIQUE(site, link),
      FOREIGN KEY(listing_id) REFERENCES listings(id) ON DELETE SET NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS saved_searches (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      user_id TEXT NOT NULL,
      name TEXT NOT NULL,
      q TEXT,
      min_amount INTEGER,
      location TEXT,
      method TEXT,
      site TEXT,
      remote_only INTEGER NOT NULL DEFAULT 0,
      enabled INTEGER NOT NULL DEFAULT 1,
      created_at TEXT NOT NULL,
      UNIQUE(user_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS auto_rules (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      name TEXT NOT NULL,
      min_amount INTEGER,
      require_remote INTEGER NOT NULL DEFAULT 0,
      site_contains TEXT,
      method_contains TEXT,
      location_contains TEXT,
      channel_id TEXT,
      enabled INTEGER NOT NULL DEFAULT 1,
      created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS moderation_cards (
      listing_id INTEGER PRIMARY KEY,
      channel_id TEXT NOT NULL,
      message_id TEXT NOT NULL,
      created_at TEXT NOT NULL,
      FOREIGN KEY(listing_id) REFERENCES listings(id) ON DELETE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_rejects_site_link ON rejects(site, link)",
];

const PENDING_FILTER: &str = r#"
    NOT EXISTS (SELECT 1 FROM posts p WHERE p.listing_id = l.id)
    AND NOT EXISTS (SELECT 1 FROM rejects r WHERE r.site = l.site AND r.link = l.link)
"#;

const LISTING_COLUMNS: &str = "l.id, l.site, l.title, l.link, l.payout, l.date_posted, l.location, \
     l.method, l.description, l.image_url, l.created_at, l.updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opening listing store at {url}: {source}")]
    Open {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("listing store query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("listing {0} not found")]
    NotFound(ListingId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub new_count: usize,
    pub updated_count: usize,
    pub skipped: usize,
    pub pending_after: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub listings: i64,
    pub posts: i64,
    pub rejects: i64,
    pub pending: i64,
    pub moderation_cards: i64,
    pub saved_searches: i64,
    pub auto_rules: i64,
}

/// Operator correction of scraped fields; `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingPatch {
    pub title: Option<String>,
    pub payout: Option<String>,
    pub date_posted: Option<String>,
    pub location: Option<String>,
    pub method: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, FromRow)]
struct ListingRow {
    id: i64,
    site: String,
    title: String,
    link: String,
    payout: String,
    date_posted: String,
    location: String,
    method: String,
    description: String,
    image_url: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ListingRow> for Listing {
    fn from(row: ListingRow) -> Self {
        Listing {
            id: row.id,
            site: row.site,
            title: row.title,
            link: row.link,
            payout: row.payout,
            date_posted: row.date_posted,
            location: row.location,
            method: row.method,
            description: row.description,
            image_url: row.image_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct SavedSearchRow {
    id: i64,
    user_id: String,
    name: String,
    q: Option<String>,
    min_amount: Option<i64>,
    location: Option<String>,
    method: Option<String>,
    site: Option<String>,
    remote_only: bool,
    enabled: bool,
    created_at: DateTime<Utc>,
}

impl From<SavedSearchRow> for SavedSearch {
    fn from(row: SavedSearchRow) -> Self {
        SavedSearch {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            keywords: row.q.as_deref().map(parse_keywords).unwrap_or_default(),
            min_amount: row.min_amount,
            location: row.location,
            method: row.method,
            site: row.site,
            remote_only: row.remote_only,
            enabled: row.enabled,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct AutoRuleRow {
    id: i64,
    name: String,
    min_amount: Option<i64>,
    require_remote: bool,
    site_contains: Option<String>,
    method_contains: Option<String>,
    location_contains: Option<String>,
    channel_id: Option<String>,
    enabled: bool,
    created_at: DateTime<Utc>,
}

impl From<AutoRuleRow> for AutoRule {
    fn from(row: AutoRuleRow) -> Self {
        AutoRule {
            id: row.id,
            name: row.name,
            min_amount: row.min_amount,
            require_remote: row.require_remote,
            site_contains: row.site_contains,
            method_contains: row.method_contains,
            location_contains: row.location_contains,
            destination: row.channel_id.filter(|c| !c.is_empty()).map(Destination),
            enabled: row.enabled,
            created_at: row.created_at,
        }
    }
}

/// The only component allowed to issue queries against the durable store.
#[derive(Debug, Clone)]
pub struct ListingStore {
    pool: SqlitePool,
}

impl ListingStore {
    /// Opens (creating if needed) the store and applies the schema.
    ///
    /// This is the one fatal error of the core: callers decide what a process
    /// without a store should do.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let open_err = |source| StoreError::Open {
            url: database_url.to_string(),
            source,
        };
        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(open_err)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        // each in-memory connection is its own database, so pin the pool to one
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };
        let pool = pool_options.connect_with(options).await.map_err(open_err)?;

        let store = Self { pool };
        store.migrate().await.map_err(|e| match e {
            StoreError::Query(source) => open_err(source),
            other => other,
        })?;
        info!(url = database_url, "listing store ready");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts unseen `(site, link)` pairs and refreshes known ones.
    ///
    /// Each row commits on its own, so a failure mid-batch leaves earlier rows
    /// applied; re-running the same batch is safe.
    pub async fn upsert(&self, listings: &[RawListing]) -> Result<UpsertOutcome, StoreError> {
        let mut outcome = UpsertOutcome::default();
        for raw in listings {
            if !raw.has_natural_key() {
                outcome.skipped += 1;
                continue;
            }
            let raw = raw.clone().normalized();
            if self.upsert_one(&raw).await? {
                outcome.new_count += 1;
            } else {
                outcome.updated_count += 1;
            }
        }
        outcome.pending_after = self.pending_count().await?;
        debug!(
            new = outcome.new_count,
            updated = outcome.updated_count,
            skipped = outcome.skipped,
            pending = outcome.pending_after,
            "upsert complete"
        );
        Ok(outcome)
    }

    async fn upsert_one(&self, raw: &RawListing) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM listings WHERE site = ? AND link = ?")
            .bind(&raw.site)
            .bind(&raw.link)
            .fetch_optional(&mut *tx)
            .await?;

        let inserted = match existing {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE listings
                       SET title = ?, payout = ?, date_posted = ?, location = ?, method = ?,
                           description = ?, image_url = ?, updated_at = ?
                     WHERE id = ?
                    "#,
                )
                .bind(&raw.title)
                .bind(&raw.payout)
                .bind(&raw.date_posted)
                .bind(&raw.location)
                .bind(&raw.method)
                .bind(&raw.description)
                .bind(&raw.image_url)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                false
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO listings
                      (site, title, payout, date_posted, location, method, link, description,
                       image_url, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&raw.site)
                .bind(&raw.title)
                .bind(&raw.payout)
                .bind(&raw.date_posted)
                .bind(&raw.location)
                .bind(&raw.method)
                .bind(&raw.link)
                .bind(&raw.description)
                .bind(&raw.image_url)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                true
            }
        };
        tx.commit().await?;
        Ok(inserted)
    }

    /// Drops listings, posts and moderation cards for a fresh rescrape.
    ///
    /// Rejects survive (detached from their rows) so a rejected `(site, link)`
    /// stays hidden when the rescrape re-inserts it. Use [`Self::reset`] to wipe
    /// rejects too.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM moderation_cards").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM posts").execute(&mut *tx).await?;
        sqlx::query("UPDATE rejects SET listing_id = NULL").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM listings").execute(&mut *tx).await?;
        tx.commit().await?;
        info!("listing store cleared (rejects kept)");
        Ok(())
    }

    /// Full reset: [`Self::clear`] plus every reject record.
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.clear().await?;
        sqlx::query("DELETE FROM rejects").execute(&self.pool).await?;
        info!("listing store reset");
        Ok(())
    }

    pub async fn listing(&self, id: ListingId) -> Result<Option<Listing>, StoreError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings l WHERE l.id = ?");
        let row = sqlx::query_as::<_, ListingRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Listing::from))
    }

    pub async fn listing_by_key(&self, site: &str, link: &str) -> Result<Option<Listing>, StoreError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings l WHERE l.site = ? AND l.link = ?");
        let row = sqlx::query_as::<_, ListingRow>(&sql)
            .bind(site)
            .bind(link)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Listing::from))
    }

    pub async fn listing_state(&self, id: ListingId) -> Result<ListingState, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (SELECT 1 FROM posts p WHERE p.listing_id = l.id) AS posted,
                   EXISTS (SELECT 1 FROM rejects r WHERE r.site = l.site AND r.link = l.link) AS rejected
              FROM listings l
             WHERE l.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;
        let posted: i64 = row.try_get("posted")?;
        let rejected: i64 = row.try_get("rejected")?;
        Ok(if posted != 0 {
            ListingState::Posted
        } else if rejected != 0 {
            ListingState::Rejected
        } else {
            ListingState::Pending
        })
    }

    /// Records the one and only publication of a listing.
    ///
    /// Returns `false` without touching anything when the listing was already
    /// posted or its `(site, link)` is rejected. The listing's moderation card
    /// is cleared in the same transaction.
    pub async fn mark_posted(&self, id: ListingId, message: &MessageRef) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let key: Option<(String, String)> = sqlx::query_as("SELECT site, link FROM listings WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((site, link)) = key else {
            return Err(StoreError::NotFound(id));
        };
        let rejected: Option<i64> = sqlx::query_scalar("SELECT id FROM rejects WHERE site = ? AND link = ?")
            .bind(&site)
            .bind(&link)
            .fetch_optional(&mut *tx)
            .await?;
        if rejected.is_some() {
            debug!(listing_id = id, "refusing to post a rejected listing");
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            INSERT INTO posts (listing_id, channel_id, message_id, posted_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(listing_id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(message.destination.as_str())
        .bind(&message.message_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM moderation_cards WHERE listing_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    /// Records a permanent reject keyed by the listing's `(site, link)`.
    ///
    /// Returns `false` if that key was already rejected.
    pub async fn mark_rejected(&self, id: ListingId) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let key: Option<(String, String)> = sqlx::query_as("SELECT site, link FROM listings WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((site, link)) = key else {
            return Err(StoreError::NotFound(id));
        };
        let result = sqlx::query(
            r#"
            INSERT INTO rejects (listing_id, site, link, rejected_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(site, link) DO UPDATE SET listing_id = excluded.listing_id
             WHERE rejects.listing_id IS NULL
            "#,
        )
        .bind(id)
        .bind(&site)
        .bind(&link)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM moderation_cards WHERE listing_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn is_rejected(&self, site: &str, link: &str) -> Result<bool, StoreError> {
        let hit: Option<i64> = sqlx::query_scalar("SELECT id FROM rejects WHERE site = ? AND link = ?")
            .bind(site)
            .bind(link)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hit.is_some())
    }

    /// Listings with no post and no reject, newest first.
    pub async fn pending_listings(&self) -> Result<Vec<Listing>, StoreError> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings l WHERE {PENDING_FILTER} ORDER BY l.id DESC"
        );
        let rows = sqlx::query_as::<_, ListingRow>(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Listing::from).collect())
    }

    pub async fn pending_count(&self) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM listings l WHERE {PENDING_FILTER}");
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }

    /// Pending listings that have not been put in front of moderators yet.
    pub async fn unannounced_pending(&self) -> Result<Vec<Listing>, StoreError> {
        let sql = format!(
            r#"
            SELECT {LISTING_COLUMNS}
              FROM listings l
             WHERE {PENDING_FILTER}
               AND NOT EXISTS (SELECT 1 FROM moderation_cards m WHERE m.listing_id = l.id)
             ORDER BY l.id DESC
            "#
        );
        let rows = sqlx::query_as::<_, ListingRow>(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Listing::from).collect())
    }

    pub async fn mark_announced(&self, id: ListingId, card: &MessageRef) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO moderation_cards (listing_id, channel_id, message_id, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(listing_id) DO UPDATE
               SET channel_id = excluded.channel_id, message_id = excluded.message_id
            "#,
        )
        .bind(id)
        .bind(card.destination.as_str())
        .bind(&card.message_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn moderation_card(&self, id: ListingId) -> Result<Option<MessageRef>, StoreError> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT channel_id, message_id FROM moderation_cards WHERE listing_id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(channel_id, message_id)| MessageRef {
            destination: Destination(channel_id),
            message_id,
        }))
    }

    pub async fn clear_moderation_card(&self, id: ListingId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM moderation_cards WHERE listing_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_listing_fields(&self, id: ListingId, patch: &ListingPatch) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET title = COALESCE(?, title),
                   payout = COALESCE(?, payout),
                   date_posted = COALESCE(?, date_posted),
                   location = COALESCE(?, location),
                   method = COALESCE(?, method),
                   description = COALESCE(?, description),
                   image_url = COALESCE(?, image_url),
                   updated_at = ?
             WHERE id = ?
            "#,
        )
        .bind(&patch.title)
        .bind(&patch.payout)
        .bind(&patch.date_posted)
        .bind(&patch.location)
        .bind(&patch.method)
        .bind(&patch.description)
        .bind(&patch.image_url)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    // ---- saved searches ----

    /// Creates or replaces the user's search of that name; always re-enables it.
    pub async fn add_saved_search(
        &self,
        user_id: &str,
        name: &str,
        params: &SavedSearchParams,
    ) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO saved_searches
              (user_id, name, q, min_amount, location, method, site, remote_only, enabled, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(user_id, name) DO UPDATE SET
              q = excluded.q, min_amount = excluded.min_amount, location = excluded.location,
              method = excluded.method, site = excluded.site, remote_only = excluded.remote_only,
              enabled = 1
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(name)
        .bind(&params.query)
        .bind(params.min_amount)
        .bind(&params.location)
        .bind(&params.method)
        .bind(&params.site)
        .bind(params.remote_only)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list_saved_searches(&self, user_id: &str) -> Result<Vec<SavedSearch>, StoreError> {
        let rows = sqlx::query_as::<_, SavedSearchRow>(
            "SELECT * FROM saved_searches WHERE user_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SavedSearch::from).collect())
    }

    pub async fn enabled_saved_searches(&self) -> Result<Vec<SavedSearch>, StoreError> {
        let rows = sqlx::query_as::<_, SavedSearchRow>(
            "SELECT * FROM saved_searches WHERE enabled = 1 ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SavedSearch::from).collect())
    }

    /// Deletes only when the search belongs to `user_id`.
    pub async fn delete_saved_search(&self, user_id: &str, search_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM saved_searches WHERE user_id = ? AND id = ?")
            .bind(user_id)
            .bind(search_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- auto rules ----

    pub async fn add_rule(&self, name: &str, params: &AutoRuleParams) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO auto_rules
              (name, min_amount, require_remote, site_contains, method_contains, location_contains,
               channel_id, enabled, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(params.min_amount)
        .bind(params.require_remote)
        .bind(&params.site_contains)
        .bind(&params.method_contains)
        .bind(&params.location_contains)
        .bind(params.destination.as_ref().map(Destination::as_str))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Rules in evaluation order (creation id ascending).
    pub async fn list_rules(&self, enabled_only: bool) -> Result<Vec<AutoRule>, StoreError> {
        let sql = if enabled_only {
            "SELECT * FROM auto_rules WHERE enabled = 1 ORDER BY id ASC"
        } else {
            "SELECT * FROM auto_rules ORDER BY id ASC"
        };
        let rows = sqlx::query_as::<_, AutoRuleRow>(sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(AutoRule::from).collect())
    }

    pub async fn toggle_rule(&self, rule_id: i64, enabled: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE auto_rules SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_rule(&self, rule_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM auto_rules WHERE id = ?")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- stats ----

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let count = |table: &'static str| {
            let pool = self.pool.clone();
            async move {
                sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
                    .fetch_one(&pool)
                    .await
            }
        };
        Ok(StoreStats {
            listings: count("listings").await?,
            posts: count("posts").await?,
            rejects: count("rejects").await?,
            pending: self.pending_count().await?,
            moderation_cards: count("moderation_cards").await?,
            saved_searches: count("saved_searches").await?,
            auto_rules: count("auto_rules").await?,
        })
    }

    /// Names of required tables missing from the database.
    pub async fn schema_check(&self) -> Result<Vec<String>, StoreError> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&self.pool)
                .await?;
        Ok(REQUIRED_TABLES
            .iter()
            .filter(|t| !names.iter().any(|n| n == *t))
            .map(|t| t.to_string())
            .collect())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
