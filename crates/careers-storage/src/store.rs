//! SQLite-backed career ledger.
//!
//! The pipeline owns the enrichment columns; the review UI owns the review
//! columns and images. Neither side writes the other's fields.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use careers_core::{
    pageview_bucket, qid_sort_key, Career, Category, DiscoveredCareer, EnrichmentStatus,
    PageviewSummary, ParseEnumError, ReviewStatus,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};

const CAREER_COLUMNS: &str = "id, name, category, source_url, resolved_title, pageview_total, \
     pageview_daily_avg, pageview_days, pageviews_updated_at, enrichment_status, \
     enrichment_attempts, last_error, review_status, reviewed_by, reviewed_at, notes, \
     created_at, updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("applying migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row {id}: {source}")]
    CorruptRow {
        id: String,
        #[source]
        source: ParseEnumError,
    },
    #[error("career {0} not found")]
    NotFound(String),
    #[error("enrichment status cannot move from {from} to {to}")]
    IllegalTransition {
        from: EnrichmentStatus,
        to: EnrichmentStatus,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerStats {
    pub total_careers: i64,
    pub with_pageviews: i64,
    pub total_views: i64,
    pub by_enrichment_status: BTreeMap<EnrichmentStatus, i64>,
    pub by_category: BTreeMap<Category, i64>,
    pub by_review_status: BTreeMap<ReviewStatus, i64>,
    pub top_career: Option<(String, f64)>,
}

impl LedgerStats {
    pub fn count_for(&self, status: EnrichmentStatus) -> i64 {
        self.by_enrichment_status.get(&status).copied().unwrap_or(0)
    }

    /// Entities a `resume` would pick up.
    pub fn resumable(&self) -> i64 {
        self.count_for(EnrichmentStatus::Pending)
            + self.count_for(EnrichmentStatus::InProgress)
            + self.count_for(EnrichmentStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Wikipedia,
    Openverse,
}

impl ImageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageSource::Wikipedia => "wikipedia",
            ImageSource::Openverse => "openverse",
        }
    }
}

impl FromStr for ImageSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wikipedia" => Ok(ImageSource::Wikipedia),
            "openverse" => Ok(ImageSource::Openverse),
            other => Err(ParseEnumError {
                kind: "image source",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCareerImage {
    pub image_url: String,
    pub caption: Option<String>,
    pub position: i64,
    pub is_replacement: bool,
    pub source: ImageSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CareerImage {
    pub id: i64,
    pub career_id: String,
    pub image_url: String,
    pub caption: Option<String>,
    pub position: i64,
    pub is_replacement: bool,
    pub source: ImageSource,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CareerStore {
    pool: SqlitePool,
}

impl CareerStore {
    /// Connect to a `sqlite://` URL, creating the file if needed, and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect_with(options).await
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::connect_with(SqliteConnectOptions::new().filename(path.as_ref())).await
    }

    /// Open an existing ledger for reporting. Never creates the file and
    /// never migrates; a missing database is an error.
    pub async fn connect_read_only(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect_read_only_with(options).await
    }

    pub async fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::connect_read_only_with(SqliteConnectOptions::new().filename(path.as_ref())).await
    }

    async fn connect_read_only_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(false)
            .read_only(true)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Idempotent by id. New rows start pending/unreviewed; existing rows only
    /// have their descriptive fields refreshed, and only when they changed.
    pub async fn upsert_careers(
        &self,
        careers: &[DiscoveredCareer],
    ) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut outcome = UpsertOutcome::default();
        let mut tx = self.pool.begin().await?;

        for career in careers {
            let existing =
                sqlx::query("SELECT name, category, source_url FROM careers WHERE id = ?")
                    .bind(&career.id)
                    .fetch_optional(&mut *tx)
                    .await?;

            match existing {
                None => {
                    sqlx::query(
                        "INSERT INTO careers (id, name, category, source_url, enrichment_status, \
                         review_status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&career.id)
                    .bind(&career.name)
                    .bind(career.category.as_str())
                    .bind(&career.source_url)
                    .bind(EnrichmentStatus::Pending.as_str())
                    .bind(ReviewStatus::Unreviewed.as_str())
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    outcome.inserted += 1;
                }
                Some(row) => {
                    let name: String = row.try_get("name")?;
                    let category: String = row.try_get("category")?;
                    let source_url: String = row.try_get("source_url")?;
                    if name == career.name
                        && category == career.category.as_str()
                        && source_url == career.source_url
                    {
                        outcome.unchanged += 1;
                        continue;
                    }
                    sqlx::query(
                        "UPDATE careers SET name = ?, category = ?, source_url = ?, updated_at = ? \
                         WHERE id = ?",
                    )
                    .bind(&career.name)
                    .bind(career.category.as_str())
                    .bind(&career.source_url)
                    .bind(now)
                    .bind(&career.id)
                    .execute(&mut *tx)
                    .await?;
                    outcome.updated += 1;
                }
            }
        }

        tx.commit().await?;
        info!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            "upserted discovered careers"
        );
        Ok(outcome)
    }

    /// Clear markers left behind by a run that died mid-enrichment.
    pub async fn reset_stale_in_progress(&self) -> Result<u64, StoreError> {
        self.transition_all(EnrichmentStatus::InProgress, EnrichmentStatus::Pending).await
    }

    pub async fn requeue_failed(&self) -> Result<u64, StoreError> {
        self.transition_all(EnrichmentStatus::Failed, EnrichmentStatus::Pending).await
    }

    /// Move every row in `from` to `to`. Only ledger edges are accepted.
    pub async fn transition_all(
        &self,
        from: EnrichmentStatus,
        to: EnrichmentStatus,
    ) -> Result<u64, StoreError> {
        ensure_transition(from, to)?;
        let result =
            sqlx::query("UPDATE careers SET enrichment_status = ? WHERE enrichment_status = ?")
                .bind(to.as_str())
                .bind(from.as_str())
                .execute(&self.pool)
                .await?;
        debug!(%from, %to, rows = result.rows_affected(), "bulk status transition");
        Ok(result.rows_affected())
    }

    /// Move pending rows (lowest ids first, compared numerically) to
    /// in_progress and return them.
    pub async fn claim_pending(&self, limit: Option<usize>) -> Result<Vec<Career>, StoreError> {
        ensure_transition(EnrichmentStatus::Pending, EnrichmentStatus::InProgress)?;
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let sql = format!(
            "UPDATE careers SET enrichment_status = ?, \
             enrichment_attempts = enrichment_attempts + 1 \
             WHERE id IN (SELECT id FROM careers WHERE enrichment_status = ? \
             ORDER BY length(id), id LIMIT ?) \
             RETURNING {CAREER_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(EnrichmentStatus::InProgress.as_str())
            .bind(EnrichmentStatus::Pending.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        let mut careers = rows
            .iter()
            .map(career_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        careers.sort_by(|a, b| qid_sort_key(&a.id).cmp(&qid_sort_key(&b.id)));
        debug!(claimed = careers.len(), "claimed pending careers");
        Ok(careers)
    }

    /// in_progress -> complete. Returns false when the row was not in_progress.
    pub async fn record_pageviews(
        &self,
        id: &str,
        resolved_title: &str,
        summary: &PageviewSummary,
    ) -> Result<bool, StoreError> {
        ensure_transition(EnrichmentStatus::InProgress, EnrichmentStatus::Complete)?;
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE careers SET resolved_title = ?, pageview_total = ?, \
             pageview_daily_avg = ?, pageview_days = ?, pageviews_updated_at = ?, \
             enrichment_status = ?, last_error = NULL, updated_at = ? \
             WHERE id = ? AND enrichment_status = ?",
        )
        .bind(resolved_title)
        .bind(summary.total as i64)
        .bind(summary.daily_avg)
        .bind(i64::from(summary.days_covered))
        .bind(now)
        .bind(EnrichmentStatus::Complete.as_str())
        .bind(now)
        .bind(id)
        .bind(EnrichmentStatus::InProgress.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// in_progress -> failed, keeping the error text for the operator.
    pub async fn record_failure(&self, id: &str, error: &str) -> Result<bool, StoreError> {
        ensure_transition(EnrichmentStatus::InProgress, EnrichmentStatus::Failed)?;
        let result = sqlx::query(
            "UPDATE careers SET enrichment_status = ?, last_error = ?, updated_at = ? \
             WHERE id = ? AND enrichment_status = ?",
        )
        .bind(EnrichmentStatus::Failed.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .bind(EnrichmentStatus::InProgress.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Career>, StoreError> {
        let sql = format!("SELECT {CAREER_COLUMNS} FROM careers WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(career_from_row).transpose()
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM careers")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Ranked by daily average, highest first; never-enriched rows sink to the bottom.
    pub async fn top(&self, n: usize) -> Result<Vec<Career>, StoreError> {
        let sql = format!(
            "SELECT {CAREER_COLUMNS} FROM careers \
             ORDER BY COALESCE(pageview_daily_avg, -1) DESC, name ASC, id ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(n as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(career_from_row).collect()
    }

    /// Every career grouped by traffic bucket, alphabetical within a bucket.
    pub async fn all_ranked(&self) -> Result<Vec<Career>, StoreError> {
        let sql = format!("SELECT {CAREER_COLUMNS} FROM careers");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut careers = rows
            .iter()
            .map(career_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        sort_by_bucket(&mut careers);
        Ok(careers)
    }

    /// The `limit` most viewed careers with the given review status, grouped
    /// by traffic bucket and alphabetical within a bucket.
    pub async fn by_review_status(
        &self,
        status: ReviewStatus,
        limit: usize,
    ) -> Result<Vec<Career>, StoreError> {
        self.ranked_where("review_status", status.as_str(), limit).await
    }

    pub async fn by_enrichment_status(
        &self,
        status: EnrichmentStatus,
        limit: usize,
    ) -> Result<Vec<Career>, StoreError> {
        self.ranked_where("enrichment_status", status.as_str(), limit).await
    }

    async fn ranked_where(
        &self,
        column: &'static str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<Career>, StoreError> {
        let sql = format!(
            "SELECT {CAREER_COLUMNS} FROM careers WHERE {column} = ? \
             ORDER BY COALESCE(pageview_daily_avg, -1) DESC, name ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(value)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        let mut careers = rows
            .iter()
            .map(career_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        sort_by_bucket(&mut careers);
        Ok(careers)
    }

    pub async fn search(&self, term: &str, limit: usize) -> Result<Vec<Career>, StoreError> {
        let pattern = format!("%{}%", term.trim().to_lowercase());
        let sql = format!(
            "SELECT {CAREER_COLUMNS} FROM careers WHERE lower(name) LIKE ? \
             ORDER BY COALESCE(pageview_daily_avg, -1) DESC, name ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(pattern)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(career_from_row).collect()
    }

    /// Read-only ledger report.
    pub async fn stats(&self) -> Result<LedgerStats, StoreError> {
        let mut stats = LedgerStats {
            total_careers: self.count().await?,
            with_pageviews: sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM careers WHERE pageviews_updated_at IS NOT NULL",
            )
            .fetch_one(&self.pool)
            .await?,
            total_views: sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(SUM(pageview_total), 0) FROM careers",
            )
            .fetch_one(&self.pool)
            .await?,
            ..LedgerStats::default()
        };

        for status in EnrichmentStatus::ALL {
            stats.by_enrichment_status.insert(status, 0);
        }
        for (key, count) in self.grouped_counts("enrichment_status").await? {
            let status = parse_column::<EnrichmentStatus>("enrichment_status", &key)?;
            stats.by_enrichment_status.insert(status, count);
        }
        for (key, count) in self.grouped_counts("category").await? {
            stats
                .by_category
                .insert(parse_column::<Category>("category", &key)?, count);
        }
        for (key, count) in self.grouped_counts("review_status").await? {
            stats
                .by_review_status
                .insert(parse_column::<ReviewStatus>("review_status", &key)?, count);
        }

        let top = sqlx::query(
            "SELECT name, pageview_daily_avg FROM careers WHERE pageview_daily_avg IS NOT NULL \
             ORDER BY pageview_daily_avg DESC, name ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = top {
            stats.top_career = Some((row.try_get("name")?, row.try_get("pageview_daily_avg")?));
        }

        Ok(stats)
    }

    async fn grouped_counts(
        &self,
        column: &'static str,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let sql = format!("SELECT {column} AS key, COUNT(*) AS n FROM careers GROUP BY {column}");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<(String, i64), StoreError> {
                Ok((row.try_get("key")?, row.try_get("n")?))
            })
            .collect()
    }

    /// Reviewer decision from the review UI. `notes` is left as-is when `None`.
    pub async fn update_review(
        &self,
        id: &str,
        status: ReviewStatus,
        reviewed_by: Option<&str>,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE careers SET review_status = ?, reviewed_by = ?, reviewed_at = ?, \
             notes = COALESCE(?, notes) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(reviewed_by)
        .bind(Utc::now())
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn add_image(
        &self,
        career_id: &str,
        image: &NewCareerImage,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO career_images (career_id, image_url, caption, position, is_replacement, \
             source, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(career_id)
        .bind(&image.image_url)
        .bind(&image.caption)
        .bind(image.position)
        .bind(image.is_replacement)
        .bind(image.source.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn images_for(&self, career_id: &str) -> Result<Vec<CareerImage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, career_id, image_url, caption, position, is_replacement, source, \
             created_at FROM career_images WHERE career_id = ? ORDER BY position, id",
        )
        .bind(career_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<CareerImage, StoreError> {
                let source: String = row.try_get("source")?;
                Ok(CareerImage {
                    id: row.try_get("id")?,
                    career_id: row.try_get("career_id")?,
                    image_url: row.try_get("image_url")?,
                    caption: row.try_get("caption")?,
                    position: row.try_get("position")?,
                    is_replacement: row.try_get("is_replacement")?,
                    source: parse_column(career_id, &source)?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    pub async fn clear_images(
        &self,
        career_id: &str,
        source: Option<ImageSource>,
    ) -> Result<u64, StoreError> {
        let result = match source {
            Some(source) => {
                sqlx::query("DELETE FROM career_images WHERE career_id = ? AND source = ?")
                    .bind(career_id)
                    .bind(source.as_str())
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM career_images WHERE career_id = ?")
                    .bind(career_id)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }
}

fn ensure_transition(from: EnrichmentStatus, to: EnrichmentStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition { from, to })
    }
}

fn sort_by_bucket(careers: &mut [Career]) {
    careers.sort_by_cached_key(|c| {
        let (bucket, _) = pageview_bucket(c.pageview_daily_avg.unwrap_or(0.0));
        (bucket, c.name.to_lowercase(), c.id.clone())
    });
}

fn parse_column<T>(id: &str, raw: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = ParseEnumError>,
{
    raw.parse().map_err(|source| StoreError::CorruptRow {
        id: id.to_string(),
        source,
    })
}

fn career_from_row(row: &SqliteRow) -> Result<Career, StoreError> {
    let id: String = row.try_get("id")?;
    let category: String = row.try_get("category")?;
    let enrichment_status: String = row.try_get("enrichment_status")?;
    let review_status: String = row.try_get("review_status")?;
    Ok(Career {
        category: parse_column(&id, &category)?,
        enrichment_status: parse_column(&id, &enrichment_status)?,
        review_status: parse_column(&id, &review_status)?,
        name: row.try_get("name")?,
        source_url: row.try_get("source_url")?,
        resolved_title: row.try_get("resolved_title")?,
        pageview_total: row.try_get("pageview_total")?,
        pageview_daily_avg: row.try_get("pageview_daily_avg")?,
        pageview_days: row.try_get("pageview_days")?,
        pageviews_updated_at: row.try_get("pageviews_updated_at")?,
        enrichment_attempts: row.try_get("enrichment_attempts")?,
        last_error: row.try_get("last_error")?,
        reviewed_by: row.try_get("reviewed_by")?,
        reviewed_at: row.try_get("reviewed_at")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        id,
    })
}
