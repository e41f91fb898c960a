use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::cmp::Reverse;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Durable mapping from a photo identity to its artifact locations and
/// descriptive metadata. Records are immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PhotoRecord {
    /// Unique photo ID, assigned at creation
    pub id: Uuid,
    /// Owning photographer
    pub owner_id: Uuid,
    /// Namespace-safe owner label partitioning storage paths
    pub owner_slug: String,
    /// Locator of the original artifact; absent on legacy records that
    /// predate original retention
    pub original_locator: Option<String>,
    /// Locator of the thumbnail artifact
    pub thumb_locator: String,
    /// Locator of the watermark-protected preview artifact
    pub preview_locator: String,
    /// Free-text title, may be empty
    pub title: String,
    /// Sale price, non-negative
    pub price: f64,
    /// Calendar date the session took place, normalized to noon UTC
    pub session_date: DateTime<Utc>,
    /// Whether the photo appears in the public gallery
    pub is_public: bool,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

/// Public gallery projection: the list view never exposes the preview or
/// original locators.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GalleryEntry {
    pub id: Uuid,
    pub thumb_locator: String,
    pub session_date: DateTime<Utc>,
}

impl From<&PhotoRecord> for GalleryEntry {
    fn from(record: &PhotoRecord) -> Self {
        Self {
            id: record.id,
            thumb_locator: record.thumb_locator.clone(),
            session_date: record.session_date,
        }
    }
}

/// Persistence contract for photo inventory records.
///
/// Listings are ordered by session date descending, then creation time
/// descending, with ties broken by insertion order.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create(&self, record: PhotoRecord) -> Result<PhotoRecord>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<PhotoRecord>>;
    async fn find_by_owner(&self, owner_id: Uuid) -> Result<Vec<PhotoRecord>>;
    async fn find_public_by_slug(&self, slug: &str) -> Result<Vec<GalleryEntry>>;
    async fn find_all(&self) -> Result<Vec<PhotoRecord>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    /// Connectivity probe for readiness checks
    async fn ping(&self) -> Result<()>;
}

const RECORD_COLUMNS: &str = "id, owner_id, owner_slug, original_locator, thumb_locator, \
     preview_locator, title, price, session_date, is_public, created_at";

/// PostgreSQL-backed record store.
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig, url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self, record), fields(photo_id = %record.id, owner_slug = %record.owner_slug))]
    async fn create(&self, record: PhotoRecord) -> Result<PhotoRecord> {
        sqlx::query(
            r#"
            INSERT INTO photos (
                id, owner_id, owner_slug, original_locator, thumb_locator,
                preview_locator, title, price, session_date, is_public, created_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10, $11
            )
            "#,
        )
        .bind(record.id)
        .bind(record.owner_id)
        .bind(&record.owner_slug)
        .bind(&record.original_locator)
        .bind(&record.thumb_locator)
        .bind(&record.preview_locator)
        .bind(&record.title)
        .bind(record.price)
        .bind(record.session_date)
        .bind(record.is_public)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert photo record")?;

        debug!(photo_id = %record.id, "Photo record created");
        Ok(record)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PhotoRecord>> {
        let record = sqlx::query_as::<_, PhotoRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM photos WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query photo record")?;

        Ok(record)
    }

    async fn find_by_owner(&self, owner_id: Uuid) -> Result<Vec<PhotoRecord>> {
        let records = sqlx::query_as::<_, PhotoRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM photos \
             WHERE owner_id = $1 \
             ORDER BY session_date DESC, created_at DESC, seq ASC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query photos by owner")?;

        Ok(records)
    }

    async fn find_public_by_slug(&self, slug: &str) -> Result<Vec<GalleryEntry>> {
        let entries = sqlx::query_as::<_, GalleryEntry>(
            "SELECT id, thumb_locator, session_date FROM photos \
             WHERE owner_slug = $1 AND is_public = TRUE \
             ORDER BY session_date DESC, created_at DESC, seq ASC",
        )
        .bind(slug)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query public gallery")?;

        Ok(entries)
    }

    async fn find_all(&self) -> Result<Vec<PhotoRecord>> {
        let records = sqlx::query_as::<_, PhotoRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM photos \
             ORDER BY session_date DESC, created_at DESC, seq ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to query all photos")?;

        Ok(records)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM photos WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete photo record")?;

        debug!(photo_id = %id, "Photo record deleted");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database not reachable")?;
        Ok(())
    }
}

/// In-memory record store for tests and single-node development
/// deployments that run without PostgreSQL.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<Vec<PhotoRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Stable sort keeps insertion order for ties.
fn sort_listing(records: &mut [PhotoRecord]) {
    records.sort_by_key(|r| (Reverse(r.session_date), Reverse(r.created_at)));
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create(&self, record: PhotoRecord) -> Result<PhotoRecord> {
        self.records.write().unwrap().push(record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PhotoRecord>> {
        Ok(self
            .records
            .read()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn find_by_owner(&self, owner_id: Uuid) -> Result<Vec<PhotoRecord>> {
        let mut records: Vec<_> = self
            .records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        sort_listing(&mut records);
        Ok(records)
    }

    async fn find_public_by_slug(&self, slug: &str) -> Result<Vec<GalleryEntry>> {
        let mut records: Vec<_> = self
            .records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.owner_slug == slug && r.is_public)
            .cloned()
            .collect();
        sort_listing(&mut records);
        Ok(records.iter().map(GalleryEntry::from).collect())
    }

    async fn find_all(&self) -> Result<Vec<PhotoRecord>> {
        let mut records = self.records.read().unwrap().clone();
        sort_listing(&mut records);
        Ok(records)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.records.write().unwrap().retain(|r| r.id != id);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
