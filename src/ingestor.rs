use crate::config::IngestConfig;
use crate::derivative_generator::{extension_for, sniff_format, DerivativeGenerator};
use crate::identity::CallerContext;
use crate::record_store::{PhotoRecord, RecordStore};
use crate::storage_backend::{content_type_for, sanitize_path_component, StorageBackend};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// One uploaded file as received from the route layer.
pub struct PhotoUpload {
    /// Client-supplied filename, used only for error reporting
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Batch-level descriptive metadata shared by every file in the upload.
#[derive(Debug, Default)]
pub struct UploadMetadata {
    pub title: Option<String>,
    pub price: Option<f64>,
    /// Calendar date string (`YYYY-MM-DD`)
    pub session_date: Option<String>,
}

/// Failure report for one file in a batch.
#[derive(Debug, Serialize)]
pub struct FileFailure {
    pub filename: String,
    pub reason: String,
}

/// Result of one ingestion request: per-file successes and failures.
#[derive(Debug, Serialize)]
pub struct IngestOutcome {
    pub created: Vec<PhotoRecord>,
    pub failed: Vec<FileFailure>,
}

/// Request-level errors. Per-file failures never surface here; they are
/// collected into the outcome instead.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    Validation(String),
}

/// Errors from the explicit delete operation.
#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("photo not found")]
    NotFound,
    #[error("caller is not authorized to delete this photo")]
    Forbidden,
    #[error("failed to delete photo record: {0}")]
    Store(#[source] anyhow::Error),
}

/// Coordinates, per uploaded file, the original's persistence, derivative
/// generation, derivative persistence and inventory record creation.
pub struct Ingestor {
    storage: Arc<dyn StorageBackend>,
    store: Arc<dyn RecordStore>,
    generator: Arc<DerivativeGenerator>,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        store: Arc<dyn RecordStore>,
        generator: Arc<DerivativeGenerator>,
        config: IngestConfig,
    ) -> Self {
        Self {
            storage,
            store,
            generator,
            config,
        }
    }

    /// Ingest a batch of files for one owner.
    ///
    /// A failure while processing one file aborts that file only; the rest
    /// of the batch proceeds and the failure is reported in the outcome.
    /// Files already committed stay committed.
    #[instrument(skip(self, caller, files, metadata), fields(owner_slug = %caller.slug, file_count = files.len()))]
    pub async fn ingest(
        &self,
        caller: &CallerContext,
        files: Vec<PhotoUpload>,
        metadata: UploadMetadata,
    ) -> Result<IngestOutcome, IngestError> {
        if files.is_empty() {
            return Err(IngestError::Validation(
                "at least one image is required".to_string(),
            ));
        }

        let price = metadata.price.unwrap_or(0.0);
        if !price.is_finite() || price < 0.0 {
            return Err(IngestError::Validation(
                "price must be a non-negative number".to_string(),
            ));
        }

        let session_date = self.resolve_session_date(metadata.session_date.as_deref())?;
        let title = metadata.title.unwrap_or_default();
        let slug = sanitize_path_component(&caller.slug);

        // Process files concurrently. Filename stems are random per file,
        // so concurrent generation cannot collide within or across batches.
        let file_count = files.len();
        let slug = slug.as_str();
        let title = title.as_str();
        let results: Vec<(String, anyhow::Result<PhotoRecord>)> = stream::iter(files.into_iter())
            .map(|file| async move {
                self.process_file_labeled(caller, slug, &file, title, price, session_date)
                    .await
            })
            .buffered(self.config.upload_concurrency.max(1))
            .collect()
            .await;

        let mut created = Vec::with_capacity(file_count);
        let mut failed = Vec::new();

        for (filename, result) in results {
            match result {
                Ok(record) => {
                    metrics::counter!("ingest.photos.created").increment(1);
                    created.push(record);
                }
                Err(e) => {
                    warn!(
                        filename = %filename,
                        error = %format!("{e:#}"),
                        "File failed ingestion; continuing with remaining batch"
                    );
                    metrics::counter!("ingest.photos.failed").increment(1);
                    failed.push(FileFailure {
                        filename,
                        reason: format!("{e:#}"),
                    });
                }
            }
        }

        info!(
            created = created.len(),
            failed = failed.len(),
            "Ingestion batch finished"
        );

        Ok(IngestOutcome { created, failed })
    }

    /// Thin wrapper around `process_file` that pairs the result with the
    /// file's name. Extracted into a named async fn so its borrow lifetimes
    /// elaborate correctly inside the concurrent `buffered` stream.
    async fn process_file_labeled(
        &self,
        caller: &CallerContext,
        slug: &str,
        file: &PhotoUpload,
        title: &str,
        price: f64,
        session_date: DateTime<Utc>,
    ) -> (String, anyhow::Result<PhotoRecord>) {
        let result = self
            .process_file(caller, slug, file, title, price, session_date)
            .await;
        (file.filename.clone(), result)
    }

    /// Run the full pipeline for one file: original, derivatives, record.
    /// Artifacts written before a mid-pipeline failure are removed again
    /// best-effort so aborted files don't accumulate orphans.
    async fn process_file(
        &self,
        caller: &CallerContext,
        slug: &str,
        file: &PhotoUpload,
        title: &str,
        price: f64,
        session_date: DateTime<Utc>,
    ) -> anyhow::Result<PhotoRecord> {
        let format = sniff_format(&file.bytes).context("rejected upload")?;
        let ext = extension_for(format);
        let stem = Uuid::new_v4().simple().to_string();

        let mut written: Vec<String> = Vec::new();

        let original_locator = self
            .storage
            .put(
                &format!("{slug}/original/{stem}.{ext}"),
                &file.bytes,
                &content_type_for(ext),
            )
            .await
            .context("failed to persist original")?;
        written.push(original_locator.clone());

        let generator = self.generator.clone();
        let bytes = file.bytes.clone();
        let derivatives = match tokio::task::spawn_blocking(move || generator.generate(&bytes)).await
        {
            Ok(Ok(derivatives)) => derivatives,
            Ok(Err(e)) => {
                self.abort_cleanup(&written).await;
                return Err(e).context("derivative generation failed");
            }
            Err(e) => {
                self.abort_cleanup(&written).await;
                return Err(e).context("derivative worker panicked");
            }
        };

        let thumb_locator = match self
            .storage
            .put(
                &format!("{slug}/thumb/{stem}.jpg"),
                &derivatives.thumbnail,
                "image/jpeg",
            )
            .await
        {
            Ok(locator) => locator,
            Err(e) => {
                self.abort_cleanup(&written).await;
                return Err(e).context("failed to persist thumbnail");
            }
        };
        written.push(thumb_locator.clone());

        let preview_locator = match self
            .storage
            .put(
                &format!("{slug}/preview/{stem}.jpg"),
                &derivatives.preview,
                "image/jpeg",
            )
            .await
        {
            Ok(locator) => locator,
            Err(e) => {
                self.abort_cleanup(&written).await;
                return Err(e).context("failed to persist preview");
            }
        };
        written.push(preview_locator.clone());

        let record = PhotoRecord {
            id: Uuid::new_v4(),
            owner_id: caller.user_id,
            owner_slug: slug.to_string(),
            original_locator: Some(original_locator),
            thumb_locator,
            preview_locator,
            title: title.to_string(),
            price,
            session_date,
            is_public: true,
            created_at: Utc::now(),
        };

        match self.store.create(record).await {
            Ok(record) => Ok(record),
            Err(e) => {
                self.abort_cleanup(&written).await;
                Err(e).context("failed to persist photo record")
            }
        }
    }

    /// Compensating cleanup for an aborted file. Failures here only leave
    /// an orphan behind, so they are logged and swallowed.
    async fn abort_cleanup(&self, written: &[String]) {
        for locator in written {
            if let Err(e) = self.storage.delete(locator).await {
                warn!(
                    locator = %locator,
                    error = %e,
                    "Failed to clean up artifact of aborted file; orphan left behind"
                );
            }
        }
    }

    /// Normalize the session date to a fixed noon-UTC instant so a bare
    /// calendar date never shifts across timezone boundaries.
    fn resolve_session_date(&self, raw: Option<&str>) -> Result<DateTime<Utc>, IngestError> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => {
                let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
                    IngestError::Validation(format!(
                        "invalid session date {s:?}, expected YYYY-MM-DD"
                    ))
                })?;
                let noon = date.and_hms_opt(12, 0, 0).ok_or_else(|| {
                    IngestError::Validation(format!("invalid session date {s:?}"))
                })?;
                Ok(Utc.from_utc_datetime(&noon))
            }
            None if self.config.require_session_date => Err(IngestError::Validation(
                "session date is required".to_string(),
            )),
            None => Ok(Utc::now()),
        }
    }

    /// Destroy a record and its artifacts.
    ///
    /// Artifact removal is best-effort: missing artifacts count as removed
    /// and a denied removal only logs the orphaned locator. The record is
    /// always removed, so the public surface never shows a photo whose
    /// artifacts are gone.
    #[instrument(skip(self, caller), fields(photo_id = %photo_id))]
    pub async fn delete(&self, photo_id: Uuid, caller: &CallerContext) -> Result<(), DeleteError> {
        let record = self
            .store
            .find_by_id(photo_id)
            .await
            .map_err(DeleteError::Store)?
            .ok_or(DeleteError::NotFound)?;

        if !caller.can_access(record.owner_id) {
            return Err(DeleteError::Forbidden);
        }

        let locators = [
            Some(&record.thumb_locator),
            Some(&record.preview_locator),
            record.original_locator.as_ref(),
        ];
        for locator in locators.into_iter().flatten() {
            if let Err(e) = self.storage.delete(locator).await {
                warn!(
                    locator = %locator,
                    error = %e,
                    "Failed to delete artifact; orphan left behind"
                );
            }
        }

        self.store
            .delete(record.id)
            .await
            .map_err(DeleteError::Store)?;

        metrics::counter!("ingest.photos.deleted").increment(1);
        info!("Photo deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DerivativeConfig, LocalStorageConfig};
    use crate::derivative_generator::Watermark;
    use crate::identity::Role;
    use crate::record_store::InMemoryRecordStore;
    use crate::storage_backend::LocalDiskBackend;
    use image::codecs::jpeg::JpegEncoder;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, 90);
        encoder.encode_image(&img).unwrap();
        out
    }

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([10, 60, 120]));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn watermark() -> Watermark {
        let img = RgbaImage::from_pixel(32, 32, Rgba([255, 255, 255, 180]));
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        Watermark::from_bytes(&out).unwrap()
    }

    struct Harness {
        ingestor: Ingestor,
        _dir: TempDir,
        root: std::path::PathBuf,
        store: Arc<InMemoryRecordStore>,
    }

    fn harness(config: IngestConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let storage = Arc::new(LocalDiskBackend::new(&LocalStorageConfig {
            uploads_root: root.to_string_lossy().to_string(),
            public_prefix: "/uploads".to_string(),
        }));
        let store = Arc::new(InMemoryRecordStore::new());
        let generator = Arc::new(DerivativeGenerator::new(
            DerivativeConfig::default(),
            Some(watermark()),
        ));
        Harness {
            ingestor: Ingestor::new(storage, store.clone(), generator, config),
            _dir: dir,
            root,
            store,
        }
    }

    fn jorge() -> CallerContext {
        CallerContext {
            user_id: Uuid::new_v4(),
            slug: "jorge".to_string(),
            role: Role::Photographer,
        }
    }

    fn upload(filename: &str, bytes: Vec<u8>) -> PhotoUpload {
        PhotoUpload {
            filename: filename.to_string(),
            bytes,
        }
    }

    #[tokio::test]
    async fn test_single_upload_scenario() {
        let harness = harness(IngestConfig::default());
        let caller = jorge();

        let outcome = harness
            .ingestor
            .ingest(
                &caller,
                vec![upload("session.jpg", sample_jpeg(1200, 800))],
                UploadMetadata {
                    session_date: Some("2024-03-15".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.created.len(), 1);

        let record = &outcome.created[0];
        assert!(record.thumb_locator.starts_with("/uploads/jorge/thumb/"));
        assert!(record.preview_locator.starts_with("/uploads/jorge/preview/"));
        assert!(record
            .original_locator
            .as_ref()
            .unwrap()
            .starts_with("/uploads/jorge/original/"));
        assert_eq!(
            record.session_date,
            Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
        );
        assert!(record.is_public);
        assert_eq!(record.price, 0.0);
        assert_eq!(record.title, "");

        // All three artifacts are on disk
        for kind in ["original", "thumb", "preview"] {
            let dir = harness.root.join("jorge").join(kind);
            assert_eq!(std::fs::read_dir(dir).unwrap().count(), 1);
        }
    }

    #[tokio::test]
    async fn test_partial_batch_tolerance() {
        let harness = harness(IngestConfig::default());
        let caller = jorge();

        let outcome = harness
            .ingestor
            .ingest(
                &caller,
                vec![
                    upload("one.jpg", sample_jpeg(900, 600)),
                    upload("two.jpg", b"this is not an image at all".to_vec()),
                    upload("three.png", sample_png(640, 480)),
                ],
                UploadMetadata::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.created.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].filename, "two.jpg");

        for record in &outcome.created {
            assert!(harness
                .store
                .find_by_id(record.id)
                .await
                .unwrap()
                .is_some());
        }
    }

    #[tokio::test]
    async fn test_no_record_and_no_artifacts_for_aborted_file() {
        let harness = harness(IngestConfig::default());
        let caller = jorge();

        // Valid JPEG magic so the original gets persisted, then decoding
        // fails and the pipeline has to compensate.
        let mut truncated = sample_jpeg(800, 600);
        truncated.truncate(64);

        let outcome = harness
            .ingestor
            .ingest(
                &caller,
                vec![upload("broken.jpg", truncated)],
                UploadMetadata::default(),
            )
            .await
            .unwrap();

        assert!(outcome.created.is_empty());
        assert_eq!(outcome.failed.len(), 1);
        assert!(harness.store.find_all().await.unwrap().is_empty());

        let originals = harness.root.join("jorge/original");
        if originals.exists() {
            assert_eq!(std::fs::read_dir(originals).unwrap().count(), 0);
        }
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_validation_error() {
        let harness = harness(IngestConfig::default());
        let err = harness
            .ingestor
            .ingest(&jorge(), Vec::new(), UploadMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
    }

    #[tokio::test]
    async fn test_negative_price_is_a_validation_error() {
        let harness = harness(IngestConfig::default());
        let err = harness
            .ingestor
            .ingest(
                &jorge(),
                vec![upload("a.jpg", sample_jpeg(100, 100))],
                UploadMetadata {
                    price: Some(-5.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
    }

    #[tokio::test]
    async fn test_malformed_session_date_is_a_validation_error() {
        let harness = harness(IngestConfig::default());
        let err = harness
            .ingestor
            .ingest(
                &jorge(),
                vec![upload("a.jpg", sample_jpeg(100, 100))],
                UploadMetadata {
                    session_date: Some("15/03/2024".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
    }

    #[tokio::test]
    async fn test_session_date_policy_is_configurable() {
        let permissive = harness(IngestConfig {
            require_session_date: false,
            ..Default::default()
        });
        let outcome = permissive
            .ingestor
            .ingest(
                &jorge(),
                vec![upload("a.jpg", sample_jpeg(100, 100))],
                UploadMetadata::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.created.len(), 1);

        let strict = harness(IngestConfig {
            require_session_date: true,
            ..Default::default()
        });
        let err = strict
            .ingestor
            .ingest(
                &jorge(),
                vec![upload("a.jpg", sample_jpeg(100, 100))],
                UploadMetadata::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
    }

    #[tokio::test]
    async fn test_identical_files_get_distinct_locators() {
        let harness = harness(IngestConfig::default());
        let bytes = sample_jpeg(400, 300);

        let outcome = harness
            .ingestor
            .ingest(
                &jorge(),
                vec![upload("a.jpg", bytes.clone()), upload("b.jpg", bytes)],
                UploadMetadata::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.created.len(), 2);
        assert_ne!(
            outcome.created[0].thumb_locator,
            outcome.created[1].thumb_locator
        );
        assert_ne!(
            outcome.created[0].original_locator,
            outcome.created[1].original_locator
        );
    }

    #[tokio::test]
    async fn test_delete_succeeds_when_artifacts_already_gone() {
        let harness = harness(IngestConfig::default());
        let caller = jorge();

        let outcome = harness
            .ingestor
            .ingest(
                &caller,
                vec![upload("a.jpg", sample_jpeg(300, 200))],
                UploadMetadata::default(),
            )
            .await
            .unwrap();
        let record = &outcome.created[0];

        // Simulate manual removal out from under the pipeline
        std::fs::remove_dir_all(harness.root.join("jorge")).unwrap();

        harness.ingestor.delete(record.id, &caller).await.unwrap();
        assert!(harness
            .store
            .find_by_id(record.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_requires_owner_or_admin() {
        let harness = harness(IngestConfig::default());
        let owner = jorge();

        let outcome = harness
            .ingestor
            .ingest(
                &owner,
                vec![upload("a.jpg", sample_jpeg(300, 200))],
                UploadMetadata::default(),
            )
            .await
            .unwrap();
        let record = &outcome.created[0];

        let stranger = CallerContext {
            user_id: Uuid::new_v4(),
            slug: "maria".to_string(),
            role: Role::Photographer,
        };
        let err = harness
            .ingestor
            .delete(record.id, &stranger)
            .await
            .unwrap_err();
        assert!(matches!(err, DeleteError::Forbidden));

        let admin = CallerContext {
            user_id: Uuid::new_v4(),
            slug: "admin".to_string(),
            role: Role::Admin,
        };
        harness.ingestor.delete(record.id, &admin).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_missing_photo_is_not_found() {
        let harness = harness(IngestConfig::default());
        let err = harness
            .ingestor
            .delete(Uuid::new_v4(), &jorge())
            .await
            .unwrap_err();
        assert!(matches!(err, DeleteError::NotFound));
    }
}
