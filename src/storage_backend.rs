use crate::config::{LocalStorageConfig, S3Config};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client as S3Client;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to write artifact {path}: {message}")]
    Write { path: String, message: String },
    #[error("failed to delete artifact {locator}: {message}")]
    Delete { locator: String, message: String },
    #[error("failed to read artifact {locator}: {message}")]
    Read { locator: String, message: String },
    #[error("artifact not found")]
    NotFound,
    #[error("locator escapes the configured uploads root")]
    PathTraversal,
    #[error("locator is not addressable by the active storage backend")]
    InvalidLocator,
}

impl StorageError {
    fn write(path: &str, err: impl std::fmt::Display) -> Self {
        StorageError::Write {
            path: path.to_string(),
            message: err.to_string(),
        }
    }

    fn delete(locator: &str, err: impl std::fmt::Display) -> Self {
        StorageError::Delete {
            locator: locator.to_string(),
            message: err.to_string(),
        }
    }

    fn read(locator: &str, err: impl std::fmt::Display) -> Self {
        StorageError::Read {
            locator: locator.to_string(),
            message: err.to_string(),
        }
    }
}

/// Abstraction over "put bytes at a logical path" for artifact storage.
///
/// A logical path is `{owner_slug}/{artifact_kind}/{filename}`. The backend
/// returns a locator that public consumers (or the retrieval gate) can
/// dereference later: a site-relative URL path for the local backend, a
/// fully qualified public URL for the object-store backend. The active
/// backend is selected once at startup from configuration.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persist `bytes` under `logical_path` and return the public locator.
    async fn put(
        &self,
        logical_path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StorageError>;

    /// Remove the artifact behind `locator`. Deleting an artifact that is
    /// already gone succeeds.
    async fn delete(&self, locator: &str) -> Result<(), StorageError>;

    /// Whether an artifact currently exists behind `locator`.
    async fn exists(&self, locator: &str) -> Result<bool, StorageError>;

    /// Read the full artifact behind `locator`.
    async fn retrieve(&self, locator: &str) -> Result<Vec<u8>, StorageError>;
}

/// Local filesystem backend rooted at a configured uploads directory.
///
/// Writes go to a temp name first and are renamed into place, so a
/// truncated file is never reachable under its final locator.
pub struct LocalDiskBackend {
    root: PathBuf,
    public_prefix: String,
}

impl LocalDiskBackend {
    pub fn new(config: &LocalStorageConfig) -> Self {
        Self {
            root: PathBuf::from(&config.uploads_root),
            public_prefix: config.public_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Uploads root this backend serves from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Public URL prefix locators are issued under.
    pub fn public_prefix(&self) -> &str {
        &self.public_prefix
    }

    /// Map a public locator back to an absolute path under the uploads
    /// root, refusing anything that would escape it.
    fn resolve(&self, locator: &str) -> Result<PathBuf, StorageError> {
        let rel = locator
            .strip_prefix(&self.public_prefix)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or(StorageError::InvalidLocator)?;
        safe_join(&self.root, rel)
    }
}

#[async_trait]
impl StorageBackend for LocalDiskBackend {
    #[instrument(skip(self, bytes), fields(logical_path = %logical_path, size_bytes = bytes.len()))]
    async fn put(
        &self,
        logical_path: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let target = safe_join(&self.root, logical_path)?;
        let parent = target.parent().ok_or(StorageError::PathTraversal)?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::write(logical_path, e))?;

        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(StorageError::PathTraversal)?;
        let tmp = target.with_file_name(format!("{name}.part"));

        if let Err(e) = fs::write(&tmp, bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::write(logical_path, e));
        }
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::write(logical_path, e));
        }

        debug!(path = %target.display(), "Artifact written");
        Ok(format!("{}/{}", self.public_prefix, logical_path))
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        let path = self.resolve(locator)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(locator = %locator, "Artifact deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::delete(locator, e)),
        }
    }

    async fn exists(&self, locator: &str) -> Result<bool, StorageError> {
        let path = self.resolve(locator)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::read(locator, e))
    }

    async fn retrieve(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(locator)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(StorageError::read(locator, e)),
        }
    }
}

/// S3-compatible object-store backend.
///
/// Objects are uploaded with public-read accessibility and the locator is
/// the fully qualified public URL of the object.
pub struct S3Backend {
    client: S3Client,
    bucket: String,
    public_base: String,
}

impl S3Backend {
    /// Create a new S3 backend from configuration.
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = S3Client::from_conf(builder.build());

        let public_base = config
            .public_base_url
            .clone()
            .unwrap_or_else(|| {
                format!(
                    "https://{}.s3.{}.amazonaws.com",
                    config.bucket, config.region
                )
            })
            .trim_end_matches('/')
            .to_string();

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 storage backend initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            public_base,
        })
    }

    /// Map a public object URL back to its bucket key.
    fn key_from_locator(&self, locator: &str) -> Result<String, StorageError> {
        locator
            .strip_prefix(&self.public_base)
            .and_then(|k| k.strip_prefix('/'))
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .ok_or(StorageError::InvalidLocator)
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    #[instrument(skip(self, bytes), fields(logical_path = %logical_path, size_bytes = bytes.len()))]
    async fn put(
        &self,
        logical_path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(logical_path)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(content_type)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| StorageError::write(logical_path, e))?;

        debug!(key = %logical_path, "Artifact uploaded");
        Ok(format!("{}/{}", self.public_base, logical_path))
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        let key = self.key_from_locator(locator)?;

        // Remote deletes are best-effort; an object that is already gone
        // counts as deleted.
        if let Err(e) = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            warn!(locator = %locator, error = %e, "Best-effort S3 delete failed");
        }

        Ok(())
    }

    async fn exists(&self, locator: &str) -> Result<bool, StorageError> {
        let key = self.key_from_locator(locator)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StorageError::read(locator, e))
                }
            }
        }
    }

    async fn retrieve(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        let key = self.key_from_locator(locator)?;
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(StorageError::NotFound);
                }
                return Err(StorageError::read(locator, e));
            }
        };

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::read(locator, e))?;
        Ok(bytes.into_bytes().to_vec())
    }
}

/// Join a relative logical path onto a root, rejecting any component that
/// could climb out of it.
fn safe_join(root: &Path, relative: &str) -> Result<PathBuf, StorageError> {
    let mut joined = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                joined.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            _ => return Err(StorageError::PathTraversal),
        }
    }
    if depth == 0 {
        return Err(StorageError::PathTraversal);
    }
    Ok(joined)
}

/// Sanitize a path component to prevent path traversal
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Get content type for an artifact file extension
pub fn content_type_for(extension: &str) -> String {
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg".to_string(),
        "png" => "image/png".to_string(),
        "webp" => "image/webp".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}
