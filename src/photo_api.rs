use crate::config::ApiConfig;
use crate::identity::{CallerContext, Role};
use crate::ingestor::{DeleteError, IngestError, Ingestor, PhotoUpload, UploadMetadata};
use crate::record_store::{GalleryEntry, PhotoRecord, RecordStore};
use crate::retrieval_gate::{RetrievalError, RetrievalGate};
use crate::storage_backend::{content_type_for, LocalDiskBackend, StorageBackend, StorageError};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub store: Arc<dyn RecordStore>,
    pub gate: Arc<RetrievalGate>,
    /// Set when the local-disk backend is active; enables static serving
    /// of thumb/preview artifacts under the public prefix
    pub local_uploads: Option<Arc<LocalDiskBackend>>,
    pub api: ApiConfig,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: code.to_string(),
        }),
    )
}

fn validation_error(message: impl Into<String>) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
}

/// Preview locator response
#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub preview_locator: String,
}

/// Build the caller identity from the trusted auth-proxy headers.
fn caller_from_headers(headers: &HeaderMap) -> Result<CallerContext, ApiError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Missing or invalid identity",
            )
        })?;

    let slug = headers
        .get("x-user-slug")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Missing or invalid identity",
            )
        })?
        .to_string();

    let role = headers
        .get("x-user-role")
        .and_then(|v| v.to_str().ok())
        .map(Role::parse)
        .unwrap_or(Role::Photographer);

    Ok(CallerContext {
        user_id,
        slug,
        role,
    })
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let config = &state.api;

    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    // Sized for a full batch of maximum-size files plus form overhead
    let body_limit = config
        .max_file_size_bytes
        .saturating_mul(config.max_upload_files)
        .saturating_add(1024 * 1024);

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/photos", post(upload_photos).get(my_photos))
        .route("/api/v1/photos/:photo_id", delete(delete_photo))
        .route("/api/v1/photos/:photo_id/preview", get(get_preview))
        .route("/api/v1/photos/:photo_id/original", get(get_original))
        .route("/api/v1/gallery/:slug", get(public_gallery))
        .route("/api/v1/admin/photos", get(admin_photos));

    if state.local_uploads.is_some() {
        router = router.route("/uploads/:slug/:kind/:file", get(serve_public_artifact));
    }

    router
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "revelo-ingest"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "record_store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "record_store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Ingest a batch of photos for the authenticated photographer
#[instrument(skip(state, headers, multipart))]
async fn upload_photos(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<crate::ingestor::IngestOutcome>), ApiError> {
    let caller = caller_from_headers(&headers)?;

    let mut files = Vec::new();
    let mut metadata = UploadMetadata::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| validation_error(format!("Malformed multipart request: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "images" => {
                if files.len() >= state.api.max_upload_files {
                    return Err(validation_error(format!(
                        "Maximum {} files per upload",
                        state.api.max_upload_files
                    )));
                }
                let filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| validation_error(format!("Failed to read {filename}: {e}")))?;
                if bytes.len() > state.api.max_file_size_bytes {
                    return Err(validation_error(format!(
                        "{filename} exceeds the {} byte file size limit",
                        state.api.max_file_size_bytes
                    )));
                }
                files.push(PhotoUpload {
                    filename,
                    bytes: bytes.to_vec(),
                });
            }
            "title" => {
                metadata.title = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| validation_error(format!("Invalid title field: {e}")))?,
                );
            }
            "price" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| validation_error(format!("Invalid price field: {e}")))?;
                if !text.trim().is_empty() {
                    let price = text
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| validation_error("Price must be numeric"))?;
                    metadata.price = Some(price);
                }
            }
            "session_date" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| validation_error(format!("Invalid session date field: {e}")))?;
                if !text.trim().is_empty() {
                    metadata.session_date = Some(text);
                }
            }
            _ => {}
        }
    }

    let outcome = state
        .ingestor
        .ingest(&caller, files, metadata)
        .await
        .map_err(|e| match e {
            IngestError::Validation(message) => validation_error(message),
        })?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Public gallery listing for a photographer slug
#[instrument(skip(state))]
async fn public_gallery(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Vec<GalleryEntry>>, ApiError> {
    let entries = state.store.find_public_by_slug(&slug).await.map_err(|e| {
        error!(error = %e, "Failed to query public gallery");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "QUERY_ERROR",
            "Failed to query gallery",
        )
    })?;

    Ok(Json(entries))
}

/// Preview locator for one photo, resolved on demand
#[instrument(skip(state))]
async fn get_preview(
    State(state): State<AppState>,
    Path(photo_id): Path<Uuid>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let record = state.store.find_by_id(photo_id).await.map_err(|e| {
        error!(error = %e, "Failed to query photo");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "QUERY_ERROR",
            "Failed to query photo",
        )
    })?;

    match record {
        Some(record) => Ok(Json(PreviewResponse {
            preview_locator: record.preview_locator,
        })),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Photo not found",
        )),
    }
}

/// Stream the original artifact to an authorized caller
#[instrument(skip(state, headers))]
async fn get_original(
    State(state): State<AppState>,
    Path(photo_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_from_headers(&headers)?;

    let download = state
        .gate
        .original(photo_id, &caller)
        .await
        .map_err(|e| match e {
            RetrievalError::NotFound => {
                api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "Original not found")
            }
            RetrievalError::Forbidden => api_error(
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "Not authorized to access the original",
            ),
            RetrievalError::Traversal => api_error(
                StatusCode::BAD_REQUEST,
                "PATH_TRAVERSAL",
                "Stored locator is not resolvable",
            ),
            other => {
                error!(error = %other, "Failed to resolve original");
                api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORAGE_ERROR",
                    "Failed to resolve original",
                )
            }
        })?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, download.content_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", download.filename),
            ),
            (header::CACHE_CONTROL, "no-store".to_string()),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff".to_string()),
        ],
        download.bytes,
    ))
}

/// The authenticated photographer's own records
#[instrument(skip(state, headers))]
async fn my_photos(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<PhotoRecord>>, ApiError> {
    let caller = caller_from_headers(&headers)?;

    let records = state
        .store
        .find_by_owner(caller.user_id)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to query photos by owner");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "QUERY_ERROR",
                "Failed to query photos",
            )
        })?;

    Ok(Json(records))
}

/// Full inventory listing for administrators
#[instrument(skip(state, headers))]
async fn admin_photos(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<PhotoRecord>>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    if !caller.role.is_admin() {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "Administrator role required",
        ));
    }

    let records = state.store.find_all().await.map_err(|e| {
        error!(error = %e, "Failed to query inventory");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "QUERY_ERROR",
            "Failed to query inventory",
        )
    })?;

    Ok(Json(records))
}

/// Delete one photo and its artifacts
#[instrument(skip(state, headers))]
async fn delete_photo(
    State(state): State<AppState>,
    Path(photo_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers)?;

    state
        .ingestor
        .delete(photo_id, &caller)
        .await
        .map_err(|e| match e {
            DeleteError::NotFound => {
                api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "Photo not found")
            }
            DeleteError::Forbidden => api_error(
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "Not authorized to delete this photo",
            ),
            DeleteError::Store(e) => {
                error!(error = %e, "Failed to delete photo");
                api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "QUERY_ERROR",
                    "Failed to delete photo",
                )
            }
        })?;

    Ok(Json(serde_json::json!({ "deleted": photo_id })))
}

/// Static read-only serving of thumb/preview artifacts for the local
/// backend. Originals are never served from here.
#[instrument(skip(state))]
async fn serve_public_artifact(
    State(state): State<AppState>,
    Path((slug, kind, file)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    if kind == "original" {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "Originals are not served publicly",
        ));
    }
    if kind != "thumb" && kind != "preview" {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Unknown artifact kind",
        ));
    }

    let uploads = state.local_uploads.as_ref().ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Static serving is not enabled",
        )
    })?;

    let locator = format!("{}/{slug}/{kind}/{file}", uploads.public_prefix());
    let bytes = uploads.retrieve(&locator).await.map_err(|e| match e {
        StorageError::NotFound => {
            api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "Artifact not found")
        }
        StorageError::PathTraversal | StorageError::InvalidLocator => api_error(
            StatusCode::BAD_REQUEST,
            "PATH_TRAVERSAL",
            "Artifact path is not resolvable",
        ),
        other => {
            error!(error = %other, "Failed to read artifact");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
                "Failed to read artifact",
            )
        }
    })?;

    let extension = file.rsplit('.').next().unwrap_or_default();
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type_for(extension))],
        bytes,
    ))
}

/// Start the API server
pub async fn start_api_server(state: AppState) -> Result<()> {
    let addr = format!("{}:{}", state.api.host, state.api.port);
    let router = create_router(state);

    info!(address = %addr, "Starting photo API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router).await.context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(id: Option<&str>, slug: Option<&str>, role: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(id) = id {
            headers.insert("x-user-id", HeaderValue::from_str(id).unwrap());
        }
        if let Some(slug) = slug {
            headers.insert("x-user-slug", HeaderValue::from_str(slug).unwrap());
        }
        if let Some(role) = role {
            headers.insert("x-user-role", HeaderValue::from_str(role).unwrap());
        }
        headers
    }

    #[test]
    fn test_caller_from_headers() {
        let id = Uuid::new_v4();
        let caller = caller_from_headers(&headers(
            Some(&id.to_string()),
            Some("jorge"),
            Some("admin"),
        ))
        .unwrap();
        assert_eq!(caller.user_id, id);
        assert_eq!(caller.slug, "jorge");
        assert!(caller.role.is_admin());

        // Role defaults to photographer when the header is absent
        let caller =
            caller_from_headers(&headers(Some(&id.to_string()), Some("jorge"), None)).unwrap();
        assert!(!caller.role.is_admin());
    }

    #[test]
    fn test_caller_from_headers_rejects_missing_identity() {
        assert!(caller_from_headers(&headers(None, Some("jorge"), None)).is_err());
        assert!(caller_from_headers(&headers(Some("not-a-uuid"), Some("jorge"), None)).is_err());
        assert!(
            caller_from_headers(&headers(Some(&Uuid::new_v4().to_string()), None, None)).is_err()
        );
        assert!(caller_from_headers(&headers(
            Some(&Uuid::new_v4().to_string()),
            Some("   "),
            None
        ))
        .is_err());
    }
}
