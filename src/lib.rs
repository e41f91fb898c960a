//! Revelo Ingestion Service
//!
//! Image-ingestion and derivative-generation pipeline for the Revelo
//! photo-sale marketplace. The service accepts batches of session photos
//! from authenticated photographers, deterministically produces three
//! durable artifacts per photo (original, thumbnail, watermark-protected
//! preview), persists their locations, and guarantees that public
//! consumers only ever reach the protected derivatives.
//!
//! ## Features
//!
//! - **Deterministic Derivatives**: Fixed resize filters and encode
//!   qualities, so identical inputs produce byte-identical thumbnails
//!   and previews
//! - **Watermark Protection**: Centered watermark compositing over a
//!   degraded preview, with a plain heavily-compressed fallback when
//!   compositing fails
//! - **Pluggable Storage**: One backend contract with local-disk and
//!   S3 implementations, selected by configuration
//! - **Gated Originals**: Originals are only reachable through an
//!   authenticated owner/admin path with traversal containment
//!
//! ## Architecture
//!
//! ```text
//! Upload Request              Storage Backend           Record Store
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ photos[] +   │           │ {slug}/      │          │ photos       │
//! │ metadata     │──────────▶│   original/  │          │              │
//! └──────────────┘           │   thumb/     │          └──────────────┘
//!        │                   │   preview/   │                 ▲
//!        │                   └──────────────┘                 │
//!        ▼                          ▲                         │
//! ┌──────────────┐                  │                         │
//! │ Ingestion    │                  │                         │
//! │ Orchestrator │──────────────────┼─────────────────────────┘
//! └──────────────┘                  │
//!        │                          │
//!        ▼                          │
//! ┌──────────────┐           ┌──────────────┐
//! │ Derivative   │           │ Retrieval    │
//! │ Generator    │           │ Gate         │
//! └──────────────┘           └──────────────┘
//! ```

pub mod config;
pub mod derivative_generator;
pub mod identity;
pub mod ingestor;
pub mod photo_api;
pub mod record_store;
pub mod retrieval_gate;
pub mod storage_backend;

pub use config::{BackendKind, Config};
pub use derivative_generator::{DerivativeGenerator, DerivativeSet, Watermark};
pub use identity::{CallerContext, Role};
pub use ingestor::{IngestOutcome, Ingestor, PhotoUpload, UploadMetadata};
pub use photo_api::{start_api_server, AppState};
pub use record_store::{
    GalleryEntry, InMemoryRecordStore, PhotoRecord, PostgresRecordStore, RecordStore,
};
pub use retrieval_gate::RetrievalGate;
pub use storage_backend::{LocalDiskBackend, S3Backend, StorageBackend, StorageError};
