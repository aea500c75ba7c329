//! Catalog Media Service
//!
//! Product image management for the catalog backend. Image bytes live in an
//! object store under a per-product namespace; image metadata (ordering,
//! primary flag, alt text, dimensions) lives in PostgreSQL. The crate keeps
//! the two in step and keeps exactly one primary image per product.
//!
//! ## Features
//!
//! - **Primary Image Coordination**: Upload, reorder, re-designate and delete
//!   images while preserving the one-primary-per-product rule
//! - **Resilient Metadata Access**: A single supervised connection with
//!   handshake retries and transparent rebuild on topology loss
//! - **Object Storage**: S3 uploads (multipart for large images), overwrite
//!   with cache-busting URLs, namespace sweeps
//! - **Delivery URLs**: Path-embedded resize/quality/format transformations
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──────────────────────────┐
//!   API layer ────────▶│ PrimaryImageCoordinator  │
//!                      └──────────────────────────┘
//!                         │                    │
//!                         ▼                    ▼
//!               ┌──────────────────┐  ┌──────────────────┐
//!               │ RemoteAssetStore │  │ MetadataStore    │
//!               │ (S3)             │  │                  │
//!               └──────────────────┘  └──────────────────┘
//!                         │                    │ with_retry
//!                         ▼                    ▼
//!               ┌──────────────────┐  ┌──────────────────┐
//!               │ products/        │  │ Connection       │
//!               │   {product_id}/  │  │ Supervisor       │──▶ PostgreSQL
//!               └──────────────────┘  └──────────────────┘
//!                                              │
//!                                              ▼
//!                                     ┌──────────────────┐
//!                                     │ RetryExecutor    │
//!                                     └──────────────────┘
//! ```

pub mod asset_store;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod ids;
pub mod metadata_store;
pub mod retry;

pub use asset_store::{
    BulkDeleteReport, ImageTransform, MemoryAssetStore, RemoteAssetStore, S3AssetStore,
    StoredAsset, UploadRequest,
};
pub use config::Config;
pub use connection::{ConnectionSettings, ConnectionState, ConnectionSupervisor, Connector};
pub use coordinator::{
    BatchOutcome, BatchReport, DeleteOutcome, ImageUpload, PrimaryImageCoordinator,
    ProductTeardown,
};
pub use error::{AssetStoreError, ConnectionError, MetadataError, OrchestrationError, Side};
pub use ids::{ImageId, ProductId};
pub use metadata_store::{
    ImageAsset, ImagePatch, ImageQuery, MemoryBackend, MetadataBackend, MetadataStore,
    NewImageAsset, PgBackend,
};
pub use retry::{BackoffStrategy, RetryExecutor, RetryFailure, RetryPolicy};
