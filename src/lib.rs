//! State-management core for Drift, a client for third-party
//! image-generation APIs: API-key rotation with rolling-window rate
//! limits, a durable image collection with blob-handle hydration, and the
//! generation/edit request flows over them.

pub mod api;
pub mod blob;
pub mod error;
pub mod favorites;
pub mod images;
pub mod keys;
pub mod models;
pub mod service;
pub mod storage;

pub use api::{
    Background, EditOptions, GenerationClient, GenerationOptions, GenerationResponse, Moderation,
    OutputFormat, SourceImage,
};
pub use blob::BlobRegistry;
pub use error::DriftError;
pub use favorites::FavoriteStore;
pub use images::{ImageStore, ImageView, QuotaFallback, StoredImage};
pub use keys::{ApiKey, KeyRing};
pub use service::{DriftService, Settings};
