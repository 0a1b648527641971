//! Adapter seams for the scan pipeline.
//!
//! The orchestrator in [`crate::scan`] drives three collaborators through
//! these traits: an image store, an extraction client, and a record store.
//! Production code plugs in [`crate::gcs::GcsImageStore`],
//! [`crate::gemini::GeminiClient`], and [`crate::firestore::FirestoreStore`];
//! tests plug in in-memory implementations.
//!
//! Adapter methods return typed results instead of suppressing failures
//! internally, so the orchestrator pattern-matches per-image outcomes and
//! keeps the failure-isolation contract explicit.

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ClinicalRecord, ImageBlob};

/// Why a single image download failed.
///
/// These are per-item, recoverable failures: the scan records them and
/// moves on to the next image.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("object '{0}' does not exist in bucket")]
    NotFound(String),
    #[error("image '{path}' exceeds size limit ({size_mb:.2}MB > {limit_mb}MB)")]
    TooLarge {
        path: String,
        size_mb: f64,
        limit_mb: u64,
    },
    #[error("downloaded empty data for '{0}'")]
    Empty(String),
    #[error("could not decode '{path}' as an image: {reason}")]
    Decode { path: String, reason: String },
    #[error("storage request for '{path}' failed: {reason}")]
    Transport { path: String, reason: String },
}

/// Record store failure. Covers both connectivity and malformed documents.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store request failed: {0}")]
    Transport(String),
    #[error("record store returned an unexpected document shape: {0}")]
    Shape(String),
}

/// Lists, downloads, and uploads per-patient report images.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// All patient names, derived from the first path segment of every
    /// stored object key.
    async fn list_patients(&self) -> Result<Vec<String>>;

    /// Object keys of this patient's images, lexicographically ordered and
    /// filtered to the supported extensions.
    async fn list_images(&self, patient: &str) -> Result<Vec<String>>;

    /// Download and normalize one image.
    async fn download_image(&self, image_path: &str) -> Result<ImageBlob, DownloadError>;

    /// Best-effort object metadata. Callers substitute an empty mapping on
    /// failure; metadata must never abort a scan.
    async fn get_metadata(&self, image_path: &str) -> Result<serde_json::Value>;

    /// Upload a new image under `<patient>/<filename>`, returning the
    /// composed object key. Fails when `patient` is empty after trimming.
    async fn upload_image(
        &self,
        patient: &str,
        filename: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String>;
}

/// Turns one image into a structured clinical record.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extraction never propagates an error: model, network, and parsing
    /// failures all come back as a record whose `error` field is set.
    async fn extract(&self, image: &ImageBlob) -> ClinicalRecord;
}

/// Persists and queries clinical records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upsert one record under the deterministic id
    /// `<patient>_<image filename>`, returning that id. Re-saving the same
    /// key overwrites; there is no versioning.
    async fn save(&self, record: &ClinicalRecord) -> Result<String, StoreError>;

    /// All records for one patient, newest first.
    async fn get_patient_records(&self, patient: &str) -> Result<Vec<ClinicalRecord>, StoreError>;

    /// Full-scan free-text/numeric search; at most one record per matching
    /// patient, keeping the first match in store iteration order.
    async fn search_by_query(&self, query: &str) -> Result<Vec<ClinicalRecord>, StoreError>;

    /// Every distinct patient name present in the store.
    async fn list_all_patients(&self) -> Result<Vec<String>, StoreError>;
}
