//! Google Cloud Storage image store.
//!
//! Lists and downloads per-patient report images using the GCS JSON API
//! (`storage/v1`) over plain HTTPS. Object keys follow the layout
//! `<patient>/<filename>`; the first path segment names the patient.
//!
//! # Authentication
//!
//! Requests carry an OAuth bearer token read from the `GOOGLE_ACCESS_TOKEN`
//! environment variable. Obtaining and refreshing the token is out of
//! scope (e.g. `gcloud auth print-access-token`).
//!
//! # Patient listing
//!
//! The delimiter-based listing (`delimiter=/` → `prefixes`) is treated as
//! an optimization only: some backends return partial prefix sets, so the
//! result is always merged with first-segment names computed from a full
//! key listing, which is authoritative.
//!
//! # Pagination
//!
//! Listings over 1000 objects are followed automatically via
//! `nextPageToken`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Config, GOOGLE_TOKEN_VAR, SUPPORTED_IMAGE_EXTENSIONS};
use crate::models::ImageBlob;
use crate::normalize;
use crate::traits::{DownloadError, ImageStore};

const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_API: &str = "https://storage.googleapis.com/upload/storage/v1";

/// GCS-backed [`ImageStore`].
pub struct GcsImageStore {
    bucket: String,
    max_size_bytes: u64,
    token: String,
    client: reqwest::Client,
}

/// One object entry from an `objects.list` page.
#[derive(Debug, Deserialize)]
struct GcsObject {
    name: String,
    /// GCS serializes sizes as decimal strings.
    #[serde(default)]
    size: Option<String>,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    #[serde(rename = "timeCreated")]
    time_created: Option<String>,
    updated: Option<String>,
}

impl GcsObject {
    fn size_bytes(&self) -> u64 {
        self.size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    prefixes: Vec<String>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

impl GcsImageStore {
    /// Build a store from configuration, reading the bearer token from the
    /// environment.
    pub fn new(config: &Config) -> Result<Self> {
        let token = std::env::var(GOOGLE_TOKEN_VAR)
            .with_context(|| format!("{} environment variable not set", GOOGLE_TOKEN_VAR))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        info!(bucket = %config.gcp.bucket, "initializing GCS image store");
        Ok(Self {
            bucket: config.gcp.bucket.clone(),
            max_size_bytes: config.max_image_size_bytes(),
            token,
            client,
        })
    }

    /// Existence probe for status display. Never errors; failures come
    /// back as `(false, reason)`.
    pub async fn test_connection(&self) -> (bool, String) {
        let url = format!("{}/b/{}", STORAGE_API, self.bucket);
        match self.client.get(&url).bearer_auth(&self.token).send().await {
            Ok(resp) if resp.status().is_success() => {
                (true, format!("Successfully connected to bucket: {}", self.bucket))
            }
            Ok(resp) if resp.status().as_u16() == 404 => (
                false,
                format!("Bucket '{}' not found. Please check the bucket name.", self.bucket),
            ),
            Ok(resp) => (false, format!("Error connecting to bucket: HTTP {}", resp.status())),
            Err(e) => (false, format!("Error connecting to bucket: {}", e)),
        }
    }

    /// List objects, following pagination. `delimiter=/` collapses keys at
    /// the first separator and reports `prefixes` instead.
    async fn list_objects(
        &self,
        prefix: Option<&str>,
        delimiter: bool,
    ) -> Result<(Vec<GcsObject>, Vec<String>)> {
        let mut objects = Vec::new();
        let mut prefixes = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = vec![("maxResults", "1000".to_string())];
            if let Some(p) = prefix {
                query.push(("prefix", p.to_string()));
            }
            if delimiter {
                query.push(("delimiter", "/".to_string()));
            }
            if let Some(ref token) = page_token {
                query.push(("pageToken", token.clone()));
            }

            let url = format!("{}/b/{}/o", STORAGE_API, self.bucket);
            let resp = self
                .client
                .get(&url)
                .query(&query)
                .bearer_auth(&self.token)
                .send()
                .await
                .with_context(|| format!("Failed to list objects in bucket {}", self.bucket))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "GCS objects.list failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let page: ListResponse = resp.json().await?;
            // Skip folder placeholder objects
            objects.extend(page.items.into_iter().filter(|o| !o.name.ends_with('/')));
            prefixes.extend(page.prefixes);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok((objects, prefixes))
    }

    /// Fetch one object's metadata record, or `None` on HTTP 404.
    async fn object_metadata(&self, image_path: &str) -> Result<Option<GcsObject>, String> {
        let url = format!("{}/b/{}/o/{}", STORAGE_API, self.bucket, uri_encode(image_path));
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        resp.json::<GcsObject>().await.map(Some).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ImageStore for GcsImageStore {
    async fn list_patients(&self) -> Result<Vec<String>> {
        let mut patients = BTreeSet::new();

        // Delimiter listing first (fast path), then the authoritative full
        // scan merged on top.
        let (_, prefixes) = self.list_objects(None, true).await?;
        for prefix in prefixes {
            let name = prefix.trim_end_matches('/');
            if !name.is_empty() {
                patients.insert(name.to_string());
            }
        }

        let (objects, _) = self.list_objects(None, false).await?;
        let keys: Vec<String> = objects.into_iter().map(|o| o.name).collect();
        patients.extend(patients_from_keys(&keys));

        let patients: Vec<String> = patients.into_iter().collect();
        info!(count = patients.len(), bucket = %self.bucket, "listed patient folders");
        Ok(patients)
    }

    async fn list_images(&self, patient: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", patient);
        let (objects, _) = self.list_objects(Some(&prefix), false).await?;

        let mut images: Vec<String> = objects
            .into_iter()
            .map(|o| o.name)
            .filter(|name| is_supported_image(name))
            .collect();
        images.sort();

        info!(patient, count = images.len(), "listed patient images");
        Ok(images)
    }

    async fn download_image(&self, image_path: &str) -> Result<ImageBlob, DownloadError> {
        let meta = self
            .object_metadata(image_path)
            .await
            .map_err(|reason| DownloadError::Transport {
                path: image_path.to_string(),
                reason,
            })?
            .ok_or_else(|| DownloadError::NotFound(image_path.to_string()))?;

        let stored_size = meta.size_bytes();
        if stored_size > self.max_size_bytes {
            return Err(DownloadError::TooLarge {
                path: image_path.to_string(),
                size_mb: stored_size as f64 / (1024.0 * 1024.0),
                limit_mb: self.max_size_bytes / (1024 * 1024),
            });
        }

        let url = format!(
            "{}/b/{}/o/{}?alt=media",
            STORAGE_API,
            self.bucket,
            uri_encode(image_path)
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| DownloadError::Transport {
                path: image_path.to_string(),
                reason: e.to_string(),
            })?;

        if resp.status().as_u16() == 404 {
            return Err(DownloadError::NotFound(image_path.to_string()));
        }
        if !resp.status().is_success() {
            return Err(DownloadError::Transport {
                path: image_path.to_string(),
                reason: format!("HTTP {}", resp.status()),
            });
        }

        let bytes = resp.bytes().await.map_err(|e| DownloadError::Transport {
            path: image_path.to_string(),
            reason: e.to_string(),
        })?;
        if bytes.is_empty() {
            return Err(DownloadError::Empty(image_path.to_string()));
        }

        let normalized =
            normalize::decode_and_normalize(&bytes).map_err(|reason| DownloadError::Decode {
                path: image_path.to_string(),
                reason,
            })?;

        debug!(
            path = image_path,
            width = normalized.width,
            height = normalized.height,
            "downloaded and normalized image"
        );

        Ok(ImageBlob {
            path: image_path.to_string(),
            png: normalized.png,
            width: normalized.width,
            height: normalized.height,
            stored_size,
            content_type: meta.content_type,
        })
    }

    async fn get_metadata(&self, image_path: &str) -> Result<serde_json::Value> {
        match self.object_metadata(image_path).await {
            Ok(Some(meta)) => Ok(serde_json::json!({
                "name": meta.name,
                "size": meta.size_bytes(),
                "content_type": meta.content_type,
                "time_created": meta.time_created,
                "updated": meta.updated,
            })),
            Ok(None) => bail!("object '{}' not found", image_path),
            Err(reason) => bail!("metadata request for '{}' failed: {}", image_path, reason),
        }
    }

    async fn upload_image(
        &self,
        patient: &str,
        filename: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String> {
        let patient = patient.trim();
        if patient.is_empty() {
            bail!("patient name cannot be empty when uploading an image");
        }

        let image_path = format!("{}/{}", patient, filename);
        let url = format!(
            "{}/b/{}/o?uploadType=media&name={}",
            UPLOAD_API,
            self.bucket,
            uri_encode(&image_path)
        );

        let mut req = self.client.post(&url).bearer_auth(&self.token).body(bytes);
        if let Some(ct) = content_type {
            req = req.header("Content-Type", ct);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("Failed to upload {} to bucket {}", image_path, self.bucket))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(path = %image_path, %status, "upload failed");
            bail!(
                "GCS upload failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }

        info!(patient, path = %image_path, "uploaded image");
        Ok(image_path)
    }
}

/// Derive patient names from full object keys: the first path segment of
/// every key with at least one folder level.
pub fn patients_from_keys(keys: &[String]) -> BTreeSet<String> {
    let mut patients = BTreeSet::new();
    for key in keys {
        let mut parts = key.splitn(2, '/');
        if let (Some(first), Some(_rest)) = (parts.next(), parts.next()) {
            if !first.is_empty() {
                patients.insert(first.to_string());
            }
        }
    }
    patients
}

/// Whether an object key carries a supported image extension.
pub fn is_supported_image(key: &str) -> bool {
    let lower = key.to_lowercase();
    SUPPORTED_IMAGE_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(ext))
}

/// Percent-encode an object key for use as a single URL path segment.
///
/// Everything outside the RFC 3986 unreserved set is encoded, including
/// `/`, which GCS requires escaped in `o/<object>` URLs.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}
