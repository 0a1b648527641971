use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Image file extensions accepted when listing a patient's folder.
pub const SUPPORTED_IMAGE_EXTENSIONS: &[&str] =
    &[".png", ".jpg", ".jpeg", ".gif", ".bmp", ".tiff", ".webp"];

/// Environment variable holding the Gemini API key.
pub const GEMINI_API_KEY_VAR: &str = "GEMINI_API_KEY";

/// Environment variable holding the OAuth bearer token for Google Cloud
/// Storage and Firestore. Token acquisition is out of scope; something like
/// `gcloud auth print-access-token` produces one.
pub const GOOGLE_TOKEN_VAR: &str = "GOOGLE_ACCESS_TOKEN";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub gcp: GcpConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GcpConfig {
    /// Google Cloud project identifier.
    #[serde(default)]
    pub project_id: String,
    /// GCS bucket holding `<patient>/<filename>` image objects.
    #[serde(default)]
    pub bucket: String,
    /// Firestore collection holding clinical records.
    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_collection() -> String {
    "clinical_summaries".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeminiConfig {
    /// Preferred model. When it cannot serve a request, the fallback list
    /// in [`crate::gemini`] is walked in order.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Largest stored image accepted for download, in megabytes.
    #[serde(default = "default_max_image_size_mb")]
    pub max_image_size_mb: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_image_size_mb: default_max_image_size_mb(),
        }
    }
}

fn default_max_image_size_mb() -> u64 {
    10
}

impl Config {
    /// Names of required settings that are missing or empty.
    ///
    /// The model name and the size limit carry defaults and are never
    /// reported here.
    pub fn missing_settings(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.gcp.project_id.trim().is_empty() {
            missing.push("gcp.project_id");
        }
        if self.gcp.bucket.trim().is_empty() {
            missing.push("gcp.bucket");
        }
        if std::env::var(GEMINI_API_KEY_VAR)
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
        {
            missing.push(GEMINI_API_KEY_VAR);
        }
        missing
    }

    pub fn max_image_size_bytes(&self) -> u64 {
        self.limits.max_image_size_mb * 1024 * 1024
    }
}

/// Load and validate configuration before any pipeline work begins.
///
/// Fails eagerly, naming every missing required setting rather than the
/// first one encountered.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    let missing = config.missing_settings();
    if !missing.is_empty() {
        anyhow::bail!("Missing required configuration: {}", missing.join(", "));
    }

    if config.limits.max_image_size_mb == 0 {
        anyhow::bail!("limits.max_image_size_mb must be > 0");
    }

    Ok(config)
}
