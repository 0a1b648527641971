//! Gemini vision extraction client.
//!
//! Sends one normalized report image plus a fixed clinical instruction to
//! the Gemini `generateContent` endpoint and parses the reply into a
//! [`ClinicalRecord`]. The client never propagates an error to its caller:
//! network failures, content-policy blocks, and unparseable replies all
//! come back as a record with the `error` field set (or, for shape
//! problems, as a degraded fallback record carrying the raw reply text).
//!
//! # Reply handling
//!
//! 1. Empty reply → error record, reason taken from the finish signal
//!    (safety block, recitation block, other block, or plain empty).
//! 2. A fenced code block is stripped if present; a block tagged `json`
//!    wins over an untagged one.
//! 3. Strict JSON parse. On failure the raw text becomes the summary and
//!    every structured field is empty; shape problems are never hard
//!    failures.
//! 4. On success each expected field is read with a default, so a
//!    partially-shaped reply never errors.
//!
//! # Model fallback
//!
//! If the configured model cannot serve a request (model-not-found), a
//! fixed list of fallbacks is tried in order. The name that actually
//! answered is cached for the life of the client and stamped into every
//! record as `model_used`.

use base64::Engine as _;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{Config, GEMINI_API_KEY_VAR};
use crate::models::{image_filename, ClinicalRecord, ImageBlob};
use crate::traits::Extractor;

const GEMINI_API: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Tried in order when the configured model cannot be initialized.
const FALLBACK_MODELS: &[&str] = &[
    "gemini-1.5-flash",
    "gemini-pro-vision",
    "gemini-1.0-pro-vision",
];

/// Fixed instruction sent with every image. Requests JSON-shaped output;
/// prescriptions must stay free of embedded disclaimer text because the
/// presentation layer shows the clinical disclaimer separately.
const CLINICAL_PROMPT: &str = r#"Analyze this medical image (lab report, X-ray, scan, or other clinical document) and provide a comprehensive analysis:

1. **Clinical Summary**: A detailed, complete description of all findings, observations, and clinical significance. Include ALL details from the report - do not truncate or summarize. Provide the full analysis.

2. **Key Measurements**: Extract any numerical values mentioned (e.g., blood pressure, heart rate, lab values, measurements, etc.) in the format:
   - Parameter: Value Unit (e.g., "BP: 120/80 mmHg", "Heart Rate: 72 bpm", "Hemoglobin: 12.5 g/dL")

3. **Abnormalities**: List any abnormalities, anomalies, or areas of concern found in the report.

4. **Prescriptions**: Based on the findings, suggest potential medications or treatments.
   IMPORTANT: DO NOT include any disclaimer text inside each prescription string.
   Just return clean items like: "Medication name - dosage - frequency - reason".
   The application UI will show the clinical disclaimer separately.
   Format as: ["Medication name - dosage - frequency - reason", ...]

5. **Exercise Recommendations**: Suggest appropriate exercises or physical activities if applicable based on the condition. If not applicable, state "No specific exercise recommendations based on this report."
   Format as: ["Exercise type - frequency - duration - notes", ...]

6. **Dietary Recommendations**: Provide nutritional and dietary suggestions based on the findings (e.g., foods to include, foods to avoid, dietary modifications).
   Format as: ["Food/Item to include/avoid - reason - frequency", ...]

7. **General Recommendations**: Any other clinical recommendations, follow-up suggestions, or lifestyle modifications.

Format your response as a JSON object with the following structure:
{
    "summary": "Complete, detailed clinical summary with ALL information - do not truncate",
    "measurements": {
        "parameter_name": "value unit"
    },
    "abnormalities": ["abnormality 1", "abnormality 2"],
    "prescriptions": ["prescription 1", "prescription 2"],
    "exercises": ["exercise 1", "exercise 2"],
    "dietary": ["dietary recommendation 1", "dietary recommendation 2"],
    "recommendations": ["recommendation 1", "recommendation 2"]
}

If the image is not a medical image or cannot be analyzed, return appropriate error information."#;

/// Gemini-backed [`Extractor`].
pub struct GeminiClient {
    api_key: String,
    configured_model: String,
    /// Model name that actually served a request, once known.
    resolved_model: Mutex<Option<String>>,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let api_key = std::env::var(GEMINI_API_KEY_VAR)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", GEMINI_API_KEY_VAR))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.gemini.timeout_secs))
            .build()?;
        info!(model = %config.gemini.model, "initializing Gemini client");
        Ok(Self {
            api_key,
            configured_model: config.gemini.model.clone(),
            resolved_model: Mutex::new(None),
            client,
        })
    }

    /// Candidate model names in try order: the resolved model if one is
    /// cached, otherwise the configured model followed by the fallbacks.
    fn candidate_models(&self) -> Vec<String> {
        if let Some(resolved) = self.resolved_model.lock().unwrap().clone() {
            return vec![resolved];
        }
        let mut models = vec![self.configured_model.clone()];
        for fb in FALLBACK_MODELS {
            if *fb != self.configured_model {
                models.push((*fb).to_string());
            }
        }
        models
    }

    /// Send the prompt + image, walking the fallback list on
    /// model-not-found. Returns the response body and the model that
    /// answered.
    async fn generate(&self, image: &ImageBlob) -> Result<(Value, String), String> {
        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": CLINICAL_PROMPT },
                    { "inline_data": {
                        "mime_type": "image/png",
                        "data": base64::engine::general_purpose::STANDARD.encode(&image.png),
                    }},
                ],
            }],
        });

        let mut first_error: Option<String> = None;

        for model in self.candidate_models() {
            let url = format!("{}/{}:generateContent", GEMINI_API, model);
            let resp = self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: Value = response
                            .json()
                            .await
                            .map_err(|e| format!("invalid Gemini response body: {}", e))?;
                        self.resolved_model.lock().unwrap().replace(model.clone());
                        return Ok((json, model));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let message = format!(
                        "Gemini API error {}: {}",
                        status,
                        body_text.chars().take(500).collect::<String>()
                    );

                    // Only an unknown model justifies trying the next name.
                    if status.as_u16() == 404 {
                        warn!(model, "model not available, trying fallback");
                        first_error.get_or_insert(message);
                        continue;
                    }
                    return Err(message);
                }
                Err(e) => return Err(format!("Gemini request failed: {}", e)),
            }
        }

        Err(format!(
            "Could not initialize any Gemini model. Original error: {}",
            first_error.unwrap_or_else(|| "no candidate models".to_string())
        ))
    }
}

#[async_trait::async_trait]
impl Extractor for GeminiClient {
    async fn extract(&self, image: &ImageBlob) -> ClinicalRecord {
        let (response, model) = match self.generate(image).await {
            Ok(ok) => ok,
            Err(e) => {
                error!(image = %image.path, error = %e, "extraction request failed");
                return error_record(image, &self.configured_model, &e);
            }
        };

        let (text, finish_reason) = reply_text(&response);
        if text.trim().is_empty() {
            let reason = classify_empty_reply(finish_reason.as_deref());
            error!(image = %image.path, %reason, "empty reply from model");
            return error_record(image, &model, &reason);
        }

        let parsed = parse_clinical_reply(text.trim());
        info!(image = %image.path, model, "generated clinical summary");

        ClinicalRecord {
            patient_name: String::new(), // stamped by the orchestrator
            image_name: image_filename(&image.path).to_string(),
            image_path: image.path.clone(),
            summary: parsed.summary,
            measurements: parsed.measurements,
            abnormalities: parsed.abnormalities,
            prescriptions: parsed.prescriptions,
            exercises: parsed.exercises,
            dietary: parsed.dietary,
            recommendations: parsed.recommendations,
            model_used: model,
            extracted_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}

/// Build the error-shaped record returned when extraction fails outright.
fn error_record(image: &ImageBlob, model: &str, err: &str) -> ClinicalRecord {
    ClinicalRecord {
        image_name: image_filename(&image.path).to_string(),
        image_path: image.path.clone(),
        summary: format!("Error analyzing image: {}", err),
        model_used: model.to_string(),
        extracted_at: Some(Utc::now()),
        error: Some(err.to_string()),
        ..Default::default()
    }
}

/// Concatenate the text parts of the first candidate, and surface its
/// finish signal (or the prompt-level block reason) for classification.
fn reply_text(response: &Value) -> (String, Option<String>) {
    let candidate = response
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());

    let text: String = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect()
        })
        .unwrap_or_default();

    let finish = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(|f| f.as_str())
        .map(str::to_string)
        .or_else(|| {
            response
                .get("promptFeedback")
                .and_then(|f| f.get("blockReason"))
                .and_then(|r| r.as_str())
                .map(str::to_string)
        });

    (text, finish)
}

/// Human-readable reason for an empty reply, by finish signal.
fn classify_empty_reply(finish_reason: Option<&str>) -> String {
    match finish_reason {
        Some("SAFETY") => "Content was blocked by safety filters".to_string(),
        Some("RECITATION") => "Content was blocked due to recitation".to_string(),
        Some(other) => format!("Response blocked with reason: {}", other),
        None => "Empty response from Gemini API".to_string(),
    }
}

/// Structured fields pulled from one model reply.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedReply {
    pub summary: String,
    pub measurements: BTreeMap<String, String>,
    pub abnormalities: Vec<String>,
    pub prescriptions: Vec<String>,
    pub exercises: Vec<String>,
    pub dietary: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Parse a (possibly fenced) model reply into structured fields.
///
/// Parse failure is not an error: the raw text becomes the summary and the
/// structured fields stay empty.
pub fn parse_clinical_reply(response_text: &str) -> ParsedReply {
    let unwrapped = strip_code_fence(response_text);

    let json: Value = match serde_json::from_str(unwrapped) {
        Ok(v) => v,
        Err(_) => {
            warn!("reply was not valid JSON, falling back to raw text summary");
            return ParsedReply {
                summary: unwrapped.to_string(),
                ..Default::default()
            };
        }
    };

    ParsedReply {
        summary: json
            .get("summary")
            .and_then(|s| s.as_str())
            .unwrap_or(unwrapped)
            .to_string(),
        measurements: string_map(json.get("measurements")),
        abnormalities: string_list(json.get("abnormalities")),
        prescriptions: string_list(json.get("prescriptions")),
        exercises: string_list(json.get("exercises")),
        dietary: string_list(json.get("dietary")),
        recommendations: string_list(json.get("recommendations")),
    }
}

/// Strip an enclosing fenced code block. A fence tagged `json` is
/// preferred; any fence is accepted; untagged text passes through.
fn strip_code_fence(text: &str) -> &str {
    if let Some(start) = text.find("```json") {
        let body_start = start + "```json".len();
        if let Some(end) = text[body_start..].find("```") {
            return text[body_start..body_start + end].trim();
        }
    } else if let Some(start) = text.find("```") {
        let body_start = start + "```".len();
        if let Some(end) = text[body_start..].find("```") {
            return text[body_start..body_start + end].trim();
        }
    }
    text
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect()
        })
        .unwrap_or_default()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().map(value_to_string).collect())
        .unwrap_or_default()
}

/// Render a JSON value as the display string the rest of the pipeline
/// treats as opaque. Strings lose their quotes; everything else keeps its
/// JSON form.
fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
