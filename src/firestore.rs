//! Firestore record store.
//!
//! Persists one [`ClinicalRecord`] per (patient, image filename) pair in a
//! single collection, using the Firestore REST API (`v1`). The document id
//! is the deterministic natural key `<patient>_<filename>`, so re-scanning
//! an image overwrites its prior record: upsert, no versioning.
//!
//! Firestore's wire shape wraps every field in a typed value object
//! (`{"stringValue": ...}`, `{"arrayValue": {...}}`); the codec at the
//! bottom of this module translates between that and [`ClinicalRecord`].
//!
//! Timestamps are server-assigned: the client never writes `createTime` or
//! `updateTime`, it reads them back from the stored document. Per-patient
//! retrieval filters on the server but sorts newest-first on the client,
//! deliberately avoiding a composite index requirement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{Config, GOOGLE_TOKEN_VAR};
use crate::models::{image_filename, ClinicalRecord};
use crate::query::matches_measurement_query;
use crate::traits::{RecordStore, StoreError};

const FIRESTORE_API: &str = "https://firestore.googleapis.com/v1";

/// Page size for full-collection scans.
const SCAN_PAGE_SIZE: u32 = 300;

/// Firestore-backed [`RecordStore`].
pub struct FirestoreStore {
    project_id: String,
    collection: String,
    token: String,
    client: reqwest::Client,
}

impl FirestoreStore {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let token = std::env::var(GOOGLE_TOKEN_VAR).map_err(|_| {
            anyhow::anyhow!("{} environment variable not set", GOOGLE_TOKEN_VAR)
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        info!(collection = %config.gcp.collection, "initializing Firestore record store");
        Ok(Self {
            project_id: config.gcp.project_id.clone(),
            collection: config.gcp.collection.clone(),
            token,
            client,
        })
    }

    fn documents_base(&self) -> String {
        format!(
            "{}/projects/{}/databases/(default)/documents",
            FIRESTORE_API, self.project_id
        )
    }

    /// Existence probe for status display.
    pub async fn test_connection(&self) -> (bool, String) {
        let url = format!("{}/{}", self.documents_base(), self.collection);
        let resp = self
            .client
            .get(&url)
            .query(&[("pageSize", "1")])
            .bearer_auth(&self.token)
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => (
                true,
                format!("Successfully connected to collection: {}", self.collection),
            ),
            Ok(r) => (
                false,
                format!("Error connecting to collection: HTTP {}", r.status()),
            ),
            Err(e) => (false, format!("Error connecting to collection: {}", e)),
        }
    }

    /// Stream the whole collection, page by page, in store list order.
    async fn scan_all(&self) -> Result<Vec<ClinicalRecord>, StoreError> {
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let url = format!("{}/{}", self.documents_base(), self.collection);
            let mut query = vec![("pageSize", SCAN_PAGE_SIZE.to_string())];
            if let Some(ref token) = page_token {
                query.push(("pageToken", token.clone()));
            }

            let resp = self
                .client
                .get(&url)
                .query(&query)
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))?;

            if !resp.status().is_success() {
                return Err(StoreError::Transport(format!("HTTP {}", resp.status())));
            }

            let body: Value = resp
                .json()
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))?;

            if let Some(docs) = body.get("documents").and_then(|d| d.as_array()) {
                for doc in docs {
                    records.push(document_to_record(doc)?);
                }
            }

            match body.get("nextPageToken").and_then(|t| t.as_str()) {
                Some(token) => page_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl RecordStore for FirestoreStore {
    async fn save(&self, record: &ClinicalRecord) -> Result<String, StoreError> {
        let doc_id = record_doc_id(&record.patient_name, &record.image_path);
        let url = format!(
            "{}/{}/{}",
            self.documents_base(),
            self.collection,
            uri_encode(&doc_id)
        );

        let body = json!({ "fields": record_to_fields(record) });
        let resp = self
            .client
            .patch(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            warn!(doc_id, %status, "save failed");
            return Err(StoreError::Transport(format!(
                "save of '{}' failed (HTTP {}): {}",
                doc_id,
                status,
                text.chars().take(500).collect::<String>()
            )));
        }

        info!(
            patient = %record.patient_name,
            image = %record.image_name,
            doc_id,
            "saved clinical record"
        );
        Ok(doc_id)
    }

    async fn get_patient_records(&self, patient: &str) -> Result<Vec<ClinicalRecord>, StoreError> {
        // Server-side equality filter only; ordering happens here to keep
        // the store free of composite index requirements.
        let url = format!("{}:runQuery", self.documents_base());
        let body = json!({
            "structuredQuery": {
                "from": [{ "collectionId": self.collection }],
                "where": {
                    "fieldFilter": {
                        "field": { "fieldPath": "patient_name" },
                        "op": "EQUAL",
                        "value": { "stringValue": patient },
                    },
                },
            },
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(StoreError::Transport(format!("HTTP {}", resp.status())));
        }

        let rows: Vec<Value> = resp
            .json()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let mut records = Vec::new();
        for row in &rows {
            if let Some(doc) = row.get("document") {
                records.push(document_to_record(doc)?);
            }
        }

        sort_newest_first(&mut records);
        info!(patient, count = records.len(), "retrieved patient records");
        Ok(records)
    }

    async fn search_by_query(&self, query: &str) -> Result<Vec<ClinicalRecord>, StoreError> {
        let all = self.scan_all().await?;
        let query_lower = query.to_lowercase();

        let matching = all
            .into_iter()
            .filter(|rec| record_matches_query(rec, query, &query_lower))
            .collect();

        let unique = dedup_by_patient(matching);
        info!(query, matches = unique.len(), "search complete");
        Ok(unique)
    }

    async fn list_all_patients(&self) -> Result<Vec<String>, StoreError> {
        let all = self.scan_all().await?;
        let mut patients: Vec<String> = all
            .into_iter()
            .map(|r| r.patient_name)
            .filter(|p| !p.is_empty())
            .collect();
        patients.sort();
        patients.dedup();
        Ok(patients)
    }
}

/// Deterministic document id: `<patient>_<filename portion of the key>`.
pub fn record_doc_id(patient: &str, image_path: &str) -> String {
    format!("{}_{}", patient, image_filename(image_path))
}

/// Whether one record matches a free-text query: summary substring,
/// measurement comparator expression, or abnormality substring.
pub fn record_matches_query(record: &ClinicalRecord, query: &str, query_lower: &str) -> bool {
    if record.summary.to_lowercase().contains(query_lower) {
        return true;
    }
    if matches_measurement_query(query, &record.measurements) {
        return true;
    }
    record
        .abnormalities
        .iter()
        .any(|a| a.to_lowercase().contains(query_lower))
}

/// Keep the first record seen per patient, preserving iteration order.
pub fn dedup_by_patient(records: Vec<ClinicalRecord>) -> Vec<ClinicalRecord> {
    let mut seen = std::collections::HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.patient_name.clone()))
        .collect()
}

/// Sort records newest-first by creation time. The sort key is the parsed
/// timestamp when available, otherwise the raw string form.
pub fn sort_newest_first(records: &mut [ClinicalRecord]) {
    records.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));
}

fn sort_key(record: &ClinicalRecord) -> String {
    record
        .created_at
        .map(|t| t.to_rfc3339())
        .or_else(|| record.created_at_raw.clone())
        .unwrap_or_default()
}

// ============ Firestore value codec ============

/// Encode a record as Firestore document fields. Creation/update times are
/// never written; the server assigns them. A caller-supplied `error` field
/// is preserved.
pub fn record_to_fields(record: &ClinicalRecord) -> Value {
    let mut fields = serde_json::Map::new();
    fields.insert("patient_name".into(), fs_string(&record.patient_name));
    fields.insert("image_name".into(), fs_string(&record.image_name));
    fields.insert("image_path".into(), fs_string(&record.image_path));
    fields.insert("summary".into(), fs_string(&record.summary));
    fields.insert("measurements".into(), fs_string_map(&record.measurements));
    fields.insert("abnormalities".into(), fs_string_list(&record.abnormalities));
    fields.insert("prescriptions".into(), fs_string_list(&record.prescriptions));
    fields.insert("exercises".into(), fs_string_list(&record.exercises));
    fields.insert("dietary".into(), fs_string_list(&record.dietary));
    fields.insert(
        "recommendations".into(),
        fs_string_list(&record.recommendations),
    );
    fields.insert("model_used".into(), fs_string(&record.model_used));
    if let Some(ref meta) = record.image_metadata {
        fields.insert("image_metadata".into(), json_to_fs_value(meta));
    }
    if let Some(ref error) = record.error {
        fields.insert("error".into(), fs_string(error));
    }
    Value::Object(fields)
}

/// Decode a Firestore document into a record. Missing fields default to
/// empty; `createTime`/`updateTime` become the record's timestamps.
pub fn document_to_record(doc: &Value) -> Result<ClinicalRecord, StoreError> {
    let fields = doc
        .get("fields")
        .and_then(|f| f.as_object())
        .ok_or_else(|| StoreError::Shape("document has no fields".to_string()))?;

    let create_time = doc.get("createTime").and_then(|t| t.as_str());
    let (created_at, created_at_raw) = match create_time {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(dt) => (Some(dt.with_timezone(&Utc)), None),
            Err(_) => (None, Some(raw.to_string())),
        },
        None => (None, None),
    };
    let updated_at = doc
        .get("updateTime")
        .and_then(|t| t.as_str())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(ClinicalRecord {
        patient_name: read_string(fields, "patient_name"),
        image_name: read_string(fields, "image_name"),
        image_path: read_string(fields, "image_path"),
        summary: read_string(fields, "summary"),
        measurements: read_string_map(fields, "measurements"),
        abnormalities: read_string_list(fields, "abnormalities"),
        prescriptions: read_string_list(fields, "prescriptions"),
        exercises: read_string_list(fields, "exercises"),
        dietary: read_string_list(fields, "dietary"),
        recommendations: read_string_list(fields, "recommendations"),
        model_used: read_string(fields, "model_used"),
        extracted_at: None,
        created_at,
        updated_at,
        created_at_raw,
        image_metadata: fields.get("image_metadata").map(fs_value_to_json),
        error: match read_string(fields, "error") {
            s if s.is_empty() => None,
            s => Some(s),
        },
    })
}

fn fs_string(s: &str) -> Value {
    json!({ "stringValue": s })
}

fn fs_string_list(items: &[String]) -> Value {
    json!({
        "arrayValue": {
            "values": items.iter().map(|s| fs_string(s)).collect::<Vec<_>>(),
        },
    })
}

fn fs_string_map(map: &BTreeMap<String, String>) -> Value {
    let fields: serde_json::Map<String, Value> = map
        .iter()
        .map(|(k, v)| (k.clone(), fs_string(v)))
        .collect();
    json!({ "mapValue": { "fields": fields } })
}

/// Encode an arbitrary JSON value as a Firestore typed value.
fn json_to_fs_value(v: &Value) -> Value {
    match v {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                // Firestore serializes integers as strings
                json!({ "integerValue": i.to_string() })
            } else {
                json!({ "doubleValue": n.as_f64().unwrap_or(0.0) })
            }
        }
        Value::String(s) => fs_string(s),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(json_to_fs_value).collect::<Vec<_>>() },
        }),
        Value::Object(map) => {
            let fields: serde_json::Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_fs_value(v)))
                .collect();
            json!({ "mapValue": { "fields": fields } })
        }
    }
}

/// Decode a Firestore typed value back into plain JSON.
fn fs_value_to_json(v: &Value) -> Value {
    if let Some(s) = v.get("stringValue").and_then(|s| s.as_str()) {
        return Value::String(s.to_string());
    }
    if let Some(i) = v.get("integerValue").and_then(|s| s.as_str()) {
        if let Ok(n) = i.parse::<i64>() {
            return json!(n);
        }
        return Value::String(i.to_string());
    }
    if let Some(d) = v.get("doubleValue").and_then(|d| d.as_f64()) {
        return json!(d);
    }
    if let Some(b) = v.get("booleanValue").and_then(|b| b.as_bool()) {
        return Value::Bool(b);
    }
    if let Some(ts) = v.get("timestampValue").and_then(|t| t.as_str()) {
        return Value::String(ts.to_string());
    }
    if let Some(arr) = v
        .get("arrayValue")
        .and_then(|a| a.get("values"))
        .and_then(|vs| vs.as_array())
    {
        return Value::Array(arr.iter().map(fs_value_to_json).collect());
    }
    if let Some(fields) = v
        .get("mapValue")
        .and_then(|m| m.get("fields"))
        .and_then(|f| f.as_object())
    {
        return Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), fs_value_to_json(v)))
                .collect(),
        );
    }
    Value::Null
}

fn read_string(fields: &serde_json::Map<String, Value>, key: &str) -> String {
    fields
        .get(key)
        .and_then(|v| v.get("stringValue"))
        .and_then(|s| s.as_str())
        .unwrap_or_default()
        .to_string()
}

fn read_string_list(fields: &serde_json::Map<String, Value>, key: &str) -> Vec<String> {
    fields
        .get(key)
        .and_then(|v| v.get("arrayValue"))
        .and_then(|a| a.get("values"))
        .and_then(|vs| vs.as_array())
        .map(|vs| {
            vs.iter()
                .filter_map(|v| v.get("stringValue").and_then(|s| s.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn read_string_map(
    fields: &serde_json::Map<String, Value>,
    key: &str,
) -> BTreeMap<String, String> {
    fields
        .get(key)
        .and_then(|v| v.get("mapValue"))
        .and_then(|m| m.get("fields"))
        .and_then(|f| f.as_object())
        .map(|f| {
            f.iter()
                .filter_map(|(k, v)| {
                    v.get("stringValue")
                        .and_then(|s| s.as_str())
                        .map(|s| (k.clone(), s.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Percent-encode a document id for use as a URL path segment.
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_record() -> ClinicalRecord {
        ClinicalRecord {
            patient_name: "alice".into(),
            image_name: "report.png".into(),
            image_path: "alice/report.png".into(),
            summary: "Mild anemia noted.".into(),
            measurements: [("Hemoglobin".to_string(), "10.2 g/dL".to_string())]
                .into_iter()
                .collect(),
            abnormalities: vec!["Low hemoglobin".into()],
            prescriptions: vec!["Ferrous sulfate - 325mg - daily - iron deficiency".into()],
            exercises: vec![],
            dietary: vec!["Leafy greens - iron intake - daily".into()],
            recommendations: vec!["Repeat CBC in 3 months".into()],
            model_used: "gemini-2.5-flash".into(),
            image_metadata: Some(json!({"size": 2048, "content_type": "image/png"})),
            ..Default::default()
        }
    }

    #[test]
    fn doc_id_uses_filename_portion() {
        assert_eq!(record_doc_id("alice", "alice/report.png"), "alice_report.png");
        assert_eq!(record_doc_id("bob", "scan.jpg"), "bob_scan.jpg");
    }

    #[test]
    fn codec_round_trip() {
        let record = sample_record();
        let doc = json!({
            "name": "projects/p/databases/(default)/documents/c/alice_report.png",
            "fields": record_to_fields(&record),
            "createTime": "2026-08-20T10:00:00.123456Z",
            "updateTime": "2026-08-21T10:00:00.123456Z",
        });
        let decoded = document_to_record(&doc).unwrap();
        assert_eq!(decoded.patient_name, "alice");
        assert_eq!(decoded.image_name, "report.png");
        assert_eq!(decoded.measurements["Hemoglobin"], "10.2 g/dL");
        assert_eq!(decoded.abnormalities, record.abnormalities);
        assert_eq!(decoded.error, None);
        assert!(decoded.created_at.is_some());
        assert!(decoded.updated_at.is_some());
        assert_eq!(
            decoded.image_metadata.unwrap(),
            json!({"content_type": "image/png", "size": 2048})
        );
    }

    #[test]
    fn caller_supplied_error_preserved() {
        let mut record = sample_record();
        record.error = Some("quota exceeded".into());
        let fields = record_to_fields(&record);
        assert_eq!(fields["error"]["stringValue"], "quota exceeded");
    }

    #[test]
    fn missing_fields_decode_to_defaults() {
        let doc = json!({
            "fields": { "patient_name": { "stringValue": "bob" } },
        });
        let rec = document_to_record(&doc).unwrap();
        assert_eq!(rec.patient_name, "bob");
        assert!(rec.summary.is_empty());
        assert!(rec.measurements.is_empty());
        assert!(rec.created_at.is_none());
    }

    #[test]
    fn unparseable_create_time_kept_as_raw_sort_key() {
        let doc = json!({
            "fields": {},
            "createTime": "not-a-timestamp",
        });
        let rec = document_to_record(&doc).unwrap();
        assert!(rec.created_at.is_none());
        assert_eq!(rec.created_at_raw.as_deref(), Some("not-a-timestamp"));
    }

    #[test]
    fn sorting_is_newest_first_with_string_fallback() {
        let at = |s: u32| Utc.with_ymd_and_hms(2026, 8, 1, s, 0, 0).unwrap();
        let mut records = vec![
            ClinicalRecord {
                image_name: "old".into(),
                created_at: Some(at(1)),
                ..Default::default()
            },
            ClinicalRecord {
                image_name: "raw-only".into(),
                created_at_raw: Some("2026-08-01T05:30:00Z".into()),
                ..Default::default()
            },
            ClinicalRecord {
                image_name: "new".into(),
                created_at: Some(at(9)),
                ..Default::default()
            },
        ];
        sort_newest_first(&mut records);
        let names: Vec<_> = records.iter().map(|r| r.image_name.as_str()).collect();
        assert_eq!(names, vec!["new", "raw-only", "old"]);
    }

    #[test]
    fn query_matching_per_clause() {
        let record = sample_record();
        assert!(record_matches_query(&record, "anemia", "anemia"));
        assert!(record_matches_query(&record, "hemoglobin < 12", "hemoglobin < 12"));
        assert!(record_matches_query(&record, "low hemoglobin", "low hemoglobin"));
        assert!(!record_matches_query(&record, "fracture", "fracture"));
    }

    #[test]
    fn dedup_keeps_first_match_per_patient() {
        let mk = |patient: &str, image: &str| ClinicalRecord {
            patient_name: patient.into(),
            image_name: image.into(),
            ..Default::default()
        };
        let out = dedup_by_patient(vec![mk("a", "1"), mk("b", "2"), mk("a", "3")]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].image_name, "1");
        assert_eq!(out[1].image_name, "2");
    }
}
