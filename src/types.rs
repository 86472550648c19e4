use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrLine {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// One scored hypothesis for a field, grounded in a specific normalized line.
///
/// `line_text` equals the normalized line at `line_index` at generation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub value: String,
    pub line_index: usize,
    pub line_text: String,
    pub score: f64,
}

/// Ranked rule candidates per field, best-first, plus the normalized line
/// count. Built once by the aggregator and consumed read-only by both the
/// extraction request and the fallback merger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCandidateSet {
    pub merchant: Vec<Candidate>,
    pub date: Vec<Candidate>,
    pub total: Vec<Candidate>,
    pub currency: Vec<Candidate>,
    pub line_count: usize,
}

/// Validated model output. `extracted` is guaranteed to be a JSON object by
/// the response validator; `evidence` stays raw JSON (only well-formed
/// entries get normalized, nothing is ever fabricated); `extra` preserves any
/// other top-level keys so the stored `du_json` round-trips the model
/// payload.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub extracted: Map<String, Value>,
    pub evidence: Value,
    pub extra: Map<String, Value>,
}

impl ExtractionResult {
    /// Reassemble the full payload for storage as `du_json`.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("extracted".to_string(), Value::Object(self.extracted.clone()));
        map.insert("evidence".to_string(), self.evidence.clone());
        for (k, v) in &self.extra {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }
}

/// Flat record produced by one pipeline run, ready for upsert.
///
/// The four extracted scalars are dynamic JSON values: the model returns
/// `number|null` for total while rule fallback supplies strings, and the
/// store keeps whichever arrived.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiptRecord {
    pub source_sha: String,
    pub source_path: Option<String>,
    pub merchant: Value,
    pub receipt_date: Value,
    pub total_amount: Value,
    pub currency: Value,
    pub ocr_text: String,
    pub ocr_json: Value,
    pub du_json: Value,
    pub meta_json: Value,
}

/// Summary projection returned by `Db::list`.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiptSummary {
    pub id: i64,
    pub merchant: Value,
    pub receipt_date: Value,
    pub total_amount: Value,
    pub currency: Value,
}

/// Full stored row, including parsed JSON blobs.
#[derive(Debug, Clone, Serialize)]
pub struct StoredReceipt {
    pub id: i64,
    pub source_sha: String,
    pub source_path: Option<String>,
    pub merchant: Value,
    pub receipt_date: Value,
    pub total_amount: Value,
    pub currency: Value,
    pub ocr_text: Option<String>,
    pub ocr_json: Value,
    pub du_json: Value,
    pub meta_json: Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertResult {
    pub receipt_id: i64,
    pub outcome: UpsertOutcome,
}
