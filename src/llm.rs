//! Model-based extraction.
//!
//! The request grounds the model in the same normalized lines the rule
//! candidates came from: the lines are the only valid citation space for
//! evidence. The call is a single blocking request with a fixed timeout,
//! no retry, no backoff; any failure is fatal for the receipt.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::ScanError;
use crate::types::{ExtractionResult, RuleCandidateSet};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const SYSTEM_PROMPT: &str = "You extract structured fields from receipt OCR.\n\
Return ONLY valid JSON matching the required schema.\n\
If a field is unknown, use null.\n\
Evidence MUST reference ocr_lines with a 0-based line_index and exact line_text.\n\
If you cannot find supporting evidence in ocr_lines, set that evidence entry to nulls.\n\
Return JSON only (no markdown).\n";

/// First `{...}` block in the raw output, dot matching newlines. Models wrap
/// JSON in prose often enough that the wrapper is tolerated and discarded.
static JSON_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("json block pattern"));

fn load_env() {
    let _ = dotenvy::dotenv();
}

/// Grounded extraction request payload: the full normalized line sequence,
/// the rule candidates, the required response schema, and the extraction
/// rules.
pub fn build_request(lines: &[String], candidates: &RuleCandidateSet) -> Result<Value, ScanError> {
    Ok(json!({
        "ocr_lines": lines,
        "rule_candidates": serde_json::to_value(candidates)?,
        "required_schema": {
            "extracted": {
                "merchant": "string|null",
                "date": "string|null",
                "total": "number|null",
                "currency": "string|null",
            },
            "evidence": {
                "merchant": {"line_index": "int|null", "line_text": "string|null"},
                "date": {"line_index": "int|null", "line_text": "string|null"},
                "total": {"line_index": "int|null", "line_text": "string|null"},
                "currency": {"line_index": "int|null", "line_text": "string|null"},
            },
        },
        "rules": [
            "Do not invent values that are not in ocr_lines.",
            "Prefer rule_candidates only when consistent with ocr_lines.",
            "Total must be the final payable amount (not cash tendered, not change due).",
        ],
    }))
}

/// Extract the first JSON object found in model output.
pub fn extract_json_block(text: &str) -> Result<Value, ScanError> {
    let m = JSON_BLOCK_RE.find(text).ok_or_else(|| ScanError::MalformedResponse {
        detail: "No JSON object found in model output.".to_string(),
    })?;
    serde_json::from_str(m.as_str())
        .map_err(|e| ScanError::MalformedResponse { detail: format!("Invalid JSON: {}", e) })
}

/// Enforce the minimal structural contract: a JSON object with an
/// `extracted` object inside it. Everything else rides along untouched.
pub fn validate_response(parsed: Value) -> Result<ExtractionResult, ScanError> {
    let Value::Object(mut map) = parsed else {
        return Err(ScanError::SchemaViolation {
            detail: "model returned non-object output".to_string(),
        });
    };
    let extracted = match map.remove("extracted") {
        Some(Value::Object(m)) => m,
        Some(_) => {
            return Err(ScanError::SchemaViolation {
                detail: "'extracted' is not an object".to_string(),
            })
        }
        None => {
            return Err(ScanError::SchemaViolation {
                detail: "model output missing 'extracted' object".to_string(),
            })
        }
    };
    let evidence = map.remove("evidence").unwrap_or_else(|| Value::Object(Map::new()));
    Ok(ExtractionResult { extracted, evidence, extra: map })
}

/// Null out any evidence citation whose `line_index` is out of range or
/// whose `line_text` does not match the normalized line it points at.
/// Entries that already carry nulls pass through; nothing is fabricated and
/// the response is never rejected for bad evidence.
pub fn normalize_evidence(evidence: &mut Value, lines: &[String]) {
    let Value::Object(map) = evidence else { return };
    for entry in map.values_mut() {
        let Value::Object(e) = entry else { continue };
        let idx = e.get("line_index").and_then(Value::as_u64);
        let text = e.get("line_text").and_then(Value::as_str);
        let cites_something = idx.is_some() || text.is_some();
        if !cites_something {
            continue;
        }
        let verified = match (idx, text) {
            (Some(i), Some(t)) => lines.get(i as usize).map(String::as_str) == Some(t),
            _ => false,
        };
        if !verified {
            e.insert("line_index".to_string(), Value::Null);
            e.insert("line_text".to_string(), Value::Null);
        }
    }
}

/// Client for the model service. Built once by the composition root.
pub struct LlmClient {
    base_url: String,
    model: String,
    client: Client,
}

impl LlmClient {
    /// OLLAMA_URL is read from env (.env); if empty, fallback to localhost.
    /// An absent model identifier is fatal for the extraction step.
    pub fn from_env() -> Result<Self, ScanError> {
        load_env();
        let base_url = std::env::var("OLLAMA_URL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let model = std::env::var("OLLAMA_MODEL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ScanError::ModelNotConfigured)?;
        Self::new(base_url, model)
    }

    pub fn new(base_url: String, model: String) -> Result<Self, ScanError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ScanError::ServiceUnreachable {
                url: base_url.clone(),
                detail: e.to_string(),
            })?;
        Ok(LlmClient { base_url, model, client })
    }

    fn chat(&self, user_payload: &Value) -> Result<String, ScanError> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": serde_json::to_string(user_payload)?},
            ],
            "options": {"temperature": 0.0},
            "stream": false,
        });

        let unreachable = |detail: String| ScanError::ServiceUnreachable {
            url: self.base_url.clone(),
            detail,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unreachable(format!("HTTP {}", status)));
        }

        let payload: Value = response
            .json()
            .map_err(|e| ScanError::MalformedResponse { detail: format!("Invalid JSON: {}", e) })?;
        payload
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ScanError::MalformedResponse {
                detail: "chat response has no message content".to_string(),
            })
    }

    /// Run model extraction against the normalized lines and rule
    /// candidates. Evidence citations are verified against the lines;
    /// invalid citations are nulled, never repaired.
    pub fn extract(
        &self,
        lines: &[String],
        candidates: &RuleCandidateSet,
    ) -> Result<ExtractionResult, ScanError> {
        let request = build_request(lines, candidates)?;
        let raw = self.chat(&request)?;
        debug!(raw = %raw.chars().take(500).collect::<String>(), "model output");

        let parsed = extract_json_block(&raw)?;
        let mut result = validate_response(parsed)?;
        normalize_evidence(&mut result.evidence, lines);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::build_rule_candidates;

    fn lines(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn request_carries_lines_candidates_schema_and_rules() {
        let ls = lines(&["STORE", "Total 12.00"]);
        let set = build_rule_candidates(&ls);
        let req = build_request(&ls, &set).expect("request");

        assert_eq!(req["ocr_lines"], json!(["STORE", "Total 12.00"]));
        assert_eq!(req["rule_candidates"]["line_count"], json!(2));
        assert_eq!(req["required_schema"]["extracted"]["total"], json!("number|null"));
        assert_eq!(req["rules"].as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn json_block_is_extracted_from_prose() {
        let raw = "Sure! Here is the result:\n{\"extracted\": {\"total\": 5}}\nLet me know.";
        let parsed = extract_json_block(raw).expect("parse");
        assert_eq!(parsed["extracted"]["total"], json!(5));
    }

    #[test]
    fn missing_json_is_malformed() {
        let err = extract_json_block("no json here").unwrap_err();
        assert!(matches!(err, ScanError::MalformedResponse { .. }));
    }

    #[test]
    fn unparseable_json_is_malformed() {
        let err = extract_json_block("{not valid json}").unwrap_err();
        assert!(matches!(err, ScanError::MalformedResponse { .. }));
    }

    #[test]
    fn missing_extracted_is_schema_violation() {
        let err = validate_response(json!({"evidence": {}})).unwrap_err();
        assert!(matches!(err, ScanError::SchemaViolation { .. }));

        let err = validate_response(json!({"extracted": [1, 2]})).unwrap_err();
        assert!(matches!(err, ScanError::SchemaViolation { .. }));

        let err = validate_response(json!(["not", "an", "object"])).unwrap_err();
        assert!(matches!(err, ScanError::SchemaViolation { .. }));
    }

    #[test]
    fn validator_keeps_unknown_keys_for_storage() {
        let result = validate_response(json!({
            "extracted": {"merchant": "STORE"},
            "evidence": {"merchant": {"line_index": 0, "line_text": "STORE"}},
            "model_notes": "kept verbatim"
        }))
        .expect("valid");
        let round_trip = result.to_json();
        assert_eq!(round_trip["model_notes"], json!("kept verbatim"));
        assert_eq!(round_trip["extracted"]["merchant"], json!("STORE"));
    }

    #[test]
    fn evidence_out_of_range_is_nulled() {
        let ls = lines(&["STORE", "Total 12.00"]);
        let mut evidence = json!({
            "total": {"line_index": 9, "line_text": "Total 12.00"}
        });
        normalize_evidence(&mut evidence, &ls);
        assert_eq!(evidence["total"]["line_index"], Value::Null);
        assert_eq!(evidence["total"]["line_text"], Value::Null);
    }

    #[test]
    fn evidence_text_mismatch_is_nulled() {
        let ls = lines(&["STORE", "Total 12.00"]);
        let mut evidence = json!({
            "total": {"line_index": 1, "line_text": "Total 99.00"}
        });
        normalize_evidence(&mut evidence, &ls);
        assert_eq!(evidence["total"]["line_index"], Value::Null);
    }

    #[test]
    fn valid_evidence_passes_through() {
        let ls = lines(&["STORE", "Total 12.00"]);
        let mut evidence = json!({
            "total": {"line_index": 1, "line_text": "Total 12.00"},
            "merchant": {"line_index": null, "line_text": null}
        });
        normalize_evidence(&mut evidence, &ls);
        assert_eq!(evidence["total"]["line_index"], json!(1));
        assert_eq!(evidence["total"]["line_text"], json!("Total 12.00"));
        assert_eq!(evidence["merchant"]["line_index"], Value::Null);
    }

    #[test]
    fn non_object_evidence_is_left_alone() {
        let ls = lines(&["STORE"]);
        let mut evidence = json!(["free-form", "payload"]);
        normalize_evidence(&mut evidence, &ls);
        assert_eq!(evidence, json!(["free-form", "payload"]));
    }

    #[test]
    fn dead_endpoint_is_service_unreachable() {
        let client = LlmClient::new("http://127.0.0.1:1".to_string(), "test-model".to_string())
            .expect("client");
        let ls = lines(&["STORE"]);
        let set = build_rule_candidates(&ls);
        let err = client.extract(&ls, &set).unwrap_err();
        assert!(matches!(err, ScanError::ServiceUnreachable { .. }));
    }
}
